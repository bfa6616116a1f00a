use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use telemesh_attr::{Manifest, Vocabulary};
use telemesh_config_center::{ChangeType, ResourceKey, StoreEvent};
use telemesh_expr::Evaluator;
use telemesh_template::adapter::{AdapterRegistry, Env};
use telemesh_template::{attrgen, check, listentry, quota, report, TemplateId};

use crate::table::{Action, CompiledRule, HandlerEntry, InstanceRecipe, RoutingTable};

/// Resource kinds the planner subscribes to.
pub const KINDS: [&str; 4] = ["attributemanifest", "handler", "instance", "rule"];

const KIND_MANIFEST: &str = "attributemanifest";
const KIND_HANDLER: &str = "handler";
const KIND_INSTANCE: &str = "instance";
const KIND_RULE: &str = "rule";

#[derive(Clone, Debug, Deserialize)]
struct HandlerSpec {
    adapter: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize)]
struct InstanceSpec {
    template: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Clone, Debug, Deserialize)]
struct RuleSpec {
    #[serde(default, rename = "match")]
    match_expr: String,
    #[serde(default)]
    actions: Vec<ActionSpec>,
}

#[derive(Clone, Debug, Deserialize)]
struct ActionSpec {
    handler: String,
    #[serde(default)]
    instances: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// How long a handler dropped from the table keeps serving in-flight
    /// requests before `close` is invoked.
    pub drain_grace: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Consumes config events and republishes the routing table. The planner is
/// the single writer: events are processed serially, readers only ever touch
/// the atomically swapped table pointer.
pub struct Planner {
    evaluator: Arc<Evaluator>,
    adapters: Arc<AdapterRegistry>,
    table: Arc<ArcSwap<RoutingTable>>,
    state: Mutex<PlannerState>,
    config: PlannerConfig,
}

#[derive(Clone)]
struct PlannerState {
    resources: BTreeMap<ResourceKey, serde_json::Value>,
    vocabulary: Arc<Vocabulary>,
    manifest_fingerprint: u64,
    built: HashMap<String, BuiltHandler>,
    generation: u64,
}

#[derive(Clone)]
struct BuiltHandler {
    fingerprint: u64,
    entry: Arc<HandlerEntry>,
}

impl Planner {
    pub fn new(
        evaluator: Arc<Evaluator>,
        adapters: Arc<AdapterRegistry>,
        config: PlannerConfig,
    ) -> Self {
        let vocabulary = evaluator.vocabulary();
        let table = Arc::new(ArcSwap::from_pointee(RoutingTable::empty(Arc::clone(
            &vocabulary,
        ))));
        Self {
            evaluator,
            adapters,
            table,
            state: Mutex::new(PlannerState {
                resources: BTreeMap::new(),
                vocabulary,
                manifest_fingerprint: 0,
                built: HashMap::new(),
                generation: 0,
            }),
            config,
        }
    }

    /// The shared pointer the dispatcher loads per request.
    pub fn table_handle(&self) -> Arc<ArcSwap<RoutingTable>> {
        Arc::clone(&self.table)
    }

    /// Event-consumption loop. Bursts are drained into one batch so a
    /// multi-document config change produces a single republish.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<StoreEvent>) {
        while let Some(event) = events.recv().await {
            let mut batch = vec![event];
            while let Ok(more) = events.try_recv() {
                batch.push(more);
            }
            self.apply(batch).await;
        }
    }

    /// Applies one event batch and attempts a rebuild. A batch that fails
    /// validation leaves the published table untouched.
    pub async fn apply(&self, events: Vec<StoreEvent>) {
        {
            let mut state = self.state.lock();
            for event in events {
                match event.change {
                    ChangeType::Update => {
                        state
                            .resources
                            .insert(event.key, event.spec.unwrap_or(serde_json::Value::Null));
                    }
                    ChangeType::Delete => {
                        state.resources.remove(&event.key);
                    }
                }
            }
        }
        let snapshot = self.state.lock().clone();
        match self.rebuild(snapshot).await {
            Ok(next) => {
                let generation = next.generation;
                let vocabulary = Arc::clone(&next.state.vocabulary);
                let dropped: Vec<Arc<HandlerEntry>> = {
                    let mut state = self.state.lock();
                    let dropped = state
                        .built
                        .iter()
                        .filter(|(name, built)| {
                            next.built
                                .get(*name)
                                .map(|b| b.fingerprint != built.fingerprint)
                                .unwrap_or(true)
                        })
                        .map(|(_, built)| Arc::clone(&built.entry))
                        .collect();
                    *state = next.state;
                    state.built = next.built;
                    state.generation = generation;
                    dropped
                };
                // the vocabulary and the table compiled against it publish
                // together; same instance twice is a no-op
                self.evaluator.change_vocabulary(vocabulary);
                self.table.store(Arc::new(next.table));
                info!(generation, "routing table published");
                self.schedule_close(dropped);
            }
            Err(reason) => {
                warn!("config batch rejected, keeping previous table: {reason}");
            }
        }
    }

    fn schedule_close(&self, dropped: Vec<Arc<HandlerEntry>>) {
        if dropped.is_empty() {
            return;
        }
        let grace = self.config.drain_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for entry in dropped {
                if let Err(err) = entry.handler.close().await {
                    warn!(handler = %entry.name, "close failed: {err}");
                }
            }
        });
    }

    async fn rebuild(&self, mut state: PlannerState) -> Result<Rebuilt, String> {
        // 1. vocabulary, staged: the evaluator is only switched once the
        // whole batch has validated, so a rejected batch cannot strand the
        // kept table's programs on a retired generation
        let mut manifests: BTreeMap<ResourceKey, Manifest> = BTreeMap::new();
        for (key, spec) in resources_of_kind(&state.resources, KIND_MANIFEST) {
            let manifest: Manifest = serde_json::from_value(spec.clone())
                .map_err(|err| format!("manifest {key}: {err}"))?;
            manifests.insert(key.clone(), manifest);
        }
        let fingerprint = fingerprint_manifests(&manifests);
        if fingerprint != state.manifest_fingerprint {
            let vocabulary = Arc::new(
                Vocabulary::from_manifests(manifests.values())
                    .map_err(|err| format!("vocabulary: {err}"))?,
            );
            state.vocabulary = vocabulary;
            state.manifest_fingerprint = fingerprint;
        }
        let vocabulary = Arc::clone(&state.vocabulary);

        // 2. instances: parse and re-infer against the candidate vocabulary
        let evaluator = Arc::clone(&self.evaluator);
        let type_of = |expression: &str| evaluator.eval_type_for(expression, &vocabulary);
        let mut instances: BTreeMap<ResourceKey, ValidatedInstance> = BTreeMap::new();
        for (key, spec) in resources_of_kind(&state.resources, KIND_INSTANCE) {
            let spec: InstanceSpec = serde_json::from_value(spec.clone())
                .map_err(|err| format!("instance {key}: {err}"))?;
            let template = TemplateId::from_name(&spec.template)
                .ok_or_else(|| format!("instance {key}: unknown template '{}'", spec.template))?;
            let typed = validate_instance(template, &spec.params, &type_of)
                .map_err(|err| format!("instance {key}: {err}"))?;
            instances.insert(
                key.clone(),
                ValidatedInstance {
                    key: key.clone(),
                    raw_params: spec.params,
                    typed,
                },
            );
        }

        // 3. handler specs
        let mut handler_specs: BTreeMap<ResourceKey, HandlerSpec> = BTreeMap::new();
        for (key, spec) in resources_of_kind(&state.resources, KIND_HANDLER) {
            let spec: HandlerSpec = serde_json::from_value(spec.clone())
                .map_err(|err| format!("handler {key}: {err}"))?;
            handler_specs.insert(key.clone(), spec);
        }

        // 4. rules, resolved against instances and handlers
        let mut resolved_rules: Vec<ResolvedRule> = Vec::new();
        for (key, spec) in resources_of_kind(&state.resources, KIND_RULE) {
            let spec: RuleSpec = serde_json::from_value(spec.clone())
                .map_err(|err| format!("rule {key}: {err}"))?;
            let mut actions = Vec::new();
            for action in &spec.actions {
                let handler_key = resolve_reference(
                    &handler_specs,
                    &key.namespace,
                    KIND_HANDLER,
                    &action.handler,
                )
                .ok_or_else(|| format!("rule {key}: unknown handler '{}'", action.handler))?;
                let mut action_instances = Vec::new();
                for reference in &action.instances {
                    let instance_key =
                        resolve_reference(&instances, &key.namespace, KIND_INSTANCE, reference)
                            .ok_or_else(|| {
                                format!("rule {key}: unknown instance '{reference}'")
                            })?;
                    action_instances.push(instance_key);
                }
                actions.push((handler_key, action_instances));
            }
            resolved_rules.push(ResolvedRule {
                key: key.clone(),
                match_expr: spec.match_expr,
                actions,
            });
        }

        // 5. build or reuse the referenced handlers
        let mut built: HashMap<String, BuiltHandler> = HashMap::new();
        let mut referenced: BTreeMap<ResourceKey, Vec<ResourceKey>> = BTreeMap::new();
        for rule in &resolved_rules {
            for (handler_key, instance_keys) in &rule.actions {
                referenced
                    .entry(handler_key.clone())
                    .or_default()
                    .extend(instance_keys.iter().cloned());
            }
        }
        for (handler_key, mut instance_keys) in referenced {
            instance_keys.sort();
            instance_keys.dedup();
            let spec = &handler_specs[&handler_key];
            let fingerprint = fingerprint_handler(
                spec,
                vocabulary.id(),
                instance_keys.iter().map(|k| &instances[k]),
            );
            let name = handler_key.to_string();
            if let Some(previous) = state.built.get(&name) {
                if previous.fingerprint == fingerprint {
                    built.insert(name, previous.clone());
                    continue;
                }
            }
            let entry = self
                .build_handler(&handler_key, spec, instance_keys.iter().map(|k| &instances[k]))
                .await?;
            built.insert(
                name,
                BuiltHandler {
                    fingerprint,
                    entry: Arc::new(entry),
                },
            );
        }

        // 6. compile rules into the table, ordered by (namespace, name)
        let mut compiled_rules = Vec::with_capacity(resolved_rules.len());
        let mut table_handlers = HashMap::new();
        for rule in resolved_rules {
            let predicate = if rule.match_expr.trim().is_empty() {
                None
            } else {
                let program = self
                    .evaluator
                    .compile_for(&rule.match_expr, &vocabulary)
                    .map_err(|err| format!("rule {}: {err}", rule.key))?;
                if program.result_type != telemesh_attr::ValueType::Bool {
                    return Err(format!(
                        "rule {}: match expression must be boolean, got {}",
                        rule.key, program.result_type
                    ));
                }
                Some(program)
            };
            let mut actions = Vec::new();
            for (handler_key, instance_keys) in rule.actions {
                let entry = Arc::clone(&built[&handler_key.to_string()].entry);
                table_handlers.insert(entry.name.clone(), Arc::clone(&entry));
                let mut recipes = Vec::new();
                for instance_key in instance_keys {
                    let instance = &instances[&instance_key];
                    let recipe = self
                        .compile_instance(instance, &vocabulary)
                        .map_err(|err| format!("instance {instance_key}: {err}"))?;
                    recipes.push(recipe);
                }
                actions.push(Action {
                    handler: entry,
                    instances: recipes,
                });
            }
            compiled_rules.push(CompiledRule {
                key: rule.key,
                predicate,
                actions,
            });
        }
        compiled_rules.sort_by(|a, b| {
            (&a.key.namespace, &a.key.name).cmp(&(&b.key.namespace, &b.key.name))
        });

        let generation = state.generation + 1;
        let table = RoutingTable {
            generation,
            rules: compiled_rules,
            handlers: table_handlers,
            vocabulary: Arc::clone(&vocabulary),
        };
        Ok(Rebuilt {
            table,
            built,
            generation,
            state,
        })
    }

    async fn build_handler<'a>(
        &self,
        key: &ResourceKey,
        spec: &HandlerSpec,
        instances: impl Iterator<Item = &'a ValidatedInstance>,
    ) -> Result<HandlerEntry, String> {
        let info = self
            .adapters
            .get(&spec.adapter)
            .ok_or_else(|| format!("handler {key}: unknown adapter '{}'", spec.adapter))?;

        let mut report_types = HashMap::new();
        let mut check_types = HashMap::new();
        let mut list_entry_types = HashMap::new();
        let mut quota_types = HashMap::new();
        let mut attr_gen_types = HashMap::new();
        let mut needed: Vec<TemplateId> = Vec::new();
        for instance in instances {
            let name = instance.key.to_string();
            match &instance.typed {
                TypedInstance::Report { ty, .. } => {
                    report_types.insert(name, ty.clone());
                    needed.push(TemplateId::Report);
                }
                TypedInstance::Check { ty, .. } => {
                    check_types.insert(name, ty.clone());
                    needed.push(TemplateId::Check);
                }
                TypedInstance::ListEntry { ty, .. } => {
                    list_entry_types.insert(name, ty.clone());
                    needed.push(TemplateId::ListEntry);
                }
                TypedInstance::Quota { ty, .. } => {
                    quota_types.insert(name, ty.clone());
                    needed.push(TemplateId::Quota);
                }
                TypedInstance::AttrGen { ty, .. } => {
                    attr_gen_types.insert(name, ty.clone());
                    needed.push(TemplateId::AttrGen);
                }
            }
        }
        needed.sort_by_key(|t| t.name());
        needed.dedup();
        for template in &needed {
            if !info.supports(*template) {
                return Err(format!(
                    "handler {key}: adapter '{}' does not support template '{template}'",
                    spec.adapter
                ));
            }
        }

        let mut builder = (info.new_builder)();
        if !report_types.is_empty() {
            builder.set_report_types(report_types);
        }
        if !check_types.is_empty() {
            builder.set_check_types(check_types);
        }
        if !list_entry_types.is_empty() {
            builder.set_list_entry_types(list_entry_types);
        }
        if !quota_types.is_empty() {
            builder.set_quota_types(quota_types);
        }
        if !attr_gen_types.is_empty() {
            builder.set_attr_gen_types(attr_gen_types);
        }
        let params = if spec.params.is_null() {
            info.default_config.clone()
        } else {
            spec.params.clone()
        };
        builder
            .set_adapter_config(params)
            .map_err(|err| format!("handler {key}: {err}"))?;
        builder
            .validate()
            .map_err(|err| format!("handler {key}: {err}"))?;
        let handler = builder
            .build(Env {
                handler: key.to_string(),
            })
            .await
            .map_err(|err| format!("handler {key}: {err}"))?;

        for template in needed {
            if !handler.supports(template) {
                return Err(format!(
                    "handler {key}: built handler lacks capability '{template}'"
                ));
            }
        }
        Ok(HandlerEntry {
            name: key.to_string(),
            adapter: spec.adapter.clone(),
            handler,
        })
    }

    fn compile_instance(
        &self,
        instance: &ValidatedInstance,
        vocabulary: &Arc<Vocabulary>,
    ) -> Result<InstanceRecipe, String> {
        let name = instance.key.to_string();
        let compile = |text: &str| self.evaluator.compile_for(text, vocabulary);
        let recipe = match &instance.typed {
            TypedInstance::Report { param, .. } => InstanceRecipe::Report(
                report::compile_fields(&name, param, &compile).map_err(stringify)?,
            ),
            TypedInstance::Check { param, .. } => InstanceRecipe::Check(
                check::compile_fields(&name, param, &compile).map_err(stringify)?,
            ),
            TypedInstance::ListEntry { param, .. } => InstanceRecipe::ListEntry(
                listentry::compile_fields(&name, param, &compile).map_err(stringify)?,
            ),
            TypedInstance::Quota { param, .. } => InstanceRecipe::Quota(
                quota::compile_fields(&name, param, &compile).map_err(stringify)?,
            ),
            TypedInstance::AttrGen { param, .. } => InstanceRecipe::AttrGen(
                attrgen::compile_fields(&name, param, &compile).map_err(stringify)?,
            ),
        };
        Ok(recipe)
    }
}

fn stringify(err: impl std::fmt::Display) -> String {
    err.to_string()
}

struct Rebuilt {
    table: RoutingTable,
    built: HashMap<String, BuiltHandler>,
    generation: u64,
    state: PlannerState,
}

struct ResolvedRule {
    key: ResourceKey,
    match_expr: String,
    actions: Vec<(ResourceKey, Vec<ResourceKey>)>,
}

struct ValidatedInstance {
    key: ResourceKey,
    raw_params: serde_json::Value,
    typed: TypedInstance,
}

enum TypedInstance {
    Report {
        param: report::InstanceParam,
        ty: report::Type,
    },
    Check {
        param: check::InstanceParam,
        ty: check::Type,
    },
    ListEntry {
        param: listentry::InstanceParam,
        ty: listentry::Type,
    },
    Quota {
        param: quota::InstanceParam,
        ty: quota::Type,
    },
    AttrGen {
        param: attrgen::InstanceParam,
        ty: attrgen::Type,
    },
}

fn validate_instance(
    template: TemplateId,
    params: &serde_json::Value,
    type_of: &dyn Fn(&str) -> Result<telemesh_attr::ValueType, telemesh_expr::ExprError>,
) -> Result<TypedInstance, String> {
    match template {
        TemplateId::Report => {
            let param: report::InstanceParam =
                serde_json::from_value(params.clone()).map_err(stringify)?;
            let ty = report::infer_type(&param, type_of).map_err(stringify)?;
            Ok(TypedInstance::Report { param, ty })
        }
        TemplateId::Check => {
            let param: check::InstanceParam =
                serde_json::from_value(params.clone()).map_err(stringify)?;
            let ty = check::infer_type(&param, type_of).map_err(stringify)?;
            Ok(TypedInstance::Check { param, ty })
        }
        TemplateId::ListEntry => {
            let param: listentry::InstanceParam =
                serde_json::from_value(params.clone()).map_err(stringify)?;
            let ty = listentry::infer_type(&param, type_of).map_err(stringify)?;
            Ok(TypedInstance::ListEntry { param, ty })
        }
        TemplateId::Quota => {
            let param: quota::InstanceParam =
                serde_json::from_value(params.clone()).map_err(stringify)?;
            let ty = quota::infer_type(&param, type_of).map_err(stringify)?;
            Ok(TypedInstance::Quota { param, ty })
        }
        TemplateId::AttrGen => {
            let param: attrgen::InstanceParam =
                serde_json::from_value(params.clone()).map_err(stringify)?;
            let ty = attrgen::infer_type(&param, type_of).map_err(stringify)?;
            Ok(TypedInstance::AttrGen { param, ty })
        }
    }
}

/// Resolves `reference` as a short name in `namespace`, or as the
/// `name.namespace` form anywhere.
fn resolve_reference<V>(
    resources: &BTreeMap<ResourceKey, V>,
    namespace: &str,
    kind: &str,
    reference: &str,
) -> Option<ResourceKey> {
    let local = ResourceKey::new(kind, namespace, reference);
    if resources.contains_key(&local) {
        return Some(local);
    }
    if let Some((name, namespace)) = reference.split_once('.') {
        let qualified = ResourceKey::new(kind, namespace, name);
        if resources.contains_key(&qualified) {
            return Some(qualified);
        }
    }
    None
}

fn resources_of_kind<'a>(
    resources: &'a BTreeMap<ResourceKey, serde_json::Value>,
    kind: &'a str,
) -> impl Iterator<Item = (&'a ResourceKey, &'a serde_json::Value)> {
    resources
        .iter()
        .filter(move |(key, _)| key.kind == kind)
}

fn fingerprint_manifests(manifests: &BTreeMap<ResourceKey, Manifest>) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (key, manifest) in manifests {
        key.hash(&mut hasher);
        if let Ok(serialized) = serde_json::to_string(manifest) {
            serialized.hash(&mut hasher);
        }
    }
    hasher.finish()
}

fn fingerprint_handler<'a>(
    spec: &HandlerSpec,
    vocabulary_id: u64,
    instances: impl Iterator<Item = &'a ValidatedInstance>,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    spec.adapter.hash(&mut hasher);
    spec.params.to_string().hash(&mut hasher);
    vocabulary_id.hash(&mut hasher);
    for instance in instances {
        instance.key.hash(&mut hasher);
        instance.raw_params.to_string().hash(&mut hasher);
    }
    hasher.finish()
}
