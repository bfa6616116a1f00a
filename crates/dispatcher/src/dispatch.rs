use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::{join_all, try_join_all};
use futures::FutureExt;
use tracing::{debug, warn};

use telemesh_attr::{AttributeBag, AttributeValue};
use telemesh_core_types::Status;
use telemesh_expr::{Evaluator, ExprError, Program};
use telemesh_template::adapter::{CheckResult, QuotaArgs, QuotaResult};
use telemesh_template::{attrgen, check, listentry, quota, report};

use crate::errors::DispatchError;
use crate::table::{CompiledRule, HandlerEntry, InstanceRecipe, RoutingTable};

/// Quota request as received from the transport: the quota's configured name
/// plus the adapter arguments. The dispatcher forwards `deduplication_id`
/// verbatim and never coalesces identical requests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaMethodArgs {
    pub quota: String,
    pub amount: i64,
    pub deduplication_id: String,
    pub best_effort: bool,
}

/// Request-side runtime: loads the current routing table once per operation,
/// resolves matching rules, materializes instances, and fans out to handlers.
/// Reentrant; all state is behind the atomically swapped table pointer.
pub struct Dispatcher {
    table: Arc<ArcSwap<RoutingTable>>,
    evaluator: Arc<Evaluator>,
}

impl Dispatcher {
    pub fn new(table: Arc<ArcSwap<RoutingTable>>, evaluator: Arc<Evaluator>) -> Self {
        Self { table, evaluator }
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    /// Runs every matching attribute-generator handler in parallel and
    /// merges their outputs into `out`, last writer (in rule order) winning.
    /// The first handler failure cancels the remaining generators.
    pub async fn preprocess(
        &self,
        bag: &AttributeBag,
        out: &mut AttributeBag,
    ) -> Result<(), DispatchError> {
        let table = self.table();
        let mut calls = Vec::new();
        for rule in self.matching_rules(&table, bag) {
            for action in &rule.actions {
                for recipe in &action.instances {
                    let InstanceRecipe::AttrGen(recipe) = recipe else {
                        continue;
                    };
                    let Some(handler) = action.handler.handler.attr_gen() else {
                        continue;
                    };
                    match attrgen::materialize(recipe, bag, &self.evaluator) {
                        Ok(instance) => calls.push((Arc::clone(handler), instance)),
                        Err(err) => {
                            warn!(instance = %recipe.name, "skipping generator instance: {err}")
                        }
                    }
                }
            }
        }
        if calls.is_empty() {
            return Ok(());
        }
        debug!(generators = calls.len(), "dispatching preprocess");

        let futures = calls.iter().map(|(handler, instance)| async move {
            AssertUnwindSafe(handler.generate(instance))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(telemesh_template::AdapterError::new(
                        "attribute generator panicked",
                    ))
                })
        });
        let outputs = try_join_all(futures)
            .await
            .map_err(|err| DispatchError::internal(format!("attribute generation: {err}")))?;

        for output in outputs {
            for (name, value) in output {
                out.set(name, value)
                    .map_err(|err| DispatchError::internal(format!("merge: {err}")))?;
            }
        }
        Ok(())
    }

    /// Fans out to every check and listentry handler whose rule matched.
    /// Returns `None` when nothing matched, letting the caller substitute
    /// its configured default.
    pub async fn check(&self, bag: &AttributeBag) -> Result<Option<CheckResult>, DispatchError> {
        let table = self.table();
        let mut calls = Vec::new();
        for rule in self.matching_rules(&table, bag) {
            for action in &rule.actions {
                for recipe in &action.instances {
                    match recipe {
                        InstanceRecipe::Check(recipe) => {
                            let Some(handler) = action.handler.handler.check() else {
                                continue;
                            };
                            match check::materialize(recipe, bag, &self.evaluator) {
                                Ok(instance) => {
                                    calls.push(CheckCall::Check(Arc::clone(handler), instance))
                                }
                                Err(err) => {
                                    warn!(instance = %recipe.name, "skipping check instance: {err}")
                                }
                            }
                        }
                        InstanceRecipe::ListEntry(recipe) => {
                            let Some(handler) = action.handler.handler.list_entry() else {
                                continue;
                            };
                            match listentry::materialize(recipe, bag, &self.evaluator) {
                                Ok(instance) => {
                                    calls.push(CheckCall::ListEntry(Arc::clone(handler), instance))
                                }
                                Err(err) => {
                                    warn!(instance = %recipe.name, "skipping listentry instance: {err}")
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        if calls.is_empty() {
            return Ok(None);
        }
        debug!(checks = calls.len(), "dispatching check");

        let futures = calls.into_iter().map(|call| async move {
            match call {
                CheckCall::Check(handler, instance) => {
                    AssertUnwindSafe(handler.handle_check(&instance))
                        .catch_unwind()
                        .await
                }
                CheckCall::ListEntry(handler, instance) => {
                    AssertUnwindSafe(handler.handle_list_entry(&instance))
                        .catch_unwind()
                        .await
                }
            }
        });
        let results = join_all(futures).await;

        // merge in rule-sorted dispatch order: first non-OK status wins,
        // validity is the minimum over successful results
        let mut status = Status::ok();
        let mut valid_duration: Option<Duration> = None;
        let mut valid_use_count: Option<i64> = None;
        for result in results {
            match result {
                Ok(Ok(partial)) => {
                    if status.is_ok() && !partial.status.is_ok() {
                        status = partial.status.clone();
                    }
                    valid_duration = Some(match valid_duration {
                        Some(current) => current.min(partial.valid_duration),
                        None => partial.valid_duration,
                    });
                    valid_use_count = Some(match valid_use_count {
                        Some(current) => current.min(partial.valid_use_count),
                        None => partial.valid_use_count,
                    });
                }
                Ok(Err(err)) => {
                    warn!("check handler failed: {err}");
                    if status.is_ok() {
                        status = Status::internal(err.to_string());
                    }
                }
                Err(_) => {
                    warn!("check handler panicked");
                    if status.is_ok() {
                        status = Status::internal("check handler panicked");
                    }
                }
            }
        }
        Ok(Some(CheckResult {
            status,
            valid_duration: valid_duration.unwrap_or(Duration::ZERO),
            valid_use_count: valid_use_count.unwrap_or(0),
        }))
    }

    /// Dispatches to the single handler owning the named quota. `None` means
    /// no handler owns it and the caller grants the request unlimited.
    pub async fn quota(
        &self,
        bag: &AttributeBag,
        args: &QuotaMethodArgs,
    ) -> Result<Option<QuotaResult>, DispatchError> {
        let table = self.table();
        for rule in self.matching_rules(&table, bag) {
            for action in &rule.actions {
                for recipe in &action.instances {
                    let InstanceRecipe::Quota(recipe) = recipe else {
                        continue;
                    };
                    if !quota_name_matches(&recipe.name, &args.quota) {
                        continue;
                    }
                    let Some(handler) = action.handler.handler.quota() else {
                        continue;
                    };
                    let instance = match quota::materialize(recipe, bag, &self.evaluator) {
                        Ok(instance) => instance,
                        Err(err) => {
                            warn!(instance = %recipe.name, "skipping quota instance: {err}");
                            continue;
                        }
                    };
                    debug!(quota = %args.quota, handler = %action.handler.name, "dispatching quota");
                    let adapter_args = QuotaArgs {
                        deduplication_id: args.deduplication_id.clone(),
                        quota_amount: args.amount,
                        best_effort: args.best_effort,
                    };
                    let result = AssertUnwindSafe(handler.handle_quota(&instance, &adapter_args))
                        .catch_unwind()
                        .await;
                    return match result {
                        Ok(Ok(result)) => Ok(Some(result)),
                        Ok(Err(err)) => Err(DispatchError::internal(format!(
                            "quota handler {}: {err}",
                            action.handler.name
                        ))),
                        Err(_) => Err(DispatchError::internal("quota handler panicked")),
                    };
                }
            }
        }
        Ok(None)
    }

    /// Fans out to report handlers, delivering each handler every matching
    /// instance in one call. Individual failures are logged and skipped; the
    /// call fails only when every handler failed.
    pub async fn report(&self, bag: &AttributeBag) -> Result<(), DispatchError> {
        let table = self.table();
        let mut order: Vec<Arc<HandlerEntry>> = Vec::new();
        let mut grouped: Vec<Vec<report::Instance>> = Vec::new();
        for rule in self.matching_rules(&table, bag) {
            for action in &rule.actions {
                for recipe in &action.instances {
                    let InstanceRecipe::Report(recipe) = recipe else {
                        continue;
                    };
                    let instance = match report::materialize(recipe, bag, &self.evaluator) {
                        Ok(instance) => instance,
                        Err(err) => {
                            warn!(instance = %recipe.name, "skipping report instance: {err}");
                            continue;
                        }
                    };
                    let slot = order
                        .iter()
                        .position(|entry| entry.name == action.handler.name)
                        .unwrap_or_else(|| {
                            order.push(Arc::clone(&action.handler));
                            grouped.push(Vec::new());
                            order.len() - 1
                        });
                    grouped[slot].push(instance);
                }
            }
        }
        if order.is_empty() {
            return Ok(());
        }
        debug!(handlers = order.len(), "dispatching report");

        let futures = order
            .iter()
            .zip(grouped.iter())
            .map(|(entry, instances)| async move {
                let Some(handler) = entry.handler.report() else {
                    return Err(format!("handler {} lacks report capability", entry.name));
                };
                match AssertUnwindSafe(handler.handle_report(instances))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(format!("handler {}: {err}", entry.name)),
                    Err(_) => Err(format!("handler {} panicked", entry.name)),
                }
            });
        let results = join_all(futures).await;
        let mut failures = 0;
        for result in &results {
            if let Err(err) = result {
                warn!("report handler failed: {err}");
                failures += 1;
            }
        }
        if failures == results.len() {
            return Err(DispatchError::internal("every report handler failed"));
        }
        Ok(())
    }

    fn matching_rules<'t>(
        &self,
        table: &'t RoutingTable,
        bag: &AttributeBag,
    ) -> Vec<&'t CompiledRule> {
        table
            .rules
            .iter()
            .filter(|rule| match &rule.predicate {
                None => true,
                Some(program) => match self.eval_predicate(program, bag) {
                    Ok(matched) => matched,
                    Err(err) => {
                        // an unresolvable predicate never matches
                        warn!(rule = %rule.key, "predicate failed, treating as false: {err}");
                        false
                    }
                },
            })
            .collect()
    }

    fn eval_predicate(&self, program: &Program, bag: &AttributeBag) -> Result<bool, ExprError> {
        match self.evaluator.eval_program(program, bag)? {
            AttributeValue::Bool(matched) => Ok(matched),
            other => Err(ExprError::TypeMismatch {
                expected: telemesh_attr::ValueType::Bool,
                actual: other.value_type(),
            }),
        }
    }
}

enum CheckCall {
    Check(
        Arc<dyn telemesh_template::adapter::CheckHandler>,
        check::Instance,
    ),
    ListEntry(
        Arc<dyn telemesh_template::adapter::ListEntryHandler>,
        listentry::Instance,
    ),
}

/// Quota instances are table-named `name.instance.namespace`; transport
/// callers may use either that or the bare configured name.
fn quota_name_matches(recipe_name: &str, requested: &str) -> bool {
    if recipe_name == requested {
        return true;
    }
    recipe_name
        .split_once('.')
        .map(|(short, _)| short == requested)
        .unwrap_or(false)
}
