use std::collections::HashMap;
use std::sync::Arc;

use telemesh_attr::Vocabulary;
use telemesh_config_center::ResourceKey;
use telemesh_expr::Program;
use telemesh_template::adapter::Handler;
use telemesh_template::{attrgen, check, listentry, quota, report, TemplateId};

/// Immutable dispatch state for one config generation. Published by the
/// planner through an atomic pointer swap; requests load it once on entry
/// and never observe a half-built table.
pub struct RoutingTable {
    pub generation: u64,
    /// Rules in `(namespace, name)` order; dispatch and result merging
    /// follow this order for determinism.
    pub rules: Vec<CompiledRule>,
    /// Built handlers by configured name.
    pub handlers: HashMap<String, Arc<HandlerEntry>>,
    /// The vocabulary every program in this table was compiled against.
    pub vocabulary: Arc<Vocabulary>,
}

impl RoutingTable {
    /// The boot table: nothing configured yet.
    pub fn empty(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            generation: 0,
            rules: Vec::new(),
            handlers: HashMap::new(),
            vocabulary,
        }
    }
}

pub struct HandlerEntry {
    pub name: String,
    pub adapter: String,
    pub handler: Handler,
}

pub struct CompiledRule {
    pub key: ResourceKey,
    /// Empty match expressions compile to no predicate: the rule always
    /// applies.
    pub predicate: Option<Arc<Program>>,
    pub actions: Vec<Action>,
}

pub struct Action {
    pub handler: Arc<HandlerEntry>,
    pub instances: Vec<InstanceRecipe>,
}

/// Per-template precompiled field programs for one instance.
#[derive(Clone)]
pub enum InstanceRecipe {
    Report(report::Recipe),
    Check(check::Recipe),
    ListEntry(listentry::Recipe),
    Quota(quota::Recipe),
    AttrGen(attrgen::Recipe),
}

impl InstanceRecipe {
    pub fn name(&self) -> &str {
        match self {
            InstanceRecipe::Report(r) => &r.name,
            InstanceRecipe::Check(r) => &r.name,
            InstanceRecipe::ListEntry(r) => &r.name,
            InstanceRecipe::Quota(r) => &r.name,
            InstanceRecipe::AttrGen(r) => &r.name,
        }
    }

    pub fn template(&self) -> TemplateId {
        match self {
            InstanceRecipe::Report(_) => TemplateId::Report,
            InstanceRecipe::Check(_) => TemplateId::Check,
            InstanceRecipe::ListEntry(_) => TemplateId::ListEntry,
            InstanceRecipe::Quota(_) => TemplateId::Quota,
            InstanceRecipe::AttrGen(_) => TemplateId::AttrGen,
        }
    }
}
