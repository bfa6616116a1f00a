//! The ABI every adapter presents to the runtime: a builder configured once
//! per routing-table build, and a capability table of per-template handler
//! objects invoked per request.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use telemesh_attr::AttributeValue;
use telemesh_core_types::Status;

use crate::errors::AdapterError;
use crate::registry::TemplateId;
use crate::{attrgen, check, listentry, quota, report};

/// Outcome of one check-variety handler call.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckResult {
    pub status: Status,
    pub valid_duration: Duration,
    pub valid_use_count: i64,
}

impl Default for CheckResult {
    fn default() -> Self {
        Self {
            status: Status::ok(),
            valid_duration: Duration::ZERO,
            valid_use_count: 0,
        }
    }
}

impl CheckResult {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Arguments forwarded verbatim to the quota adapter. Two requests carrying
/// the same `deduplication_id` within the adapter's window must get the same
/// decision; the runtime neither caches nor coalesces.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaArgs {
    pub deduplication_id: String,
    pub quota_amount: i64,
    pub best_effort: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuotaResult {
    pub amount: i64,
    pub valid_duration: Duration,
}

#[async_trait]
pub trait ReportHandler: Send + Sync {
    async fn handle_report(&self, instances: &[report::Instance]) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait CheckHandler: Send + Sync {
    async fn handle_check(&self, instance: &check::Instance) -> Result<CheckResult, AdapterError>;
}

#[async_trait]
pub trait ListEntryHandler: Send + Sync {
    async fn handle_list_entry(
        &self,
        instance: &listentry::Instance,
    ) -> Result<CheckResult, AdapterError>;
}

#[async_trait]
pub trait QuotaHandler: Send + Sync {
    async fn handle_quota(
        &self,
        instance: &quota::Instance,
        args: &QuotaArgs,
    ) -> Result<QuotaResult, AdapterError>;
}

#[async_trait]
pub trait AttributeGenHandler: Send + Sync {
    /// Produces derived attributes merged into the request bag.
    async fn generate(
        &self,
        instance: &attrgen::Instance,
    ) -> Result<BTreeMap<String, AttributeValue>, AdapterError>;
}

#[async_trait]
pub trait HandlerClose: Send + Sync {
    async fn close(&self) -> Result<(), AdapterError>;
}

/// Capability table for one built handler. A handler supports template T iff
/// the T slot is populated; the planner checks this against the adapter's
/// declared templates at build time, so dispatch is a plain lookup.
#[derive(Clone, Default)]
pub struct Handler {
    report: Option<Arc<dyn ReportHandler>>,
    check: Option<Arc<dyn CheckHandler>>,
    list_entry: Option<Arc<dyn ListEntryHandler>>,
    quota: Option<Arc<dyn QuotaHandler>>,
    attr_gen: Option<Arc<dyn AttributeGenHandler>>,
    close: Option<Arc<dyn HandlerClose>>,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report(mut self, handler: Arc<dyn ReportHandler>) -> Self {
        self.report = Some(handler);
        self
    }

    pub fn with_check(mut self, handler: Arc<dyn CheckHandler>) -> Self {
        self.check = Some(handler);
        self
    }

    pub fn with_list_entry(mut self, handler: Arc<dyn ListEntryHandler>) -> Self {
        self.list_entry = Some(handler);
        self
    }

    pub fn with_quota(mut self, handler: Arc<dyn QuotaHandler>) -> Self {
        self.quota = Some(handler);
        self
    }

    pub fn with_attr_gen(mut self, handler: Arc<dyn AttributeGenHandler>) -> Self {
        self.attr_gen = Some(handler);
        self
    }

    pub fn with_close(mut self, close: Arc<dyn HandlerClose>) -> Self {
        self.close = Some(close);
        self
    }

    pub fn supports(&self, template: TemplateId) -> bool {
        match template {
            TemplateId::Report => self.report.is_some(),
            TemplateId::Check => self.check.is_some(),
            TemplateId::ListEntry => self.list_entry.is_some(),
            TemplateId::Quota => self.quota.is_some(),
            TemplateId::AttrGen => self.attr_gen.is_some(),
        }
    }

    pub fn report(&self) -> Option<&Arc<dyn ReportHandler>> {
        self.report.as_ref()
    }

    pub fn check(&self) -> Option<&Arc<dyn CheckHandler>> {
        self.check.as_ref()
    }

    pub fn list_entry(&self) -> Option<&Arc<dyn ListEntryHandler>> {
        self.list_entry.as_ref()
    }

    pub fn quota(&self) -> Option<&Arc<dyn QuotaHandler>> {
        self.quota.as_ref()
    }

    pub fn attr_gen(&self) -> Option<&Arc<dyn AttributeGenHandler>> {
        self.attr_gen.as_ref()
    }

    /// Invoked at most once, after the routing tables referencing this
    /// handler have drained.
    pub async fn close(&self) -> Result<(), AdapterError> {
        match &self.close {
            Some(close) => close.close().await,
            None => Ok(()),
        }
    }
}

/// Construction-time environment handed to `build`.
#[derive(Clone, Debug, Default)]
pub struct Env {
    /// Configured name of the handler being built, for log context.
    pub handler: String,
}

/// Configures and constructs one handler. The planner calls the type setters
/// for every template the handler's instances use, then `set_adapter_config`,
/// `validate`, and finally `build` — in that order, once per build.
#[async_trait]
pub trait HandlerBuilder: Send + Sync {
    fn set_report_types(&mut self, types: HashMap<String, report::Type>) {
        let _ = types;
    }

    fn set_check_types(&mut self, types: HashMap<String, check::Type>) {
        let _ = types;
    }

    fn set_list_entry_types(&mut self, types: HashMap<String, listentry::Type>) {
        let _ = types;
    }

    fn set_quota_types(&mut self, types: HashMap<String, quota::Type>) {
        let _ = types;
    }

    fn set_attr_gen_types(&mut self, types: HashMap<String, attrgen::Type>) {
        let _ = types;
    }

    fn set_adapter_config(&mut self, config: serde_json::Value) -> Result<(), AdapterError>;

    /// Pure and idempotent.
    fn validate(&self) -> Result<(), AdapterError>;

    async fn build(&mut self, env: Env) -> Result<Handler, AdapterError>;
}

/// Registration record for one adapter implementation.
#[derive(Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub description: String,
    pub supported_templates: Vec<TemplateId>,
    pub default_config: serde_json::Value,
    pub new_builder: Arc<dyn Fn() -> Box<dyn HandlerBuilder> + Send + Sync>,
}

impl AdapterInfo {
    pub fn supports(&self, template: TemplateId) -> bool {
        self.supported_templates.contains(&template)
    }
}

/// Adapter inventory the planner resolves handler specs against.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, AdapterInfo>,
}

impl AdapterRegistry {
    pub fn new(inventory: impl IntoIterator<Item = AdapterInfo>) -> Self {
        let mut adapters = HashMap::new();
        for info in inventory {
            adapters.insert(info.name.clone(), info);
        }
        Self { adapters }
    }

    pub fn get(&self, name: &str) -> Option<&AdapterInfo> {
        self.adapters.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}
