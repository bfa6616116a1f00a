//! Accepts everything and records nothing. Useful for wiring smoke tests
//! and as the minimal example of the handler ABI.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use telemesh_attr::AttributeValue;
use telemesh_core_types::Status;
use telemesh_template::adapter::{
    AttributeGenHandler, CheckHandler, CheckResult, Env, Handler, HandlerBuilder,
    ListEntryHandler, QuotaArgs, QuotaHandler, QuotaResult, ReportHandler,
};
use telemesh_template::{attrgen, check, listentry, quota, report, AdapterError, AdapterInfo, TemplateId};

const VALIDITY: Duration = Duration::from_secs(1000);
const USE_COUNT: i64 = 1000;

struct NoopHandler;

fn accept() -> CheckResult {
    CheckResult {
        status: Status::ok(),
        valid_duration: VALIDITY,
        valid_use_count: USE_COUNT,
    }
}

#[async_trait]
impl CheckHandler for NoopHandler {
    async fn handle_check(
        &self,
        _instance: &check::Instance,
    ) -> Result<CheckResult, AdapterError> {
        Ok(accept())
    }
}

#[async_trait]
impl ListEntryHandler for NoopHandler {
    async fn handle_list_entry(
        &self,
        _instance: &listentry::Instance,
    ) -> Result<CheckResult, AdapterError> {
        Ok(accept())
    }
}

#[async_trait]
impl QuotaHandler for NoopHandler {
    async fn handle_quota(
        &self,
        _instance: &quota::Instance,
        args: &QuotaArgs,
    ) -> Result<QuotaResult, AdapterError> {
        Ok(QuotaResult {
            amount: args.quota_amount,
            valid_duration: VALIDITY,
        })
    }
}

#[async_trait]
impl ReportHandler for NoopHandler {
    async fn handle_report(&self, _instances: &[report::Instance]) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[async_trait]
impl AttributeGenHandler for NoopHandler {
    async fn generate(
        &self,
        _instance: &attrgen::Instance,
    ) -> Result<BTreeMap<String, AttributeValue>, AdapterError> {
        Ok(BTreeMap::new())
    }
}

#[derive(Default)]
struct Builder;

#[async_trait]
impl HandlerBuilder for Builder {
    fn set_adapter_config(&mut self, _config: serde_json::Value) -> Result<(), AdapterError> {
        Ok(())
    }

    fn validate(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn build(&mut self, _env: Env) -> Result<Handler, AdapterError> {
        let handler = Arc::new(NoopHandler);
        Ok(Handler::new()
            .with_check(Arc::clone(&handler) as _)
            .with_list_entry(Arc::clone(&handler) as _)
            .with_quota(Arc::clone(&handler) as _)
            .with_report(Arc::clone(&handler) as _)
            .with_attr_gen(handler as _))
    }
}

pub fn info() -> AdapterInfo {
    AdapterInfo {
        name: "noop".to_string(),
        description: "Accepts all checks and quotas, drops all reports".to_string(),
        supported_templates: vec![
            TemplateId::Check,
            TemplateId::ListEntry,
            TemplateId::Quota,
            TemplateId::Report,
            TemplateId::AttrGen,
        ],
        default_config: json!({}),
        new_builder: Arc::new(|| Box::<Builder>::default() as Box<dyn HandlerBuilder>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_checks_and_grants_quota() {
        let mut builder = Builder;
        let handler = builder.build(Env::default()).await.unwrap();

        let check_instance = check::Instance {
            name: "c.instance.ns".to_string(),
            check_expression: String::new(),
            string_map: Default::default(),
        };
        let result = handler
            .check()
            .unwrap()
            .handle_check(&check_instance)
            .await
            .unwrap();
        assert!(result.status.is_ok());

        let quota_instance = quota::Instance {
            name: "q.instance.ns".to_string(),
            dimensions: Default::default(),
        };
        let granted = handler
            .quota()
            .unwrap()
            .handle_quota(
                &quota_instance,
                &QuotaArgs {
                    deduplication_id: "d".into(),
                    quota_amount: 7,
                    best_effort: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(granted.amount, 7);
    }
}
