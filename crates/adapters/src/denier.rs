//! Rejects any check or quota request with a configurable status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use telemesh_core_types::{Status, StatusCode};
use telemesh_template::adapter::{
    CheckHandler, CheckResult, Env, Handler, HandlerBuilder, ListEntryHandler, QuotaArgs,
    QuotaHandler, QuotaResult,
};
use telemesh_template::{check, listentry, quota, AdapterError, AdapterInfo, TemplateId};

const VALIDITY: Duration = Duration::from_secs(1000);
const USE_COUNT: i64 = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    pub status: Status,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            status: Status::new(StatusCode::FailedPrecondition, String::new()),
        }
    }
}

struct DenierHandler {
    status: Status,
}

#[async_trait]
impl CheckHandler for DenierHandler {
    async fn handle_check(
        &self,
        _instance: &check::Instance,
    ) -> Result<CheckResult, AdapterError> {
        Ok(self.result())
    }
}

#[async_trait]
impl ListEntryHandler for DenierHandler {
    async fn handle_list_entry(
        &self,
        _instance: &listentry::Instance,
    ) -> Result<CheckResult, AdapterError> {
        Ok(self.result())
    }
}

#[async_trait]
impl QuotaHandler for DenierHandler {
    async fn handle_quota(
        &self,
        _instance: &quota::Instance,
        _args: &QuotaArgs,
    ) -> Result<QuotaResult, AdapterError> {
        Ok(QuotaResult::default())
    }
}

impl DenierHandler {
    fn result(&self) -> CheckResult {
        CheckResult {
            status: self.status.clone(),
            valid_duration: VALIDITY,
            valid_use_count: USE_COUNT,
        }
    }
}

#[derive(Default)]
struct Builder {
    params: Params,
}

#[async_trait]
impl HandlerBuilder for Builder {
    fn set_adapter_config(&mut self, config: serde_json::Value) -> Result<(), AdapterError> {
        self.params =
            serde_json::from_value(config).map_err(|err| AdapterError::new(err.to_string()))?;
        Ok(())
    }

    fn validate(&self) -> Result<(), AdapterError> {
        if self.params.status.is_ok() {
            return Err(AdapterError::new(
                "denier status must be a non-OK code",
            ));
        }
        Ok(())
    }

    async fn build(&mut self, _env: Env) -> Result<Handler, AdapterError> {
        let handler = Arc::new(DenierHandler {
            status: self.params.status.clone(),
        });
        Ok(Handler::new()
            .with_check(Arc::clone(&handler) as _)
            .with_list_entry(Arc::clone(&handler) as _)
            .with_quota(handler as _))
    }
}

pub fn info() -> AdapterInfo {
    AdapterInfo {
        name: "denier".to_string(),
        description: "Rejects any check and quota request with a configurable error".to_string(),
        supported_templates: vec![TemplateId::Check, TemplateId::ListEntry, TemplateId::Quota],
        default_config: json!({ "status": { "code": "FailedPrecondition", "message": "" } }),
        new_builder: Arc::new(|| Box::<Builder>::default() as Box<dyn HandlerBuilder>),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denies_with_configured_status() {
        let mut builder = Builder::default();
        builder
            .set_adapter_config(json!({
                "status": { "code": "PermissionDenied", "message": "not today" }
            }))
            .unwrap();
        builder.validate().unwrap();
        let handler = builder.build(Env::default()).await.unwrap();

        let instance = listentry::Instance {
            name: "i1.instance.ns".to_string(),
            value: "svc".to_string(),
        };
        let result = handler
            .list_entry()
            .unwrap()
            .handle_list_entry(&instance)
            .await
            .unwrap();
        assert_eq!(result.status.code, StatusCode::PermissionDenied);
        assert_eq!(result.valid_use_count, USE_COUNT);
    }

    #[tokio::test]
    async fn default_config_is_failed_precondition() {
        let mut builder = Builder::default();
        builder.set_adapter_config(info().default_config).unwrap();
        builder.validate().unwrap();
        let handler = builder.build(Env::default()).await.unwrap();

        let instance = check::Instance {
            name: "i1.instance.ns".to_string(),
            check_expression: String::new(),
            string_map: Default::default(),
        };
        let result = handler
            .check()
            .unwrap()
            .handle_check(&instance)
            .await
            .unwrap();
        assert_eq!(result.status.code.code(), 9);
    }

    #[test]
    fn ok_status_fails_validation() {
        let mut builder = Builder::default();
        builder
            .set_adapter_config(json!({ "status": { "code": "Ok", "message": "" } }))
            .unwrap();
        assert!(builder.validate().is_err());
    }
}
