//! End-to-end dispatcher behavior over planner-built routing tables, with
//! mock adapters standing in for the real inventory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use telemesh_attr::{AttributeBag, AttributeValue};
use telemesh_config_center::{ResourceKey, StoreEvent};
use telemesh_core_types::{Status, StatusCode};
use telemesh_dispatcher::{Dispatcher, Planner, PlannerConfig, QuotaMethodArgs};
use telemesh_expr::Evaluator;
use telemesh_template::adapter::{
    AdapterInfo, AdapterRegistry, AttributeGenHandler, CheckResult, Env, Handler, HandlerBuilder,
    ListEntryHandler, QuotaArgs, QuotaHandler, QuotaResult, ReportHandler,
};
use telemesh_template::{attrgen, listentry, report, AdapterError, TemplateId};

struct StaticBuilder {
    handler: Handler,
}

#[async_trait]
impl HandlerBuilder for StaticBuilder {
    fn set_adapter_config(&mut self, _config: serde_json::Value) -> Result<(), AdapterError> {
        Ok(())
    }

    fn validate(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn build(&mut self, _env: Env) -> Result<Handler, AdapterError> {
        Ok(self.handler.clone())
    }
}

fn adapter_info(name: &str, templates: Vec<TemplateId>, handler: Handler) -> AdapterInfo {
    AdapterInfo {
        name: name.to_string(),
        description: "test adapter".to_string(),
        supported_templates: templates,
        default_config: json!({}),
        new_builder: Arc::new(move || {
            Box::new(StaticBuilder {
                handler: handler.clone(),
            }) as Box<dyn HandlerBuilder>
        }),
    }
}

struct Denier;

#[async_trait]
impl ListEntryHandler for Denier {
    async fn handle_list_entry(
        &self,
        _instance: &listentry::Instance,
    ) -> Result<CheckResult, AdapterError> {
        Ok(CheckResult {
            status: Status::new(StatusCode::FailedPrecondition, "denied by policy"),
            valid_duration: Duration::from_secs(1000),
            valid_use_count: 1000,
        })
    }
}

struct Approver;

#[async_trait]
impl ListEntryHandler for Approver {
    async fn handle_list_entry(
        &self,
        _instance: &listentry::Instance,
    ) -> Result<CheckResult, AdapterError> {
        Ok(CheckResult {
            status: Status::ok(),
            valid_duration: Duration::from_secs(60),
            valid_use_count: 100,
        })
    }
}

#[derive(Default)]
struct RecordingQuota {
    calls: Mutex<Vec<QuotaArgs>>,
}

#[async_trait]
impl QuotaHandler for RecordingQuota {
    async fn handle_quota(
        &self,
        _instance: &telemesh_template::quota::Instance,
        args: &QuotaArgs,
    ) -> Result<QuotaResult, AdapterError> {
        self.calls.lock().push(args.clone());
        Ok(QuotaResult {
            amount: args.quota_amount,
            valid_duration: Duration::from_secs(10),
        })
    }
}

#[derive(Default)]
struct RecordingReport {
    calls: Mutex<Vec<Vec<report::Instance>>>,
}

#[async_trait]
impl ReportHandler for RecordingReport {
    async fn handle_report(&self, instances: &[report::Instance]) -> Result<(), AdapterError> {
        self.calls.lock().push(instances.to_vec());
        Ok(())
    }
}

/// Passes its configured output expressions straight through.
struct EchoGenerator;

#[async_trait]
impl AttributeGenHandler for EchoGenerator {
    async fn generate(
        &self,
        instance: &attrgen::Instance,
    ) -> Result<BTreeMap<String, AttributeValue>, AdapterError> {
        Ok(instance.attributes.clone())
    }
}

struct FailingGenerator;

#[async_trait]
impl AttributeGenHandler for FailingGenerator {
    async fn generate(
        &self,
        _instance: &attrgen::Instance,
    ) -> Result<BTreeMap<String, AttributeValue>, AdapterError> {
        Err(AdapterError::new("generator backend unreachable"))
    }
}

fn update(kind: &str, namespace: &str, name: &str, spec: serde_json::Value) -> StoreEvent {
    StoreEvent::update(ResourceKey::new(kind, namespace, name), spec)
}

fn manifest_event(attributes: &[(&str, &str)]) -> StoreEvent {
    let mut map = serde_json::Map::new();
    for (name, ty) in attributes {
        map.insert(name.to_string(), json!({ "value_type": ty }));
    }
    update(
        "attributemanifest",
        "ns",
        "attributes",
        json!({ "attributes": map }),
    )
}

struct Fixture {
    planner: Arc<Planner>,
    dispatcher: Dispatcher,
}

async fn fixture(adapters: Vec<AdapterInfo>, events: Vec<StoreEvent>) -> Fixture {
    let evaluator = Arc::new(Evaluator::new(64));
    let registry = Arc::new(AdapterRegistry::new(adapters));
    let planner = Arc::new(Planner::new(
        Arc::clone(&evaluator),
        registry,
        PlannerConfig::default(),
    ));
    let dispatcher = Dispatcher::new(planner.table_handle(), evaluator);
    planner.apply(events).await;
    Fixture {
        planner,
        dispatcher,
    }
}

fn deny_config() -> Vec<StoreEvent> {
    vec![
        manifest_event(&[
            ("request.headers", "STRING_MAP"),
            ("source.name", "STRING"),
        ]),
        update("handler", "ns", "h1", json!({ "adapter": "denier" })),
        update(
            "instance",
            "ns",
            "i1",
            json!({
                "template": "listentry",
                "params": { "value": "source.name | \"unknown\"" }
            }),
        ),
        update(
            "rule",
            "ns",
            "r1",
            json!({ "actions": [{ "handler": "h1", "instances": ["i1"] }] }),
        ),
    ]
}

fn headers_bag() -> AttributeBag {
    let mut bag = AttributeBag::new();
    let mut headers = BTreeMap::new();
    headers.insert("clnt".to_string(), "abc".to_string());
    bag.set("request.headers", AttributeValue::StringMap(headers))
        .unwrap();
    bag
}

#[tokio::test]
async fn deny_precondition_surfaces_code_9() {
    let denier = Handler::new().with_list_entry(Arc::new(Denier));
    let fx = fixture(
        vec![adapter_info(
            "denier",
            vec![TemplateId::ListEntry, TemplateId::Check, TemplateId::Quota],
            denier,
        )],
        deny_config(),
    )
    .await;

    let bag = headers_bag();
    let result = fx.dispatcher.check(&bag).await.unwrap().expect("one rule matched");
    assert_eq!(result.status.code, StatusCode::FailedPrecondition);
    assert_eq!(result.status.code.code(), 9);
    assert_eq!(result.valid_duration, Duration::from_secs(1000));
    assert_eq!(result.valid_use_count, 1000);
}

#[tokio::test]
async fn check_merges_first_non_ok_status_and_minima() {
    let approver = Handler::new().with_list_entry(Arc::new(Approver));
    let denier = Handler::new().with_list_entry(Arc::new(Denier));
    let mut events = deny_config();
    // a second, accepting handler dispatched by an earlier-sorted rule
    events.push(update("handler", "ns", "h2", json!({ "adapter": "approver" })));
    events.push(update(
        "rule",
        "ns",
        "allowrule",
        json!({ "actions": [{ "handler": "h2", "instances": ["i1"] }] }),
    ));
    let fx = fixture(
        vec![
            adapter_info("denier", vec![TemplateId::ListEntry], denier),
            adapter_info("approver", vec![TemplateId::ListEntry], approver),
        ],
        events,
    )
    .await;

    let bag = headers_bag();
    let result = fx.dispatcher.check(&bag).await.unwrap().unwrap();
    // the approver is OK, the denier is not: first non-OK wins
    assert_eq!(result.status.code, StatusCode::FailedPrecondition);
    // validity is the minimum across both results
    assert_eq!(result.valid_duration, Duration::from_secs(60));
    assert_eq!(result.valid_use_count, 100);
}

#[tokio::test]
async fn quota_dedup_id_is_forwarded_not_coalesced() {
    let quota_handler = Arc::new(RecordingQuota::default());
    let handler = Handler::new().with_quota(Arc::clone(&quota_handler) as _);
    let fx = fixture(
        vec![adapter_info("quotas", vec![TemplateId::Quota], handler)],
        vec![
            manifest_event(&[("source.name", "STRING")]),
            update("handler", "ns", "q1", json!({ "adapter": "quotas" })),
            update(
                "instance",
                "ns",
                "requestcount",
                json!({ "template": "quota", "params": { "dimensions": {} } }),
            ),
            update(
                "rule",
                "ns",
                "r1",
                json!({ "actions": [{ "handler": "q1", "instances": ["requestcount"] }] }),
            ),
        ],
    )
    .await;

    let bag = AttributeBag::new();
    let args = QuotaMethodArgs {
        quota: "requestcount".to_string(),
        amount: 5,
        deduplication_id: "dedup-1234".to_string(),
        best_effort: false,
    };
    let (first, second) = tokio::join!(
        fx.dispatcher.quota(&bag, &args),
        fx.dispatcher.quota(&bag, &args)
    );
    assert_eq!(first.unwrap().unwrap().amount, 5);
    assert_eq!(second.unwrap().unwrap().amount, 5);

    let calls = quota_handler.calls.lock();
    assert_eq!(calls.len(), 2, "identical requests are both forwarded");
    assert!(calls
        .iter()
        .all(|call| call.deduplication_id == "dedup-1234" && call.quota_amount == 5));
}

#[tokio::test]
async fn unowned_quota_returns_none() {
    let fx = fixture(vec![], vec![]).await;
    let bag = AttributeBag::new();
    let args = QuotaMethodArgs {
        quota: "nobody-owns-this".to_string(),
        amount: 1,
        deduplication_id: "d".to_string(),
        best_effort: true,
    };
    assert!(fx.dispatcher.quota(&bag, &args).await.unwrap().is_none());
}

#[tokio::test]
async fn report_fan_in_delivers_one_batch_per_handler() {
    let recorder = Arc::new(RecordingReport::default());
    let handler = Handler::new().with_report(Arc::clone(&recorder) as _);

    let report_params = |dimensions: serde_json::Value| {
        json!({
            "template": "report",
            "params": {
                "value": "1",
                "dimensions": dimensions,
                "int64_primitive": "54362",
                "bool_primitive": "true",
                "double_primitive": "1.2",
                "string_primitive": "\"mystring\"",
                "timestamp": "request.time",
                "duration": "request.duration"
            }
        })
    };
    let fx = fixture(
        vec![adapter_info("telemetry", vec![TemplateId::Report], handler)],
        vec![
            manifest_event(&[
                ("request.time", "TIMESTAMP"),
                ("request.duration", "DURATION"),
            ]),
            update("handler", "ns", "rh", json!({ "adapter": "telemetry" })),
            update("instance", "ns", "foo", report_params(json!({ "s": "2" }))),
            update("instance", "ns", "bar", report_params(json!({ "k": "3" }))),
            update(
                "rule",
                "ns",
                "r1",
                json!({ "actions": [{ "handler": "rh", "instances": ["foo", "bar"] }] }),
            ),
        ],
    )
    .await;

    let mut bag = AttributeBag::new();
    bag.set(
        "request.time",
        AttributeValue::Timestamp(chrono::Utc::now()),
    )
    .unwrap();
    bag.set(
        "request.duration",
        AttributeValue::Duration(Duration::from_secs(10)),
    )
    .unwrap();

    fx.dispatcher.report(&bag).await.unwrap();

    let calls = recorder.calls.lock();
    assert_eq!(calls.len(), 1, "one batched call per handler");
    let instances = &calls[0];
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.int64_primitive == 54362));
    assert!(instances.iter().all(|i| i.string_primitive == "mystring"));
    let foo = instances.iter().find(|i| i.name.starts_with("foo.")).unwrap();
    let bar = instances.iter().find(|i| i.name.starts_with("bar.")).unwrap();
    assert_eq!(foo.dimensions["s"], AttributeValue::Int64(2));
    assert_eq!(bar.dimensions["k"], AttributeValue::Int64(3));
}

#[tokio::test]
async fn report_with_no_matching_rules_is_ok() {
    let fx = fixture(vec![], vec![]).await;
    let bag = AttributeBag::new();
    fx.dispatcher.report(&bag).await.unwrap();
    assert!(fx.dispatcher.check(&bag).await.unwrap().is_none());
}

#[tokio::test]
async fn unresolved_predicate_is_treated_as_false() {
    let denier = Handler::new().with_list_entry(Arc::new(Denier));
    let mut events = deny_config();
    events.pop();
    events.push(update(
        "rule",
        "ns",
        "r1",
        json!({
            "match": "source.name == \"svc-a\"",
            "actions": [{ "handler": "h1", "instances": ["i1"] }]
        }),
    ));
    let fx = fixture(
        vec![adapter_info("denier", vec![TemplateId::ListEntry], denier)],
        events,
    )
    .await;

    // bag lacks source.name entirely: the predicate is unresolvable and the
    // rule must not match
    let bag = headers_bag();
    assert!(fx.dispatcher.check(&bag).await.unwrap().is_none());
}

#[tokio::test]
async fn preprocess_merges_generated_attributes() {
    let handler = Handler::new().with_attr_gen(Arc::new(EchoGenerator));
    let fx = fixture(
        vec![adapter_info("echo", vec![TemplateId::AttrGen], handler)],
        vec![
            manifest_event(&[("source.name", "STRING")]),
            update("handler", "ns", "g1", json!({ "adapter": "echo" })),
            update(
                "instance",
                "ns",
                "derived",
                json!({
                    "template": "attrgen",
                    "params": { "attributes": { "derived.greeting": "\"hello\"" } }
                }),
            ),
            update(
                "rule",
                "ns",
                "r1",
                json!({ "actions": [{ "handler": "g1", "instances": ["derived"] }] }),
            ),
        ],
    )
    .await;

    let bag = Arc::new(AttributeBag::new());
    let mut out = bag.child();
    fx.dispatcher.preprocess(&bag, &mut out).await.unwrap();
    assert_eq!(
        out.get("derived.greeting"),
        Some(AttributeValue::from("hello"))
    );
}

#[tokio::test]
async fn preprocess_handler_error_is_internal() {
    let handler = Handler::new().with_attr_gen(Arc::new(FailingGenerator));
    let fx = fixture(
        vec![adapter_info("echo", vec![TemplateId::AttrGen], handler)],
        vec![
            update("handler", "ns", "g1", json!({ "adapter": "echo" })),
            update(
                "instance",
                "ns",
                "derived",
                json!({
                    "template": "attrgen",
                    "params": { "attributes": { "derived.greeting": "\"hello\"" } }
                }),
            ),
            update(
                "rule",
                "ns",
                "r1",
                json!({ "actions": [{ "handler": "g1", "instances": ["derived"] }] }),
            ),
        ],
    )
    .await;

    let bag = Arc::new(AttributeBag::new());
    let mut out = bag.child();
    let err = fx.dispatcher.preprocess(&bag, &mut out).await.unwrap_err();
    assert!(err.to_string().contains("generator backend unreachable"));
}

#[tokio::test]
async fn invalid_batch_keeps_previous_table() {
    let denier = Handler::new().with_list_entry(Arc::new(Denier));
    let fx = fixture(
        vec![adapter_info("denier", vec![TemplateId::ListEntry], denier)],
        deny_config(),
    )
    .await;
    let generation = fx.dispatcher.table().generation;

    // an instance referencing an unknown attribute fails re-validation and
    // must freeze the whole batch
    fx.planner
        .apply(vec![update(
            "instance",
            "ns",
            "i1",
            json!({
                "template": "listentry",
                "params": { "value": "no.such.attribute" }
            }),
        )])
        .await;

    assert_eq!(fx.dispatcher.table().generation, generation);
    let bag = headers_bag();
    let result = fx.dispatcher.check(&bag).await.unwrap().expect("old table still serves");
    assert_eq!(result.status.code, StatusCode::FailedPrecondition);
}

#[tokio::test]
async fn rejected_batch_leaves_vocabulary_untouched() {
    let denier = Handler::new().with_list_entry(Arc::new(Denier));
    let fx = fixture(
        vec![adapter_info("denier", vec![TemplateId::ListEntry], denier)],
        deny_config(),
    )
    .await;
    let generation = fx.dispatcher.table().generation;

    // the batch both replaces the manifest and carries an invalid instance:
    // rejection must not switch the evaluator to the candidate vocabulary,
    // or the kept table's programs would all go stale
    fx.planner
        .apply(vec![
            manifest_event(&[
                ("request.headers", "STRING_MAP"),
                ("source.name", "STRING"),
                ("extra.flag", "BOOL"),
            ]),
            update(
                "instance",
                "ns",
                "i1",
                json!({
                    "template": "listentry",
                    "params": { "value": "no.such.attribute" }
                }),
            ),
        ])
        .await;

    assert_eq!(fx.dispatcher.table().generation, generation);
    let bag = headers_bag();
    let result = fx
        .dispatcher
        .check(&bag)
        .await
        .unwrap()
        .expect("the kept table's programs still evaluate");
    assert_eq!(result.status.code, StatusCode::FailedPrecondition);
}

#[tokio::test]
async fn republish_increments_generation() {
    let denier = Handler::new().with_list_entry(Arc::new(Denier));
    let fx = fixture(
        vec![adapter_info("denier", vec![TemplateId::ListEntry], denier)],
        deny_config(),
    )
    .await;
    let first = fx.dispatcher.table().generation;

    fx.planner
        .apply(vec![update(
            "rule",
            "ns",
            "r2",
            json!({ "actions": [{ "handler": "h1", "instances": ["i1"] }] }),
        )])
        .await;

    let table = fx.dispatcher.table();
    assert_eq!(table.generation, first + 1);
    assert_eq!(table.rules.len(), 2);
}
