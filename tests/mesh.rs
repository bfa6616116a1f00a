//! Whole-stack tests: filesystem config in, wire attributes through the
//! service façade, adapter decisions out.

use std::collections::BTreeMap;
use std::time::Duration;

use telemesh::{CheckRequest, Mesh, MeshConfig, QuotaParams, ReportRequest};
use telemesh_attr::{wire, AttributeBag, AttributePresence, AttributeValue, GlobalWords};
use telemesh_core_types::StatusCode;

const MANIFEST: &str = "\
kind: attributemanifest
apiVersion: config.telemesh.io/v1
metadata:
  namespace: ns
  name: attributes
spec:
  attributes:
    request.headers:
      value_type: STRING_MAP
    source.name:
      value_type: STRING
    response.code:
      value_type: INT64
";

const DENY_HANDLER: &str = "\
kind: handler
apiVersion: config.telemesh.io/v1
metadata:
  namespace: ns
  name: denyall
spec:
  adapter: denier
";

const DENY_INSTANCE: &str = "\
kind: instance
apiVersion: config.telemesh.io/v1
metadata:
  namespace: ns
  name: appversion
spec:
  template: listentry
  params:
    value: source.name | \"unknown\"
";

const DENY_RULE: &str = "\
kind: rule
apiVersion: config.telemesh.io/v1
metadata:
  namespace: ns
  name: denyrule
spec:
  actions:
    - handler: denyall
      instances:
        - appversion
";

async fn mesh_with(files: &[(&str, &str)]) -> (Mesh, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).unwrap();
    }
    let config = MeshConfig {
        config_root: dir.path().to_path_buf(),
        // the backend is polled manually from tests
        poll_interval_ms: 3_600_000,
        ..MeshConfig::default()
    };
    let mesh = Mesh::start(config, telemesh_adapters::inventory())
        .await
        .unwrap();
    // give the planner a beat to drain the initial event burst
    tokio::time::sleep(Duration::from_millis(200)).await;
    (mesh, dir)
}

fn headers_request() -> CheckRequest {
    let global = GlobalWords::standard();
    let mut bag = AttributeBag::new();
    let mut headers = BTreeMap::new();
    headers.insert("clnt".to_string(), "abc".to_string());
    bag.set("request.headers", AttributeValue::StringMap(headers))
        .unwrap();
    CheckRequest {
        attributes: wire::encode_bag(&bag, &global, global.len()),
        global_word_count: global.len(),
        deduplication_id: "req-1".to_string(),
        quotas: BTreeMap::new(),
    }
}

#[tokio::test]
async fn configured_denier_rejects_check() {
    let (mesh, _dir) = mesh_with(&[
        ("manifest.yaml", MANIFEST),
        ("handler.yaml", DENY_HANDLER),
        ("instance.yaml", DENY_INSTANCE),
        ("rule.yaml", DENY_RULE),
    ])
    .await;

    let response = mesh.service.check(headers_request()).await.unwrap();
    assert_eq!(
        response.precondition.status.code,
        StatusCode::FailedPrecondition
    );
    assert_eq!(response.precondition.status.code.code(), 9);
    assert_eq!(
        response.precondition.valid_duration,
        Duration::from_secs(1000)
    );

    // materializing `source.name | "unknown"` observed source.name as absent
    let referenced = &response.precondition.referenced_attributes;
    let global = GlobalWords::standard();
    let source_name = global.index_of("source.name").unwrap();
    assert!(referenced
        .attribute_matches
        .iter()
        .any(|m| m.name == source_name && m.condition == AttributePresence::Absent));
}

#[tokio::test]
async fn empty_config_checks_ok_with_defaults() {
    let (mesh, _dir) = mesh_with(&[]).await;

    let mut request = headers_request();
    request
        .quotas
        .insert("requestcount".to_string(), QuotaParams {
            amount: 3,
            best_effort: false,
        });

    let response = mesh.service.check(request).await.unwrap();
    assert!(response.precondition.status.is_ok());
    assert_eq!(response.precondition.valid_duration, Duration::from_secs(10));
    assert_eq!(response.precondition.valid_use_count, 200);

    // nobody owns the quota: the request is granted as asked
    let quota = &response.quotas["requestcount"];
    assert_eq!(quota.granted_amount, 3);
}

#[tokio::test]
async fn config_reload_switches_decision() {
    let (mesh, dir) = mesh_with(&[("manifest.yaml", MANIFEST)]).await;

    let response = mesh.service.check(headers_request()).await.unwrap();
    assert!(response.precondition.status.is_ok());

    std::fs::write(dir.path().join("handler.yaml"), DENY_HANDLER).unwrap();
    std::fs::write(dir.path().join("instance.yaml"), DENY_INSTANCE).unwrap();
    std::fs::write(dir.path().join("rule.yaml"), DENY_RULE).unwrap();
    mesh.poll_config().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = mesh.service.check(headers_request()).await.unwrap();
    assert_eq!(
        response.precondition.status.code,
        StatusCode::FailedPrecondition
    );
}

#[tokio::test]
async fn report_applies_delta_blocks() {
    let (mesh, _dir) = mesh_with(&[("manifest.yaml", MANIFEST)]).await;
    let global = GlobalWords::standard();

    let mut first = AttributeBag::new();
    first
        .set("source.name", AttributeValue::from("svc-a"))
        .unwrap();
    first.set("response.code", AttributeValue::from(200i64)).unwrap();

    let mut second = AttributeBag::new();
    second.set("response.code", AttributeValue::from(503i64)).unwrap();

    let request = ReportRequest {
        attributes: vec![
            wire::encode_bag(&first, &global, global.len()),
            wire::encode_bag(&second, &global, global.len()),
        ],
        default_words: Vec::new(),
        global_word_count: global.len(),
    };
    mesh.service.report(request).await.unwrap();
}

#[tokio::test]
async fn empty_report_is_a_no_op() {
    let (mesh, _dir) = mesh_with(&[]).await;
    mesh.service
        .report(ReportRequest::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn malformed_wire_is_invalid_argument() {
    let (mesh, _dir) = mesh_with(&[]).await;

    let mut request = headers_request();
    // an index far past the known global list
    request.attributes.int64s.insert(9999, 1);
    let err = mesh.service.check(request).await.unwrap_err();
    assert_eq!(err.status().code, StatusCode::InvalidArgument);
}
