use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::ConfigError;

/// Identifies one configuration resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.name, self.kind, self.namespace)
    }
}

/// A parsed configuration document. Two resources are equal iff their content
/// hashes match. `source` records the file the document came from so that a
/// file turning unparseable retains its resources instead of deleting them.
#[derive(Clone, Debug)]
pub struct Resource {
    pub key: ResourceKey,
    pub api_version: String,
    pub spec: serde_json::Value,
    pub hash: [u8; 32],
    pub source: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default)]
    kind: String,
    #[serde(default, rename = "apiVersion")]
    api_version: String,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    spec: serde_yaml::Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    name: String,
}

/// Parses a `---`-separated multi-document file, returning the resources it
/// yields and how many documents failed. Failed documents are logged and
/// skipped; they never produce a delete downstream.
pub fn parse_file(path: &str, content: &str) -> (Vec<Resource>, usize) {
    let mut data = content;
    if let Some(stripped) = data.strip_prefix("---\n") {
        data = stripped;
    }
    let data = data.trim_end_matches('\n');
    let data = data.strip_suffix("\n---").unwrap_or(data);
    if data.is_empty() {
        return (Vec::new(), 0);
    }

    let mut resources = Vec::new();
    let mut failures = 0;
    for (i, chunk) in data.split("\n---\n").enumerate() {
        match parse_chunk(chunk) {
            Ok(Some(mut resource)) => {
                resource.source = path.to_string();
                resources.push(resource);
            }
            Ok(None) => {}
            Err(err) => {
                warn!("skipping {path}[{i}]: {err}");
                failures += 1;
            }
        }
    }
    (resources, failures)
}

fn parse_chunk(chunk: &str) -> Result<Option<Resource>, ConfigError> {
    let raw: Option<RawDocument> =
        serde_yaml::from_str(chunk).map_err(|err| ConfigError::Parse {
            path: String::new(),
            detail: err.to_string(),
        })?;
    let raw = match raw {
        Some(raw) => raw,
        // whitespace or comments only
        None => return Ok(None),
    };
    if raw.kind.is_empty()
        && raw.metadata.name.is_empty()
        && raw.metadata.namespace.is_empty()
        && raw.api_version.is_empty()
        && raw.spec.is_null()
    {
        return Ok(None);
    }
    if raw.kind.is_empty() || raw.metadata.namespace.is_empty() || raw.metadata.name.is_empty() {
        return Err(ConfigError::Parse {
            path: String::new(),
            detail: format!(
                "key elements are empty: kind={:?} namespace={:?} name={:?}",
                raw.kind, raw.metadata.namespace, raw.metadata.name
            ),
        });
    }
    let spec = serde_json::to_value(&raw.spec).map_err(|err| ConfigError::Parse {
        path: String::new(),
        detail: err.to_string(),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(chunk.as_bytes());
    Ok(Some(Resource {
        key: ResourceKey::new(raw.kind, raw.metadata.namespace, raw.metadata.name),
        api_version: raw.api_version,
        spec,
        hash: hasher.finalize().into(),
        source: String::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
kind: handler
apiVersion: config.telemesh.io/v1
metadata:
  namespace: istio-system
  name: denyall
spec:
  adapter: denier
";

    #[test]
    fn parses_single_document() {
        let (resources, failures) = parse_file("test.yaml", DOC);
        assert_eq!(resources.len(), 1);
        assert_eq!(failures, 0);
        let r = &resources[0];
        assert_eq!(r.key, ResourceKey::new("handler", "istio-system", "denyall"));
        assert_eq!(r.key.to_string(), "denyall.handler.istio-system");
        assert_eq!(r.spec["adapter"], "denier");
        assert_eq!(r.source, "test.yaml");
    }

    #[test]
    fn splits_on_document_separator() {
        let content = format!("---\n{DOC}---\n{}", DOC.replace("denyall", "denyall2"));
        let (resources, _) = parse_file("test.yaml", &content);
        assert_eq!(resources.len(), 2);
        assert_ne!(resources[0].hash, resources[1].hash);
    }

    #[test]
    fn skips_empty_and_comment_documents() {
        let content = "---\n# just a comment\n---\n\n---\n";
        let (resources, failures) = parse_file("test.yaml", content);
        assert!(resources.is_empty());
        assert_eq!(failures, 0);
    }

    #[test]
    fn missing_identifiers_are_a_failure() {
        let content = "kind: handler\nmetadata:\n  name: incomplete\n";
        let (resources, failures) = parse_file("test.yaml", content);
        assert!(resources.is_empty(), "namespace is missing");
        assert_eq!(failures, 1);
    }

    #[test]
    fn identical_content_hashes_identically() {
        let (a, _) = parse_file("a.yaml", DOC);
        let (b, _) = parse_file("b.yaml", DOC);
        assert_eq!(a[0].hash, b[0].hash);
    }
}
