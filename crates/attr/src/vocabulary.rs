use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::AttrError;
use crate::value::ValueType;

/// Maps attribute names to their declared value types.
pub trait Finder: Send + Sync {
    fn find(&self, name: &str) -> Option<ValueType>;
}

/// One `attributemanifest` document's payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttributeInfo {
    #[serde(rename = "value_type", alias = "valueType")]
    pub value_type: ValueType,
}

static NEXT_VOCABULARY_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable attribute-name → type mapping frozen from a set of manifests.
/// Every constructed vocabulary gets a process-unique id; compiled programs
/// are keyed by it, so swapping in the same instance twice changes nothing.
#[derive(Debug)]
pub struct Vocabulary {
    id: u64,
    types: HashMap<String, ValueType>,
}

impl Vocabulary {
    pub fn from_manifests<'a, I>(manifests: I) -> Result<Self, AttrError>
    where
        I: IntoIterator<Item = &'a Manifest>,
    {
        let mut types = HashMap::new();
        for manifest in manifests {
            for (name, info) in &manifest.attributes {
                if types.insert(name.clone(), info.value_type).is_some() {
                    return Err(AttrError::DuplicateAttribute { name: name.clone() });
                }
            }
        }
        Ok(Self {
            id: NEXT_VOCABULARY_ID.fetch_add(1, Ordering::Relaxed),
            types,
        })
    }

    pub fn empty() -> Self {
        Self {
            id: NEXT_VOCABULARY_ID.fetch_add(1, Ordering::Relaxed),
            types: HashMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Finder for Vocabulary {
    fn find(&self, name: &str) -> Option<ValueType> {
        self.types.get(name).copied()
    }
}
