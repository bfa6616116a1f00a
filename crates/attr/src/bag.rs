use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::AttrError;
use crate::value::AttributeValue;
use crate::vocabulary::{Finder, Vocabulary};

/// Whether a referenced attribute was observed as present or absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributePresence {
    Present,
    Absent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRef {
    pub name: String,
    pub presence: AttributePresence,
}

/// The referenced-attributes side channel. One set is shared by every layer
/// of a request's bag stack so that reads against any layer land in the same
/// snapshot. Internally locked only because sibling evaluations during
/// dispatch fan-out record reads concurrently; the bag itself stays
/// single-owner.
#[derive(Debug, Default)]
pub struct ReferencedSet {
    inner: Mutex<HashSet<(String, AttributePresence)>>,
}

impl ReferencedSet {
    pub fn record(&self, name: &str, presence: AttributePresence) {
        self.inner.lock().insert((name.to_string(), presence));
    }

    pub fn snapshot(&self) -> Vec<AttributeRef> {
        let mut refs: Vec<AttributeRef> = self
            .inner
            .lock()
            .iter()
            .map(|(name, presence)| AttributeRef {
                name: name.clone(),
                presence: *presence,
            })
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        refs
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Layered attribute container for one request. Reads walk from this layer
/// down through its parents and return the first hit; only this layer's own
/// map is mutable. `child` pushes a new mutable layer over a shared parent.
#[derive(Debug, Default)]
pub struct AttributeBag {
    parent: Option<Arc<AttributeBag>>,
    values: HashMap<String, AttributeValue>,
    referenced: Arc<ReferencedSet>,
    vocabulary: Option<Arc<Vocabulary>>,
    read_only: bool,
}

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bag that rejects values whose runtime type disagrees with the
    /// declared vocabulary type.
    pub fn with_vocabulary(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            vocabulary: Some(vocabulary),
            ..Self::default()
        }
    }

    /// Root bag over decoded wire words. The wire layer itself is immutable;
    /// the first `set` splits it off as a parent under a fresh mutable layer.
    pub fn from_wire_values(values: HashMap<String, AttributeValue>) -> Self {
        Self {
            values,
            read_only: true,
            ..Self::default()
        }
    }

    /// Looks up `name` and records the observation in the referenced set.
    pub fn get(&self, name: &str) -> Option<AttributeValue> {
        let value = self.lookup(name).cloned();
        let presence = if value.is_some() {
            AttributePresence::Present
        } else {
            AttributePresence::Absent
        };
        self.referenced.record(name, presence);
        value
    }

    /// Lookup without touching the referenced set (delta encoding, merges).
    pub fn lookup(&self, name: &str) -> Option<&AttributeValue> {
        if let Some(value) = self.values.get(name) {
            return Some(value);
        }
        let mut layer = self.parent.as_deref();
        while let Some(bag) = layer {
            if let Some(value) = bag.values.get(name) {
                return Some(value);
            }
            layer = bag.parent.as_deref();
        }
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Sets an attribute on the top layer. A read-only wire root silently
    /// splits: its words become a parent layer and the write lands in a new
    /// mutable layer on top.
    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) -> Result<(), AttrError> {
        let name = name.into();
        if let Some(vocabulary) = &self.vocabulary {
            if let Some(declared) = vocabulary.find(&name) {
                let actual = value.value_type();
                if actual != declared {
                    return Err(AttrError::TypeMismatch {
                        name,
                        declared,
                        actual,
                    });
                }
            }
        }
        if self.read_only {
            self.split();
        }
        self.values.insert(name, value);
        Ok(())
    }

    fn split(&mut self) {
        let frozen = AttributeBag {
            parent: self.parent.take(),
            values: std::mem::take(&mut self.values),
            referenced: Arc::clone(&self.referenced),
            vocabulary: self.vocabulary.clone(),
            read_only: true,
        };
        self.parent = Some(Arc::new(frozen));
        self.read_only = false;
    }

    /// Deduplicated union of every layer's keys, top layer winning.
    pub fn names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        let mut collect = |values: &HashMap<String, AttributeValue>| {
            for name in values.keys() {
                if seen.insert(name.clone()) {
                    names.push(name.clone());
                }
            }
        };
        collect(&self.values);
        let mut layer = self.parent.as_deref();
        while let Some(bag) = layer {
            collect(&bag.values);
            layer = bag.parent.as_deref();
        }
        names
    }

    /// Flattened view of all layers, top wins. Used by the wire encoder.
    pub fn flatten(&self) -> HashMap<String, AttributeValue> {
        let mut out = HashMap::new();
        let mut layers = vec![&self.values];
        let mut layer = self.parent.as_deref();
        while let Some(bag) = layer {
            layers.push(&bag.values);
            layer = bag.parent.as_deref();
        }
        for values in layers.into_iter().rev() {
            for (name, value) in values {
                out.insert(name.clone(), value.clone());
            }
        }
        out
    }

    /// Pushes a new empty mutable layer over this bag.
    pub fn child(self: &Arc<Self>) -> AttributeBag {
        AttributeBag {
            parent: Some(Arc::clone(self)),
            values: HashMap::new(),
            referenced: Arc::clone(&self.referenced),
            vocabulary: self.vocabulary.clone(),
            read_only: false,
        }
    }

    /// Clears this layer only; parents are untouched.
    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn referenced_attributes(&self) -> Vec<AttributeRef> {
        self.referenced.snapshot()
    }

    pub fn clear_referenced(&self) {
        self.referenced.clear();
    }

    pub fn referenced_set(&self) -> Arc<ReferencedSet> {
        Arc::clone(&self.referenced)
    }

    /// Clears everything, keeping allocated capacity. Pool release path.
    pub(crate) fn reset_for_reuse(&mut self) {
        self.parent = None;
        self.values.clear();
        self.referenced = Arc::new(ReferencedSet::default());
        self.vocabulary = None;
        self.read_only = false;
    }
}
