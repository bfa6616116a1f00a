use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::ConfigError;
use crate::resource::ResourceKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Update,
    Delete,
}

/// One change observed by the backend. `spec` is present for updates and
/// absent for deletes.
#[derive(Clone, Debug)]
pub struct StoreEvent {
    pub key: ResourceKey,
    pub change: ChangeType,
    pub spec: Option<serde_json::Value>,
}

impl StoreEvent {
    pub fn update(key: ResourceKey, spec: serde_json::Value) -> Self {
        Self {
            key,
            change: ChangeType::Update,
            spec: Some(spec),
        }
    }

    pub fn delete(key: ResourceKey) -> Self {
        Self {
            key,
            change: ChangeType::Delete,
            spec: None,
        }
    }
}

/// Typeless storage backend contract. Events are delivered in arrival order
/// to a single subscriber; a slow subscriber backpressures the poller.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Registers the kinds of interest and starts the background poll.
    /// `watch` must be called first if the initial snapshot should be
    /// delivered as events.
    async fn init(&self, kinds: Vec<String>) -> Result<(), ConfigError>;

    /// Creates the event channel. One subscriber only; a second call
    /// replaces the first.
    fn watch(&self) -> mpsc::Receiver<StoreEvent>;

    fn get(&self, key: &ResourceKey) -> Result<serde_json::Value, ConfigError>;

    fn list(&self) -> HashMap<ResourceKey, serde_json::Value>;
}
