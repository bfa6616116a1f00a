use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::ConfigError;
use crate::resource::{parse_file, Resource, ResourceKey};
use crate::store::{StoreBackend, StoreEvent};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Filesystem-backed config store. Walks a directory of `---`-separated
/// YAML documents on a fixed tick, diffs by content hash, and emits
/// update/delete events on the watch channel.
pub struct FsBackend {
    root: PathBuf,
    poll_interval: Duration,
    state: Arc<State>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    kinds: Mutex<HashSet<String>>,
    data: Mutex<HashMap<ResourceKey, Resource>>,
    events: Mutex<Option<mpsc::Sender<StoreEvent>>>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            state: Arc::new(State {
                kinds: Mutex::new(HashSet::new()),
                data: Mutex::new(HashMap::new()),
                events: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// One diff cycle: scan, compare, publish. The background worker calls
    /// this on every tick; tests drive it directly for determinism.
    pub async fn poll_once(&self) {
        Self::check_and_update(&self.root, &self.state).await;
    }

    async fn check_and_update(root: &Path, state: &State) {
        let (mut fresh, poisoned) = {
            let kinds = state.kinds.lock().clone();
            read_tree(root, &kinds)
        };

        let mut updated: Vec<ResourceKey> = Vec::new();
        let mut removed: Vec<ResourceKey> = Vec::new();
        {
            let mut data = state.data.lock();
            for (key, resource) in &fresh {
                match data.get(key) {
                    Some(existing) if existing.hash == resource.hash => {}
                    _ => updated.push(key.clone()),
                }
            }
            for (key, resource) in data.iter() {
                if fresh.contains_key(key) {
                    continue;
                }
                if poisoned.contains(&resource.source) {
                    // the file still exists but no longer parses; a broken
                    // document must not turn into a delete
                    fresh.insert(key.clone(), resource.clone());
                } else {
                    removed.push(key.clone());
                }
            }
            if updated.is_empty() && removed.is_empty() {
                return;
            }
            *data = fresh;
        }
        updated.sort();
        removed.sort();

        let sender = state.events.lock().clone();
        let Some(sender) = sender else { return };
        let mut events = Vec::with_capacity(updated.len() + removed.len());
        for key in updated {
            let spec = state.data.lock().get(&key).map(|r| r.spec.clone());
            if let Some(spec) = spec {
                events.push(StoreEvent::update(key, spec));
            }
        }
        for key in removed {
            events.push(StoreEvent::delete(key));
        }
        for event in events {
            debug!(key = %event.key, change = ?event.change, "config event");
            if sender.send(event).await.is_err() {
                // subscriber went away; stop publishing this cycle
                return;
            }
        }
    }

    /// Stops the background poller. Dropping the backend does the same.
    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for FsBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl StoreBackend for FsBackend {
    async fn init(&self, kinds: Vec<String>) -> Result<(), ConfigError> {
        if !self.root.exists() {
            return Err(ConfigError::Io(format!(
                "config root {} does not exist",
                self.root.display()
            )));
        }
        *self.state.kinds.lock() = kinds.into_iter().collect();
        self.poll_once().await;

        let state = Arc::clone(&self.state);
        let root = self.root.clone();
        let interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                Self::check_and_update(&root, &state).await;
            }
        });
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn watch(&self) -> mpsc::Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.state.events.lock() = Some(tx);
        rx
    }

    fn get(&self, key: &ResourceKey) -> Result<serde_json::Value, ConfigError> {
        self.state
            .data
            .lock()
            .get(key)
            .map(|r| r.spec.clone())
            .ok_or(ConfigError::NotFound)
    }

    fn list(&self) -> HashMap<ResourceKey, serde_json::Value> {
        self.state
            .data
            .lock()
            .iter()
            .map(|(k, r)| (k.clone(), r.spec.clone()))
            .collect()
    }
}

fn read_tree(
    root: &Path,
    kinds: &HashSet<String>,
) -> (HashMap<ResourceKey, Resource>, HashSet<String>) {
    let mut out = HashMap::new();
    let mut poisoned = HashSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("failed to read {}: {err}", dir.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let supported = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !supported {
                continue;
            }
            let label = path.display().to_string();
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!("failed to read {label}: {err}");
                    poisoned.insert(label);
                    continue;
                }
            };
            let (resources, failures) = parse_file(&label, &content);
            if failures > 0 {
                poisoned.insert(label);
            }
            for resource in resources {
                if !kinds.contains(&resource.key.kind) {
                    continue;
                }
                out.insert(resource.key.clone(), resource);
            }
        }
    }
    (out, poisoned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeType;
    use std::time::Duration;

    const HANDLER: &str = "\
kind: handler
apiVersion: config.telemesh.io/v1
metadata:
  namespace: ns
  name: h1
spec:
  adapter: denier
";

    const RULE: &str = "\
kind: rule
apiVersion: config.telemesh.io/v1
metadata:
  namespace: ns
  name: r1
spec:
  actions: []
";

    async fn recv(rx: &mut mpsc::Receiver<StoreEvent>) -> StoreEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    fn backend(root: &Path) -> FsBackend {
        // long interval; tests drive polls explicitly
        FsBackend::new(root).with_poll_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn reload_cycle_emits_expected_events() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let mut rx = backend.watch();
        backend
            .init(vec!["handler".to_string(), "rule".to_string()])
            .await
            .unwrap();

        // two resources appear
        std::fs::write(dir.path().join("h1.yaml"), HANDLER).unwrap();
        std::fs::write(dir.path().join("r1.yaml"), RULE).unwrap();
        backend.poll_once().await;

        let mut first = vec![recv(&mut rx).await, recv(&mut rx).await];
        first.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(first[0].key, ResourceKey::new("handler", "ns", "h1"));
        assert_eq!(first[1].key, ResourceKey::new("rule", "ns", "r1"));
        assert!(first.iter().all(|e| e.change == ChangeType::Update));

        let hash_before = {
            let data = backend.state.data.lock();
            data[&ResourceKey::new("rule", "ns", "r1")].hash
        };

        // rewrite one with a different spec; the other is untouched
        std::fs::write(
            dir.path().join("h1.yaml"),
            HANDLER.replace("denier", "noop"),
        )
        .unwrap();
        backend.poll_once().await;

        let changed = recv(&mut rx).await;
        assert_eq!(changed.key, ResourceKey::new("handler", "ns", "h1"));
        assert_eq!(changed.change, ChangeType::Update);
        assert_eq!(changed.spec.as_ref().unwrap()["adapter"], "noop");

        let hash_after = {
            let data = backend.state.data.lock();
            data[&ResourceKey::new("rule", "ns", "r1")].hash
        };
        assert_eq!(hash_before, hash_after, "unchanged resource keeps its hash");

        // delete the rewritten file
        std::fs::remove_file(dir.path().join("h1.yaml")).unwrap();
        backend.poll_once().await;

        let deleted = recv(&mut rx).await;
        assert_eq!(deleted.key, ResourceKey::new("handler", "ns", "h1"));
        assert_eq!(deleted.change, ChangeType::Delete);
        assert!(deleted.spec.is_none());
    }

    #[tokio::test]
    async fn unchanged_files_emit_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("h1.yaml"), HANDLER).unwrap();

        let backend = backend(dir.path());
        let mut rx = backend.watch();
        backend.init(vec!["handler".to_string()]).await.unwrap();

        let _ = recv(&mut rx).await;
        backend.poll_once().await;
        backend.poll_once().await;
        assert!(
            rx.try_recv().is_err(),
            "stable tree must not produce events"
        );
    }

    #[tokio::test]
    async fn unrequested_kinds_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("r1.yaml"), RULE).unwrap();

        let backend = backend(dir.path());
        let mut rx = backend.watch();
        backend.init(vec!["handler".to_string()]).await.unwrap();

        backend.poll_once().await;
        assert!(rx.try_recv().is_err());
        assert!(backend.list().is_empty());
    }

    #[tokio::test]
    async fn broken_document_is_skipped_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("h1.yaml"), HANDLER).unwrap();

        let backend = backend(dir.path());
        let mut rx = backend.watch();
        backend.init(vec!["handler".to_string()]).await.unwrap();
        let _ = recv(&mut rx).await;

        // malformed yaml: parse failure must not turn into a delete
        std::fs::write(dir.path().join("h1.yaml"), "kind: [unclosed\n").unwrap();
        backend.poll_once().await;

        assert!(rx.try_recv().is_err(), "no delete for a broken document");
        let key = ResourceKey::new("handler", "ns", "h1");
        assert!(backend.get(&key).is_ok(), "previous resource is retained");
    }

    #[tokio::test]
    async fn get_and_list_reflect_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("h1.yaml"), HANDLER).unwrap();

        let backend = backend(dir.path());
        backend.init(vec!["handler".to_string()]).await.unwrap();

        let key = ResourceKey::new("handler", "ns", "h1");
        assert_eq!(backend.get(&key).unwrap()["adapter"], "denier");
        assert_eq!(backend.list().len(), 1);
        assert!(backend
            .get(&ResourceKey::new("handler", "ns", "missing"))
            .is_err());
    }
}
