//! In-memory coordination store.
//!
//! A single shared node tree with per-client sessions. Ephemeral nodes are
//! bound to their creator's session and removed when it expires; expiry also
//! re-establishes the session with a bumped generation, mirroring the
//! auto-reconnect behavior of production store clients. Tests use
//! [`MemoryStore::expire_session`] to exercise failover paths.
//!
//! The tree is guarded by a std `Mutex` that is never held across an await.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::{
    CoordStore, CreateMode, SessionState, StoreError, StoreEvent, StoreResult, paths,
};

struct Node {
    data: Vec<u8>,
    version: i64,
    ephemeral_owner: Option<u64>,
    child_counter: u64,
}

impl Node {
    fn persistent(data: Vec<u8>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner: None,
            child_counter: 0,
        }
    }
}

#[derive(Default)]
struct Shared {
    nodes: BTreeMap<String, Node>,
    node_watchers: HashMap<String, Vec<mpsc::UnboundedSender<StoreEvent>>>,
    child_watchers: HashMap<String, Vec<mpsc::UnboundedSender<StoreEvent>>>,
    session_ephemerals: HashMap<u64, HashSet<String>>,
    next_session: u64,
}

impl Shared {
    fn alloc_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    fn notify_node(&mut self, path: &str, event: StoreEvent) {
        if let Some(watchers) = self.node_watchers.get_mut(path) {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn notify_children(&mut self, parent: &str, event: StoreEvent) {
        if let Some(watchers) = self.child_watchers.get_mut(parent) {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{path}/");
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .next()
            .is_some()
    }

    /// Insert missing ancestors as persistent nodes. Implicit parents do not
    /// fire watch events.
    fn ensure_parents(&mut self, parent: &str) {
        let mut accumulated = String::new();
        for segment in parent.split('/').filter(|s| !s.is_empty()) {
            accumulated.push('/');
            accumulated.push_str(segment);
            self.nodes
                .entry(accumulated.clone())
                .or_insert_with(|| Node::persistent(Vec::new()));
        }
    }

    fn remove_node(&mut self, path: &str) {
        if let Some(node) = self.nodes.remove(path) {
            if let Some(session) = node.ephemeral_owner
                && let Some(owned) = self.session_ephemerals.get_mut(&session)
            {
                owned.remove(path);
            }
            self.notify_node(path, StoreEvent::Deleted(path.to_string()));
            if let Some(parent) = parent_of(path) {
                let child = paths::child_name(path).to_string();
                self.notify_children(
                    &parent,
                    StoreEvent::ChildDeleted {
                        parent: parent.clone(),
                        child,
                    },
                );
            }
        }
    }
}

fn parent_of(path: &str) -> Option<String> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        // children of the root are their own parents' leaves; no watchable root
        return None;
    }
    Some(path[..idx].to_string())
}

fn validate_path(path: &str) -> StoreResult<()> {
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(StoreError::Other(format!("malformed path: {path}")));
    }
    Ok(())
}

/// Shared in-process store; [`connect`](MemoryStore::connect) hands out one
/// client (and session) per worker instance.
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let mut shared = Shared::default();
        for root in [
            paths::RUNS_PARENT,
            paths::STARTED_TASKS_PARENT,
            paths::COMPLETED_TASKS_PARENT,
            paths::QUEUES_PARENT,
            paths::SCHEDULER_LEADER_PATH,
        ] {
            shared
                .nodes
                .insert(root.to_string(), Node::persistent(Vec::new()));
        }
        Arc::new(Self {
            shared: Arc::new(Mutex::new(shared)),
        })
    }

    pub fn connect(self: &Arc<Self>, instance_name: impl Into<String>) -> Arc<MemoryClient> {
        let session = self.shared.lock().expect("store lock poisoned").alloc_session();
        let (session_tx, _) = watch::channel(SessionState {
            generation: 1,
            connected: true,
        });
        Arc::new(MemoryClient {
            shared: Arc::clone(&self.shared),
            instance_name: instance_name.into(),
            session: Mutex::new(session),
            session_tx,
        })
    }

    /// Kill the client's session: its ephemerals vanish (firing watches) and
    /// a fresh session is established with a bumped generation.
    pub fn expire_session(&self, client: &MemoryClient) {
        client.expire();
    }
}

/// One connected client; implements [`CoordStore`].
pub struct MemoryClient {
    shared: Arc<Mutex<Shared>>,
    instance_name: String,
    session: Mutex<u64>,
    session_tx: watch::Sender<SessionState>,
}

impl MemoryClient {
    fn current_session(&self) -> u64 {
        *self.session.lock().expect("session lock poisoned")
    }

    fn expire(&self) {
        let orphaned = {
            let mut shared = self.shared.lock().expect("store lock poisoned");
            let mut session = self.session.lock().expect("session lock poisoned");
            let orphaned: Vec<String> = shared
                .session_ephemerals
                .remove(&*session)
                .into_iter()
                .flatten()
                .collect();
            *session = shared.alloc_session();
            for path in &orphaned {
                shared.remove_node(path);
            }
            orphaned
        };
        tracing::debug!(
            instance = %self.instance_name,
            ephemerals = orphaned.len(),
            "session expired"
        );
        self.session_tx.send_modify(|state| {
            state.generation += 1;
            state.connected = true;
        });
    }
}

#[async_trait]
impl CoordStore for MemoryClient {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String> {
        validate_path(path)?;
        let session = self.current_session();
        let mut shared = self.shared.lock().expect("store lock poisoned");

        let final_path = if mode.is_sequential() {
            let parent = parent_of(path)
                .ok_or_else(|| StoreError::Other(format!("sequential node at root: {path}")))?;
            shared.ensure_parents(&parent);
            let counter = {
                let node = shared.nodes.get_mut(&parent).expect("parent just ensured");
                let counter = node.child_counter;
                node.child_counter += 1;
                counter
            };
            format!("{path}{counter:010}")
        } else {
            if shared.nodes.contains_key(path) {
                return Err(StoreError::NodeExists(path.to_string()));
            }
            if let Some(parent) = parent_of(path) {
                shared.ensure_parents(&parent);
            }
            path.to_string()
        };

        let ephemeral_owner = mode.is_ephemeral().then_some(session);
        shared.nodes.insert(
            final_path.clone(),
            Node {
                data,
                version: 0,
                ephemeral_owner,
                child_counter: 0,
            },
        );
        if ephemeral_owner.is_some() {
            shared
                .session_ephemerals
                .entry(session)
                .or_default()
                .insert(final_path.clone());
        }

        shared.notify_node(&final_path, StoreEvent::Created(final_path.clone()));
        if let Some(parent) = parent_of(&final_path) {
            let child = paths::child_name(&final_path).to_string();
            shared.notify_children(
                &parent,
                StoreEvent::ChildCreated {
                    parent: parent.clone(),
                    child,
                },
            );
        }
        Ok(final_path)
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, i64)> {
        let shared = self.shared.lock().expect("store lock poisoned");
        let node = shared
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok((node.data.clone(), node.version))
    }

    async fn set(&self, path: &str, data: Vec<u8>, expected_version: i64) -> StoreResult<i64> {
        let mut shared = self.shared.lock().expect("store lock poisoned");
        let node = shared
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if node.version != expected_version {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: expected_version,
                actual: node.version,
            });
        }
        node.data = data;
        node.version += 1;
        let version = node.version;
        shared.notify_node(path, StoreEvent::DataChanged(path.to_string()));
        Ok(version)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let mut shared = self.shared.lock().expect("store lock poisoned");
        if !shared.nodes.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if shared.has_children(path) {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        shared.remove_node(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        let shared = self.shared.lock().expect("store lock poisoned");
        if !shared.nodes.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let prefix = format!("{path}/");
        let children = shared
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(children)
    }

    async fn watch_node(&self, path: &str) -> StoreResult<mpsc::UnboundedReceiver<StoreEvent>> {
        validate_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .lock()
            .expect("store lock poisoned")
            .node_watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> StoreResult<mpsc::UnboundedReceiver<StoreEvent>> {
        validate_path(path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .lock()
            .expect("store lock poisoned")
            .child_watchers
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    fn session_events(&self) -> watch::Receiver<SessionState> {
        self.session_tx.subscribe()
    }

    fn instance_name(&self) -> &str {
        &self.instance_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_overwrite;

    fn client() -> (Arc<MemoryStore>, Arc<MemoryClient>) {
        let store = MemoryStore::new();
        let client = store.connect("test-instance");
        (store, client)
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let (_, client) = client();
        client
            .create("/runs/r1", b"payload".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let (data, version) = client.get("/runs/r1").await.unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (_, client) = client();
        client
            .create("/runs/r1", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let err = client
            .create("/runs/r1", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NodeExists(_)));
    }

    #[tokio::test]
    async fn set_is_compare_and_swap() {
        let (_, client) = client();
        client
            .create("/runs/r1", b"a".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();
        let version = client.set("/runs/r1", b"b".to_vec(), 0).await.unwrap();
        assert_eq!(version, 1);

        let err = client.set("/runs/r1", b"c".to_vec(), 0).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn sequential_names_are_monotonic_and_sorted() {
        let (_, client) = client();
        let first = client
            .create("/queues/t|1/items/task-", Vec::new(), CreateMode::PersistentSequential)
            .await
            .unwrap();
        let second = client
            .create("/queues/t|1/items/task-", Vec::new(), CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert!(first < second);

        let children = client.children("/queues/t|1/items").await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0], paths::child_name(&first));
    }

    #[tokio::test]
    async fn expired_session_drops_ephemerals_and_fires_watches() {
        let (store, client) = client();
        let mut watch = client.watch_children("/scheduler-leader").await.unwrap();
        let path = client
            .create(
                "/scheduler-leader/member-",
                Vec::new(),
                CreateMode::EphemeralSequential,
            )
            .await
            .unwrap();
        assert!(matches!(
            watch.recv().await,
            Some(StoreEvent::ChildCreated { .. })
        ));

        let generation = client.session_events().borrow().generation;
        store.expire_session(&client);

        assert!(client.get(&path).await.unwrap_err().is_not_found());
        assert!(matches!(
            watch.recv().await,
            Some(StoreEvent::ChildDeleted { .. })
        ));
        assert!(client.session_events().borrow().generation > generation);
    }

    #[tokio::test]
    async fn persistent_nodes_survive_expiry() {
        let (store, client) = client();
        client
            .create("/runs/r1", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        store.expire_session(&client);
        assert!(client.get("/runs/r1").await.is_ok());
    }

    #[tokio::test]
    async fn delete_requires_empty_node() {
        let (_, client) = client();
        client
            .create("/queues/t|1/items/a", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let err = client.delete("/queues/t|1/items").await.unwrap_err();
        assert!(matches!(err, StoreError::NotEmpty(_)));

        client.delete("/queues/t|1/items/a").await.unwrap();
        client.delete("/queues/t|1/items").await.unwrap();
    }

    #[tokio::test]
    async fn write_overwrite_creates_then_replaces() {
        let (_, client) = client();
        let store: Arc<dyn CoordStore> = client;
        write_overwrite(&store, "/started-tasks/r|t", b"one".to_vec())
            .await
            .unwrap();
        write_overwrite(&store, "/started-tasks/r|t", b"two".to_vec())
            .await
            .unwrap();
        let (data, version) = store.get("/started-tasks/r|t").await.unwrap();
        assert_eq!(data, b"two");
        assert_eq!(version, 1);
    }
}
