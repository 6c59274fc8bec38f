//! Coordination-store contract.
//!
//! The engine coordinates exclusively through a hierarchical,
//! sequentially-consistent store with per-node versions, ephemeral nodes,
//! watches, and child enumeration (the ZooKeeper family model). This module
//! defines the semantic contract the engine consumes; [`memory`] provides the
//! in-process reference implementation used by tests and single-node
//! deployments.

pub mod memory;
pub mod paths;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

/// Node creation flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Notifications delivered to registered watchers. Watches are persistent:
/// they keep firing until the receiver is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created(String),
    DataChanged(String),
    Deleted(String),
    ChildCreated { parent: String, child: String },
    ChildDeleted { parent: String, child: String },
}

/// Session status for a connected client. The generation increments every
/// time the session is re-established; ephemeral nodes of the previous
/// generation are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub generation: u64,
    pub connected: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("version conflict at {path}: expected {expected}, actual {actual}")]
    VersionConflict {
        path: String,
        expected: i64,
        actual: i64,
    },
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("session expired")]
    SessionExpired,
    #[error("store disconnected")]
    Disconnected,
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One client connection to the coordination store.
///
/// Implementations retry transient disconnects internally; callers only ever
/// see `Disconnected` when the retry budget is exhausted. Parent nodes are
/// created implicitly on `create`.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Create a node. Sequential modes treat `path` as a prefix and append a
    /// 10-digit, per-parent monotonic counter; the actual path is returned.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<String>;

    /// Read a node's data and current version.
    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, i64)>;

    /// Compare-and-set write; fails with `VersionConflict` unless the node is
    /// still at `expected_version`. Returns the new version.
    async fn set(&self, path: &str, data: Vec<u8>, expected_version: i64) -> StoreResult<i64>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Direct child names of `path`, sorted.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Watch one node for create/data-change/delete. The node need not exist
    /// yet.
    async fn watch_node(&self, path: &str) -> StoreResult<mpsc::UnboundedReceiver<StoreEvent>>;

    /// Watch a node's direct children for creation and deletion.
    async fn watch_children(&self, path: &str)
    -> StoreResult<mpsc::UnboundedReceiver<StoreEvent>>;

    /// Session lifecycle of this client.
    fn session_events(&self) -> watch::Receiver<SessionState>;

    /// Name of the worker instance this client belongs to.
    fn instance_name(&self) -> &str;
}

/// Create the node, or overwrite it if it already exists (last-write-wins).
/// Used for records with at-least-once overwrite semantics.
pub async fn write_overwrite(
    store: &Arc<dyn CoordStore>,
    path: &str,
    data: Vec<u8>,
) -> StoreResult<()> {
    loop {
        match store
            .create(path, data.clone(), CreateMode::Persistent)
            .await
        {
            Ok(_) => return Ok(()),
            Err(StoreError::NodeExists(_)) => {}
            Err(err) => return Err(err),
        }
        let version = match store.get(path).await {
            Ok((_, version)) => version,
            // deleted between create and get; try create again
            Err(StoreError::NotFound(_)) => continue,
            Err(err) => return Err(err),
        };
        match store.set(path, data.clone(), version).await {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::NotFound(_)) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// `children` that treats a missing parent as empty.
pub async fn children_or_empty(store: &Arc<dyn CoordStore>, path: &str) -> StoreResult<Vec<String>> {
    match store.children(path).await {
        Ok(children) => Ok(children),
        Err(StoreError::NotFound(_)) => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}
