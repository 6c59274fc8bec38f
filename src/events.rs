//! Listener interface and watch-driven event fan-out.
//!
//! Listeners observe scheduling and completion milestones. The fan-out is
//! driven entirely by store watches, so it sees events from every instance in
//! the cluster, not just the local one. Callbacks run on the fan-out task:
//! keep them fast and non-blocking.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, StreamMap, wrappers::UnboundedReceiverStream};
use tracing::{error, warn};

use crate::ids::{RunId, TaskId};
use crate::manager::WorkflowHandle;
use crate::models::{RunnableTask, TaskExecutionResult};
use crate::serializer::{self, RecordKind};
use crate::store::{CoordStore, StoreError, StoreEvent, children_or_empty, paths};

/// Callbacks for run/task milestones. All methods default to no-ops so
/// implementations override only what they need.
pub trait WorkflowListener: Send + Sync {
    fn on_run_started(&self, _run_id: &RunId) {}
    fn on_task_started(&self, _run_id: &RunId, _task_id: &TaskId) {}
    fn on_task_completed(
        &self,
        _run_id: &RunId,
        _task_id: &TaskId,
        _result: &TaskExecutionResult,
    ) {
    }
    fn on_run_completed(&self, _run_id: &RunId) {}
}

type Listeners = Arc<Mutex<Vec<Arc<dyn WorkflowListener>>>>;

/// Watches the store and fans events out to registered listeners.
pub struct WorkflowListenerManager {
    handle: WorkflowHandle,
    listeners: Listeners,
    worker: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl WorkflowListenerManager {
    pub fn new(handle: WorkflowHandle) -> Self {
        Self {
            handle,
            listeners: Arc::new(Mutex::new(Vec::new())),
            worker: None,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn WorkflowListener>) {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .push(listener);
    }

    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = FanoutTask {
            store: self.handle.store().clone(),
            listeners: self.listeners.clone(),
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        self.worker = Some((shutdown_tx, handle));
    }

    pub async fn shutdown(&mut self) {
        if let Some((shutdown_tx, handle)) = self.worker.take() {
            let _ = shutdown_tx.send(true);
            if let Err(err) = handle.await {
                error!(?err, "listener fan-out task panicked");
            }
        }
    }
}

struct FanoutTask {
    store: Arc<dyn CoordStore>,
    listeners: Listeners,
    shutdown_rx: watch::Receiver<bool>,
}

impl FanoutTask {
    async fn run(mut self) {
        let mut runs_rx = match self.store.watch_children(paths::RUNS_PARENT).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(?err, "failed to watch runs, listener fan-out exiting");
                return;
            }
        };
        let mut started_rx = match self.store.watch_children(paths::STARTED_TASKS_PARENT).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(?err, "failed to watch started tasks, listener fan-out exiting");
                return;
            }
        };
        let mut completed_rx = match self
            .store
            .watch_children(paths::COMPLETED_TASKS_PARENT)
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                error!(?err, "failed to watch completions, listener fan-out exiting");
                return;
            }
        };

        let mut run_watches: StreamMap<RunId, UnboundedReceiverStream<StoreEvent>> =
            StreamMap::new();
        let mut watched: HashSet<RunId> = HashSet::new();
        let mut completed_runs: HashSet<RunId> = HashSet::new();

        // pre-existing runs are watched for completion but get no started
        // callback
        match children_or_empty(&self.store, paths::RUNS_PARENT).await {
            Ok(children) => {
                for child in children {
                    let run_id = RunId::from(child);
                    self.ensure_run_watch(&run_id, &mut run_watches, &mut watched)
                        .await;
                }
            }
            Err(err) => warn!(?err, "failed to enumerate existing runs"),
        }

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return;
                    }
                }
                Some(event) = runs_rx.recv() => {
                    match event {
                        StoreEvent::ChildCreated { child, .. } => {
                            let run_id = RunId::from(child);
                            self.notify(|listener| listener.on_run_started(&run_id));
                            self.ensure_run_watch(&run_id, &mut run_watches, &mut watched).await;
                        }
                        StoreEvent::ChildDeleted { child, .. } => {
                            let run_id = RunId::from(child);
                            if watched.remove(&run_id) {
                                run_watches.remove(&run_id);
                            }
                            completed_runs.remove(&run_id);
                        }
                        _ => {}
                    }
                }
                Some(event) = started_rx.recv() => {
                    if let StoreEvent::ChildCreated { child, .. } = event
                        && let Some((run_id, task_id)) = paths::split_run_task(&child)
                    {
                        self.notify(|listener| listener.on_task_started(&run_id, &task_id));
                    }
                }
                Some(event) = completed_rx.recv() => {
                    if let StoreEvent::ChildCreated { child, .. } = event
                        && let Some((run_id, task_id)) = paths::split_run_task(&child)
                        && let Some(result) = self.read_result(&child).await
                    {
                        self.notify(|listener| {
                            listener.on_task_completed(&run_id, &task_id, &result)
                        });
                    }
                }
                Some((run_id, event)) = run_watches.next() => {
                    if matches!(event, StoreEvent::DataChanged(_) | StoreEvent::Created(_))
                        && !completed_runs.contains(&run_id)
                        && self.run_is_complete(&run_id).await
                    {
                        completed_runs.insert(run_id.clone());
                        self.notify(|listener| listener.on_run_completed(&run_id));
                    }
                }
            }
        }
    }

    async fn ensure_run_watch(
        &self,
        run_id: &RunId,
        run_watches: &mut StreamMap<RunId, UnboundedReceiverStream<StoreEvent>>,
        watched: &mut HashSet<RunId>,
    ) {
        if watched.contains(run_id) {
            return;
        }
        match self.store.watch_node(&paths::run_path(run_id)).await {
            Ok(rx) => {
                run_watches.insert(run_id.clone(), UnboundedReceiverStream::new(rx));
                watched.insert(run_id.clone());
            }
            Err(err) => warn!(run_id = %run_id, ?err, "failed to watch run record"),
        }
    }

    async fn run_is_complete(&self, run_id: &RunId) -> bool {
        let bytes = match self.store.get(&paths::run_path(run_id)).await {
            Ok((bytes, _)) => bytes,
            Err(StoreError::NotFound(_)) => return false,
            Err(err) => {
                warn!(run_id = %run_id, ?err, "failed to read run record");
                return false;
            }
        };
        match serializer::from_bytes::<RunnableTask>(RecordKind::RunnableTask, &bytes) {
            Ok(run) => run.is_complete(),
            Err(err) => {
                warn!(run_id = %run_id, ?err, "failed to decode run record");
                false
            }
        }
    }

    async fn read_result(&self, child: &str) -> Option<TaskExecutionResult> {
        let path = format!("{}/{child}", paths::COMPLETED_TASKS_PARENT);
        let bytes = match self.store.get(&path).await {
            Ok((bytes, _)) => bytes,
            // deleted in the interim
            Err(StoreError::NotFound(_)) => return None,
            Err(err) => {
                warn!(?err, "failed to read task result");
                return None;
            }
        };
        match serializer::from_bytes(RecordKind::TaskExecutionResult, &bytes) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(?err, "failed to decode task result");
                None
            }
        }
    }

    fn notify(&self, callback: impl Fn(&dyn WorkflowListener)) {
        let listeners = self
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .clone();
        for listener in listeners {
            callback(listener.as_ref());
        }
    }
}
