//! Durable task queues and their consumers.
//!
//! One FIFO queue per task type, built on the coordination store: items are
//! persistent-sequential children under `items/`, and consumers claim an item
//! with an ephemeral lock node under `locks/` before working it. Delivery is
//! at-least-once; a consumer that dies mid-execution releases its claim with
//! its session and the item is redelivered.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::ids::{RunId, TaskId};
use crate::manager::WorkflowHandle;
use crate::models::{ExecutableTask, StartedTask, TaskExecutionResult, TaskType};
use crate::serializer::{self, RecordKind};
use crate::store::{CoordStore, CreateMode, StoreError, paths, write_overwrite};

/// User-provided task executor. One implementation per task type; invoked by
/// queue consumers with a store-access capability so executors can submit
/// sub-task runs and read results.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, workflow: WorkflowHandle, task: ExecutableTask) -> TaskExecutionResult;
}

/// Declares the executor and consumer-slot count for one task type.
#[derive(Clone)]
pub struct TaskExecutorSpec {
    pub task_type: TaskType,
    pub executor: Arc<dyn TaskExecutor>,
    pub concurrency: usize,
}

impl TaskExecutorSpec {
    pub fn new(task_type: TaskType, executor: Arc<dyn TaskExecutor>, concurrency: usize) -> Self {
        Self {
            task_type,
            executor,
            concurrency: concurrency.max(1),
        }
    }
}

/// Producer side of one task type's queue.
pub struct TaskQueue {
    store: Arc<dyn CoordStore>,
    items_path: String,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn CoordStore>, task_type: &TaskType) -> Self {
        Self {
            items_path: paths::queue_items_path(task_type),
            store,
        }
    }

    /// Durable enqueue. Safe to call again for the same task: the consumer's
    /// duplicate-completion check makes redelivery a no-op against progress.
    pub async fn put(&self, task: &ExecutableTask) -> anyhow::Result<()> {
        let bytes = serializer::to_bytes(RecordKind::ExecutableTask, task)?;
        self.store
            .create(
                &format!("{}/task-", self.items_path),
                bytes,
                CreateMode::PersistentSequential,
            )
            .await?;
        debug!(
            run_id = %task.run_id,
            task_id = %task.task_id,
            "enqueued task"
        );
        Ok(())
    }
}

/// Executor panicked; the slot stops and leaves its claim in place.
struct SlotPoisoned;

/// One consumer slot for one task type. Runs as a background task until
/// shutdown or executor panic.
pub struct QueueConsumer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueConsumer {
    pub fn start(
        task_type: TaskType,
        slot: usize,
        executor: Arc<dyn TaskExecutor>,
        workflow: WorkflowHandle,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = ConsumerTask {
            store: workflow.store().clone(),
            items_path: paths::queue_items_path(&task_type),
            locks_path: paths::queue_locks_path(&task_type),
            label: format!("{}#{slot}", task_type.queue_name()),
            executor,
            workflow,
            poll_interval,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.trigger_shutdown();
        if let Err(err) = self.handle.await {
            error!(?err, "queue consumer task panicked");
        }
    }
}

struct ConsumerTask {
    store: Arc<dyn CoordStore>,
    items_path: String,
    locks_path: String,
    label: String,
    executor: Arc<dyn TaskExecutor>,
    workflow: WorkflowHandle,
    poll_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConsumerTask {
    async fn run(mut self) {
        let mut items_rx = match self.store.watch_children(&self.items_path).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(consumer = %self.label, ?err, "failed to watch queue, consumer exiting");
                return;
            }
        };
        info!(consumer = %self.label, "queue consumer started");

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.drain().await {
                Ok(()) => {}
                Err(SlotPoisoned) => {
                    error!(consumer = %self.label, "consumer slot stopped after executor panic");
                    return;
                }
            }
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = items_rx.recv() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }
        info!(consumer = %self.label, "queue consumer stopped");
    }

    /// Work every currently visible item in sequence order.
    async fn drain(&mut self) -> Result<(), SlotPoisoned> {
        let items = match self.store.children(&self.items_path).await {
            Ok(items) => items,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(err) => {
                metrics::counter!("belay_queue_errors_total").increment(1);
                warn!(consumer = %self.label, ?err, "failed to list queue items");
                return Ok(());
            }
        };
        for item in items {
            if *self.shutdown_rx.borrow() || !self.workflow.is_started() {
                return Ok(());
            }
            self.process_item(&item).await?;
        }
        Ok(())
    }

    async fn process_item(&self, item: &str) -> Result<(), SlotPoisoned> {
        let lock_path = format!("{}/{item}", self.locks_path);
        let item_path = format!("{}/{item}", self.items_path);

        match self
            .store
            .create(
                &lock_path,
                self.workflow.instance_name().as_bytes().to_vec(),
                CreateMode::Ephemeral,
            )
            .await
        {
            Ok(_) => {}
            // another slot owns it
            Err(StoreError::NodeExists(_)) => return Ok(()),
            Err(err) => {
                metrics::counter!("belay_queue_errors_total").increment(1);
                warn!(consumer = %self.label, ?err, "failed to claim queue item");
                return Ok(());
            }
        }

        let task: ExecutableTask = match self.store.get(&item_path).await {
            Ok((bytes, _)) => match serializer::from_bytes(RecordKind::ExecutableTask, &bytes) {
                Ok(task) => task,
                Err(err) => {
                    warn!(consumer = %self.label, ?err, "dropping undecodable queue item");
                    self.discard(&item_path, &lock_path).await;
                    return Ok(());
                }
            },
            // consumed elsewhere in the meantime
            Err(StoreError::NotFound(_)) => {
                self.release(&lock_path).await;
                return Ok(());
            }
            Err(err) => {
                metrics::counter!("belay_queue_errors_total").increment(1);
                warn!(consumer = %self.label, ?err, "failed to read queue item, releasing claim");
                self.release(&lock_path).await;
                return Ok(());
            }
        };

        // a task whose run was cleaned is dropped without executing
        match self.store.get(&paths::run_path(&task.run_id)).await {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                debug!(
                    consumer = %self.label,
                    run_id = %task.run_id,
                    task_id = %task.task_id,
                    "run no longer exists, discarding task"
                );
                self.discard(&item_path, &lock_path).await;
                return Ok(());
            }
            Err(err) => {
                metrics::counter!("belay_queue_errors_total").increment(1);
                warn!(consumer = %self.label, ?err, "failed to check run, releasing claim");
                self.release(&lock_path).await;
                return Ok(());
            }
        }

        if let Err(err) = self.write_started(&task).await {
            metrics::counter!("belay_queue_errors_total").increment(1);
            warn!(consumer = %self.label, ?err, "failed to record started task, releasing claim");
            self.release(&lock_path).await;
            return Ok(());
        }

        info!(
            consumer = %self.label,
            run_id = %task.run_id,
            task_id = %task.task_id,
            "executing task"
        );
        let execution = self
            .executor
            .execute(self.workflow.clone(), task.clone());
        let result = match AssertUnwindSafe(execution).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    consumer = %self.label,
                    run_id = %task.run_id,
                    task_id = %task.task_id,
                    "executor panicked"
                );
                return Err(SlotPoisoned);
            }
        };

        self.write_completed(&task.run_id, &task.task_id, &result)
            .await;
        self.discard(&item_path, &lock_path).await;
        Ok(())
    }

    async fn write_started(&self, task: &ExecutableTask) -> anyhow::Result<()> {
        let started = StartedTask {
            instance_name: self.workflow.instance_name().to_string(),
            start_date_utc: chrono::Utc::now(),
        };
        let bytes = serializer::to_bytes(RecordKind::StartedTask, &started)?;
        write_overwrite(
            &self.store,
            &paths::started_task_path(&task.run_id, &task.task_id),
            bytes,
        )
        .await?;
        Ok(())
    }

    /// Create-if-absent; a duplicate redelivery finds the node present and
    /// its result is dropped.
    async fn write_completed(&self, run_id: &RunId, task_id: &TaskId, result: &TaskExecutionResult) {
        let bytes = match serializer::to_bytes(RecordKind::TaskExecutionResult, result) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(consumer = %self.label, ?err, "failed to encode task result");
                return;
            }
        };
        match self
            .store
            .create(
                &paths::completed_task_path(run_id, task_id),
                bytes,
                CreateMode::Persistent,
            )
            .await
        {
            Ok(_) => {
                debug!(
                    consumer = %self.label,
                    run_id = %run_id,
                    task_id = %task_id,
                    "recorded task completion"
                );
            }
            Err(StoreError::NodeExists(_)) => {
                debug!(
                    consumer = %self.label,
                    run_id = %run_id,
                    task_id = %task_id,
                    "duplicate task result discarded"
                );
            }
            Err(err) => {
                metrics::counter!("belay_queue_errors_total").increment(1);
                error!(consumer = %self.label, ?err, "failed to record task completion");
            }
        }
    }

    async fn discard(&self, item_path: &str, lock_path: &str) {
        for path in [item_path, lock_path] {
            match self.store.delete(path).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => {
                    warn!(consumer = %self.label, path, ?err, "failed to remove queue node");
                }
            }
        }
    }

    async fn release(&self, lock_path: &str) {
        match self.store.delete(lock_path).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(err) => {
                warn!(consumer = %self.label, ?err, "failed to release queue claim");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn task(run_id: &RunId, id: &str) -> ExecutableTask {
        ExecutableTask {
            run_id: run_id.clone(),
            task_id: TaskId::from(id),
            task_type: TaskType::new("t1", "1"),
            metadata: Default::default(),
            is_executable: true,
        }
    }

    #[tokio::test]
    async fn put_preserves_fifo_order() {
        let store = MemoryStore::new();
        let client: Arc<dyn CoordStore> = store.connect("producer");
        let queue = TaskQueue::new(client.clone(), &TaskType::new("t1", "1"));

        let run_id = RunId::new();
        for name in ["first", "second", "third"] {
            queue.put(&task(&run_id, name)).await.unwrap();
        }

        let items_path = paths::queue_items_path(&TaskType::new("t1", "1"));
        let children = client.children(&items_path).await.unwrap();
        assert_eq!(children.len(), 3);

        let order: Vec<String> = {
            let mut decoded = Vec::new();
            for child in &children {
                let (bytes, _) = client
                    .get(&format!("{items_path}/{child}"))
                    .await
                    .unwrap();
                let task: ExecutableTask =
                    serializer::from_bytes(RecordKind::ExecutableTask, &bytes).unwrap();
                decoded.push(task.task_id.as_str().to_string());
            }
            decoded
        };
        assert_eq!(order, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let store = MemoryStore::new();
        let a: Arc<dyn CoordStore> = store.connect("a");
        let b: Arc<dyn CoordStore> = store.connect("b");
        let lock_path = "/queues/t1|1/locks/task-0000000000";

        a.create(lock_path, Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap();
        let err = b
            .create(lock_path, Vec::new(), CreateMode::Ephemeral)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NodeExists(_)));
    }
}
