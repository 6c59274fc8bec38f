//! The active scheduler: advances every run's DAG and finalizes runs.
//!
//! Exactly one instance runs a scheduler at a time (see
//! [`crate::selector`]). It reacts to run creation, run-record changes, and
//! task completions; concurrent triggers for the same run coalesce into a
//! single pass. A periodic sweep re-enqueues every run as a safety net
//! against missed notifications.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::{StreamExt, StreamMap, wrappers::UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dag;
use crate::ids::{RunId, TaskId};
use crate::models::RunnableTask;
use crate::queue::TaskQueue;
use crate::serializer::{self, RecordKind};
use crate::store::{CoordStore, StoreError, children_or_empty, paths};

type RunWatches = StreamMap<RunId, UnboundedReceiverStream<crate::store::StoreEvent>>;

pub(crate) struct Scheduler {
    store: Arc<dyn CoordStore>,
    sweep_interval: Duration,
    queues: HashMap<String, TaskQueue>,
    /// Per-epoch enqueue dedup; correctness never depends on it (consumers
    /// dedup completions), it only damps re-enqueue on retrigger. Discarded
    /// with the scheduler on leadership loss.
    recently_queued: HashSet<(RunId, TaskId)>,
    watched: HashSet<RunId>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn CoordStore>, sweep_interval: Duration) -> Self {
        Self {
            store,
            sweep_interval,
            queues: HashMap::new(),
            recently_queued: HashSet::new(),
            watched: HashSet::new(),
        }
    }

    pub async fn run(mut self, stop: CancellationToken) {
        let mut runs_rx = match self.store.watch_children(paths::RUNS_PARENT).await {
            Ok(rx) => rx,
            Err(err) => {
                error!(?err, "failed to watch runs, scheduler exiting");
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
                error!(?err, "failed to watch completions, scheduler exiting");
                return;
            }
        };

        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut run_watches: RunWatches = StreamMap::new();
        let mut pending: VecDeque<RunId> = VecDeque::new();
        let mut pending_set: HashSet<RunId> = HashSet::new();

        info!("scheduler started, resynchronizing all runs");
        self.enqueue_all(&mut pending, &mut pending_set).await;

        loop {
            while let Some(run_id) = pending.pop_front() {
                pending_set.remove(&run_id);
                if stop.is_cancelled() {
                    info!("scheduler stopping");
                    return;
                }
                self.pass(&run_id, &mut run_watches).await;
            }

            tokio::select! {
                _ = stop.cancelled() => {
                    info!("scheduler stopping");
                    return;
                }
                Some(event) = runs_rx.recv() => {
                    match event {
                        crate::store::StoreEvent::ChildCreated { child, .. }
                        | crate::store::StoreEvent::ChildDeleted { child, .. } => {
                            push_pending(&mut pending, &mut pending_set, RunId::from(child));
                        }
                        _ => {}
                    }
                }
                Some(event) = completed_rx.recv() => {
                    if let crate::store::StoreEvent::ChildCreated { child, .. } = event
                        && let Some((run_id, _)) = paths::split_run_task(&child)
                    {
                        push_pending(&mut pending, &mut pending_set, run_id);
                    }
                }
                Some((run_id, _event)) = run_watches.next() => {
                    push_pending(&mut pending, &mut pending_set, run_id);
                }
                _ = sweep.tick() => {
                    self.enqueue_all(&mut pending, &mut pending_set).await;
                }
            }
        }
    }

    async fn enqueue_all(&self, pending: &mut VecDeque<RunId>, pending_set: &mut HashSet<RunId>) {
        match children_or_empty(&self.store, paths::RUNS_PARENT).await {
            Ok(children) => {
                for child in children {
                    push_pending(pending, pending_set, RunId::from(child));
                }
            }
            Err(err) => {
                metrics::counter!("belay_scheduler_errors_total").increment(1);
                warn!(?err, "failed to enumerate runs for sweep");
            }
        }
    }

    async fn pass(&mut self, run_id: &RunId, run_watches: &mut RunWatches) {
        if let Err(err) = self.try_pass(run_id, run_watches).await {
            metrics::counter!("belay_scheduler_errors_total").increment(1);
            error!(run_id = %run_id, ?err, "scheduler pass failed");
        }
    }

    async fn try_pass(&mut self, run_id: &RunId, run_watches: &mut RunWatches) -> anyhow::Result<()> {
        let run_path = paths::run_path(run_id);
        let (bytes, version) = match self.store.get(&run_path).await {
            Ok(found) => found,
            Err(StoreError::NotFound(_)) => {
                self.forget(run_id, run_watches);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let run: RunnableTask = serializer::from_bytes(RecordKind::RunnableTask, &bytes)?;

        if !self.watched.contains(run_id) {
            let rx = self.store.watch_node(&run_path).await?;
            run_watches.insert(run_id.clone(), UnboundedReceiverStream::new(rx));
            self.watched.insert(run_id.clone());
        }

        if run.is_complete() {
            return Ok(());
        }

        let completed = self
            .run_scoped_tasks(paths::COMPLETED_TASKS_PARENT, run_id)
            .await?;
        let all_executable_done = run
            .tasks
            .values()
            .filter(|task| task.is_executable)
            .all(|task| completed.contains(&task.task_id));
        if all_executable_done {
            complete_runnable_task(&self.store, run_id, run, version).await?;
            self.recently_queued.retain(|(r, _)| r != run_id);
            return Ok(());
        }

        let started = self
            .run_scoped_tasks(paths::STARTED_TASKS_PARENT, run_id)
            .await?;
        for task_id in ready_tasks(&run, &completed) {
            if started.contains(&task_id) {
                continue;
            }
            let key = (run_id.clone(), task_id.clone());
            if self.recently_queued.contains(&key) {
                continue;
            }
            let task = &run.tasks[&task_id];
            let store = self.store.clone();
            let queue = self
                .queues
                .entry(task.task_type.queue_name())
                .or_insert_with(|| TaskQueue::new(store, &task.task_type));
            queue.put(task).await?;
            self.recently_queued.insert(key);
        }
        Ok(())
    }

    async fn run_scoped_tasks(
        &self,
        parent: &str,
        run_id: &RunId,
    ) -> anyhow::Result<HashSet<TaskId>> {
        let children = children_or_empty(&self.store, parent).await?;
        Ok(children
            .iter()
            .filter_map(|child| paths::split_run_task(child))
            .filter(|(run, _)| run == run_id)
            .map(|(_, task)| task)
            .collect())
    }

    fn forget(&mut self, run_id: &RunId, run_watches: &mut RunWatches) {
        if self.watched.remove(run_id) {
            run_watches.remove(run_id);
            debug!(run_id = %run_id, "run removed, dropping watch");
        }
        self.recently_queued.retain(|(run, _)| run != run_id);
    }
}

fn push_pending(pending: &mut VecDeque<RunId>, pending_set: &mut HashSet<RunId>, run_id: RunId) {
    if pending_set.insert(run_id.clone()) {
        pending.push_back(run_id);
    }
}

/// Executable tasks whose every dependency is complete and which have no
/// completion record yet, in stable order.
pub(crate) fn ready_tasks(run: &RunnableTask, completed: &HashSet<TaskId>) -> Vec<TaskId> {
    let deps = dag::dependency_map(&run.entries);
    let mut memo = HashMap::new();
    let mut ready: Vec<TaskId> = run
        .tasks
        .values()
        .filter(|task| task.is_executable && !completed.contains(&task.task_id))
        .filter(|task| {
            deps.get(&task.task_id)
                .into_iter()
                .flat_map(|d| d.iter())
                .all(|dep| dag::is_task_complete(dep, &run.tasks, &deps, completed, &mut memo))
        })
        .map(|task| task.task_id.clone())
        .collect();
    ready.sort();
    ready
}

/// Stamp `completion_time_utc` on the run record via compare-and-set,
/// re-reading on version conflict. Shared by run finalization and
/// cancellation; a no-op if the run is already final or gone. Finalization is
/// monotonic: an existing stamp is never overwritten.
pub(crate) async fn complete_runnable_task(
    store: &Arc<dyn CoordStore>,
    run_id: &RunId,
    mut run: RunnableTask,
    mut version: i64,
) -> anyhow::Result<()> {
    let run_path = paths::run_path(run_id);
    loop {
        if run.is_complete() {
            return Ok(());
        }
        run.completion_time_utc = Some(Utc::now());
        let bytes = serializer::to_bytes(RecordKind::RunnableTask, &run)?;
        match store.set(&run_path, bytes, version).await {
            Ok(_) => {
                info!(run_id = %run_id, "run finalized");
                return Ok(());
            }
            Err(StoreError::VersionConflict { .. }) => match store.get(&run_path).await {
                Ok((bytes, actual)) => {
                    run = serializer::from_bytes(RecordKind::RunnableTask, &bytes)?;
                    version = actual;
                }
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            },
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::RunnableTaskDagBuilder;
    use crate::models::{Task, TaskType};
    use crate::store::memory::MemoryStore;

    fn linear_run() -> RunnableTask {
        // a -> b -> c
        let tree = Task::new("a", TaskType::new("t1", "1")).with_children(vec![
            Task::new("b", TaskType::new("t1", "1"))
                .with_children(vec![Task::new("c", TaskType::new("t1", "1"))]),
        ]);
        let builder = RunnableTaskDagBuilder::new(&tree).unwrap();
        let (tasks, entries) = builder.build(&RunId::new());
        RunnableTask {
            tasks,
            entries,
            start_time_utc: Utc::now(),
            completion_time_utc: None,
            parent_run_id: None,
        }
    }

    #[test]
    fn only_the_root_is_initially_ready() {
        let run = linear_run();
        let ready = ready_tasks(&run, &HashSet::new());
        assert_eq!(ready, vec![TaskId::from("a")]);
    }

    #[test]
    fn completion_unlocks_the_next_task() {
        let run = linear_run();
        let completed: HashSet<TaskId> = [TaskId::from("a")].into();
        assert_eq!(ready_tasks(&run, &completed), vec![TaskId::from("b")]);
    }

    #[test]
    fn completed_tasks_are_not_ready_again() {
        let run = linear_run();
        let completed: HashSet<TaskId> =
            [TaskId::from("a"), TaskId::from("b"), TaskId::from("c")].into();
        assert!(ready_tasks(&run, &completed).is_empty());
    }

    #[test]
    fn non_executable_root_releases_children_immediately() {
        let tree = Task::container("sync").with_children(vec![
            Task::new("x", TaskType::new("t1", "1")),
            Task::new("y", TaskType::new("t1", "1")),
        ]);
        let builder = RunnableTaskDagBuilder::new(&tree).unwrap();
        let (tasks, entries) = builder.build(&RunId::new());
        let run = RunnableTask {
            tasks,
            entries,
            start_time_utc: Utc::now(),
            completion_time_utc: None,
            parent_run_id: None,
        };
        let ready = ready_tasks(&run, &HashSet::new());
        assert_eq!(ready, vec![TaskId::from("x"), TaskId::from("y")]);
    }

    #[tokio::test]
    async fn finalization_retries_through_version_conflicts() {
        let store = MemoryStore::new();
        let client: Arc<dyn CoordStore> = store.connect("sched");
        let run_id = RunId::new();
        let run = linear_run();
        let bytes = serializer::to_bytes(RecordKind::RunnableTask, &run).unwrap();
        client
            .create(
                &paths::run_path(&run_id),
                bytes.clone(),
                crate::store::CreateMode::Persistent,
            )
            .await
            .unwrap();

        // bump the version behind the finalizer's back
        client
            .set(&paths::run_path(&run_id), bytes, 0)
            .await
            .unwrap();

        complete_runnable_task(&client, &run_id, run, 0).await.unwrap();

        let (bytes, _) = client.get(&paths::run_path(&run_id)).await.unwrap();
        let stored: RunnableTask =
            serializer::from_bytes(RecordKind::RunnableTask, &bytes).unwrap();
        assert!(stored.is_complete());
    }

    #[tokio::test]
    async fn finalization_is_monotonic() {
        let store = MemoryStore::new();
        let client: Arc<dyn CoordStore> = store.connect("sched");
        let run_id = RunId::new();
        let mut run = linear_run();
        let stamp = Utc::now();
        run.completion_time_utc = Some(stamp);
        let bytes = serializer::to_bytes(RecordKind::RunnableTask, &run).unwrap();
        client
            .create(
                &paths::run_path(&run_id),
                bytes,
                crate::store::CreateMode::Persistent,
            )
            .await
            .unwrap();

        complete_runnable_task(&client, &run_id, run, 0).await.unwrap();

        let (bytes, version) = client.get(&paths::run_path(&run_id)).await.unwrap();
        let stored: RunnableTask =
            serializer::from_bytes(RecordKind::RunnableTask, &bytes).unwrap();
        assert_eq!(stored.completion_time_utc, Some(stamp));
        assert_eq!(version, 0);
    }
}
