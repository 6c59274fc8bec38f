//! The public workflow manager: submit, cancel, clean, and query runs.
//!
//! A manager owns the lifecycle of this instance's queue consumers and its
//! scheduler selector. Instances coordinate only through the store; the
//! manager itself keeps no run state beyond an atomic lifecycle flag.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;
use tracing::info;

use crate::config::Config;
use crate::dag::RunnableTaskDagBuilder;
use crate::error::{Result, WorkflowError};
use crate::ids::{RunId, TaskId};
use crate::models::{RunInfo, RunnableTask, StartedTask, Task, TaskExecutionResult, TaskInfo};
use crate::queue::{QueueConsumer, TaskExecutorSpec};
use crate::scheduler;
use crate::selector::SchedulerSelector;
use crate::serializer::{self, RecordKind};
use crate::store::{CoordStore, CreateMode, StoreError, children_or_empty, paths};

const STATE_LATENT: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Cheap store-access capability handed to executors and listener managers.
/// Lets them submit sub-task runs and read results without owning the
/// manager.
#[derive(Clone)]
pub struct WorkflowHandle {
    store: Arc<dyn CoordStore>,
    state: Arc<AtomicU8>,
}

impl WorkflowHandle {
    pub fn store(&self) -> &Arc<dyn CoordStore> {
        &self.store
    }

    pub fn instance_name(&self) -> &str {
        self.store.instance_name()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STARTED
    }

    /// Submit a child run linked to `parent_run_id`. The parent task is NOT
    /// blocked on the child; report the link through
    /// [`TaskExecutionResult::with_sub_task_run`].
    pub async fn submit_sub_task(&self, parent_run_id: RunId, task: Task) -> Result<RunId> {
        ensure_started(&self.state)?;
        submit_run(&self.store, Some(parent_run_id), task).await
    }

    pub async fn get_task_execution_result(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Option<TaskExecutionResult>> {
        read_result(&self.store, run_id, task_id).await
    }
}

pub struct WorkflowManagerBuilder {
    store: Arc<dyn CoordStore>,
    config: Option<Config>,
    specs: Vec<TaskExecutorSpec>,
}

impl WorkflowManagerBuilder {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self {
            store,
            config: None,
            specs: Vec::new(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn add_executor(mut self, spec: TaskExecutorSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> Result<WorkflowManager> {
        let config = match self.config {
            Some(config) => config,
            None => Config::from_env()?,
        };
        Ok(WorkflowManager {
            store: self.store,
            config,
            specs: self.specs,
            state: Arc::new(AtomicU8::new(STATE_LATENT)),
            consumers: Vec::new(),
            selector: None,
        })
    }
}

/// One workflow-engine instance.
pub struct WorkflowManager {
    store: Arc<dyn CoordStore>,
    config: Config,
    specs: Vec<TaskExecutorSpec>,
    state: Arc<AtomicU8>,
    consumers: Vec<QueueConsumer>,
    selector: Option<SchedulerSelector>,
}

impl WorkflowManager {
    pub fn builder(store: Arc<dyn CoordStore>) -> WorkflowManagerBuilder {
        WorkflowManagerBuilder::new(store)
    }

    /// Start consumers and join the scheduler election. Valid exactly once,
    /// from the latent state.
    pub fn start(&mut self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_LATENT,
                STATE_STARTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| WorkflowError::AlreadyStarted)?;

        let handle = self.handle();
        for spec in &self.specs {
            for slot in 0..spec.concurrency {
                self.consumers.push(QueueConsumer::start(
                    spec.task_type.clone(),
                    slot,
                    spec.executor.clone(),
                    handle.clone(),
                    self.config.queue_poll_interval,
                ));
            }
        }
        self.selector = Some(SchedulerSelector::start(
            self.store.clone(),
            self.config.sched_sweep_interval,
        ));
        info!(
            instance = %self.store.instance_name(),
            consumers = self.consumers.len(),
            "workflow manager started"
        );
        Ok(())
    }

    /// Stop the selector and all consumers. Idempotent beyond the first
    /// effective call.
    pub async fn close(&mut self) {
        if self
            .state
            .compare_exchange(
                STATE_STARTED,
                STATE_CLOSED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        if let Some(selector) = self.selector.take() {
            selector.shutdown().await;
        }
        for consumer in self.consumers.drain(..) {
            consumer.shutdown().await;
        }
        info!(instance = %self.store.instance_name(), "workflow manager closed");
    }

    pub fn handle(&self) -> WorkflowHandle {
        WorkflowHandle {
            store: self.store.clone(),
            state: self.state.clone(),
        }
    }

    /// A listener manager wired to this instance's store connection.
    pub fn listener_manager(&self) -> crate::events::WorkflowListenerManager {
        crate::events::WorkflowListenerManager::new(self.handle())
    }

    pub async fn submit_task(&self, task: Task) -> Result<RunId> {
        ensure_started(&self.state)?;
        submit_run(&self.store, None, task).await
    }

    pub async fn submit_sub_task(&self, parent_run_id: RunId, task: Task) -> Result<RunId> {
        ensure_started(&self.state)?;
        submit_run(&self.store, Some(parent_run_id), task).await
    }

    /// Finalize the run at its current version. Late task results still get
    /// their completion nodes, which is harmless; the run's completion stamp
    /// no longer changes. Returns `false` for an unknown run.
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<bool> {
        ensure_started(&self.state)?;
        info!(run_id = %run_id, "cancelling run");
        let run_path = paths::run_path(run_id);
        let (bytes, version) = match self.store.get(&run_path).await {
            Ok(found) => found,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let run = serializer::from_bytes(RecordKind::RunnableTask, &bytes)?;
        scheduler::complete_runnable_task(&self.store, run_id, run, version).await?;
        Ok(true)
    }

    pub async fn get_task_execution_result(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Option<TaskExecutionResult>> {
        read_result(&self.store, run_id, task_id).await
    }

    pub async fn get_run_info(&self, run_id: &RunId) -> Result<Option<RunInfo>> {
        let (bytes, _) = match self.store.get(&paths::run_path(run_id)).await {
            Ok(found) => found,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let run: RunnableTask = serializer::from_bytes(RecordKind::RunnableTask, &bytes)?;
        Ok(Some(RunInfo {
            run_id: run_id.clone(),
            start_time_utc: run.start_time_utc,
            completion_time_utc: run.completion_time_utc,
        }))
    }

    pub async fn list_run_info(&self) -> Result<Vec<RunInfo>> {
        let mut infos = Vec::new();
        for child in children_or_empty(&self.store, paths::RUNS_PARENT)
            .await
            .map_err(WorkflowError::from)?
        {
            let run_id = RunId::from(child);
            match self.get_run_info(&run_id).await? {
                Some(info) => infos.push(info),
                // deleted in the interim
                None => {}
            }
        }
        Ok(infos)
    }

    /// Reconcile the run record, started records, and completion records
    /// into one `TaskInfo` per executable task. Every read tolerates nodes
    /// deleted in the interim.
    pub async fn get_task_info(&self, run_id: &RunId) -> Result<Vec<TaskInfo>> {
        let (bytes, _) = match self.store.get(&paths::run_path(run_id)).await {
            Ok(found) => found,
            Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let run: RunnableTask = serializer::from_bytes(RecordKind::RunnableTask, &bytes)?;

        let mut not_started: HashSet<TaskId> = run
            .tasks
            .values()
            .filter(|task| task.is_executable)
            .map(|task| task.task_id.clone())
            .collect();
        let mut started: HashMap<TaskId, StartedTask> = HashMap::new();

        for child in children_or_empty(&self.store, paths::STARTED_TASKS_PARENT)
            .await
            .map_err(WorkflowError::from)?
        {
            let Some((run, task_id)) = paths::split_run_task(&child) else {
                continue;
            };
            if &run != run_id {
                continue;
            }
            match self
                .store
                .get(&format!("{}/{child}", paths::STARTED_TASKS_PARENT))
                .await
            {
                Ok((bytes, _)) => {
                    let record: StartedTask =
                        serializer::from_bytes(RecordKind::StartedTask, &bytes)?;
                    not_started.remove(&task_id);
                    started.insert(task_id, record);
                }
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut infos = Vec::new();
        for child in children_or_empty(&self.store, paths::COMPLETED_TASKS_PARENT)
            .await
            .map_err(WorkflowError::from)?
        {
            let Some((run, task_id)) = paths::split_run_task(&child) else {
                continue;
            };
            if &run != run_id {
                continue;
            }
            let Some(record) = started.remove(&task_id) else {
                // its started record was deleted in the interim
                continue;
            };
            match self
                .store
                .get(&format!("{}/{child}", paths::COMPLETED_TASKS_PARENT))
                .await
            {
                Ok((bytes, _)) => {
                    let result =
                        serializer::from_bytes(RecordKind::TaskExecutionResult, &bytes)?;
                    not_started.remove(&task_id);
                    infos.push(TaskInfo::completed(task_id, record, result));
                }
                Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for (task_id, record) in started {
            infos.push(TaskInfo::started(task_id, record));
        }
        for task_id in not_started {
            infos.push(TaskInfo::not_started(task_id));
        }
        infos.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(infos)
    }

    /// Best-effort removal of the run and all its task records. Returns
    /// `false` when the run is already gone.
    pub async fn clean(&self, run_id: &RunId) -> Result<bool> {
        ensure_started(&self.state)?;
        let run_path = paths::run_path(run_id);
        let (bytes, _) = match self.store.get(&run_path).await {
            Ok(found) => found,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let run: RunnableTask = serializer::from_bytes(RecordKind::RunnableTask, &bytes)?;

        for task_id in run.tasks.keys() {
            for path in [
                paths::started_task_path(run_id, task_id),
                paths::completed_task_path(run_id, task_id),
            ] {
                match self.store.delete(&path).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        match self.store.delete(&run_path).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        info!(run_id = %run_id, "run cleaned");
        Ok(true)
    }
}

fn ensure_started(state: &AtomicU8) -> Result<()> {
    if state.load(Ordering::SeqCst) == STATE_STARTED {
        Ok(())
    } else {
        Err(WorkflowError::NotStarted)
    }
}

async fn submit_run(
    store: &Arc<dyn CoordStore>,
    parent_run_id: Option<RunId>,
    task: Task,
) -> Result<RunId> {
    let run_id = RunId::new();
    let builder = RunnableTaskDagBuilder::new(&task)?;
    let (tasks, entries) = builder.build(&run_id);
    let runnable = RunnableTask {
        tasks,
        entries,
        start_time_utc: Utc::now(),
        completion_time_utc: None,
        parent_run_id,
    };
    let bytes = serializer::to_bytes(RecordKind::RunnableTask, &runnable)?;
    store
        .create(&paths::run_path(&run_id), bytes, CreateMode::Persistent)
        .await
        .map_err(WorkflowError::from)?;
    info!(run_id = %run_id, tasks = runnable.tasks.len(), "run submitted");
    Ok(run_id)
}

async fn read_result(
    store: &Arc<dyn CoordStore>,
    run_id: &RunId,
    task_id: &TaskId,
) -> Result<Option<TaskExecutionResult>> {
    match store
        .get(&paths::completed_task_path(run_id, task_id))
        .await
    {
        Ok((bytes, _)) => Ok(Some(serializer::from_bytes(
            RecordKind::TaskExecutionResult,
            &bytes,
        )?)),
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskType;
    use crate::store::memory::MemoryStore;

    fn manager() -> WorkflowManager {
        let store = MemoryStore::new();
        let client: Arc<dyn CoordStore> = store.connect("test-instance");
        WorkflowManager::builder(client)
            .config(Config::test_config("test-instance"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn submit_requires_started_state() {
        let manager = manager();
        let err = manager
            .submit_task(Task::new("a", TaskType::new("t1", "1")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotStarted));
    }

    #[tokio::test]
    async fn start_is_valid_only_once() {
        let mut manager = manager();
        manager.start().unwrap();
        assert!(matches!(
            manager.start(),
            Err(WorkflowError::AlreadyStarted)
        ));
        manager.close().await;
        assert!(matches!(
            manager.start(),
            Err(WorkflowError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut manager = manager();
        manager.start().unwrap();
        manager.close().await;
        manager.close().await;
    }

    #[tokio::test]
    async fn submit_after_close_is_rejected() {
        let mut manager = manager();
        manager.start().unwrap();
        manager.close().await;
        let err = manager
            .submit_task(Task::new("a", TaskType::new("t1", "1")))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotStarted));
    }

    #[tokio::test]
    async fn invalid_graph_writes_no_run_record() {
        let mut manager = manager();
        manager.start().unwrap();
        let tree = Task::new("a", TaskType::new("t1", "1"))
            .with_children(vec![Task::new("a", TaskType::new("t1", "1"))]);
        let err = manager.submit_task(tree).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidGraph(_)));
        assert!(manager.list_run_info().await.unwrap().is_empty());
        manager.close().await;
    }

    #[tokio::test]
    async fn run_info_round_trips_through_submit() {
        let mut manager = manager();
        manager.start().unwrap();
        let run_id = manager
            .submit_task(Task::new("a", TaskType::new("t1", "1")))
            .await
            .unwrap();

        let info = manager.get_run_info(&run_id).await.unwrap().unwrap();
        assert_eq!(info.run_id, run_id);
        assert!(!info.is_complete());

        let all = manager.list_run_info().await.unwrap();
        assert_eq!(all.len(), 1);
        manager.close().await;
    }
}
