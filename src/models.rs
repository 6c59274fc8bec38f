//! Record types persisted in the coordination store and returned by queries.
//!
//! These structs serialize through the versioned envelope in
//! [`crate::serializer`]; unknown fields are tolerated on decode so future
//! versions can add fields without breaking older readers.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RunId, TaskId};

/// The kind of work a task represents. Queues are keyed by `(kind, version)`.
///
/// The null type marks non-executable container nodes: pure synchronization
/// points that no worker ever runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType {
    pub kind: String,
    pub version: String,
    pub executable: bool,
}

impl TaskType {
    pub fn new(kind: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
            executable: true,
        }
    }

    pub fn null() -> Self {
        Self {
            kind: String::new(),
            version: String::new(),
            executable: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.kind.is_empty() && self.version.is_empty() && !self.executable
    }

    /// Child name of this type's queue under `/queues`.
    pub fn queue_name(&self) -> String {
        format!("{}|{}", self.kind, self.version)
    }
}

/// A node in the user-submitted task tree.
///
/// `task_type: None` makes the task a non-executable container: its children
/// wait for it, but no worker runs it and it is complete as soon as its own
/// dependencies are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub child_tasks: Vec<Task>,
}

impl Task {
    pub fn new(task_id: impl Into<TaskId>, task_type: TaskType) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: Some(task_type),
            metadata: BTreeMap::new(),
            child_tasks: Vec::new(),
        }
    }

    /// A non-executable grouping/synchronization node.
    pub fn container(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: None,
            metadata: BTreeMap::new(),
            child_tasks: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Task>) -> Self {
        self.child_tasks = children;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_executable(&self) -> bool {
        self.task_type.is_some()
    }
}

/// The flattened, dispatchable form of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableTask {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub task_type: TaskType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub is_executable: bool,
}

/// Dependency edges for one task: the task cannot run until every id in
/// `dependencies` is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEntry {
    pub task_id: TaskId,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

/// The persisted run record: the full DAG plus run-level timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnableTask {
    pub tasks: HashMap<TaskId, ExecutableTask>,
    pub entries: Vec<DagEntry>,
    pub start_time_utc: DateTime<Utc>,
    #[serde(default)]
    pub completion_time_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
}

impl RunnableTask {
    pub fn is_complete(&self) -> bool {
        self.completion_time_utc.is_some()
    }
}

/// Written by a worker when it dequeues a task, before invoking the executor.
/// Overwritten on redelivery (at-least-once).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedTask {
    pub instance_name: String,
    pub start_date_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskExecutionStatus {
    Success,
    Failed,
    Cancelled,
}

/// Written by a worker when the executor returns. Create-if-absent: the first
/// result for a `(run, task)` pair wins and duplicates are discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub status: TaskExecutionStatus,
    pub message: String,
    #[serde(default)]
    pub result_data: BTreeMap<String, String>,
    pub completion_time_utc: DateTime<Utc>,
    #[serde(default)]
    pub sub_task_run_id: Option<RunId>,
}

impl TaskExecutionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(TaskExecutionStatus::Success, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(TaskExecutionStatus::Failed, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::with_status(TaskExecutionStatus::Cancelled, message)
    }

    fn with_status(status: TaskExecutionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            result_data: BTreeMap::new(),
            completion_time_utc: Utc::now(),
            sub_task_run_id: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.result_data.insert(key.into(), value.into());
        self
    }

    /// Link a child run spawned by the executor; the scheduler does not block
    /// the parent on it.
    pub fn with_sub_task_run(mut self, run_id: RunId) -> Self {
        self.sub_task_run_id = Some(run_id);
        self
    }
}

/// Run-level status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub start_time_utc: DateTime<Utc>,
    pub completion_time_utc: Option<DateTime<Utc>>,
}

impl RunInfo {
    pub fn is_complete(&self) -> bool {
        self.completion_time_utc.is_some()
    }
}

/// Task-level status snapshot, progressively filled as the task moves through
/// not-started, started, and completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub instance_name: Option<String>,
    pub start_date_utc: Option<DateTime<Utc>>,
    pub result: Option<TaskExecutionResult>,
}

impl TaskInfo {
    pub fn not_started(task_id: TaskId) -> Self {
        Self {
            task_id,
            instance_name: None,
            start_date_utc: None,
            result: None,
        }
    }

    pub fn started(task_id: TaskId, started: StartedTask) -> Self {
        Self {
            task_id,
            instance_name: Some(started.instance_name),
            start_date_utc: Some(started.start_date_utc),
            result: None,
        }
    }

    pub fn completed(task_id: TaskId, started: StartedTask, result: TaskExecutionResult) -> Self {
        Self {
            task_id,
            instance_name: Some(started.instance_name),
            start_date_utc: Some(started.start_date_utc),
            result: Some(result),
        }
    }

    pub fn has_started(&self) -> bool {
        self.start_date_utc.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_type_is_not_executable() {
        let null = TaskType::null();
        assert!(null.is_null());
        assert!(!null.executable);
        assert!(!TaskType::new("t1", "1").is_null());
    }

    #[test]
    fn container_tasks_have_no_type() {
        let task = Task::container("root")
            .with_children(vec![Task::new("child", TaskType::new("t1", "1"))]);
        assert!(!task.is_executable());
        assert!(task.child_tasks[0].is_executable());
    }

    #[test]
    fn queue_name_joins_kind_and_version() {
        assert_eq!(TaskType::new("t1", "2").queue_name(), "t1|2");
    }

    #[test]
    fn task_info_progression() {
        let id = TaskId::from("a");
        assert!(!TaskInfo::not_started(id.clone()).has_started());

        let started = StartedTask {
            instance_name: "worker-1".into(),
            start_date_utc: Utc::now(),
        };
        let info = TaskInfo::started(id.clone(), started.clone());
        assert!(info.has_started());
        assert!(!info.is_complete());

        let info = TaskInfo::completed(id, started, TaskExecutionResult::success("done"));
        assert!(info.is_complete());
    }
}
