//! Store path layout.
//!
//! ```text
//! /runs/<runId>                          serialized RunnableTask
//! /started-tasks/<runId>|<taskId>        serialized StartedTask
//! /completed-tasks/<runId>|<taskId>      serialized TaskExecutionResult
//! /queues/<kind>|<version>/items/...     queue items (sequential)
//! /queues/<kind>|<version>/locks/...     per-item claim locks (ephemeral)
//! /scheduler-leader/<seq-ephemeral>      election members
//! ```
//!
//! Started/completed children are flat `<runId>|<taskId>` names so one child
//! enumeration of the parent yields every task record; ids never contain the
//! separator.

use crate::ids::{ID_SEPARATOR, RunId, TaskId};
use crate::models::TaskType;

pub const RUNS_PARENT: &str = "/runs";
pub const STARTED_TASKS_PARENT: &str = "/started-tasks";
pub const COMPLETED_TASKS_PARENT: &str = "/completed-tasks";
pub const QUEUES_PARENT: &str = "/queues";
pub const SCHEDULER_LEADER_PATH: &str = "/scheduler-leader";

pub fn run_path(run_id: &RunId) -> String {
    format!("{RUNS_PARENT}/{run_id}")
}

pub fn run_task_child(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{run_id}{ID_SEPARATOR}{task_id}")
}

pub fn started_task_path(run_id: &RunId, task_id: &TaskId) -> String {
    format!("{STARTED_TASKS_PARENT}/{}", run_task_child(run_id, task_id))
}

pub fn completed_task_path(run_id: &RunId, task_id: &TaskId) -> String {
    format!(
        "{COMPLETED_TASKS_PARENT}/{}",
        run_task_child(run_id, task_id)
    )
}

pub fn queue_items_path(task_type: &TaskType) -> String {
    format!("{QUEUES_PARENT}/{}/items", task_type.queue_name())
}

pub fn queue_locks_path(task_type: &TaskType) -> String {
    format!("{QUEUES_PARENT}/{}/locks", task_type.queue_name())
}

/// Recover `(runId, taskId)` from a flat `<runId>|<taskId>` child name.
pub fn split_run_task(child: &str) -> Option<(RunId, TaskId)> {
    let (run, task) = child.split_once(ID_SEPARATOR)?;
    if run.is_empty() || task.is_empty() {
        return None;
    }
    Some((RunId::from(run), TaskId::from(task)))
}

/// Leaf name of a full path.
pub fn child_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_task_round_trip() {
        let run = RunId::new();
        let task = TaskId::from("step-1");
        let child = run_task_child(&run, &task);
        assert_eq!(split_run_task(&child), Some((run, task)));
    }

    #[test]
    fn malformed_children_are_rejected() {
        assert!(split_run_task("no-separator").is_none());
        assert!(split_run_task("|task").is_none());
        assert!(split_run_task("run|").is_none());
    }

    #[test]
    fn queue_paths_are_keyed_by_type_and_version() {
        let t = TaskType::new("build", "2");
        assert_eq!(queue_items_path(&t), "/queues/build|2/items");
        assert_eq!(queue_locks_path(&t), "/queues/build|2/locks");
    }

    #[test]
    fn child_name_takes_the_leaf() {
        assert_eq!(child_name("/scheduler-leader/member-0000000003"), "member-0000000003");
    }
}
