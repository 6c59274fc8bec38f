//! Flattening a submitted task tree into a runnable DAG.
//!
//! The user submits a tree; the builder flattens it into
//! `(tasks: map, entries: edge list)` where each child depends on its parent
//! and siblings are parallel. The edge-list form serializes trivially and
//! avoids pointer-linked graph structures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::WorkflowError;
use crate::ids::{RunId, TaskId};
use crate::models::{DagEntry, ExecutableTask, Task, TaskType};

/// Validated, flattened form of one submitted task tree. `build` stamps it
/// with a run id to produce the persistable task map.
#[derive(Debug)]
pub struct RunnableTaskDagBuilder {
    tasks: HashMap<TaskId, FlatTask>,
    entries: Vec<DagEntry>,
}

#[derive(Debug)]
struct FlatTask {
    task_type: Option<TaskType>,
    metadata: BTreeMap<String, String>,
}

impl RunnableTaskDagBuilder {
    pub fn new(task: &Task) -> Result<Self, WorkflowError> {
        let mut tasks = HashMap::new();
        let mut entries = Vec::new();

        let mut stack: Vec<(&Task, Option<TaskId>)> = vec![(task, None)];
        while let Some((node, parent)) = stack.pop() {
            if !node.task_id.is_path_safe() {
                return Err(WorkflowError::InvalidGraph(format!(
                    "task id {:?} contains a reserved character",
                    node.task_id.as_str()
                )));
            }
            if tasks.contains_key(&node.task_id) {
                return Err(WorkflowError::InvalidGraph(format!(
                    "duplicate task id {:?}",
                    node.task_id.as_str()
                )));
            }
            tasks.insert(
                node.task_id.clone(),
                FlatTask {
                    task_type: node.task_type.clone(),
                    metadata: node.metadata.clone(),
                },
            );
            entries.push(DagEntry {
                task_id: node.task_id.clone(),
                dependencies: parent.into_iter().collect(),
            });
            for child in &node.child_tasks {
                stack.push((child, Some(node.task_id.clone())));
            }
        }

        let builder = Self { tasks, entries };
        builder.validate()?;
        Ok(builder)
    }

    /// Tree input is acyclic by construction, but the entry list is validated
    /// anyway so variants that allow fan-in stay safe.
    fn validate(&self) -> Result<(), WorkflowError> {
        let mut indegree: HashMap<&TaskId, usize> = HashMap::new();
        let mut dependents: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for entry in &self.entries {
            indegree.entry(&entry.task_id).or_insert(0);
            for dep in &entry.dependencies {
                if !self.tasks.contains_key(dep) {
                    return Err(WorkflowError::InvalidGraph(format!(
                        "task {:?} depends on unknown task {:?}",
                        entry.task_id.as_str(),
                        dep.as_str()
                    )));
                }
                *indegree.entry(&entry.task_id).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(&entry.task_id);
            }
        }

        let mut queue: VecDeque<&TaskId> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for dependent in dependents.get(id).into_iter().flatten() {
                let degree = indegree.get_mut(dependent).expect("indegree seeded");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        if visited != self.tasks.len() {
            return Err(WorkflowError::InvalidGraph(
                "task graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }

    pub fn entries(&self) -> &[DagEntry] {
        &self.entries
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.keys()
    }

    /// Stamp the flattened tree with a run id, mapping non-executable tasks
    /// to the null type.
    pub fn build(&self, run_id: &RunId) -> (HashMap<TaskId, ExecutableTask>, Vec<DagEntry>) {
        let tasks = self
            .tasks
            .iter()
            .map(|(task_id, flat)| {
                let executable = ExecutableTask {
                    run_id: run_id.clone(),
                    task_id: task_id.clone(),
                    task_type: flat.task_type.clone().unwrap_or_else(TaskType::null),
                    metadata: flat.metadata.clone(),
                    is_executable: flat.task_type.is_some(),
                };
                (task_id.clone(), executable)
            })
            .collect();
        (tasks, self.entries.clone())
    }
}

/// Dependency map keyed by task: `task -> [tasks it waits for]`.
pub(crate) fn dependency_map(entries: &[DagEntry]) -> HashMap<&TaskId, &[TaskId]> {
    entries
        .iter()
        .map(|entry| (&entry.task_id, entry.dependencies.as_slice()))
        .collect()
}

/// Task completeness per the readiness rule: an executable task is complete
/// iff its completion record exists; a non-executable task is complete iff
/// every one of its dependencies is complete.
pub(crate) fn is_task_complete(
    task_id: &TaskId,
    tasks: &HashMap<TaskId, ExecutableTask>,
    deps: &HashMap<&TaskId, &[TaskId]>,
    completed: &HashSet<TaskId>,
    memo: &mut HashMap<TaskId, bool>,
) -> bool {
    if let Some(&known) = memo.get(task_id) {
        return known;
    }
    // mark in-progress so corrupt (cyclic) data degrades to "incomplete"
    memo.insert(task_id.clone(), false);
    let complete = match tasks.get(task_id) {
        Some(task) if task.is_executable => completed.contains(task_id),
        Some(_) => deps
            .get(task_id)
            .into_iter()
            .flat_map(|d| d.iter())
            .all(|dep| is_task_complete(dep, tasks, deps, completed, memo)),
        None => false,
    };
    memo.insert(task_id.clone(), complete);
    complete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Task;

    fn executable(id: &str) -> Task {
        Task::new(id, TaskType::new("t1", "1"))
    }

    #[test]
    fn children_depend_on_their_parent() {
        let tree = executable("root").with_children(vec![executable("a"), executable("b")]);
        let builder = RunnableTaskDagBuilder::new(&tree).unwrap();
        let (tasks, entries) = builder.build(&RunId::new());

        assert_eq!(tasks.len(), 3);
        let root_entry = entries
            .iter()
            .find(|e| e.task_id.as_str() == "root")
            .unwrap();
        assert!(root_entry.dependencies.is_empty());
        for child in ["a", "b"] {
            let entry = entries
                .iter()
                .find(|e| e.task_id.as_str() == child)
                .unwrap();
            assert_eq!(entry.dependencies.len(), 1);
            assert_eq!(entry.dependencies[0].as_str(), "root");
        }
    }

    #[test]
    fn tasks_and_entries_cover_the_same_ids() {
        let tree = executable("root").with_children(vec![
            executable("a").with_children(vec![executable("a1")]),
            executable("b"),
        ]);
        let builder = RunnableTaskDagBuilder::new(&tree).unwrap();
        let (tasks, entries) = builder.build(&RunId::new());
        let entry_ids: HashSet<_> = entries.iter().map(|e| e.task_id.clone()).collect();
        let task_ids: HashSet<_> = tasks.keys().cloned().collect();
        assert_eq!(entry_ids, task_ids);
    }

    #[test]
    fn non_executable_tasks_map_to_the_null_type() {
        let tree = Task::container("sync").with_children(vec![executable("x")]);
        let builder = RunnableTaskDagBuilder::new(&tree).unwrap();
        let (tasks, _) = builder.build(&RunId::new());

        let sync = &tasks[&TaskId::from("sync")];
        assert!(!sync.is_executable);
        assert!(sync.task_type.is_null());
        assert!(tasks[&TaskId::from("x")].is_executable);
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let tree = executable("root").with_children(vec![executable("a"), executable("a")]);
        let err = RunnableTaskDagBuilder::new(&tree).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidGraph(_)));
    }

    #[test]
    fn separator_in_id_is_fatal() {
        let tree = executable("bad|id");
        let err = RunnableTaskDagBuilder::new(&tree).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidGraph(_)));
    }

    #[test]
    fn completeness_closes_over_non_executable_nodes() {
        let tree = Task::container("sync").with_children(vec![executable("a"), executable("b")]);
        let builder = RunnableTaskDagBuilder::new(&tree).unwrap();
        let (tasks, entries) = builder.build(&RunId::new());
        let deps = dependency_map(&entries);

        // non-executable root with no dependencies is trivially complete
        let mut memo = HashMap::new();
        assert!(is_task_complete(
            &TaskId::from("sync"),
            &tasks,
            &deps,
            &HashSet::new(),
            &mut memo
        ));

        let mut memo = HashMap::new();
        assert!(!is_task_complete(
            &TaskId::from("a"),
            &tasks,
            &deps,
            &HashSet::new(),
            &mut memo
        ));

        let completed: HashSet<TaskId> = [TaskId::from("a")].into();
        let mut memo = HashMap::new();
        assert!(is_task_complete(
            &TaskId::from("a"),
            &tasks,
            &deps,
            &completed,
            &mut memo
        ));
    }
}
