//! Identifier newtypes for runs and tasks.
//!
//! Both ids are plain strings on the wire and in store paths. Run ids are
//! time-ordered so that enumerating `/runs` roughly follows submission order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between run and task ids in flat child names
/// (`<runId>|<taskId>`). Must never appear inside an id.
pub const ID_SEPARATOR: char = '|';

/// Identifies one execution of a submitted task DAG.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies a task within a submitted task tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is safe to embed in store child names.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty() && !self.0.contains(ID_SEPARATOR) && !self.0.contains('/')
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_time_ordered() {
        let a = RunId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = RunId::new();
        assert!(a < b);
    }

    #[test]
    fn generated_ids_are_path_safe() {
        let id = TaskId::new();
        assert!(id.is_path_safe());
    }

    #[test]
    fn separator_is_detected() {
        let id = TaskId::from("bad|id");
        assert!(!id.is_path_safe());
    }
}
