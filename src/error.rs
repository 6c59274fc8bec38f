//! Public error taxonomy.
//!
//! Semantically-absent state (missing runs, missing results) is reported as
//! `Option`/`false`, never as an error. Everything unrecoverable funnels into
//! [`WorkflowError::Internal`] with its cause attached.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow manager is not started")]
    NotStarted,
    #[error("workflow manager was already started")]
    AlreadyStarted,
    #[error("invalid task graph: {0}")]
    InvalidGraph(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        WorkflowError::Internal(err.into())
    }
}
