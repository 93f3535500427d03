//! Error types for the commit graph layer.

use crate::hash::CommitRef;
use thiserror::Error;

/// Errors raised while building, merging or reconciling commit history.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Commit {commit} is out of order: expected base {expected:?}, found {found:?}")]
    OutOfOrder {
        commit: CommitRef,
        expected: Option<CommitRef>,
        found: Option<CommitRef>,
    },

    #[error("Commit {0} is already tracked by the branch")]
    CyclicCommit(CommitRef),

    #[error("Unexpected merge commit {0} on a local branch")]
    UnexpectedMerge(CommitRef),

    #[error("A merge is already in flight: {0}")]
    MergeInFlight(CommitRef),

    #[error("Merge commit {commit} does not reference edit {edit}")]
    InvalidMerge { commit: CommitRef, edit: CommitRef },

    #[error("Branch has no edits to merge")]
    NoEdits,

    #[error("Corrupted commit history: merge base {base} equals one of its sides")]
    CorruptHistory { base: CommitRef },

    #[error("Commit not found: {0}")]
    MissingCommit(CommitRef),

    #[error("Differ error: {0}")]
    Differ(String),
}

impl From<serde_json::Error> for GraphError {
    fn from(err: serde_json::Error) -> Self {
        GraphError::Differ(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
