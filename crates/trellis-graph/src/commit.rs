//! Commit definition and builder.
//!
//! Each commit in the history DAG contains:
//! - A content ref computed from its parents, delta and metadata
//! - Up to two parent refs (`base_ref`, and `merge_ref` for merges)
//! - The merge base it was reconciled against, for merge commits
//! - An opaque delta and opaque metadata supplied by the host application

use crate::differ::Differ;
use crate::hash::{self, CommitRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable, content-addressed node in the document history.
///
/// Only `metadata` may be rewritten after creation, by repository
/// enrichment; it never feeds back into `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Content ref of the commit.
    #[serde(rename = "ref")]
    pub id: CommitRef,

    /// First parent. `None` only for the first commit of a history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<CommitRef>,

    /// Second parent. Present only on merge commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_ref: Option<CommitRef>,

    /// Common ancestor the merge was computed against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_base_ref: Option<CommitRef>,

    /// Host-defined change payload.
    #[serde(default)]
    pub delta: Value,

    /// Host-defined metadata.
    #[serde(default)]
    pub metadata: Value,
}

impl Commit {
    /// Start building a commit.
    pub fn builder() -> CommitBuilder {
        CommitBuilder::new()
    }

    /// Check if this is a merge commit (two parents).
    pub fn is_merge(&self) -> bool {
        self.merge_ref.is_some()
    }

    /// Iterate over the parent refs.
    pub fn parents(&self) -> impl Iterator<Item = &CommitRef> {
        self.base_ref.iter().chain(self.merge_ref.iter())
    }

    /// Check if `r` is a direct parent of this commit.
    pub fn has_parent(&self, r: &CommitRef) -> bool {
        self.parents().any(|p| p == r)
    }

    /// Verify that the ref matches the contents under the default hasher.
    pub fn verify(&self) -> bool {
        hash::compute_ref(
            self.base_ref.as_ref(),
            self.merge_ref.as_ref(),
            &self.delta,
            &self.metadata,
        ) == self.id
    }
}

/// Builder for creating commits.
#[derive(Clone, Debug, Default)]
pub struct CommitBuilder {
    base_ref: Option<CommitRef>,
    merge_ref: Option<CommitRef>,
    merge_base_ref: Option<CommitRef>,
    delta: Value,
    metadata: Value,
}

impl CommitBuilder {
    /// Create a new commit builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the first parent.
    pub fn with_base_ref(mut self, base_ref: Option<CommitRef>) -> Self {
        self.base_ref = base_ref;
        self
    }

    /// Set the second parent, making this a merge commit.
    pub fn with_merge_ref(mut self, merge_ref: CommitRef) -> Self {
        self.merge_ref = Some(merge_ref);
        self
    }

    /// Set the merge base.
    pub fn with_merge_base_ref(mut self, merge_base_ref: Option<CommitRef>) -> Self {
        self.merge_base_ref = merge_base_ref;
        self
    }

    /// Set the delta.
    pub fn with_delta(mut self, delta: Value) -> Self {
        self.delta = delta;
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build the commit using the default SHA-256 ref.
    pub fn build(self) -> Commit {
        let id = hash::compute_ref(
            self.base_ref.as_ref(),
            self.merge_ref.as_ref(),
            &self.delta,
            &self.metadata,
        );
        self.finish(id)
    }

    /// Build the commit using the differ's ref function.
    pub fn build_with<D: Differ + ?Sized>(self, differ: &D) -> Commit {
        let id = differ.compute_ref(
            self.base_ref.as_ref(),
            self.merge_ref.as_ref(),
            &self.delta,
            &self.metadata,
        );
        self.finish(id)
    }

    fn finish(self, id: CommitRef) -> Commit {
        Commit {
            id,
            base_ref: self.base_ref,
            merge_ref: self.merge_ref,
            merge_base_ref: self.merge_base_ref,
            delta: self.delta,
            metadata: self.metadata,
        }
    }
}
