//! # trellis-graph
//!
//! Commit history for Trellis, the local-first document sync engine.
//!
//! This crate provides:
//! - Content-addressed, immutable commits forming a DAG
//! - An in-memory [`CommitGraph`] tracking heads and ancestry
//! - [`merge_heads`], the deterministic multi-way merge every client runs to
//!   converge on the same history
//! - [`Branch`], which separates a client's unconfirmed edits from main
//! - The [`Differ`] trait the host implements for its document type, and
//!   [`DocCache`] to materialise documents from history
//!
//! ## Example
//!
//! ```rust
//! use trellis_graph::{merge_heads, Commit, CommitGraph, Differ, TextDiffer};
//!
//! let differ = TextDiffer;
//! let mut graph = CommitGraph::new();
//!
//! let init = Commit::builder()
//!     .with_delta(differ.diff(None, &"hi".to_string()).unwrap().unwrap())
//!     .build_with(&differ);
//! graph.insert(init.clone());
//!
//! // Two concurrent edits on top of the same commit.
//! for edit in ["hi!", "oh hi"] {
//!     let delta = differ.diff(Some(&"hi".to_string()), &edit.to_string()).unwrap().unwrap();
//!     let commit = Commit::builder()
//!         .with_base_ref(Some(init.id.clone()))
//!         .with_delta(delta)
//!         .build_with(&differ);
//!     graph.insert(commit);
//! }
//! assert_eq!(graph.heads().len(), 2);
//!
//! let mut merges = Vec::new();
//! let head = merge_heads(
//!     &graph.heads(),
//!     |a, b| a.cmp(b),
//!     |r| graph.parents(r),
//!     |base, left, right, _depth| {
//!         merges.push((base.cloned(), left.clone(), right.clone()));
//!         Ok(format!("{}+{}", left.short(), right.short()).into())
//!     },
//! )
//! .unwrap();
//!
//! assert!(head.is_some());
//! assert_eq!(merges.len(), 1);
//! assert_eq!(merges[0].0.as_ref(), Some(&init.id));
//! ```

mod branch;
mod commit;
mod differ;
mod docs;
mod error;
mod graph;
mod hash;
mod merge;

pub use branch::{Branch, PendingMerge};
pub use commit::{Commit, CommitBuilder};
pub use differ::{Differ, MergeResult, Splice, TextDiffer};
pub use docs::DocCache;
pub use error::{GraphError, Result};
pub use graph::CommitGraph;
pub use hash::{compute_ref, CommitRef, Hasher};
pub use merge::{merge_heads, CommitParents};
