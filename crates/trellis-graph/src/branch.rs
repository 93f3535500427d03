//! Local edit branch tracked against the converged main line.
//!
//! A branch is a linear run of local commits hanging off `root`, the last
//! commit shared with main:
//!
//! ```text
//! root -> c1 -> c2 (edit) -> t1 -> t2 (temp)
//! ```
//!
//! `edit` is the newest commit that must reach the store, `temp` the newest
//! commit overall. Commits after `edit` are ephemeral and are dropped if main
//! moves past them before a non-ephemeral edit folds them in.
//!
//! Nodes live in an arena keyed by ref; links are followed by looking up
//! `base_ref`, never through owning pointers.

use crate::commit::Commit;
use crate::error::{GraphError, Result};
use crate::hash::CommitRef;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

/// A merge the client has produced but main has not confirmed yet.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingMerge {
    /// `edit` at the time of the merge attempt.
    pub base: CommitRef,
    /// The merge commit itself.
    pub commit: Commit,
}

/// Per-client view of divergence between local edits and main.
#[derive(Clone, Debug, Default)]
pub struct Branch {
    nodes: HashMap<CommitRef, Commit>,
    root: Option<CommitRef>,
    edit: Option<CommitRef>,
    temp: Option<CommitRef>,
    /// Last `edit` already handed out by `advance_branch`.
    flushed: Option<CommitRef>,
    merge: Option<PendingMerge>,
    dirty_since: Option<Instant>,
}

impl Branch {
    /// An empty branch rooted before the first commit of a document.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clean branch rooted at `commit`.
    pub fn at(commit: Commit) -> Self {
        let mut branch = Self::new();
        branch.checkout(commit);
        branch
    }

    pub fn root(&self) -> Option<&CommitRef> {
        self.root.as_ref()
    }

    pub fn edit(&self) -> Option<&CommitRef> {
        self.edit.as_ref()
    }

    pub fn temp(&self) -> Option<&CommitRef> {
        self.temp.as_ref()
    }

    /// The in-flight merge, if any.
    pub fn pending_merge(&self) -> Option<&PendingMerge> {
        self.merge.as_ref()
    }

    /// When main first diverged from unmerged local edits.
    pub fn dirty_since(&self) -> Option<Instant> {
        self.dirty_since
    }

    /// Local edits exist that main has not confirmed.
    pub fn has_edits(&self) -> bool {
        self.root != self.edit
    }

    /// Main moved on without the local edits; a merge is required.
    pub fn needs_merge(&self) -> bool {
        self.dirty_since.is_some()
    }

    /// Check if a commit is tracked by the branch.
    pub fn contains(&self, r: &CommitRef) -> bool {
        self.nodes.contains_key(r)
    }

    /// Look up a tracked commit.
    pub fn get(&self, r: &CommitRef) -> Option<&Commit> {
        self.nodes.get(r)
    }

    /// Number of commits strictly after `root` up to and including `temp`.
    pub fn size(&self) -> usize {
        self.path(self.temp.as_ref(), self.root.as_ref()).len()
    }

    /// Append a local commit after `temp`.
    ///
    /// Returns every commit newly folded into `edit` since the previous call,
    /// oldest first. Ephemeral (`is_temp`) commits return nothing until a later
    /// non-ephemeral commit covers them.
    pub fn advance_branch(&mut self, commit: Commit, is_temp: bool) -> Result<Vec<Commit>> {
        if commit.is_merge() {
            return Err(GraphError::UnexpectedMerge(commit.id));
        }
        if self.contains(&commit.id) {
            return Err(GraphError::CyclicCommit(commit.id));
        }
        if commit.base_ref != self.temp {
            return Err(GraphError::OutOfOrder {
                expected: self.temp.clone(),
                found: commit.base_ref.clone(),
                commit: commit.id,
            });
        }

        let id = commit.id.clone();
        self.nodes.insert(id.clone(), commit);
        self.temp = Some(id.clone());

        if is_temp {
            return Ok(Vec::new());
        }

        self.edit = Some(id);
        let stop = self.flushed.clone();
        let mut newly: Vec<Commit> = self
            .path(self.edit.as_ref(), stop.as_ref())
            .iter()
            .filter_map(|r| self.nodes.get(r).cloned())
            .collect();
        newly.reverse();
        self.flushed = self.edit.clone();
        Ok(newly)
    }

    /// Record an in-flight merge of `edit` with main.
    pub fn attempt_merge(&mut self, commit: Commit) -> Result<()> {
        if let Some(pending) = &self.merge {
            return Err(GraphError::MergeInFlight(pending.commit.id.clone()));
        }
        let edit = match (&self.edit, self.has_edits()) {
            (Some(edit), true) => edit.clone(),
            _ => return Err(GraphError::NoEdits),
        };
        if !commit.has_parent(&edit) {
            return Err(GraphError::InvalidMerge {
                commit: commit.id,
                edit,
            });
        }
        debug!(merge = %commit.id, edit = %edit, "merge in flight");
        self.merge = Some(PendingMerge { base: edit, commit });
        Ok(())
    }

    /// Fold one accepted main-line commit into the branch.
    ///
    /// Returns `true` iff the visible head (`temp`) changed.
    pub fn advance_main(&mut self, commit: &Commit) -> bool {
        // Main confirmed our merge.
        if let Some(pending) = self.merge.take() {
            if pending.commit.id == commit.id {
                // Ephemeral commits made since the attempt are dropped.
                if self.edit.as_ref() == Some(&pending.base) {
                    self.checkout(commit.clone());
                    return true;
                }
                // Late merge: edits landed after the merge was attempted. The
                // merged edit becomes the new root and the rest stays open.
                debug!(merge = %commit.id, base = %pending.base, "late merge");
                self.prune_to(pending.base);
                self.dirty_since.get_or_insert_with(Instant::now);
                return false;
            }
            self.merge = Some(pending);
        }

        // Main confirmed one of our own commits.
        if self.contains(&commit.id) {
            self.prune_to(commit.id.clone());
            return false;
        }

        if !self.has_edits() {
            let changed = self.temp.as_ref() != Some(&commit.id);
            self.checkout(commit.clone());
            return changed;
        }

        self.dirty_since.get_or_insert_with(Instant::now);
        false
    }

    /// Reset to a clean branch rooted at `commit`.
    pub fn checkout(&mut self, commit: Commit) {
        let id = commit.id.clone();
        self.nodes.clear();
        self.nodes.insert(id.clone(), commit);
        self.root = Some(id.clone());
        self.edit = Some(id.clone());
        self.temp = Some(id.clone());
        self.flushed = Some(id);
        self.merge = None;
        self.dirty_since = None;
    }

    /// Refs from `from` back to (excluding) `until`, newest first.
    fn path(&self, from: Option<&CommitRef>, until: Option<&CommitRef>) -> Vec<CommitRef> {
        let mut out = Vec::new();
        let mut cursor = from.cloned();
        while let Some(r) = cursor {
            if Some(&r) == until || Some(&r) == self.root.as_ref() {
                break;
            }
            cursor = self.nodes.get(&r).and_then(|c| c.base_ref.clone());
            out.push(r);
        }
        out
    }

    /// Move `root` forward to `new_root`, dropping everything behind it.
    fn prune_to(&mut self, new_root: CommitRef) {
        if self.root.as_ref() == Some(&new_root) {
            return;
        }
        let old_root = self.root.clone();
        let covered: HashSet<CommitRef> = self
            .path(Some(&new_root), old_root.as_ref())
            .into_iter()
            .collect();

        for r in &covered {
            if r != &new_root {
                self.nodes.remove(r);
            }
        }
        if let Some(old) = old_root {
            self.nodes.remove(&old);
        }
        self.root = Some(new_root.clone());

        let edit_covered = self.edit.as_ref().map_or(true, |e| covered.contains(e));
        if edit_covered {
            self.edit = Some(new_root.clone());
            self.dirty_since = None;
            if self.temp.as_ref().map_or(true, |t| covered.contains(t)) {
                self.temp = Some(new_root.clone());
            }
        }
        if self.flushed.as_ref().map_or(true, |f| !self.nodes.contains_key(f)) {
            self.flushed = Some(new_root);
        }
    }
}
