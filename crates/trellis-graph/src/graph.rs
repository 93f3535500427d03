//! In-memory commit DAG.
//!
//! The graph provides content-addressed storage for commits and tracks heads
//! (commits never referenced as a parent) automatically. Commits may arrive
//! before their parents; such parents are tracked as missing until they show
//! up.

use crate::commit::Commit;
use crate::error::{GraphError, Result};
use crate::hash::CommitRef;
use crate::merge::CommitParents;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// In-memory commit DAG indexed by ref.
#[derive(Clone, Debug, Default)]
pub struct CommitGraph {
    /// All commits indexed by ref.
    commits: HashMap<CommitRef, Commit>,

    /// Insertion order, used for restartable iteration.
    order: Vec<CommitRef>,

    /// Current heads (sorted for deterministic iteration).
    heads: BTreeSet<CommitRef>,

    /// Reverse index: parent -> children.
    children_index: HashMap<CommitRef, HashSet<CommitRef>>,

    /// Referenced but missing commits.
    missing: HashSet<CommitRef>,
}

impl CommitGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a commit. Returns `false` if it was already known.
    pub fn insert(&mut self, commit: Commit) -> bool {
        if self.commits.contains_key(&commit.id) {
            return false;
        }

        let id = commit.id.clone();

        for parent in commit.parents() {
            if !self.commits.contains_key(parent) {
                self.missing.insert(parent.clone());
            }
            self.children_index
                .entry(parent.clone())
                .or_default()
                .insert(id.clone());
            self.heads.remove(parent);
        }

        // Children may have arrived first.
        if !self.children_index.contains_key(&id) {
            self.heads.insert(id.clone());
        }

        self.missing.remove(&id);
        self.order.push(id.clone());
        self.commits.insert(id, commit);
        true
    }

    /// Overwrite a commit's metadata in place. The ref is unchanged.
    pub fn update_metadata(&mut self, id: &CommitRef, metadata: Value) -> Result<()> {
        let commit = self
            .commits
            .get_mut(id)
            .ok_or_else(|| GraphError::MissingCommit(id.clone()))?;
        commit.metadata = metadata;
        Ok(())
    }

    /// Get a commit by ref.
    pub fn get(&self, id: &CommitRef) -> Option<&Commit> {
        self.commits.get(id)
    }

    /// Get a commit's parent refs, failing if it is unknown.
    pub fn parents(&self, id: &CommitRef) -> Result<CommitParents> {
        self.commits
            .get(id)
            .map(|c| CommitParents {
                base_ref: c.base_ref.clone(),
                merge_ref: c.merge_ref.clone(),
            })
            .ok_or_else(|| GraphError::MissingCommit(id.clone()))
    }

    /// Check if a commit exists in the graph.
    pub fn contains(&self, id: &CommitRef) -> bool {
        self.commits.contains_key(id)
    }

    /// Get the current heads, sorted.
    pub fn heads(&self) -> Vec<CommitRef> {
        self.heads.iter().cloned().collect()
    }

    /// Get all ancestors of a commit (transitive closure).
    pub fn ancestors(&self, id: &CommitRef) -> HashSet<CommitRef> {
        let mut result = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(commit) = self.commits.get(id) {
            queue.extend(commit.parents().cloned());
        }

        while let Some(current) = queue.pop_front() {
            if let Some(commit) = self.commits.get(&current) {
                if !result.contains(&current) {
                    queue.extend(commit.parents().cloned());
                }
            }
            result.insert(current);
        }

        result
    }

    /// Check whether `ancestor` is reachable from `descendant` through parents.
    pub fn is_ancestor(&self, ancestor: &CommitRef, descendant: &CommitRef) -> bool {
        ancestor == descendant || self.ancestors(descendant).contains(ancestor)
    }

    /// Get immediate children of a commit.
    pub fn children(&self, id: &CommitRef) -> Vec<CommitRef> {
        let mut children: Vec<_> = self
            .children_index
            .get(id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default();
        children.sort();
        children
    }

    /// Get all commits in topological order (parents before children).
    pub fn topological_order(&self) -> Vec<CommitRef> {
        // Kahn's algorithm, seeded in insertion order for stable output.
        let mut in_degree: HashMap<&CommitRef, usize> = HashMap::new();
        let mut result = Vec::with_capacity(self.order.len());
        let mut queue = VecDeque::new();

        for id in &self.order {
            let commit = &self.commits[id];
            let degree = commit
                .parents()
                .filter(|p| self.commits.contains_key(*p))
                .count();
            in_degree.insert(id, degree);
            if degree == 0 {
                queue.push_back(id);
            }
        }

        while let Some(id) = queue.pop_front() {
            result.push(id.clone());
            for child in self.children(id) {
                if let Some((key, degree)) = in_degree.get_key_value(&child) {
                    let key = *key;
                    let next = degree.saturating_sub(1);
                    in_degree.insert(key, next);
                    if next == 0 {
                        queue.push_back(key);
                    }
                }
            }
        }

        result
    }

    /// Iterate over commits in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Commit> {
        self.order.iter().filter_map(|id| self.commits.get(id))
    }

    /// Get refs that are referenced but not present.
    pub fn missing(&self) -> &HashSet<CommitRef> {
        &self.missing
    }

    /// Get the total number of commits.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}
