//! Document materialisation over the commit DAG.

use crate::commit::Commit;
use crate::differ::Differ;
use crate::error::{GraphError, Result};
use crate::hash::CommitRef;
use std::collections::HashMap;

/// Memoised document state per commit ref.
///
/// A commit's document is its `base_ref` document patched with its delta.
/// Merge commits carry a delta against their left parent (`base_ref`), so
/// only the first-parent chain is ever walked.
#[derive(Debug)]
pub struct DocCache<D: Differ> {
    docs: HashMap<CommitRef, D::Doc>,
}

impl<D: Differ> Default for DocCache<D> {
    fn default() -> Self {
        DocCache {
            docs: HashMap::new(),
        }
    }
}

impl<D: Differ> DocCache<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document at `r`, or `None` for the empty history.
    pub fn get<'a, F>(&mut self, differ: &D, r: Option<&CommitRef>, lookup: F) -> Result<Option<D::Doc>>
    where
        F: Fn(&CommitRef) -> Option<&'a Commit>,
    {
        let Some(r) = r else {
            return Ok(None);
        };
        if let Some(doc) = self.docs.get(r) {
            return Ok(Some(doc.clone()));
        }

        // Walk back to the nearest cached ancestor (or the first commit).
        let mut chain = Vec::new();
        let mut cursor = Some(r.clone());
        let mut doc = None;
        while let Some(current) = cursor {
            if let Some(cached) = self.docs.get(&current) {
                doc = Some(cached.clone());
                break;
            }
            let commit = lookup(&current).ok_or_else(|| GraphError::MissingCommit(current.clone()))?;
            cursor = commit.base_ref.clone();
            chain.push(commit);
        }

        for commit in chain.into_iter().rev() {
            let next = differ.patch(doc.as_ref(), &commit.delta)?;
            self.docs.insert(commit.id.clone(), next.clone());
            doc = Some(next);
        }
        Ok(doc)
    }

    /// Seed the cache, e.g. with a document the client just produced.
    pub fn insert(&mut self, r: CommitRef, doc: D::Doc) {
        self.docs.insert(r, doc);
    }

    /// Build the merge commit for `left` and `right` against `base`.
    ///
    /// The delta is taken against `left`, which becomes `base_ref`; `right`
    /// becomes `merge_ref`. The merged document is cached under the new ref.
    pub fn merge_commit<'a, F>(
        &mut self,
        differ: &D,
        base: Option<&CommitRef>,
        left: &CommitRef,
        right: &CommitRef,
        lookup: F,
    ) -> Result<Commit>
    where
        F: Fn(&CommitRef) -> Option<&'a Commit> + Copy,
    {
        let base_doc = self.get(differ, base, lookup)?;
        let left_doc = self
            .get(differ, Some(left), lookup)?
            .ok_or_else(|| GraphError::MissingCommit(left.clone()))?;
        let right_doc = self
            .get(differ, Some(right), lookup)?
            .ok_or_else(|| GraphError::MissingCommit(right.clone()))?;

        let merged = differ.merge(base_doc.as_ref(), &left_doc, &right_doc)?;
        let delta = differ
            .diff(Some(&left_doc), &merged.value)?
            .unwrap_or(serde_json::Value::Null);

        let commit = Commit::builder()
            .with_base_ref(Some(left.clone()))
            .with_merge_ref(right.clone())
            .with_merge_base_ref(base.cloned())
            .with_delta(delta)
            .with_metadata(merged.metadata)
            .build_with(differ);
        self.docs.insert(commit.id.clone(), merged.value);
        Ok(commit)
    }

    /// Drop cached documents whose ref fails `keep`. Evicted documents are
    /// rebuilt from history on demand.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&CommitRef) -> bool,
    {
        self.docs.retain(|r, _| keep(r));
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::TextDiffer;
    use crate::graph::CommitGraph;

    fn edit(graph: &mut CommitGraph, base: Option<&Commit>, from: &str, to: &str) -> Commit {
        let delta = TextDiffer
            .diff(Some(&from.to_string()), &to.to_string())
            .unwrap()
            .unwrap();
        let commit = Commit::builder()
            .with_base_ref(base.map(|b| b.id.clone()))
            .with_delta(delta)
            .build_with(&TextDiffer);
        graph.insert(commit.clone());
        commit
    }

    #[test]
    fn test_materialise_chain() {
        let mut graph = CommitGraph::new();
        let c1 = edit(&mut graph, None, "", "hello");
        let c2 = edit(&mut graph, Some(&c1), "hello", "hello world");

        let mut cache = DocCache::<TextDiffer>::new();
        let doc = cache.get(&TextDiffer, Some(&c2.id), |r| graph.get(r)).unwrap();
        assert_eq!(doc.as_deref(), Some("hello world"));
        assert_eq!(cache.get(&TextDiffer, None, |r| graph.get(r)).unwrap(), None);
    }

    #[test]
    fn test_merge_commit_materialises() {
        let mut graph = CommitGraph::new();
        let init = edit(&mut graph, None, "", "ab");
        let left = edit(&mut graph, Some(&init), "ab", "xab");
        let right = edit(&mut graph, Some(&init), "ab", "aby");

        let mut cache = DocCache::<TextDiffer>::new();
        let merge = {
            let g = &graph;
            cache
                .merge_commit(&TextDiffer, Some(&init.id), &left.id, &right.id, |r| g.get(r))
                .unwrap()
        };
        graph.insert(merge.clone());

        // A fresh cache reaches the same document through the delta.
        let mut fresh = DocCache::<TextDiffer>::new();
        let doc = fresh.get(&TextDiffer, Some(&merge.id), |r| graph.get(r)).unwrap();
        assert_eq!(doc.as_deref(), Some("xaby"));
        assert_eq!(merge.merge_base_ref.as_ref(), Some(&init.id));
    }

    #[test]
    fn test_evicted_docs_are_rebuilt() {
        let mut graph = CommitGraph::new();
        let c1 = edit(&mut graph, None, "", "a");
        let c2 = edit(&mut graph, Some(&c1), "a", "ab");
        let c3 = edit(&mut graph, Some(&c2), "ab", "abc");

        let mut cache = DocCache::<TextDiffer>::new();
        cache.get(&TextDiffer, Some(&c3.id), |r| graph.get(r)).unwrap();
        assert_eq!(cache.len(), 3);

        cache.retain(|r| r == &c3.id);
        assert_eq!(cache.len(), 1);
        let doc = cache.get(&TextDiffer, Some(&c2.id), |r| graph.get(r)).unwrap();
        assert_eq!(doc.as_deref(), Some("ab"));
    }

    #[test]
    fn test_missing_commit() {
        let graph = CommitGraph::new();
        let mut cache = DocCache::<TextDiffer>::new();
        let ghost = CommitRef::from("ghost");
        assert_eq!(
            cache.get(&TextDiffer, Some(&ghost), |r| graph.get(r)),
            Err(GraphError::MissingCommit(ghost))
        );
    }
}
