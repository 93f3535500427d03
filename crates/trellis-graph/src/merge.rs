//! Deterministic multi-way merge over the commit DAG.
//!
//! [`merge_heads`] walks backwards from every head in lock step. When one
//! walker reaches a commit another walker has already seen, that commit is a
//! common ancestor and the two heads are folded into a single merge commit.
//! Heads whose histories never meet are folded pairwise at the end with no
//! merge base.
//!
//! Given the same head set, the same `sort_refs` and a deterministic `merge`
//! callback, every client issues the identical sequence of merge calls and
//! ends on the identical ref. Divergent clients converge through this alone,
//! so the visitor ordering and the left/right assignment must not change.

use crate::error::{GraphError, Result};
use crate::hash::CommitRef;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::trace;

/// Parent refs of a commit, as needed by the merge walk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitParents {
    pub base_ref: Option<CommitRef>,
    pub merge_ref: Option<CommitRef>,
}

/// One walker per remaining head.
#[derive(Debug)]
struct Visitor {
    head: CommitRef,
    current: BTreeSet<CommitRef>,
    seen: BTreeSet<CommitRef>,
}

impl Visitor {
    fn new(head: CommitRef) -> Self {
        Visitor {
            current: BTreeSet::from([head.clone()]),
            seen: BTreeSet::from([head.clone()]),
            head,
        }
    }
}

/// Total order used everywhere a pair of refs has to be ordered: the caller's
/// order first, then plain string order.
fn compare<S>(sort_refs: &mut S, a: &CommitRef, b: &CommitRef) -> Ordering
where
    S: FnMut(&CommitRef, &CommitRef) -> Ordering,
{
    sort_refs(a, b).then_with(|| a.cmp(b))
}

/// Fold a set of heads into one.
///
/// `merge(base, left, right, depth)` must create a commit with `left` and
/// `right` as parents and return its ref. `left` always sorts before `right`.
/// `depth` is the walk round in which the common ancestor was found.
///
/// Returns `Ok(None)` only when `head_refs` is empty. Fails with
/// [`GraphError::CorruptHistory`] if a merge base equals one of its sides,
/// and propagates errors from `get_commit` and `merge`.
pub fn merge_heads<S, G, M>(
    head_refs: &[CommitRef],
    mut sort_refs: S,
    mut get_commit: G,
    mut merge: M,
) -> Result<Option<CommitRef>>
where
    S: FnMut(&CommitRef, &CommitRef) -> Ordering,
    G: FnMut(&CommitRef) -> Result<CommitParents>,
    M: FnMut(Option<&CommitRef>, &CommitRef, &CommitRef, usize) -> Result<CommitRef>,
{
    let unique: BTreeSet<CommitRef> = head_refs.iter().cloned().collect();
    let mut visitors: Vec<Visitor> = unique.into_iter().map(Visitor::new).collect();
    visitors.sort_by(|a, b| compare(&mut sort_refs, &a.head, &b.head));

    let mut depth = 0usize;

    while visitors.len() > 1 {
        depth += 1;

        // Fold every pair that shares an ancestor, rescanning after each fold.
        while visitors.len() > 1 {
            let Some((i, j, ancestor)) = find_common_ancestor(&visitors) else {
                break;
            };
            fold(&mut visitors, i, j, Some(&ancestor), depth, &mut sort_refs, &mut merge)?;
        }

        if visitors.len() <= 1 || visitors.iter().all(|v| v.current.is_empty()) {
            break;
        }

        for visitor in visitors.iter_mut() {
            let mut next = BTreeSet::new();
            for r in &visitor.current {
                let parents = get_commit(r)?;
                for parent in [parents.base_ref, parents.merge_ref].into_iter().flatten() {
                    visitor.seen.insert(parent.clone());
                    next.insert(parent);
                }
            }
            visitor.current = next;
        }
    }

    // Remaining visitors have unconnected roots.
    while visitors.len() > 1 {
        fold(&mut visitors, 0, 1, None, depth, &mut sort_refs, &mut merge)?;
    }

    Ok(visitors.pop().map(|v| v.head))
}

/// First frontier ref of visitor `i` that visitor `j` has already seen.
fn find_common_ancestor(visitors: &[Visitor]) -> Option<(usize, usize, CommitRef)> {
    for (i, visitor) in visitors.iter().enumerate() {
        for r in &visitor.current {
            let found = visitors
                .iter()
                .enumerate()
                .find(|(j, other)| *j != i && other.seen.contains(r));
            if let Some((j, _)) = found {
                return Some((i, j, r.clone()));
            }
        }
    }
    None
}

/// Merge visitor `j` into visitor `i`, which keeps its place; `j` is spliced
/// out.
fn fold<S, M>(
    visitors: &mut Vec<Visitor>,
    i: usize,
    j: usize,
    base: Option<&CommitRef>,
    depth: usize,
    sort_refs: &mut S,
    merge: &mut M,
) -> Result<()>
where
    S: FnMut(&CommitRef, &CommitRef) -> Ordering,
    M: FnMut(Option<&CommitRef>, &CommitRef, &CommitRef, usize) -> Result<CommitRef>,
{
    let consumed = visitors.remove(j);
    let keep = if j < i { i - 1 } else { i };
    let kept = &mut visitors[keep];

    let (left, right) = match compare(sort_refs, &kept.head, &consumed.head) {
        Ordering::Greater => (&consumed.head, &kept.head),
        _ => (&kept.head, &consumed.head),
    };

    if let Some(base) = base {
        if base == left || base == right {
            return Err(GraphError::CorruptHistory { base: base.clone() });
        }
    }

    trace!(?base, %left, %right, depth, "merging heads");
    let merged = merge(base, left, right, depth)?;

    kept.head = merged;
    kept.current.extend(consumed.current);
    kept.seen.extend(consumed.seen);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Test DAG keyed by literal ref names.
    struct Dag(HashMap<CommitRef, CommitParents>);

    impl Dag {
        fn new(edges: &[(&str, Option<&str>, Option<&str>)]) -> Self {
            Dag(edges
                .iter()
                .map(|(r, base, merge)| {
                    (
                        CommitRef::from(*r),
                        CommitParents {
                            base_ref: base.map(CommitRef::from),
                            merge_ref: merge.map(CommitRef::from),
                        },
                    )
                })
                .collect())
        }

        fn get(&self, r: &CommitRef) -> Result<CommitParents> {
            self.0
                .get(r)
                .cloned()
                .ok_or_else(|| GraphError::MissingCommit(r.clone()))
        }
    }

    type Call = (Option<String>, String, String, usize);

    fn run(dag: Dag, heads: &[&str]) -> (Option<CommitRef>, Vec<Call>) {
        let heads: Vec<CommitRef> = heads.iter().map(|h| CommitRef::from(*h)).collect();
        let edges = RefCell::new(dag.0);
        let mut calls = Vec::new();
        let merged = merge_heads(
            &heads,
            |a, b| a.cmp(b),
            |r| {
                edges
                    .borrow()
                    .get(r)
                    .cloned()
                    .ok_or_else(|| GraphError::MissingCommit(r.clone()))
            },
            |base, left, right, depth| {
                calls.push((
                    base.map(|b| b.to_string()),
                    left.to_string(),
                    right.to_string(),
                    depth,
                ));
                let id = CommitRef::from(format!("({}+{})", left, right));
                edges.borrow_mut().insert(
                    id.clone(),
                    CommitParents {
                        base_ref: Some(left.clone()),
                        merge_ref: Some(right.clone()),
                    },
                );
                Ok(id)
            },
        )
        .unwrap();
        (merged, calls)
    }

    #[test]
    fn test_empty_heads() {
        let dag = Dag::new(&[]);
        let (merged, calls) = run(dag, &[]);
        assert!(merged.is_none());
        assert!(calls.is_empty());
    }

    #[test]
    fn test_single_head_is_returned() {
        let dag = Dag::new(&[("a", None, None)]);
        let (merged, calls) = run(dag, &["a"]);
        assert_eq!(merged, Some(CommitRef::from("a")));
        assert!(calls.is_empty());
    }

    #[test]
    fn test_unconnected_roots() {
        let dag = Dag::new(&[
            ("foo1", None, None),
            ("foo2", Some("foo1"), None),
            ("foo3", Some("foo2"), None),
            ("bar1", None, None),
            ("bar2", Some("bar1"), None),
            ("bar3", Some("bar2"), None),
        ]);
        let (merged, calls) = run(dag, &["foo3", "bar3"]);
        assert_eq!(
            calls,
            vec![(None, "bar3".to_string(), "foo3".to_string(), 4)]
        );
        assert_eq!(merged, Some(CommitRef::from("(bar3+foo3)")));
    }

    #[test]
    fn test_shared_parent() {
        let dag = Dag::new(&[
            ("init", None, None),
            ("b", Some("init"), None),
            ("a", Some("init"), None),
        ]);
        let (merged, calls) = run(dag, &["b", "a"]);
        assert_eq!(
            calls,
            vec![(Some("init".to_string()), "a".to_string(), "b".to_string(), 2)]
        );
        assert_eq!(merged, Some(CommitRef::from("(a+b)")));
    }

    #[test]
    fn test_three_way_fold() {
        let dag = Dag::new(&[
            ("init", None, None),
            ("a", Some("init"), None),
            ("b", Some("init"), None),
            ("c", Some("init"), None),
        ]);
        let (merged, calls) = run(dag, &["c", "a", "b"]);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (Some("init".into()), "a".into(), "b".into(), 2));
        assert_eq!(calls[1], (Some("init".into()), "(a+b)".into(), "c".into(), 2));
        assert_eq!(merged, Some(CommitRef::from("((a+b)+c)")));
    }

    #[test]
    fn test_uneven_depths() {
        // a1 is one step from init, b3 is three.
        let dag = Dag::new(&[
            ("init", None, None),
            ("a1", Some("init"), None),
            ("b1", Some("init"), None),
            ("b2", Some("b1"), None),
            ("b3", Some("b2"), None),
        ]);
        let (merged, calls) = run(dag, &["a1", "b3"]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_deref(), Some("init"));
        assert_eq!(merged, Some(CommitRef::from("(a1+b3)")));
    }

    #[test]
    fn test_head_order_does_not_matter() {
        let edges = [
            ("init", None, None),
            ("a", Some("init"), None),
            ("b", Some("init"), None),
            ("c", Some("a"), None),
            ("d", Some("b"), None),
            ("e", Some("init"), None),
        ];
        let (m1, c1) = run(Dag::new(&edges), &["c", "d", "e"]);
        let (m2, c2) = run(Dag::new(&edges), &["e", "c", "d"]);
        assert_eq!(m1, m2);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_fold_keeps_result_in_first_slot() {
        let mut visitors: Vec<Visitor> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|r| Visitor::new(CommitRef::from(r)))
            .collect();
        let base = CommitRef::from("init");
        let mut calls = Vec::new();
        fold(
            &mut visitors,
            2,
            0,
            Some(&base),
            3,
            &mut |a: &CommitRef, b: &CommitRef| a.cmp(b),
            &mut |_: Option<&CommitRef>, left: &CommitRef, right: &CommitRef, _: usize| {
                calls.push((left.to_string(), right.to_string()));
                Ok(CommitRef::from(format!("({}+{})", left, right)))
            },
        )
        .unwrap();

        // Sides are ordered by ref, the slot by the visitor that found the base.
        assert_eq!(calls, vec![("a".to_string(), "c".to_string())]);
        let heads: Vec<&str> = visitors.iter().map(|v| v.head.as_str()).collect();
        assert_eq!(heads, vec!["b", "(a+c)", "d"]);
        assert!(visitors[1].seen.contains(&CommitRef::from("a")));
    }

    #[test]
    fn test_corrupt_history_is_rejected() {
        // "a" is an ancestor of "b", so the walk finds "a" as the merge base
        // of itself.
        let dag = Dag::new(&[("a", None, None), ("b", Some("a"), None)]);
        let heads = [CommitRef::from("a"), CommitRef::from("b")];
        let result = merge_heads(
            &heads,
            |a, b| a.cmp(b),
            |r| dag.get(r),
            |_, _, _, _| Ok(CommitRef::from("never")),
        );
        assert_eq!(
            result,
            Err(GraphError::CorruptHistory {
                base: CommitRef::from("a")
            })
        );
    }

    #[test]
    fn test_missing_commit_propagates() {
        let dag = Dag::new(&[("a", Some("ghost"), None), ("b", None, None)]);
        let heads = [CommitRef::from("a"), CommitRef::from("b")];
        let result = merge_heads(
            &heads,
            |a, b| a.cmp(b),
            |r| dag.get(r),
            |_, _, _, _| Ok(CommitRef::from("m")),
        );
        assert_eq!(result, Err(GraphError::MissingCommit(CommitRef::from("ghost"))));
    }
}
