//! Host-supplied document functions.
//!
//! The core never looks inside a document. A [`Differ`] turns documents into
//! deltas and back, reconciles two concurrent documents against their common
//! ancestor, and may override how commit refs are computed.

use crate::error::{GraphError, Result};
use crate::hash::{self, CommitRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

/// Output of a three-way merge.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeResult<D> {
    pub value: D,
    pub metadata: Value,
}

/// Pluggable diff/patch/merge functions for the document payload.
pub trait Differ: Send + Sync + 'static {
    /// Materialised document type.
    type Doc: Clone + Debug + PartialEq + Send + Sync + 'static;

    /// Delta turning `prior` into `next`. `None` means the documents are equal.
    fn diff(&self, prior: Option<&Self::Doc>, next: &Self::Doc) -> Result<Option<Value>>;

    /// Apply a delta to `base`.
    fn patch(&self, base: Option<&Self::Doc>, delta: &Value) -> Result<Self::Doc>;

    /// Reconcile `left` and `right` against their common ancestor `base`.
    ///
    /// Must be deterministic: every client merging the same inputs has to
    /// produce the same value and metadata.
    fn merge(
        &self,
        base: Option<&Self::Doc>,
        left: &Self::Doc,
        right: &Self::Doc,
    ) -> Result<MergeResult<Self::Doc>>;

    /// Content ref of a commit. Defaults to SHA-256.
    fn compute_ref(
        &self,
        base_ref: Option<&CommitRef>,
        merge_ref: Option<&CommitRef>,
        delta: &Value,
        metadata: &Value,
    ) -> CommitRef {
        hash::compute_ref(base_ref, merge_ref, delta, metadata)
    }
}

/// A single contiguous replacement, measured in chars.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splice {
    pub at: usize,
    pub remove: usize,
    pub insert: String,
}

impl Splice {
    /// Smallest splice turning `prior` into `next`, or `None` if equal.
    pub fn between(prior: &str, next: &str) -> Option<Splice> {
        if prior == next {
            return None;
        }
        let a: Vec<char> = prior.chars().collect();
        let b: Vec<char> = next.chars().collect();

        let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
        let max_suffix = a.len().min(b.len()) - prefix;
        let suffix = a
            .iter()
            .rev()
            .zip(b.iter().rev())
            .take(max_suffix)
            .take_while(|(x, y)| x == y)
            .count();

        Some(Splice {
            at: prefix,
            remove: a.len() - prefix - suffix,
            insert: b[prefix..b.len() - suffix].iter().collect(),
        })
    }

    /// Saturates so a malformed remote delta fails the bounds check below.
    fn end(&self) -> usize {
        self.at.saturating_add(self.remove)
    }

    /// Apply to `text`, failing if the splice does not fit.
    pub fn apply(&self, text: &str) -> Result<String> {
        let chars: Vec<char> = text.chars().collect();
        if self.end() > chars.len() {
            return Err(GraphError::Differ(format!(
                "splice {}..{} out of bounds for length {}",
                self.at,
                self.end(),
                chars.len()
            )));
        }
        let mut out: String = chars[..self.at].iter().collect();
        out.push_str(&self.insert);
        out.extend(&chars[self.end()..]);
        Ok(out)
    }
}

/// Reference [`Differ`] for plain text documents.
///
/// Deltas are single [`Splice`]s. Concurrent edits that touch disjoint ranges
/// both apply; overlapping edits replace the union of the removed ranges with
/// the left insertion followed by the right one.
#[derive(Clone, Debug, Default)]
pub struct TextDiffer;

impl Differ for TextDiffer {
    type Doc = String;

    fn diff(&self, prior: Option<&String>, next: &String) -> Result<Option<Value>> {
        let prior = prior.map(String::as_str).unwrap_or("");
        Splice::between(prior, next)
            .map(serde_json::to_value)
            .transpose()
            .map_err(GraphError::from)
    }

    fn patch(&self, base: Option<&String>, delta: &Value) -> Result<String> {
        let splice: Splice = serde_json::from_value(delta.clone())?;
        splice.apply(base.map(String::as_str).unwrap_or(""))
    }

    fn merge(
        &self,
        base: Option<&String>,
        left: &String,
        right: &String,
    ) -> Result<MergeResult<String>> {
        let base = base.map(String::as_str).unwrap_or("");
        let value = match (Splice::between(base, left), Splice::between(base, right)) {
            (None, _) => right.clone(),
            (_, None) => left.clone(),
            (Some(l), Some(r)) if l == r => left.clone(),
            (Some(l), Some(r)) => {
                let disjoint = l.end() < r.at || r.end() < l.at;
                if disjoint {
                    // Apply the later splice first so the earlier offsets hold.
                    let (first, second) = if l.at > r.at { (&l, &r) } else { (&r, &l) };
                    second.apply(&first.apply(base)?)?
                } else {
                    let at = l.at.min(r.at);
                    let end = l.end().max(r.end());
                    Splice {
                        at,
                        remove: end - at,
                        insert: format!("{}{}", l.insert, r.insert),
                    }
                    .apply(base)?
                }
            }
        };
        Ok(MergeResult {
            value,
            metadata: Value::Null,
        })
    }
}
