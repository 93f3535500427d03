//! Content-addressed hashing for commits.
//!
//! Uses SHA-256 over a canonical encoding of a commit's parents, delta and
//! metadata to derive its [`CommitRef`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt;

/// Content identifier of a commit.
///
/// Refs are opaque strings. The default hasher renders them as 64 hex
/// characters, but any deterministic, collision-free scheme works as long as
/// every client of a document agrees on it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitRef(String);

impl CommitRef {
    /// Wrap an existing ref string.
    pub fn new(r: impl Into<String>) -> Self {
        CommitRef(r.into())
    }

    /// Get the ref as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated display (first 8 chars).
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Debug for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitRef({})", self.short())
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommitRef {
    fn from(s: &str) -> Self {
        CommitRef(s.to_string())
    }
}

impl From<String> for CommitRef {
    fn from(s: String) -> Self {
        CommitRef(s)
    }
}

impl Borrow<str> for CommitRef {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Hasher utility for computing content hashes.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Hasher {
            inner: Sha256::new(),
        }
    }

    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Feed a length-prefixed field so adjacent fields cannot alias.
    pub fn update_field(&mut self, data: &[u8]) {
        self.inner.update((data.len() as u64).to_le_bytes());
        self.inner.update(data);
    }

    /// Feed an optional ref, distinguishing `None` from an empty string.
    pub fn update_ref(&mut self, r: Option<&CommitRef>) {
        match r {
            Some(r) => {
                self.inner.update([1u8]);
                self.update_field(r.as_str().as_bytes());
            }
            None => self.inner.update([0u8]),
        }
    }

    /// Finalize and return the hex-encoded ref.
    pub fn finalize(self) -> CommitRef {
        let digest = self.inner.finalize();
        CommitRef(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Hash data directly.
    pub fn hash(data: &[u8]) -> CommitRef {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finalize()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the default content ref of a commit.
///
/// `serde_json` keeps object keys sorted, so the JSON encoding of `delta` and
/// `metadata` is canonical.
pub fn compute_ref(
    base_ref: Option<&CommitRef>,
    merge_ref: Option<&CommitRef>,
    delta: &Value,
    metadata: &Value,
) -> CommitRef {
    let mut hasher = Hasher::new();
    hasher.update_ref(base_ref);
    hasher.update_ref(merge_ref);
    hasher.update_field(delta.to_string().as_bytes());
    hasher.update_field(metadata.to_string().as_bytes());
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_deterministic() {
        let h1 = Hasher::hash(b"hello world");
        let h2 = Hasher::hash(b"hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.as_str().len(), 64);
    }

    #[test]
    fn test_ref_depends_on_parents() {
        let delta = json!({"at": 0, "remove": 0, "insert": "x"});
        let a = compute_ref(None, None, &delta, &Value::Null);
        let b = compute_ref(Some(&CommitRef::from("init")), None, &delta, &Value::Null);
        let c = compute_ref(None, Some(&CommitRef::from("init")), &delta, &Value::Null);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_ref_depends_on_metadata() {
        let delta = json!("d");
        let a = compute_ref(None, None, &delta, &json!({"user": "a"}));
        let b = compute_ref(None, None, &delta, &json!({"user": "b"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_short() {
        assert_eq!(CommitRef::from("abcdef0123").short(), "abcdef01");
        assert_eq!(CommitRef::from("foo3").short(), "foo3");
    }
}
