//! Commit persistence.

use crate::error::{ErrorCode, Result, SyncError};
use crate::event::{AckEvent, CommitAck, RefError};
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_graph::{Commit, CommitRef};

/// Where the remote stream left off for this repository.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSyncInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_sync_cursor: Option<String>,
}

/// Durable commit storage for one document.
///
/// Both commit streams are lazy and restartable: every call starts a fresh
/// pass over the current contents.
#[async_trait]
pub trait CommitRepository: Send + Sync + 'static {
    /// Every stored commit, parents before children.
    fn get_local_commits(&self) -> BoxStream<'static, Result<Commit>>;

    /// Stored commits the remote has not acknowledged yet.
    fn get_commits_for_remote(&self) -> BoxStream<'static, Result<Commit>>;

    /// Persist commits. `remote_sync_id` is set for commits that came from
    /// the remote, and advances the remote cursor.
    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        remote_sync_id: Option<String>,
    ) -> Result<AckEvent>;

    /// Record that the remote has persisted these commits.
    async fn acknowledge_remote_commits(
        &self,
        acks: &[CommitAck],
        remote_sync_id: Option<String>,
    ) -> Result<()>;

    async fn get_remote_sync_info(&self) -> Result<RemoteSyncInfo>;

    async fn shutdown(&self) -> Result<()>;
}

#[derive(Default)]
struct RepoState {
    log: Vec<Commit>,
    index: HashMap<CommitRef, usize>,
    remote_acked: HashSet<CommitRef>,
    sync_info: RemoteSyncInfo,
    next_seq: u64,
    rejected: HashSet<CommitRef>,
}

impl RepoState {
    /// Attach storage bookkeeping to `metadata`.
    fn enrich(&mut self, metadata: Value) -> Value {
        self.next_seq += 1;
        let seq = Value::from(self.next_seq);
        match metadata {
            Value::Object(mut map) => {
                map.insert("localSeq".to_string(), seq);
                Value::Object(map)
            }
            Value::Null => serde_json::json!({ "localSeq": seq }),
            other => serde_json::json!({ "localSeq": seq, "value": other }),
        }
    }

    fn advance_cursor(&mut self, sync_id: Option<String>) {
        if let Some(id) = sync_id {
            if self.sync_info.first_sync_cursor.is_none() {
                self.sync_info.first_sync_cursor = Some(id.clone());
            }
            self.sync_info.last_sync_cursor = Some(id);
        }
    }
}

/// In-memory repository.
///
/// Handles made with [`share`](MemoryRepository::share) see the same commits,
/// the way several clients on one device share a database. Each handle shuts
/// down independently.
pub struct MemoryRepository {
    state: Arc<Mutex<RepoState>>,
    closed: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RepoState::default())),
            closed: AtomicBool::new(false),
        }
    }

    /// Another handle onto the same storage.
    pub fn share(&self) -> Self {
        Self {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Refuse to store `r`, reporting a per-ref error instead.
    pub fn reject_ref(&self, r: CommitRef) {
        self.state.lock().rejected.insert(r);
    }

    pub fn accept_ref(&self, r: &CommitRef) {
        self.state.lock().rejected.remove(r);
    }

    pub fn get(&self, r: &CommitRef) -> Option<Commit> {
        let state = self.state.lock();
        state.index.get(r).map(|&i| state.log[i].clone())
    }

    pub fn is_remote_acked(&self, r: &CommitRef) -> bool {
        self.state.lock().remote_acked.contains(r)
    }

    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    /// Lazily walk the log, re-reading shared state at every step.
    fn scan<F>(&self, keep: F) -> BoxStream<'static, Result<Commit>>
    where
        F: Fn(&RepoState, &Commit) -> bool + Send + 'static,
    {
        let state = self.state.clone();
        let closed = self.closed.load(Ordering::SeqCst);
        Box::pin(stream! {
            if closed {
                yield Err(SyncError::Closed);
                return;
            }
            let mut i = 0;
            loop {
                let next = {
                    let state = state.lock();
                    let mut found = None;
                    while let Some(commit) = state.log.get(i) {
                        i += 1;
                        if keep(&*state, commit) {
                            found = Some(commit.clone());
                            break;
                        }
                    }
                    found
                };
                match next {
                    Some(commit) => yield Ok(commit),
                    None => break,
                }
            }
        })
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommitRepository for MemoryRepository {
    fn get_local_commits(&self) -> BoxStream<'static, Result<Commit>> {
        self.scan(|_, _| true)
    }

    fn get_commits_for_remote(&self) -> BoxStream<'static, Result<Commit>> {
        self.scan(|state, commit| !state.remote_acked.contains(&commit.id))
    }

    async fn add_commits(
        &self,
        commits: Vec<Commit>,
        remote_sync_id: Option<String>,
    ) -> Result<AckEvent> {
        self.check_open()?;
        let mut state = self.state.lock();
        let from_remote = remote_sync_id.is_some();
        let mut ack = AckEvent {
            sync_id: remote_sync_id.clone(),
            ..Default::default()
        };

        for mut commit in commits {
            if state.rejected.contains(&commit.id) {
                warn!(commit = %commit.id, "rejecting commit");
                ack.ref_errors.push(RefError {
                    id: commit.id,
                    code: ErrorCode::InvalidCommits,
                    message: "commit rejected by repository".to_string(),
                });
                continue;
            }
            if from_remote {
                state.remote_acked.insert(commit.id.clone());
            }
            if let Some(&i) = state.index.get(&commit.id) {
                ack.acks.push(CommitAck {
                    id: commit.id,
                    metadata: state.log[i].metadata.clone(),
                });
                continue;
            }
            commit.metadata = state.enrich(commit.metadata);
            ack.acks.push(CommitAck {
                id: commit.id.clone(),
                metadata: commit.metadata.clone(),
            });
            let i = state.log.len();
            state.index.insert(commit.id.clone(), i);
            state.log.push(commit);
        }

        state.advance_cursor(remote_sync_id);
        debug!(
            acked = ack.acks.len(),
            rejected = ack.ref_errors.len(),
            from_remote,
            "stored commits"
        );
        Ok(ack)
    }

    async fn acknowledge_remote_commits(
        &self,
        acks: &[CommitAck],
        remote_sync_id: Option<String>,
    ) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        for ack in acks {
            state.remote_acked.insert(ack.id.clone());
        }
        state.advance_cursor(remote_sync_id);
        Ok(())
    }

    async fn get_remote_sync_info(&self) -> Result<RemoteSyncInfo> {
        self.check_open()?;
        Ok(self.state.lock().sync_info.clone())
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn commit(base: Option<&Commit>, delta: &str) -> Commit {
        Commit::builder()
            .with_base_ref(base.map(|b| b.id.clone()))
            .with_delta(json!(delta))
            .build()
    }

    async fn collect(stream: BoxStream<'static, Result<Commit>>) -> Vec<CommitRef> {
        stream.map(|c| c.unwrap().id).collect().await
    }

    #[tokio::test]
    async fn test_add_commits_enriches_metadata() {
        let repo = MemoryRepository::new();
        let c1 = commit(None, "a");
        let ack = repo.add_commits(vec![c1.clone()], None).await.unwrap();

        assert_eq!(ack.acks.len(), 1);
        assert_eq!(ack.acks[0].metadata["localSeq"], 1);
        assert_eq!(repo.get(&c1.id).unwrap().id, c1.id);

        // Re-adding is idempotent and reports the stored metadata.
        let again = repo.add_commits(vec![c1.clone()], None).await.unwrap();
        assert_eq!(again.acks[0].metadata["localSeq"], 1);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_streams_are_restartable() {
        let repo = MemoryRepository::new();
        let c1 = commit(None, "a");
        let c2 = commit(Some(&c1), "b");
        repo.add_commits(vec![c1.clone(), c2.clone()], None).await.unwrap();

        let first = collect(repo.get_local_commits()).await;
        let second = collect(repo.get_local_commits()).await;
        assert_eq!(first, vec![c1.id.clone(), c2.id.clone()]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_remote_tracking() {
        let repo = MemoryRepository::new();
        let local = commit(None, "local");
        let remote = commit(None, "remote");
        repo.add_commits(vec![local.clone()], None).await.unwrap();
        repo.add_commits(vec![remote.clone()], Some("4".into()))
            .await
            .unwrap();

        assert_eq!(collect(repo.get_commits_for_remote()).await, vec![local.id.clone()]);

        let info = repo.get_remote_sync_info().await.unwrap();
        assert_eq!(info.last_sync_cursor.as_deref(), Some("4"));
        assert_eq!(info.first_sync_cursor.as_deref(), Some("4"));

        repo.acknowledge_remote_commits(
            &[CommitAck {
                id: local.id.clone(),
                metadata: Value::Null,
            }],
            Some("5".into()),
        )
        .await
        .unwrap();
        assert!(repo.is_remote_acked(&local.id));
        assert!(collect(repo.get_commits_for_remote()).await.is_empty());
        let info = repo.get_remote_sync_info().await.unwrap();
        assert_eq!(info.last_sync_cursor.as_deref(), Some("5"));
        assert_eq!(info.first_sync_cursor.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_rejected_ref_is_partial_failure() {
        let repo = MemoryRepository::new();
        let good = commit(None, "good");
        let bad = commit(None, "bad");
        repo.reject_ref(bad.id.clone());

        let ack = repo.add_commits(vec![good.clone(), bad.clone()], None).await.unwrap();
        assert!(ack.is_partial());
        assert_eq!(ack.acks.len(), 1);
        assert_eq!(ack.ref_errors[0].id, bad.id);
        assert_eq!(ack.ref_errors[0].code, ErrorCode::InvalidCommits);
    }

    #[tokio::test]
    async fn test_shared_handles() {
        let repo = MemoryRepository::new();
        let other = repo.share();
        let c1 = commit(None, "a");
        other.add_commits(vec![c1.clone()], None).await.unwrap();
        assert!(repo.get(&c1.id).is_some());

        other.shutdown().await.unwrap();
        assert_eq!(
            other.add_commits(vec![], None).await.unwrap_err(),
            SyncError::Closed
        );
        assert!(repo.add_commits(vec![], None).await.is_ok());
    }
}
