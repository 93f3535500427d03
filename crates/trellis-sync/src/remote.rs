//! Remote transport abstraction and an in-memory sync server.

use crate::error::{ErrorCode, Result, SyncError};
use crate::event::{AckEvent, CommitAck, ErrorEvent, RefError, SyncEvent};
use crate::repository::RemoteSyncInfo;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use trellis_graph::{Commit, CommitRef};

/// Connection to the sync server for one document.
#[async_trait]
pub trait Remote: Send + Sync + 'static {
    /// Open the connection, resuming after `info.last_sync_cursor`.
    ///
    /// The server replies on the [`listen`](Remote::listen) sink with the
    /// backlog and then `ready`.
    async fn connect(&self, info: RemoteSyncInfo) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn send(&self, event: SyncEvent) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    /// Register where inbound events go. Must be called before `connect`.
    fn listen(&self, sink: mpsc::UnboundedSender<SyncEvent>);

    /// Whether the connection is currently open.
    fn active(&self) -> bool;
}

struct Connection {
    sink: mpsc::UnboundedSender<SyncEvent>,
}

#[derive(Default)]
struct ServerState {
    /// Commits in arrival order; a commit's cursor is its index + 1.
    log: Vec<Commit>,
    stored: HashSet<CommitRef>,
    connections: HashMap<u64, Connection>,
    next_conn: u64,
    hold_acks: bool,
    held: Vec<(u64, AckEvent)>,
    rejected: HashSet<CommitRef>,
    refusing: bool,
    connects: usize,
}

impl ServerState {
    fn cursor(&self) -> String {
        self.log.len().to_string()
    }

    fn deliver(&self, conn: u64, event: SyncEvent) {
        if let Some(connection) = self.connections.get(&conn) {
            let _ = connection.sink.send(event);
        }
    }

    fn fan_out(&self, from: u64, event: &SyncEvent) {
        for (id, connection) in &self.connections {
            if *id != from {
                let _ = connection.sink.send(event.clone());
            }
        }
    }

    fn receive(&mut self, conn: u64, event: SyncEvent) {
        match event {
            SyncEvent::Commits {
                commits,
                client_info,
                ..
            } => {
                let mut ack = AckEvent::default();
                let mut fresh = Vec::new();
                for commit in commits {
                    if self.rejected.contains(&commit.id) {
                        ack.ref_errors.push(RefError {
                            id: commit.id,
                            code: ErrorCode::InvalidCommits,
                            message: "commit rejected by server".to_string(),
                        });
                        continue;
                    }
                    ack.acks.push(CommitAck {
                        id: commit.id.clone(),
                        metadata: commit.metadata.clone(),
                    });
                    if self.stored.insert(commit.id.clone()) {
                        self.log.push(commit.clone());
                        fresh.push(commit);
                    }
                }
                ack.sync_id = Some(self.cursor());

                if !fresh.is_empty() {
                    self.fan_out(
                        conn,
                        &SyncEvent::Commits {
                            commits: fresh,
                            sync_id: Some(self.cursor()),
                            client_info,
                        },
                    );
                }
                if self.hold_acks {
                    self.held.push((conn, ack));
                } else {
                    self.deliver(conn, SyncEvent::Ack(ack));
                }
            }
            event @ (SyncEvent::ClientJoin(_)
            | SyncEvent::ClientPresence(_)
            | SyncEvent::ClientLeave(_)) => self.fan_out(conn, &event),
            // Readiness, leadership and relayed status are local concerns.
            _ => {}
        }
    }
}

/// In-memory sync server shared by every [`MemoryRemote`] of one document.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client-side connection to this server.
    pub fn remote(&self) -> MemoryRemote {
        MemoryRemote {
            server: self.state.clone(),
            conn: Mutex::new(None),
            sink: Mutex::new(None),
        }
    }

    /// Withhold acks until released; the commits are still stored.
    pub fn hold_acks(&self, hold: bool) {
        let mut state = self.state.lock();
        state.hold_acks = hold;
        if !hold {
            // Acks for connections that went away are lost.
            for (conn, ack) in std::mem::take(&mut state.held) {
                state.deliver(conn, SyncEvent::Ack(ack));
            }
        }
    }

    /// Drop every connection with a fatal `disconnected` error.
    pub fn disconnect_all(&self) {
        self.drop_connections(None);
    }

    /// Drop every connection with a fatal `disconnected` error carrying the
    /// given reconnect hint.
    pub fn drop_connections(&self, reconnect: Option<bool>) {
        let mut state = self.state.lock();
        let connections = std::mem::take(&mut state.connections);
        state.held.clear();
        info!(count = connections.len(), "server dropping connections");
        for (_, connection) in connections {
            let _ = connection.sink.send(SyncEvent::Error(ErrorEvent {
                code: ErrorCode::Disconnected,
                message: "server closed the connection".to_string(),
                fatal: true,
                reconnect,
            }));
        }
    }

    /// Fail every new connect with a network error while set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refusing = refuse;
    }

    /// Refuse to store `r`, acking it with a per-ref error.
    pub fn reject_ref(&self, r: CommitRef) {
        self.state.lock().rejected.insert(r);
    }

    pub fn accept_ref(&self, r: &CommitRef) {
        self.state.lock().rejected.remove(r);
    }

    pub fn contains(&self, r: &CommitRef) -> bool {
        self.state.lock().stored.contains(r)
    }

    /// Stored commits in arrival order.
    pub fn commits(&self) -> Vec<Commit> {
        self.state.lock().log.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Total successful connects since creation.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }
}

/// Client side of a [`MemoryServer`] connection.
pub struct MemoryRemote {
    server: Arc<Mutex<ServerState>>,
    conn: Mutex<Option<u64>>,
    sink: Mutex<Option<mpsc::UnboundedSender<SyncEvent>>>,
}

impl MemoryRemote {
    fn connection(&self) -> Result<u64> {
        let conn = (*self.conn.lock()).ok_or(SyncError::Disconnected)?;
        if self.server.lock().connections.contains_key(&conn) {
            Ok(conn)
        } else {
            Err(SyncError::Disconnected)
        }
    }
}

#[async_trait]
impl Remote for MemoryRemote {
    async fn connect(&self, info: RemoteSyncInfo) -> Result<()> {
        let sink = self
            .sink
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Internal("listen before connect".into()))?;
        let after = match info.last_sync_cursor.as_deref() {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| SyncError::InvalidSyncId(cursor.to_string()))?,
            None => 0,
        };

        let mut server = self.server.lock();
        if server.refusing {
            return Err(SyncError::Network("server refused the connection".into()));
        }
        if after > server.log.len() {
            return Err(SyncError::InvalidSyncId(after.to_string()));
        }
        let stale = self.conn.lock().take();
        if let Some(stale) = stale {
            server.connections.remove(&stale);
        }
        let id = server.next_conn;
        server.next_conn += 1;
        server.connects += 1;

        let backlog: Vec<Commit> = server.log[after..].to_vec();
        debug!(conn = id, backlog = backlog.len(), "client connected");
        if !backlog.is_empty() {
            let _ = sink.send(SyncEvent::Commits {
                commits: backlog,
                sync_id: Some(server.cursor()),
                client_info: None,
            });
        }
        let _ = sink.send(SyncEvent::Ready);
        server.connections.insert(id, Connection { sink });
        *self.conn.lock() = Some(id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            self.server.lock().connections.remove(&conn);
        }
        Ok(())
    }

    async fn send(&self, event: SyncEvent) -> Result<()> {
        let conn = self.connection()?;
        self.server.lock().receive(conn, event);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.disconnect().await?;
        self.sink.lock().take();
        Ok(())
    }

    fn listen(&self, sink: mpsc::UnboundedSender<SyncEvent>) {
        *self.sink.lock() = Some(sink);
    }

    fn active(&self) -> bool {
        self.connection().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commit(delta: &str) -> Commit {
        Commit::builder().with_delta(json!(delta)).build()
    }

    fn commits_event(commits: Vec<Commit>) -> SyncEvent {
        SyncEvent::Commits {
            commits,
            sync_id: None,
            client_info: None,
        }
    }

    async fn connect(server: &MemoryServer, cursor: Option<&str>) -> (MemoryRemote, mpsc::UnboundedReceiver<SyncEvent>) {
        let remote = server.remote();
        let (tx, rx) = mpsc::unbounded_channel();
        remote.listen(tx);
        remote
            .connect(RemoteSyncInfo {
                last_sync_cursor: cursor.map(String::from),
                first_sync_cursor: None,
            })
            .await
            .unwrap();
        (remote, rx)
    }

    #[tokio::test]
    async fn test_connect_sends_ready() {
        let server = MemoryServer::new();
        let (remote, mut rx) = connect(&server, None).await;
        assert!(remote.active());
        assert_eq!(rx.recv().await, Some(SyncEvent::Ready));
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_ack_and_fan_out() {
        let server = MemoryServer::new();
        let (a, mut rx_a) = connect(&server, None).await;
        let (_b, mut rx_b) = connect(&server, None).await;
        rx_a.recv().await;
        rx_b.recv().await;

        let c1 = commit("one");
        a.send(commits_event(vec![c1.clone()])).await.unwrap();

        match rx_a.recv().await {
            Some(SyncEvent::Ack(ack)) => {
                assert_eq!(ack.acks[0].id, c1.id);
                assert_eq!(ack.sync_id.as_deref(), Some("1"));
            }
            other => panic!("expected ack, got {:?}", other),
        }
        match rx_b.recv().await {
            Some(SyncEvent::Commits { commits, sync_id, .. }) => {
                assert_eq!(commits, vec![c1]);
                assert_eq!(sync_id.as_deref(), Some("1"));
            }
            other => panic!("expected commits, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backlog_after_cursor() {
        let server = MemoryServer::new();
        let (a, _rx_a) = connect(&server, None).await;
        let c1 = commit("one");
        let c2 = commit("two");
        a.send(commits_event(vec![c1, c2.clone()])).await.unwrap();

        let (_b, mut rx_b) = connect(&server, Some("1")).await;
        assert_eq!(
            rx_b.recv().await,
            Some(SyncEvent::Commits {
                commits: vec![c2],
                sync_id: Some("2".into()),
                client_info: None,
            })
        );
        assert_eq!(rx_b.recv().await, Some(SyncEvent::Ready));
    }

    #[tokio::test]
    async fn test_invalid_cursor() {
        let server = MemoryServer::new();
        let remote = server.remote();
        let (tx, _rx) = mpsc::unbounded_channel();
        remote.listen(tx);
        let err = remote
            .connect(RemoteSyncInfo {
                last_sync_cursor: Some("nope".into()),
                first_sync_cursor: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSyncId);
        assert!(!remote.active());
    }

    #[tokio::test]
    async fn test_forced_disconnect() {
        let server = MemoryServer::new();
        let (remote, mut rx) = connect(&server, None).await;
        rx.recv().await;

        server.hold_acks(true);
        remote.send(commits_event(vec![commit("x")])).await.unwrap();
        server.disconnect_all();

        assert!(!remote.active());
        assert!(matches!(rx.recv().await, Some(SyncEvent::Error(e)) if e.fatal));
        assert!(matches!(
            remote.send(SyncEvent::Ready).await,
            Err(SyncError::Disconnected)
        ));
        assert_eq!(server.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_ref() {
        let server = MemoryServer::new();
        let (remote, mut rx) = connect(&server, None).await;
        rx.recv().await;

        let bad = commit("bad");
        server.reject_ref(bad.id.clone());
        remote.send(commits_event(vec![bad.clone()])).await.unwrap();

        match rx.recv().await {
            Some(SyncEvent::Ack(ack)) => {
                assert!(ack.acks.is_empty());
                assert_eq!(ack.ref_errors[0].id, bad.id);
            }
            other => panic!("expected ack, got {:?}", other),
        }
        assert!(!server.contains(&bad.id));
    }
}
