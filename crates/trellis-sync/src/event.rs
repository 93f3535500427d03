//! Sync event taxonomy shared by the store, the remote and the local channel.

use crate::error::ErrorCode;
use crate::leader::LeaderEvent;
use crate::presence::ClientInfo;
use crate::status::RemoteState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_graph::{Commit, CommitRef};

/// Persistence acknowledgement for one commit.
///
/// `metadata` is the commit metadata after repository enrichment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitAck {
    #[serde(rename = "ref")]
    pub id: CommitRef,
    #[serde(default)]
    pub metadata: Value,
}

/// A commit that could not be persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefError {
    #[serde(rename = "ref")]
    pub id: CommitRef,
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckEvent {
    pub acks: Vec<CommitAck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ref_errors: Vec<RefError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
}

impl AckEvent {
    pub fn is_partial(&self) -> bool {
        !self.ref_errors.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
    pub fatal: bool,
    /// `Some(false)` disables the automatic reconnect after a fatal error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
}

/// Events exchanged between the store, its consumer, the remote and other
/// clients on the same device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    Commits {
        commits: Vec<Commit>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_info: Option<ClientInfo>,
    },
    Ack(AckEvent),
    Ready,
    ClientJoin(ClientInfo),
    ClientPresence(ClientInfo),
    ClientLeave(ClientInfo),
    RemoteState(RemoteState),
    Error(ErrorEvent),
    Leader(LeaderEvent),
}

impl SyncEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::Commits { .. } => "commits",
            SyncEvent::Ack(_) => "ack",
            SyncEvent::Ready => "ready",
            SyncEvent::ClientJoin(_) => "client-join",
            SyncEvent::ClientPresence(_) => "client-presence",
            SyncEvent::ClientLeave(_) => "client-leave",
            SyncEvent::RemoteState(_) => "remote-state",
            SyncEvent::Error(_) => "error",
            SyncEvent::Leader(_) => "leader",
        }
    }

    /// Build a fatal error event.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncEvent::Error(ErrorEvent {
            code,
            message: message.into(),
            fatal: true,
            reconnect: None,
        })
    }
}

/// Payload carried on the local broadcast channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub event: SyncEvent,
    /// The sender relayed this event from its remote connection.
    pub remote_origin: bool,
}

/// Where an event entered the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Another client on the local channel.
    Local,
    /// The remote connection this store owns.
    Remote,
    /// The leader's remote connection, relayed over the local channel.
    RemoteViaLocal,
}
