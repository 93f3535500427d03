//! Presence of the clients collaborating on a document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use trellis_graph::CommitRef;

/// What a client announces about itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub user_id: String,
    pub client_id: String,
    /// Head the client was on when it last spoke.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub head_ref: Option<CommitRef>,
    /// Host-defined presence payload (cursor, selection, ...).
    #[serde(default)]
    pub presence: Value,
    /// Marks the local client in [`PresenceMap::clients`].
    #[serde(rename = "self", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_self: bool,
}

impl ClientInfo {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
            head_ref: None,
            presence: Value::Null,
            is_self: false,
        }
    }
}

/// Known clients keyed by client id, including the local one.
#[derive(Clone, Debug)]
pub struct PresenceMap {
    local_id: String,
    clients: BTreeMap<String, ClientInfo>,
}

impl PresenceMap {
    /// Create a map holding only the local client.
    pub fn new(local: ClientInfo) -> Self {
        let local_id = local.client_id.clone();
        let mut clients = BTreeMap::new();
        clients.insert(local_id.clone(), ClientInfo { is_self: true, ..local });
        Self { local_id, clients }
    }

    /// Record a join or presence update from another client.
    ///
    /// Returns false for echoes of the local client.
    pub fn upsert(&mut self, info: ClientInfo) -> bool {
        if info.client_id == self.local_id {
            return false;
        }
        self.clients.insert(
            info.client_id.clone(),
            ClientInfo {
                is_self: false,
                ..info
            },
        );
        true
    }

    pub fn remove(&mut self, client_id: &str) -> Option<ClientInfo> {
        if client_id == self.local_id {
            return None;
        }
        self.clients.remove(client_id)
    }

    /// Update the local client's presence and head.
    pub fn set_local(&mut self, head_ref: Option<CommitRef>, presence: Option<Value>) {
        if let Some(local) = self.clients.get_mut(&self.local_id) {
            local.head_ref = head_ref;
            if let Some(presence) = presence {
                local.presence = presence;
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<&ClientInfo> {
        self.clients.get(client_id)
    }

    /// All clients, ordered by client id.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
