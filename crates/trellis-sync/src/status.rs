//! Externally visible sync status.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalRead {
    #[default]
    Loading,
    Ready,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalSave {
    #[default]
    Ready,
    Pending,
    Saving,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteConnect {
    #[default]
    Offline,
    Connecting,
    Online,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteRead {
    #[default]
    Offline,
    Loading,
    Ready,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteSave {
    #[default]
    Ready,
    Pending,
    Saving,
    Error,
}

/// Five-part status of local persistence and the remote connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub local_read: LocalRead,
    pub local_save: LocalSave,
    pub remote_connect: RemoteConnect,
    pub remote_read: RemoteRead,
    pub remote_save: RemoteSave,
}

/// Remote half of [`SyncStatus`], as relayed by the leader to other clients.
///
/// Unset fields leave the receiver's value unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<RemoteConnect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<RemoteRead>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save: Option<RemoteSave>,
}

impl SyncStatus {
    /// Snapshot of the remote fields.
    pub fn remote_state(&self) -> RemoteState {
        RemoteState {
            connect: Some(self.remote_connect),
            read: Some(self.remote_read),
            save: Some(self.remote_save),
        }
    }

    /// Merge relayed remote fields into this status.
    pub fn apply_remote(&mut self, state: &RemoteState) {
        if let Some(connect) = state.connect {
            self.remote_connect = connect;
        }
        if let Some(read) = state.read {
            self.remote_read = read;
        }
        if let Some(save) = state.save {
            self.remote_save = save;
        }
    }
}

/// Watch-backed holder that only notifies on actual change.
#[derive(Debug)]
pub struct StatusCell {
    tx: watch::Sender<SyncStatus>,
}

impl StatusCell {
    pub fn new(initial: SyncStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> SyncStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Apply `f`; subscribers are woken only if the status changed.
    ///
    /// Returns `(changed, new_status)`.
    pub fn update<F>(&self, f: F) -> (bool, SyncStatus)
    where
        F: FnOnce(&mut SyncStatus),
    {
        let mut next = SyncStatus::default();
        let changed = self.tx.send_if_modified(|status| {
            let before = *status;
            f(status);
            next = *status;
            before != *status
        });
        (changed, next)
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(SyncStatus::default())
    }
}
