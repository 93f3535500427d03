//! Trellis sync - local-first, multi-client document synchronisation
//!
//! Every client keeps the full commit history of a document, edits offline
//! and converges with the others by running the same deterministic merge over
//! the same heads. This crate wires the commit history from `trellis-graph`
//! to local persistence, to other clients on the same device, and to a remote
//! sync server.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::Value;
//! use trellis_graph::TextDiffer;
//! use trellis_sync::{Client, ClientConfigBuilder, MemoryRepository, MemoryServer};
//!
//! #[tokio::main]
//! async fn main() -> trellis_sync::Result<()> {
//!     let server = MemoryServer::new();
//!     let config = ClientConfigBuilder::new().user_id("alice").build();
//!
//!     let client = Client::open(
//!         TextDiffer,
//!         Arc::new(MemoryRepository::new()),
//!         Some(Arc::new(server.remote())),
//!         None,
//!         config,
//!     )?;
//!     client.loaded().await;
//!
//!     client.update_doc("hello".to_string(), Value::Null)?;
//!     assert_eq!(client.doc().as_deref(), Some("hello"));
//!
//!     client.shutdown().await
//! }
//! ```
//!
//! # Architecture
//!
//! - [`client`] - document-level API: edits in, converged document out
//! - [`coordinator`] - the per-client store: persistence, status, remote
//!   lifecycle and relaying between clients
//! - [`leader`] - election of the client that owns the remote connection
//! - [`repository`], [`remote`], [`channel`] - collaborator traits with
//!   in-memory implementations
//! - [`event`], [`status`], [`presence`] - wire and status types
//! - [`queue`] - the serial task queues the store runs on

pub mod channel;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod leader;
pub mod presence;
pub mod queue;
pub mod remote;
pub mod repository;
pub mod status;

pub use channel::{EventChannel, MemoryBroadcast, MemoryChannel};
pub use client::Client;
pub use config::{
    new_client_id, ClientConfig, ClientConfigBuilder, LeaderConfig, ReconnectConfig, StoreConfig,
};
pub use coordinator::CoordinatingStore;
pub use error::{ErrorCode, Result, SyncError};
pub use event::{AckEvent, BroadcastEvent, CommitAck, ErrorEvent, Origin, RefError, SyncEvent};
pub use leader::{LeaderAction, LeaderEvent, LeaderManager};
pub use presence::{ClientInfo, PresenceMap};
pub use queue::TaskQueue;
pub use remote::{MemoryRemote, MemoryServer, Remote};
pub use repository::{CommitRepository, MemoryRepository, RemoteSyncInfo};
pub use status::{
    LocalRead, LocalSave, RemoteConnect, RemoteRead, RemoteSave, RemoteState, StatusCell,
    SyncStatus,
};
