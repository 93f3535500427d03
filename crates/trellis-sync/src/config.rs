//! Configuration for leader election, reconnects, stores and clients.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing for the leader election protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// How long an election collects candidates (in milliseconds).
    pub election_timeout_ms: u64,
    /// How often the leader re-announces itself (in milliseconds).
    pub heartbeat_interval_ms: u64,
    /// How long followers wait for a heartbeat before re-electing (in milliseconds).
    pub heartbeat_timeout_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 1000,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
        }
    }
}

impl LeaderConfig {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Backoff for remote reconnects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay, and the delay restored after a successful sync (in milliseconds).
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after every failed attempt.
    pub reconnect_backoff_multiplier: f64,
    /// Upper bound for the retry delay (in milliseconds).
    pub max_reconnect_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            reconnect_backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay that follows `current_ms` after another failure.
    pub fn next_delay(&self, current_ms: u64) -> u64 {
        let next = (current_ms as f64 * self.reconnect_backoff_multiplier) as u64;
        next.clamp(self.initial_delay_ms.min(self.max_reconnect_delay_ms), self.max_reconnect_delay_ms)
    }
}

/// Configuration for a [`CoordinatingStore`](crate::CoordinatingStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Unique id of this client; also its leader election id.
    pub client_id: String,
    /// User the client acts for.
    pub user_id: String,
    /// Reconnect policy for the remote.
    pub network_settings: ReconnectConfig,
    /// Leader election timing.
    pub leader: LeaderConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            client_id: new_client_id(),
            user_id: "anonymous".to_string(),
            network_settings: ReconnectConfig::default(),
            leader: LeaderConfig::default(),
        }
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub user_id: String,
    pub client_id: String,
    pub store: StoreConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            user_id: store.user_id.clone(),
            client_id: store.client_id.clone(),
            store,
        }
    }
}

impl ClientConfig {
    /// Store configuration carrying this client's ids.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            client_id: self.client_id.clone(),
            user_id: self.user_id.clone(),
            ..self.store.clone()
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.config.user_id = user_id.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn election_timeout(mut self, ms: u64) -> Self {
        self.config.store.leader.election_timeout_ms = ms;
        self
    }

    pub fn heartbeat_interval(mut self, ms: u64) -> Self {
        self.config.store.leader.heartbeat_interval_ms = ms;
        self
    }

    pub fn heartbeat_timeout(mut self, ms: u64) -> Self {
        self.config.store.leader.heartbeat_timeout_ms = ms;
        self
    }

    pub fn reconnect_delay(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.config.store.network_settings.initial_delay_ms = initial_ms;
        self.config.store.network_settings.max_reconnect_delay_ms = max_ms;
        self
    }

    pub fn reconnect_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.store.network_settings.reconnect_backoff_multiplier = multiplier;
        self
    }

    pub fn build(self) -> ClientConfig {
        let mut config = self.config;
        config.store = config.store_config();
        config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fresh, sortable client id.
pub fn new_client_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}
