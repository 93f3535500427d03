//! Best-effort leader election among clients sharing a document.
//!
//! Clients talk over a broadcast primitive with four messages:
//!
//! - `request(id)`: start of an election
//! - `accept(id)`: a candidate joining an election
//! - `current(id)`: the sender is leader (also the heartbeat)
//! - `withdraw(id)`: the sender is leaving
//!
//! An election collects candidates for `election_timeout_ms` and the
//! lexicographically smallest id wins. Followers re-elect when no heartbeat
//! arrives within `heartbeat_timeout_ms`. Two leaders that hear each other
//! both re-run the election after the higher id steps down.
//!
//! Leadership only decides which client owns the remote connection. Merging
//! is convergent regardless of who does it, so a transient second leader is
//! harmless.

use crate::config::LeaderConfig;
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaderAction {
    Request,
    Current,
    Accept,
    Withdraw,
}

/// One leader protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderEvent {
    pub action: LeaderAction,
    pub client_id: String,
}

impl LeaderEvent {
    pub fn new(action: LeaderAction, client_id: impl Into<String>) -> Self {
        Self {
            action,
            client_id: client_id.into(),
        }
    }
}

/// Sends a protocol message to every other client.
pub type Broadcast = Arc<dyn Fn(LeaderEvent) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct LeaderState {
    current_leader: Option<String>,
    is_leader: bool,
    potential_leaders: BTreeSet<String>,
    electing: bool,
    /// Bumped by every election so a stale timer cannot end a newer one.
    election: u64,
    stopped: bool,
    election_timer: Option<JoinHandle<()>>,
    heartbeat_interval: Option<JoinHandle<()>>,
    heartbeat_timeout: Option<JoinHandle<()>>,
}

impl LeaderState {
    fn cancel_timers(&mut self) {
        for timer in [
            self.election_timer.take(),
            self.heartbeat_interval.take(),
            self.heartbeat_timeout.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
    }
}

struct Inner {
    client_id: String,
    config: LeaderConfig,
    broadcast: Broadcast,
    state: Mutex<LeaderState>,
    leader_tx: watch::Sender<bool>,
}

/// Outgoing messages collected under the lock and sent after it is released.
type Outbox = Vec<LeaderEvent>;

impl Inner {
    fn send(&self, outbox: Outbox) {
        for event in outbox {
            let action = event.action;
            if let Err(err) = (self.broadcast)(event) {
                warn!(client_id = %self.client_id, ?action, error = %err, "leader broadcast failed");
            }
        }
    }

    fn spawn_timer<F>(self: &Arc<Self>, delay: Duration, fire: F) -> JoinHandle<()>
    where
        F: FnOnce(&Arc<Inner>) + Send + 'static,
    {
        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                fire(&inner);
            }
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The promotion already announced us.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.send(vec![LeaderEvent::new(LeaderAction::Current, &inner.client_id)]);
            }
        })
    }

    fn elect(self: &Arc<Self>, state: &mut LeaderState, outbox: &mut Outbox) {
        debug!(client_id = %self.client_id, "starting election");
        state.potential_leaders = BTreeSet::from([self.client_id.clone()]);
        state.electing = true;
        state.election += 1;
        outbox.push(LeaderEvent::new(LeaderAction::Request, &self.client_id));
        if let Some(timer) = state.election_timer.take() {
            timer.abort();
        }
        let election = state.election;
        state.election_timer = Some(self.spawn_timer(self.config.election_timeout(), move |inner| {
            inner.on_election_timeout(election)
        }));
    }

    fn set_leader(self: &Arc<Self>, state: &mut LeaderState, leader: String, outbox: &mut Outbox) {
        let is_leader = leader == self.client_id;
        let promoted = is_leader && !state.is_leader;

        state.electing = false;
        if let Some(timer) = state.election_timer.take() {
            timer.abort();
        }
        state.current_leader = Some(leader);
        state.is_leader = is_leader;

        if is_leader {
            if let Some(timer) = state.heartbeat_timeout.take() {
                timer.abort();
            }
            if promoted {
                info!(client_id = %self.client_id, "became leader");
            }
            outbox.push(LeaderEvent::new(LeaderAction::Current, &self.client_id));
            if state.heartbeat_interval.is_none() {
                state.heartbeat_interval = Some(self.spawn_heartbeat());
            }
        } else {
            if let Some(timer) = state.heartbeat_interval.take() {
                timer.abort();
            }
            self.restart_heartbeat_timeout(state);
        }
        self.publish(state);
    }

    fn restart_heartbeat_timeout(self: &Arc<Self>, state: &mut LeaderState) {
        if let Some(timer) = state.heartbeat_timeout.take() {
            timer.abort();
        }
        state.heartbeat_timeout = Some(self.spawn_timer(self.config.heartbeat_timeout(), |inner| {
            inner.on_heartbeat_timeout()
        }));
    }

    fn publish(&self, state: &LeaderState) {
        let is_leader = state.is_leader;
        self.leader_tx.send_if_modified(|current| {
            let changed = *current != is_leader;
            *current = is_leader;
            changed
        });
    }

    fn on_election_timeout(self: &Arc<Self>, election: u64) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock();
            if state.stopped || !state.electing || state.election != election {
                return;
            }
            state.election_timer = None;
            let winner = state
                .potential_leaders
                .iter()
                .next()
                .cloned()
                .unwrap_or_else(|| self.client_id.clone());
            debug!(
                client_id = %self.client_id,
                winner = %winner,
                candidates = state.potential_leaders.len(),
                "election finished"
            );
            self.set_leader(&mut state, winner, &mut outbox);
        }
        self.send(outbox);
    }

    fn on_heartbeat_timeout(self: &Arc<Self>) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock();
            if state.stopped || state.is_leader {
                return;
            }
            state.heartbeat_timeout = None;
            warn!(
                client_id = %self.client_id,
                leader = ?state.current_leader,
                "leader heartbeat timed out"
            );
            state.current_leader = None;
            self.elect(&mut state, &mut outbox);
        }
        self.send(outbox);
    }

    fn receive(self: &Arc<Self>, event: LeaderEvent) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock();
            if state.stopped || event.client_id == self.client_id {
                return;
            }
            let other = event.client_id;
            match event.action {
                LeaderAction::Request => {
                    if state.is_leader {
                        outbox.push(LeaderEvent::new(LeaderAction::Current, &self.client_id));
                    } else if state.current_leader.is_none() {
                        if !state.electing {
                            self.elect(&mut state, &mut outbox);
                        }
                        state.potential_leaders.insert(other);
                        outbox.push(LeaderEvent::new(LeaderAction::Accept, &self.client_id));
                    }
                }
                LeaderAction::Accept => {
                    if state.electing {
                        state.potential_leaders.insert(other);
                    }
                }
                LeaderAction::Current => {
                    if state.is_leader {
                        warn!(client_id = %self.client_id, other = %other, "two leaders, re-electing");
                        if other < self.client_id {
                            state.is_leader = false;
                            state.current_leader = None;
                            if let Some(timer) = state.heartbeat_interval.take() {
                                timer.abort();
                            }
                            self.publish(&state);
                        }
                        self.elect(&mut state, &mut outbox);
                    } else {
                        self.set_leader(&mut state, other, &mut outbox);
                    }
                }
                LeaderAction::Withdraw => {
                    if state.current_leader.as_deref() == Some(other.as_str()) {
                        info!(client_id = %self.client_id, leader = %other, "leader withdrew");
                        state.current_leader = None;
                        self.elect(&mut state, &mut outbox);
                    } else {
                        state.potential_leaders.remove(&other);
                    }
                }
            }
        }
        self.send(outbox);
    }
}

/// Per-client participant in leader election.
///
/// Feed it every leader message from the broadcast primitive with
/// [`receive`](LeaderManager::receive); it sends its own messages through the
/// `broadcast` callback given at construction.
#[derive(Clone)]
pub struct LeaderManager {
    inner: Arc<Inner>,
}

impl LeaderManager {
    pub fn new(client_id: impl Into<String>, config: LeaderConfig, broadcast: Broadcast) -> Self {
        let (leader_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                client_id: client_id.into(),
                config,
                broadcast,
                state: Mutex::new(LeaderState::default()),
                leader_tx,
            }),
        }
    }

    /// Join the protocol by starting an election. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut outbox = Outbox::new();
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            self.inner.elect(&mut state, &mut outbox);
        }
        self.inner.send(outbox);
    }

    /// Handle a message from another client.
    pub fn receive(&self, event: LeaderEvent) {
        self.inner.receive(event);
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.lock().is_leader
    }

    /// The leader this client currently follows, or itself.
    pub fn leader_id(&self) -> Option<String> {
        self.inner.state.lock().current_leader.clone()
    }

    /// Watch leadership of this client.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.leader_tx.subscribe()
    }

    /// Stop all timers. A clean shutdown tells the others to re-elect.
    pub fn shutdown(&self, clean: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return Ok(());
            }
            state.stopped = true;
            state.cancel_timers();
            state.is_leader = false;
            state.current_leader = None;
            state.electing = false;
            self.inner.publish(&state);
        }
        if clean {
            (self.inner.broadcast)(LeaderEvent::new(LeaderAction::Withdraw, &self.inner.client_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn fast() -> LeaderConfig {
        LeaderConfig {
            election_timeout_ms: 30,
            heartbeat_interval_ms: 20,
            heartbeat_timeout_ms: 80,
        }
    }

    fn recorder() -> (Broadcast, mpsc::UnboundedReceiver<LeaderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broadcast: Broadcast = Arc::new(move |event: LeaderEvent| -> Result<()> {
            let _ = tx.send(event);
            Ok(())
        });
        (broadcast, rx)
    }

    #[tokio::test]
    async fn test_lone_client_elects_itself() {
        let (broadcast, mut sent) = recorder();
        let manager = LeaderManager::new("a", fast(), broadcast);
        let mut leader = manager.subscribe();
        manager.start();

        assert_eq!(
            sent.recv().await,
            Some(LeaderEvent::new(LeaderAction::Request, "a"))
        );
        leader.changed().await.unwrap();
        assert!(manager.is_leader());
        assert_eq!(manager.leader_id().as_deref(), Some("a"));
        assert_eq!(
            sent.recv().await,
            Some(LeaderEvent::new(LeaderAction::Current, "a"))
        );
    }

    #[tokio::test]
    async fn test_request_joins_election_and_smallest_wins() {
        let (broadcast, mut sent) = recorder();
        let manager = LeaderManager::new("b", fast(), broadcast);

        manager.receive(LeaderEvent::new(LeaderAction::Request, "a"));
        assert_eq!(sent.recv().await.unwrap().action, LeaderAction::Request);
        assert_eq!(
            sent.recv().await,
            Some(LeaderEvent::new(LeaderAction::Accept, "b"))
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!manager.is_leader());
        assert_eq!(manager.leader_id().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_leader_answers_request_with_current() {
        let (broadcast, mut sent) = recorder();
        let manager = LeaderManager::new("a", fast(), broadcast);
        manager.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_leader());
        while sent.try_recv().is_ok() {}

        manager.receive(LeaderEvent::new(LeaderAction::Request, "z"));
        assert_eq!(
            sent.recv().await,
            Some(LeaderEvent::new(LeaderAction::Current, "a"))
        );
    }

    #[tokio::test]
    async fn test_split_brain_demotes_higher_id() {
        let (broadcast, _sent) = recorder();
        let manager = LeaderManager::new("b", fast(), broadcast);
        manager.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.is_leader());

        manager.receive(LeaderEvent::new(LeaderAction::Current, "a"));
        assert!(!manager.is_leader());

        // "a" keeps heartbeating, so "b" settles as follower.
        manager.receive(LeaderEvent::new(LeaderAction::Current, "a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.is_leader());
        assert_eq!(manager.leader_id().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_triggers_election() {
        let (broadcast, mut sent) = recorder();
        let manager = LeaderManager::new("b", fast(), broadcast);
        manager.receive(LeaderEvent::new(LeaderAction::Current, "a"));
        assert_eq!(manager.leader_id().as_deref(), Some("a"));

        // No heartbeats from "a": "b" re-elects and, alone, wins.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(manager.is_leader());
        let mut requested = false;
        while let Ok(event) = sent.try_recv() {
            requested |= event == LeaderEvent::new(LeaderAction::Request, "b");
        }
        assert!(requested);
    }

    #[tokio::test]
    async fn test_withdraw_of_leader_reelects() {
        let (broadcast, _sent) = recorder();
        let manager = LeaderManager::new("b", fast(), broadcast);
        manager.receive(LeaderEvent::new(LeaderAction::Current, "a"));
        manager.receive(LeaderEvent::new(LeaderAction::Withdraw, "a"));
        assert_eq!(manager.leader_id(), None);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(manager.is_leader());
    }

    #[tokio::test]
    async fn test_stale_election_timer_is_ignored() {
        let (broadcast, _sent) = recorder();
        let manager = LeaderManager::new("a", fast(), broadcast);
        manager.start();
        let first = manager.inner.state.lock().election;

        // A second election starts before the first timer fires.
        {
            let mut state = manager.inner.state.lock();
            let mut outbox = Outbox::new();
            manager.inner.elect(&mut state, &mut outbox);
        }
        let second = manager.inner.state.lock().election;
        assert_eq!(second, first + 1);

        manager.inner.on_election_timeout(first);
        assert!(!manager.is_leader());
        assert!(manager.inner.state.lock().electing);

        manager.inner.on_election_timeout(second);
        assert!(manager.is_leader());
    }

    #[tokio::test]
    async fn test_clean_shutdown_withdraws() {
        let (broadcast, mut sent) = recorder();
        let manager = LeaderManager::new("a", fast(), broadcast);
        manager.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        while sent.try_recv().is_ok() {}

        manager.shutdown(true).unwrap();
        assert!(!manager.is_leader());
        assert_eq!(
            sent.recv().await,
            Some(LeaderEvent::new(LeaderAction::Withdraw, "a"))
        );

        // Stopped managers ignore traffic and stay quiet.
        manager.receive(LeaderEvent::new(LeaderAction::Request, "z"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent.try_recv().is_err());
        assert!(manager.shutdown(true).is_ok());
    }
}
