//! Per-client store coordinating local persistence, the local broadcast
//! channel and the remote connection.
//!
//! Work runs on two serial queues. The local queue handles local edits and
//! events from other clients on the device; the remote queue handles inbound
//! remote events and connection attempts. The queues may interleave, so events
//! bound for the remote while it is connecting are buffered and flushed right
//! after the repository backlog.

use crate::channel::EventChannel;
use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::event::{BroadcastEvent, Origin, SyncEvent};
use crate::leader::{Broadcast, LeaderEvent, LeaderManager};
use crate::presence::ClientInfo;
use crate::queue::TaskQueue;
use crate::remote::Remote;
use crate::repository::CommitRepository;
use crate::status::{
    LocalRead, LocalSave, RemoteConnect, RemoteRead, RemoteSave, StatusCell, SyncStatus,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trellis_graph::{Commit, CommitRef};

/// Commits per event when replaying the repository.
const BATCH_SIZE: usize = 100;

#[derive(Default)]
struct StoreState {
    consumer: Option<mpsc::UnboundedSender<SyncEvent>>,
    pending_consumer: VecDeque<SyncEvent>,
    /// Events bound for the remote while it is connecting.
    remote_buffer: Vec<SyncEvent>,
    connecting: bool,
    unacknowledged: BTreeSet<CommitRef>,
    pending_saves: usize,
    reconnect_delay_ms: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    head_ref: Option<CommitRef>,
    presence: Value,
}

struct StoreInner {
    config: StoreConfig,
    repository: Arc<dyn CommitRepository>,
    remote: Option<Arc<dyn Remote>>,
    channel: Option<Arc<dyn EventChannel<BroadcastEvent>>>,
    leader: Option<LeaderManager>,
    status: StatusCell,
    state: Mutex<StoreState>,
    local_queue: TaskQueue,
    remote_queue: TaskQueue,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Store for one client of one document.
///
/// Without a local channel the store is alone on the device and always owns
/// the remote connection. With one, a [`LeaderManager`] decides which client
/// connects; the others reach the remote through it.
#[derive(Clone)]
pub struct CoordinatingStore {
    inner: Arc<StoreInner>,
}

impl CoordinatingStore {
    /// Build the store and start loading local commits.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        repository: Arc<dyn CommitRepository>,
        remote: Option<Arc<dyn Remote>>,
        channel: Option<Arc<dyn EventChannel<BroadcastEvent>>>,
        config: StoreConfig,
    ) -> Result<Self> {
        let leader = channel.as_ref().map(|channel| {
            let channel = channel.clone();
            let broadcast: Broadcast = Arc::new(move |event: LeaderEvent| -> Result<()> {
                channel.send_event(BroadcastEvent {
                    event: SyncEvent::Leader(event),
                    remote_origin: false,
                })
            });
            LeaderManager::new(config.client_id.clone(), config.leader.clone(), broadcast)
        });

        let channel_rx = channel.as_ref().map(|channel| channel.subscribe()).transpose()?;

        let inner = Arc::new(StoreInner {
            state: Mutex::new(StoreState {
                reconnect_delay_ms: config.network_settings.initial_delay_ms,
                ..Default::default()
            }),
            config,
            repository,
            remote,
            channel,
            leader,
            status: StatusCell::default(),
            local_queue: TaskQueue::new("local"),
            remote_queue: TaskQueue::new("remote"),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if let Some(rx) = channel_rx {
            tasks.push(spawn_channel_intake(Arc::downgrade(&inner), rx));
        }
        if let Some(remote) = &inner.remote {
            let (tx, rx) = mpsc::unbounded_channel();
            remote.listen(tx);
            tasks.push(spawn_remote_intake(Arc::downgrade(&inner), rx));
        }
        if let Some(leader) = &inner.leader {
            tasks.push(spawn_leader_watch(Arc::downgrade(&inner), leader.subscribe()));
        }
        inner.tasks.lock().extend(tasks);

        let loader = inner.clone();
        inner.local_queue.enqueue(async move { loader.load_local().await });

        match &inner.leader {
            Some(leader) => {
                leader.start();
                inner.broadcast_local(SyncEvent::ClientJoin(inner.self_info()), false);
            }
            None => inner.schedule_connect(),
        }

        info!(
            client_id = %inner.config.client_id,
            shared = inner.channel.is_some(),
            remote = inner.remote.is_some(),
            "store started"
        );
        Ok(Self { inner })
    }

    /// Take the consumer side of the store.
    ///
    /// Events emitted before this call are delivered first, in order. A
    /// second call replaces the previous consumer.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        for event in state.pending_consumer.drain(..) {
            let _ = tx.send(event);
        }
        state.consumer = Some(tx);
        rx
    }

    /// Persist and publish new commits and/or a presence change.
    pub fn update(&self, commits: Vec<Commit>, presence: Option<Value>) -> Result<()> {
        if self.inner.is_closed() {
            return Err(SyncError::Closed);
        }
        if commits.is_empty() && presence.is_none() {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            if let Some(presence) = presence {
                state.presence = presence;
            }
            if let Some(last) = commits.last() {
                state.head_ref = Some(last.id.clone());
                state.pending_saves += 1;
            }
        }
        if !commits.is_empty() {
            self.inner.status.update(|s| s.local_save = LocalSave::Pending);
        }
        let inner = self.inner.clone();
        if !self.inner.local_queue.enqueue(async move { inner.save(commits).await }) {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.get()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.config.user_id
    }

    /// Commits sent to the remote and not yet acknowledged.
    pub fn unacknowledged_refs(&self) -> Vec<CommitRef> {
        self.inner.state.lock().unacknowledged.iter().cloned().collect()
    }

    /// Wait until both queues have run everything queued so far.
    pub async fn flush(&self) {
        self.inner.local_queue.drain().await;
        self.inner.remote_queue.drain().await;
    }

    /// Leave the document. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(client_id = %inner.config.client_id, "store shutting down");

        let leave = SyncEvent::ClientLeave(inner.self_info());
        inner.broadcast_local(leave.clone(), false);
        if let Some(remote) = &inner.remote {
            if inner.is_leader() && remote.active() {
                if let Err(err) = remote.send(leave).await {
                    debug!(error = %err, "could not announce leave to remote");
                }
            }
        }

        let timer = inner.state.lock().reconnect_timer.take();
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(remote) = &inner.remote {
            if let Err(err) = remote.shutdown().await {
                warn!(error = %err, "remote shutdown failed");
            }
        }
        if let Some(leader) = &inner.leader {
            if let Err(err) = leader.shutdown(true) {
                warn!(error = %err, "leader shutdown failed");
            }
        }

        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        inner.local_queue.close();
        inner.remote_queue.close();
        inner.local_queue.drain().await;
        inner.remote_queue.drain().await;

        if let Some(channel) = &inner.channel {
            channel.shutdown();
        }
        inner.repository.shutdown().await
    }
}

fn spawn_channel_intake(
    weak: Weak<StoreInner>,
    mut rx: mpsc::UnboundedReceiver<BroadcastEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            match message.event {
                SyncEvent::Leader(event) => {
                    if let Some(leader) = &inner.leader {
                        leader.receive(event);
                    }
                }
                event => {
                    let origin = if message.remote_origin {
                        Origin::RemoteViaLocal
                    } else {
                        Origin::Local
                    };
                    let task = inner.clone();
                    inner
                        .local_queue
                        .enqueue(async move { task.process_event(event, origin).await });
                }
            }
        }
    })
}

fn spawn_remote_intake(
    weak: Weak<StoreInner>,
    mut rx: mpsc::UnboundedReceiver<SyncEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            let task = inner.clone();
            inner
                .remote_queue
                .enqueue(async move { task.process_event(event, Origin::Remote).await });
        }
    })
}

fn spawn_leader_watch(weak: Weak<StoreInner>, mut rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let is_leader = *rx.borrow_and_update();
            let Some(inner) = weak.upgrade() else { break };
            if is_leader {
                inner.schedule_connect();
            } else if !inner.is_closed() {
                let task = inner.clone();
                inner
                    .remote_queue
                    .enqueue(async move { task.close_remote(false).await });
            }
        }
    })
}

impl StoreInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_leader(&self) -> bool {
        self.leader.as_ref().map_or(true, LeaderManager::is_leader)
    }

    fn self_info(&self) -> ClientInfo {
        let state = self.state.lock();
        ClientInfo {
            head_ref: state.head_ref.clone(),
            presence: state.presence.clone(),
            ..ClientInfo::new(self.config.user_id.clone(), self.config.client_id.clone())
        }
    }

    /// Deliver to the consumer, or hold until it listens.
    fn emit(&self, event: SyncEvent) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &state.consumer {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!(client_id = %self.config.client_id, "consumer dropped");
                }
            }
            None => state.pending_consumer.push_back(event),
        }
    }

    fn broadcast_local(&self, event: SyncEvent, remote_origin: bool) {
        let Some(channel) = &self.channel else { return };
        let kind = event.kind();
        if let Err(err) = channel.send_event(BroadcastEvent {
            event,
            remote_origin,
        }) {
            debug!(kind, error = %err, "local broadcast failed");
        }
    }

    /// Change remote status fields; the leader relays changes to the others.
    fn set_remote_status<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncStatus),
    {
        let (changed, status) = self.status.update(f);
        if changed && self.channel.is_some() && self.is_leader() {
            self.broadcast_local(SyncEvent::RemoteState(status.remote_state()), false);
        }
    }

    fn track_unacknowledged<'a>(&self, refs: impl IntoIterator<Item = &'a CommitRef>) {
        let online = {
            let mut state = self.state.lock();
            state.unacknowledged.extend(refs.into_iter().cloned());
            state.connecting || self.remote.as_ref().is_some_and(|r| r.active())
        };
        self.set_remote_status(|s| {
            s.remote_save = if online {
                RemoteSave::Saving
            } else {
                RemoteSave::Pending
            }
        });
    }

    fn schedule_connect(self: &Arc<Self>) {
        if self.remote.is_none() || self.is_closed() {
            return;
        }
        let task = self.clone();
        self.remote_queue
            .enqueue(async move { task.connect_remote().await });
    }

    async fn send_remote(&self, event: SyncEvent) {
        let Some(remote) = &self.remote else { return };
        {
            let mut state = self.state.lock();
            if state.connecting {
                state.remote_buffer.push(event);
                return;
            }
        }
        if !remote.active() {
            // Commits stay unacknowledged and are replayed on reconnect.
            return;
        }
        let kind = event.kind();
        if let Err(err) = remote.send(event).await {
            warn!(kind, error = %err, "remote send failed");
        }
    }

    async fn load_local(self: Arc<Self>) {
        let mut batches = self.repository.get_local_commits().chunks(BATCH_SIZE);
        let mut loaded = 0usize;
        while let Some(batch) = batches.next().await {
            match batch.into_iter().collect::<Result<Vec<Commit>>>() {
                Ok(commits) => {
                    loaded += commits.len();
                    self.emit(SyncEvent::Commits {
                        commits,
                        sync_id: None,
                        client_info: None,
                    });
                }
                Err(err) => {
                    error!(client_id = %self.config.client_id, error = %err, "local load failed");
                    self.status.update(|s| s.local_read = LocalRead::Error);
                    self.emit(SyncEvent::fatal(err.code(), err.to_string()));
                    return;
                }
            }
        }
        debug!(client_id = %self.config.client_id, count = loaded, "local commits loaded");
        self.emit(SyncEvent::Ready);
        self.status.update(|s| s.local_read = LocalRead::Ready);
    }

    async fn save(self: Arc<Self>, commits: Vec<Commit>) {
        if commits.is_empty() {
            let presence = SyncEvent::ClientPresence(self.self_info());
            self.broadcast_local(presence.clone(), false);
            if self.is_leader() {
                self.send_remote(presence).await;
            }
            return;
        }

        self.status.update(|s| s.local_save = LocalSave::Saving);
        let result = self.repository.add_commits(commits.clone(), None).await;
        let pending = {
            let mut state = self.state.lock();
            state.pending_saves = state.pending_saves.saturating_sub(1);
            state.pending_saves
        };

        let ack = match result {
            Ok(ack) => ack,
            Err(err) => {
                error!(client_id = %self.config.client_id, error = %err, "saving commits failed");
                self.status.update(|s| s.local_save = LocalSave::Error);
                self.emit(SyncEvent::fatal(err.code(), err.to_string()));
                return;
            }
        };
        for failure in &ack.ref_errors {
            warn!(commit = %failure.id, code = %failure.code, "commit not persisted");
        }
        let partial = ack.is_partial();
        let metadata: HashMap<CommitRef, Value> = ack
            .acks
            .iter()
            .map(|a| (a.id.clone(), a.metadata.clone()))
            .collect();
        self.emit(SyncEvent::Ack(ack));
        self.status.update(|s| {
            s.local_save = if partial {
                LocalSave::Error
            } else if pending > 0 {
                LocalSave::Pending
            } else {
                LocalSave::Ready
            }
        });

        let stored: Vec<Commit> = commits
            .into_iter()
            .filter_map(|mut commit| {
                let enriched = metadata.get(&commit.id)?;
                commit.metadata = enriched.clone();
                Some(commit)
            })
            .collect();
        if stored.is_empty() {
            return;
        }
        let event = SyncEvent::Commits {
            commits: stored,
            sync_id: None,
            client_info: Some(self.self_info()),
        };
        self.broadcast_local(event.clone(), false);
        if self.is_leader() && self.remote.is_some() {
            if let SyncEvent::Commits { commits, .. } = &event {
                self.track_unacknowledged(commits.iter().map(|c| &c.id));
            }
            self.send_remote(event).await;
        }
    }

    /// Handle an event from the remote or another local client.
    async fn process_event(self: Arc<Self>, event: SyncEvent, origin: Origin) {
        debug!(
            client_id = %self.config.client_id,
            kind = event.kind(),
            ?origin,
            "processing event"
        );

        match (&event, origin) {
            (
                SyncEvent::Commits { .. }
                | SyncEvent::ClientJoin(_)
                | SyncEvent::ClientPresence(_)
                | SyncEvent::ClientLeave(_),
                Origin::Remote,
            ) => self.broadcast_local(event.clone(), true),
            (
                SyncEvent::ClientJoin(_) | SyncEvent::ClientPresence(_) | SyncEvent::ClientLeave(_),
                Origin::Local,
            ) if self.is_leader() => self.send_remote(event.clone()).await,
            _ => {}
        }

        match event {
            SyncEvent::Commits {
                commits,
                sync_id,
                client_info,
            } => match origin {
                Origin::Remote => {
                    self.receive_remote_commits(commits, sync_id, client_info)
                        .await
                }
                Origin::Local => {
                    let refs: Vec<CommitRef> = commits.iter().map(|c| c.id.clone()).collect();
                    self.emit(SyncEvent::Commits {
                        commits: commits.clone(),
                        sync_id: None,
                        client_info: client_info.clone(),
                    });
                    if self.is_leader() && self.remote.is_some() {
                        self.track_unacknowledged(&refs);
                        self.send_remote(SyncEvent::Commits {
                            commits,
                            sync_id: None,
                            client_info,
                        })
                        .await;
                    }
                }
                Origin::RemoteViaLocal => self.emit(SyncEvent::Commits {
                    commits,
                    sync_id,
                    client_info,
                }),
            },
            SyncEvent::Ack(ack) => {
                if origin != Origin::Remote {
                    return;
                }
                if let Err(err) = self
                    .repository
                    .acknowledge_remote_commits(&ack.acks, ack.sync_id.clone())
                    .await
                {
                    warn!(error = %err, "recording remote acks failed");
                }
                for failure in &ack.ref_errors {
                    warn!(commit = %failure.id, code = %failure.code, "remote rejected commit");
                }
                let remaining = {
                    let mut state = self.state.lock();
                    for a in &ack.acks {
                        state.unacknowledged.remove(&a.id);
                    }
                    state.unacknowledged.len()
                };
                let partial = ack.is_partial();
                self.set_remote_status(|s| {
                    s.remote_save = if partial {
                        RemoteSave::Error
                    } else if remaining == 0 {
                        RemoteSave::Ready
                    } else {
                        RemoteSave::Saving
                    }
                });
            }
            SyncEvent::Ready => {
                if origin != Origin::Remote {
                    return;
                }
                let empty = {
                    let mut state = self.state.lock();
                    state.reconnect_delay_ms = self.config.network_settings.initial_delay_ms;
                    state.unacknowledged.is_empty()
                };
                self.set_remote_status(|s| {
                    s.remote_read = RemoteRead::Ready;
                    if empty && s.remote_save != RemoteSave::Error {
                        s.remote_save = RemoteSave::Ready;
                    }
                });
            }
            SyncEvent::ClientJoin(info) => {
                self.emit(SyncEvent::ClientJoin(info));
                let presence = SyncEvent::ClientPresence(self.self_info());
                self.broadcast_local(presence.clone(), false);
                if origin == Origin::Remote {
                    self.send_remote(presence).await;
                }
                let remote_active = self.remote.as_ref().is_some_and(|r| r.active());
                if origin == Origin::Local && self.is_leader() && remote_active {
                    let state = self.status.get().remote_state();
                    self.broadcast_local(SyncEvent::RemoteState(state), false);
                }
            }
            SyncEvent::ClientPresence(info) => self.emit(SyncEvent::ClientPresence(info)),
            SyncEvent::ClientLeave(info) => self.emit(SyncEvent::ClientLeave(info)),
            SyncEvent::RemoteState(state) => {
                if origin == Origin::Local && self.is_leader() {
                    return;
                }
                let before = self.status.get().remote_connect;
                let (_, after) = self.status.update(|s| s.apply_remote(&state));
                if before != RemoteConnect::Online && after.remote_connect == RemoteConnect::Online {
                    self.broadcast_local(SyncEvent::ClientJoin(self.self_info()), false);
                }
            }
            SyncEvent::Error(err) => {
                if origin != Origin::Remote {
                    return;
                }
                if err.fatal {
                    warn!(code = %err.code, message = %err.message, "fatal remote error");
                    self.close_remote(err.reconnect.unwrap_or(true)).await;
                } else {
                    warn!(code = %err.code, message = %err.message, "remote error");
                }
            }
            SyncEvent::Leader(event) => {
                if let Some(leader) = &self.leader {
                    leader.receive(event);
                }
            }
        }
    }

    async fn receive_remote_commits(
        &self,
        commits: Vec<Commit>,
        sync_id: Option<String>,
        client_info: Option<ClientInfo>,
    ) {
        let ack = match self
            .repository
            .add_commits(commits.clone(), sync_id.clone())
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                error!(error = %err, "persisting remote commits failed");
                self.emit(SyncEvent::fatal(err.code(), err.to_string()));
                return;
            }
        };
        {
            let mut state = self.state.lock();
            for commit in &commits {
                state.unacknowledged.remove(&commit.id);
            }
        }
        let metadata: HashMap<CommitRef, Value> =
            ack.acks.into_iter().map(|a| (a.id, a.metadata)).collect();
        let commits = commits
            .into_iter()
            .map(|mut commit| {
                if let Some(enriched) = metadata.get(&commit.id) {
                    commit.metadata = enriched.clone();
                }
                commit
            })
            .collect();
        self.emit(SyncEvent::Commits {
            commits,
            sync_id,
            client_info,
        });
    }

    async fn connect_remote(self: Arc<Self>) {
        let Some(remote) = self.remote.clone() else { return };
        if self.is_closed() || !self.is_leader() || remote.active() {
            return;
        }
        let timer = {
            let mut state = self.state.lock();
            state.connecting = true;
            state.reconnect_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        self.set_remote_status(|s| s.remote_connect = RemoteConnect::Connecting);

        if let Err(err) = self.sync_with_remote(remote.as_ref()).await {
            warn!(client_id = %self.config.client_id, error = %err, "remote connect failed");
            self.close_remote(true).await;
        }
    }

    /// Connect, replay the backlog, flush buffered events, then announce
    /// readiness.
    async fn sync_with_remote(&self, remote: &dyn Remote) -> Result<()> {
        let info = self.repository.get_remote_sync_info().await?;
        remote.connect(info).await?;
        info!(client_id = %self.config.client_id, "remote connected");
        self.set_remote_status(|s| {
            s.remote_connect = RemoteConnect::Online;
            s.remote_read = RemoteRead::Loading;
        });

        let mut sent = HashSet::new();
        let mut backlog = self.repository.get_commits_for_remote().chunks(BATCH_SIZE);
        while let Some(batch) = backlog.next().await {
            let commits = batch.into_iter().collect::<Result<Vec<Commit>>>()?;
            sent.extend(commits.iter().map(|c| c.id.clone()));
            self.track_unacknowledged(commits.iter().map(|c| &c.id));
            debug!(count = commits.len(), "sending backlog");
            remote
                .send(SyncEvent::Commits {
                    commits,
                    sync_id: None,
                    client_info: Some(self.self_info()),
                })
                .await?;
        }

        loop {
            let buffered = {
                let mut state = self.state.lock();
                if state.remote_buffer.is_empty() {
                    state.connecting = false;
                    break;
                }
                std::mem::take(&mut state.remote_buffer)
            };
            for event in buffered {
                let event = match event {
                    SyncEvent::Commits {
                        commits,
                        sync_id,
                        client_info,
                    } => {
                        let commits: Vec<Commit> = commits
                            .into_iter()
                            .filter(|c| sent.insert(c.id.clone()))
                            .collect();
                        if commits.is_empty() {
                            continue;
                        }
                        SyncEvent::Commits {
                            commits,
                            sync_id,
                            client_info,
                        }
                    }
                    other => other,
                };
                remote.send(event).await?;
            }
        }

        remote.send(SyncEvent::Ready).await?;
        remote.send(SyncEvent::ClientJoin(self.self_info())).await?;
        Ok(())
    }

    async fn close_remote(self: &Arc<Self>, reconnect: bool) {
        let Some(remote) = &self.remote else { return };
        let timer = {
            let mut state = self.state.lock();
            state.connecting = false;
            state.remote_buffer.clear();
            state.reconnect_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        if remote.active() {
            if let Err(err) = remote.disconnect().await {
                warn!(error = %err, "remote disconnect failed");
            }
        }

        let unacknowledged = !self.state.lock().unacknowledged.is_empty();
        self.set_remote_status(|s| {
            s.remote_connect = RemoteConnect::Offline;
            s.remote_read = RemoteRead::Offline;
            if unacknowledged && s.remote_save != RemoteSave::Error {
                s.remote_save = RemoteSave::Pending;
            }
        });

        if reconnect && !self.is_closed() && self.is_leader() {
            self.schedule_reconnect();
        } else {
            info!(client_id = %self.config.client_id, "remote closed");
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut state = self.state.lock();
        let delay_ms = state.reconnect_delay_ms;
        state.reconnect_delay_ms = self.config.network_settings.next_delay(delay_ms);
        info!(client_id = %self.config.client_id, delay_ms, "scheduling reconnect");
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(inner) = weak.upgrade() {
                inner.schedule_connect();
            }
        });
        if let Some(stale) = state.reconnect_timer.replace(timer) {
            stale.abort();
        }
    }
}
