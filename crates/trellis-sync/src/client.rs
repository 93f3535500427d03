//! Document-level client: turns edits into commits and store events back
//! into a converged document.

use crate::channel::EventChannel;
use crate::config::ClientConfig;
use crate::coordinator::CoordinatingStore;
use crate::error::Result;
use crate::event::{BroadcastEvent, SyncEvent};
use crate::presence::{ClientInfo, PresenceMap};
use crate::remote::Remote;
use crate::repository::CommitRepository;
use crate::status::SyncStatus;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};
use trellis_graph::{merge_heads, Branch, Commit, CommitGraph, CommitRef, Differ, DocCache};

struct ClientState<D: Differ> {
    /// Every commit on main: flushed local edits, foreign commits, merges.
    graph: CommitGraph,
    branch: Branch,
    docs: DocCache<D>,
    presence: PresenceMap,
    /// Last commit folded into the branch as main.
    main_head: Option<CommitRef>,
    merges: usize,
}

struct ClientInner<D: Differ> {
    differ: D,
    store: CoordinatingStore,
    state: Mutex<ClientState<D>>,
    doc_tx: watch::Sender<Option<D::Doc>>,
    loaded_tx: watch::Sender<bool>,
}

/// Resolves refs against main and the local branch.
fn lookup<'a>(
    graph: &'a CommitGraph,
    branch: &'a Branch,
) -> impl Fn(&CommitRef) -> Option<&'a Commit> + Copy + 'a {
    move |r| graph.get(r).or_else(|| branch.get(r))
}

/// One client editing one document.
pub struct Client<D: Differ> {
    inner: Arc<ClientInner<D>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Differ> Client<D> {
    /// Attach to `store` and start consuming its events.
    pub fn new(differ: D, store: CoordinatingStore) -> Self {
        let rx = store.listen();
        let local = ClientInfo::new(store.user_id(), store.client_id());
        let (doc_tx, _) = watch::channel(None);
        let (loaded_tx, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            differ,
            store,
            state: Mutex::new(ClientState {
                graph: CommitGraph::new(),
                branch: Branch::new(),
                docs: DocCache::new(),
                presence: PresenceMap::new(local),
                main_head: None,
                merges: 0,
            }),
            doc_tx,
            loaded_tx,
        });
        let task = tokio::spawn(run(Arc::downgrade(&inner), rx));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Build a store from `config` and attach to it.
    pub fn open(
        differ: D,
        repository: Arc<dyn CommitRepository>,
        remote: Option<Arc<dyn Remote>>,
        channel: Option<Arc<dyn EventChannel<BroadcastEvent>>>,
        config: ClientConfig,
    ) -> Result<Self> {
        let store = CoordinatingStore::new(repository, remote, channel, config.store_config())?;
        Ok(Self::new(differ, store))
    }

    /// Current document, `None` before the first edit.
    pub fn doc(&self) -> Option<D::Doc> {
        self.inner.doc_tx.borrow().clone()
    }

    pub fn subscribe_doc(&self) -> watch::Receiver<Option<D::Doc>> {
        self.inner.doc_tx.subscribe()
    }

    /// Wait until local history has been loaded.
    pub async fn loaded(&self) {
        let mut rx = self.inner.loaded_tx.subscribe();
        let _ = rx.wait_for(|loaded| *loaded).await;
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.store.status()
    }

    pub fn subscribe_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.store.subscribe_status()
    }

    /// Commit `doc` as a durable edit.
    ///
    /// Returns the new commit ref, or `None` if `doc` is unchanged.
    pub fn update_doc(&self, doc: D::Doc, metadata: Value) -> Result<Option<CommitRef>> {
        self.inner.commit_doc(doc, metadata, false)
    }

    /// Commit `doc` as an ephemeral edit. It reaches the store only when a
    /// later durable edit builds on it, and is dropped if main moves first.
    pub fn update_temp_doc(&self, doc: D::Doc, metadata: Value) -> Result<Option<CommitRef>> {
        self.inner.commit_doc(doc, metadata, true)
    }

    pub fn update_presence(&self, presence: Value) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let head = state.branch.temp().cloned();
            state.presence.set_local(head, Some(presence.clone()));
        }
        self.inner.store.update(Vec::new(), Some(presence))
    }

    /// Ref of the visible document.
    pub fn head_ref(&self) -> Option<CommitRef> {
        self.inner.state.lock().branch.temp().cloned()
    }

    pub fn commit(&self, r: &CommitRef) -> Option<Commit> {
        let state = self.inner.state.lock();
        lookup(&state.graph, &state.branch)(r).cloned()
    }

    /// Known collaborators, this client included.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.inner.state.lock().presence.clients()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.store.is_leader()
    }

    /// Merge commits this client has produced.
    pub fn merge_count(&self) -> usize {
        self.inner.state.lock().merges
    }

    pub fn store(&self) -> &CoordinatingStore {
        &self.inner.store
    }

    pub async fn shutdown(&self) -> Result<()> {
        let result = self.inner.store.shutdown().await;
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        result
    }
}

async fn run<D: Differ>(weak: Weak<ClientInner<D>>, mut rx: mpsc::UnboundedReceiver<SyncEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        let kind = event.kind();
        if let Err(err) = inner.handle(event) {
            error!(client_id = %inner.store.client_id(), kind, error = %err, "event handling failed");
        }
    }
    trace!("client event loop stopped");
}

/// Keep cached documents only for heads, main and the local branch; merge
/// bases of later merges are rebuilt from history when needed.
fn evict_docs<D: Differ>(state: &mut ClientState<D>) {
    let heads: HashSet<CommitRef> = state.graph.heads().into_iter().collect();
    let ClientState {
        docs,
        branch,
        main_head,
        ..
    } = state;
    docs.retain(|r| {
        heads.contains(r)
            || main_head.as_ref() == Some(r)
            || branch.root() == Some(r)
            || branch.contains(r)
    });
}

impl<D: Differ> ClientInner<D> {
    fn commit_doc(&self, doc: D::Doc, metadata: Value, is_temp: bool) -> Result<Option<CommitRef>> {
        let (id, flushed, merges) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let temp = state.branch.temp().cloned();
            let prior = state.docs.get(
                &self.differ,
                temp.as_ref(),
                lookup(&state.graph, &state.branch),
            )?;
            let Some(delta) = self.differ.diff(prior.as_ref(), &doc)? else {
                return Ok(None);
            };
            let commit = Commit::builder()
                .with_base_ref(temp)
                .with_delta(delta)
                .with_metadata(metadata)
                .build_with(&self.differ);
            let id = commit.id.clone();

            let flushed = state.branch.advance_branch(commit, is_temp)?;
            state.docs.insert(id.clone(), doc.clone());
            for commit in &flushed {
                state.graph.insert(commit.clone());
            }
            state.presence.set_local(Some(id.clone()), None);
            self.publish(Some(doc));

            let merges = if flushed.is_empty() || !*self.loaded_tx.borrow() {
                Vec::new()
            } else {
                self.reconcile(state)?
            };
            (id, flushed, merges)
        };

        trace!(commit = %id, flushed = flushed.len(), is_temp, "local edit");
        let mut outgoing = flushed;
        outgoing.extend(merges);
        self.store.update(outgoing, None)?;
        Ok(Some(id))
    }

    fn handle(&self, event: SyncEvent) -> Result<()> {
        let merges = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match event {
                SyncEvent::Commits {
                    commits,
                    client_info,
                    ..
                } => {
                    let mut added = 0usize;
                    for commit in commits {
                        if state.graph.insert(commit) {
                            added += 1;
                        }
                    }
                    if let Some(info) = client_info {
                        state.presence.upsert(info);
                    }
                    if added > 0 && *self.loaded_tx.borrow() {
                        self.reconcile(state)?
                    } else {
                        Vec::new()
                    }
                }
                SyncEvent::Ready => {
                    self.loaded_tx.send_replace(true);
                    self.reconcile(state)?
                }
                SyncEvent::Ack(ack) => {
                    for a in ack.acks {
                        if state.graph.contains(&a.id) {
                            state.graph.update_metadata(&a.id, a.metadata)?;
                        }
                    }
                    Vec::new()
                }
                SyncEvent::ClientJoin(info) | SyncEvent::ClientPresence(info) => {
                    state.presence.upsert(info);
                    Vec::new()
                }
                SyncEvent::ClientLeave(info) => {
                    state.presence.remove(&info.client_id);
                    Vec::new()
                }
                SyncEvent::Error(err) => {
                    error!(code = %err.code, fatal = err.fatal, message = %err.message, "store error");
                    Vec::new()
                }
                SyncEvent::RemoteState(_) | SyncEvent::Leader(_) => Vec::new(),
            }
        };
        if !merges.is_empty() {
            self.store.update(merges, None)?;
        }
        Ok(())
    }

    /// Merge every head into one and move the branch onto it.
    ///
    /// Returns the merge commits created, oldest first.
    fn reconcile(&self, state: &mut ClientState<D>) -> Result<Vec<Commit>> {
        if !state.graph.missing().is_empty() {
            debug!(missing = state.graph.missing().len(), "waiting for parents");
            return Ok(Vec::new());
        }
        let heads = state.graph.heads();
        let mut created: Vec<Commit> = Vec::new();
        let head = if heads.len() > 1 {
            let ClientState {
                graph,
                branch,
                docs,
                ..
            } = &mut *state;
            let (graph, branch) = (&*graph, &*branch);
            merge_heads(
                &heads,
                |a, b| a.cmp(b),
                |r| graph.parents(r),
                |base, left, right, _depth| {
                    let commit =
                        docs.merge_commit(&self.differ, base, left, right, lookup(graph, branch))?;
                    let id = commit.id.clone();
                    created.push(commit);
                    Ok(id)
                },
            )?
        } else {
            heads.into_iter().next()
        };
        let Some(head) = head else {
            return Ok(created);
        };

        for commit in &created {
            state.graph.insert(commit.clone());
        }
        state.merges += created.len();

        if state.branch.has_edits() && state.branch.pending_merge().is_none() {
            let edit = state.branch.edit().cloned();
            let merge = edit.and_then(|edit| created.iter().find(|c| c.has_parent(&edit)).cloned());
            if let Some(merge) = merge {
                state.branch.attempt_merge(merge)?;
            }
        }

        let targets: Vec<Commit> = if created.is_empty() {
            state.graph.get(&head).cloned().into_iter().collect()
        } else {
            created.clone()
        };
        for target in &targets {
            if state.main_head.as_ref() == Some(&target.id) {
                continue;
            }
            self.advance_main(state, target);
        }
        state.main_head = Some(head);

        let temp = state.branch.temp().cloned();
        let doc = state
            .docs
            .get(&self.differ, temp.as_ref(), lookup(&state.graph, &state.branch))?;
        state.presence.set_local(temp, None);
        self.publish(doc);
        evict_docs(state);

        if !created.is_empty() {
            debug!(
                client_id = %self.store.client_id(),
                merges = created.len(),
                "merged heads"
            );
        }
        Ok(created)
    }

    fn advance_main(&self, state: &mut ClientState<D>, target: &Commit) {
        // A main commit that already contains our edit confirms it.
        if state.branch.has_edits() {
            let confirmed = state
                .branch
                .edit()
                .filter(|edit| state.graph.is_ancestor(edit, &target.id))
                .and_then(|edit| state.graph.get(edit))
                .cloned();
            if let Some(edit) = confirmed {
                state.branch.advance_main(&edit);
            }
        }
        if state.branch.advance_main(target) {
            trace!(head = %target.id, "main advanced");
        }
    }

    fn publish(&self, doc: Option<D::Doc>) {
        self.doc_tx.send_if_modified(|current| {
            if *current == doc {
                return false;
            }
            *current = doc;
            true
        });
    }
}
