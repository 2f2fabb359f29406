//! Per-follower log replication.
//!
//! Each follower (and learner) gets one replicator task that owns the
//! next-index cursor for that peer. The task streams batched AppendEntries
//! from the cursor, sends a heartbeat when idle for half an election
//! timeout, and falls back to snapshot install when the peer needs entries
//! the log no longer has. Successful voter acknowledgements feed
//! [`BallotBox::commit_at`]; observations the task cannot act on itself
//! (a higher term, a safety violation) are forwarded to the node as
//! events.
//!
//! Replicators are per-leader-term: the group is started on election and
//! stopped on step-down, which cancels the tasks and abandons any
//! in-flight RPC.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::ballot_box::BallotBox;
use crate::config::NodeOptions;
use crate::error::RaftError;
use crate::rpc::{
    AppendEntriesRequest, ClientService, InstallSnapshotRequest, RaftClient,
};
use crate::storage::LogStorage;
use crate::types::{PeerId, SnapshotMeta};

/// Observations a replicator reports back to the node.
#[derive(Debug)]
pub enum ReplicatorEvent {
    /// A peer answered with a newer term; the leader must step down.
    HigherTerm { term: u64, from: PeerId },
    /// The ballot box refused an acknowledgement range.
    Violation(RaftError),
}

/// Replication progress for one peer, shared with the node for
/// leadership-transfer and liveness checks.
#[derive(Debug, Clone)]
pub struct Progress {
    pub next_index: u64,
    pub last_response: Option<Instant>,
}

struct ReplicatorCtx {
    group_id: String,
    server_id: PeerId,
    peer: PeerId,
    term: u64,
    is_voter: bool,
    options: NodeOptions,
    storage: Arc<dyn LogStorage>,
    ballot_box: Arc<BallotBox>,
    client: Arc<dyn ClientService>,
    snapshot: Arc<RwLock<Option<(SnapshotMeta, Bytes)>>>,
    progress: Arc<Mutex<Progress>>,
    notify: Arc<Notify>,
    events: mpsc::UnboundedSender<ReplicatorEvent>,
}

struct ReplicatorHandle {
    notify: Arc<Notify>,
    progress: Arc<Mutex<Progress>>,
    is_voter: bool,
    task: JoinHandle<()>,
}

/// All replicators of the current leadership, keyed by peer.
pub struct ReplicatorGroup {
    group_id: String,
    server_id: PeerId,
    options: NodeOptions,
    storage: Arc<dyn LogStorage>,
    ballot_box: Arc<BallotBox>,
    client: Arc<dyn ClientService>,
    snapshot: Arc<RwLock<Option<(SnapshotMeta, Bytes)>>>,
    events: mpsc::UnboundedSender<ReplicatorEvent>,
    replicators: Mutex<HashMap<PeerId, ReplicatorHandle>>,
}

impl ReplicatorGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_id: String,
        server_id: PeerId,
        options: NodeOptions,
        storage: Arc<dyn LogStorage>,
        ballot_box: Arc<BallotBox>,
        client: Arc<dyn ClientService>,
        snapshot: Arc<RwLock<Option<(SnapshotMeta, Bytes)>>>,
        events: mpsc::UnboundedSender<ReplicatorEvent>,
    ) -> Self {
        Self {
            group_id,
            server_id,
            options,
            storage,
            ballot_box,
            client,
            snapshot,
            events,
            replicators: Mutex::new(HashMap::new()),
        }
    }

    /// Start a replicator for `peer` at the given cursor, replacing any
    /// previous one.
    pub fn start(&self, peer: PeerId, is_voter: bool, term: u64, next_index: u64) {
        let progress = Arc::new(Mutex::new(Progress {
            next_index,
            last_response: None,
        }));
        let notify = Arc::new(Notify::new());
        let ctx = ReplicatorCtx {
            group_id: self.group_id.clone(),
            server_id: self.server_id.clone(),
            peer: peer.clone(),
            term,
            is_voter,
            options: self.options.clone(),
            storage: self.storage.clone(),
            ballot_box: self.ballot_box.clone(),
            client: self.client.clone(),
            snapshot: self.snapshot.clone(),
            progress: progress.clone(),
            notify: notify.clone(),
            events: self.events.clone(),
        };
        let task = tokio::spawn(replicate_loop(ctx));
        let handle = ReplicatorHandle {
            notify,
            progress,
            is_voter,
            task,
        };
        if let Some(old) = self.replicators.lock().insert(peer.clone(), handle) {
            old.task.abort();
        }
        tracing::debug!(peer = %peer, term, next_index, "replicator started");
    }

    pub fn stop(&self, peer: &PeerId) {
        if let Some(handle) = self.replicators.lock().remove(peer) {
            handle.task.abort();
            tracing::debug!(peer = %peer, "replicator stopped");
        }
    }

    pub fn stop_all(&self) {
        let mut replicators = self.replicators.lock();
        for (peer, handle) in replicators.drain() {
            handle.task.abort();
            tracing::debug!(peer = %peer, "replicator stopped");
        }
    }

    /// Kick every replicator; called after the leader appends a batch.
    pub fn wake_all(&self) {
        for handle in self.replicators.lock().values() {
            handle.notify.notify_one();
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.replicators.lock().contains_key(peer)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.replicators.lock().keys().cloned().collect()
    }

    /// Peers that answered within `window`, voters and learners alike.
    pub fn alive_within(&self, window: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        self.replicators
            .lock()
            .iter()
            .filter(|(_, handle)| {
                handle
                    .progress
                    .lock()
                    .last_response
                    .map(|at| now.duration_since(at) <= window)
                    .unwrap_or(false)
            })
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Voters that answered within `window`; the leader's lease check.
    pub fn alive_voters_within(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.replicators
            .lock()
            .values()
            .filter(|handle| handle.is_voter)
            .filter(|handle| {
                handle
                    .progress
                    .lock()
                    .last_response
                    .map(|at| now.duration_since(at) <= window)
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn next_index_of(&self, peer: &PeerId) -> Option<u64> {
        self.replicators
            .lock()
            .get(peer)
            .map(|handle| handle.progress.lock().next_index)
    }
}

async fn replicate_loop(ctx: ReplicatorCtx) {
    let heartbeat = ctx.options.heartbeat_interval();
    loop {
        if !replicate_once(&ctx).await {
            return;
        }
        tokio::select! {
            _ = ctx.notify.notified() => {}
            _ = tokio::time::sleep(heartbeat) => {}
        }
    }
}

/// One replication round: drain everything sendable, then heartbeat.
/// Returns false when the task must terminate (stale term, violation).
async fn replicate_once(ctx: &ReplicatorCtx) -> bool {
    let endpoint = ctx.peer.endpoint();
    let timeout = ctx.options.rpc_default_timeout();
    loop {
        let next = ctx.progress.lock().next_index;
        let first = ctx.storage.first_log_index();
        if next < first {
            // The peer needs entries the log no longer has.
            if !install_snapshot(ctx).await {
                return false;
            }
            return true;
        }

        let last = ctx.storage.last_log_index();
        let prev_log_index = next - 1;
        let mut prev_log_term = if prev_log_index == 0 {
            0
        } else {
            ctx.storage.get_term(prev_log_index)
        };
        if prev_log_index > 0 && prev_log_term == 0 {
            // The entry is compacted; the snapshot boundary still knows
            // its term.
            prev_log_term = match ctx.snapshot.read().as_ref() {
                Some((meta, _)) if meta.last_included_index == prev_log_index => {
                    meta.last_included_term
                }
                _ => {
                    // Vanished under us (concurrent prefix truncation);
                    // retry next round via the snapshot path.
                    return true;
                }
            };
        }

        let mut entries = Vec::new();
        if next <= last {
            let batch_end = last.min(next + ctx.options.max_entries_per_append as u64 - 1);
            for index in next..=batch_end {
                match ctx.storage.get_entry(index) {
                    Some(entry) => entries.push(entry),
                    None => break,
                }
            }
        }
        let sending = entries.len() as u64;

        let request = AppendEntriesRequest {
            group_id: ctx.group_id.clone(),
            server_id: ctx.server_id.clone(),
            term: ctx.term,
            prev_log_index,
            prev_log_term,
            entries,
            committed_index: ctx.ballot_box.last_committed_index(),
        };

        match RaftClient::append_entries(ctx.client.as_ref(), &endpoint, request, timeout).await {
            Ok(response) => {
                ctx.progress.lock().last_response = Some(Instant::now());
                if response.term > ctx.term {
                    let _ = ctx.events.send(ReplicatorEvent::HigherTerm {
                        term: response.term,
                        from: ctx.peer.clone(),
                    });
                    return false;
                }
                if response.success {
                    if sending == 0 {
                        return true;
                    }
                    let last_sent = next + sending - 1;
                    if ctx.is_voter {
                        if let Err(err) = ctx.ballot_box.commit_at(next, last_sent, &ctx.peer) {
                            let _ = ctx.events.send(ReplicatorEvent::Violation(err));
                            return false;
                        }
                    }
                    ctx.progress.lock().next_index = last_sent + 1;
                    // Loop again: more entries may have queued meanwhile.
                } else {
                    // Conflict: jump to the follower's tail when it is
                    // shorter, otherwise back off one term boundary at a
                    // time.
                    let fallback = if response.last_log_index + 1 < next {
                        response.last_log_index + 1
                    } else {
                        next - 1
                    };
                    let new_next = fallback.max(1);
                    ctx.progress.lock().next_index = new_next;
                    tracing::debug!(
                        peer = %ctx.peer,
                        next_index = new_next,
                        "append conflict, cursor moved back"
                    );
                    if new_next == next {
                        // Cannot back off any further; wait for the peer.
                        return true;
                    }
                }
            }
            Err(err) => {
                tracing::trace!(peer = %ctx.peer, error = %err, "append rpc failed");
                return true;
            }
        }
    }
}

/// Ship the latest snapshot image to a peer that fell behind the log.
/// Returns false when the task must terminate.
async fn install_snapshot(ctx: &ReplicatorCtx) -> bool {
    let Some((meta, data)) = ctx.snapshot.read().clone() else {
        tracing::warn!(
            peer = %ctx.peer,
            "peer is behind the first log index but no snapshot is available"
        );
        return true;
    };
    let request = InstallSnapshotRequest {
        group_id: ctx.group_id.clone(),
        server_id: ctx.server_id.clone(),
        term: ctx.term,
        meta: meta.clone(),
        data,
    };
    let timeout = ctx.options.rpc_default_timeout();
    match RaftClient::install_snapshot(
        ctx.client.as_ref(),
        &ctx.peer.endpoint(),
        request,
        timeout,
    )
    .await
    {
        Ok(response) => {
            ctx.progress.lock().last_response = Some(Instant::now());
            if response.term > ctx.term {
                let _ = ctx.events.send(ReplicatorEvent::HigherTerm {
                    term: response.term,
                    from: ctx.peer.clone(),
                });
                return false;
            }
            if response.success {
                ctx.progress.lock().next_index = meta.last_included_index + 1;
                tracing::info!(
                    peer = %ctx.peer,
                    last_included = meta.last_included_index,
                    "snapshot installed"
                );
            }
            true
        }
        Err(err) => {
            tracing::warn!(peer = %ctx.peer, error = %err, "snapshot rpc failed");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot_box::ClosureQueue;
    use crate::ballot_box::CommitWaiter;
    use crate::codec::V1Codec;
    use crate::conf::{Configuration, ConfigurationManager};
    use crate::rpc::{AppendEntriesResponse, ChannelClientService, RpcCall, RpcRequest, RpcResponse};
    use crate::storage::RocksLogStorage;
    use crate::types::{LogEntry, LogId};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    struct NullWaiter;
    impl CommitWaiter for NullWaiter {
        fn on_committed(&self, _index: u64) {}
    }

    fn leader() -> PeerId {
        PeerId::new("127.0.0.1", 7001)
    }

    fn follower() -> PeerId {
        PeerId::new("127.0.0.1", 7002)
    }

    fn make_storage(dir: &TempDir, entries: u64) -> Arc<RocksLogStorage> {
        let opts = NodeOptions {
            sync: false,
            ..Default::default()
        };
        let storage = RocksLogStorage::open(
            dir.path(),
            &opts,
            Arc::new(V1Codec),
            Arc::new(ConfigurationManager::new()),
        )
        .unwrap();
        let batch: Vec<LogEntry> = (1..=entries)
            .map(|i| LogEntry::data(LogId::new(i, 1), Bytes::from(format!("cmd{i}"))))
            .collect();
        storage.append_entries(batch);
        Arc::new(storage)
    }

    fn make_group(
        storage: Arc<RocksLogStorage>,
        ballot_box: Arc<BallotBox>,
        client: Arc<ChannelClientService>,
    ) -> (ReplicatorGroup, mpsc::UnboundedReceiver<ReplicatorEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let options = NodeOptions {
            election_timeout_ms: 200,
            rpc_default_timeout_ms: 500,
            sync: false,
            ..Default::default()
        };
        let group = ReplicatorGroup::new(
            "test".to_string(),
            leader(),
            options,
            storage,
            ballot_box,
            client,
            Arc::new(RwLock::new(None)),
            events_tx,
        );
        (group, events_rx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replicates_and_commits_on_ack() {
        let dir = TempDir::new().unwrap();
        let storage = make_storage(&dir, 3);
        let queue = Arc::new(ClosureQueue::new());
        let ballot_box = Arc::new(BallotBox::new(Arc::new(NullWaiter), queue));
        ballot_box.reset_pending_index(1);
        let conf = Configuration::new([leader(), follower()]);
        for _ in 0..3 {
            ballot_box.append_pending_task(&conf, None, None);
        }
        // Leader acks its own disk.
        ballot_box.commit_at(1, 3, &leader()).unwrap();

        let (tx, mut rx) = mpsc::channel::<RpcCall>(16);
        let client = Arc::new(ChannelClientService::default());
        client.add_peer(follower().endpoint(), tx);

        // Follower mock: acknowledge everything.
        let acked = Arc::new(AtomicU64::new(0));
        let acked_clone = acked.clone();
        tokio::spawn(async move {
            let mut last = 0u64;
            while let Some(call) = rx.recv().await {
                if let RpcRequest::AppendEntries(req) = call.request {
                    if let Some(entry) = req.entries.last() {
                        last = entry.id.index;
                        acked_clone.store(last, Ordering::SeqCst);
                    }
                    let _ = call.reply.send(RpcResponse::AppendEntries(AppendEntriesResponse {
                        term: req.term,
                        success: true,
                        last_log_index: last,
                    }));
                }
            }
        });

        let (group, _events) = make_group(storage, ballot_box.clone(), client);
        group.start(follower(), true, 1, 1);

        for _ in 0..100 {
            if ballot_box.last_committed_index() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ballot_box.last_committed_index(), 3);
        assert_eq!(acked.load(Ordering::SeqCst), 3);
        assert_eq!(group.next_index_of(&follower()), Some(4));
        assert_eq!(group.alive_voters_within(Duration::from_secs(5)), 1);
        group.stop_all();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_conflict_backoff_jumps_to_follower_tail() {
        let dir = TempDir::new().unwrap();
        let storage = make_storage(&dir, 10);
        let queue = Arc::new(ClosureQueue::new());
        let ballot_box = Arc::new(BallotBox::new(Arc::new(NullWaiter), queue));

        let (tx, mut rx) = mpsc::channel::<RpcCall>(16);
        let client = Arc::new(ChannelClientService::default());
        client.add_peer(follower().endpoint(), tx);

        // Follower mock with only 2 entries: reject until prev <= 2, then
        // record the highest entry it accepts.
        let accepted = Arc::new(AtomicU64::new(0));
        let accepted_clone = accepted.clone();
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                if let RpcRequest::AppendEntries(req) = call.request {
                    let success = req.prev_log_index <= 2;
                    if success {
                        if let Some(entry) = req.entries.last() {
                            accepted_clone.fetch_max(entry.id.index, Ordering::SeqCst);
                        }
                    }
                    let _ = call.reply.send(RpcResponse::AppendEntries(AppendEntriesResponse {
                        term: req.term,
                        success,
                        last_log_index: 2,
                    }));
                }
            }
        });

        let (group, _events) = make_group(storage, ballot_box, client);
        group.start(follower(), true, 1, 11);

        // The first round conflicts at prev=10; the hint jumps the cursor
        // to the follower's tail and all remaining entries stream across.
        for _ in 0..200 {
            if accepted.load(Ordering::SeqCst) == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 10);
        assert_eq!(group.next_index_of(&follower()), Some(11));
        group.stop_all();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_higher_term_reported() {
        let dir = TempDir::new().unwrap();
        let storage = make_storage(&dir, 1);
        let queue = Arc::new(ClosureQueue::new());
        let ballot_box = Arc::new(BallotBox::new(Arc::new(NullWaiter), queue));

        let (tx, mut rx) = mpsc::channel::<RpcCall>(16);
        let client = Arc::new(ChannelClientService::default());
        client.add_peer(follower().endpoint(), tx);

        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                if let RpcRequest::AppendEntries(_) = call.request {
                    let _ = call.reply.send(RpcResponse::AppendEntries(AppendEntriesResponse {
                        term: 9,
                        success: false,
                        last_log_index: 0,
                    }));
                }
            }
        });

        let (group, mut events) = make_group(storage, ballot_box, client);
        group.start(follower(), true, 1, 1);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ReplicatorEvent::HigherTerm { term, from } => {
                assert_eq!(term, 9);
                assert_eq!(from, follower());
            }
            other => panic!("unexpected event {other:?}"),
        }
        group.stop_all();
    }
}
