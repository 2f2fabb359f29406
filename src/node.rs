//! The node orchestrator: roles, elections, the apply pipeline, and
//! membership changes.
//!
//! A node wires the subsystems together: proposals flow through a bounded
//! ring into a single drainer that assigns indices, registers ballots and
//! appends to storage; replicators fan the log out; the ballot box advances
//! the commit index; the FSM caller applies. Role transitions follow
//! FOLLOWER -> CANDIDATE -> LEADER -> FOLLOWER, with LEARNER as a sink role
//! and ERROR/SHUTDOWN terminal.
//!
//! Membership changes use joint consensus: the joint entry (carrying both
//! voter sets) must commit under quorums of both before the leave-joint
//! entry restores a simple configuration. `reset_peers` bypasses all of
//! that locally and is only for disaster recovery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ballot::Ballot;
use crate::ballot_box::{BallotBox, ClosureQueue};
use crate::conf::{ConfEntry, Configuration, ConfigurationManager};
use crate::config::NodeOptions;
use crate::error::{RaftError, Result, Status};
use crate::fsm::{FsmCaller, StateMachine};
use crate::read_only::{ReadIndexDone, ReadIndexExecutor, ReadOnlyService};
use crate::replicator::{ReplicatorEvent, ReplicatorGroup};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ClientService, ErrorResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, RaftClient, ReadIndexRequest,
    ReadIndexResponse, RequestVoteRequest, RequestVoteResponse, RpcCall, RpcReceiver, RpcRequest,
    RpcResponse, TimeoutNowRequest, TimeoutNowResponse,
};
use crate::storage::LogStorage;
use crate::types::{Done, EntryType, LogEntry, LogId, PeerId, Role, SnapshotMeta, Task, UserLog};

/// Publish retry bound for the apply ring.
const MAX_APPLY_RETRY_TIMES: usize = 3;

struct NodeState {
    role: Role,
    current_term: u64,
    voted_for: Option<PeerId>,
    leader_id: Option<PeerId>,
    conf: ConfEntry,
    conf_ctx: Option<ConfChangeCtx>,
    last_heartbeat: Instant,
    election_deadline: Duration,
    /// Boundary of the last snapshot; answers term queries for the index
    /// right below the retained log.
    snapshot_id: LogId,
}

enum ConfChangeStage {
    /// The joint entry is in flight; commits need both quorums.
    Joint,
    /// The leave-joint (or learner-only) entry is in flight.
    Stable,
}

struct ConfChangeCtx {
    stage: ConfChangeStage,
    new_conf: Configuration,
    old_conf: Configuration,
    done: Option<Done>,
}

enum Proposal {
    Data { data: Bytes, done: Option<Done> },
    Conf {
        conf: Configuration,
        old_conf: Option<Configuration>,
        done: Option<Done>,
    },
    NoOp,
}

/// A Raft replica. Construct with [`Node::new`], then [`Node::start`].
pub struct Node {
    group_id: String,
    server_id: PeerId,
    options: NodeOptions,
    election_timeout_ms: AtomicU64,
    state: RwLock<NodeState>,
    storage: Arc<dyn LogStorage>,
    conf_manager: Arc<ConfigurationManager>,
    ballot_box: Arc<BallotBox>,
    fsm: Arc<FsmCaller>,
    client: Arc<dyn ClientService>,
    replicators: ReplicatorGroup,
    read_only: Mutex<Option<Arc<ReadOnlyService>>>,
    read_only_flush: Mutex<Option<oneshot::Receiver<()>>>,
    apply_tx: mpsc::Sender<Proposal>,
    apply_rx: Mutex<Option<mpsc::Receiver<Proposal>>>,
    events_tx: mpsc::UnboundedSender<ReplicatorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ReplicatorEvent>>>,
    snapshot: Arc<RwLock<Option<(SnapshotMeta, Bytes)>>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(
        group_id: impl Into<String>,
        server_id: PeerId,
        options: NodeOptions,
        sm: Arc<dyn StateMachine>,
        storage: Arc<dyn LogStorage>,
        conf_manager: Arc<ConfigurationManager>,
        client: Arc<dyn ClientService>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let group_id = group_id.into();

        let closure_queue = Arc::new(ClosureQueue::new());
        let fsm = FsmCaller::start(sm, storage.clone(), closure_queue.clone());
        let ballot_box = Arc::new(BallotBox::new(fsm.clone(), closure_queue));
        let snapshot: Arc<RwLock<Option<(SnapshotMeta, Bytes)>>> = Arc::new(RwLock::new(None));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let replicators = ReplicatorGroup::new(
            group_id.clone(),
            server_id.clone(),
            options.clone(),
            storage.clone(),
            ballot_box.clone(),
            client.clone(),
            snapshot.clone(),
            events_tx.clone(),
        );
        let (apply_tx, apply_rx) = mpsc::channel(options.disruptor_buffer_size);
        let (shutdown_tx, _) = broadcast::channel(8);

        // Membership replayed from the log wins over the boot-time value.
        let conf = conf_manager
            .last_configuration()
            .unwrap_or_else(|| ConfEntry::stable(options.initial_conf.clone()));
        let role = initial_role(&conf, &server_id);
        let election_deadline = options.random_election_timeout();

        let node = Arc::new(Self {
            election_timeout_ms: AtomicU64::new(options.election_timeout_ms),
            group_id,
            server_id,
            state: RwLock::new(NodeState {
                role,
                current_term: 0,
                voted_for: None,
                leader_id: None,
                conf,
                conf_ctx: None,
                last_heartbeat: Instant::now(),
                election_deadline,
                snapshot_id: LogId::default(),
            }),
            storage,
            conf_manager,
            ballot_box,
            fsm,
            client,
            replicators,
            read_only: Mutex::new(None),
            read_only_flush: Mutex::new(None),
            apply_tx,
            apply_rx: Mutex::new(Some(apply_rx)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            snapshot,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            options,
        });
        Ok(node)
    }

    /// Spawn the background machinery. `rpc_rx` is this node's inbound
    /// channel on the in-process transport; pass `None` for a client-only
    /// embedding.
    pub fn start(self: &Arc<Self>, rpc_rx: Option<RpcReceiver>) {
        let read_only = {
            let weak: Weak<dyn ReadIndexExecutor> = Arc::downgrade(self);
            ReadOnlyService::start(
                self.group_id.clone(),
                self.server_id.clone(),
                weak,
                self.fsm.clone(),
                self.options.clone(),
            )
        };
        *self.read_only.lock() = Some(read_only);

        let mut tasks = self.tasks.lock();

        {
            let node = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(node.election_loop(shutdown)));
        }
        {
            let node = self.clone();
            let rx = self.apply_rx.lock().take().expect("start called twice");
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(node.apply_loop(rx, shutdown)));
        }
        {
            let node = self.clone();
            let rx = self.events_rx.lock().take().expect("start called twice");
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(node.event_loop(rx, shutdown)));
        }
        if self.options.snapshot_interval_secs > 0 {
            let node = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(node.snapshot_loop(shutdown)));
        }
        if let Some(rx) = rpc_rx {
            let node = self.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(node.serve_loop(rx, shutdown)));
        }
        tracing::info!(
            group = %self.group_id,
            server = %self.server_id,
            "node started"
        );
    }

    // ---- public surface -------------------------------------------------

    pub fn server_id(&self) -> &PeerId {
        &self.server_id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn role(&self) -> Role {
        self.state.read().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.state.read().leader_id.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.state.read().current_term
    }

    pub fn last_committed_index(&self) -> u64 {
        self.ballot_box.last_committed_index()
    }

    pub fn last_applied_index(&self) -> u64 {
        self.fsm.last_applied_index()
    }

    /// Thread-safe and wait-free: enqueue a command for replication. The
    /// task's completion handle fires once the command commits and applies
    /// (or with the failure that stopped it).
    pub fn apply(&self, task: Task) {
        if let Some(err) = self.fsm.error() {
            if let Some(done) = task.done {
                done(Err(err));
            }
            return;
        }
        let mut proposal = Proposal::Data {
            data: task.data,
            done: task.done,
        };
        for _ in 0..=MAX_APPLY_RETRY_TIMES {
            match self.apply_tx.try_send(proposal) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(back)) => {
                    proposal = back;
                    std::hint::spin_loop();
                }
                Err(mpsc::error::TrySendError::Closed(back)) => {
                    if let Proposal::Data { done: Some(done), .. } = back {
                        done(Err(RaftError::Stopped));
                    }
                    return;
                }
            }
        }
        tracing::warn!(group = %self.group_id, "apply ring overloaded");
        if let Proposal::Data { done: Some(done), .. } = proposal {
            done(Err(RaftError::Busy("apply queue is full".to_string())));
        }
    }

    /// Linearizable read: the waiter fires once the state machine covers
    /// the commit index recorded by the leader.
    pub fn read_index(&self, ctx: Bytes, done: ReadIndexDone) {
        if let Some(err) = self.fsm.error() {
            done(Err(err), ctx);
            return;
        }
        let service = self.read_only.lock().clone();
        match service {
            Some(service) => service.add_request(ctx, done),
            None => done(Err(RaftError::Stopped), ctx),
        }
    }

    pub fn list_peers(&self) -> Vec<PeerId> {
        self.state.read().conf.conf.peer_vec()
    }

    pub fn list_learners(&self) -> Vec<PeerId> {
        self.state.read().conf.conf.learner_vec()
    }

    /// Voters that answered within an election timeout, plus the leader
    /// itself. Only meaningful on the leader.
    pub fn list_alive_peers(&self) -> Vec<PeerId> {
        let conf = self.state.read().conf.conf.clone();
        let mut alive: Vec<PeerId> = self
            .replicators
            .alive_within(self.options.election_timeout())
            .into_iter()
            .filter(|p| conf.contains(p))
            .collect();
        if conf.contains(&self.server_id) {
            alive.push(self.server_id.clone());
        }
        alive.sort();
        alive
    }

    pub fn list_alive_learners(&self) -> Vec<PeerId> {
        let conf = self.state.read().conf.conf.clone();
        self.replicators
            .alive_within(self.options.election_timeout())
            .into_iter()
            .filter(|p| conf.contains_learner(p))
            .collect()
    }

    pub fn add_peer(self: &Arc<Self>, peer: PeerId, done: Done) {
        let mut new_conf = self.state.read().conf.conf.clone();
        if !new_conf.add_peer(peer) {
            done(Err(RaftError::InvalidConfig("peer already present".to_string())));
            return;
        }
        self.change_peers_internal(new_conf, done);
    }

    pub fn remove_peer(self: &Arc<Self>, peer: PeerId, done: Done) {
        let mut new_conf = self.state.read().conf.conf.clone();
        if !new_conf.remove_peer(&peer) {
            done(Err(RaftError::InvalidConfig("peer not present".to_string())));
            return;
        }
        self.change_peers_internal(new_conf, done);
    }

    pub fn change_peers(self: &Arc<Self>, new_peers: Configuration, done: Done) {
        self.change_peers_internal(new_peers, done);
    }

    pub fn add_learners(self: &Arc<Self>, learners: Vec<PeerId>, done: Done) {
        let mut new_conf = self.state.read().conf.conf.clone();
        for learner in learners {
            new_conf.add_learner(learner);
        }
        self.change_peers_internal(new_conf, done);
    }

    pub fn remove_learners(self: &Arc<Self>, learners: Vec<PeerId>, done: Done) {
        let mut new_conf = self.state.read().conf.conf.clone();
        for learner in &learners {
            new_conf.remove_learner(learner);
        }
        self.change_peers_internal(new_conf, done);
    }

    pub fn reset_learners(self: &Arc<Self>, learners: Vec<PeerId>, done: Done) {
        let mut new_conf = self.state.read().conf.conf.clone();
        new_conf.set_learners(learners);
        self.change_peers_internal(new_conf, done);
    }

    /// Unsafe admin escape: rewrite membership locally, without
    /// replication. Only for reviving a group that lost its majority for
    /// good; neither consistency nor consensus is guaranteed.
    pub fn reset_peers(&self, new_peers: Configuration) -> Status {
        if new_peers.is_empty() || !new_peers.is_valid() {
            return Err(RaftError::InvalidConfig(
                "reset_peers requires a non-empty valid configuration".to_string(),
            ));
        }
        let mut state = self.state.write();
        tracing::warn!(
            group = %self.group_id,
            new_conf = %new_peers,
            "reset_peers: overwriting membership locally"
        );
        state.conf = ConfEntry::stable(new_peers);
        state.role = initial_role(&state.conf, &self.server_id);
        Ok(())
    }

    /// Overrides the election trigger; existing replicator heartbeats keep
    /// their original cadence.
    pub fn reset_election_timeout_ms(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        self.election_timeout_ms.store(ms, Ordering::Release);
    }

    /// Hand leadership to `peer`. Requires the target to be a caught-up
    /// voter; completes after the TimeoutNow round-trip.
    pub async fn transfer_leadership_to(&self, peer: PeerId) -> Status {
        let term = {
            let state = self.state.read();
            if state.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    leader: state.leader_id.clone(),
                });
            }
            if peer == self.server_id {
                return Ok(());
            }
            if !state.conf.conf.contains(&peer) {
                return Err(RaftError::InvalidConfig(format!(
                    "{peer} is not a voter of this group"
                )));
            }
            state.current_term
        };

        let caught_up = self
            .replicators
            .next_index_of(&peer)
            .map(|next| next > self.storage.last_log_index())
            .unwrap_or(false);
        if !caught_up {
            return Err(RaftError::Busy(format!("{peer} is still catching up")));
        }

        // Step down first so our heartbeats stop renewing the other
        // followers' leases; the target then campaigns unopposed.
        let (was_leader, ctx_done) = {
            let mut state = self.state.write();
            if state.current_term != term || state.role != Role::Leader {
                return Err(RaftError::NotLeader {
                    leader: state.leader_id.clone(),
                });
            }
            let term = state.current_term;
            self.step_down_locked(&mut state, term)
        };
        if was_leader {
            self.leader_teardown(
                RaftError::Canceled("leadership transferred".to_string()),
                ctx_done,
            );
        }

        let request = TimeoutNowRequest {
            group_id: self.group_id.clone(),
            server_id: self.server_id.clone(),
            term,
        };
        let response = RaftClient::timeout_now(
            self.client.as_ref(),
            &peer.endpoint(),
            request,
            self.options.rpc_default_timeout(),
        )
        .await?;
        if !response.success {
            return Err(RaftError::Internal(format!(
                "{peer} refused the leadership transfer"
            )));
        }
        tracing::info!(group = %self.group_id, to = %peer, "leadership transferred");
        Ok(())
    }

    /// First committed-and-applied user entry at or after `index`.
    pub fn read_committed_user_log(&self, index: u64) -> Result<UserLog> {
        if index == 0 {
            return Err(RaftError::InvalidConfig(
                "log index must be positive".to_string(),
            ));
        }
        // Applied rather than committed: everything at or below it is
        // both durable and visible.
        let applied = self.fsm.last_applied_index();
        if index > applied {
            return Err(RaftError::NoMoreUserLog(applied));
        }
        let first = self.storage.first_log_index();
        if index < first {
            return Err(RaftError::LogDeleted(index));
        }
        for cursor in index..=applied {
            match self.storage.get_entry(cursor) {
                Some(entry) if entry.entry_type == EntryType::Data => {
                    return Ok(UserLog {
                        index: cursor,
                        data: entry.data,
                    });
                }
                Some(_) => continue,
                None => return Err(RaftError::LogDeleted(cursor)),
            }
        }
        Err(RaftError::NoMoreUserLog(applied))
    }

    /// Snapshot the state machine and trim the log, keeping
    /// `snapshot_log_index_margin` entries behind the boundary.
    pub fn snapshot(&self, done: Option<Done>) {
        let result = self.do_snapshot();
        if let Some(done) = done {
            done(result);
        }
    }

    /// Begin shutdown; `done` fires after the teardown sequence.
    pub fn shutdown(&self, done: Option<Done>) {
        let (was_leader, ctx_done) = {
            let mut state = self.state.write();
            if state.role == Role::Shutdown {
                if let Some(done) = done {
                    done(Ok(()));
                }
                return;
            }
            let was_leader = state.role == Role::Leader;
            state.role = Role::Shutdown;
            let ctx_done = state.conf_ctx.take().and_then(|mut ctx| ctx.done.take());
            (was_leader, ctx_done)
        };
        if was_leader {
            self.leader_teardown(RaftError::Stopped, ctx_done);
        } else if let Some(ctx_done) = ctx_done {
            ctx_done(Err(RaftError::Stopped));
        }
        let _ = self.shutdown_tx.send(());
        self.replicators.stop_all();
        if let Some(read_only) = self.read_only.lock().clone() {
            *self.read_only_flush.lock() = read_only.shutdown();
        }
        tracing::info!(group = %self.group_id, server = %self.server_id, "node shutting down");
        if let Some(done) = done {
            done(Ok(()));
        }
    }

    /// Block until every component drained. Storage closes last.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let read_only = self.read_only.lock().clone();
        if let Some(read_only) = read_only {
            let flush = self.read_only_flush.lock().take();
            read_only.join(flush).await;
        }
        self.fsm.shutdown().await;
        self.storage.shutdown();
    }

    // ---- election & roles ----------------------------------------------

    async fn election_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let tick = Duration::from_millis((self.options.election_timeout_ms / 10).clamp(10, 100));
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return,
            }
            let (role, elapsed, deadline) = {
                let state = self.state.read();
                (
                    state.role,
                    state.last_heartbeat.elapsed(),
                    state.election_deadline,
                )
            };
            match role {
                Role::Follower | Role::Candidate => {
                    if elapsed >= deadline {
                        self.elect_self().await;
                    }
                }
                Role::Leader => self.check_leader_lease(),
                _ => {}
            }
        }
    }

    /// Step down when no quorum of voters has answered within the lease
    /// window.
    fn check_leader_lease(&self) {
        let (voters, elapsed) = {
            let state = self.state.read();
            (state.conf.all_voters(), state.last_heartbeat.elapsed())
        };
        if voters.len() <= 1 {
            return;
        }
        let lease = self.options.leader_lease_timeout();
        if elapsed < lease {
            // Fresh leadership: give replicators one window to connect.
            return;
        }
        let quorum = voters.len() / 2 + 1;
        let mut alive = self.replicators.alive_voters_within(lease);
        if voters.contains(&self.server_id) {
            alive += 1;
        }
        if alive < quorum {
            tracing::warn!(
                group = %self.group_id,
                alive,
                quorum,
                "leader lost contact with the quorum, stepping down"
            );
            let (was_leader, ctx_done) = {
                let mut state = self.state.write();
                state.leader_id = None;
                let term = state.current_term;
                self.step_down_locked(&mut state, term)
            };
            if was_leader {
                self.leader_teardown(
                    RaftError::NotLeader { leader: None },
                    ctx_done,
                );
            }
        }
    }

    async fn elect_self(self: &Arc<Self>) {
        let (term, conf, last_log_id) = {
            let mut state = self.state.write();
            if !state.conf.contains_voter(&self.server_id) {
                return;
            }
            if !matches!(state.role, Role::Follower | Role::Candidate) {
                return;
            }
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.server_id.clone());
            state.leader_id = None;
            state.last_heartbeat = Instant::now();
            state.election_deadline = self.random_election_deadline();
            (
                state.current_term,
                state.conf.clone(),
                self.last_log_id(&state),
            )
        };
        tracing::info!(group = %self.group_id, term, "election started");

        let mut ballot = Ballot::new(&conf.conf, conf.old_conf.as_ref());
        ballot.grant(&self.server_id);
        if ballot.is_granted() {
            self.become_leader(term);
            return;
        }

        let request = RequestVoteRequest {
            group_id: self.group_id.clone(),
            server_id: self.server_id.clone(),
            term,
            last_log_index: last_log_id.index,
            last_log_term: last_log_id.term,
        };
        let timeout = self
            .options
            .rpc_default_timeout()
            .min(self.options.election_timeout());
        let votes = conf
            .all_voters()
            .into_iter()
            .filter(|peer| peer != &self.server_id)
            .map(|peer| {
                let client = self.client.clone();
                let request = request.clone();
                async move {
                    let response = RaftClient::request_vote(
                        client.as_ref(),
                        &peer.endpoint(),
                        request,
                        timeout,
                    )
                    .await;
                    (peer, response)
                }
            });
        let results = futures::future::join_all(votes).await;

        let mut max_term = term;
        for (peer, response) in results {
            match response {
                Ok(response) => {
                    if response.term > max_term {
                        max_term = response.term;
                    }
                    if response.granted {
                        ballot.grant(&peer);
                    }
                }
                Err(err) => {
                    tracing::debug!(peer = %peer, error = %err, "vote request failed");
                }
            }
        }
        if max_term > term {
            let (was_leader, ctx_done) = {
                let mut state = self.state.write();
                self.step_down_locked(&mut state, max_term)
            };
            if was_leader {
                self.leader_teardown(RaftError::NotLeader { leader: None }, ctx_done);
            } else if let Some(done) = ctx_done {
                done(Err(RaftError::NotLeader { leader: None }));
            }
            return;
        }
        if ballot.is_granted() {
            self.become_leader(term);
        }
        // Otherwise stay candidate; the next deadline restarts with a
        // higher term.
    }

    fn become_leader(self: &Arc<Self>, term: u64) {
        let conf = {
            let mut state = self.state.write();
            if state.current_term != term || state.role != Role::Candidate {
                return;
            }
            state.role = Role::Leader;
            state.leader_id = Some(self.server_id.clone());
            state.last_heartbeat = Instant::now();
            state.conf.clone()
        };
        tracing::info!(group = %self.group_id, term, "became leader");

        let next_index = self.storage.last_log_index() + 1;
        if !self.ballot_box.reset_pending_index(next_index) {
            self.enter_error_state(RaftError::Violation(
                "ballot box refused the new pending index".to_string(),
            ));
            return;
        }
        for peer in conf.all_voters() {
            if peer != self.server_id {
                self.replicators.start(peer, true, term, next_index);
            }
        }
        for learner in conf.conf.learners() {
            self.replicators
                .start(learner.clone(), false, term, next_index);
        }

        // Entries from previous terms cannot be committed by counting
        // replicas; anchor the term with a no-op.
        if self.apply_tx.try_send(Proposal::NoOp).is_err() {
            self.enter_error_state(RaftError::Busy(
                "apply queue full at leader start".to_string(),
            ));
            return;
        }
        self.fsm.on_leader_start(term);
    }

    /// Term bump + fallback to follower. Returns whether leader teardown
    /// is owed, plus the done of any in-flight configuration change; both
    /// must be handled outside the lock.
    fn step_down_locked(
        &self,
        state: &mut NodeState,
        new_term: u64,
    ) -> (bool, Option<Done>) {
        if new_term > state.current_term {
            state.current_term = new_term;
            state.voted_for = None;
        }
        let was_leader = state.role == Role::Leader;
        if state.role.is_active() {
            state.role = initial_role(&state.conf, &self.server_id);
        }
        if was_leader {
            state.leader_id = None;
        }
        state.last_heartbeat = Instant::now();
        state.election_deadline = self.random_election_deadline();
        let ctx_done = state.conf_ctx.take().and_then(|mut ctx| ctx.done.take());
        (was_leader, ctx_done)
    }

    /// The out-of-lock half of stepping down from leadership: pending
    /// proposals fail with a not-leader status, replication stops.
    fn leader_teardown(&self, status: RaftError, ctx_done: Option<Done>) {
        let closures = self.ballot_box.clear_pending_tasks();
        for done in closures.into_iter().flatten() {
            done(Err(status.clone()));
        }
        if let Some(done) = ctx_done {
            done(Err(status.clone()));
        }
        self.replicators.stop_all();
        self.fsm.on_leader_stop();
        tracing::info!(group = %self.group_id, status = %status, "stepped down");
    }

    fn enter_error_state(&self, err: RaftError) {
        let (was_leader, ctx_done) = {
            let mut state = self.state.write();
            if state.role == Role::Error {
                return;
            }
            let was_leader = state.role == Role::Leader;
            state.role = Role::Error;
            (
                was_leader,
                state.conf_ctx.take().and_then(|mut ctx| ctx.done.take()),
            )
        };
        tracing::error!(group = %self.group_id, error = %err, "node entering error state");
        if was_leader {
            self.leader_teardown(err.clone(), ctx_done);
        } else if let Some(done) = ctx_done {
            done(Err(err.clone()));
        }
        self.fsm.set_error(err.clone());
        if let Some(read_only) = self.read_only.lock().clone() {
            read_only.set_error(err);
        }
    }

    fn random_election_deadline(&self) -> Duration {
        use rand::Rng;
        let base = self.election_timeout_ms.load(Ordering::Acquire);
        let extra = rand::thread_rng().gen_range(0..self.options.max_election_delay_ms.max(1));
        Duration::from_millis(base + extra)
    }

    /// Last log id, falling back to the snapshot boundary for an empty
    /// (fully compacted) log.
    fn last_log_id(&self, state: &NodeState) -> LogId {
        let last = self.storage.last_log_index();
        if last == 0 {
            return state.snapshot_id;
        }
        LogId::new(last, self.local_term_at(state, last))
    }

    /// Term lookup that still answers for the index right below the
    /// retained log.
    fn local_term_at(&self, state: &NodeState, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        if index == state.snapshot_id.index {
            return state.snapshot_id.term;
        }
        self.storage.get_term(index)
    }

    // ---- apply pipeline -------------------------------------------------

    async fn apply_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Proposal>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let first = tokio::select! {
                proposal = rx.recv() => match proposal {
                    Some(p) => p,
                    None => return,
                },
                _ = shutdown.recv() => return,
            };
            let mut batch = vec![first];
            while batch.len() < self.options.apply_batch {
                match rx.try_recv() {
                    Ok(proposal) => batch.push(proposal),
                    Err(_) => break,
                }
            }
            self.process_proposals(batch);
        }
    }

    /// Leader-side batch path: assign ids, register ballots, persist,
    /// self-acknowledge, wake replication.
    fn process_proposals(self: &Arc<Self>, batch: Vec<Proposal>) {
        let mut entries: Vec<LogEntry> = Vec::with_capacity(batch.len());
        let mut new_replication_targets: Vec<(PeerId, bool)> = Vec::new();
        let term;
        {
            let mut state = self.state.write();
            if state.role != Role::Leader {
                let leader = state.leader_id.clone();
                drop(state);
                for proposal in batch {
                    fail_proposal(proposal, RaftError::NotLeader {
                        leader: leader.clone(),
                    });
                }
                return;
            }
            term = state.current_term;
            let mut next = self.storage.last_log_index() + 1;
            for proposal in batch {
                let id = LogId::new(next, term);
                match proposal {
                    Proposal::NoOp => {
                        if !self
                            .ballot_box
                            .append_pending_task(&state.conf.conf, state.conf.old_conf.as_ref(), None)
                        {
                            continue;
                        }
                        entries.push(LogEntry::no_op(id));
                    }
                    Proposal::Data { data, done } => {
                        if !self.ballot_box.append_pending_task(
                            &state.conf.conf,
                            state.conf.old_conf.as_ref(),
                            done,
                        ) {
                            // Done ownership moved into the box on success
                            // only; on failure the box logged, nothing to
                            // complete.
                            continue;
                        }
                        entries.push(LogEntry::data(id, data));
                    }
                    Proposal::Conf { conf, old_conf, done } => {
                        // Membership takes effect in memory immediately;
                        // subsequent ballots use the new (possibly joint)
                        // rule.
                        let conf_entry = ConfEntry::new(id, conf.clone(), old_conf.clone());
                        if !self
                            .ballot_box
                            .append_pending_task(&conf, old_conf.as_ref(), done)
                        {
                            continue;
                        }
                        state.conf = conf_entry.clone();
                        entries.push(conf_entry.to_entry(id));
                        for peer in conf.peers() {
                            if peer != &self.server_id && !self.replicators.contains(peer) {
                                new_replication_targets.push((peer.clone(), true));
                            }
                        }
                        for learner in conf.learners() {
                            if !self.replicators.contains(learner) {
                                new_replication_targets.push((learner.clone(), false));
                            }
                        }
                    }
                }
                next += 1;
            }
        }

        if entries.is_empty() {
            return;
        }
        let first = entries[0].id.index;
        let last = entries[entries.len() - 1].id.index;
        let written = self.storage.append_entries(entries);
        if written != (last - first + 1) as usize {
            self.enter_error_state(RaftError::Storage(format!(
                "failed to persist log range [{first}, {last}]"
            )));
            return;
        }

        for (peer, is_voter) in new_replication_targets {
            self.replicators.start(peer, is_voter, term, first);
        }

        // The leader's own disk counts toward the quorum.
        if let Err(err) = self.ballot_box.commit_at(first, last, &self.server_id) {
            self.enter_error_state(err);
            return;
        }
        self.replicators.wake_all();
    }

    // ---- membership changes --------------------------------------------

    fn change_peers_internal(self: &Arc<Self>, new_conf: Configuration, done: Done) {
        if new_conf.is_empty() || !new_conf.is_valid() {
            done(Err(RaftError::InvalidConfig(
                "empty or overlapping voter/learner sets".to_string(),
            )));
            return;
        }
        let proposal = {
            let mut state = self.state.write();
            if state.role != Role::Leader {
                let leader = state.leader_id.clone();
                drop(state);
                done(Err(RaftError::NotLeader { leader }));
                return;
            }
            if state.conf_ctx.is_some() || !state.conf.is_stable() {
                drop(state);
                done(Err(RaftError::Busy(
                    "another configuration change is in progress".to_string(),
                )));
                return;
            }
            let old_conf = state.conf.conf.clone();
            if new_conf == old_conf {
                drop(state);
                done(Ok(()));
                return;
            }
            let voters_changed = new_conf.peer_vec() != old_conf.peer_vec();
            let stage = if voters_changed {
                ConfChangeStage::Joint
            } else {
                ConfChangeStage::Stable
            };
            let proposal_old = voters_changed.then(|| old_conf.clone());
            state.conf_ctx = Some(ConfChangeCtx {
                stage,
                new_conf: new_conf.clone(),
                old_conf,
                done: Some(done),
            });
            Proposal::Conf {
                conf: new_conf,
                old_conf: proposal_old,
                done: Some(self.conf_stage_continuation()),
            }
        };
        self.submit_conf_proposal(proposal);
    }

    /// Completion handle attached to every configuration entry this node
    /// proposes; fires when the entry commits and applies.
    fn conf_stage_continuation(self: &Arc<Self>) -> Done {
        let weak = Arc::downgrade(self);
        Box::new(move |status| {
            if let Some(node) = weak.upgrade() {
                node.on_conf_entry_committed(status);
            }
        })
    }

    fn submit_conf_proposal(self: &Arc<Self>, proposal: Proposal) {
        if self.apply_tx.try_send(proposal).is_err() {
            let ctx_done = {
                let mut state = self.state.write();
                state.conf_ctx.take().and_then(|mut ctx| ctx.done.take())
            };
            if let Some(done) = ctx_done {
                done(Err(RaftError::Busy("apply queue is full".to_string())));
            }
        }
    }

    fn on_conf_entry_committed(self: &Arc<Self>, status: Status) {
        enum NextStep {
            LeaveJoint(Proposal),
            Finished {
                done: Option<Done>,
                removed: Vec<PeerId>,
                leader_removed: bool,
            },
            Aborted(Option<Done>, RaftError),
        }

        let step = {
            let mut state = self.state.write();
            let Some(ctx) = state.conf_ctx.as_mut() else {
                return;
            };
            match &status {
                Err(err) => {
                    let done = ctx.done.take();
                    let err = err.clone();
                    state.conf_ctx = None;
                    NextStep::Aborted(done, err)
                }
                Ok(()) => match ctx.stage {
                    ConfChangeStage::Joint => {
                        ctx.stage = ConfChangeStage::Stable;
                        let new_conf = ctx.new_conf.clone();
                        NextStep::LeaveJoint(Proposal::Conf {
                            conf: new_conf,
                            old_conf: None,
                            done: Some(self.conf_stage_continuation()),
                        })
                    }
                    ConfChangeStage::Stable => {
                        let ctx = state.conf_ctx.take().unwrap();
                        let removed: Vec<PeerId> = ctx
                            .old_conf
                            .peers()
                            .filter(|p| !ctx.new_conf.contains(p) && !ctx.new_conf.contains_learner(p))
                            .cloned()
                            .collect();
                        let leader_removed = !ctx.new_conf.contains(&self.server_id);
                        NextStep::Finished {
                            done: ctx.done,
                            removed,
                            leader_removed,
                        }
                    }
                },
            }
        };

        match step {
            NextStep::LeaveJoint(proposal) => {
                tracing::info!(group = %self.group_id, "joint entry committed, leaving joint state");
                self.submit_conf_proposal(proposal);
            }
            NextStep::Finished {
                done,
                removed,
                leader_removed,
            } => {
                for peer in &removed {
                    self.replicators.stop(peer);
                }
                tracing::info!(
                    group = %self.group_id,
                    removed = removed.len(),
                    "configuration change finished"
                );
                if let Some(done) = done {
                    done(Ok(()));
                }
                if leader_removed {
                    let (was_leader, ctx_done) = {
                        let mut state = self.state.write();
                        state.leader_id = None;
                        let term = state.current_term;
                        self.step_down_locked(&mut state, term)
                    };
                    if was_leader {
                        self.leader_teardown(
                            RaftError::NotLeader { leader: None },
                            ctx_done,
                        );
                    }
                }
            }
            NextStep::Aborted(done, err) => {
                if let Some(done) = done {
                    done(Err(err));
                }
            }
        }
    }

    // ---- snapshot -------------------------------------------------------

    fn do_snapshot(&self) -> Status {
        if let Some(err) = self.fsm.error() {
            return Err(err);
        }
        let applied = self.fsm.last_applied_index();
        let snapshot_at = self.state.read().snapshot_id.index;
        if applied == 0 || applied <= snapshot_at {
            return Ok(());
        }
        let data = self.fsm.save_snapshot()?;
        let (term, conf) = {
            let state = self.state.read();
            let term = self.local_term_at(&state, applied);
            let conf = self
                .conf_manager
                .get(applied)
                .map(|e| e.conf)
                .unwrap_or_else(|| state.conf.conf.clone());
            (term, conf)
        };
        let meta = SnapshotMeta {
            last_included_index: applied,
            last_included_term: term,
            peers: conf.peer_vec(),
            learners: conf.learner_vec(),
        };
        *self.snapshot.write() = Some((meta.clone(), data));
        self.state.write().snapshot_id = LogId::new(applied, term);

        // Keep at least the boundary entry so the log tail (and with it
        // the next assigned index) never regresses.
        let margin = self.options.snapshot_log_index_margin;
        let first_kept = (applied + 1).saturating_sub(margin).min(applied);
        if first_kept > self.storage.first_log_index() {
            self.storage.truncate_prefix(first_kept);
        }
        tracing::info!(
            group = %self.group_id,
            last_included = applied,
            term,
            "snapshot taken"
        );
        Ok(())
    }

    async fn snapshot_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = Duration::from_secs(self.options.snapshot_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => return,
            }
            if let Err(err) = self.do_snapshot() {
                tracing::warn!(group = %self.group_id, error = %err, "periodic snapshot failed");
            }
        }
    }

    // ---- rpc handlers ---------------------------------------------------

    pub fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let (response, was_leader, ctx_done) = {
            let mut state = self.state.write();
            let mut was_leader = false;
            let mut ctx_done = None;
            if request.term < state.current_term {
                return RequestVoteResponse {
                    term: state.current_term,
                    granted: false,
                };
            }
            if request.term > state.current_term {
                // Leader stickiness: a candidate cannot depose a leader we
                // heard from within the lease window.
                if state.leader_id.is_some()
                    && state.leader_id.as_ref() != Some(&request.server_id)
                    && state.last_heartbeat.elapsed() < self.options.leader_lease_timeout()
                {
                    return RequestVoteResponse {
                        term: state.current_term,
                        granted: false,
                    };
                }
                let (wl, cd) = self.step_down_locked(&mut state, request.term);
                was_leader = wl;
                ctx_done = cd;
            }

            let local_last = self.last_log_id(&state);
            let candidate_last = LogId::new(request.last_log_index, request.last_log_term);
            let log_ok = (candidate_last.term, candidate_last.index)
                >= (local_last.term, local_last.index);
            let not_voted = state
                .voted_for
                .as_ref()
                .map(|v| v == &request.server_id)
                .unwrap_or(true);

            let granted = log_ok && not_voted && state.role.is_active();
            if granted {
                state.voted_for = Some(request.server_id.clone());
                state.last_heartbeat = Instant::now();
                state.election_deadline = self.random_election_deadline();
            }
            (
                RequestVoteResponse {
                    term: state.current_term,
                    granted,
                },
                was_leader,
                ctx_done,
            )
        };
        if was_leader {
            self.leader_teardown(RaftError::NotLeader { leader: None }, ctx_done);
        } else if let Some(done) = ctx_done {
            done(Err(RaftError::NotLeader { leader: None }));
        }
        response
    }

    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (current_term, was_leader, ctx_done) = {
            let mut state = self.state.write();
            if request.term < state.current_term {
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    last_log_index: self.storage.last_log_index(),
                };
            }
            let mut was_leader = false;
            let mut ctx_done = None;
            if request.term > state.current_term || state.role == Role::Leader {
                let (wl, cd) = self.step_down_locked(&mut state, request.term);
                was_leader = wl;
                ctx_done = cd;
            } else if state.role == Role::Candidate {
                state.role = initial_role(&state.conf, &self.server_id);
            }
            state.leader_id = Some(request.server_id.clone());
            state.last_heartbeat = Instant::now();
            (state.current_term, was_leader, ctx_done)
        };
        if was_leader {
            // Two leaders in one term cannot both have quorums; ours is
            // the stale one.
            self.leader_teardown(
                RaftError::NotLeader {
                    leader: Some(request.server_id.clone()),
                },
                ctx_done,
            );
        } else if let Some(done) = ctx_done {
            done(Err(RaftError::NotLeader {
                leader: Some(request.server_id.clone()),
            }));
        }

        // Log consistency check.
        let local_prev_term = {
            let state = self.state.read();
            self.local_term_at(&state, request.prev_log_index)
        };
        if request.prev_log_index > 0 && local_prev_term != request.prev_log_term {
            tracing::debug!(
                group = %self.group_id,
                prev_log_index = request.prev_log_index,
                expected = request.prev_log_term,
                actual = local_prev_term,
                "append rejected on log mismatch"
            );
            return AppendEntriesResponse {
                term: current_term,
                success: false,
                last_log_index: self.storage.last_log_index(),
            };
        }

        // Commits may only be adopted up to the range this request proved
        // matching: prev plus whatever it carried.
        let match_point = request.prev_log_index + request.entries.len() as u64;

        let mut to_append = request.entries;
        if !to_append.is_empty() {
            // Skip duplicates; truncate from the first real conflict.
            let mut start = None;
            for (pos, entry) in to_append.iter().enumerate() {
                let local_term = self.storage.get_term(entry.id.index);
                if local_term == 0 {
                    start = Some(pos);
                    break;
                }
                if local_term != entry.id.term {
                    if !self.storage.truncate_suffix(entry.id.index - 1) {
                        return AppendEntriesResponse {
                            term: current_term,
                            success: false,
                            last_log_index: self.storage.last_log_index(),
                        };
                    }
                    start = Some(pos);
                    break;
                }
            }
            match start {
                None => to_append.clear(),
                Some(pos) => {
                    to_append.drain(..pos);
                }
            }
            if !to_append.is_empty() {
                let count = to_append.len();
                let conf_update = to_append
                    .iter()
                    .rev()
                    .find_map(|e| ConfEntry::from_entry(e));
                if self.storage.append_entries(to_append) != count {
                    return AppendEntriesResponse {
                        term: current_term,
                        success: false,
                        last_log_index: self.storage.last_log_index(),
                    };
                }
                if let Some(conf_entry) = conf_update {
                    let mut state = self.state.write();
                    state.conf = conf_entry;
                    if state.role.is_active() {
                        state.role = initial_role(&state.conf, &self.server_id);
                    }
                }
            }
        }

        let last_log_index = self.storage.last_log_index();
        let committed = request.committed_index.min(match_point);
        if committed > 0 {
            self.ballot_box.set_last_committed_index(committed);
        }
        AppendEntriesResponse {
            term: current_term,
            success: true,
            last_log_index,
        }
    }

    pub fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let (current_term, was_leader, ctx_done) = {
            let mut state = self.state.write();
            if request.term < state.current_term {
                return InstallSnapshotResponse {
                    term: state.current_term,
                    success: false,
                };
            }
            let mut was_leader = false;
            let mut ctx_done = None;
            if request.term > state.current_term || state.role == Role::Leader {
                let (wl, cd) = self.step_down_locked(&mut state, request.term);
                was_leader = wl;
                ctx_done = cd;
            }
            state.leader_id = Some(request.server_id.clone());
            state.last_heartbeat = Instant::now();
            (state.current_term, was_leader, ctx_done)
        };
        if was_leader {
            self.leader_teardown(
                RaftError::NotLeader {
                    leader: Some(request.server_id.clone()),
                },
                ctx_done,
            );
        } else if let Some(done) = ctx_done {
            done(Err(RaftError::NotLeader {
                leader: Some(request.server_id.clone()),
            }));
        }

        let meta = request.meta;
        if meta.last_included_index <= self.fsm.last_applied_index() {
            // Nothing new in this image.
            return InstallSnapshotResponse {
                term: current_term,
                success: true,
            };
        }
        if let Err(err) = self.fsm.install_snapshot(&meta, request.data) {
            tracing::error!(group = %self.group_id, error = %err, "snapshot load failed");
            return InstallSnapshotResponse {
                term: current_term,
                success: false,
            };
        }
        if let Err(err) = self.storage.reset(meta.last_included_index + 1) {
            tracing::error!(group = %self.group_id, error = %err, "log reset after snapshot failed");
            return InstallSnapshotResponse {
                term: current_term,
                success: false,
            };
        }
        {
            let mut state = self.state.write();
            state.snapshot_id = LogId::new(meta.last_included_index, meta.last_included_term);
            state.conf = ConfEntry::new(
                LogId::new(meta.last_included_index, meta.last_included_term),
                Configuration::with_learners(meta.peers.clone(), meta.learners.clone()),
                None,
            );
            if state.role.is_active() {
                state.role = initial_role(&state.conf, &self.server_id);
            }
        }
        self.ballot_box.set_last_committed_index(meta.last_included_index);
        tracing::info!(
            group = %self.group_id,
            last_included = meta.last_included_index,
            "snapshot installed from leader"
        );
        InstallSnapshotResponse {
            term: current_term,
            success: true,
        }
    }

    pub fn handle_timeout_now(self: &Arc<Self>, request: TimeoutNowRequest) -> TimeoutNowResponse {
        let accept = {
            let state = self.state.read();
            state.current_term == request.term
                && state.role == Role::Follower
                && state.conf.contains_voter(&self.server_id)
        };
        if accept {
            let node = self.clone();
            tokio::spawn(async move {
                node.elect_self().await;
            });
        }
        TimeoutNowResponse {
            term: self.state.read().current_term,
            success: accept,
        }
    }

    async fn event_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ReplicatorEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = shutdown.recv() => return,
            };
            match event {
                ReplicatorEvent::HigherTerm { term, from } => {
                    let (was_leader, ctx_done) = {
                        let mut state = self.state.write();
                        if term <= state.current_term {
                            continue;
                        }
                        tracing::info!(
                            group = %self.group_id,
                            term,
                            from = %from,
                            "observed a higher term"
                        );
                        self.step_down_locked(&mut state, term)
                    };
                    if was_leader {
                        self.leader_teardown(RaftError::NotLeader { leader: None }, ctx_done);
                    } else if let Some(done) = ctx_done {
                        done(Err(RaftError::NotLeader { leader: None }));
                    }
                }
                ReplicatorEvent::Violation(err) => {
                    self.enter_error_state(err);
                }
            }
        }
    }

    // ---- rpc server -----------------------------------------------------

    async fn serve_loop(
        self: Arc<Self>,
        mut rx: RpcReceiver,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let call = tokio::select! {
                call = rx.recv() => match call {
                    Some(call) => call,
                    None => return,
                },
                _ = shutdown.recv() => return,
            };
            // Every call gets its own task: a leader's read-index round
            // must not head-of-line block this node's append handling.
            let node = self.clone();
            tokio::spawn(async move {
                let RpcCall { request, reply } = call;
                let response = node.dispatch(request).await;
                let _ = reply.send(response);
            });
        }
    }

    async fn dispatch(self: &Arc<Self>, request: RpcRequest) -> RpcResponse {
        if self.state.read().role == Role::Shutdown {
            return RpcResponse::Error(RaftError::HostDown.into());
        }
        match request {
            RpcRequest::RequestVote(req) => {
                if req.group_id != self.group_id {
                    return group_mismatch(&self.group_id, &req.group_id);
                }
                RpcResponse::RequestVote(self.handle_request_vote(req))
            }
            RpcRequest::AppendEntries(req) => {
                if req.group_id != self.group_id {
                    return group_mismatch(&self.group_id, &req.group_id);
                }
                RpcResponse::AppendEntries(self.handle_append_entries(req))
            }
            RpcRequest::InstallSnapshot(req) => {
                if req.group_id != self.group_id {
                    return group_mismatch(&self.group_id, &req.group_id);
                }
                RpcResponse::InstallSnapshot(self.handle_install_snapshot(req))
            }
            RpcRequest::ReadIndex(req) => {
                if req.group_id != self.group_id {
                    return group_mismatch(&self.group_id, &req.group_id);
                }
                match self.handle_read_index_request(req).await {
                    Ok(resp) => RpcResponse::ReadIndex(resp),
                    Err(err) => RpcResponse::Error(err.into()),
                }
            }
            RpcRequest::TimeoutNow(req) => {
                if req.group_id != self.group_id {
                    return group_mismatch(&self.group_id, &req.group_id);
                }
                RpcResponse::TimeoutNow(self.handle_timeout_now(req))
            }
            RpcRequest::Ping(_) => RpcResponse::Error(ErrorResponse::success()),
        }
    }

    /// Leader half of the read-index protocol: record the commit index,
    /// confirm leadership with a quorum heartbeat round (skipped within
    /// the lease when lease reads are on), answer with the index.
    async fn leader_read_index(&self, term: u64, conf: ConfEntry) -> Result<u64> {
        let index = self.ballot_box.last_committed_index();
        let voters = conf.all_voters();
        if voters.len() <= 1 {
            return Ok(index);
        }

        if self.options.lease_read {
            let lease = self.options.leader_lease_timeout();
            let quorum = voters.len() / 2 + 1;
            let mut alive = self.replicators.alive_voters_within(lease);
            if voters.contains(&self.server_id) {
                alive += 1;
            }
            if alive >= quorum {
                return Ok(index);
            }
        }

        // Heartbeat round, capped by the election timeout.
        let mut ballot = Ballot::new(&conf.conf, conf.old_conf.as_ref());
        ballot.grant(&self.server_id);
        let request = AppendEntriesRequest {
            group_id: self.group_id.clone(),
            server_id: self.server_id.clone(),
            term,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            committed_index: index,
        };
        let timeout = self
            .options
            .rpc_default_timeout()
            .min(self.options.election_timeout());
        let rounds = voters
            .iter()
            .filter(|peer| *peer != &self.server_id)
            .map(|peer| {
                let client = self.client.clone();
                let request = request.clone();
                let peer = peer.clone();
                async move {
                    let response = RaftClient::append_entries(
                        client.as_ref(),
                        &peer.endpoint(),
                        request,
                        timeout,
                    )
                    .await;
                    (peer, response)
                }
            });
        let results = futures::future::join_all(rounds).await;
        for (peer, response) in results {
            match response {
                Ok(response) if response.success => ballot.grant(&peer),
                Ok(response) => {
                    if response.term > term {
                        let _ = self.events_tx.send(ReplicatorEvent::HigherTerm {
                            term: response.term,
                            from: peer,
                        });
                    }
                }
                Err(err) => {
                    tracing::debug!(peer = %peer, error = %err, "read-index heartbeat failed");
                }
            }
        }
        if ballot.is_granted() {
            Ok(index)
        } else {
            Err(RaftError::NotLeader {
                leader: Some(self.server_id.clone()),
            })
        }
    }
}

#[async_trait]
impl ReadIndexExecutor for Node {
    async fn handle_read_index_request(
        &self,
        request: ReadIndexRequest,
    ) -> Result<ReadIndexResponse> {
        if let Some(err) = self.fsm.error() {
            return Err(err);
        }
        let (role, term, leader, conf) = {
            let state = self.state.read();
            (
                state.role,
                state.current_term,
                state.leader_id.clone(),
                state.conf.clone(),
            )
        };
        match role {
            Role::Leader => {
                let index = self.leader_read_index(term, conf).await?;
                Ok(ReadIndexResponse { index })
            }
            Role::Follower | Role::Learner => {
                let Some(leader) = leader else {
                    return Err(RaftError::NotLeader { leader: None });
                };
                if leader == self.server_id {
                    return Err(RaftError::NotLeader { leader: None });
                }
                RaftClient::read_index(
                    self.client.as_ref(),
                    &leader.endpoint(),
                    request,
                    self.options.rpc_default_timeout(),
                )
                .await
            }
            Role::Candidate => Err(RaftError::NotLeader { leader: None }),
            Role::Error => Err(self.fsm.error().unwrap_or(RaftError::Stopped)),
            Role::Shutdown => Err(RaftError::HostDown),
        }
    }
}

fn initial_role(conf: &ConfEntry, server_id: &PeerId) -> Role {
    if conf.contains_voter(server_id) {
        Role::Follower
    } else if conf.conf.contains_learner(server_id) {
        Role::Learner
    } else {
        Role::Follower
    }
}

fn fail_proposal(proposal: Proposal, err: RaftError) {
    match proposal {
        Proposal::Data { done: Some(done), .. } => done(Err(err)),
        Proposal::Conf { done: Some(done), .. } => done(Err(err)),
        _ => {}
    }
}

fn group_mismatch(local: &str, remote: &str) -> RpcResponse {
    RpcResponse::Error(
        RaftError::InvalidConfig(format!(
            "request for group {remote} reached group {local}"
        ))
        .into(),
    )
}
