//! Batched linearizable reads via the read-index protocol.
//!
//! Client read requests land in a bounded ring; one handler task drains
//! them in batches and issues a single ReadIndex per batch, so a burst of
//! reads costs one quorum confirmation. The response carries the leader's
//! commit index at serve time, shared by every waiter in the batch:
//!
//! - already applied -> notify success immediately;
//! - applied lagging the index beyond `max_read_index_lag` -> fail fast;
//! - otherwise park under the index in an ordered map, drained by applied
//!   events and a periodic scanner.
//!
//! A success notification therefore guarantees the state machine reflected
//! every entry up to the waiter's index at notification time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::NodeOptions;
use crate::error::{RaftError, Result};
use crate::fsm::FsmCaller;
use crate::rpc::{ReadIndexRequest, ReadIndexResponse};
use crate::types::PeerId;

/// Publish retry bound when the ring is full.
const MAX_ADD_REQUEST_RETRIES: usize = 3;

/// Completion handle for one read waiter. On success it receives the
/// commit index the read was serialized at, plus the caller's context.
pub type ReadIndexDone = Box<dyn FnOnce(Result<u64>, Bytes) + Send + 'static>;

/// The node-side handler the service funnels batches into.
#[async_trait]
pub trait ReadIndexExecutor: Send + Sync {
    async fn handle_read_index_request(
        &self,
        request: ReadIndexRequest,
    ) -> Result<ReadIndexResponse>;
}

struct ReadIndexState {
    ctx: Bytes,
    done: ReadIndexDone,
    index: u64,
    start: Instant,
}

/// One served batch waiting for the applied index to reach `index`.
struct ReadIndexStatus {
    index: u64,
    states: Vec<ReadIndexState>,
}

enum ReadEvent {
    Request {
        ctx: Bytes,
        done: ReadIndexDone,
        start: Instant,
    },
    /// Drain marker: everything before it has been handled when the
    /// oneshot fires.
    Flush(oneshot::Sender<()>),
}

/// Batched ReadIndex pipeline with a pending-notify cache.
pub struct ReadOnlyService {
    group_id: String,
    server_id: PeerId,
    options: NodeOptions,
    executor: Weak<dyn ReadIndexExecutor>,
    fsm: Arc<FsmCaller>,
    tx: mpsc::Sender<ReadEvent>,
    // <read index, statuses parked at it>
    pending: Mutex<BTreeMap<u64, Vec<ReadIndexStatus>>>,
    error: Mutex<Option<RaftError>>,
    shutdown: AtomicBool,
    handler: Mutex<Option<JoinHandle<()>>>,
    scanner: Mutex<Option<JoinHandle<()>>>,
}

impl ReadOnlyService {
    pub fn start(
        group_id: String,
        server_id: PeerId,
        executor: Weak<dyn ReadIndexExecutor>,
        fsm: Arc<FsmCaller>,
        options: NodeOptions,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(options.disruptor_buffer_size);
        let service = Arc::new(Self {
            group_id,
            server_id,
            options,
            executor,
            fsm: fsm.clone(),
            tx,
            pending: Mutex::new(BTreeMap::new()),
            error: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            handler: Mutex::new(None),
            scanner: Mutex::new(None),
        });

        let handler = {
            let service = service.clone();
            tokio::spawn(async move { service.handler_loop(rx).await })
        };
        *service.handler.lock() = Some(handler);

        // Applied-index listener: the integration point with the FSM
        // caller.
        {
            let weak = Arc::downgrade(&service);
            fsm.add_applied_listener(Box::new(move |applied| {
                if let Some(service) = weak.upgrade() {
                    service.on_applied(applied);
                }
            }));
        }

        // Periodic scanner in case applied events raced with parking.
        let scanner = {
            let weak = Arc::downgrade(&service);
            let period = Duration::from_millis(service.options.max_election_delay_ms.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let Some(service) = weak.upgrade() else {
                        return;
                    };
                    service.on_applied(service.fsm.last_applied_index());
                }
            })
        };
        *service.scanner.lock() = Some(scanner);

        service
    }

    /// Non-blocking enqueue. Spins up to three times when the ring is
    /// full, then completes the waiter with `Busy`.
    pub fn add_request(&self, ctx: Bytes, done: ReadIndexDone) {
        if self.shutdown.load(Ordering::Acquire) {
            done(Err(RaftError::HostDown), ctx);
            return;
        }
        let mut event = ReadEvent::Request {
            ctx,
            done,
            start: Instant::now(),
        };
        for _ in 0..=MAX_ADD_REQUEST_RETRIES {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(back)) => {
                    event = back;
                    std::hint::spin_loop();
                }
                Err(mpsc::error::TrySendError::Closed(back)) => {
                    if let ReadEvent::Request { ctx, done, .. } = back {
                        done(Err(RaftError::Stopped), ctx);
                    }
                    return;
                }
            }
        }
        tracing::warn!(group = %self.group_id, "read-index ring overloaded");
        if let ReadEvent::Request { ctx, done, .. } = event {
            done(
                Err(RaftError::Busy(
                    "too many read-only requests".to_string(),
                )),
                ctx,
            );
        }
    }

    /// The node hit an unrecoverable error: every parked waiter learns it
    /// and the cache empties.
    pub fn set_error(&self, err: RaftError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                *slot = Some(err.clone());
            }
        }
        let drained: Vec<ReadIndexStatus> = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending).into_values().flatten().collect()
        };
        for status in drained {
            notify_fail(status, err.clone());
        }
    }

    /// Begin shutdown: refuse new requests and push a drain marker.
    pub fn shutdown(&self) -> Option<oneshot::Receiver<()>> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return None;
        }
        let (flush_tx, flush_rx) = oneshot::channel();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(ReadEvent::Flush(flush_tx)).await;
        });
        Some(flush_rx)
    }

    /// Wait for the pipeline to drain, fail whatever is still parked, and
    /// terminate the scanner with a five-second grace.
    pub async fn join(&self, flush_rx: Option<oneshot::Receiver<()>>) {
        if let Some(flush_rx) = flush_rx {
            let _ = flush_rx.await;
        }
        if let Some(handler) = self.handler.lock().take() {
            handler.abort();
        }
        let drained: Vec<ReadIndexStatus> = {
            let mut pending = self.pending.lock();
            std::mem::take(&mut *pending).into_values().flatten().collect()
        };
        for status in drained {
            notify_fail(status, RaftError::Stopped);
        }
        let scanner = self.scanner.lock().take();
        if let Some(scanner) = scanner {
            scanner.abort();
            let _ = tokio::time::timeout(Duration::from_secs(5), scanner).await;
        }
    }

    async fn handler_loop(self: Arc<Self>, mut rx: mpsc::Receiver<ReadEvent>) {
        loop {
            let Some(first) = rx.recv().await else {
                return;
            };
            let mut batch = Vec::with_capacity(self.options.apply_batch);
            let mut flush = None;
            match first {
                ReadEvent::Request { ctx, done, start } => batch.push(ReadIndexState {
                    ctx,
                    done,
                    index: 0,
                    start,
                }),
                ReadEvent::Flush(tx) => flush = Some(tx),
            }
            while flush.is_none() && batch.len() < self.options.apply_batch {
                match rx.try_recv() {
                    Ok(ReadEvent::Request { ctx, done, start }) => batch.push(ReadIndexState {
                        ctx,
                        done,
                        index: 0,
                        start,
                    }),
                    Ok(ReadEvent::Flush(tx)) => flush = Some(tx),
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                self.execute_batch(batch).await;
            }
            if let Some(flush) = flush {
                let _ = flush.send(());
            }
        }
    }

    /// One ReadIndex round for a whole batch of waiters.
    async fn execute_batch(&self, mut states: Vec<ReadIndexState>) {
        let request = ReadIndexRequest {
            group_id: self.group_id.clone(),
            server_id: self.server_id.clone(),
            entries: states.iter().map(|s| s.ctx.clone()).collect(),
        };
        let Some(executor) = self.executor.upgrade() else {
            notify_fail(ReadIndexStatus { index: 0, states }, RaftError::Stopped);
            return;
        };
        let response = match executor.handle_read_index_request(request).await {
            Ok(response) => response,
            Err(err) => {
                notify_fail(ReadIndexStatus { index: 0, states }, err);
                return;
            }
        };

        let index = response.index;
        for state in &mut states {
            state.index = index;
        }
        let status = ReadIndexStatus { index, states };
        let applied = self.fsm.last_applied_index();

        if applied >= index {
            notify_success(status);
            return;
        }
        if let Some(max_lag) = self.options.max_read_index_lag {
            if applied.saturating_add(max_lag) < index {
                notify_fail(
                    status,
                    RaftError::Busy(format!(
                        "applied index {applied} lags read index {index} beyond {max_lag}"
                    )),
                );
                return;
            }
        }
        // Not applied yet: park until the state machine catches up.
        self.pending.lock().entry(index).or_default().push(status);
    }

    /// Drain every parked batch whose index the state machine has reached.
    pub fn on_applied(&self, applied: u64) {
        let ready: Vec<ReadIndexStatus> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            let rest = pending.split_off(&(applied + 1));
            let head = std::mem::replace(&mut *pending, rest);
            head.into_values().flatten().collect()
        };
        for status in ready {
            notify_success(status);
        }
        if let Some(err) = self.error.lock().clone() {
            self.set_error(err);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().values().map(|v| v.len()).sum()
    }
}

fn notify_success(status: ReadIndexStatus) {
    for state in status.states {
        tracing::trace!(
            index = state.index,
            elapsed_us = state.start.elapsed().as_micros() as u64,
            "read-index served"
        );
        (state.done)(Ok(state.index), state.ctx);
    }
}

fn notify_fail(status: ReadIndexStatus, err: RaftError) {
    for state in status.states {
        (state.done)(Err(err.clone()), state.ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot_box::ClosureQueue;
    use crate::codec::V1Codec;
    use crate::conf::ConfigurationManager;
    use crate::fsm::{CommittedEntry, StateMachine};
    use crate::storage::RocksLogStorage;
    use crate::types::SnapshotMeta;
    use std::sync::atomic::AtomicU64;
    use tempfile::TempDir;

    struct NoopSm;
    impl StateMachine for NoopSm {
        fn on_apply(&self, _entry: &CommittedEntry) -> Result<()> {
            Ok(())
        }
        fn on_snapshot_save(&self) -> Result<Bytes> {
            Ok(Bytes::new())
        }
        fn on_snapshot_load(&self, _meta: &SnapshotMeta, _data: Bytes) -> Result<()> {
            Ok(())
        }
    }

    struct FixedExecutor {
        index: u64,
        calls: AtomicU64,
    }

    #[async_trait]
    impl ReadIndexExecutor for FixedExecutor {
        async fn handle_read_index_request(
            &self,
            request: ReadIndexRequest,
        ) -> Result<ReadIndexResponse> {
            self.calls.fetch_add(request.entries.len() as u64, Ordering::SeqCst);
            Ok(ReadIndexResponse { index: self.index })
        }
    }

    struct TestHarness {
        service: Arc<ReadOnlyService>,
        executor: Arc<FixedExecutor>,
        fsm: Arc<FsmCaller>,
        _dir: TempDir,
    }

    fn harness(index: u64, options: NodeOptions) -> TestHarness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(
            RocksLogStorage::open(
                dir.path(),
                &NodeOptions {
                    sync: false,
                    ..Default::default()
                },
                Arc::new(V1Codec),
                Arc::new(ConfigurationManager::new()),
            )
            .unwrap(),
        );
        let fsm = FsmCaller::start(Arc::new(NoopSm), storage, Arc::new(ClosureQueue::new()));
        let executor = Arc::new(FixedExecutor {
            index,
            calls: AtomicU64::new(0),
        });
        let weak: Weak<dyn ReadIndexExecutor> = Arc::downgrade(&executor);
        let service = ReadOnlyService::start(
            "test".to_string(),
            PeerId::new("127.0.0.1", 7001),
            weak,
            fsm.clone(),
            options,
        );
        TestHarness {
            service,
            executor,
            fsm,
            _dir: dir,
        }
    }

    fn request(service: &ReadOnlyService) -> oneshot::Receiver<Result<u64>> {
        let (tx, rx) = oneshot::channel();
        service.add_request(
            Bytes::from("ctx"),
            Box::new(move |result, _ctx| {
                let _ = tx.send(result);
            }),
        );
        rx
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_success_when_already_applied() {
        let h = harness(0, NodeOptions::default());
        let rx = request(&h.service);
        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), 0);
        assert_eq!(h.executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_parks_until_applied_catches_up() {
        let h = harness(5, NodeOptions::default());
        let rx = request(&h.service);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.service.pending_len(), 1);

        h.fsm.reset_applied(5);
        h.service.on_applied(5);
        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), 5);
        assert_eq!(h.service.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lag_threshold_fails_fast() {
        let options = NodeOptions {
            max_read_index_lag: Some(100),
            ..Default::default()
        };
        let h = harness(10_000, options);
        let rx = request(&h.service);
        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(RaftError::Busy(_))));

        // A generous threshold parks instead.
        let options = NodeOptions {
            max_read_index_lag: Some(20_000),
            ..Default::default()
        };
        let h2 = harness(10_000, options);
        let rx2 = request(&h2.service);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h2.service.pending_len(), 1);
        h2.fsm.reset_applied(10_000);
        h2.service.on_applied(10_000);
        assert_eq!(rx2.await.unwrap().unwrap(), 10_000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_error_state_flushes_pending() {
        let h = harness(7, NodeOptions::default());
        let rx = request(&h.service);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.service.pending_len(), 1);

        h.service.set_error(RaftError::Violation("bad".to_string()));
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(RaftError::Violation(_))));
        assert_eq!(h.service.pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_rejects_and_fails_parked() {
        let h = harness(9, NodeOptions::default());
        let parked = request(&h.service);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let flush = h.service.shutdown();
        h.service.join(flush).await;

        let result = parked.await.unwrap();
        assert!(matches!(result, Err(RaftError::Stopped)));

        // New requests are refused outright.
        let rx = request(&h.service);
        assert!(matches!(rx.await.unwrap(), Err(RaftError::HostDown)));
    }
}
