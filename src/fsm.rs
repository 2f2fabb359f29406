//! Serialized application of committed entries to the user state machine.
//!
//! One applier task consumes commit notifications, reads the newly
//! committed range from storage, and dispatches it entry by entry. The
//! applied index only moves forward and never passes the committed index.
//! Completion handles registered at propose time are driven here with the
//! apply outcome, so a proposer learns not just that its command committed
//! but that its effect is visible.
//!
//! Any apply failure is terminal: the caller records the error, refuses
//! further applies, and surfaces the cause through `error()`. An entry is
//! never delivered twice after a failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ballot_box::{ClosureQueue, CommitWaiter};
use crate::conf::{ConfEntry, Configuration};
use crate::error::{RaftError, Result};
use crate::storage::LogStorage;
use crate::types::{EntryType, SnapshotMeta};

/// A committed entry handed to the state machine.
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    pub index: u64,
    pub term: u64,
    pub data: Bytes,
}

/// The replicated state machine supplied by the user.
pub trait StateMachine: Send + Sync {
    /// Apply one committed command. Failing here is fatal for the node.
    fn on_apply(&self, entry: &CommittedEntry) -> Result<()>;

    /// Produce a point-in-time image of the machine.
    fn on_snapshot_save(&self) -> Result<Bytes>;

    /// Replace the machine's state with a snapshot image.
    fn on_snapshot_load(&self, meta: &SnapshotMeta, data: Bytes) -> Result<()>;

    fn on_leader_start(&self, _term: u64) {}

    fn on_leader_stop(&self) {}

    /// A membership change committed.
    fn on_configuration_committed(&self, _conf: &Configuration) {}

    /// The node hit an unrecoverable error; applies have stopped.
    fn on_error(&self, _err: &RaftError) {}
}

enum ApplierMsg {
    Committed(u64),
    Shutdown,
}

/// Drives the user state machine from commit notifications.
pub struct FsmCaller {
    sm: Arc<dyn StateMachine>,
    storage: Arc<dyn LogStorage>,
    closure_queue: Arc<ClosureQueue>,
    last_applied: AtomicU64,
    tx: mpsc::UnboundedSender<ApplierMsg>,
    listeners: Mutex<Vec<Box<dyn Fn(u64) + Send + Sync>>>,
    error: Mutex<Option<RaftError>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FsmCaller {
    /// Spawn the applier task and return the caller handle.
    pub fn start(
        sm: Arc<dyn StateMachine>,
        storage: Arc<dyn LogStorage>,
        closure_queue: Arc<ClosureQueue>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let caller = Arc::new(Self {
            sm,
            storage,
            closure_queue,
            last_applied: AtomicU64::new(0),
            tx,
            listeners: Mutex::new(Vec::new()),
            error: Mutex::new(None),
            handle: Mutex::new(None),
        });
        let runner = caller.clone();
        let handle = tokio::spawn(async move { runner.applier_loop(rx).await });
        *caller.handle.lock() = Some(handle);
        caller
    }

    pub fn last_applied_index(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Hook invoked after every applied-index advance; the read-only
    /// service registers here.
    pub fn add_applied_listener(&self, listener: Box<dyn Fn(u64) + Send + Sync>) {
        self.listeners.lock().push(listener);
    }

    pub fn error(&self) -> Option<RaftError> {
        self.error.lock().clone()
    }

    pub fn set_error(&self, err: RaftError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            tracing::error!(error = %err, "state machine caller entering error state");
            *slot = Some(err.clone());
            drop(slot);
            self.sm.on_error(&err);
        }
    }

    /// Force the applied index after a snapshot install or recovery.
    pub fn reset_applied(&self, index: u64) {
        self.last_applied.store(index, Ordering::Release);
    }

    pub fn on_leader_start(&self, term: u64) {
        self.sm.on_leader_start(term);
    }

    pub fn on_leader_stop(&self) {
        self.sm.on_leader_stop();
    }

    /// Capture a state machine image.
    pub fn save_snapshot(&self) -> crate::error::Result<Bytes> {
        self.sm.on_snapshot_save()
    }

    /// Load a snapshot image and fast-forward the applied index to its
    /// boundary.
    pub fn install_snapshot(&self, meta: &SnapshotMeta, data: Bytes) -> crate::error::Result<()> {
        self.sm.on_snapshot_load(meta, data)?;
        self.last_applied
            .store(meta.last_included_index, Ordering::Release);
        for listener in self.listeners.lock().iter() {
            listener(meta.last_included_index);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ApplierMsg::Shutdown);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn applier_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ApplierMsg>) {
        while let Some(msg) = rx.recv().await {
            let mut stop = false;
            let mut target = match msg {
                ApplierMsg::Committed(index) => index,
                ApplierMsg::Shutdown => break,
            };
            // Coalesce queued notifications into one pass.
            while let Ok(next) = rx.try_recv() {
                match next {
                    ApplierMsg::Committed(index) => target = target.max(index),
                    ApplierMsg::Shutdown => stop = true,
                }
            }
            self.apply_to(target);
            if stop {
                break;
            }
        }
        tracing::debug!("applier task exited");
    }

    fn apply_to(&self, target: u64) {
        if self.error.lock().is_some() {
            return;
        }
        let applied = self.last_applied.load(Ordering::Acquire);
        if target <= applied {
            return;
        }

        let (start, handles) = match self.closure_queue.pop_until(target) {
            Ok(popped) => popped,
            Err(err) => {
                self.set_error(err);
                return;
            }
        };
        let mut handles = handles.into_iter();
        // Slots below the apply window would mean the queue ran ahead of
        // the applier; drop them rather than misalign the rest.
        if start < applied + 1 {
            for _ in start..applied + 1 {
                handles.next();
            }
        }

        let mut new_applied = applied;
        for index in applied + 1..=target {
            let done = if index >= start {
                handles.next().flatten()
            } else {
                None
            };
            let Some(entry) = self.storage.get_entry(index) else {
                let err = RaftError::Storage(format!(
                    "committed entry {index} missing from log storage"
                ));
                self.set_error(err.clone());
                if let Some(done) = done {
                    done(Err(err.clone()));
                }
                for rest in handles.by_ref().flatten() {
                    rest(Err(err.clone()));
                }
                break;
            };

            match entry.entry_type {
                EntryType::Data => {
                    let committed = CommittedEntry {
                        index,
                        term: entry.id.term,
                        data: entry.data,
                    };
                    if let Err(err) = self.sm.on_apply(&committed) {
                        self.set_error(err.clone());
                        if let Some(done) = done {
                            done(Err(err.clone()));
                        }
                        for rest in handles.by_ref().flatten() {
                            rest(Err(err.clone()));
                        }
                        break;
                    }
                    if let Some(done) = done {
                        done(Ok(()));
                    }
                }
                EntryType::Configuration => {
                    if let Some(conf_entry) = ConfEntry::from_entry(&entry) {
                        self.sm.on_configuration_committed(&conf_entry.conf);
                    }
                    if let Some(done) = done {
                        done(Ok(()));
                    }
                }
                EntryType::NoOp => {
                    if let Some(done) = done {
                        done(Ok(()));
                    }
                }
            }
            new_applied = index;
            self.last_applied.store(new_applied, Ordering::Release);
        }

        if new_applied > applied {
            for listener in self.listeners.lock().iter() {
                listener(new_applied);
            }
        }
    }
}

impl CommitWaiter for FsmCaller {
    fn on_committed(&self, index: u64) {
        let _ = self.tx.send(ApplierMsg::Committed(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::V1Codec;
    use crate::conf::ConfigurationManager;
    use crate::config::NodeOptions;
    use crate::storage::RocksLogStorage;
    use crate::types::{LogEntry, LogId};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSm {
        applied: Mutex<Vec<(u64, Bytes)>>,
        fail_at: Option<u64>,
    }

    impl StateMachine for RecordingSm {
        fn on_apply(&self, entry: &CommittedEntry) -> Result<()> {
            if Some(entry.index) == self.fail_at {
                return Err(RaftError::Internal("poisoned entry".to_string()));
            }
            self.applied.lock().push((entry.index, entry.data.clone()));
            Ok(())
        }

        fn on_snapshot_save(&self) -> Result<Bytes> {
            Ok(Bytes::new())
        }

        fn on_snapshot_load(&self, _meta: &SnapshotMeta, _data: Bytes) -> Result<()> {
            Ok(())
        }
    }

    fn storage_with_entries(dir: &TempDir, count: u64) -> Arc<RocksLogStorage> {
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
        let entries: Vec<LogEntry> = (1..=count)
            .map(|i| LogEntry::data(LogId::new(i, 1), Bytes::from(format!("cmd{i}"))))
            .collect();
        assert_eq!(storage.append_entries(entries), count as usize);
        Arc::new(storage)
    }

    async fn wait_for_applied(caller: &FsmCaller, target: u64) {
        for _ in 0..200 {
            if caller.last_applied_index() >= target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "applied index stuck at {} (wanted {target})",
            caller.last_applied_index()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_applies_in_order_and_notifies_listeners() {
        let dir = TempDir::new().unwrap();
        let storage = storage_with_entries(&dir, 5);
        let sm = Arc::new(RecordingSm::default());
        let queue = Arc::new(ClosureQueue::new());
        let caller = FsmCaller::start(sm.clone(), storage, queue);

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        caller.add_applied_listener(Box::new(move |index| {
            seen_clone.store(index, Ordering::SeqCst);
        }));

        caller.on_committed(3);
        caller.on_committed(5);
        wait_for_applied(&caller, 5).await;

        let applied = sm.applied.lock();
        assert_eq!(applied.len(), 5);
        assert_eq!(applied[0].0, 1);
        assert_eq!(applied[4].0, 5);
        drop(applied);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        caller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_completion_handles_fire_with_apply_outcome() {
        let dir = TempDir::new().unwrap();
        let storage = storage_with_entries(&dir, 2);
        let sm = Arc::new(RecordingSm::default());
        let queue = Arc::new(ClosureQueue::new());
        queue.reset_first_index(1);
        let (tx1, rx1) = tokio::sync::oneshot::channel();
        let (tx2, rx2) = tokio::sync::oneshot::channel();
        queue.append(Some(Box::new(move |status| {
            let _ = tx1.send(status);
        })));
        queue.append(Some(Box::new(move |status| {
            let _ = tx2.send(status);
        })));

        let caller = FsmCaller::start(sm, storage, queue);
        caller.on_committed(2);

        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
        caller.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_apply_failure_is_terminal() {
        let dir = TempDir::new().unwrap();
        let storage = storage_with_entries(&dir, 5);
        let sm = Arc::new(RecordingSm {
            fail_at: Some(3),
            ..Default::default()
        });
        let queue = Arc::new(ClosureQueue::new());
        let caller = FsmCaller::start(sm.clone(), storage, queue);

        caller.on_committed(5);
        wait_for_applied(&caller, 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Stopped at the poisoned entry, error recorded, no replays.
        assert_eq!(caller.last_applied_index(), 2);
        assert!(caller.error().is_some());
        caller.on_committed(5);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sm.applied.lock().len(), 2);
        caller.shutdown().await;
    }
}
