//! Quorum tracking and the commit index.
//!
//! The ballot box owns one [`Ballot`] per pending log index on the leader.
//! As peers acknowledge ranges, ballots are granted; when the head of the
//! pending queue becomes fully granted the commit index advances and the
//! FSM caller is woken, always outside the lock, since the waiter may
//! reenter.
//!
//! `last_committed_index` is read on every apply and every read-index
//! round, so it lives in an `AtomicU64` and the common read path takes no
//! lock; all writers serialize on the inner mutex.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ballot::{Ballot, PosHint};
use crate::conf::Configuration;
use crate::error::{RaftError, Result};
use crate::types::{Done, PeerId};

/// Receiver of commit notifications (the FSM caller in production).
pub trait CommitWaiter: Send + Sync {
    fn on_committed(&self, index: u64);
}

/// FIFO of completion handles for tasks the local node proposed.
///
/// Slot `k` belongs to log index `first_index + k`. Replicated entries the
/// node did not propose have no slot at all: the queue is reset to the new
/// leader's first pending index on election.
#[derive(Default)]
pub struct ClosureQueue {
    inner: Mutex<ClosureQueueInner>,
}

#[derive(Default)]
struct ClosureQueueInner {
    first_index: u64,
    queue: VecDeque<Option<Done>>,
}

impl ClosureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything; the caller owns completing the returned handles
    /// (with a not-leader status on step-down).
    pub fn clear(&self) -> Vec<Option<Done>> {
        let mut inner = self.inner.lock();
        inner.first_index = 0;
        inner.queue.drain(..).collect()
    }

    pub fn reset_first_index(&self, first_index: u64) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.queue.is_empty());
        inner.first_index = first_index;
    }

    pub fn append(&self, done: Option<Done>) {
        self.inner.lock().queue.push_back(done);
    }

    /// Pop the handles for every index up to `end_index` inclusive.
    ///
    /// Returns `(start_index, handles)`; the vec is empty when nothing in
    /// the queue is covered. Asking past the end of the queue is a safety
    /// violation.
    pub fn pop_until(&self, end_index: u64) -> Result<(u64, Vec<Option<Done>>)> {
        let mut inner = self.inner.lock();
        let first = inner.first_index;
        if inner.queue.is_empty() || end_index < first {
            return Ok((first, Vec::new()));
        }
        if end_index > first + inner.queue.len() as u64 - 1 {
            return Err(RaftError::Violation(format!(
                "closure queue out of range, end_index={}, first_index={}, size={}",
                end_index,
                first,
                inner.queue.len()
            )));
        }
        let count = (end_index - first + 1) as usize;
        let handles = inner.queue.drain(..count).collect();
        inner.first_index = end_index + 1;
        Ok((first, handles))
    }
}

/// Tracks quorum acknowledgements and drives the commit index.
pub struct BallotBox {
    waiter: Arc<dyn CommitWaiter>,
    closure_queue: Arc<ClosureQueue>,
    last_committed: AtomicU64,
    inner: Mutex<BallotBoxInner>,
}

#[derive(Default)]
struct BallotBoxInner {
    /// Index of the first pending ballot; `0` when inactive (follower).
    pending_index: u64,
    /// `pending_queue[k]` tallies index `pending_index + k`.
    pending_queue: VecDeque<Ballot>,
}

impl BallotBox {
    pub fn new(waiter: Arc<dyn CommitWaiter>, closure_queue: Arc<ClosureQueue>) -> Self {
        Self {
            waiter,
            closure_queue,
            last_committed: AtomicU64::new(0),
            inner: Mutex::new(BallotBoxInner::default()),
        }
    }

    /// Lock-free read of the highest committed index.
    pub fn last_committed_index(&self) -> u64 {
        self.last_committed.load(Ordering::Acquire)
    }

    /// Called by a fresh leader once its term anchor is chosen. Requires an
    /// inactive box and `new_pending_index` past everything committed.
    pub fn reset_pending_index(&self, new_pending_index: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.pending_index != 0 || !inner.pending_queue.is_empty() {
            tracing::error!(
                pending_index = inner.pending_index,
                queued = inner.pending_queue.len(),
                "reset_pending_index on an active ballot box"
            );
            return false;
        }
        if new_pending_index <= self.last_committed.load(Ordering::Acquire) {
            tracing::error!(
                new_pending_index,
                last_committed = self.last_committed.load(Ordering::Acquire),
                "reset_pending_index behind the commit index"
            );
            return false;
        }
        inner.pending_index = new_pending_index;
        self.closure_queue.reset_first_index(new_pending_index);
        true
    }

    /// Allocate a ballot for the next pending slot and register the
    /// caller's completion handle. Returns false when the box is inactive.
    pub fn append_pending_task(
        &self,
        conf: &Configuration,
        old_conf: Option<&Configuration>,
        done: Option<Done>,
    ) -> bool {
        if conf.is_empty() {
            tracing::error!("refusing ballot for an empty configuration");
            return false;
        }
        let ballot = Ballot::new(conf, old_conf);
        let mut inner = self.inner.lock();
        if inner.pending_index == 0 {
            tracing::error!("append_pending_task on an inactive ballot box");
            return false;
        }
        inner.pending_queue.push_back(ballot);
        self.closure_queue.append(done);
        true
    }

    /// `peer` acknowledges log range `[first, last]` as stable on disk.
    ///
    /// Grants every covered ballot and, if any became fully granted,
    /// advances the commit index in one critical section and notifies the
    /// waiter after unlocking. A range beyond the pending queue is a
    /// safety violation.
    ///
    /// The commit index may jump across several indices at once: removing
    /// a peer from an even-sized group shrinks the quorum, which can
    /// retroactively commit earlier entries.
    pub fn commit_at(&self, first: u64, last: u64, peer: &PeerId) -> Result<()> {
        let committed = {
            let mut inner = self.inner.lock();
            let pending = inner.pending_index;
            if pending == 0 {
                return Ok(());
            }
            if last < pending {
                return Ok(());
            }
            if last >= pending + inner.pending_queue.len() as u64 {
                return Err(RaftError::Violation(format!(
                    "commit_at out of range, last={}, pending_index={}, queued={}",
                    last,
                    pending,
                    inner.pending_queue.len()
                )));
            }

            let mut committed = 0u64;
            let mut hint = PosHint::default();
            for index in first.max(pending)..=last {
                let ballot = &mut inner.pending_queue[(index - pending) as usize];
                hint = ballot.grant_with_hint(peer, hint);
                if ballot.is_granted() {
                    committed = index;
                }
            }
            if committed == 0 {
                return Ok(());
            }
            let drained = (committed - pending + 1) as usize;
            inner.pending_queue.drain(..drained);
            inner.pending_index = committed + 1;
            self.last_committed.store(committed, Ordering::Release);
            tracing::debug!(from = pending, to = committed, "commit index advanced");
            committed
        };
        self.waiter.on_committed(committed);
        Ok(())
    }

    /// Follower path: adopt the committed index received from the leader.
    /// Only moves forward, and only while no ballots are pending.
    pub fn set_last_committed_index(&self, index: u64) -> bool {
        let notify = {
            let inner = self.inner.lock();
            if inner.pending_index != 0 || !inner.pending_queue.is_empty() {
                if index >= inner.pending_index {
                    tracing::error!(
                        index,
                        pending_index = inner.pending_index,
                        "set_last_committed_index on a leader ballot box"
                    );
                }
                return false;
            }
            let current = self.last_committed.load(Ordering::Acquire);
            if index <= current {
                return index == current;
            }
            self.last_committed.store(index, Ordering::Release);
            true
        };
        if notify {
            self.waiter.on_committed(index);
        }
        true
    }

    /// Step-down path: wipe pending state. The returned handles belong to
    /// the caller, who completes them with a not-leader status.
    pub fn clear_pending_tasks(&self) -> Vec<Option<Done>> {
        {
            let mut inner = self.inner.lock();
            inner.pending_queue.clear();
            inner.pending_index = 0;
        }
        self.closure_queue.clear()
    }

    #[cfg(test)]
    pub(crate) fn pending_index(&self) -> u64 {
        self.inner.lock().pending_index
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.lock().pending_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestAtomic;

    #[derive(Default)]
    struct RecordingWaiter {
        last: TestAtomic,
        calls: TestAtomic,
    }

    impl CommitWaiter for RecordingWaiter {
        fn on_committed(&self, index: u64) {
            self.last.store(index, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn peer(port: u16) -> PeerId {
        PeerId::new("127.0.0.1", port)
    }

    fn three_peer_conf() -> Configuration {
        Configuration::new([peer(1), peer(2), peer(3)])
    }

    fn setup() -> (Arc<RecordingWaiter>, Arc<ClosureQueue>, BallotBox) {
        let waiter = Arc::new(RecordingWaiter::default());
        let queue = Arc::new(ClosureQueue::new());
        let bx = BallotBox::new(waiter.clone(), queue.clone());
        (waiter, queue, bx)
    }

    #[test]
    fn test_reset_preconditions() {
        let (_, _, bx) = setup();
        assert!(bx.reset_pending_index(1));
        // Already active.
        assert!(!bx.reset_pending_index(5));
    }

    #[test]
    fn test_commit_needs_quorum() {
        let (waiter, _, bx) = setup();
        let conf = three_peer_conf();
        assert!(bx.reset_pending_index(1));
        for _ in 0..3 {
            assert!(bx.append_pending_task(&conf, None, None));
        }

        bx.commit_at(1, 3, &peer(1)).unwrap();
        assert_eq!(bx.last_committed_index(), 0);

        bx.commit_at(1, 3, &peer(2)).unwrap();
        assert_eq!(bx.last_committed_index(), 3);
        assert_eq!(waiter.last.load(Ordering::SeqCst), 3);
        assert_eq!(bx.pending_index(), 4);
        assert_eq!(bx.pending_len(), 0);
    }

    #[test]
    fn test_partial_range_commit() {
        let (_, _, bx) = setup();
        let conf = three_peer_conf();
        bx.reset_pending_index(1);
        for _ in 0..5 {
            bx.append_pending_task(&conf, None, None);
        }
        bx.commit_at(1, 5, &peer(1)).unwrap();
        bx.commit_at(1, 2, &peer(2)).unwrap();
        assert_eq!(bx.last_committed_index(), 2);
        assert_eq!(bx.pending_index(), 3);
        assert_eq!(bx.pending_len(), 3);
    }

    #[test]
    fn test_out_of_range_is_violation() {
        let (_, _, bx) = setup();
        let conf = three_peer_conf();
        bx.reset_pending_index(1);
        bx.append_pending_task(&conf, None, None);
        let err = bx.commit_at(1, 9, &peer(1)).unwrap_err();
        assert!(matches!(err, RaftError::Violation(_)));
    }

    #[test]
    fn test_inactive_box_ignores_acks() {
        let (waiter, _, bx) = setup();
        bx.commit_at(1, 3, &peer(1)).unwrap();
        assert_eq!(waiter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_follower_commit_path() {
        let (waiter, _, bx) = setup();
        assert!(bx.set_last_committed_index(7));
        assert_eq!(bx.last_committed_index(), 7);
        assert_eq!(waiter.last.load(Ordering::SeqCst), 7);

        // Regression is refused, repeat is a no-op.
        assert!(!bx.set_last_committed_index(5));
        assert!(bx.set_last_committed_index(7));
        assert_eq!(waiter.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_pending_tasks_returns_closures() {
        let (_, _, bx) = setup();
        let conf = three_peer_conf();
        bx.reset_pending_index(1);
        let fired = Arc::new(TestAtomic::new(0));
        for _ in 0..2 {
            let fired = fired.clone();
            bx.append_pending_task(
                &conf,
                None,
                Some(Box::new(move |_status| {
                    fired.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        let closures = bx.clear_pending_tasks();
        assert_eq!(closures.len(), 2);
        assert_eq!(bx.pending_index(), 0);
        for done in closures.into_iter().flatten() {
            done(Err(RaftError::NotLeader { leader: None }));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_joint_commit_requires_both_sets() {
        let (_, _, bx) = setup();
        let cur = Configuration::new([peer(3), peer(4), peer(5)]);
        let old = three_peer_conf();
        bx.reset_pending_index(1);
        bx.append_pending_task(&cur, Some(&old), None);

        bx.commit_at(1, 1, &peer(4)).unwrap();
        bx.commit_at(1, 1, &peer(5)).unwrap();
        // New-set quorum alone is not enough.
        assert_eq!(bx.last_committed_index(), 0);

        bx.commit_at(1, 1, &peer(1)).unwrap();
        bx.commit_at(1, 1, &peer(2)).unwrap();
        assert_eq!(bx.last_committed_index(), 1);
    }

    #[test]
    fn test_closure_queue_pop_until() {
        let queue = ClosureQueue::new();
        queue.reset_first_index(10);
        for _ in 0..4 {
            queue.append(None);
        }
        let (start, handles) = queue.pop_until(11).unwrap();
        assert_eq!(start, 10);
        assert_eq!(handles.len(), 2);

        // Below the window: nothing to pop.
        let (_, handles) = queue.pop_until(5).unwrap();
        assert!(handles.is_empty());

        // Past the window: violation.
        assert!(queue.pop_until(100).is_err());
    }
}
