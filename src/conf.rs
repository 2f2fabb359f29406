//! Group membership: configurations and their in-memory history.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

use crate::types::{LogEntry, LogId, PeerId};

/// An unordered set of voters plus an unordered set of learners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    peers: BTreeSet<PeerId>,
    learners: BTreeSet<PeerId>,
}

impl Configuration {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
            learners: BTreeSet::new(),
        }
    }

    pub fn with_learners(
        peers: impl IntoIterator<Item = PeerId>,
        learners: impl IntoIterator<Item = PeerId>,
    ) -> Self {
        Self {
            peers: peers.into_iter().collect(),
            learners: learners.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn contains_learner(&self, peer: &PeerId) -> bool {
        self.learners.contains(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn learners(&self) -> impl Iterator<Item = &PeerId> {
        self.learners.iter()
    }

    pub fn peer_vec(&self) -> Vec<PeerId> {
        self.peers.iter().cloned().collect()
    }

    pub fn learner_vec(&self) -> Vec<PeerId> {
        self.learners.iter().cloned().collect()
    }

    pub fn voter_count(&self) -> usize {
        self.peers.len()
    }

    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn add_learner(&mut self, learner: PeerId) -> bool {
        self.learners.insert(learner)
    }

    pub fn remove_learner(&mut self, learner: &PeerId) -> bool {
        self.learners.remove(learner)
    }

    pub fn set_learners(&mut self, learners: impl IntoIterator<Item = PeerId>) {
        self.learners = learners.into_iter().collect();
    }

    /// A voter may not simultaneously be a learner.
    pub fn is_valid(&self) -> bool {
        self.peers.is_disjoint(&self.learners)
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peers: Vec<String> = self.peers.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", peers.join(","))?;
        if !self.learners.is_empty() {
            let learners: Vec<String> = self.learners.iter().map(|p| p.to_string()).collect();
            write!(f, "/{}", learners.join(","))?;
        }
        Ok(())
    }
}

/// A configuration as observed in the log, possibly joint.
///
/// While `old_conf` is present the group is in joint state: quorum checks
/// must pass in both voter sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfEntry {
    pub id: LogId,
    pub conf: Configuration,
    pub old_conf: Option<Configuration>,
}

impl ConfEntry {
    pub fn new(id: LogId, conf: Configuration, old_conf: Option<Configuration>) -> Self {
        Self { id, conf, old_conf }
    }

    pub fn stable(conf: Configuration) -> Self {
        Self {
            id: LogId::default(),
            conf,
            old_conf: None,
        }
    }

    pub fn is_stable(&self) -> bool {
        self.old_conf.is_none()
    }

    /// Voter in either the current or the old set.
    pub fn contains_voter(&self, peer: &PeerId) -> bool {
        self.conf.contains(peer)
            || self
                .old_conf
                .as_ref()
                .map(|c| c.contains(peer))
                .unwrap_or(false)
    }

    /// All voters across both sets, deduplicated.
    pub fn all_voters(&self) -> Vec<PeerId> {
        let mut out: BTreeSet<PeerId> = self.conf.peers().cloned().collect();
        if let Some(old) = &self.old_conf {
            out.extend(old.peers().cloned());
        }
        out.into_iter().collect()
    }

    /// Build the log entry that replicates this configuration.
    pub fn to_entry(&self, id: LogId) -> LogEntry {
        let mut entry = LogEntry::no_op(id);
        entry.entry_type = crate::types::EntryType::Configuration;
        entry.peers = Some(self.conf.peer_vec());
        entry.learners = Some(self.conf.learner_vec());
        if let Some(old) = &self.old_conf {
            entry.old_peers = Some(old.peer_vec());
            entry.old_learners = Some(old.learner_vec());
        }
        entry.checksum = Some(entry.compute_checksum());
        entry
    }

    /// Recover a configuration from a replicated entry; `None` when the
    /// entry is not a configuration entry.
    pub fn from_entry(entry: &LogEntry) -> Option<Self> {
        if !entry.is_configuration() {
            return None;
        }
        let conf = Configuration::with_learners(
            entry.peers.clone().unwrap_or_default(),
            entry.learners.clone().unwrap_or_default(),
        );
        let old_conf = entry.old_peers.as_ref().map(|old| {
            Configuration::with_learners(
                old.clone(),
                entry.old_learners.clone().unwrap_or_default(),
            )
        });
        Some(Self {
            id: entry.id,
            conf,
            old_conf,
        })
    }
}

/// In-memory history of configuration changes observed in the log.
///
/// The log store replays its configuration column family into this manager
/// on open; the node consults it to answer "what was the membership at
/// index i" (snapshot metadata, recovery).
#[derive(Default)]
pub struct ConfigurationManager {
    inner: Mutex<VecDeque<ConfEntry>>,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a configuration entry. Entries must arrive in index order;
    /// a stale index is rejected.
    pub fn add(&self, entry: ConfEntry) -> bool {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.back() {
            if last.id.index >= entry.id.index {
                tracing::error!(
                    last = %last.id,
                    new = %entry.id,
                    "configuration index regressed, entry dropped"
                );
                return false;
            }
        }
        inner.push_back(entry);
        true
    }

    /// Latest configuration with `id.index <= index`.
    pub fn get(&self, index: u64) -> Option<ConfEntry> {
        let inner = self.inner.lock();
        inner
            .iter()
            .rev()
            .find(|e| e.id.index <= index)
            .cloned()
    }

    /// Most recent configuration, if any was observed.
    pub fn last_configuration(&self) -> Option<ConfEntry> {
        self.inner.lock().back().cloned()
    }

    /// Drop history below `first_index_kept` (after a snapshot), keeping
    /// the newest entry at or below the boundary as the baseline.
    pub fn truncate_prefix(&self, first_index_kept: u64) {
        let mut inner = self.inner.lock();
        while inner.len() > 1 {
            let drop_front = match (inner.front(), inner.get(1)) {
                (Some(_front), Some(second)) => second.id.index < first_index_kept,
                _ => false,
            };
            if drop_front {
                inner.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drop history above `last_index_kept` (log conflict resolution).
    pub fn truncate_suffix(&self, last_index_kept: u64) {
        let mut inner = self.inner.lock();
        while inner
            .back()
            .map(|e| e.id.index > last_index_kept)
            .unwrap_or(false)
        {
            inner.pop_back();
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
