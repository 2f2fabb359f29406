//! Core Raft types: log identifiers, peers, entries, tasks.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Status;

/// Identifier of a log entry: `(index, term)`.
///
/// Ordering is lexicographic over `(index, term)`. `(0, 0)` denotes "none".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogId {
    pub index: u64,
    pub term: u64,
}

impl LogId {
    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.index, self.term)
    }
}

/// A participant of the replication group.
///
/// `idx` disambiguates multiple peer roles hosted on one endpoint; two peers
/// are equal iff all four fields match. `priority` below zero means the
/// election priority feature is disabled for this peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId {
    pub host: String,
    pub port: u16,
    pub priority: i32,
    pub idx: u32,
}

impl PeerId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority: -1,
            idx: 0,
        }
    }

    pub fn with_idx(host: impl Into<String>, port: u16, idx: u32) -> Self {
        Self {
            host: host.into(),
            port,
            priority: -1,
            idx,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.idx == 0 {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}:{}", self.host, self.port, self.idx)
        }
    }
}

/// Network address a peer is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Term anchor appended by a new leader; carries no user data.
    NoOp,
    /// User command, opaque to the core.
    Data,
    /// Membership change; also persisted to the configuration sub-stream.
    Configuration,
}

/// A replicated log entry.
///
/// The peer vectors are only populated for `Configuration` entries; a joint
/// entry additionally carries the old voter/learner sets. If `checksum` is
/// present, the codec verifies it on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,
    pub entry_type: EntryType,
    pub data: Bytes,
    pub peers: Option<Vec<PeerId>>,
    pub learners: Option<Vec<PeerId>>,
    pub old_peers: Option<Vec<PeerId>>,
    pub old_learners: Option<Vec<PeerId>>,
    pub checksum: Option<u64>,
}

impl LogEntry {
    pub fn no_op(id: LogId) -> Self {
        Self {
            id,
            entry_type: EntryType::NoOp,
            data: Bytes::new(),
            peers: None,
            learners: None,
            old_peers: None,
            old_learners: None,
            checksum: None,
        }
    }

    pub fn data(id: LogId, data: Bytes) -> Self {
        let mut entry = Self {
            id,
            entry_type: EntryType::Data,
            data,
            peers: None,
            learners: None,
            old_peers: None,
            old_learners: None,
            checksum: None,
        };
        entry.checksum = Some(entry.compute_checksum());
        entry
    }

    pub fn is_configuration(&self) -> bool {
        self.entry_type == EntryType::Configuration
    }

    /// Checksum over every field except the checksum itself.
    pub fn compute_checksum(&self) -> u64 {
        let mut crc = 0u32;
        crc = crc32c::crc32c_append(crc, &self.id.index.to_be_bytes());
        crc = crc32c::crc32c_append(crc, &self.id.term.to_be_bytes());
        crc = crc32c::crc32c_append(crc, &[self.entry_type as u8]);
        crc = crc32c::crc32c_append(crc, &self.data);
        for peers in [
            &self.peers,
            &self.learners,
            &self.old_peers,
            &self.old_learners,
        ]
        .into_iter()
        .flatten()
        {
            for p in peers {
                crc = crc32c::crc32c_append(crc, p.to_string().as_bytes());
            }
        }
        crc as u64
    }

    /// True when no checksum is carried or the carried one matches.
    pub fn is_checksum_valid(&self) -> bool {
        match self.checksum {
            None => true,
            Some(sum) => sum == self.compute_checksum(),
        }
    }
}

/// Completion handle attached to a proposed command.
///
/// Registered in a FIFO queue on the leader; the applier drives it with the
/// typed outcome once the command commits and applies (or fails).
pub type Done = Box<dyn FnOnce(Status) + Send + 'static>;

/// A command submitted through [`Node::apply`](crate::node::Node::apply).
pub struct Task {
    pub data: Bytes,
    pub done: Option<Done>,
}

impl Task {
    pub fn new(data: Bytes) -> Self {
        Self { data, done: None }
    }

    pub fn with_done(data: Bytes, done: Done) -> Self {
        Self {
            data,
            done: Some(done),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("data_len", &self.data.len())
            .field("has_done", &self.done.is_some())
            .finish()
    }
}

/// A committed user entry returned by `read_committed_user_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct UserLog {
    pub index: u64,
    pub data: Bytes,
}

/// Snapshot descriptor: which prefix of the log the image covers and the
/// membership at that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub peers: Vec<PeerId>,
    pub learners: Vec<PeerId>,
}

/// Role of a node within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Candidate,
    Follower,
    /// Receives the log but neither votes nor counts toward quorums.
    Learner,
    /// Terminal state after a safety violation or apply failure.
    Error,
    Shutdown,
}

impl Role {
    /// Whether the node still participates in the protocol.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Role::Leader | Role::Candidate | Role::Follower | Role::Learner
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Leader => "LEADER",
            Role::Candidate => "CANDIDATE",
            Role::Follower => "FOLLOWER",
            Role::Learner => "LEARNER",
            Role::Error => "ERROR",
            Role::Shutdown => "SHUTDOWN",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_ordering() {
        assert!(LogId::new(2, 1) > LogId::new(1, 9));
        assert!(LogId::new(5, 3) > LogId::new(5, 2));
        assert_eq!(LogId::default(), LogId::new(0, 0));
    }

    #[test]
    fn test_peer_id_equality_over_all_fields() {
        let a = PeerId::new("10.0.0.1", 7001);
        let b = PeerId::with_idx("10.0.0.1", 7001, 1);
        assert_ne!(a, b);
        assert_eq!(a, PeerId::new("10.0.0.1", 7001));
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId::new("h", 80).to_string(), "h:80");
        assert_eq!(PeerId::with_idx("h", 80, 2).to_string(), "h:80:2");
    }

    #[test]
    fn test_entry_checksum() {
        let entry = LogEntry::data(LogId::new(3, 1), Bytes::from("put k v"));
        assert!(entry.is_checksum_valid());

        let mut tampered = entry.clone();
        tampered.data = Bytes::from("put k w");
        assert!(!tampered.is_checksum_valid());

        // Entries without a checksum always validate.
        let noop = LogEntry::no_op(LogId::new(1, 1));
        assert!(noop.is_checksum_valid());
    }
}
