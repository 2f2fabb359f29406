//! Raft error taxonomy.
//!
//! Every failure inside the core is a `RaftError` carrying enough context to
//! act on: redirect hints for stale-leader errors, indices for log-range
//! errors. Across RPC boundaries errors travel as an `ErrorResponse`
//! envelope, so each variant maps to a stable numeric code.

use thiserror::Error;

use crate::types::PeerId;

/// Raft errors.
///
/// Variants are `Clone` on purpose: a single failure frequently has to
/// complete a whole batch of pending waiters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RaftError {
    /// Not the leader; carries a redirect hint when the leader is known.
    #[error("not leader, current leader is {leader:?}")]
    NotLeader { leader: Option<PeerId> },

    /// Request ring is full; fail-fast to the caller.
    #[error("node is busy: {0}")]
    Busy(String),

    /// RPC deadline expired.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Request from an older term.
    #[error("stale request, local term {local} > request term {remote}")]
    Stale { local: u64, remote: u64 },

    /// Follower is missing entries the leader no longer has.
    #[error("log gap at index {requested}, first available is {first}")]
    LogGap { requested: u64, first: u64 },

    /// Underlying storage engine failure.
    #[error("log storage failure: {0}")]
    Storage(String),

    /// Entry bytes could not be decoded, or a checksum mismatched.
    #[error("log entry codec failure: {0}")]
    Codec(String),

    /// An internal safety invariant was breached. Unrecoverable: the node
    /// transitions to error state and refuses applies and reads.
    #[error("safety violation: {0}")]
    Violation(String),

    /// Operation canceled before completion.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Component has been shut down.
    #[error("service stopped")]
    Stopped,

    /// Node is going down; pending read-only requests are failed with this.
    #[error("host is down")]
    HostDown,

    /// The log at the given index was compacted away.
    #[error("log at index {0} has been deleted")]
    LogDeleted(u64),

    /// No user-proposed entry exists between the given index and the
    /// applied index.
    #[error("no user log past index {0}")]
    NoMoreUserLog(u64),

    /// Rejected membership change.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport-level failure (connection refused, peer unknown).
    #[error("transport failure: {0}")]
    Transport(String),

    /// Catch-all for bugs.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Stable wire code for the `ErrorResponse` envelope. `0` means success
    /// and is never produced here.
    pub fn code(&self) -> u32 {
        match self {
            RaftError::NotLeader { .. } => 1001,
            RaftError::Busy(_) => 1002,
            RaftError::Timeout(_) => 1003,
            RaftError::Stale { .. } => 1004,
            RaftError::LogGap { .. } => 1005,
            RaftError::Storage(_) => 1006,
            RaftError::Codec(_) => 1007,
            RaftError::Violation(_) => 1008,
            RaftError::Canceled(_) => 1009,
            RaftError::Stopped => 1010,
            RaftError::HostDown => 1011,
            RaftError::LogDeleted(_) => 1012,
            RaftError::NoMoreUserLog(_) => 1013,
            RaftError::InvalidConfig(_) => 1014,
            RaftError::Transport(_) => 1015,
            RaftError::Internal(_) => 1100,
        }
    }

    /// Rebuild an error from its wire envelope. Unknown codes collapse to
    /// `Internal`; the message is preserved either way.
    pub fn from_code(code: u32, msg: String) -> RaftError {
        match code {
            1001 => RaftError::NotLeader { leader: None },
            1002 => RaftError::Busy(msg),
            1003 => RaftError::Timeout(0),
            1004 => RaftError::Stale { local: 0, remote: 0 },
            1005 => RaftError::LogGap { requested: 0, first: 0 },
            1006 => RaftError::Storage(msg),
            1007 => RaftError::Codec(msg),
            1008 => RaftError::Violation(msg),
            1009 => RaftError::Canceled(msg),
            1010 => RaftError::Stopped,
            1011 => RaftError::HostDown,
            1012 => RaftError::LogDeleted(0),
            1013 => RaftError::NoMoreUserLog(0),
            1014 => RaftError::InvalidConfig(msg),
            1015 => RaftError::Transport(msg),
            _ => RaftError::Internal(msg),
        }
    }
}

/// Core result type.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Outcome delivered to completion handles.
pub type Status = Result<()>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let err = RaftError::Busy("too many read-only requests".to_string());
        let back = RaftError::from_code(err.code(), err.to_string());
        assert_eq!(back.code(), err.code());
    }

    #[test]
    fn test_unknown_code_is_internal() {
        let err = RaftError::from_code(4242, "who knows".to_string());
        assert!(matches!(err, RaftError::Internal(_)));
    }
}
