//! kombu-raft: the replicated consensus core of the kombu key-value
//! platform.
//!
//! Orders client commands into a durable, totally-ordered log, replicates
//! it to a configurable peer set, commits entries once a quorum
//! acknowledges them, serves linearizable reads through the read-index
//! protocol, and supports live reconfiguration (joint consensus) and
//! learners.
//!
//! The moving parts, leaves first:
//! - [`storage`]: index-addressed durable log on RocksDB, with a separate
//!   column family for configuration entries
//! - [`ballot_box`]: per-entry quorum tallies driving the commit index
//! - [`fsm`]: serialized application of committed entries
//! - [`replicator`]: per-follower streaming of entries and heartbeats
//! - [`read_only`]: batched ReadIndex pipeline with a pending-notify cache
//! - [`node`]: election, role transitions, and the wiring of the above
//!
//! The query layer, placement driver and real network transport live
//! elsewhere; this crate only consumes the [`rpc::ClientService`]
//! contract.

pub mod ballot;
pub mod ballot_box;
pub mod codec;
pub mod conf;
pub mod config;
pub mod error;
pub mod fsm;
pub mod node;
pub mod read_only;
pub mod replicator;
pub mod rpc;
pub mod storage;
pub mod types;

pub use codec::{LogEntryCodec, V1Codec};
pub use conf::{ConfEntry, Configuration, ConfigurationManager};
pub use config::{LogStoreTuning, NodeOptions};
pub use error::{RaftError, Result, Status};
pub use fsm::{CommittedEntry, FsmCaller, StateMachine};
pub use node::Node;
pub use read_only::{ReadIndexDone, ReadOnlyService};
pub use rpc::{ChannelClientService, ClientService, RpcCall, RpcReceiver, RpcSender};
pub use storage::{LogStorage, RocksLogStorage};
pub use types::{
    Done, Endpoint, EntryType, LogEntry, LogId, PeerId, Role, SnapshotMeta, Task, UserLog,
};
