//! Node configuration: timeouts, batching, storage tuning.

use std::time::Duration;

use crate::conf::Configuration;
use crate::error::{RaftError, Result};

/// Tuning for the RocksDB-backed log store.
///
/// Every field follows the same convention: `0` means "use the built-in
/// default". The defaults are sized for a log store whose entries are
/// written once, read sequentially, and deleted in large ranges.
#[derive(Debug, Clone, Default)]
pub struct LogStoreTuning {
    pub db_max_total_wal_size: u64,
    pub db_max_subcompactions: u32,
    pub db_recycle_log_file_num: usize,
    pub db_keep_log_file_num: usize,
    pub db_write_buffer_size: usize,
    pub db_max_background_jobs: i32,
    pub db_max_background_compactions: i32,
    pub db_max_background_flushes: i32,
    pub db_max_manifest_file_size: usize,
    pub cf_block_size: usize,
    pub cf_block_cache_size: usize,
    pub cf_arena_block_size: usize,
    pub cf_min_write_buffer_number_to_merge: i32,
    pub cf_max_write_buffer_number: i32,
    pub cf_max_compaction_bytes: u64,
    pub cf_write_buffer_size: usize,
}

impl LogStoreTuning {
    pub fn db_max_total_wal_size_or_default(&self) -> u64 {
        pick(self.db_max_total_wal_size, 4 << 30)
    }

    pub fn db_max_subcompactions_or_default(&self) -> u32 {
        pick(self.db_max_subcompactions, 4)
    }

    pub fn db_recycle_log_file_num_or_default(&self) -> usize {
        pick(self.db_recycle_log_file_num, 4)
    }

    pub fn db_keep_log_file_num_or_default(&self) -> usize {
        pick(self.db_keep_log_file_num, 4)
    }

    pub fn db_write_buffer_size_or_default(&self) -> usize {
        pick(self.db_write_buffer_size, 1 << 30)
    }

    pub fn db_max_background_jobs_or_default(&self) -> i32 {
        pick(self.db_max_background_jobs, 16)
    }

    pub fn db_max_background_compactions_or_default(&self) -> i32 {
        pick(self.db_max_background_compactions, 8)
    }

    pub fn db_max_background_flushes_or_default(&self) -> i32 {
        pick(self.db_max_background_flushes, 8)
    }

    pub fn db_max_manifest_file_size_or_default(&self) -> usize {
        pick(self.db_max_manifest_file_size, 256 * 1024 * 1024)
    }

    pub fn cf_block_size_or_default(&self) -> usize {
        pick(self.cf_block_size, 128 * 1024)
    }

    pub fn cf_block_cache_size_or_default(&self) -> usize {
        pick(self.cf_block_cache_size, 512 * 1024 * 1024)
    }

    pub fn cf_arena_block_size_or_default(&self) -> usize {
        pick(self.cf_arena_block_size, 128 * 1024 * 1024)
    }

    pub fn cf_min_write_buffer_number_to_merge_or_default(&self) -> i32 {
        pick(self.cf_min_write_buffer_number_to_merge, 4)
    }

    pub fn cf_max_write_buffer_number_or_default(&self) -> i32 {
        pick(self.cf_max_write_buffer_number, 5)
    }

    pub fn cf_max_compaction_bytes_or_default(&self) -> u64 {
        pick(self.cf_max_compaction_bytes, 512 * 1024 * 1024)
    }

    pub fn cf_write_buffer_size_or_default(&self) -> usize {
        pick(self.cf_write_buffer_size, 256 * 1024 * 1024)
    }
}

fn pick<T: PartialEq + From<u8>>(value: T, default: T) -> T {
    if value == T::from(0u8) {
        default
    } else {
        value
    }
}

/// Options for a single Raft node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Follower-to-candidate trigger, and the cap on a ReadIndex heartbeat
    /// round. The actual election deadline is randomized within
    /// `[election_timeout_ms, 2 * election_timeout_ms)`.
    pub election_timeout_ms: u64,

    /// Extra randomized delay bound for elections, also the period of the
    /// read-only pending-notify scanner.
    pub max_election_delay_ms: u64,

    /// Leader lease as a percentage of the election timeout. The leader
    /// considers itself deposed once it has not heard from a quorum within
    /// this window.
    pub leader_lease_time_ratio: u32,

    /// Serve reads from the lease window instead of a heartbeat round.
    pub lease_read: bool,

    /// Periodic snapshot trigger; `0` disables the timer.
    pub snapshot_interval_secs: u64,

    /// Number of applied entries to keep in the log behind the snapshot
    /// point when truncating.
    pub snapshot_log_index_margin: u64,

    /// Capacity of the apply and read-index rings.
    pub disruptor_buffer_size: usize,

    /// Batch size for the apply drainer and the read-index handler.
    pub apply_batch: usize,

    /// Fail a read immediately when the applied index lags the served
    /// commit index by more than this. `None` parks the read until the
    /// state machine catches up.
    pub max_read_index_lag: Option<u64>,

    /// Cap on entries per AppendEntries RPC.
    pub max_entries_per_append: usize,

    /// Synchronous WAL flush on log writes.
    pub sync: bool,

    /// Default RPC deadline.
    pub rpc_default_timeout_ms: u64,

    /// Deadline for connection probes (Ping).
    pub rpc_connect_timeout_ms: u64,

    /// Sizing hint for the transport's response dispatch pool.
    pub rpc_processor_thread_pool_size: usize,

    /// Membership used on first boot, when the log carries no
    /// configuration entry yet.
    pub initial_conf: Configuration,

    /// Log store tuning, `0` = built-in default per field.
    pub log_storage: LogStoreTuning,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            election_timeout_ms: 1000,
            max_election_delay_ms: 1000,
            leader_lease_time_ratio: 90,
            lease_read: false,
            snapshot_interval_secs: 3600,
            snapshot_log_index_margin: 0,
            disruptor_buffer_size: 16384,
            apply_batch: 32,
            max_read_index_lag: None,
            max_entries_per_append: 1024,
            sync: true,
            rpc_default_timeout_ms: 5000,
            rpc_connect_timeout_ms: 1000,
            rpc_processor_thread_pool_size: 80,
            initial_conf: Configuration::default(),
            log_storage: LogStoreTuning::default(),
        }
    }
}

impl NodeOptions {
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Randomized election deadline in `[timeout, timeout + delay)`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let extra = rand::thread_rng().gen_range(0..self.max_election_delay_ms.max(1));
        Duration::from_millis(self.election_timeout_ms + extra)
    }

    /// Idle interval after which a replicator sends a heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.election_timeout_ms / 2).max(10))
    }

    /// Window within which the leader must have heard from a quorum.
    pub fn leader_lease_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms * self.leader_lease_time_ratio as u64 / 100)
    }

    pub fn rpc_default_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_default_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "election_timeout_ms must be positive".to_string(),
            ));
        }
        if self.rpc_default_timeout_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "rpc_default_timeout_ms must be positive".to_string(),
            ));
        }
        if self.disruptor_buffer_size == 0 || !self.disruptor_buffer_size.is_power_of_two() {
            return Err(RaftError::InvalidConfig(
                "disruptor_buffer_size must be a positive power of two".to_string(),
            ));
        }
        if self.apply_batch == 0 || self.apply_batch > self.disruptor_buffer_size {
            return Err(RaftError::InvalidConfig(
                "apply_batch must be in (0, disruptor_buffer_size]".to_string(),
            ));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig(
                "max_entries_per_append must be positive".to_string(),
            ));
        }
        if self.leader_lease_time_ratio == 0 || self.leader_lease_time_ratio > 100 {
            return Err(RaftError::InvalidConfig(
                "leader_lease_time_ratio must be in (0, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_valid() {
        assert!(NodeOptions::default().validate().is_ok());
    }

    #[test]
    fn test_zero_knob_means_default() {
        let tuning = LogStoreTuning::default();
        assert_eq!(tuning.db_max_total_wal_size_or_default(), 4 << 30);
        assert_eq!(tuning.cf_block_size_or_default(), 128 * 1024);

        let tuning = LogStoreTuning {
            cf_block_size: 4096,
            ..Default::default()
        };
        assert_eq!(tuning.cf_block_size_or_default(), 4096);
    }

    #[test]
    fn test_invalid_buffer_size_rejected() {
        let opts = NodeOptions {
            disruptor_buffer_size: 1000,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let opts = NodeOptions::default();
        for _ in 0..50 {
            let t = opts.random_election_timeout();
            assert!(t >= opts.election_timeout());
            assert!(t < opts.election_timeout() * 2);
        }
    }
}
