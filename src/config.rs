use std::time::Duration;

/// Eviction behavior for the in-memory hash table.
///
/// `Value` evicts value bytes while keeping metadata resident; `Full` may
/// remove whole entries, in which case a background fetch is needed to
/// re-establish residency before CAS-ful operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Value,
    Full,
}

/// Runtime configuration for a partition store.
///
/// All fields are fixed at construction except the shared memory counter,
/// which is atomic (see [`crate::vbucket::VBucket`]).
#[derive(Debug, Clone)]
pub struct EpkvConfig {
    /// Total memory budget shared by all partitions, in bytes.
    pub max_data_size: usize,
    /// Fraction of `max_data_size` above which client mutations are refused.
    pub mutation_mem_threshold: f64,
    /// Fraction of `max_data_size` above which replica/backfill writes are
    /// throttled.
    pub replication_throttle_threshold: f64,
    /// Size of the hash-table bucket-lock pool.
    pub ht_num_locks: usize,
    /// Initial hash-table bucket count (prime).
    pub ht_initial_size: usize,
    pub eviction_policy: EvictionPolicy,
    /// Maximum number of scopes accepted in a bucket manifest.
    pub max_scopes: usize,
    /// Maximum number of collections accepted in a bucket manifest.
    pub max_collections: usize,
    /// Lower bound of the adaptive high-priority flush timeout.
    pub min_flush_timeout: Duration,
    /// Upper bound of the adaptive high-priority flush timeout.
    pub max_flush_timeout: Duration,
    /// Items per checkpoint before a new one is opened.
    pub checkpoint_max_items: usize,
    /// Timeout applied to sync writes that arrive without one. Replicas
    /// never apply this default; the active must have resolved it.
    pub sync_write_default_timeout_ms: u64,
    /// Seconds a `get_locked` lock is held when the caller gives none.
    pub default_lock_timeout_secs: u32,
    /// HLC drift thresholds, microseconds.
    pub hlc_drift_ahead_threshold_us: u64,
    pub hlc_drift_behind_threshold_us: u64,
    /// Maximum failover-table entries retained.
    pub max_failover_entries: usize,
}

impl Default for EpkvConfig {
    fn default() -> Self {
        Self {
            max_data_size: 1024 * 1024 * 1024,
            mutation_mem_threshold: 0.93,
            replication_throttle_threshold: 0.90,
            ht_num_locks: 47,
            ht_initial_size: 3079,
            eviction_policy: EvictionPolicy::Value,
            max_scopes: 100,
            max_collections: 1000,
            min_flush_timeout: Duration::from_secs(10),
            max_flush_timeout: Duration::from_secs(30),
            checkpoint_max_items: 10_000,
            sync_write_default_timeout_ms: 30_000,
            default_lock_timeout_secs: 15,
            hlc_drift_ahead_threshold_us: 5_000_000,
            hlc_drift_behind_threshold_us: 5_000_000,
            max_failover_entries: 25,
        }
    }
}

impl EpkvConfig {
    /// Profile for full-eviction buckets: tighter admission headroom since
    /// residency is not guaranteed.
    pub fn full_eviction() -> Self {
        Self {
            eviction_policy: EvictionPolicy::Full,
            ..Self::default()
        }
    }

    pub fn mutation_mem_limit(&self) -> usize {
        (self.max_data_size as f64 * self.mutation_mem_threshold) as usize
    }

    pub fn replication_mem_limit(&self) -> usize {
        (self.max_data_size as f64 * self.replication_throttle_threshold) as usize
    }
}
