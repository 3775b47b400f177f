pub mod waiters;

use crate::bloom::BloomFilterHolder;
use crate::callbacks::{Cookie, SeqnoNotification, VBucketObserver};
use crate::checkpoint::{CheckpointManager, GenerateBySeqno};
use crate::collections::CollectionId;
use crate::collections::vbucket::{CollectionStats, VbManifest};
use crate::config::{EpkvConfig, EvictionPolicy};
use crate::conflict::{ConflictMeta, ConflictOutcome, ConflictResolver};
use crate::durability::{
    ActiveDurabilityMonitor, DurabilityMonitor, PassiveDurabilityMonitor, ReplicationTopology,
    Requirements, Resolution, ResolutionAction, SyncWriteTimeout,
};
use crate::error::{EpkvError, Status};
use crate::failover::FailoverTable;
use crate::hash_table::{BucketLock, HashTable, Perspective};
use crate::hlc::{Hlc, WallClock};
use crate::item::{Datatype, DeleteSource, DocKey, Item, ItemOperation, Vbid};
use crate::stored_value::TempKind;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};
use waiters::{HighPriorityWaiters, WaiterKind};

/// Partition lifecycle state. Only `Active` accepts client writes and runs
/// an active durability monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl VBucketState {
    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }
}

/// Metadata travelling with replicated mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemMeta {
    pub cas: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiry: u32,
}

/// Result of a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResult {
    pub cas: u64,
    pub seqno: u64,
    /// True when the write is a prepare still awaiting durability; the
    /// client cookie is notified on completion.
    pub durability_pending: bool,
}

/// A value returned by the read paths.
#[derive(Debug, Clone)]
pub struct GetValue {
    pub value: Option<Arc<Vec<u8>>>,
    pub datatype: Datatype,
    pub meta: ItemMeta,
    pub by_seqno: u64,
    pub deleted: bool,
}

/// Options for the client write paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// 0 means "any version".
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub datatype: Datatype,
    pub durability: Option<Requirements>,
    pub cookie: Option<Cookie>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Set,
    Add,
    Replace,
    Delete,
}

/// What `queue_dirty` produced, plus any immediately possible durability
/// resolutions.
struct QueueOutcome {
    seqno: u64,
    item_count_delta: i64,
    notify_flusher: bool,
    resolutions: Vec<Resolution>,
}

/// Classification of the committed value at a key, computed without
/// holding borrows into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueClass {
    Miss,
    TempInit,
    TempNonExistent,
    TempDeleted,
    Deleted,
    Expired,
    NotResident,
    Live,
}

/// The per-partition coordinator: owns the hash table, checkpoint manager,
/// durability monitor, collections manifest, failover table and HLC, and
/// orchestrates every operation against them.
pub struct VBucket {
    id: Vbid,
    state: RwLock<VBucketState>,
    config: Arc<EpkvConfig>,
    clock: Arc<dyn WallClock>,
    observer: Arc<dyn VBucketObserver>,
    ht: HashTable,
    checkpoint: CheckpointManager,
    /// Held only across the `queue_dirty` + `add_sync_write` pair so both
    /// observe the same seqno order.
    durability_queue: Mutex<()>,
    dm: Mutex<DurabilityMonitor>,
    manifest: VbManifest,
    bloom: BloomFilterHolder,
    failover: Mutex<FailoverTable>,
    hlc: Hlc,
    conflict_resolver: ConflictResolver,
    waiters: HighPriorityWaiters,
    pending_ops: Mutex<Vec<Cookie>>,
    /// Global memory budget shared across partitions.
    mem_used: Arc<AtomicI64>,
    mem_recorded: AtomicI64,
    persistence_seqno: AtomicU64,
    purge_seqno: AtomicU64,
    rollback_item_count: AtomicU64,
    conflict_resolver_rejects: AtomicU64,
    conflict_resolver_accepts: AtomicU64,
    receiving_initial_snapshot: AtomicBool,
    deferred_deletion: AtomicBool,
    ops_create: AtomicU64,
    ops_update: AtomicU64,
    ops_delete: AtomicU64,
}

impl VBucket {
    pub fn new(
        id: Vbid,
        initial_state: VBucketState,
        config: Arc<EpkvConfig>,
        clock: Arc<dyn WallClock>,
        observer: Arc<dyn VBucketObserver>,
        mem_used: Arc<AtomicI64>,
    ) -> Self {
        let dm = match initial_state {
            VBucketState::Active => DurabilityMonitor::Active(ActiveDurabilityMonitor::new(id)),
            _ => DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(id)),
        };
        Self {
            id,
            state: RwLock::new(initial_state),
            ht: HashTable::new(config.ht_num_locks, config.eviction_policy),
            checkpoint: CheckpointManager::new(id, config.checkpoint_max_items),
            durability_queue: Mutex::new(()),
            dm: Mutex::new(dm),
            manifest: VbManifest::default(),
            bloom: BloomFilterHolder::default(),
            failover: Mutex::new(FailoverTable::new(config.max_failover_entries)),
            hlc: Hlc::new(
                0,
                0,
                config.hlc_drift_ahead_threshold_us,
                config.hlc_drift_behind_threshold_us,
            ),
            conflict_resolver: ConflictResolver::default(),
            waiters: HighPriorityWaiters::new(config.min_flush_timeout, config.max_flush_timeout),
            pending_ops: Mutex::new(Vec::new()),
            mem_used,
            mem_recorded: AtomicI64::new(0),
            persistence_seqno: AtomicU64::new(0),
            purge_seqno: AtomicU64::new(0),
            rollback_item_count: AtomicU64::new(0),
            conflict_resolver_rejects: AtomicU64::new(0),
            conflict_resolver_accepts: AtomicU64::new(0),
            receiving_initial_snapshot: AtomicBool::new(false),
            deferred_deletion: AtomicBool::new(false),
            ops_create: AtomicU64::new(0),
            ops_update: AtomicU64::new(0),
            ops_delete: AtomicU64::new(0),
            config,
            clock,
            observer,
        }
    }

    pub fn id(&self) -> Vbid {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    pub fn high_seqno(&self) -> u64 {
        self.checkpoint.high_seqno()
    }

    pub fn persistence_seqno(&self) -> u64 {
        self.persistence_seqno.load(Ordering::Acquire)
    }

    pub fn failover_uuid(&self) -> u64 {
        self.failover.lock().current_uuid()
    }

    pub fn failover_table_json(&self) -> String {
        self.failover.lock().to_json()
    }

    /// Open a new history branch; promotion path.
    pub fn create_failover_entry(&self) {
        self.failover.lock().create_entry(self.high_seqno());
    }

    pub fn manifest(&self) -> &VbManifest {
        &self.manifest
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    pub fn bloom_filter(&self) -> &BloomFilterHolder {
        &self.bloom
    }

    pub fn hash_table(&self) -> &HashTable {
        &self.ht
    }

    pub fn set_conflict_resolver(&mut self, resolver: ConflictResolver) {
        self.conflict_resolver = resolver;
    }

    // ---- client write paths ----------------------------------------------

    pub fn set(
        &self,
        key: DocKey,
        value: Vec<u8>,
        opts: SetOptions,
    ) -> Result<MutationResult, Status> {
        self.store(key, Some(value), opts, WriteKind::Set)
    }

    /// Succeeds only when no live value exists at the key.
    pub fn add(
        &self,
        key: DocKey,
        value: Vec<u8>,
        opts: SetOptions,
    ) -> Result<MutationResult, Status> {
        self.store(key, Some(value), opts, WriteKind::Add)
    }

    /// Succeeds only when a live value exists at the key.
    pub fn replace(
        &self,
        key: DocKey,
        value: Vec<u8>,
        opts: SetOptions,
    ) -> Result<MutationResult, Status> {
        self.store(key, Some(value), opts, WriteKind::Replace)
    }

    /// Delete the key, producing a tombstone stamped with the deletion
    /// time. Honors sync-delete durability when supplied.
    pub fn delete_item(&self, key: DocKey, opts: SetOptions) -> Result<MutationResult, Status> {
        self.store(key, None, opts, WriteKind::Delete)
    }

    fn store(
        &self,
        key: DocKey,
        value: Option<Vec<u8>>,
        opts: SetOptions,
        kind: WriteKind,
    ) -> Result<MutationResult, Status> {
        let state = self.state.read();
        if *state != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let handle = self.manifest.caching_read_handle(key.collection);
        if !handle.valid() {
            return Err(Status::KeyEnoent);
        }
        let value_len = value.as_ref().map(Vec::len).unwrap_or(0);
        self.check_memory(key.len() + value_len, true)?;

        let now_us = self.clock.now_us();
        let now_secs = self.clock.now_secs();
        let expiry = match (kind, opts.expiry, handle.max_ttl()) {
            (WriteKind::Delete, _, _) => now_secs,
            (_, 0, Some(max_ttl)) => now_secs.saturating_add(max_ttl),
            (_, expiry, _) => expiry,
        };
        let mut item = Item {
            key: key.clone(),
            vbid: self.id,
            value: value.map(Arc::new),
            datatype: opts.datatype,
            flags: opts.flags,
            expiry,
            cas: self.hlc.next_cas(now_us),
            by_seqno: None,
            rev_seqno: 0,
            operation: match (kind, opts.durability.is_some()) {
                (_, true) => ItemOperation::Prepare,
                (WriteKind::Delete, false) => ItemOperation::Deletion,
                _ => ItemOperation::Mutation,
            },
            delete_source: DeleteSource::Explicit,
            durability: opts.durability,
            prepare_seqno: None,
        };
        // Let the host rewrite the body before anything becomes visible.
        self.observer.pre_link_document(&mut item);

        let outcome = {
            let mut lock = self.ht.lock_key(&key);
            let base_rev = self.validate_write(&mut lock, &key, opts.cas, kind, now_secs)?;
            item.rev_seqno = base_rev + 1;
            if item.is_deleted() {
                self.ht.update_max_deleted_rev_seqno(item.rev_seqno);
            }
            if lock.find_for_write(&key).is_some() {
                self.ops_update.fetch_add(1, Ordering::Relaxed);
            } else {
                self.ops_create.fetch_add(1, Ordering::Relaxed);
            }
            if kind == WriteKind::Delete {
                self.ops_delete.fetch_add(1, Ordering::Relaxed);
            }
            let outcome = self.queue_and_link(&mut lock, &mut item, opts.cookie)?;
            handle.update_high_seqno(outcome.seqno);
            outcome
        };
        self.sync_mem_accounting();
        self.notify_new_seqno(&outcome);
        let committed_inline = outcome
            .resolutions
            .iter()
            .any(|r| r.prepare_seqno == outcome.seqno);
        let seqno = outcome.seqno;
        self.enact_resolutions(outcome.resolutions);
        Ok(MutationResult {
            cas: item.cas,
            seqno,
            durability_pending: item.durability.is_some() && !committed_inline,
        })
    }

    /// Install the (already validated) item into the hash table and queue
    /// it, registering durable writes with the monitor under the shared
    /// durability-queue mutex so both observe the same seqno order.
    fn queue_and_link(
        &self,
        lock: &mut BucketLock<'_>,
        item: &mut Item,
        cookie: Option<Cookie>,
    ) -> Result<QueueOutcome, Status> {
        let (queued, resolutions) = if let Some(req) = item.durability {
            let _dq = self.durability_queue.lock();
            let mut dm = self.dm.lock();
            let Some(adm) = dm.as_active_mut() else {
                return Err(Status::NotMyVbucket);
            };
            // Nothing may be queued for an impossible requirement, so the
            // check sits inside the same critical section as the enqueue.
            let possible = adm
                .topology()
                .map(|t| t.durability_possible())
                .unwrap_or(false);
            if !possible {
                return Err(Status::DurabilityImpossible);
            }
            let queued = self
                .checkpoint
                .queue_dirty(item, GenerateBySeqno::Yes)
                .map_err(|e| self.invariant_to_status(e))?;
            let timeout = req.timeout.unwrap_or(SyncWriteTimeout::Ms(
                self.config.sync_write_default_timeout_ms,
            ));
            let deadline = timeout.deadline_from(Instant::now());
            let resolutions = adm
                .add_sync_write(item.key.clone(), queued.by_seqno, req.level, deadline, cookie)
                .map_err(|status| {
                    error!(vb = %self.id, %status, "sync write refused after possibility check");
                    status
                })?;
            (queued, resolutions)
        } else {
            let queued = self
                .checkpoint
                .queue_dirty(item, GenerateBySeqno::Yes)
                .map_err(|e| self.invariant_to_status(e))?;
            (queued, Vec::new())
        };

        let perspective = if item.is_pending() {
            Perspective::Pending
        } else {
            Perspective::Committed
        };
        let stored = if lock.find(&item.key, perspective).is_some() {
            lock.update(item).expect("slot checked above")
        } else {
            lock.add_new(item)
        };
        stored.by_seqno = queued.by_seqno;
        stored.dirty = true;
        Ok(QueueOutcome {
            seqno: queued.by_seqno,
            item_count_delta: queued.item_count_delta,
            notify_flusher: queued.notify_flusher,
            resolutions,
        })
    }

    /// The write-path gauntlet: pending check, expiry, locks, CAS policy,
    /// residency. Returns the base revision for the new version.
    fn validate_write(
        &self,
        lock: &mut BucketLock<'_>,
        key: &DocKey,
        cas: u64,
        kind: WriteKind,
        now_secs: u32,
    ) -> Result<u64, Status> {
        if lock.find(key, Perspective::Pending).is_some() {
            return Err(Status::SyncWriteInProgress);
        }
        let max_deleted_rev = self.ht.max_deleted_rev_seqno();
        if let Some(v) = lock.find_mut(key, Perspective::Committed) {
            v.refresh_lock(now_secs);
            let base_rev = v.rev_seqno.max(max_deleted_rev);
            let class = classify(v, now_secs);
            match class {
                ValueClass::TempInit => return Err(Status::Ewouldblock),
                ValueClass::TempNonExistent
                | ValueClass::TempDeleted
                | ValueClass::Deleted
                | ValueClass::Expired => {
                    // Logically absent. CAS-ful writes and delete/replace
                    // have nothing to address.
                    if kind == WriteKind::Delete || kind == WriteKind::Replace || cas != 0 {
                        return Err(Status::KeyEnoent);
                    }
                    // A tombstone still carrying system xattrs accepts only
                    // a further delete, never a resurrecting write.
                    if v.value.is_some()
                        && v.datatype.contains(Datatype::XATTR)
                        && kind != WriteKind::Delete
                    {
                        return Err(Status::KeyEnoent);
                    }
                    return Ok(base_rev);
                }
                ValueClass::Live | ValueClass::NotResident => {}
                ValueClass::Miss => unreachable!("classified an existing value as a miss"),
            }
            if v.is_locked(now_secs) {
                if cas == 0 || cas != v.cas {
                    return Err(Status::Locked);
                }
                v.lock_expiry = 0;
            }
            if kind == WriteKind::Add {
                return Err(Status::NotStored);
            }
            if class == ValueClass::NotResident
                && cas != 0
                && self.ht.policy() == EvictionPolicy::Full
            {
                // The authoritative CAS may be on disk.
                return Err(Status::Ewouldblock);
            }
            if cas != 0 && cas != v.cas {
                return Err(Status::KeyEexists);
            }
            return Ok(base_rev);
        }

        // Nothing resident at all.
        let needs_meta = cas != 0 || kind != WriteKind::Set;
        if self.ht.policy() == EvictionPolicy::Full
            && needs_meta
            && self.bloom.maybe_key_exists(&key.key)
        {
            lock.insert_temp(key.clone(), TempKind::Init);
            return Err(Status::Ewouldblock);
        }
        if cas != 0 || kind == WriteKind::Replace || kind == WriteKind::Delete {
            return Err(Status::KeyEnoent);
        }
        Ok(max_deleted_rev)
    }

    // ---- replication write paths -----------------------------------------

    /// Replicated mutation (meta path): conflict-resolve against local
    /// metadata, preserve the incoming CAS and revision, absorb the peer
    /// clock into ours.
    pub fn set_with_meta(
        &self,
        key: DocKey,
        value: Vec<u8>,
        meta: ItemMeta,
        datatype: Datatype,
    ) -> Result<MutationResult, Status> {
        self.store_with_meta(key, Some(value), meta, datatype)
    }

    pub fn delete_with_meta(&self, key: DocKey, meta: ItemMeta) -> Result<MutationResult, Status> {
        self.store_with_meta(key, None, meta, Datatype::RAW)
    }

    fn store_with_meta(
        &self,
        key: DocKey,
        value: Option<Vec<u8>>,
        meta: ItemMeta,
        datatype: Datatype,
    ) -> Result<MutationResult, Status> {
        let state = self.state.read();
        if *state != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let handle = self.manifest.caching_read_handle(key.collection);
        if !handle.valid() {
            return Err(Status::KeyEnoent);
        }
        let value_len = value.as_ref().map(Vec::len).unwrap_or(0);
        self.check_memory(key.len() + value_len, true)?;
        let now_secs = self.clock.now_secs();
        let deletion = value.is_none();

        let mut item = Item {
            key: key.clone(),
            vbid: self.id,
            value: value.map(Arc::new),
            datatype,
            flags: meta.flags,
            expiry: if deletion { now_secs } else { meta.expiry },
            cas: meta.cas,
            by_seqno: None,
            rev_seqno: meta.rev_seqno,
            operation: if deletion {
                ItemOperation::Deletion
            } else {
                ItemOperation::Mutation
            },
            delete_source: DeleteSource::Explicit,
            durability: None,
            prepare_seqno: None,
        };
        self.observer.pre_link_document(&mut item);

        let outcome = {
            let mut lock = self.ht.lock_key(&key);
            if lock.find(&key, Perspective::Pending).is_some() {
                return Err(Status::SyncWriteInProgress);
            }
            enum LocalSide {
                Resolvable(ConflictMeta, bool),
                TempFetchInFlight,
                Absent,
                KnownAbsent,
            }
            let local = match lock.find(&key, Perspective::Committed) {
                Some(v) => match v.temp {
                    TempKind::Init => LocalSide::TempFetchInFlight,
                    TempKind::NonExistent | TempKind::Deleted => LocalSide::KnownAbsent,
                    TempKind::None => LocalSide::Resolvable(
                        ConflictMeta {
                            cas: v.cas,
                            rev_seqno: v.rev_seqno,
                            expiry: v.expiry,
                            flags: v.flags,
                        },
                        v.deleted,
                    ),
                },
                None => LocalSide::Absent,
            };
            match local {
                LocalSide::TempFetchInFlight => return Err(Status::Ewouldblock),
                LocalSide::Resolvable(local_meta, local_deleted) => {
                    let incoming = ConflictMeta {
                        cas: meta.cas,
                        rev_seqno: meta.rev_seqno,
                        expiry: meta.expiry,
                        flags: meta.flags,
                    };
                    if self
                        .conflict_resolver
                        .resolve(local_meta, incoming, local_deleted)
                        == ConflictOutcome::Reject
                    {
                        self.conflict_resolver_rejects
                            .fetch_add(1, Ordering::Relaxed);
                        return Err(Status::KeyEexists);
                    }
                }
                LocalSide::Absent => {
                    if self.ht.policy() == EvictionPolicy::Full
                        && self.bloom.maybe_key_exists(&key.key)
                    {
                        // Resolution needs the on-disk metadata first.
                        lock.insert_temp(key.clone(), TempKind::Init);
                        return Err(Status::Ewouldblock);
                    }
                }
                LocalSide::KnownAbsent => {
                    // The marker has served its purpose; incoming wins by
                    // default against a known-absent local side.
                    lock.cleanup_if_temporary(&key);
                }
            }
            self.conflict_resolver_accepts
                .fetch_add(1, Ordering::Relaxed);
            if item.is_deleted() {
                self.ht.update_max_deleted_rev_seqno(item.rev_seqno);
            }
            self.hlc
                .set_max_cas_and_track_drift(meta.cas, self.clock.now_us());
            let outcome = self.queue_and_link(&mut lock, &mut item, None)?;
            handle.update_high_seqno(outcome.seqno);
            outcome
        };
        self.sync_mem_accounting();
        self.notify_new_seqno(&outcome);
        Ok(MutationResult {
            cas: meta.cas,
            seqno: outcome.seqno,
            durability_pending: false,
        })
    }

    // ---- read paths ------------------------------------------------------

    pub fn get(&self, key: &DocKey) -> Result<GetValue, Status> {
        let state = self.state.read();
        if *state != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let handle = self.manifest.caching_read_handle(key.collection);
        if !handle.valid() {
            return Err(Status::KeyEnoent);
        }
        let now_secs = self.clock.now_secs();
        let (result, expired) = {
            let mut lock = self.ht.lock_key(key);
            match self.fetch_valid_value(&mut lock, key, now_secs) {
                Ok(value) => (Ok(value), None),
                Err(FetchMiss::Status(status)) => (Err(status), None),
                Err(FetchMiss::Expired(outcome)) => (Err(Status::KeyEnoent), Some(outcome)),
            }
        };
        if let Some(outcome) = expired {
            self.sync_mem_accounting();
            self.notify_new_seqno(&outcome);
        }
        result
    }

    /// Metadata-only read; also answers for tombstones.
    pub fn get_meta(&self, key: &DocKey) -> Result<GetValue, Status> {
        let state = self.state.read();
        if *state != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let handle = self.manifest.caching_read_handle(key.collection);
        if !handle.valid() {
            return Err(Status::KeyEnoent);
        }
        let mut lock = self.ht.lock_key(key);
        let class = lock
            .find(key, Perspective::Committed)
            .map(|v| classify(v, self.clock.now_secs()))
            .unwrap_or(ValueClass::Miss);
        match class {
            ValueClass::TempInit => Err(Status::Ewouldblock),
            ValueClass::TempNonExistent => Err(Status::KeyEnoent),
            ValueClass::Miss => {
                if self.ht.policy() == EvictionPolicy::Full
                    && self.bloom.maybe_key_exists(&key.key)
                {
                    lock.insert_temp(key.clone(), TempKind::Init);
                    Err(Status::Ewouldblock)
                } else {
                    Err(Status::KeyEnoent)
                }
            }
            // Tombstone metadata is a valid answer here.
            _ => Ok(get_value_of(
                lock.find(key, Perspective::Committed).expect("classified"),
            )),
        }
    }

    /// Read and lock the key; returns a fresh CAS the caller must present
    /// to subsequently mutate or unlock.
    pub fn get_locked(
        &self,
        key: &DocKey,
        lock_timeout_secs: Option<u32>,
    ) -> Result<GetValue, Status> {
        let state = self.state.read();
        if *state != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let handle = self.manifest.caching_read_handle(key.collection);
        if !handle.valid() {
            return Err(Status::KeyEnoent);
        }
        let now_secs = self.clock.now_secs();
        let now_us = self.clock.now_us();
        let mut lock = self.ht.lock_key(key);
        let Some(v) = lock.find_mut(key, Perspective::Committed) else {
            return Err(Status::KeyEnoent);
        };
        v.refresh_lock(now_secs);
        if v.is_temp() || v.deleted || v.is_expired(now_secs) {
            return Err(Status::KeyEnoent);
        }
        if v.is_locked(now_secs) {
            return Err(Status::LockedTmpfail);
        }
        if !v.resident {
            return Err(Status::Ewouldblock);
        }
        let timeout = lock_timeout_secs.unwrap_or(self.config.default_lock_timeout_secs);
        v.lock_expiry = now_secs.saturating_add(timeout);
        v.cas = self.hlc.next_cas(now_us);
        Ok(get_value_of(v))
    }

    /// Read the value and replace its TTL, queueing the touched item.
    pub fn get_and_update_ttl(&self, key: &DocKey, expiry: u32) -> Result<GetValue, Status> {
        let state = self.state.read();
        if *state != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let handle = self.manifest.caching_read_handle(key.collection);
        if !handle.valid() {
            return Err(Status::KeyEnoent);
        }
        let now_secs = self.clock.now_secs();
        let now_us = self.clock.now_us();
        let (result, outcome) = {
            let mut lock = self.ht.lock_key(key);
            let mut value = match self.fetch_valid_value(&mut lock, key, now_secs) {
                Ok(value) => value,
                Err(FetchMiss::Status(status)) => return Err(status),
                Err(FetchMiss::Expired(outcome)) => {
                    drop(lock);
                    self.sync_mem_accounting();
                    self.notify_new_seqno(&outcome);
                    return Err(Status::KeyEnoent);
                }
            };
            let mut item = {
                let v = lock
                    .find_mut(key, Perspective::Committed)
                    .expect("fetched above");
                v.expiry = expiry;
                v.cas = self.hlc.next_cas(now_us);
                v.rev_seqno += 1;
                v.dirty = true;
                v.to_item(self.id)
            };
            let outcome = self.queue_and_link(&mut lock, &mut item, None)?;
            handle.update_high_seqno(outcome.seqno);
            value.meta.expiry = expiry;
            value.meta.cas = item.cas;
            value.meta.rev_seqno = item.rev_seqno;
            (value, outcome)
        };
        self.sync_mem_accounting();
        self.notify_new_seqno(&outcome);
        Ok(result)
    }

    /// Shared read helper: resolves temp markers, residency, deletion and
    /// opportunistic expiry (Active only; expiry is never applied to
    /// pending values).
    fn fetch_valid_value(
        &self,
        lock: &mut BucketLock<'_>,
        key: &DocKey,
        now_secs: u32,
    ) -> Result<GetValue, FetchMiss> {
        let class = lock
            .find(key, Perspective::Committed)
            .map(|v| classify(v, now_secs))
            .unwrap_or(ValueClass::Miss);
        match class {
            ValueClass::TempInit => Err(FetchMiss::Status(Status::Ewouldblock)),
            ValueClass::TempNonExistent | ValueClass::TempDeleted | ValueClass::Deleted => {
                Err(FetchMiss::Status(Status::KeyEnoent))
            }
            ValueClass::NotResident => Err(FetchMiss::Status(Status::Ewouldblock)),
            ValueClass::Live => Ok(get_value_of(
                lock.find(key, Perspective::Committed).expect("classified"),
            )),
            ValueClass::Expired => {
                // Expire in place: tombstone the value and queue the
                // deletion so persistence and replication observe it.
                let mut item = {
                    let v = lock
                        .find_mut(key, Perspective::Committed)
                        .expect("classified");
                    v.deleted = true;
                    v.delete_source = DeleteSource::Ttl;
                    if !v.datatype.contains(Datatype::XATTR) {
                        v.value = None;
                    }
                    v.rev_seqno += 1;
                    v.dirty = true;
                    v.expiry = now_secs;
                    v.to_item(self.id)
                };
                item.delete_source = DeleteSource::Ttl;
                self.ht.update_max_deleted_rev_seqno(item.rev_seqno);
                let outcome = self
                    .queue_and_link(lock, &mut item, None)
                    .map_err(FetchMiss::Status)?;
                Err(FetchMiss::Expired(outcome))
            }
            ValueClass::Miss => {
                if self.ht.policy() == EvictionPolicy::Full {
                    if self.bloom.maybe_key_exists(&key.key) {
                        lock.insert_temp(key.clone(), TempKind::Init);
                        Err(FetchMiss::Status(Status::Ewouldblock))
                    } else {
                        Err(FetchMiss::Status(Status::KeyEnoent))
                    }
                } else {
                    Err(FetchMiss::Status(Status::KeyEnoent))
                }
            }
        }
    }

    // ---- prepare resolution ----------------------------------------------

    /// Replace the pending value at `key` with its committed form and
    /// queue the commit item. `commit_seqno` is given on replica paths;
    /// the active generates one.
    pub fn commit(
        &self,
        key: &DocKey,
        prepare_seqno: u64,
        commit_seqno: Option<u64>,
    ) -> Result<u64, Status> {
        let mut lock = self.ht.lock_key(key);
        match lock.find(key, Perspective::Pending).map(|v| v.by_seqno) {
            Some(seqno) if seqno == prepare_seqno => {}
            Some(_) => return Err(Status::Einval),
            None => return Err(Status::KeyEnoent),
        }
        let mut item = {
            let committed = lock.commit_pending(key).expect("pending present");
            committed.to_item(self.id)
        };
        item.operation = ItemOperation::Commit;
        item.prepare_seqno = Some(prepare_seqno);
        item.by_seqno = commit_seqno;
        let generate = if commit_seqno.is_some() {
            GenerateBySeqno::No
        } else {
            GenerateBySeqno::Yes
        };
        let queued = self
            .checkpoint
            .queue_dirty(&mut item, generate)
            .map_err(|e| self.invariant_to_status(e))?;
        if let Some(v) = lock.find_mut(key, Perspective::Committed) {
            v.by_seqno = queued.by_seqno;
            v.dirty = true;
        }
        drop(lock);
        let handle = self.manifest.caching_read_handle(key.collection);
        handle.update_high_seqno(queued.by_seqno);
        drop(handle);
        self.notify_new_seqno(&QueueOutcome {
            seqno: queued.by_seqno,
            item_count_delta: queued.item_count_delta,
            notify_flusher: queued.notify_flusher,
            resolutions: Vec::new(),
        });
        Ok(queued.by_seqno)
    }

    /// Remove the pending value at `key` and queue an abort tombstone
    /// carrying the prepare seqno.
    pub fn abort(
        &self,
        key: &DocKey,
        prepare_seqno: u64,
        abort_seqno: Option<u64>,
    ) -> Result<u64, Status> {
        let mut lock = self.ht.lock_key(key);
        match lock.find(key, Perspective::Pending).map(|v| v.by_seqno) {
            Some(seqno) if seqno == prepare_seqno => {}
            Some(_) => return Err(Status::Einval),
            None => return Err(Status::KeyEnoent),
        }
        lock.abort_pending(key);
        let mut item = Item::abort(self.id, key.clone(), prepare_seqno);
        item.by_seqno = abort_seqno;
        let generate = if abort_seqno.is_some() {
            GenerateBySeqno::No
        } else {
            GenerateBySeqno::Yes
        };
        let queued = self
            .checkpoint
            .queue_dirty(&mut item, generate)
            .map_err(|e| self.invariant_to_status(e))?;
        drop(lock);
        self.notify_new_seqno(&QueueOutcome {
            seqno: queued.by_seqno,
            item_count_delta: queued.item_count_delta,
            notify_flusher: queued.notify_flusher,
            resolutions: Vec::new(),
        });
        Ok(queued.by_seqno)
    }

    fn enact_resolutions(&self, resolutions: Vec<Resolution>) {
        for resolution in resolutions {
            let result = match resolution.action {
                ResolutionAction::Commit => {
                    match self.commit(&resolution.key, resolution.prepare_seqno, None) {
                        Ok(_) => Status::Success,
                        Err(status) => {
                            error!(
                                vb = %self.id,
                                key = %resolution.key,
                                prepare_seqno = resolution.prepare_seqno,
                                %status,
                                "failed to commit resolved prepare"
                            );
                            status
                        }
                    }
                }
                ResolutionAction::Abort => {
                    match self.abort(&resolution.key, resolution.prepare_seqno, None) {
                        Ok(_) => Status::SyncWriteAmbiguous,
                        Err(status) => {
                            error!(
                                vb = %self.id,
                                key = %resolution.key,
                                prepare_seqno = resolution.prepare_seqno,
                                %status,
                                "failed to abort timed-out prepare"
                            );
                            status
                        }
                    }
                }
            };
            if let Some(cookie) = resolution.cookie {
                self.observer.sync_write_complete(cookie, result);
            }
        }
    }

    // ---- replica paths ---------------------------------------------------

    /// Replica-side ingest: applies an item from a replication stream or
    /// disk backfill with its original seqno and metadata, bypassing CAS
    /// checks and seqno generation.
    pub fn add_backfill_item(&self, mut item: Item) -> Result<(), Status> {
        let state = self.state.read();
        if !matches!(*state, VBucketState::Replica | VBucketState::Pending) {
            return Err(Status::NotMyVbucket);
        }
        let Some(seqno) = item.by_seqno else {
            return Err(Status::Einval);
        };
        self.check_memory(item.key.len() + item.value_len(), false)?;

        match item.operation {
            ItemOperation::SystemEvent => self.apply_replica_system_event(&mut item, seqno)?,
            ItemOperation::Prepare => self.apply_replica_prepare(&mut item, seqno)?,
            ItemOperation::Commit => {
                if !self.apply_replica_completion(&mut item, ResolutionAction::Commit, seqno)? {
                    return Ok(());
                }
            }
            ItemOperation::Abort => {
                if !self.apply_replica_completion(&mut item, ResolutionAction::Abort, seqno)? {
                    return Ok(());
                }
            }
            ItemOperation::Mutation | ItemOperation::Deletion => {
                let mut lock = self.ht.lock_key(&item.key);
                self.checkpoint
                    .queue_dirty(&mut item, GenerateBySeqno::No)
                    .map_err(|e| self.invariant_to_status(e))?;
                if item.is_deleted() {
                    self.ht.update_max_deleted_rev_seqno(item.rev_seqno);
                }
                if lock.find(&item.key, Perspective::Committed).is_some() {
                    lock.update(&item);
                } else {
                    lock.add_new(&item);
                }
                self.hlc.set_max_cas(item.cas);
            }
            ItemOperation::Empty => return Err(Status::Einval),
        }
        let handle = self.manifest.caching_read_handle(item.key.collection);
        handle.update_high_seqno(seqno);
        drop(handle);
        self.sync_mem_accounting();
        Ok(())
    }

    fn apply_replica_system_event(&self, item: &mut Item, seqno: u64) -> Result<(), Status> {
        let payload = item.value.as_ref().map(|v| v.as_slice()).unwrap_or(&[]);
        let event = crate::collections::events::SystemEventData::decode(payload).map_err(|e| {
            error!(vb = %self.id, error = %e, "bad system event payload");
            Status::Einval
        })?;
        self.manifest.write().apply_event(&event, seqno).map_err(|e| {
            error!(vb = %self.id, error = %e, "system event replay failed");
            Status::Einval
        })?;
        self.checkpoint
            .queue_dirty(item, GenerateBySeqno::No)
            .map_err(|e| self.invariant_to_status(e))?;
        Ok(())
    }

    fn apply_replica_prepare(&self, item: &mut Item, seqno: u64) -> Result<(), Status> {
        let Some(req) = item.durability else {
            return Err(Status::Einval);
        };
        let Some(timeout) = req.timeout else {
            // The active resolves default timeouts before replicating;
            // receiving one here is a stream bug.
            error!(vb = %self.id, key = %item.key, "replica prepare without explicit timeout");
            return Err(Status::Einval);
        };
        let mut lock = self.ht.lock_key(&item.key);
        if lock.find(&item.key, Perspective::Pending).is_some() {
            return Err(Status::Einval);
        }
        {
            let _dq = self.durability_queue.lock();
            let mut dm = self.dm.lock();
            let Some(pdm) = dm.as_passive_mut() else {
                return Err(Status::NotMyVbucket);
            };
            self.checkpoint
                .queue_dirty(item, GenerateBySeqno::No)
                .map_err(|e| self.invariant_to_status(e))?;
            pdm.add_sync_write(item.key.clone(), seqno, req.level, timeout)
                .map_err(|e| self.invariant_to_status(e))?;
        }
        lock.add_new(item);
        self.hlc.set_max_cas(item.cas);
        Ok(())
    }

    /// Returns false for a duplicate completion replay (a no-op).
    fn apply_replica_completion(
        &self,
        item: &mut Item,
        action: ResolutionAction,
        seqno: u64,
    ) -> Result<bool, Status> {
        let Some(prepare_seqno) = item.prepare_seqno else {
            return Err(Status::Einval);
        };
        {
            let mut dm = self.dm.lock();
            let Some(pdm) = dm.as_passive_mut() else {
                return Err(Status::NotMyVbucket);
            };
            if prepare_seqno <= pdm.high_completed_seqno() {
                return Ok(false);
            }
            pdm.complete_sync_write(&item.key, action, prepare_seqno)
                .map_err(|e| self.invariant_to_status(e))?;
        }
        let mut lock = self.ht.lock_key(&item.key);
        match action {
            ResolutionAction::Commit => {
                if let Some(v) = lock.commit_pending(&item.key) {
                    v.by_seqno = seqno;
                    v.dirty = true;
                }
            }
            ResolutionAction::Abort => {
                lock.abort_pending(&item.key);
            }
        }
        self.checkpoint
            .queue_dirty(item, GenerateBySeqno::No)
            .map_err(|e| self.invariant_to_status(e))?;
        Ok(true)
    }

    /// Mark/unmark that this replica is receiving its initial disk
    /// snapshot.
    pub fn set_receiving_initial_snapshot(&self, receiving: bool) {
        self.receiving_initial_snapshot
            .store(receiving, Ordering::Release);
    }

    pub fn is_receiving_initial_snapshot(&self) -> bool {
        self.receiving_initial_snapshot.load(Ordering::Acquire)
    }

    /// Flag this partition for asynchronous teardown. The host's cleanup
    /// task owns the actual destruction; marking the flag guarantees the
    /// final drop never runs inline on an operation path.
    pub fn set_deferred_deletion(&self, deferred: bool) {
        self.deferred_deletion.store(deferred, Ordering::Release);
    }

    pub fn is_deferred_deletion(&self) -> bool {
        self.deferred_deletion.load(Ordering::Acquire)
    }

    // ---- durability plumbing ---------------------------------------------

    /// A replica ack arrived from `node`.
    pub fn seqno_ack_received(&self, node: &str, seqno: u64) -> Result<(), EpkvError> {
        let resolutions = {
            let mut dm = self.dm.lock();
            let Some(adm) = dm.as_active_mut() else {
                warn!(vb = %self.id, node, seqno, "seqno ack on non-active partition");
                return Ok(());
            };
            adm.seqno_ack_received(node, seqno)?
        };
        self.enact_resolutions(resolutions);
        Ok(())
    }

    /// The flusher finished persisting up to `seqno`.
    pub fn notify_persistence(&self, seqno: u64) {
        self.persistence_seqno.fetch_max(seqno, Ordering::AcqRel);
        let mut passive_ack = None;
        let resolutions = {
            let mut dm = self.dm.lock();
            match &mut *dm {
                DurabilityMonitor::Active(adm) => adm.notify_local_persistence(seqno),
                DurabilityMonitor::Passive(pdm) => {
                    passive_ack = pdm.notify_local_persistence(seqno);
                    Vec::new()
                }
            }
        };
        self.enact_resolutions(resolutions);
        if let Some(hps) = passive_ack {
            self.observer.seqno_ack(self.id, hps);
        }
        let now = Instant::now();
        for (cookie, status) in self.waiters.notifications(seqno, WaiterKind::Seqno, now) {
            self.observer.notify_io_complete(cookie, status);
        }
    }

    /// A whole checkpoint was persisted.
    pub fn notify_checkpoint_persisted(&self, checkpoint_id: u64) {
        let now = Instant::now();
        for (cookie, status) in
            self.waiters
                .notifications(checkpoint_id, WaiterKind::CheckpointId, now)
        {
            self.observer.notify_io_complete(cookie, status);
        }
    }

    /// Abort every tracked prepare whose deadline passed.
    pub fn process_sync_write_timeouts(&self, as_of: Instant) {
        let resolutions = {
            let mut dm = self.dm.lock();
            match dm.as_active_mut() {
                Some(adm) => adm.process_timeout(as_of),
                None => Vec::new(),
            }
        };
        self.enact_resolutions(resolutions);
    }

    pub fn high_prepared_seqno(&self) -> u64 {
        self.dm.lock().high_prepared_seqno()
    }

    pub fn num_tracked_sync_writes(&self) -> usize {
        self.dm.lock().num_tracked()
    }

    // ---- state transitions -----------------------------------------------

    /// Transition the partition state, validating and installing a
    /// replication topology when supplied on a transition to `Active`.
    pub fn set_state(
        &self,
        new_state: VBucketState,
        topology_meta: Option<&serde_json::Value>,
    ) -> Result<(), Status> {
        let topology = match (new_state, topology_meta) {
            (VBucketState::Active, Some(raw)) => {
                Some(ReplicationTopology::parse(raw).map_err(|e| {
                    warn!(vb = %self.id, error = %e, "rejected replication topology");
                    Status::Einval
                })?)
            }
            (_, Some(_)) => return Err(Status::Einval),
            (_, None) => None,
        };

        let mut state = self.state.write();
        let old_state = *state;
        info!(
            vb = %self.id,
            from = old_state.as_str(),
            to = new_state.as_str(),
            "state transition"
        );
        let mut resolutions = Vec::new();
        let mut ambiguous_cookies = Vec::new();
        {
            let mut dm = self.dm.lock();
            match (old_state, new_state) {
                (VBucketState::Active, VBucketState::Active) => {
                    if let (Some(topology), DurabilityMonitor::Active(adm)) = (topology, &mut *dm) {
                        resolutions = adm.set_replication_topology(topology);
                    }
                }
                (_, VBucketState::Active) => {
                    let placeholder =
                        DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(self.id));
                    let old = std::mem::replace(&mut *dm, placeholder);
                    let adm = match old {
                        DurabilityMonitor::Passive(pdm) => {
                            ActiveDurabilityMonitor::from_passive(pdm, topology)
                        }
                        DurabilityMonitor::Active(adm) => adm,
                    };
                    *dm = DurabilityMonitor::Active(adm);
                }
                (VBucketState::Active, _) => {
                    let placeholder =
                        DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(self.id));
                    let old = std::mem::replace(&mut *dm, placeholder);
                    if let DurabilityMonitor::Active(adm) = old {
                        // Clients cannot be answered by a replica; their
                        // writes survive the handoff but the outcome is no
                        // longer observable through this node.
                        ambiguous_cookies = adm
                            .tracked_writes()
                            .filter_map(|w| w.cookie)
                            .collect::<Vec<_>>();
                        *dm = DurabilityMonitor::Passive(PassiveDurabilityMonitor::from_active(
                            adm,
                        ));
                    }
                }
                _ => {}
            }
        }
        *state = new_state;
        drop(state);

        for cookie in ambiguous_cookies {
            self.observer
                .sync_write_complete(cookie, Status::SyncWriteAmbiguous);
        }
        self.enact_resolutions(resolutions);
        let pending: Vec<Cookie> = self.pending_ops.lock().drain(..).collect();
        for cookie in pending {
            self.observer.notify_io_complete(cookie, Status::Success);
        }
        if new_state == VBucketState::Dead {
            self.complete_all_waiters();
        }
        Ok(())
    }

    /// Park a client blocked on a state transition; completed on the next
    /// transition.
    pub fn add_pending_op(&self, cookie: Cookie) {
        self.pending_ops.lock().push(cookie);
    }

    /// Disconnect/shutdown: every waiting client is released with
    /// `Tmpfail`.
    pub fn complete_all_waiters(&self) {
        for (cookie, _) in self.waiters.drain_all(Status::Tmpfail) {
            self.observer.notify_io_complete(cookie, Status::Tmpfail);
        }
        let drained = {
            let mut dm = self.dm.lock();
            match dm.as_active_mut() {
                Some(adm) => adm.drain(),
                None => Vec::new(),
            }
        };
        for write in drained {
            if let Some(cookie) = write.cookie {
                self.observer.sync_write_complete(cookie, Status::Tmpfail);
            }
        }
    }

    // ---- high-priority waiters -------------------------------------------

    /// Wait until `target` (a seqno or checkpoint id) is persisted. The
    /// caller is notified later through `notify_io_complete` unless the
    /// target has already been reached.
    pub fn wait_for_persistence(&self, cookie: Cookie, target: u64, kind: WaiterKind) -> Status {
        if kind == WaiterKind::Seqno && target <= self.persistence_seqno() {
            return Status::Success;
        }
        self.waiters.add(cookie, target, kind, Instant::now());
        Status::Ewouldblock
    }

    pub fn num_high_priority_waiters(&self) -> usize {
        self.waiters.len()
    }

    // ---- rollback --------------------------------------------------------

    /// Roll this (non-active) partition back to `rollback_seqno` after
    /// divergence from the new active's history.
    pub fn rollback(
        &self,
        rollback_seqno: u64,
        persisted_collection_stats: Vec<(CollectionId, CollectionStats)>,
    ) -> Result<(), Status> {
        let state = self.state.write();
        if *state == VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let high_seqno = self.checkpoint.high_seqno();
        if rollback_seqno > high_seqno {
            return Err(Status::Einval);
        }
        info!(vb = %self.id, rollback_seqno, high_seqno, "rolling back");

        self.rollback_item_count
            .fetch_add(high_seqno - rollback_seqno, Ordering::Relaxed);
        self.failover.lock().prune_above(rollback_seqno);
        self.checkpoint.clear(rollback_seqno);
        self.persistence_seqno
            .store(rollback_seqno, Ordering::Release);
        self.ht.clear();
        {
            let mut dm = self.dm.lock();
            *dm = DurabilityMonitor::Passive(PassiveDurabilityMonitor::new(self.id));
        }
        {
            let mut manifest = self.manifest.write();
            for (collection, stats) in persisted_collection_stats {
                manifest.reset_stats(collection, stats);
            }
        }
        self.receiving_initial_snapshot
            .store(false, Ordering::Release);
        drop(state);
        self.sync_mem_accounting();
        self.complete_all_waiters();
        Ok(())
    }

    pub fn rollback_item_count(&self) -> u64 {
        self.rollback_item_count.load(Ordering::Relaxed)
    }

    // ---- collections -----------------------------------------------------

    /// Drive the collections namespace of an active partition toward a new
    /// bucket manifest, queueing one system event per change.
    pub fn update_collections_manifest(
        &self,
        bucket_manifest: &crate::collections::manifest::Manifest,
    ) -> Result<(), Status> {
        let state = self.state.read();
        if *state != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let events = self.manifest.diff(bucket_manifest);
        for event in events {
            let mut item = Item {
                key: DocKey::new(
                    CollectionId::SYSTEM,
                    format!("_event:{:x}", event.manifest_uid()),
                ),
                vbid: self.id,
                value: Some(Arc::new(event.encode())),
                datatype: Datatype::RAW,
                flags: 0,
                expiry: 0,
                cas: self.hlc.next_cas(self.clock.now_us()),
                by_seqno: None,
                rev_seqno: 1,
                operation: ItemOperation::SystemEvent,
                delete_source: DeleteSource::Explicit,
                durability: None,
                prepare_seqno: None,
            };
            let queued = self
                .checkpoint
                .queue_dirty(&mut item, GenerateBySeqno::Yes)
                .map_err(|e| self.invariant_to_status(e))?;
            self.manifest
                .write()
                .apply_event(&event, queued.by_seqno)
                .map_err(|e| self.invariant_to_status(e))?;
            self.notify_new_seqno(&QueueOutcome {
                seqno: queued.by_seqno,
                item_count_delta: queued.item_count_delta,
                notify_flusher: queued.notify_flusher,
                resolutions: Vec::new(),
            });
        }
        Ok(())
    }

    // ---- helpers ---------------------------------------------------------

    fn check_memory(&self, incoming: usize, client: bool) -> Result<(), Status> {
        let limit = if client {
            self.config.mutation_mem_limit()
        } else {
            self.config.replication_mem_limit()
        };
        let used = self.mem_used.load(Ordering::Relaxed).max(0) as usize;
        if used + incoming > limit {
            return Err(Status::Enomem);
        }
        Ok(())
    }

    /// Reconcile the shared memory counter with this partition's
    /// footprint.
    fn sync_mem_accounting(&self) {
        let current = self.ht.mem_size() + self.checkpoint.mem_usage() as i64;
        let previous = self.mem_recorded.swap(current, Ordering::AcqRel);
        self.mem_used
            .fetch_add(current - previous, Ordering::AcqRel);
    }

    fn invariant_to_status(&self, error: EpkvError) -> Status {
        error!(vb = %self.id, error = %error, "internal error on operation path");
        Status::Einval
    }

    fn notify_new_seqno(&self, outcome: &QueueOutcome) {
        self.observer.new_seqno(
            self.id,
            SeqnoNotification {
                by_seqno: outcome.seqno,
                item_count_delta: outcome.item_count_delta,
                notify_flusher: outcome.notify_flusher,
                notify_replication: true,
            },
        );
    }

    // ---- stats -----------------------------------------------------------

    /// The per-partition textual stats surface.
    pub fn stats(&self) -> Vec<(String, String)> {
        let prefix = format!("vb_{}", self.id.0);
        let drift = self.hlc.drift_stats();
        let (hps, tracked, accepted, committed, aborted, topology) = {
            let dm = self.dm.lock();
            match &*dm {
                DurabilityMonitor::Active(adm) => (
                    adm.high_prepared_seqno(),
                    adm.num_tracked(),
                    adm.accepted_count(),
                    adm.committed_count(),
                    adm.aborted_count(),
                    adm.topology().map(|t| t.to_json().to_string()),
                ),
                DurabilityMonitor::Passive(pdm) => {
                    (pdm.high_prepared_seqno(), pdm.num_tracked(), 0, 0, 0, None)
                }
            }
        };
        let mut stats = vec![
            (format!("{prefix}:state"), self.state().as_str().to_string()),
            (
                format!("{prefix}:num_items"),
                self.ht.num_items().to_string(),
            ),
            (
                format!("{prefix}:num_temp_items"),
                self.ht.num_temp_items().to_string(),
            ),
            (
                format!("{prefix}:num_non_resident"),
                self.ht.num_non_resident().to_string(),
            ),
            (
                format!("{prefix}:ht_memory"),
                self.ht.mem_size().to_string(),
            ),
            (
                format!("{prefix}:queue_size"),
                self.checkpoint.num_items_for_persistence().to_string(),
            ),
            (
                format!("{prefix}:queue_memory"),
                self.checkpoint.mem_usage().to_string(),
            ),
            (
                format!("{prefix}:high_seqno"),
                self.high_seqno().to_string(),
            ),
            (
                format!("{prefix}:purge_seqno"),
                self.purge_seqno.load(Ordering::Relaxed).to_string(),
            ),
            (format!("{prefix}:uuid"), self.failover_uuid().to_string()),
            (
                format!("{prefix}:hp_vb_req_size"),
                self.waiters.len().to_string(),
            ),
            (
                format!("{prefix}:sync_write_accepted_count"),
                accepted.to_string(),
            ),
            (
                format!("{prefix}:sync_write_committed_count"),
                committed.to_string(),
            ),
            (
                format!("{prefix}:sync_write_aborted_count"),
                aborted.to_string(),
            ),
            (
                format!("{prefix}:rollback_item_count"),
                self.rollback_item_count().to_string(),
            ),
            (format!("{prefix}:max_cas"), self.hlc.max_cas().to_string()),
            (
                format!("{prefix}:total_abs_drift"),
                drift.total_abs_drift_us.to_string(),
            ),
            (
                format!("{prefix}:drift_ahead_exceeded"),
                drift.drift_ahead_exceeded.to_string(),
            ),
            (
                format!("{prefix}:drift_behind_exceeded"),
                drift.drift_behind_exceeded.to_string(),
            ),
            (format!("{prefix}:high_prepared_seqno"), hps.to_string()),
            (
                format!("{prefix}:sync_write_in_flight"),
                tracked.to_string(),
            ),
            (
                format!("{prefix}:bloom_filter"),
                self.bloom.status().as_str().to_string(),
            ),
            (
                format!("{prefix}:bloom_filter_size"),
                self.bloom.size_bytes().to_string(),
            ),
            (
                format!("{prefix}:bloom_filter_key_count"),
                self.bloom.key_count().to_string(),
            ),
            (
                format!("{prefix}:ops_create"),
                self.ops_create.load(Ordering::Relaxed).to_string(),
            ),
            (
                format!("{prefix}:ops_update"),
                self.ops_update.load(Ordering::Relaxed).to_string(),
            ),
            (
                format!("{prefix}:ops_delete"),
                self.ops_delete.load(Ordering::Relaxed).to_string(),
            ),
            (
                format!("{prefix}:conflict_resolver_rejects"),
                self.conflict_resolver_rejects
                    .load(Ordering::Relaxed)
                    .to_string(),
            ),
            (
                format!("{prefix}:conflict_resolver_accepts"),
                self.conflict_resolver_accepts
                    .load(Ordering::Relaxed)
                    .to_string(),
            ),
        ];
        if let Some(topology) = topology {
            stats.push((format!("{prefix}:topology"), topology));
        }
        let manifest = self.manifest.read();
        for collection in manifest.collection_ids() {
            if let Some(cs) = manifest.stats(collection) {
                stats.push((
                    format!("{prefix}:collection:{collection}:high_seqno"),
                    cs.high_seqno.to_string(),
                ));
                stats.push((
                    format!("{prefix}:collection:{collection}:disk_count"),
                    cs.disk_count.to_string(),
                ));
            }
        }
        stats
    }
}

fn classify(v: &crate::stored_value::StoredValue, now_secs: u32) -> ValueClass {
    match v.temp {
        TempKind::Init => return ValueClass::TempInit,
        TempKind::NonExistent => return ValueClass::TempNonExistent,
        TempKind::Deleted => return ValueClass::TempDeleted,
        TempKind::None => {}
    }
    if v.deleted {
        ValueClass::Deleted
    } else if v.is_expired(now_secs) {
        ValueClass::Expired
    } else if !v.resident {
        ValueClass::NotResident
    } else {
        ValueClass::Live
    }
}

fn get_value_of(v: &crate::stored_value::StoredValue) -> GetValue {
    GetValue {
        value: v.value.clone(),
        datatype: v.datatype,
        meta: ItemMeta {
            cas: v.cas,
            rev_seqno: v.rev_seqno,
            flags: v.flags,
            expiry: v.expiry,
        },
        by_seqno: v.by_seqno,
        deleted: v.deleted,
    }
}

enum FetchMiss {
    Status(Status),
    /// The value expired on read; carries the queued deletion's
    /// notification payload.
    Expired(QueueOutcome),
}
