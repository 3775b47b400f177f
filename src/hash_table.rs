use crate::config::EvictionPolicy;
use crate::error::Status;
use crate::item::{DocKey, Item};
use crate::stored_value::{CommittedState, StoredValue, TempKind};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Which values at a key an operation addresses. A key may simultaneously
/// hold a committed value and a pending (prepared, uncommitted) value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Committed,
    Pending,
    /// Writer view: the pending value when present, else the committed one.
    Any,
}

/// The values stored at one key.
#[derive(Debug, Default)]
struct Slot {
    committed: Option<StoredValue>,
    pending: Option<StoredValue>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.committed.is_none() && self.pending.is_none()
    }
}

type Shard = HashMap<DocKey, Slot>;

/// Sharded key → stored-value map. Each shard is guarded by one mutex from
/// a fixed pool; a [`BucketLock`] handle is the only way to reach values.
pub struct HashTable {
    shards: Vec<Mutex<Shard>>,
    policy: EvictionPolicy,
    num_items: AtomicI64,
    num_temp_items: AtomicI64,
    num_non_resident: AtomicI64,
    mem_size: AtomicI64,
    max_deleted_rev_seqno: AtomicU64,
}

/// Locked view of the shard owning one key. All mutation goes through this
/// handle so stats stay consistent with the map.
pub struct BucketLock<'a> {
    guard: MutexGuard<'a, Shard>,
    table: &'a HashTable,
}

impl HashTable {
    pub fn new(num_locks: usize, policy: EvictionPolicy) -> Self {
        let num_locks = num_locks.max(1);
        Self {
            shards: (0..num_locks).map(|_| Mutex::new(Shard::new())).collect(),
            policy,
            num_items: AtomicI64::new(0),
            num_temp_items: AtomicI64::new(0),
            num_non_resident: AtomicI64::new(0),
            mem_size: AtomicI64::new(0),
            max_deleted_rev_seqno: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &DocKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Acquire the bucket lock covering `key`.
    pub fn lock_key(&self, key: &DocKey) -> BucketLock<'_> {
        BucketLock {
            guard: self.shard_for(key).lock(),
            table: self,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn num_items(&self) -> i64 {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn num_temp_items(&self) -> i64 {
        self.num_temp_items.load(Ordering::Relaxed)
    }

    pub fn num_non_resident(&self) -> i64 {
        self.num_non_resident.load(Ordering::Relaxed)
    }

    pub fn mem_size(&self) -> i64 {
        self.mem_size.load(Ordering::Relaxed)
    }

    pub fn max_deleted_rev_seqno(&self) -> u64 {
        self.max_deleted_rev_seqno.load(Ordering::Relaxed)
    }

    /// Record the revision of a deletion so a recreation of any key starts
    /// strictly above every version we have ever seen die.
    pub fn update_max_deleted_rev_seqno(&self, rev_seqno: u64) {
        self.max_deleted_rev_seqno
            .fetch_max(rev_seqno, Ordering::AcqRel);
    }

    /// Visit every stored value in the table. Takes each bucket lock in
    /// turn; intended for rollback and stats, not hot paths.
    pub fn for_each(&self, mut f: impl FnMut(&StoredValue)) {
        for shard in &self.shards {
            let guard = shard.lock();
            for slot in guard.values() {
                if let Some(v) = &slot.committed {
                    f(v);
                }
                if let Some(v) = &slot.pending {
                    f(v);
                }
            }
        }
    }

    /// Remove everything. Rollback support; stats are reset with the map.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
        self.num_items.store(0, Ordering::Relaxed);
        self.num_temp_items.store(0, Ordering::Relaxed);
        self.num_non_resident.store(0, Ordering::Relaxed);
        self.mem_size.store(0, Ordering::Relaxed);
    }
}

impl BucketLock<'_> {
    pub fn find(&self, key: &DocKey, perspective: Perspective) -> Option<&StoredValue> {
        let slot = self.guard.get(key)?;
        match perspective {
            Perspective::Committed => slot.committed.as_ref(),
            Perspective::Pending => slot.pending.as_ref(),
            Perspective::Any => slot.pending.as_ref().or(slot.committed.as_ref()),
        }
    }

    pub fn find_mut(&mut self, key: &DocKey, perspective: Perspective) -> Option<&mut StoredValue> {
        let slot = self.guard.get_mut(key)?;
        match perspective {
            Perspective::Committed => slot.committed.as_mut(),
            Perspective::Pending => slot.pending.as_mut(),
            Perspective::Any => {
                if slot.pending.is_some() {
                    slot.pending.as_mut()
                } else {
                    slot.committed.as_mut()
                }
            }
        }
    }

    /// Writer view of the key: the value a mutation would supersede.
    pub fn find_for_write(&mut self, key: &DocKey) -> Option<&mut StoredValue> {
        self.find_mut(key, Perspective::Any)
    }

    /// Insert a new stored value built from `item`. The slot addressed by
    /// the item's committed-state must be empty.
    pub fn add_new(&mut self, item: &Item) -> &mut StoredValue {
        let v = StoredValue::from_item(item);
        self.install(v)
    }

    /// Insert a fully formed stored value (state-transfer and test paths).
    pub fn install(&mut self, v: StoredValue) -> &mut StoredValue {
        self.table.account_add(&v);
        let slot = self.guard.entry(v.key.clone()).or_default();
        if v.is_pending() {
            debug_assert!(slot.pending.is_none(), "pending slot already occupied");
            slot.pending = Some(v);
            slot.pending.as_mut().expect("just inserted")
        } else {
            debug_assert!(slot.committed.is_none(), "committed slot already occupied");
            slot.committed = Some(v);
            slot.committed.as_mut().expect("just inserted")
        }
    }

    /// Replace the stored value for `item`'s key in place, preserving slot
    /// identity for in-flight readers of the other perspective.
    pub fn update(&mut self, item: &Item) -> Option<&mut StoredValue> {
        let replacement = StoredValue::from_item(item);
        let slot = self.guard.get_mut(&item.key)?;
        let target = if replacement.is_pending() {
            &mut slot.pending
        } else {
            &mut slot.committed
        };
        let old = target.as_ref()?;
        self.table.account_remove(old);
        self.table.account_add(&replacement);
        *target = Some(replacement);
        target.as_mut()
    }

    /// Physically remove the value at `key` under `perspective`. Fails with
    /// `Locked` when the committed value is locked and still live.
    pub fn del(
        &mut self,
        key: &DocKey,
        perspective: Perspective,
        now_secs: u32,
    ) -> Result<bool, Status> {
        let Some(slot) = self.guard.get_mut(key) else {
            return Ok(false);
        };
        let target = match perspective {
            Perspective::Committed | Perspective::Any => &mut slot.committed,
            Perspective::Pending => &mut slot.pending,
        };
        let locked_live = target
            .as_ref()
            .map(|v| v.is_locked(now_secs) && !v.deleted)
            .unwrap_or(false);
        if locked_live {
            return Err(Status::Locked);
        }
        if let Some(removed) = target.take() {
            self.table.account_remove(&removed);
            if slot.is_empty() {
                self.guard.remove(key);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Move the pending value into the committed slot, replacing any prior
    /// committed value. Returns the committed value.
    pub fn commit_pending(&mut self, key: &DocKey) -> Option<&mut StoredValue> {
        let slot = self.guard.get_mut(key)?;
        let mut pending = slot.pending.take()?;
        pending.committed = CommittedState::CommittedViaPrepare;
        if let Some(old) = slot.committed.take() {
            self.table.account_remove(&old);
        }
        slot.committed = Some(pending);
        slot.committed.as_mut()
    }

    /// Drop the pending value at `key`.
    pub fn abort_pending(&mut self, key: &DocKey) -> bool {
        let Some(slot) = self.guard.get_mut(key) else {
            return false;
        };
        if let Some(pending) = slot.pending.take() {
            self.table.account_remove(&pending);
            if slot.is_empty() {
                self.guard.remove(key);
            }
            return true;
        }
        false
    }

    /// Add a temp marker at `key` in the committed slot.
    pub fn insert_temp(&mut self, key: DocKey, kind: TempKind) -> &mut StoredValue {
        let v = StoredValue::temp_marker(key, kind);
        self.install(v)
    }

    /// Discard the value at `key` if it is only a temp marker.
    pub fn cleanup_if_temporary(&mut self, key: &DocKey) -> bool {
        let Some(slot) = self.guard.get_mut(key) else {
            return false;
        };
        let is_temp = slot.committed.as_ref().map(|v| v.is_temp()).unwrap_or(false);
        if is_temp {
            let removed = slot.committed.take().expect("checked above");
            self.table.account_remove(&removed);
            if slot.is_empty() {
                self.guard.remove(key);
            }
            return true;
        }
        false
    }

    /// Evict the value at `key` per the table's policy. Only clean,
    /// unlocked, committed values are evictable; pending values are always
    /// resident.
    pub fn evict(&mut self, key: &DocKey, now_secs: u32) -> bool {
        let policy = self.table.policy;
        let Some(slot) = self.guard.get_mut(key) else {
            return false;
        };
        let Some(v) = slot.committed.as_mut() else {
            return false;
        };
        if v.dirty || v.is_temp() || v.is_locked(now_secs) || !v.resident {
            return false;
        }
        match policy {
            EvictionPolicy::Value => {
                let freed = v.value.as_ref().map(|b| b.len()).unwrap_or(0);
                v.value = None;
                v.resident = false;
                self.table.num_non_resident.fetch_add(1, Ordering::Relaxed);
                self.table
                    .mem_size
                    .fetch_sub(freed as i64, Ordering::Relaxed);
                true
            }
            EvictionPolicy::Full => {
                if slot.pending.is_some() {
                    // The whole entry cannot go while a prepare rides on it.
                    return false;
                }
                let removed = slot.committed.take().expect("checked above");
                self.table.account_remove(&removed);
                self.guard.remove(key);
                true
            }
        }
    }
}

impl HashTable {
    fn account_add(&self, v: &StoredValue) {
        if v.is_temp() {
            self.num_temp_items.fetch_add(1, Ordering::Relaxed);
        } else {
            self.num_items.fetch_add(1, Ordering::Relaxed);
        }
        if !v.resident {
            self.num_non_resident.fetch_add(1, Ordering::Relaxed);
        }
        self.mem_size.fetch_add(v.size() as i64, Ordering::Relaxed);
    }

    fn account_remove(&self, v: &StoredValue) {
        if v.is_temp() {
            self.num_temp_items.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.num_items.fetch_sub(1, Ordering::Relaxed);
        }
        if !v.resident {
            self.num_non_resident.fetch_sub(1, Ordering::Relaxed);
        }
        self.mem_size.fetch_sub(v.size() as i64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::{HashTable, Perspective};
    use crate::config::EvictionPolicy;
    use crate::error::Status;
    use crate::item::{DocKey, Item, ItemOperation, Vbid};
    use crate::stored_value::TempKind;

    fn mutation(key: &str, value: &str) -> Item {
        Item::mutation(Vbid(0), DocKey::plain(key), value.as_bytes().to_vec())
    }

    fn prepare(key: &str, value: &str) -> Item {
        let mut item = mutation(key, value);
        item.operation = ItemOperation::Prepare;
        item
    }

    #[test]
    fn pending_and_committed_coexist_at_one_key() {
        let ht = HashTable::new(7, EvictionPolicy::Value);
        let key = DocKey::plain("k");
        {
            let mut lock = ht.lock_key(&key);
            lock.add_new(&mutation("k", "committed"));
            lock.add_new(&prepare("k", "pending"));
            assert!(lock.find(&key, Perspective::Committed).is_some());
            assert!(lock.find(&key, Perspective::Pending).is_some());
            // Writers see the pending value.
            assert!(lock.find_for_write(&key).unwrap().is_pending());
        }
        assert_eq!(ht.num_items(), 2);
    }

    #[test]
    fn commit_pending_replaces_committed() {
        let ht = HashTable::new(7, EvictionPolicy::Value);
        let key = DocKey::plain("k");
        let mut lock = ht.lock_key(&key);
        lock.add_new(&mutation("k", "old"));
        lock.add_new(&prepare("k", "new"));
        let committed = lock.commit_pending(&key).expect("pending present");
        assert!(committed.is_committed());
        assert_eq!(
            committed.value.as_ref().map(|v| v.as_slice()),
            Some(b"new".as_ref())
        );
        assert!(lock.find(&key, Perspective::Pending).is_none());
    }

    #[test]
    fn abort_pending_keeps_committed() {
        let ht = HashTable::new(7, EvictionPolicy::Value);
        let key = DocKey::plain("k");
        let mut lock = ht.lock_key(&key);
        lock.add_new(&mutation("k", "keep"));
        lock.add_new(&prepare("k", "drop"));
        assert!(lock.abort_pending(&key));
        assert!(lock.find(&key, Perspective::Pending).is_none());
        assert_eq!(
            lock.find(&key, Perspective::Committed)
                .and_then(|v| v.value.as_ref())
                .map(|v| v.as_slice()),
            Some(b"keep".as_ref())
        );
    }

    #[test]
    fn del_refuses_locked_live_values() {
        let ht = HashTable::new(7, EvictionPolicy::Value);
        let key = DocKey::plain("k");
        let mut lock = ht.lock_key(&key);
        lock.add_new(&mutation("k", "v"));
        lock.find_for_write(&key).unwrap().lock_expiry = 100;
        assert_eq!(
            lock.del(&key, Perspective::Committed, 50).unwrap_err(),
            Status::Locked
        );
        // Once the lock has lapsed the delete goes through.
        assert!(lock.del(&key, Perspective::Committed, 200).unwrap());
        assert!(lock.find(&key, Perspective::Any).is_none());
    }

    #[test]
    fn temp_items_are_counted_separately_and_cleaned() {
        let ht = HashTable::new(7, EvictionPolicy::Full);
        let key = DocKey::plain("miss");
        {
            let mut lock = ht.lock_key(&key);
            lock.insert_temp(key.clone(), TempKind::Init);
        }
        assert_eq!(ht.num_temp_items(), 1);
        assert_eq!(ht.num_items(), 0);
        {
            let mut lock = ht.lock_key(&key);
            assert!(lock.cleanup_if_temporary(&key));
        }
        assert_eq!(ht.num_temp_items(), 0);
    }

    #[test]
    fn value_eviction_keeps_metadata() {
        let ht = HashTable::new(7, EvictionPolicy::Value);
        let key = DocKey::plain("k");
        let mut lock = ht.lock_key(&key);
        lock.add_new(&mutation("k", "v"));
        // Dirty values are not evictable.
        assert!(!lock.evict(&key, 0));
        lock.find_for_write(&key).unwrap().dirty = false;
        assert!(lock.evict(&key, 0));
        let v = lock.find(&key, Perspective::Committed).unwrap();
        assert!(!v.resident);
        assert!(v.value.is_none());
    }

    #[test]
    fn full_eviction_removes_entry_but_not_under_prepare() {
        let ht = HashTable::new(7, EvictionPolicy::Full);
        let key = DocKey::plain("k");
        let mut lock = ht.lock_key(&key);
        lock.add_new(&mutation("k", "v"));
        lock.find_for_write(&key).unwrap().dirty = false;
        lock.add_new(&prepare("k", "p"));
        assert!(!lock.evict(&key, 0));
        assert!(lock.abort_pending(&key));
        assert!(lock.evict(&key, 0));
        assert!(lock.find(&key, Perspective::Any).is_none());
    }

    #[test]
    fn max_deleted_rev_seqno_is_monotonic() {
        let ht = HashTable::new(7, EvictionPolicy::Value);
        ht.update_max_deleted_rev_seqno(5);
        ht.update_max_deleted_rev_seqno(3);
        assert_eq!(ht.max_deleted_rev_seqno(), 5);
    }
}
