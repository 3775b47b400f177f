use crate::item::{Datatype, DeleteSource, DocKey, Item, ItemOperation, Vbid};
use std::sync::Arc;

/// Committed-state of a stored value. `Pending` values are invisible to
/// plain readers; the two committed states may coexist with a `Pending`
/// value at the same key under different hash-table perspectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommittedState {
    Pending,
    CommittedViaMutation,
    CommittedViaPrepare,
}

/// Temporary-marker kind for values that exist only to carry bgfetch state.
/// Temp values are never queued for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TempKind {
    #[default]
    None,
    /// Placeholder while a background fetch is in flight.
    Init,
    /// Background fetch concluded the key does not exist on disk.
    NonExistent,
    /// Background fetch found a tombstone.
    Deleted,
}

/// The in-memory record for one key.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub key: DocKey,
    pub value: Option<Arc<Vec<u8>>>,
    pub datatype: Datatype,
    pub flags: u32,
    /// Absolute expiry, seconds since epoch; 0 means no expiry.
    pub expiry: u32,
    pub cas: u64,
    /// Seqno of the latest mutation of this value; 0 until first assigned.
    pub by_seqno: u64,
    /// Per-key monotonic version, preserved across recreations.
    pub rev_seqno: u64,
    pub committed: CommittedState,
    pub temp: TempKind,
    pub deleted: bool,
    pub delete_source: DeleteSource,
    /// Absolute unlock time, seconds since epoch; 0 means unlocked.
    pub lock_expiry: u32,
    /// False when the value bytes have been evicted.
    pub resident: bool,
    pub dirty: bool,
    /// Frequency counter consulted by eviction.
    pub freq_counter: u8,
}

impl StoredValue {
    pub fn from_item(item: &Item) -> Self {
        let committed = match item.operation {
            ItemOperation::Prepare => CommittedState::Pending,
            ItemOperation::Commit => CommittedState::CommittedViaPrepare,
            _ => CommittedState::CommittedViaMutation,
        };
        // A prepare without a body is a sync delete; its committed form is
        // a tombstone.
        let deleted = item.is_deleted()
            || (item.operation == ItemOperation::Prepare && item.value.is_none());
        Self {
            key: item.key.clone(),
            value: item.value.clone(),
            datatype: item.datatype,
            flags: item.flags,
            expiry: item.expiry,
            cas: item.cas,
            by_seqno: item.by_seqno.unwrap_or(0),
            rev_seqno: item.rev_seqno,
            committed,
            temp: TempKind::None,
            deleted,
            delete_source: item.delete_source,
            lock_expiry: 0,
            resident: true,
            dirty: true,
            freq_counter: 4,
        }
    }

    /// Build a temp marker. Temp values carry no seqno and are never
    /// persisted.
    pub fn temp_marker(key: DocKey, kind: TempKind) -> Self {
        debug_assert!(kind != TempKind::None);
        Self {
            key,
            value: None,
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: 0,
            by_seqno: 0,
            rev_seqno: 0,
            committed: CommittedState::CommittedViaMutation,
            temp: kind,
            deleted: matches!(kind, TempKind::Deleted | TempKind::NonExistent),
            delete_source: DeleteSource::Explicit,
            lock_expiry: 0,
            resident: true,
            dirty: false,
            freq_counter: 0,
        }
    }

    pub fn is_temp(&self) -> bool {
        self.temp != TempKind::None
    }

    pub fn is_pending(&self) -> bool {
        self.committed == CommittedState::Pending
    }

    pub fn is_committed(&self) -> bool {
        !self.is_pending()
    }

    /// True if the value holds a live (not deleted, not temp) document.
    pub fn is_live(&self) -> bool {
        !self.deleted && !self.is_temp()
    }

    pub fn is_expired(&self, now_secs: u32) -> bool {
        self.expiry != 0 && !self.deleted && now_secs >= self.expiry
    }

    pub fn is_locked(&self, now_secs: u32) -> bool {
        self.lock_expiry != 0 && now_secs < self.lock_expiry
    }

    /// Locks are one-shot: observing an expired lock clears it.
    pub fn refresh_lock(&mut self, now_secs: u32) {
        if self.lock_expiry != 0 && now_secs >= self.lock_expiry {
            self.lock_expiry = 0;
        }
    }

    pub fn size(&self) -> usize {
        std::mem::size_of::<StoredValue>()
            + self.key.len()
            + self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    /// Serialize back into a queueable item.
    pub fn to_item(&self, vbid: Vbid) -> Item {
        let operation = if self.is_pending() {
            ItemOperation::Prepare
        } else if self.deleted {
            ItemOperation::Deletion
        } else {
            ItemOperation::Mutation
        };
        Item {
            key: self.key.clone(),
            vbid,
            value: self.value.clone(),
            datatype: self.datatype,
            flags: self.flags,
            expiry: self.expiry,
            cas: self.cas,
            by_seqno: if self.by_seqno == 0 {
                None
            } else {
                Some(self.by_seqno)
            },
            rev_seqno: self.rev_seqno,
            operation,
            delete_source: self.delete_source,
            durability: None,
            prepare_seqno: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommittedState, StoredValue, TempKind};
    use crate::item::{DocKey, Item, Vbid};

    #[test]
    fn from_item_marks_mutation_committed() {
        let item = Item::mutation(Vbid(0), DocKey::plain("k"), b"v".to_vec());
        let v = StoredValue::from_item(&item);
        assert_eq!(v.committed, CommittedState::CommittedViaMutation);
        assert!(v.is_live());
        assert!(v.resident);
        assert!(v.dirty);
    }

    #[test]
    fn temp_markers_have_no_seqno_and_never_dirty() {
        let v = StoredValue::temp_marker(DocKey::plain("k"), TempKind::Init);
        assert!(v.is_temp());
        assert_eq!(v.by_seqno, 0);
        assert!(!v.dirty);
        let v = StoredValue::temp_marker(DocKey::plain("k"), TempKind::NonExistent);
        assert!(v.deleted);
    }

    #[test]
    fn expiry_and_locks_follow_wall_time() {
        let mut v = StoredValue::from_item(&Item::mutation(
            Vbid(0),
            DocKey::plain("k"),
            b"v".to_vec(),
        ));
        v.expiry = 100;
        assert!(!v.is_expired(99));
        assert!(v.is_expired(100));

        v.expiry = 0;
        v.lock_expiry = 50;
        assert!(v.is_locked(49));
        v.refresh_lock(50);
        assert_eq!(v.lock_expiry, 0);
        assert!(!v.is_locked(50));
    }

    #[test]
    fn deleted_values_do_not_expire() {
        let mut v = StoredValue::from_item(&Item::mutation(
            Vbid(0),
            DocKey::plain("k"),
            b"v".to_vec(),
        ));
        v.expiry = 10;
        v.deleted = true;
        assert!(!v.is_expired(1000));
    }
}
