use crate::collections::CollectionId;
use crate::durability::Requirements;
use std::sync::Arc;

/// Partition identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vbid(pub u16);

impl std::fmt::Display for Vbid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vb_{}", self.0)
    }
}

/// A collection-scoped document key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub collection: CollectionId,
    pub key: Vec<u8>,
}

impl DocKey {
    pub fn new(collection: CollectionId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    /// Key in the default collection.
    pub fn plain(key: impl Into<Vec<u8>>) -> Self {
        Self::new(CollectionId::DEFAULT, key)
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}",
            self.collection,
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Value datatype bitflags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Datatype(pub u8);

impl Datatype {
    pub const RAW: Datatype = Datatype(0);
    pub const JSON: Datatype = Datatype(1);
    pub const SNAPPY: Datatype = Datatype(2);
    pub const XATTR: Datatype = Datatype(4);

    pub fn contains(self, other: Datatype) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Datatype) -> Datatype {
        Datatype(self.0 | other.0)
    }
}

/// What an enqueued item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOperation {
    Mutation,
    Deletion,
    Prepare,
    Commit,
    Abort,
    SystemEvent,
    /// Placeholder for checkpoint bookkeeping; never visible to clients.
    Empty,
}

/// Whether a deletion came from a client or from TTL expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteSource {
    #[default]
    Explicit,
    Ttl,
}

/// The serializable form of a stored value, used for queueing into the
/// checkpoint manager and handing to persistence/replication observers.
///
/// `by_seqno` is `None` until the checkpoint manager assigns one.
#[derive(Debug, Clone)]
pub struct Item {
    pub key: DocKey,
    pub vbid: Vbid,
    pub value: Option<Arc<Vec<u8>>>,
    pub datatype: Datatype,
    pub flags: u32,
    /// Absolute expiry, seconds since epoch; 0 means no expiry.
    pub expiry: u32,
    pub cas: u64,
    pub by_seqno: Option<u64>,
    pub rev_seqno: u64,
    pub operation: ItemOperation,
    pub delete_source: DeleteSource,
    /// Durability requirement for `Prepare` items.
    pub durability: Option<Requirements>,
    /// For `Commit`/`Abort` items, the seqno of the prepare they resolve.
    pub prepare_seqno: Option<u64>,
}

impl Item {
    pub fn mutation(vbid: Vbid, key: DocKey, value: Vec<u8>) -> Self {
        Self {
            key,
            vbid,
            value: Some(Arc::new(value)),
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: 0,
            by_seqno: None,
            rev_seqno: 1,
            operation: ItemOperation::Mutation,
            delete_source: DeleteSource::Explicit,
            durability: None,
            prepare_seqno: None,
        }
    }

    pub fn deletion(vbid: Vbid, key: DocKey, source: DeleteSource) -> Self {
        Self {
            key,
            vbid,
            value: None,
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: 0,
            by_seqno: None,
            rev_seqno: 1,
            operation: ItemOperation::Deletion,
            delete_source: source,
            durability: None,
            prepare_seqno: None,
        }
    }

    pub fn commit(vbid: Vbid, key: DocKey, prepare_seqno: u64) -> Self {
        Self {
            key,
            vbid,
            value: None,
            datatype: Datatype::RAW,
            flags: 0,
            expiry: 0,
            cas: 0,
            by_seqno: None,
            rev_seqno: 1,
            operation: ItemOperation::Commit,
            delete_source: DeleteSource::Explicit,
            durability: None,
            prepare_seqno: Some(prepare_seqno),
        }
    }

    pub fn abort(vbid: Vbid, key: DocKey, prepare_seqno: u64) -> Self {
        Self {
            operation: ItemOperation::Abort,
            ..Self::commit(vbid, key, prepare_seqno)
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self.operation,
            ItemOperation::Deletion | ItemOperation::Abort
        )
    }

    pub fn is_committed(&self) -> bool {
        matches!(
            self.operation,
            ItemOperation::Mutation | ItemOperation::Deletion | ItemOperation::Commit
        )
    }

    pub fn is_pending(&self) -> bool {
        self.operation == ItemOperation::Prepare
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    /// Approximate in-memory footprint, used for admission and queue
    /// accounting.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Item>() + self.key.len() + self.value_len()
    }
}
