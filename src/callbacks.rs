use crate::error::Status;
use crate::item::{Item, Vbid};

/// Opaque handle for a waiting client connection. The host owns the client
/// lifetime; the engine only passes the handle back through notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(pub u64);

/// Payload of a new-seqno notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqnoNotification {
    pub by_seqno: u64,
    pub item_count_delta: i64,
    pub notify_flusher: bool,
    pub notify_replication: bool,
}

/// Host-facing observer interface.
///
/// All methods are invoked with no engine locks held. Default
/// implementations are no-ops so hosts implement only what they consume.
pub trait VBucketObserver: Send + Sync {
    /// A new seqno was assigned in the partition.
    fn new_seqno(&self, _vbid: Vbid, _notification: SeqnoNotification) {}

    /// A sync write completed (committed, aborted, or failed) for a waiting
    /// client.
    fn sync_write_complete(&self, _cookie: Cookie, _result: Status) {}

    /// Emitted by a replica partition to signal its high prepared seqno
    /// back to the active.
    fn seqno_ack(&self, _vbid: Vbid, _seqno: u64) {}

    /// A transient operation previously parked with `Ewouldblock` can now
    /// be retried by the client.
    fn notify_io_complete(&self, _cookie: Cookie, _result: Status) {}

    /// Called immediately before a write becomes visible; may rewrite the
    /// document body.
    fn pre_link_document(&self, _item: &mut Item) {}
}

/// Observer that ignores everything; useful as a default and in tests that
/// do not inspect notifications.
#[derive(Debug, Default)]
pub struct NullObserver;

impl VBucketObserver for NullObserver {}
