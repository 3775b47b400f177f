use thiserror::Error;

/// Stable operation result codes surfaced to callers.
///
/// These are part of the external interface: the string form returned by
/// [`Status::as_str`] must never change for an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyEnoent,
    KeyEexists,
    NotStored,
    Enomem,
    NotMyVbucket,
    Ewouldblock,
    Einval,
    Locked,
    LockedTmpfail,
    Tmpfail,
    PredicateFailed,
    SyncWriteInProgress,
    SyncWritePending,
    SyncWriteAmbiguous,
    SyncWriteReCommitInProgress,
    DurabilityImpossible,
    DurabilityInvalidLevel,
    Rollback,
    KeyEaccess,
    NotSupported,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::KeyEnoent => "key_enoent",
            Status::KeyEexists => "key_eexists",
            Status::NotStored => "not_stored",
            Status::Enomem => "enomem",
            Status::NotMyVbucket => "not_my_vbucket",
            Status::Ewouldblock => "ewouldblock",
            Status::Einval => "einval",
            Status::Locked => "locked",
            Status::LockedTmpfail => "locked_tmpfail",
            Status::Tmpfail => "tmpfail",
            Status::PredicateFailed => "predicate_failed",
            Status::SyncWriteInProgress => "sync_write_in_progress",
            Status::SyncWritePending => "sync_write_pending",
            Status::SyncWriteAmbiguous => "sync_write_ambiguous",
            Status::SyncWriteReCommitInProgress => "sync_write_re_commit_in_progress",
            Status::DurabilityImpossible => "durability_impossible",
            Status::DurabilityInvalidLevel => "durability_invalid_level",
            Status::Rollback => "rollback",
            Status::KeyEaccess => "key_eaccess",
            Status::NotSupported => "not_supported",
        }
    }

    /// True for conditions the caller is expected to retry after an
    /// IO-complete (or equivalent) notification.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Status::Ewouldblock | Status::LockedTmpfail | Status::Tmpfail
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal crate errors.
///
/// `Invariant` marks a broken internal guarantee (non-monotonic seqno,
/// regressed ack, pending value evicted). Callers must never translate it
/// into a [`Status`]; it is logged and propagated.
#[derive(Debug, Error)]
pub enum EpkvError {
    #[error("invariant violated: {message}")]
    Invariant { message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid replication topology: {0}")]
    InvalidTopology(String),
    #[error("invalid collections manifest: {0}")]
    InvalidManifest(String),
}

impl EpkvError {
    pub fn invariant(message: impl Into<String>) -> Self {
        EpkvError::Invariant {
            message: message.into(),
        }
    }
}
