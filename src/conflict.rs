/// Metadata compared during replication conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictMeta {
    pub cas: u64,
    pub rev_seqno: u64,
    pub expiry: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    Accept,
    Reject,
}

/// Replication conflict resolver.
///
/// `LastWriteWins` orders by CAS (the HLC timestamp) before revision count;
/// `RevisionSeqno` orders by revision count before CAS. In both modes the
/// incoming metadata must be strictly greater: equality means a duplicate
/// delivery and is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictResolver {
    #[default]
    RevisionSeqno,
    LastWriteWins,
}

impl ConflictResolver {
    pub fn resolve(
        self,
        local: ConflictMeta,
        incoming: ConflictMeta,
        local_deleted: bool,
    ) -> ConflictOutcome {
        // A local tombstone never beats incoming data; only meta ordering
        // between two live (or two deleted) versions is interesting.
        let _ = local_deleted;
        let ordering = match self {
            ConflictResolver::LastWriteWins => Self::compare(
                [local.cas, local.rev_seqno, local.expiry as u64, local.flags as u64],
                [
                    incoming.cas,
                    incoming.rev_seqno,
                    incoming.expiry as u64,
                    incoming.flags as u64,
                ],
            ),
            ConflictResolver::RevisionSeqno => Self::compare(
                [local.rev_seqno, local.cas, local.expiry as u64, local.flags as u64],
                [
                    incoming.rev_seqno,
                    incoming.cas,
                    incoming.expiry as u64,
                    incoming.flags as u64,
                ],
            ),
        };
        if ordering == std::cmp::Ordering::Less {
            ConflictOutcome::Accept
        } else {
            ConflictOutcome::Reject
        }
    }

    fn compare(local: [u64; 4], incoming: [u64; 4]) -> std::cmp::Ordering {
        local.cmp(&incoming)
    }
}
