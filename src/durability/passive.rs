use crate::durability::{Level, ResolutionAction, SyncWrite, SyncWriteTimeout};
use crate::error::EpkvError;
use crate::item::{DocKey, Vbid};
use std::collections::VecDeque;

/// Durability monitor for a `Replica`/`Pending` partition.
///
/// Tracks prepares seen in replica snapshots and advances the high
/// prepared seqno from local persistence alone; the resulting HPS is what
/// the partition acks back to the active. Expiry of prepares is the
/// active's job, so tracked writes carry no deadline here.
#[derive(Debug)]
pub struct PassiveDurabilityMonitor {
    vbid: Vbid,
    tracked: VecDeque<SyncWrite>,
    high_prepared_seqno: u64,
    high_completed_seqno: u64,
    last_persisted_seqno: u64,
    last_tracked_seqno: u64,
}

impl PassiveDurabilityMonitor {
    pub fn new(vbid: Vbid) -> Self {
        Self {
            vbid,
            tracked: VecDeque::new(),
            high_prepared_seqno: 0,
            high_completed_seqno: 0,
            last_persisted_seqno: 0,
            last_tracked_seqno: 0,
        }
    }

    /// Take over the tracked set of an active monitor when this partition
    /// is demoted. Client cookies do not cross the transition; the
    /// coordinator completes them before handing the monitor over.
    pub fn from_active(adm: super::active::ActiveDurabilityMonitor) -> Self {
        let (vbid, tracked, high_prepared_seqno, last_persisted_seqno) = adm.into_parts();
        let last_tracked_seqno = tracked.back().map(|w| w.by_seqno).unwrap_or(0);
        let tracked = tracked
            .into_iter()
            .map(|w| SyncWrite {
                deadline: None,
                cookie: None,
                ..w
            })
            .collect();
        Self {
            vbid,
            tracked,
            high_prepared_seqno,
            high_completed_seqno: 0,
            last_persisted_seqno,
            last_tracked_seqno,
        }
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    pub fn high_prepared_seqno(&self) -> u64 {
        self.high_prepared_seqno
    }

    pub fn high_completed_seqno(&self) -> u64 {
        self.high_completed_seqno
    }

    pub(super) fn into_parts(self) -> (Vbid, VecDeque<SyncWrite>, u64, u64) {
        (
            self.vbid,
            self.tracked,
            self.high_prepared_seqno,
            self.last_persisted_seqno,
        )
    }

    /// Track a prepare received in a replica snapshot. The timeout must be
    /// the explicit one the active resolved; it is recorded nowhere
    /// because replicas never expire prepares.
    pub fn add_sync_write(
        &mut self,
        key: DocKey,
        by_seqno: u64,
        level: Level,
        _timeout: SyncWriteTimeout,
    ) -> Result<(), EpkvError> {
        if by_seqno <= self.last_tracked_seqno {
            return Err(EpkvError::invariant(format!(
                "{}: replica prepare seqno {by_seqno} not above {}",
                self.vbid, self.last_tracked_seqno
            )));
        }
        self.last_tracked_seqno = by_seqno;
        self.tracked.push_back(SyncWrite {
            key,
            by_seqno,
            level,
            deadline: None,
            cookie: None,
        });
        self.update_high_prepared_seqno();
        Ok(())
    }

    /// Apply a commit or abort sent by the active. Completions arrive in
    /// seqno order; completing anything but the oldest tracked prepare is
    /// an invariant violation. Re-applying a completion already processed
    /// is a no-op.
    pub fn complete_sync_write(
        &mut self,
        key: &DocKey,
        action: ResolutionAction,
        prepare_seqno: u64,
    ) -> Result<(), EpkvError> {
        if prepare_seqno <= self.high_completed_seqno {
            // Duplicate delivery of an already-completed resolution.
            return Ok(());
        }
        let Some(front) = self.tracked.front() else {
            return Err(EpkvError::invariant(format!(
                "{}: {action:?} for prepare seqno {prepare_seqno} but nothing is tracked",
                self.vbid
            )));
        };
        if front.by_seqno != prepare_seqno || &front.key != key {
            return Err(EpkvError::invariant(format!(
                "{}: out-of-order {action:?} for prepare seqno {prepare_seqno}, oldest tracked is {} ({})",
                self.vbid,
                front.by_seqno,
                front.key
            )));
        }
        self.tracked.pop_front();
        self.high_completed_seqno = prepare_seqno;
        // Completion of an unpersisted fence unblocks the HPS walk.
        self.update_high_prepared_seqno();
        Ok(())
    }

    /// The local flusher moved the persistence seqno. Returns the new high
    /// prepared seqno when it advanced, for the coordinator to ack back to
    /// the active.
    pub fn notify_local_persistence(&mut self, persisted_seqno: u64) -> Option<u64> {
        self.last_persisted_seqno = self.last_persisted_seqno.max(persisted_seqno);
        let before = self.high_prepared_seqno;
        self.update_high_prepared_seqno();
        (self.high_prepared_seqno > before).then_some(self.high_prepared_seqno)
    }

    /// On a replica only `PersistToMajority` fences the walk; persist-on
    /// -master concerns the active's disk, not ours.
    fn update_high_prepared_seqno(&mut self) {
        let mut hps = self.high_prepared_seqno;
        for w in &self.tracked {
            if w.by_seqno <= hps {
                continue;
            }
            if w.level == Level::PersistToMajority && self.last_persisted_seqno < w.by_seqno {
                break;
            }
            hps = w.by_seqno;
        }
        self.high_prepared_seqno = hps;
    }
}
