pub mod active;
pub mod passive;
pub mod topology;

pub use active::ActiveDurabilityMonitor;
pub use passive::PassiveDurabilityMonitor;
pub use topology::{ReplicationChain, ReplicationTopology};

use crate::callbacks::Cookie;
use crate::error::Status;
use crate::item::DocKey;
use std::time::{Duration, Instant};

/// Durability level requested for a sync write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    None,
    Majority,
    MajorityAndPersistOnMaster,
    PersistToMajority,
}

impl Level {
    /// True for levels whose prepare must be locally persisted before the
    /// high prepared seqno may advance past it.
    pub fn requires_local_persistence(self) -> bool {
        matches!(
            self,
            Level::MajorityAndPersistOnMaster | Level::PersistToMajority
        )
    }
}

/// Per-prepare timeout. `Infinity` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWriteTimeout {
    Infinity,
    Ms(u64),
}

impl SyncWriteTimeout {
    pub fn deadline_from(self, start: Instant) -> Option<Instant> {
        match self {
            SyncWriteTimeout::Infinity => None,
            SyncWriteTimeout::Ms(ms) => Some(start + Duration::from_millis(ms)),
        }
    }
}

/// A durability requirement: level plus timeout. A `None` timeout means the
/// client left it to the engine; the active applies its configured default,
/// replicas must reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub level: Level,
    pub timeout: Option<SyncWriteTimeout>,
}

impl Requirements {
    pub fn new(level: Level, timeout: Option<SyncWriteTimeout>) -> Result<Self, Status> {
        if level == Level::None {
            return Err(Status::DurabilityInvalidLevel);
        }
        Ok(Self { level, timeout })
    }

    pub fn majority() -> Self {
        Self {
            level: Level::Majority,
            timeout: None,
        }
    }
}

/// An in-flight prepare tracked by a durability monitor.
#[derive(Debug, Clone)]
pub struct SyncWrite {
    pub key: DocKey,
    pub by_seqno: u64,
    pub level: Level,
    /// Resolved wall-clock deadline; `None` for infinite timeouts and for
    /// all replica-tracked prepares (the active owns expiry).
    pub deadline: Option<Instant>,
    /// Client to notify on completion. Replica-side prepares carry none.
    pub cookie: Option<Cookie>,
}

/// How a tracked prepare was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionAction {
    Commit,
    Abort,
}

/// A resolution the durability monitor instructs the coordinator to enact:
/// enqueue the commit/abort item and notify the client.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub key: DocKey,
    pub prepare_seqno: u64,
    pub cookie: Option<Cookie>,
    pub action: ResolutionAction,
}

/// The two monitor variants. `Active` runs quorum tracking and timeouts;
/// `Passive` tracks replica-side prepares and acks its high prepared seqno.
#[derive(Debug)]
pub enum DurabilityMonitor {
    Active(ActiveDurabilityMonitor),
    Passive(PassiveDurabilityMonitor),
}

impl DurabilityMonitor {
    pub fn as_active(&self) -> Option<&ActiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(adm) => Some(adm),
            DurabilityMonitor::Passive(_) => None,
        }
    }

    pub fn as_active_mut(&mut self) -> Option<&mut ActiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(adm) => Some(adm),
            DurabilityMonitor::Passive(_) => None,
        }
    }

    pub fn as_passive_mut(&mut self) -> Option<&mut PassiveDurabilityMonitor> {
        match self {
            DurabilityMonitor::Active(_) => None,
            DurabilityMonitor::Passive(pdm) => Some(pdm),
        }
    }

    pub fn num_tracked(&self) -> usize {
        match self {
            DurabilityMonitor::Active(adm) => adm.num_tracked(),
            DurabilityMonitor::Passive(pdm) => pdm.num_tracked(),
        }
    }

    pub fn high_prepared_seqno(&self) -> u64 {
        match self {
            DurabilityMonitor::Active(adm) => adm.high_prepared_seqno(),
            DurabilityMonitor::Passive(pdm) => pdm.high_prepared_seqno(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Level, Requirements, SyncWriteTimeout};
    use crate::error::Status;
    use std::time::{Duration, Instant};

    #[test]
    fn level_none_is_not_a_requirement() {
        assert_eq!(
            Requirements::new(Level::None, None).unwrap_err(),
            Status::DurabilityInvalidLevel
        );
        assert!(Requirements::new(Level::Majority, None).is_ok());
    }

    #[test]
    fn infinite_timeout_has_no_deadline() {
        let start = Instant::now();
        assert_eq!(SyncWriteTimeout::Infinity.deadline_from(start), None);
        assert_eq!(
            SyncWriteTimeout::Ms(250).deadline_from(start),
            Some(start + Duration::from_millis(250))
        );
    }

    #[test]
    fn persistence_gating_levels() {
        assert!(!Level::Majority.requires_local_persistence());
        assert!(Level::MajorityAndPersistOnMaster.requires_local_persistence());
        assert!(Level::PersistToMajority.requires_local_persistence());
    }
}
