use crate::callbacks::Cookie;
use crate::durability::topology::ReplicationTopology;
use crate::durability::{Level, Resolution, ResolutionAction, SyncWrite};
use crate::error::{EpkvError, Status};
use crate::item::{DocKey, Vbid};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::warn;

/// Replication positions tracked per node.
///
/// `last_write_seqno` is the highest tracked prepare the node is known to
/// have written (for the active itself this is the high prepared seqno);
/// `last_ack_seqno` is the raw seqno the node last acknowledged. Both are
/// monotonic; only a topology change may reset them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodePosition {
    pub last_write_seqno: u64,
    pub last_ack_seqno: u64,
}

/// Durability monitor for an `Active` partition: tracks in-flight prepares,
/// replica ack positions, and decides commit/abort.
#[derive(Debug)]
pub struct ActiveDurabilityMonitor {
    vbid: Vbid,
    topology: Option<ReplicationTopology>,
    positions: HashMap<String, NodePosition>,
    tracked: VecDeque<SyncWrite>,
    high_prepared_seqno: u64,
    high_committed_seqno: u64,
    last_persisted_seqno: u64,
    last_tracked_seqno: u64,
    accepted_count: u64,
    committed_count: u64,
    aborted_count: u64,
}

impl ActiveDurabilityMonitor {
    /// Monitor with no topology yet (warm-up). Durable writes are refused
    /// until a topology is installed.
    pub fn new(vbid: Vbid) -> Self {
        Self {
            vbid,
            topology: None,
            positions: HashMap::new(),
            tracked: VecDeque::new(),
            high_prepared_seqno: 0,
            high_committed_seqno: 0,
            last_persisted_seqno: 0,
            last_tracked_seqno: 0,
            accepted_count: 0,
            committed_count: 0,
            aborted_count: 0,
        }
    }

    pub fn with_topology(vbid: Vbid, topology: ReplicationTopology) -> Self {
        let mut adm = Self::new(vbid);
        adm.set_replication_topology(topology);
        adm
    }

    /// Take over the prepares a passive monitor was tracking when this
    /// partition is promoted. Positions start empty; the new replicas must
    /// ack from scratch.
    pub fn from_passive(
        pdm: super::passive::PassiveDurabilityMonitor,
        topology: Option<ReplicationTopology>,
    ) -> Self {
        let (vbid, tracked, high_prepared_seqno, last_persisted_seqno) = pdm.into_parts();
        let last_tracked_seqno = tracked.back().map(|w| w.by_seqno).unwrap_or(0);
        let mut adm = Self {
            tracked,
            high_prepared_seqno,
            last_persisted_seqno,
            last_tracked_seqno,
            ..Self::new(vbid)
        };
        if let Some(topology) = topology {
            adm.set_replication_topology(topology);
        }
        adm
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn topology(&self) -> Option<&ReplicationTopology> {
        self.topology.as_ref()
    }

    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    pub fn high_prepared_seqno(&self) -> u64 {
        self.high_prepared_seqno
    }

    pub fn high_committed_seqno(&self) -> u64 {
        self.high_committed_seqno
    }

    pub fn last_persisted_seqno(&self) -> u64 {
        self.last_persisted_seqno
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted_count
    }

    pub fn committed_count(&self) -> u64 {
        self.committed_count
    }

    pub fn aborted_count(&self) -> u64 {
        self.aborted_count
    }

    pub fn node_position(&self, node: &str) -> Option<NodePosition> {
        self.positions.get(node).copied()
    }

    /// Tracked prepares in seqno order; state-handoff and stats.
    pub fn tracked_writes(&self) -> impl Iterator<Item = &SyncWrite> {
        self.tracked.iter()
    }

    pub(super) fn into_parts(self) -> (Vbid, VecDeque<SyncWrite>, u64, u64) {
        (
            self.vbid,
            self.tracked,
            self.high_prepared_seqno,
            self.last_persisted_seqno,
        )
    }

    /// Install a new topology. Positions survive for nodes present in both
    /// the old and new chain sets; departed nodes are dropped. Tracked
    /// writes are immediately re-checked against the new chains.
    pub fn set_replication_topology(&mut self, topology: ReplicationTopology) -> Vec<Resolution> {
        self.positions
            .retain(|node, _| topology.contains(node.as_str()));
        for node in topology.chains().iter().flat_map(|c| c.defined_nodes()) {
            self.positions.entry(node.to_string()).or_default();
        }
        self.topology = Some(topology);
        self.refresh_active_position();
        self.sweep_commits()
    }

    /// Register a durable prepare. Fails when any chain cannot reach
    /// majority (or no topology is installed at all).
    ///
    /// Returns the resolutions that became possible immediately; with a
    /// single-node chain a `Majority` prepare commits on registration.
    pub fn add_sync_write(
        &mut self,
        key: DocKey,
        by_seqno: u64,
        level: Level,
        deadline: Option<Instant>,
        cookie: Option<Cookie>,
    ) -> Result<Vec<Resolution>, Status> {
        let Some(topology) = &self.topology else {
            return Err(Status::DurabilityImpossible);
        };
        if !topology.durability_possible() {
            return Err(Status::DurabilityImpossible);
        }
        if level == Level::None {
            return Err(Status::DurabilityInvalidLevel);
        }
        debug_assert!(
            by_seqno > self.last_tracked_seqno,
            "prepare seqno must advance"
        );
        self.last_tracked_seqno = by_seqno;
        self.tracked.push_back(SyncWrite {
            key,
            by_seqno,
            level,
            deadline,
            cookie,
        });
        self.accepted_count += 1;
        self.update_high_prepared_seqno();
        Ok(self.sweep_commits())
    }

    /// Apply a replica's seqno ack. Acks from nodes outside the topology
    /// are ignored (the topology may have changed under the sender); a
    /// regressing ack from a known node is an invariant violation.
    pub fn seqno_ack_received(
        &mut self,
        node: &str,
        ack_seqno: u64,
    ) -> Result<Vec<Resolution>, EpkvError> {
        let in_topology = self
            .topology
            .as_ref()
            .map(|t| t.contains(node))
            .unwrap_or(false);
        if !in_topology {
            warn!(vb = %self.vbid, node, ack_seqno, "ignoring seqno ack from unknown node");
            return Ok(Vec::new());
        }
        let write_floor = self.highest_tracked_at_or_below(ack_seqno);
        let position = self.positions.entry(node.to_string()).or_default();
        if ack_seqno < position.last_ack_seqno {
            return Err(EpkvError::invariant(format!(
                "{}: seqno ack regressed on node '{node}': {ack_seqno} < {}",
                self.vbid, position.last_ack_seqno
            )));
        }
        position.last_ack_seqno = ack_seqno;
        position.last_write_seqno = position.last_write_seqno.max(write_floor);
        Ok(self.sweep_commits())
    }

    /// The local flusher moved the persistence seqno.
    pub fn notify_local_persistence(&mut self, persisted_seqno: u64) -> Vec<Resolution> {
        self.last_persisted_seqno = self.last_persisted_seqno.max(persisted_seqno);
        self.update_high_prepared_seqno();
        self.sweep_commits()
    }

    /// Abort every tracked prepare whose deadline has passed. The caller
    /// notifies each cookie with `SyncWriteAmbiguous` and enqueues the
    /// abort items.
    pub fn process_timeout(&mut self, as_of: Instant) -> Vec<Resolution> {
        let mut aborted = Vec::new();
        self.tracked.retain(|w| {
            let expired = w.deadline.map(|d| d <= as_of).unwrap_or(false);
            if expired {
                aborted.push(Resolution {
                    key: w.key.clone(),
                    prepare_seqno: w.by_seqno,
                    cookie: w.cookie,
                    action: ResolutionAction::Abort,
                });
            }
            !expired
        });
        self.aborted_count += aborted.len() as u64;
        if !aborted.is_empty() {
            // An unpersisted fence may have been removed.
            self.update_high_prepared_seqno();
        }
        aborted
    }

    /// Drain all tracked prepares, completing their cookies elsewhere.
    /// Used at shutdown and on demotion to replica.
    pub fn drain(&mut self) -> Vec<SyncWrite> {
        self.tracked.drain(..).collect()
    }

    fn highest_tracked_at_or_below(&self, seqno: u64) -> u64 {
        self.tracked
            .iter()
            .take_while(|w| w.by_seqno <= seqno)
            .last()
            .map(|w| w.by_seqno)
            .unwrap_or(0)
    }

    /// Advance the high prepared seqno. Prepares requiring local
    /// persistence fence the walk until the flusher catches up.
    fn update_high_prepared_seqno(&mut self) {
        let mut hps = self.high_prepared_seqno;
        for w in &self.tracked {
            if w.by_seqno <= hps {
                continue;
            }
            if w.level.requires_local_persistence() && self.last_persisted_seqno < w.by_seqno {
                break;
            }
            hps = w.by_seqno;
        }
        self.high_prepared_seqno = hps;
        self.refresh_active_position();
    }

    /// The active acks itself with its high prepared seqno. Its
    /// `last_ack_seqno` stays untouched; acks are a replica concept.
    fn refresh_active_position(&mut self) {
        let Some(topology) = &self.topology else {
            return;
        };
        let hps = self.high_prepared_seqno;
        for chain in topology.chains() {
            let position = self
                .positions
                .entry(chain.active().to_string())
                .or_default();
            position.last_write_seqno = position.last_write_seqno.max(hps);
        }
    }

    /// Commit every tracked prepare whose level is satisfied, oldest
    /// first.
    fn sweep_commits(&mut self) -> Vec<Resolution> {
        let Some(topology) = self.topology.clone() else {
            return Vec::new();
        };
        let mut resolutions = Vec::new();
        let mut idx = 0;
        while idx < self.tracked.len() {
            let satisfied = self.is_satisfied(&self.tracked[idx], &topology);
            if satisfied {
                let w = self.tracked.remove(idx).expect("index in range");
                self.high_committed_seqno = self.high_committed_seqno.max(w.by_seqno);
                self.committed_count += 1;
                resolutions.push(Resolution {
                    key: w.key,
                    prepare_seqno: w.by_seqno,
                    cookie: w.cookie,
                    action: ResolutionAction::Commit,
                });
            } else {
                idx += 1;
            }
        }
        resolutions
    }

    /// A prepare is satisfied when every chain has a majority of nodes
    /// written past it, including the chain's active. The active's write
    /// position is its high prepared seqno, so persist-level prepares
    /// implicitly require local persistence; replica acks past a
    /// persist-fence imply the replica persisted it.
    fn is_satisfied(&self, write: &SyncWrite, topology: &ReplicationTopology) -> bool {
        let seqno = write.by_seqno;
        topology.chains().iter().all(|chain| {
            let active_written = self
                .positions
                .get(chain.active())
                .map(|p| p.last_write_seqno >= seqno)
                .unwrap_or(false);
            if !active_written {
                return false;
            }
            let written = chain
                .defined_nodes()
                .filter(|node| {
                    self.positions
                        .get(*node)
                        .map(|p| p.last_write_seqno >= seqno)
                        .unwrap_or(false)
                })
                .count();
            written >= chain.majority()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::ActiveDurabilityMonitor;
    use crate::durability::topology::ReplicationTopology;
    use crate::durability::{Level, ResolutionAction};
    use crate::error::Status;
    use crate::item::{DocKey, Vbid};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn topology(raw: serde_json::Value) -> ReplicationTopology {
        ReplicationTopology::parse(&raw).unwrap()
    }

    fn adm(raw: serde_json::Value) -> ActiveDurabilityMonitor {
        ActiveDurabilityMonitor::with_topology(Vbid(0), topology(raw))
    }

    fn add(
        adm: &mut ActiveDurabilityMonitor,
        seqno: u64,
        level: Level,
    ) -> Vec<crate::durability::Resolution> {
        adm.add_sync_write(DocKey::plain(format!("k{seqno}")), seqno, level, None, None)
            .expect("add_sync_write")
    }

    #[test]
    fn majority_commit_needs_replica_ack() {
        let mut adm = adm(json!([["a", "b"]]));
        assert!(add(&mut adm, 1, Level::Majority).is_empty());
        assert_eq!(adm.num_tracked(), 1);
        assert_eq!(adm.high_prepared_seqno(), 1);

        let resolutions = adm.seqno_ack_received("b", 1).unwrap();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].action, ResolutionAction::Commit);
        assert_eq!(resolutions[0].prepare_seqno, 1);
        assert_eq!(adm.num_tracked(), 0);
        assert_eq!(adm.high_committed_seqno(), 1);
    }

    #[test]
    fn single_node_chain_commits_on_add() {
        let mut adm = adm(json!([["a"]]));
        let resolutions = add(&mut adm, 1, Level::Majority);
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].action, ResolutionAction::Commit);
        assert_eq!(adm.num_tracked(), 0);
    }

    #[test]
    fn empty_or_undefined_chains_refuse_sync_writes() {
        let mut warm = ActiveDurabilityMonitor::new(Vbid(0));
        assert_eq!(
            warm.add_sync_write(DocKey::plain("k"), 1, Level::Majority, None, None)
                .unwrap_err(),
            Status::DurabilityImpossible
        );

        let mut undef = adm(json!([["a", null]]));
        assert_eq!(
            undef
                .add_sync_write(DocKey::plain("k"), 1, Level::Majority, None, None)
                .unwrap_err(),
            Status::DurabilityImpossible
        );
    }

    #[test]
    fn persist_to_majority_requires_active_persistence() {
        let mut adm = adm(json!([["a", "b", "c"]]));
        for seqno in [1, 3, 5] {
            add(&mut adm, seqno, Level::PersistToMajority);
        }
        assert_eq!(adm.high_prepared_seqno(), 0);

        // Replica acks alone reach numeric majority but the active has not
        // persisted anything yet.
        assert!(adm.seqno_ack_received("b", 10).unwrap().is_empty());
        assert!(adm.seqno_ack_received("c", 10).unwrap().is_empty());
        assert_eq!(adm.num_tracked(), 3);
        assert_eq!(adm.node_position("b").unwrap().last_write_seqno, 5);
        assert_eq!(adm.node_position("b").unwrap().last_ack_seqno, 10);

        let resolutions = adm.notify_local_persistence(10);
        assert_eq!(resolutions.len(), 3);
        assert!(resolutions.iter().all(|r| r.action == ResolutionAction::Commit));
        assert_eq!(adm.high_prepared_seqno(), 5);
        assert_eq!(adm.node_position("a").unwrap().last_write_seqno, 5);
        assert_eq!(adm.node_position("a").unwrap().last_ack_seqno, 0);
    }

    #[test]
    fn persist_fence_stalls_high_prepared_seqno() {
        let mut adm = adm(json!([["a", "b", "c"]]));
        add(&mut adm, 1, Level::Majority);
        add(&mut adm, 2, Level::PersistToMajority);
        add(&mut adm, 3, Level::Majority);
        adm.notify_local_persistence(1);
        assert_eq!(adm.high_prepared_seqno(), 1);

        let r_b = adm.seqno_ack_received("b", 3).unwrap();
        let r_c = adm.seqno_ack_received("c", 3).unwrap();
        // The first prepare has majority (a via HPS, b, c); the fenced ones
        // wait for local persistence.
        assert_eq!(r_b.len() + r_c.len(), 1);
        assert_eq!(adm.num_tracked(), 2);
        assert_eq!(adm.high_prepared_seqno(), 1);

        let resolutions = adm.notify_local_persistence(2);
        assert_eq!(adm.high_prepared_seqno(), 3);
        assert_eq!(resolutions.len(), 2);
        assert_eq!(
            resolutions.iter().map(|r| r.prepare_seqno).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn majority_and_persist_on_master_gates_on_local_disk() {
        let mut adm = adm(json!([["a", "b"]]));
        add(&mut adm, 1, Level::MajorityAndPersistOnMaster);
        assert_eq!(adm.high_prepared_seqno(), 0);
        assert!(adm.seqno_ack_received("b", 1).unwrap().is_empty());

        let resolutions = adm.notify_local_persistence(1);
        assert_eq!(resolutions.len(), 1);
        assert_eq!(adm.high_prepared_seqno(), 1);
    }

    #[test]
    fn ack_regression_is_an_invariant_violation() {
        let mut adm = adm(json!([["a", "b"]]));
        add(&mut adm, 1, Level::Majority);
        adm.seqno_ack_received("b", 5).unwrap();
        assert!(adm.seqno_ack_received("b", 4).is_err());
        // Re-acking the same seqno is fine.
        assert!(adm.seqno_ack_received("b", 5).is_ok());
    }

    #[test]
    fn unknown_node_acks_are_ignored() {
        let mut adm = adm(json!([["a", "b"]]));
        add(&mut adm, 1, Level::Majority);
        assert!(adm.seqno_ack_received("stranger", 99).unwrap().is_empty());
        assert_eq!(adm.num_tracked(), 1);
        assert!(adm.node_position("stranger").is_none());
    }

    #[test]
    fn timeout_aborts_and_preserves_positions() {
        let mut adm = adm(json!([["a", "b"]]));
        let start = Instant::now();
        adm.add_sync_write(
            DocKey::plain("k"),
            1,
            Level::Majority,
            Some(start + Duration::from_millis(1)),
            None,
        )
        .unwrap();
        assert_eq!(adm.high_prepared_seqno(), 1);

        let aborted = adm.process_timeout(start + Duration::from_secs(1));
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].action, ResolutionAction::Abort);
        assert_eq!(aborted[0].prepare_seqno, 1);
        assert_eq!(adm.num_tracked(), 0);
        assert_eq!(adm.aborted_count(), 1);
        assert_eq!(adm.node_position("a").unwrap().last_write_seqno, 1);
    }

    #[test]
    fn infinite_timeout_never_expires() {
        let mut adm = adm(json!([["a", "b"]]));
        adm.add_sync_write(DocKey::plain("k"), 1, Level::Majority, None, None)
            .unwrap();
        let far_future = Instant::now() + Duration::from_secs(100_000);
        assert!(adm.process_timeout(far_future).is_empty());
        assert_eq!(adm.num_tracked(), 1);
    }

    #[test]
    fn two_chains_both_need_majority() {
        let mut adm = adm(json!([["a", "b"], ["a", "c"]]));
        add(&mut adm, 1, Level::Majority);
        assert!(adm.seqno_ack_received("b", 1).unwrap().is_empty());
        let resolutions = adm.seqno_ack_received("c", 1).unwrap();
        assert_eq!(resolutions.len(), 1);
    }

    #[test]
    fn topology_change_keeps_surviving_positions_and_rechecks() {
        let mut adm = adm(json!([["a", "b", "c"]]));
        add(&mut adm, 1, Level::Majority);
        assert!(adm.seqno_ack_received("b", 1).unwrap().is_empty());

        // Chain shrinks to [a, b]: b's ack survives the change and now
        // satisfies the majority, so the prepare commits on the swap.
        let resolutions = adm.set_replication_topology(topology(json!([["a", "b"]])));
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].prepare_seqno, 1);
        // c is gone; its position was dropped.
        assert!(adm.node_position("c").is_none());
        assert!(adm.node_position("b").is_some());
    }

    #[test]
    fn handoff_from_passive_preserves_tracked_and_hps() {
        use crate::durability::passive::PassiveDurabilityMonitor;
        use crate::durability::SyncWriteTimeout;

        let mut pdm = PassiveDurabilityMonitor::new(Vbid(0));
        for seqno in [1, 2, 3] {
            pdm.add_sync_write(
                DocKey::plain(format!("k{seqno}")),
                seqno,
                Level::Majority,
                SyncWriteTimeout::Ms(10_000),
            )
            .unwrap();
        }
        assert_eq!(pdm.high_prepared_seqno(), 3);

        let adm =
            ActiveDurabilityMonitor::from_passive(pdm, Some(topology(json!([["a", "b"]]))));
        assert_eq!(adm.num_tracked(), 3);
        assert_eq!(adm.high_prepared_seqno(), 3);
    }
}
