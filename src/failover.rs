use rand::Rng;
use serde::Serialize;

/// One branch of partition history: the uuid identifies the branch, the
/// seqno is where that branch began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailoverEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// Ordered history of partition branches, newest first. The head is the
/// current branch. Replicas compare their table against the active's to
/// detect divergence and compute a rollback point.
#[derive(Debug, Clone)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
    max_entries: usize,
}

impl FailoverTable {
    pub fn new(max_entries: usize) -> Self {
        let mut table = Self {
            entries: Vec::new(),
            max_entries,
        };
        table.create_entry(0);
        table
    }

    /// Rebuild from persisted entries, newest first. Empty input gets a
    /// fresh branch.
    pub fn from_entries(entries: Vec<FailoverEntry>, max_entries: usize) -> Self {
        let mut table = Self {
            entries,
            max_entries,
        };
        if table.entries.is_empty() {
            table.create_entry(0);
        }
        table
    }

    pub fn current_uuid(&self) -> u64 {
        self.entries.first().map(|e| e.uuid).unwrap_or(0)
    }

    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Open a new branch at `high_seqno`. Entries that claim history above
    /// the branch point are no longer reachable and are dropped first.
    pub fn create_entry(&mut self, high_seqno: u64) {
        self.entries.retain(|e| e.seqno <= high_seqno);
        self.entries.insert(
            0,
            FailoverEntry {
                uuid: random_uuid(),
                seqno: high_seqno,
            },
        );
        self.entries.truncate(self.max_entries);
    }

    /// Drop entries beginning above `seqno`. Used by rollback.
    pub fn prune_above(&mut self, seqno: u64) {
        self.entries.retain(|e| e.seqno <= seqno);
        if self.entries.is_empty() {
            self.create_entry(seqno);
        }
    }

    /// Does the pair `(uuid, seqno)` lie on our history?
    ///
    /// The uuid must name one of our branches and `seqno` must fall inside
    /// that branch's seqno span (branch start up to the start of the next
    /// newer branch, unbounded for the head).
    pub fn contains(&self, uuid: u64, seqno: u64) -> bool {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.uuid != uuid {
                continue;
            }
            let branch_end = if idx == 0 {
                u64::MAX
            } else {
                self.entries[idx - 1].seqno
            };
            return seqno >= entry.seqno && seqno <= branch_end;
        }
        false
    }

    /// Latest seqno at or below `remote_seqno` shared with a peer whose
    /// head is `(remote_uuid, remote_seqno)`. `None` when no common branch
    /// exists and the peer must restart from zero.
    pub fn find_rollback_point(&self, remote_uuid: u64, remote_seqno: u64) -> Option<u64> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.uuid != remote_uuid {
                continue;
            }
            let branch_end = if idx == 0 {
                u64::MAX
            } else {
                self.entries[idx - 1].seqno
            };
            return Some(remote_seqno.min(branch_end));
        }
        None
    }

    /// JSON form surfaced through stats.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).unwrap_or_else(|_| "[]".into())
    }
}

fn random_uuid() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let uuid: u64 = rng.gen();
        if uuid != 0 {
            return uuid;
        }
    }
}
