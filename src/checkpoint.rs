use crate::error::EpkvError;
use crate::item::{DocKey, Item, ItemOperation, Vbid};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Whether `queue_dirty` assigns the next seqno or trusts the one already
/// on the item (replica/backfill paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateBySeqno {
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    Open,
    Closed,
}

/// An append-only batch of items in seqno order; the unit of cursor
/// advance.
#[derive(Debug)]
pub struct Checkpoint {
    pub id: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
    pub state: CheckpointState,
    items: Vec<Item>,
    /// Open-checkpoint dedup index for plain mutations and deletions.
    key_index: HashMap<DocKey, usize>,
    mem_usage: usize,
}

impl Checkpoint {
    fn new(id: u64, snapshot_start: u64, snapshot_end: u64) -> Self {
        Self {
            id,
            snapshot_start,
            snapshot_end,
            state: CheckpointState::Open,
            items: Vec::new(),
            key_index: HashMap::new(),
            mem_usage: 0,
        }
    }

    pub fn num_items(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    fn close(&mut self) {
        self.state = CheckpointState::Closed;
        self.key_index.clear();
    }

    /// Append or dedup-replace. Returns the item-count delta (0 on
    /// replacement).
    fn push(&mut self, item: Item) -> i64 {
        self.mem_usage += item.size();
        let dedupable = matches!(
            item.operation,
            ItemOperation::Mutation | ItemOperation::Deletion
        );
        if dedupable {
            if let Some(&idx) = self.key_index.get(&item.key) {
                self.mem_usage = self.mem_usage.saturating_sub(self.items[idx].size());
                self.items[idx] = item;
                return 0;
            }
            self.key_index.insert(item.key.clone(), self.items.len());
        }
        self.items.push(item);
        1
    }
}

/// Result of a `queue_dirty` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueResult {
    pub by_seqno: u64,
    /// True when this enqueue made the persistence backlog non-empty.
    pub notify_flusher: bool,
    pub item_count_delta: i64,
}

/// Items handed to the persistence cursor.
#[derive(Debug)]
pub struct ItemsForCursor {
    pub items: Vec<Item>,
    pub range_start: u64,
    pub range_end: u64,
    pub more_available: bool,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    /// Checkpoints at or below this id have been fully consumed.
    consumed_through_id: u64,
}

#[derive(Debug)]
struct Inner {
    checkpoints: VecDeque<Checkpoint>,
    next_seqno: u64,
    persistence_cursor: Cursor,
    replication_cursors: HashMap<String, Cursor>,
    max_items_per_checkpoint: usize,
    /// Items not yet consumed by the persistence cursor.
    backlog: usize,
}

/// Ordered seqno log feeding persistence and replication.
///
/// Seqnos strictly increase on enqueue; checkpoints are released to cursors
/// only whole, so a cursor never observes a partial checkpoint.
#[derive(Debug)]
pub struct CheckpointManager {
    vbid: Vbid,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new(vbid: Vbid, max_items_per_checkpoint: usize) -> Self {
        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(Checkpoint::new(1, 1, 1));
        Self {
            vbid,
            inner: Mutex::new(Inner {
                checkpoints,
                next_seqno: 1,
                persistence_cursor: Cursor {
                    consumed_through_id: 0,
                },
                replication_cursors: HashMap::new(),
                max_items_per_checkpoint,
                backlog: 0,
            }),
        }
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn high_seqno(&self) -> u64 {
        self.inner.lock().next_seqno - 1
    }

    pub fn open_checkpoint_id(&self) -> u64 {
        let inner = self.inner.lock();
        inner.checkpoints.back().map(|c| c.id).unwrap_or(0)
    }

    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    pub fn num_items_for_persistence(&self) -> usize {
        self.inner.lock().backlog
    }

    pub fn mem_usage(&self) -> usize {
        self.inner
            .lock()
            .checkpoints
            .iter()
            .map(|c| c.mem_usage)
            .sum()
    }

    /// Enqueue `item`, assigning its seqno when asked. Strict monotonicity
    /// of seqnos is an invariant; a violation indicates a bug upstream.
    pub fn queue_dirty(
        &self,
        item: &mut Item,
        generate: GenerateBySeqno,
    ) -> Result<QueueResult, EpkvError> {
        let mut inner = self.inner.lock();
        let seqno = match generate {
            GenerateBySeqno::Yes => {
                let seqno = inner.next_seqno;
                item.by_seqno = Some(seqno);
                seqno
            }
            GenerateBySeqno::No => {
                let seqno = item.by_seqno.ok_or_else(|| {
                    EpkvError::invariant(format!(
                        "{}: item queued without seqno and without generation",
                        self.vbid
                    ))
                })?;
                if seqno < inner.next_seqno {
                    return Err(EpkvError::invariant(format!(
                        "{}: non-monotonic seqno {seqno}, expected >= {}",
                        self.vbid, inner.next_seqno
                    )));
                }
                seqno
            }
        };
        inner.next_seqno = seqno + 1;

        inner.maybe_rotate_open_checkpoint(seqno);
        let open = inner
            .checkpoints
            .back_mut()
            .ok_or_else(|| EpkvError::invariant(format!("{}: no open checkpoint", self.vbid)))?;
        open.snapshot_end = open.snapshot_end.max(seqno);
        let delta = open.push(item.clone());

        let was_empty = inner.backlog == 0;
        if delta > 0 {
            inner.backlog += 1;
        }
        Ok(QueueResult {
            by_seqno: seqno,
            notify_flusher: was_empty,
            item_count_delta: delta,
        })
    }

    /// Drain whole checkpoints for persistence, up to roughly `limit`
    /// items (always at least one checkpoint when anything is pending).
    /// The open checkpoint is closed first if it holds items.
    pub fn get_items_for_persistence(&self, limit: usize) -> ItemsForCursor {
        let mut inner = self.inner.lock();
        inner.close_open_checkpoint_if_dirty();

        let mut items = Vec::new();
        let mut range_start = u64::MAX;
        let mut range_end = 0;
        let consumed_from = inner.persistence_cursor.consumed_through_id;
        let mut consumed_through = consumed_from;
        for checkpoint in &inner.checkpoints {
            if checkpoint.id <= consumed_from || checkpoint.state == CheckpointState::Open {
                continue;
            }
            if !items.is_empty() && items.len() + checkpoint.num_items() > limit {
                break;
            }
            range_start = range_start.min(checkpoint.snapshot_start);
            range_end = range_end.max(checkpoint.snapshot_end);
            items.extend(checkpoint.items().iter().cloned());
            consumed_through = checkpoint.id;
        }
        inner.persistence_cursor.consumed_through_id = consumed_through;
        inner.backlog = inner.backlog.saturating_sub(items.len());
        let more_available = inner
            .checkpoints
            .iter()
            .any(|c| c.id > consumed_through && c.state == CheckpointState::Closed);
        inner.release_consumed_checkpoints();
        ItemsForCursor {
            items,
            range_start: if range_start == u64::MAX {
                0
            } else {
                range_start
            },
            range_end,
            more_available,
        }
    }

    /// Register a named replication cursor at the oldest retained
    /// checkpoint.
    pub fn register_replication_cursor(&self, name: impl Into<String>) {
        let mut inner = self.inner.lock();
        let oldest = inner.checkpoints.front().map(|c| c.id).unwrap_or(1);
        inner.replication_cursors.insert(
            name.into(),
            Cursor {
                consumed_through_id: oldest.saturating_sub(1),
            },
        );
    }

    pub fn remove_replication_cursor(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.replication_cursors.remove(name);
        inner.release_consumed_checkpoints();
    }

    /// Drain whole closed checkpoints for one replication cursor.
    pub fn get_items_for_replication(&self, name: &str, limit: usize) -> ItemsForCursor {
        let mut inner = self.inner.lock();
        inner.close_open_checkpoint_if_dirty();
        let Some(cursor) = inner.replication_cursors.get(name).copied() else {
            return ItemsForCursor {
                items: Vec::new(),
                range_start: 0,
                range_end: 0,
                more_available: false,
            };
        };
        let mut items = Vec::new();
        let mut range_start = u64::MAX;
        let mut range_end = 0;
        let mut consumed_through = cursor.consumed_through_id;
        for checkpoint in &inner.checkpoints {
            if checkpoint.id <= cursor.consumed_through_id
                || checkpoint.state == CheckpointState::Open
            {
                continue;
            }
            if !items.is_empty() && items.len() + checkpoint.num_items() > limit {
                break;
            }
            range_start = range_start.min(checkpoint.snapshot_start);
            range_end = range_end.max(checkpoint.snapshot_end);
            items.extend(checkpoint.items().iter().cloned());
            consumed_through = checkpoint.id;
        }
        if let Some(cursor) = inner.replication_cursors.get_mut(name) {
            cursor.consumed_through_id = consumed_through;
        }
        let more_available = inner
            .checkpoints
            .iter()
            .any(|c| c.id > consumed_through && c.state == CheckpointState::Closed);
        inner.release_consumed_checkpoints();
        ItemsForCursor {
            items,
            range_start: if range_start == u64::MAX {
                0
            } else {
                range_start
            },
            range_end,
            more_available,
        }
    }

    /// Wipe everything and reopen a fresh checkpoint at id 1 whose seqnos
    /// continue from `high_seqno`. Rollback support.
    pub fn clear(&self, high_seqno: u64) {
        let mut inner = self.inner.lock();
        inner.checkpoints.clear();
        inner.next_seqno = high_seqno + 1;
        inner
            .checkpoints
            .push_back(Checkpoint::new(1, high_seqno, high_seqno));
        inner.persistence_cursor.consumed_through_id = 0;
        for cursor in inner.replication_cursors.values_mut() {
            cursor.consumed_through_id = 0;
        }
        inner.backlog = 0;
    }

    pub fn set_open_checkpoint_id(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(open) = inner.checkpoints.back_mut() {
            open.id = id;
        }
    }

    /// Re-anchor the open checkpoint's snapshot range at the current high
    /// seqno (replica rejoining a stream, rollback completion).
    pub fn reset_snapshot_range(&self) {
        let mut inner = self.inner.lock();
        let high = inner.next_seqno - 1;
        if let Some(open) = inner.checkpoints.back_mut() {
            open.snapshot_start = high;
            open.snapshot_end = high;
        }
    }

    /// Open a checkpoint carrying a replica snapshot range.
    pub fn create_snapshot(&self, snapshot_start: u64, snapshot_end: u64) {
        let mut inner = self.inner.lock();
        let next_id = inner.checkpoints.back().map(|c| c.id + 1).unwrap_or(1);
        if let Some(open) = inner.checkpoints.back_mut() {
            if open.num_items() == 0 {
                open.snapshot_start = snapshot_start;
                open.snapshot_end = snapshot_end;
                return;
            }
            open.close();
        }
        inner
            .checkpoints
            .push_back(Checkpoint::new(next_id, snapshot_start, snapshot_end));
    }

    pub fn snapshot_range(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        inner
            .checkpoints
            .back()
            .map(|c| (c.snapshot_start, c.snapshot_end))
            .unwrap_or((0, 0))
    }
}

impl Inner {
    fn maybe_rotate_open_checkpoint(&mut self, next_seqno: u64) {
        let rotate = self
            .checkpoints
            .back()
            .map(|c| c.state == CheckpointState::Closed || c.num_items() >= self.max_items_per_checkpoint)
            .unwrap_or(true);
        if rotate {
            let next_id = self.checkpoints.back().map(|c| c.id + 1).unwrap_or(1);
            if let Some(open) = self.checkpoints.back_mut() {
                if open.state == CheckpointState::Open {
                    open.close();
                }
            }
            self.checkpoints
                .push_back(Checkpoint::new(next_id, next_seqno, next_seqno));
        }
    }

    fn close_open_checkpoint_if_dirty(&mut self) {
        let needs_close = self
            .checkpoints
            .back()
            .map(|c| c.state == CheckpointState::Open && c.num_items() > 0)
            .unwrap_or(false);
        if needs_close {
            let next_seqno = self.next_seqno;
            let next_id = self.checkpoints.back().map(|c| c.id + 1).unwrap_or(1);
            if let Some(open) = self.checkpoints.back_mut() {
                open.close();
            }
            self.checkpoints
                .push_back(Checkpoint::new(next_id, next_seqno, next_seqno));
        }
    }

    /// Checkpoints all cursors have passed hold no referenced items.
    fn release_consumed_checkpoints(&mut self) {
        let mut floor = self.persistence_cursor.consumed_through_id;
        for cursor in self.replication_cursors.values() {
            floor = floor.min(cursor.consumed_through_id);
        }
        while let Some(front) = self.checkpoints.front() {
            if front.state == CheckpointState::Closed && front.id <= floor {
                self.checkpoints.pop_front();
            } else {
                break;
            }
        }
    }
}
