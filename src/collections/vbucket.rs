use crate::collections::events::SystemEventData;
use crate::collections::manifest::Manifest;
use crate::collections::{CollectionId, ScopeId};
use crate::error::EpkvError;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live state of one collection within this partition.
#[derive(Debug)]
pub struct CollectionState {
    pub name: String,
    pub scope: ScopeId,
    pub max_ttl: Option<u32>,
    /// Seqno of the create event; items below it predate the collection.
    pub start_seqno: u64,
    high_seqno: AtomicU64,
    persisted_high_seqno: AtomicU64,
    disk_count: AtomicU64,
}

/// A collection that has been dropped but whose items may still exist on
/// disk until compaction purges them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedCollection {
    pub start_seqno: u64,
    pub end_seqno: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionStats {
    pub high_seqno: u64,
    pub persisted_high_seqno: u64,
    pub disk_count: u64,
}

#[derive(Debug, Default)]
struct Inner {
    manifest_uid: u64,
    collections: HashMap<CollectionId, CollectionState>,
    scopes: HashMap<ScopeId, String>,
    dropped: HashMap<CollectionId, DroppedCollection>,
}

/// This partition's view of the collections namespace, maintained by
/// applying create/drop system events in seqno order.
#[derive(Debug)]
pub struct VbManifest {
    inner: RwLock<Inner>,
}

impl Default for VbManifest {
    fn default() -> Self {
        let mut inner = Inner::default();
        inner.scopes.insert(ScopeId::DEFAULT, "_default".into());
        inner.collections.insert(
            CollectionId::DEFAULT,
            CollectionState {
                name: "_default".into(),
                scope: ScopeId::DEFAULT,
                max_ttl: None,
                start_seqno: 0,
                high_seqno: AtomicU64::new(0),
                persisted_high_seqno: AtomicU64::new(0),
                disk_count: AtomicU64::new(0),
            },
        );
        Self {
            inner: RwLock::new(inner),
        }
    }
}

impl VbManifest {
    /// A manifest with no scopes or collections at all; replicas build
    /// their state purely from the event stream.
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Pin the membership decision for `collection` for the duration of
    /// one operation.
    pub fn caching_read_handle(&self, collection: CollectionId) -> CachingReadHandle<'_> {
        CachingReadHandle {
            guard: self.inner.read(),
            collection,
        }
    }

    pub fn read(&self) -> ReadHandle<'_> {
        ReadHandle {
            guard: self.inner.read(),
        }
    }

    pub fn write(&self) -> WriteHandle<'_> {
        WriteHandle {
            guard: self.inner.write(),
        }
    }

    /// The system events needed to move this partition's view to `target`.
    /// Creates come before drops so a replacement scope never observes a
    /// window with its collections missing their scope.
    pub fn diff(&self, target: &Manifest) -> Vec<SystemEventData> {
        let inner = self.inner.read();
        let uid = target.uid();
        let mut events = Vec::new();

        for scope in target.scopes() {
            if !inner.scopes.contains_key(&scope.id) {
                events.push(SystemEventData::CreateScope {
                    manifest_uid: uid,
                    scope: scope.id,
                    name: scope.name.clone(),
                });
            }
        }
        for entry in target.collections() {
            if !inner.collections.contains_key(&entry.id) {
                events.push(SystemEventData::CreateCollection {
                    manifest_uid: uid,
                    scope: entry.scope,
                    collection: entry.id,
                    name: entry.name.clone(),
                    max_ttl: entry.max_ttl,
                });
            }
        }
        let dropped_scopes: Vec<ScopeId> = inner
            .scopes
            .keys()
            .filter(|id| target.scope(**id).is_none())
            .copied()
            .collect();
        for (id, state) in &inner.collections {
            // A scope drop cascades to its collections at one seqno; no
            // individual drop events for them.
            if target.collection(*id).is_none() && !dropped_scopes.contains(&state.scope) {
                events.push(SystemEventData::DropCollection {
                    manifest_uid: uid,
                    collection: *id,
                });
            }
        }
        for id in dropped_scopes {
            events.push(SystemEventData::DropScope {
                manifest_uid: uid,
                scope: id,
            });
        }
        events
    }
}

/// Read view pinned to one collection.
pub struct CachingReadHandle<'a> {
    guard: RwLockReadGuard<'a, Inner>,
    collection: CollectionId,
}

impl CachingReadHandle<'_> {
    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    /// Whether the pinned collection is currently part of the namespace.
    pub fn valid(&self) -> bool {
        self.guard.collections.contains_key(&self.collection)
    }

    pub fn max_ttl(&self) -> Option<u32> {
        self.guard
            .collections
            .get(&self.collection)
            .and_then(|c| c.max_ttl)
    }

    pub fn manifest_uid(&self) -> u64 {
        self.guard.manifest_uid
    }

    pub fn high_seqno(&self) -> u64 {
        self.guard
            .collections
            .get(&self.collection)
            .map(|c| c.high_seqno.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Record a new item queued in this collection.
    pub fn update_high_seqno(&self, seqno: u64) {
        if let Some(state) = self.guard.collections.get(&self.collection) {
            state.high_seqno.fetch_max(seqno, Ordering::AcqRel);
        }
    }

    /// Is an item at `seqno` outside the pinned collection's live span?
    pub fn is_logically_deleted(&self, seqno: u64) -> bool {
        logically_deleted(&self.guard, self.collection, seqno)
    }
}

/// General read view across the whole manifest.
pub struct ReadHandle<'a> {
    guard: RwLockReadGuard<'a, Inner>,
}

impl ReadHandle<'_> {
    pub fn manifest_uid(&self) -> u64 {
        self.guard.manifest_uid
    }

    pub fn exists(&self, collection: CollectionId) -> bool {
        self.guard.collections.contains_key(&collection)
    }

    pub fn scope_exists(&self, scope: ScopeId) -> bool {
        self.guard.scopes.contains_key(&scope)
    }

    pub fn is_logically_deleted(&self, collection: CollectionId, seqno: u64) -> bool {
        logically_deleted(&self.guard, collection, seqno)
    }

    pub fn stats(&self, collection: CollectionId) -> Option<CollectionStats> {
        self.guard.collections.get(&collection).map(|c| CollectionStats {
            high_seqno: c.high_seqno.load(Ordering::Acquire),
            persisted_high_seqno: c.persisted_high_seqno.load(Ordering::Acquire),
            disk_count: c.disk_count.load(Ordering::Acquire),
        })
    }

    pub fn collection_ids(&self) -> Vec<CollectionId> {
        self.guard.collections.keys().copied().collect()
    }

    pub fn dropped(&self, collection: CollectionId) -> Option<DroppedCollection> {
        self.guard.dropped.get(&collection).copied()
    }
}

fn logically_deleted(inner: &Inner, collection: CollectionId, seqno: u64) -> bool {
    if let Some(state) = inner.collections.get(&collection) {
        return seqno < state.start_seqno;
    }
    if let Some(dropped) = inner.dropped.get(&collection) {
        return seqno <= dropped.end_seqno;
    }
    // A collection this partition has never heard of: nothing at any seqno
    // is visible through it.
    true
}

/// Mutating view used when applying system events and persistence
/// callbacks.
pub struct WriteHandle<'a> {
    guard: RwLockWriteGuard<'a, Inner>,
}

impl WriteHandle<'_> {
    /// Apply one system event at its seqno. Events must arrive in seqno
    /// order; replays of already-applied events are invariant violations
    /// surfaced to the replication stream.
    pub fn apply_event(&mut self, event: &SystemEventData, seqno: u64) -> Result<(), EpkvError> {
        match event {
            SystemEventData::CreateCollection {
                manifest_uid,
                scope,
                collection,
                name,
                max_ttl,
            } => self.create_collection(*manifest_uid, *scope, *collection, name, *max_ttl, seqno),
            SystemEventData::DropCollection {
                manifest_uid,
                collection,
            } => self.drop_collection(*manifest_uid, *collection, seqno).map(drop),
            SystemEventData::CreateScope {
                manifest_uid,
                scope,
                name,
            } => self.create_scope(*manifest_uid, *scope, name),
            SystemEventData::DropScope {
                manifest_uid,
                scope,
            } => self.drop_scope(*manifest_uid, *scope, seqno).map(drop),
        }
    }

    pub fn create_scope(
        &mut self,
        manifest_uid: u64,
        scope: ScopeId,
        name: &str,
    ) -> Result<(), EpkvError> {
        if self.guard.scopes.contains_key(&scope) {
            return Err(EpkvError::invariant(format!(
                "create for existing scope {scope}"
            )));
        }
        self.guard.scopes.insert(scope, name.to_string());
        self.bump_uid(manifest_uid);
        Ok(())
    }

    pub fn create_collection(
        &mut self,
        manifest_uid: u64,
        scope: ScopeId,
        collection: CollectionId,
        name: &str,
        max_ttl: Option<u32>,
        seqno: u64,
    ) -> Result<(), EpkvError> {
        if self.guard.collections.contains_key(&collection) {
            return Err(EpkvError::invariant(format!(
                "create for existing collection {collection}"
            )));
        }
        if !self.guard.scopes.contains_key(&scope) {
            return Err(EpkvError::invariant(format!(
                "create collection {collection} in unknown scope {scope}"
            )));
        }
        // A recreation forgets the dropped generation going forward.
        self.guard.dropped.remove(&collection);
        self.guard.collections.insert(
            collection,
            CollectionState {
                name: name.to_string(),
                scope,
                max_ttl,
                start_seqno: seqno,
                high_seqno: AtomicU64::new(seqno),
                persisted_high_seqno: AtomicU64::new(0),
                disk_count: AtomicU64::new(0),
            },
        );
        self.bump_uid(manifest_uid);
        Ok(())
    }

    pub fn drop_collection(
        &mut self,
        manifest_uid: u64,
        collection: CollectionId,
        seqno: u64,
    ) -> Result<DroppedCollection, EpkvError> {
        let Some(state) = self.guard.collections.remove(&collection) else {
            return Err(EpkvError::invariant(format!(
                "drop for unknown collection {collection}"
            )));
        };
        let dropped = DroppedCollection {
            start_seqno: state.start_seqno,
            end_seqno: seqno,
        };
        self.guard.dropped.insert(collection, dropped);
        self.bump_uid(manifest_uid);
        Ok(dropped)
    }

    /// Dropping a scope drops every collection in it, all at the scope
    /// drop's seqno.
    pub fn drop_scope(
        &mut self,
        manifest_uid: u64,
        scope: ScopeId,
        seqno: u64,
    ) -> Result<Vec<CollectionId>, EpkvError> {
        if self.guard.scopes.remove(&scope).is_none() {
            return Err(EpkvError::invariant(format!(
                "drop for unknown scope {scope}"
            )));
        }
        let members: Vec<CollectionId> = self
            .guard
            .collections
            .iter()
            .filter(|(_, state)| state.scope == scope)
            .map(|(id, _)| *id)
            .collect();
        for id in &members {
            let state = self.guard.collections.remove(id).expect("member exists");
            self.guard.dropped.insert(
                *id,
                DroppedCollection {
                    start_seqno: state.start_seqno,
                    end_seqno: seqno,
                },
            );
        }
        self.bump_uid(manifest_uid);
        Ok(members)
    }

    /// Persistence callbacks: the flusher reports what it wrote.
    pub fn on_persisted(&mut self, collection: CollectionId, seqno: u64, disk_delta: i64) {
        if let Some(state) = self.guard.collections.get(&collection) {
            state.persisted_high_seqno.fetch_max(seqno, Ordering::AcqRel);
            if disk_delta >= 0 {
                state.disk_count.fetch_add(disk_delta as u64, Ordering::AcqRel);
            } else {
                state
                    .disk_count
                    .fetch_sub(disk_delta.unsigned_abs(), Ordering::AcqRel);
            }
        }
    }

    /// Rollback: re-seed stats from the persisted snapshot.
    pub fn reset_stats(&mut self, collection: CollectionId, stats: CollectionStats) {
        if let Some(state) = self.guard.collections.get(&collection) {
            state.high_seqno.store(stats.high_seqno, Ordering::Release);
            state
                .persisted_high_seqno
                .store(stats.persisted_high_seqno, Ordering::Release);
            state.disk_count.store(stats.disk_count, Ordering::Release);
        }
    }

    fn bump_uid(&mut self, manifest_uid: u64) {
        if manifest_uid > self.guard.manifest_uid {
            self.guard.manifest_uid = manifest_uid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CollectionStats, VbManifest};
    use crate::collections::events::SystemEventData;
    use crate::collections::manifest::Manifest;
    use crate::collections::{CollectionId, ScopeId};

    const VEGETABLE: CollectionId = CollectionId(8);

    fn create_vegetable(manifest: &VbManifest, seqno: u64) {
        manifest
            .write()
            .create_collection(1, ScopeId::DEFAULT, VEGETABLE, "vegetable", None, seqno)
            .unwrap();
    }

    #[test]
    fn create_use_drop_lifecycle() {
        let manifest = VbManifest::default();
        create_vegetable(&manifest, 10);
        {
            let handle = manifest.caching_read_handle(VEGETABLE);
            assert!(handle.valid());
            assert!(!handle.is_logically_deleted(11));
            // An item that predates the create is not in the collection.
            assert!(handle.is_logically_deleted(9));
            handle.update_high_seqno(11);
            assert_eq!(handle.high_seqno(), 11);
        }

        manifest.write().drop_collection(2, VEGETABLE, 20).unwrap();
        {
            let handle = manifest.caching_read_handle(VEGETABLE);
            assert!(!handle.valid());
            assert!(handle.is_logically_deleted(11));
        }
        let read = manifest.read();
        assert_eq!(
            read.dropped(VEGETABLE).unwrap().end_seqno,
            20
        );
    }

    #[test]
    fn scope_drop_cascades_at_one_seqno() {
        let manifest = VbManifest::default();
        let shop = ScopeId(9);
        {
            let mut w = manifest.write();
            w.create_scope(1, shop, "shop").unwrap();
            w.create_collection(1, shop, CollectionId(0xa), "orders", None, 5)
                .unwrap();
            w.create_collection(1, shop, CollectionId(0xb), "carts", None, 6)
                .unwrap();
        }
        let dropped = manifest.write().drop_scope(2, shop, 30).unwrap();
        assert_eq!(dropped.len(), 2);
        let read = manifest.read();
        for id in [CollectionId(0xa), CollectionId(0xb)] {
            assert!(!read.exists(id));
            assert_eq!(read.dropped(id).unwrap().end_seqno, 30);
        }
        assert!(!read.scope_exists(shop));
        // The default collection is untouched.
        assert!(read.exists(CollectionId::DEFAULT));
    }

    #[test]
    fn event_stream_reconstructs_bucket_manifest() {
        let bucket = Manifest::parse(
            r#"{"uid":"4","scopes":[
                {"uid":"0","name":"_default","collections":[{"uid":"0","name":"_default"}]},
                {"uid":"9","name":"shop","collections":[
                    {"uid":"a","name":"orders","max_ttl":60}]}]}"#,
            100,
            100,
        )
        .unwrap();

        // An active partition computes the diff and embeds it in the seqno
        // stream; an empty replica applies it and converges.
        let replica = VbManifest::empty();
        let active = VbManifest::empty();
        let events = active.diff(&bucket);
        let mut seqno = 1;
        for event in &events {
            replica.write().apply_event(event, seqno).unwrap();
            seqno += 1;
        }
        let read = replica.read();
        assert_eq!(read.manifest_uid(), 4);
        assert!(read.exists(CollectionId::DEFAULT));
        assert!(read.exists(CollectionId(0xa)));
        assert!(read.scope_exists(ScopeId(9)));
        assert!(read.scope_exists(ScopeId::DEFAULT));
    }

    #[test]
    fn recreation_restarts_the_live_span() {
        let manifest = VbManifest::default();
        create_vegetable(&manifest, 10);
        manifest.write().drop_collection(2, VEGETABLE, 20).unwrap();
        create_vegetable(&manifest, 30);
        let handle = manifest.caching_read_handle(VEGETABLE);
        assert!(handle.valid());
        // Items from the first generation are outside the new span.
        assert!(handle.is_logically_deleted(15));
        assert!(!handle.is_logically_deleted(31));
    }

    #[test]
    fn duplicate_events_are_invariant_violations() {
        let manifest = VbManifest::default();
        create_vegetable(&manifest, 10);
        assert!(
            manifest
                .write()
                .create_collection(1, ScopeId::DEFAULT, VEGETABLE, "vegetable", None, 11)
                .is_err()
        );
        assert!(
            manifest
                .write()
                .drop_collection(1, CollectionId(0x77), 12)
                .is_err()
        );
    }

    #[test]
    fn persistence_and_rollback_stats() {
        let manifest = VbManifest::default();
        create_vegetable(&manifest, 10);
        {
            let mut w = manifest.write();
            w.on_persisted(VEGETABLE, 11, 1);
            w.on_persisted(VEGETABLE, 12, 1);
        }
        let stats = manifest.read().stats(VEGETABLE).unwrap();
        assert_eq!(stats.persisted_high_seqno, 12);
        assert_eq!(stats.disk_count, 2);

        manifest.write().reset_stats(
            VEGETABLE,
            CollectionStats {
                high_seqno: 11,
                persisted_high_seqno: 11,
                disk_count: 1,
            },
        );
        let stats = manifest.read().stats(VEGETABLE).unwrap();
        assert_eq!(stats.disk_count, 1);
        assert_eq!(stats.high_seqno, 11);
    }

    #[test]
    fn diff_emits_drops_for_departed_entries() {
        let manifest = VbManifest::default();
        create_vegetable(&manifest, 10);
        // Target without the vegetable collection.
        let bucket = Manifest::parse(
            r#"{"uid":"5","scopes":[
                {"uid":"0","name":"_default","collections":[{"uid":"0","name":"_default"}]}]}"#,
            100,
            100,
        )
        .unwrap();
        let events = manifest.diff(&bucket);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            SystemEventData::DropCollection { collection, .. } if collection == VEGETABLE
        ));
    }
}
