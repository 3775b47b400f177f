use crate::config::EvictionPolicy;
use parking_lot::Mutex;
use std::sync::Arc;

/// Probabilistic membership filter consulted before scheduling background
/// fetches. The implementation is supplied by the host (it is rebuilt from
/// on-disk data during compaction, which this crate does not own).
pub trait BloomFilter: Send + Sync {
    fn maybe_contains(&self, key: &[u8]) -> bool;
    fn key_count(&self) -> u64;
    fn size_bytes(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Disabled,
    Enabled,
    /// A replacement filter is being built by compaction.
    Rebuilding,
}

impl FilterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterStatus::Disabled => "DISABLED",
            FilterStatus::Enabled => "ENABLED",
            FilterStatus::Rebuilding => "REBUILDING",
        }
    }
}

struct Slots {
    current: Option<Arc<dyn BloomFilter>>,
    /// Built during compaction, swapped in atomically at the end.
    temp: Option<Arc<dyn BloomFilter>>,
    status: FilterStatus,
}

/// Per-partition filter holder: current + temp slots with atomic swap.
pub struct BloomFilterHolder {
    slots: Mutex<Slots>,
}

impl Default for BloomFilterHolder {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slots {
                current: None,
                temp: None,
                status: FilterStatus::Disabled,
            }),
        }
    }
}

impl BloomFilterHolder {
    pub fn set_filter(&self, filter: Arc<dyn BloomFilter>) {
        let mut slots = self.slots.lock();
        slots.current = Some(filter);
        slots.status = FilterStatus::Enabled;
    }

    /// Install the filter compaction will populate.
    pub fn begin_rebuild(&self, filter: Arc<dyn BloomFilter>) {
        let mut slots = self.slots.lock();
        slots.temp = Some(filter);
        slots.status = FilterStatus::Rebuilding;
    }

    /// Swap the rebuilt filter in; the old one is dropped.
    pub fn complete_rebuild(&self) {
        let mut slots = self.slots.lock();
        if let Some(temp) = slots.temp.take() {
            slots.current = Some(temp);
        }
        slots.status = if slots.current.is_some() {
            FilterStatus::Enabled
        } else {
            FilterStatus::Disabled
        };
    }

    /// Whether `key` may exist on disk. With no filter installed the answer
    /// is always yes (a fetch must be scheduled).
    ///
    /// The filter is authoritative enough to skip fetches only in `Full`
    /// eviction; under `Value` eviction metadata is resident, so the filter
    /// is consulted solely for deleted-key lookups (the caller decides).
    pub fn maybe_key_exists(&self, key: &[u8]) -> bool {
        let slots = self.slots.lock();
        match (&slots.current, slots.status) {
            (Some(filter), FilterStatus::Enabled | FilterStatus::Rebuilding) => {
                filter.maybe_contains(key)
            }
            _ => true,
        }
    }

    pub fn status(&self) -> FilterStatus {
        self.slots.lock().status
    }

    pub fn key_count(&self) -> u64 {
        self.slots
            .lock()
            .current
            .as_ref()
            .map(|f| f.key_count())
            .unwrap_or(0)
    }

    pub fn size_bytes(&self) -> usize {
        self.slots
            .lock()
            .current
            .as_ref()
            .map(|f| f.size_bytes())
            .unwrap_or(0)
    }

    /// Whether a miss in the hash table can be answered without a fetch.
    pub fn can_skip_bgfetch(&self, policy: EvictionPolicy, key: &[u8]) -> bool {
        match policy {
            EvictionPolicy::Full => !self.maybe_key_exists(key),
            EvictionPolicy::Value => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BloomFilter, BloomFilterHolder, FilterStatus};
    use crate::config::EvictionPolicy;
    use std::collections::HashSet;
    use std::sync::Arc;

    struct SetFilter(HashSet<Vec<u8>>);

    impl BloomFilter for SetFilter {
        fn maybe_contains(&self, key: &[u8]) -> bool {
            self.0.contains(key)
        }

        fn key_count(&self) -> u64 {
            self.0.len() as u64
        }

        fn size_bytes(&self) -> usize {
            self.0.len() * 16
        }
    }

    fn filter_of(keys: &[&str]) -> Arc<SetFilter> {
        Arc::new(SetFilter(
            keys.iter().map(|k| k.as_bytes().to_vec()).collect(),
        ))
    }

    #[test]
    fn missing_filter_never_skips_fetches() {
        let holder = BloomFilterHolder::default();
        assert_eq!(holder.status(), FilterStatus::Disabled);
        assert!(holder.maybe_key_exists(b"anything"));
        assert!(!holder.can_skip_bgfetch(EvictionPolicy::Full, b"anything"));
    }

    #[test]
    fn full_eviction_skips_known_absent_keys() {
        let holder = BloomFilterHolder::default();
        holder.set_filter(filter_of(&["present"]));
        assert!(holder.can_skip_bgfetch(EvictionPolicy::Full, b"absent"));
        assert!(!holder.can_skip_bgfetch(EvictionPolicy::Full, b"present"));
        // Value eviction never skips on the filter alone.
        assert!(!holder.can_skip_bgfetch(EvictionPolicy::Value, b"absent"));
    }

    #[test]
    fn rebuild_swaps_atomically() {
        let holder = BloomFilterHolder::default();
        holder.set_filter(filter_of(&["old"]));
        holder.begin_rebuild(filter_of(&["new"]));
        assert_eq!(holder.status(), FilterStatus::Rebuilding);
        // Until the swap, the old filter answers.
        assert!(holder.maybe_key_exists(b"old"));
        holder.complete_rebuild();
        assert_eq!(holder.status(), FilterStatus::Enabled);
        assert!(holder.maybe_key_exists(b"new"));
        assert!(!holder.maybe_key_exists(b"old"));
    }
}
