use std::sync::atomic::{AtomicU64, Ordering};

/// Wall-clock source, injected so tests can drive time explicitly.
pub trait WallClock: Send + Sync {
    /// Microseconds since the Unix epoch.
    fn now_us(&self) -> u64;

    /// Seconds since the Unix epoch, used for expiry evaluation.
    fn now_secs(&self) -> u32 {
        (self.now_us() / 1_000_000) as u32
    }
}

/// System wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_us(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// Reported clock mode. Before the epoch seqno is reached the partition has
/// only ever seen logical CAS values (stats only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlcMode {
    LogicalEpoch,
    Real,
}

const LOGICAL_BITS: u32 = 16;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Hybrid logical clock producing CAS values.
///
/// A CAS is physical microseconds shifted left 16 bits, with the low 16 bits
/// a logical counter used when physical time has not advanced past the
/// current maximum. Values are monotonic across the active regardless of
/// clock steps.
#[derive(Debug)]
pub struct Hlc {
    max_cas: AtomicU64,
    epoch_seqno: u64,
    drift_ahead_threshold_us: u64,
    drift_behind_threshold_us: u64,
    total_abs_drift_us: AtomicU64,
    total_abs_drift_count: AtomicU64,
    drift_ahead_exceeded: AtomicU64,
    drift_behind_exceeded: AtomicU64,
}

impl Hlc {
    pub fn new(
        init_cas: u64,
        epoch_seqno: u64,
        drift_ahead_threshold_us: u64,
        drift_behind_threshold_us: u64,
    ) -> Self {
        Self {
            max_cas: AtomicU64::new(init_cas),
            epoch_seqno,
            drift_ahead_threshold_us,
            drift_behind_threshold_us,
            total_abs_drift_us: AtomicU64::new(0),
            total_abs_drift_count: AtomicU64::new(0),
            drift_ahead_exceeded: AtomicU64::new(0),
            drift_behind_exceeded: AtomicU64::new(0),
        }
    }

    /// Generate the next CAS given the current wall clock.
    pub fn next_cas(&self, now_us: u64) -> u64 {
        let physical = now_us << LOGICAL_BITS;
        loop {
            let current = self.max_cas.load(Ordering::Acquire);
            let next = if physical > current {
                physical
            } else {
                current + 1
            };
            if self
                .max_cas
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::Acquire)
    }

    /// Raise the clock to at least `cas`. Used when applying replicated
    /// mutations so locally generated CAS values stay ahead.
    pub fn set_max_cas(&self, cas: u64) {
        self.max_cas.fetch_max(cas, Ordering::AcqRel);
    }

    /// Unconditional overwrite; rollback only.
    pub fn force_max_cas(&self, cas: u64) {
        self.max_cas.store(cas, Ordering::Release);
    }

    /// Absorb a peer CAS and account the drift of its physical component
    /// against our wall clock.
    pub fn set_max_cas_and_track_drift(&self, cas: u64, now_us: u64) {
        let peer_physical_us = cas >> LOGICAL_BITS;
        let (abs_drift, ahead) = if peer_physical_us >= now_us {
            (peer_physical_us - now_us, true)
        } else {
            (now_us - peer_physical_us, false)
        };
        self.total_abs_drift_us
            .fetch_add(abs_drift, Ordering::Relaxed);
        self.total_abs_drift_count.fetch_add(1, Ordering::Relaxed);
        if ahead && abs_drift > self.drift_ahead_threshold_us {
            self.drift_ahead_exceeded.fetch_add(1, Ordering::Relaxed);
        } else if !ahead && abs_drift > self.drift_behind_threshold_us {
            self.drift_behind_exceeded.fetch_add(1, Ordering::Relaxed);
        }
        self.set_max_cas(cas);
    }

    pub fn mode(&self, high_seqno: u64) -> HlcMode {
        if high_seqno < self.epoch_seqno {
            HlcMode::LogicalEpoch
        } else {
            HlcMode::Real
        }
    }

    pub fn drift_stats(&self) -> HlcDriftStats {
        HlcDriftStats {
            total_abs_drift_us: self.total_abs_drift_us.load(Ordering::Relaxed),
            total_abs_drift_count: self.total_abs_drift_count.load(Ordering::Relaxed),
            drift_ahead_exceeded: self.drift_ahead_exceeded.load(Ordering::Relaxed),
            drift_behind_exceeded: self.drift_behind_exceeded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HlcDriftStats {
    pub total_abs_drift_us: u64,
    pub total_abs_drift_count: u64,
    pub drift_ahead_exceeded: u64,
    pub drift_behind_exceeded: u64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::WallClock;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manually advanced clock for tests.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        now_us: AtomicU64,
    }

    impl ManualClock {
        pub fn at_us(now_us: u64) -> Self {
            Self {
                now_us: AtomicU64::new(now_us),
            }
        }

        pub fn advance_us(&self, delta: u64) {
            self.now_us.fetch_add(delta, Ordering::SeqCst);
        }

        pub fn set_us(&self, now_us: u64) {
            self.now_us.store(now_us, Ordering::SeqCst);
        }
    }

    impl WallClock for ManualClock {
        fn now_us(&self) -> u64 {
            self.now_us.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Hlc, HlcMode};

    #[test]
    fn cas_is_monotonic_with_frozen_clock() {
        let hlc = Hlc::new(0, 0, 5_000_000, 5_000_000);
        let now = 1_000_000;
        let a = hlc.next_cas(now);
        let b = hlc.next_cas(now);
        let c = hlc.next_cas(now);
        assert!(a < b && b < c);
        // Frozen physical time means increments land in the logical counter.
        assert_eq!(b, a + 1);
        assert_eq!(c, b + 1);
    }

    #[test]
    fn physical_advance_wins_over_logical() {
        let hlc = Hlc::new(0, 0, 5_000_000, 5_000_000);
        let a = hlc.next_cas(1_000_000);
        let b = hlc.next_cas(2_000_000);
        assert!(b > a);
        assert_eq!(b, 2_000_000 << 16);
    }

    #[test]
    fn peer_cas_from_future_holds_clock_ahead() {
        let hlc = Hlc::new(0, 0, 5_000_000, 5_000_000);
        let future_cas = 10_000_000u64 << 16;
        hlc.set_max_cas_and_track_drift(future_cas, 1_000_000);
        let next = hlc.next_cas(1_000_000);
        assert!(next > future_cas);
        let stats = hlc.drift_stats();
        assert_eq!(stats.drift_ahead_exceeded, 1);
        assert_eq!(stats.total_abs_drift_count, 1);
        assert_eq!(stats.total_abs_drift_us, 9_000_000);
    }

    #[test]
    fn behind_drift_is_counted_separately() {
        let hlc = Hlc::new(0, 0, 5_000_000, 5_000_000);
        let stale_cas = 1_000_000u64 << 16;
        hlc.set_max_cas_and_track_drift(stale_cas, 20_000_000);
        let stats = hlc.drift_stats();
        assert_eq!(stats.drift_ahead_exceeded, 0);
        assert_eq!(stats.drift_behind_exceeded, 1);
    }

    #[test]
    fn mode_tracks_epoch_seqno() {
        let hlc = Hlc::new(0, 100, 5_000_000, 5_000_000);
        assert_eq!(hlc.mode(50), HlcMode::LogicalEpoch);
        assert_eq!(hlc.mode(100), HlcMode::Real);
    }
}
