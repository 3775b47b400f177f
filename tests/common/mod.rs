use epkv::callbacks::{Cookie, SeqnoNotification, VBucketObserver};
use epkv::hlc::WallClock;
use epkv::item::{Item, Vbid};
use epkv::{EpkvConfig, Status, VBucket, VBucketState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Manually advanced clock so tests control expiry and CAS physical time.
#[derive(Debug)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn at_us(now_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(now_us),
        }
    }

    #[allow(dead_code)]
    pub fn advance_us(&self, delta: u64) {
        self.now_us.fetch_add(delta, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// Observer recording every notification for later assertions.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub seqnos: Mutex<Vec<(Vbid, SeqnoNotification)>>,
    pub sync_writes: Mutex<Vec<(Cookie, Status)>>,
    pub seqno_acks: Mutex<Vec<(Vbid, u64)>>,
    pub io_completions: Mutex<Vec<(Cookie, Status)>>,
}

impl VBucketObserver for RecordingObserver {
    fn new_seqno(&self, vbid: Vbid, notification: SeqnoNotification) {
        self.seqnos.lock().push((vbid, notification));
    }

    fn sync_write_complete(&self, cookie: Cookie, result: Status) {
        self.sync_writes.lock().push((cookie, result));
    }

    fn seqno_ack(&self, vbid: Vbid, seqno: u64) {
        self.seqno_acks.lock().push((vbid, seqno));
    }

    fn notify_io_complete(&self, cookie: Cookie, result: Status) {
        self.io_completions.lock().push((cookie, result));
    }

    fn pre_link_document(&self, _item: &mut Item) {}
}

impl RecordingObserver {
    pub fn sync_write_results(&self) -> Vec<(Cookie, Status)> {
        self.sync_writes.lock().clone()
    }

    #[allow(dead_code)]
    pub fn last_seqno_ack(&self) -> Option<u64> {
        self.seqno_acks.lock().last().map(|(_, s)| *s)
    }
}

pub struct Harness {
    pub vb: VBucket,
    pub observer: Arc<RecordingObserver>,
    pub clock: Arc<ManualClock>,
}

pub fn harness(state: VBucketState) -> Harness {
    harness_with(state, EpkvConfig::default())
}

pub fn harness_with(state: VBucketState, config: EpkvConfig) -> Harness {
    let observer = Arc::new(RecordingObserver::default());
    let clock = Arc::new(ManualClock::at_us(1_700_000_000_000_000));
    let vb = VBucket::new(
        Vbid(0),
        state,
        Arc::new(config),
        Arc::clone(&clock) as Arc<dyn WallClock>,
        Arc::clone(&observer) as Arc<dyn VBucketObserver>,
        Arc::new(AtomicI64::new(0)),
    );
    Harness {
        vb,
        observer,
        clock,
    }
}
