use crate::callbacks::Cookie;
use crate::error::Status;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// What a high-priority waiter is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterKind {
    /// A seqno reaching the persistence cursor.
    Seqno,
    /// A whole checkpoint id becoming persisted.
    CheckpointId,
}

#[derive(Debug)]
struct Waiter {
    cookie: Cookie,
    target: u64,
    kind: WaiterKind,
    enqueued: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct Inner {
    waiters: Vec<Waiter>,
    /// Current adaptive timeout applied to new waiters.
    flush_timeout: Duration,
}

/// Clients waiting for a persistence milestone, with a deadline that
/// adapts to observed persistence latency within configured bounds.
#[derive(Debug)]
pub struct HighPriorityWaiters {
    inner: Mutex<Inner>,
    min_timeout: Duration,
    max_timeout: Duration,
}

impl HighPriorityWaiters {
    pub fn new(min_timeout: Duration, max_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                waiters: Vec::new(),
                flush_timeout: min_timeout,
            }),
            min_timeout,
            max_timeout,
        }
    }

    pub fn add(&self, cookie: Cookie, target: u64, kind: WaiterKind, now: Instant) {
        let mut inner = self.inner.lock();
        let deadline = now + inner.flush_timeout;
        inner.waiters.push(Waiter {
            cookie,
            target,
            kind,
            enqueued: now,
            deadline,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Complete waiters of `kind` whose target has been reached
    /// (`Success`) or whose deadline has lapsed (`Tmpfail`). Observed
    /// completion latencies steer the adaptive timeout.
    pub fn notifications(
        &self,
        reached: u64,
        kind: WaiterKind,
        now: Instant,
    ) -> Vec<(Cookie, Status)> {
        let mut inner = self.inner.lock();
        let mut notified = Vec::new();
        let mut observed = Vec::new();
        inner.waiters.retain(|w| {
            if w.kind == kind && w.target <= reached {
                observed.push(now.saturating_duration_since(w.enqueued));
                notified.push((w.cookie, Status::Success));
                return false;
            }
            if w.deadline <= now {
                notified.push((w.cookie, Status::Tmpfail));
                return false;
            }
            true
        });
        if let Some(slowest) = observed.into_iter().max() {
            inner.flush_timeout = (slowest * 2).clamp(self.min_timeout, self.max_timeout);
        }
        notified
    }

    /// Complete everyone with `status`; shutdown and disconnect path.
    pub fn drain_all(&self, status: Status) -> Vec<(Cookie, Status)> {
        let mut inner = self.inner.lock();
        inner
            .waiters
            .drain(..)
            .map(|w| (w.cookie, status))
            .collect()
    }

    pub fn current_timeout(&self) -> Duration {
        self.inner.lock().flush_timeout
    }
}
