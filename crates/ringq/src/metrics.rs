use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pushed: u64,
    pub rejected_full: u64,
    pub popped: u64,
}

/// Queue counters. Relaxed everywhere: nothing synchronizes through these.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pushed: AtomicU64,
    rejected_full: AtomicU64,
    popped: AtomicU64,
}

impl Metrics {
    #[inline]
    pub(crate) fn add_pushed(&self, n: u64) {
        self.pushed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_rejected_full(&self, n: u64) {
        self.rejected_full.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_popped(&self, n: u64) {
        self.popped.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            rejected_full: self.rejected_full.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
        }
    }
}
