use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one batch processor, shared between producers and the worker.
///
/// All updates use `Relaxed` ordering: each counter is monotonic on its own and
/// nothing synchronizes through them.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    exported_records: AtomicU64,
    exported_batches: AtomicU64,
    export_failures: AtomicU64,
    export_timeouts: AtomicU64,
}

/// Point-in-time copy of [`ProcessorMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorMetricsSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub exported_records: u64,
    pub exported_batches: u64,
    pub export_failures: u64,
    pub export_timeouts: u64,
}

impl ProcessorMetrics {
    /// Records accepted into the queue.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Records discarded: queue full, or offered after shutdown began.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn exported_records(&self) -> u64 {
        self.exported_records.load(Ordering::Relaxed)
    }

    pub fn exported_batches(&self) -> u64 {
        self.exported_batches.load(Ordering::Relaxed)
    }

    pub fn export_failures(&self) -> u64 {
        self.export_failures.load(Ordering::Relaxed)
    }

    pub fn export_timeouts(&self) -> u64 {
        self.export_timeouts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProcessorMetricsSnapshot {
        ProcessorMetricsSnapshot {
            enqueued: self.enqueued(),
            dropped: self.dropped(),
            exported_records: self.exported_records(),
            exported_batches: self.exported_batches(),
            export_failures: self.export_failures(),
            export_timeouts: self.export_timeouts(),
        }
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the previous drop count.
    pub(crate) fn record_dropped(&self, count: u64) -> u64 {
        self.dropped.fetch_add(count, Ordering::Relaxed)
    }

    pub(crate) fn record_export_success(&self, records: u64) {
        self.exported_records.fetch_add(records, Ordering::Relaxed);
        self.exported_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_export_failure(&self) {
        self.export_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_export_timeout(&self) {
        self.export_timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_updates() {
        let metrics = ProcessorMetrics::default();
        metrics.record_enqueued();
        metrics.record_enqueued();
        assert_eq!(metrics.record_dropped(3), 0);
        assert_eq!(metrics.record_dropped(1), 3);
        metrics.record_export_success(2);
        metrics.record_export_failure();
        metrics.record_export_timeout();

        assert_eq!(
            metrics.snapshot(),
            ProcessorMetricsSnapshot {
                enqueued: 2,
                dropped: 4,
                exported_records: 2,
                exported_batches: 1,
                export_failures: 1,
                export_timeouts: 1,
            }
        );
    }
}
