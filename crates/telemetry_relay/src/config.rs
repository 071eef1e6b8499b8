//! Configuration for batch processing behavior.

use crate::error::ConfigError;
use serde::Deserialize;
use std::time::Duration;

/// Configuration for a [`BatchProcessor`](crate::BatchProcessor).
///
/// Deserializable from any serde format; missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Queue capacity. Records enqueued while the queue holds this many are dropped.
    ///
    /// Default: 2048
    pub max_queue_size: usize,

    /// Maximum records per exported batch. Reaching this many queued records
    /// also wakes the worker early.
    ///
    /// Default: 512
    pub max_export_batch_size: usize,

    /// Interval between timer-driven drains.
    ///
    /// Default: 5s
    pub schedule_delay: Duration,

    /// How long the worker waits on one export before moving on.
    ///
    /// Default: 30s
    pub export_timeout: Duration,

    /// How long dropping the processor waits for a graceful shutdown.
    ///
    /// Default: 30s
    pub shutdown_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            schedule_delay: Duration::from_secs(5),
            export_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    /// Small batches drained often.
    pub fn low_latency() -> Self {
        Self {
            max_queue_size: 1024,
            max_export_batch_size: 64,
            schedule_delay: Duration::from_millis(200),
            export_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Deep queue and large batches for bursty producers.
    pub fn high_throughput() -> Self {
        Self {
            max_queue_size: 16_384,
            max_export_batch_size: 2048,
            schedule_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size;
        self
    }

    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.schedule_delay = delay;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Checks sizes are non-zero and a batch fits in the queue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_queue_size",
            });
        }
        if self.max_export_batch_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_export_batch_size",
            });
        }
        if self.max_export_batch_size > self.max_queue_size {
            return Err(ConfigError::BatchLargerThanQueue {
                batch: self.max_export_batch_size,
                queue: self.max_queue_size,
            });
        }
        if self.schedule_delay.is_zero() {
            return Err(ConfigError::Zero {
                field: "schedule_delay",
            });
        }
        Ok(())
    }
}
