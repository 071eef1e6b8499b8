/// Configuration for a [`RingQueue`](crate::RingQueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of queued items (default: 2048)
    pub capacity: usize,
    /// Enable metrics collection (slight overhead)
    pub enable_metrics: bool,
}

impl QueueConfig {
    /// Creates a configuration with the given capacity and metrics disabled.
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            enable_metrics: false,
        }
    }

    /// Enables or disables metrics collection.
    pub const fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(2048)
    }
}
