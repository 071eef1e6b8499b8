use thiserror::Error;

/// Why an export, flush, or shutdown did not succeed.
///
/// `Clone` because one failure can resolve many completions (a combined flush
/// reports the first failed child).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Transport-layer error that carries no retry classification
    #[error("transport error: {0}")]
    Transport(String),
    /// Records could not be encoded into a payload
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The sender classified the failure as not worth retrying
    #[error("permanent failure{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    Permanent { code: Option<u32>, message: String },
    /// Every allowed attempt failed with a retryable error
    #[error("all retry attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },
    /// Waiting for an export exceeded its time budget
    #[error("export operation timed out")]
    Timeout,
    /// The operation was aborted before it could finish
    #[error("operation cancelled")]
    Cancelled,
    /// The processor no longer accepts work
    #[error("processor is shut down")]
    ShutDown,
    /// The background worker thread exited
    #[error("background worker is gone")]
    WorkerGone,
    /// An async operation was started outside a tokio runtime
    #[error("no tokio runtime available to drive the operation")]
    NoRuntime,
}

impl ExportError {
    /// Returns `true` if retrying the same payload could succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }

    /// Returns `true` if the failure comes from the pipeline being torn down.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::ShutDown | Self::WorkerGone)
    }
}

/// Invalid pipeline configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("max_export_batch_size ({batch}) must not exceed max_queue_size ({queue})")]
    BatchLargerThanQueue { batch: usize, queue: usize },
    #[error("backoff_multiplier must be greater than 1.0 (got {0})")]
    Multiplier(f64),
    #[error("initial_backoff ({initial:?}) must not exceed max_backoff ({max:?})")]
    BackoffOrder {
        initial: std::time::Duration,
        max: std::time::Duration,
    },
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Outcome of an asynchronous operation once it is terminal.
pub type Outcome = Result<(), ExportError>;
