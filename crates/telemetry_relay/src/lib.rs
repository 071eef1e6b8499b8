//! Reliable-delivery core for telemetry export.
//!
//! Records (spans, metric points, anything `Send`) flow from application threads
//! through three pieces:
//!
//! - [`BatchProcessor`]: bounded lock-free queue plus one background worker that
//!   drains it into batches on size or time triggers
//! - [`RetryingTransport`]: wraps a one-shot [`Sender`] with capped exponential
//!   backoff and full jitter
//! - [`Completion`]: one-shot, combinable outcome of an export, flush or shutdown
//!
//! Producers never block: a full queue drops the record and bumps
//! [`ProcessorMetrics::dropped`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use telemetry_relay::{
//!     BatchConfig, BatchProcessor, FnSender, JsonEncoder, RetryPolicy, RetryingTransport,
//!     SendOutcome, TransportExporter,
//! };
//!
//! let sender = FnSender::new("collector", |payload: &[u8]| {
//!     let bytes = payload.len();
//!     async move {
//!         // POST `bytes` to the backend here
//!         let _ = bytes;
//!         SendOutcome::Success
//!     }
//! });
//! let transport = RetryingTransport::new(sender, RetryPolicy::default()).unwrap();
//! let exporter = Arc::new(TransportExporter::<String, _, _>::new("collector", JsonEncoder, transport));
//!
//! let processor = BatchProcessor::<String>::new(BatchConfig::default(), exporter).unwrap();
//! processor.enqueue("span".to_string());
//!
//! let done = processor.shutdown();
//! done.join(Duration::from_secs(30));
//! ```
//!
//! # Logging
//!
//! The crate logs through `tracing` and never installs a subscriber.

pub mod batch_processor;
pub mod completion;
pub mod config;
pub mod error;
pub mod exporter;
pub mod metrics;
pub mod retry;

pub use batch_processor::{BatchProcessor, ProcessorState, WORKER_THREAD_NAME};
pub use completion::{Completion, CompletionGuard};
pub use config::BatchConfig;
pub use error::{ConfigError, ExportError, Outcome};
pub use exporter::{
    Batch, Encoder, Exporter, InMemoryExporter, JsonEncoder, NullExporter, StdoutExporter,
    TransportExporter,
};
pub use metrics::{ProcessorMetrics, ProcessorMetricsSnapshot};
pub use retry::{
    Delivery, FailureReason, FnSender, FullJitter, Jitter, NoJitter, RetryPolicy,
    RetryPolicyBuilder, RetryingTransport, SendOutcome, Sender, Sleeper, TokioSleeper,
};
