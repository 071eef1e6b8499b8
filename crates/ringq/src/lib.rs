//! ringq - Bounded Lock-Free MPSC Queue
//!
//! A fixed-capacity queue shared by any number of producer threads and drained by
//! exactly one consumer. Producers never block and never grow the queue: a push
//! against a full queue hands the value straight back as [`PushError::Full`], so the
//! caller decides what a drop means.
//!
//! # Key Features
//!
//! - Any capacity >= 1 (not restricted to powers of two)
//! - Per-slot sequence stamps, unbounded `u64` positions (no ABA)
//! - Cache-padded head/tail to keep producers and consumer off each other's lines
//! - Single consumer enforced by the type system ([`Consumer`] is not `Clone`)
//! - FIFO per producer: items pushed by one thread are popped in push order
//!
//! # Example
//!
//! ```
//! use ringq::{bounded, PushError, QueueConfig};
//!
//! let (producer, consumer) = bounded::<u64>(QueueConfig::new(2));
//!
//! producer.try_push(1).unwrap();
//! producer.try_push(2).unwrap();
//! assert!(matches!(producer.try_push(3), Err(PushError::Full(3))));
//!
//! let mut out = Vec::new();
//! consumer.drain_up_to(10, |item| out.push(item));
//! assert_eq!(out, vec![1, 2]);
//! ```

mod config;
mod error;
mod invariants;
mod metrics;
mod queue;

pub use config::QueueConfig;
pub use error::PushError;
pub use metrics::MetricsSnapshot;
pub use queue::{bounded, Consumer, Producer, RingQueue};
