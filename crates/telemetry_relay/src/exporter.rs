use crate::completion::Completion;
use crate::error::ExportError;
use crate::retry::{RetryingTransport, Sender};
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

/// An ordered group of records handed to one export call.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub records: Vec<T>,
    pub created_at: SystemTime,
}

impl<T> Batch<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self {
            records,
            created_at: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

/// Consumer of batches.
///
/// Object safe: the batch processor holds an `Arc<dyn Exporter<T>>`. Each call
/// returns immediately with a [`Completion`] that resolves when the operation is
/// terminal. The processor's worker is the only caller and never has more than
/// one `export` outstanding.
pub trait Exporter<T>: Send + Sync {
    fn export(&self, batch: Batch<T>) -> Completion;

    /// Pushes out anything the exporter itself buffers.
    fn force_flush(&self) -> Completion {
        Completion::succeeded()
    }

    /// Releases resources. Called once, after the final export.
    fn shutdown(&self) -> Completion {
        Completion::succeeded()
    }

    fn name(&self) -> &str;
}

/// Turns records into a wire payload.
pub trait Encoder<T>: Send + Sync {
    fn encode(&self, records: &[T]) -> Result<Vec<u8>, ExportError>;
}

/// Encodes a batch as one JSON array.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl<T: Serialize> Encoder<T> for JsonEncoder {
    fn encode(&self, records: &[T]) -> Result<Vec<u8>, ExportError> {
        serde_json::to_vec(records).map_err(|e| ExportError::Serialization(e.to_string()))
    }
}

/// Encoder + retrying transport composed into an [`Exporter`].
pub struct TransportExporter<T, E, S: Sender> {
    name: String,
    encoder: E,
    transport: Arc<RetryingTransport<S>>,
    _records: PhantomData<fn(T)>,
}

impl<T, E, S: Sender> TransportExporter<T, E, S> {
    pub fn new(name: impl Into<String>, encoder: E, transport: RetryingTransport<S>) -> Self {
        Self {
            name: name.into(),
            encoder,
            transport: Arc::new(transport),
            _records: PhantomData,
        }
    }

    pub fn transport(&self) -> &Arc<RetryingTransport<S>> {
        &self.transport
    }
}

impl<T, E, S> Exporter<T> for TransportExporter<T, E, S>
where
    E: Encoder<T>,
    S: Sender,
{
    fn export(&self, batch: Batch<T>) -> Completion {
        match self.encoder.encode(&batch.records) {
            Ok(payload) => {
                tracing::trace!(
                    exporter = %self.name,
                    records = batch.len(),
                    bytes = payload.len(),
                    "sending batch"
                );
                self.transport.send(payload)
            }
            Err(e) => {
                tracing::error!(exporter = %self.name, records = batch.len(), "encoding failed: {e}");
                Completion::failed(e)
            }
        }
    }

    fn shutdown(&self) -> Completion {
        // Ends any backoff still pending from a timed-out export
        self.transport.cancel();
        Completion::succeeded()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Discards every batch (for benchmarking).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullExporter;

impl<T> Exporter<T> for NullExporter {
    fn export(&self, _batch: Batch<T>) -> Completion {
        Completion::succeeded()
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Stdout exporter for testing and debugging
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl<T: fmt::Debug> Exporter<T> for StdoutExporter {
    fn export(&self, batch: Batch<T>) -> Completion {
        println!("=== Exporting {} records ===", batch.len());
        if self.verbose {
            for record in &batch.records {
                println!("  {record:?}");
            }
        }
        Completion::succeeded()
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Keeps every exported batch in memory. Useful in tests and for inspection.
pub struct InMemoryExporter<T> {
    batches: Mutex<Vec<Vec<T>>>,
    force_flushes: AtomicU64,
    shut_down: AtomicBool,
}

impl<T> InMemoryExporter<T> {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            force_flushes: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn batch_count(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sizes of the exported batches, in export order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Vec::len)
            .collect()
    }

    pub fn force_flush_count(&self) -> u64 {
        self.force_flushes.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<T: Clone> InMemoryExporter<T> {
    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every exported record, flattened in export order.
    pub fn records(&self) -> Vec<T> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

impl<T> Default for InMemoryExporter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Exporter<T> for InMemoryExporter<T> {
    fn export(&self, batch: Batch<T>) -> Completion {
        if self.is_shut_down() {
            return Completion::failed(ExportError::ShutDown);
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.into_records());
        Completion::succeeded()
    }

    fn force_flush(&self) -> Completion {
        self.force_flushes.fetch_add(1, Ordering::Relaxed);
        Completion::succeeded()
    }

    fn shutdown(&self) -> Completion {
        self.shut_down.store(true, Ordering::Release);
        Completion::succeeded()
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}
