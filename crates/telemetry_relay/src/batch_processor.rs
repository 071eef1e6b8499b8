//! Batch Processor
//!
//! Decouples record producers from the network. Producers call
//! [`BatchProcessor::enqueue`] from any thread; a single dedicated worker drains the
//! queue into batches and hands each batch to the [`Exporter`].
//!
//! # Threading Model
//!
//! ```text
//! producer threads ──try_push──► ringq (bounded MPSC) ──drain──► worker thread
//!        │                                                         │
//!        └── full / shut down: count drop, return                  ├─ current-thread tokio runtime
//!                                                                  ├─ select!{ control, size wake, timer }
//! force_flush / shutdown ──control channel──────────────────────►  └─ exporter.export(batch), awaited
//! ```
//!
//! The worker is the only caller of the exporter and awaits each export (bounded by
//! `export_timeout`) before starting the next, so at most one export is in flight.
//! A slow exporter therefore fills the queue and causes drops instead of an
//! unbounded pile of pending batches.
//!
//! # Wake Triggers
//!
//! | trigger | drains |
//! |---------|--------|
//! | queue length reaches `max_export_batch_size` | full batches only |
//! | `schedule_delay` elapses since the last export | everything queued at wake time |
//! | `force_flush()` | everything queued at call time, then `exporter.force_flush()` |
//! | `shutdown()` | everything, then `exporter.shutdown()` |
//!
//! # Shutdown
//!
//! `Running → ShuttingDown → ShutDown`, never back. Once `ShuttingDown` is visible,
//! new records are dropped. The worker waits for enqueues that already passed the
//! state check, drains the queue, exports, shuts the exporter down, and only then
//! marks `ShutDown`.

use crate::completion::{Completion, CompletionGuard};
use crate::config::BatchConfig;
use crate::error::{ConfigError, ExportError};
use crate::exporter::{Batch, Exporter};
use crate::metrics::ProcessorMetrics;
use ringq::{bounded, Consumer, Producer, QueueConfig};
use std::sync::atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Name of the background worker thread.
pub const WORKER_THREAD_NAME: &str = "telemetry-relay-worker";

/// Lifecycle of a [`BatchProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Running = 0,
    ShuttingDown = 1,
    ShutDown = 2,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::ShutDown,
        }
    }
}

enum Control {
    /// Export everything pushed before queue position `mark`.
    Flush { mark: u64, guard: CompletionGuard },
    Shutdown(CompletionGuard),
}

impl Control {
    fn into_guard(self) -> CompletionGuard {
        match self {
            Self::Flush { guard, .. } | Self::Shutdown(guard) => guard,
        }
    }
}

/// State shared by producers, control callers and the worker.
struct Shared {
    state: AtomicU8,
    /// Enqueues that passed the state check and may still push.
    active_enqueuers: AtomicUsize,
    wake: Notify,
    /// At most one size-trigger wake outstanding.
    wake_pending: AtomicBool,
    /// Set while a run of drops is in progress; one warning per run.
    dropping: AtomicBool,
    metrics: Arc<ProcessorMetrics>,
}

impl Shared {
    #[inline]
    fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn record_drop(&self, count: u64) {
        let before = self.metrics.record_dropped(count);
        if !self.dropping.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                dropped_total = before + count,
                state = ?self.state(),
                "dropping records: queue full or processor shutting down"
            );
        }
    }
}

/// Queues records from any thread and exports them in batches from one worker.
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use telemetry_relay::{BatchConfig, BatchProcessor, InMemoryExporter};
///
/// let exporter = Arc::new(InMemoryExporter::<u32>::new());
/// let processor = BatchProcessor::new(BatchConfig::default(), exporter.clone()).unwrap();
///
/// for i in 0..10u32 {
///     processor.enqueue(i);
/// }
/// assert!(processor.force_flush().join(Duration::from_secs(5)));
/// assert_eq!(exporter.records(), (0..10).collect::<Vec<_>>());
/// ```
pub struct BatchProcessor<T: Send + 'static> {
    producer: Producer<T>,
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    shutdown: Mutex<Option<Completion>>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    config: BatchConfig,
}

impl<T: Send + 'static> BatchProcessor<T> {
    /// Validates `config` and starts the worker thread.
    pub fn new(config: BatchConfig, exporter: Arc<dyn Exporter<T>>) -> Result<Self, ConfigError> {
        config.validate()?;

        let (producer, consumer) = bounded(QueueConfig::new(config.max_queue_size));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ProcessorState::Running as u8),
            active_enqueuers: AtomicUsize::new(0),
            wake: Notify::new(),
            wake_pending: AtomicBool::new(false),
            dropping: AtomicBool::new(false),
            metrics: Arc::new(ProcessorMetrics::default()),
        });
        let cancel = CancellationToken::new();

        // Senders may do network IO on this runtime
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name(WORKER_THREAD_NAME)
            .build()
            .map_err(|e| ConfigError::Spawn(e.to_string()))?;

        tracing::info!(
            exporter = exporter.name(),
            max_queue_size = config.max_queue_size,
            max_export_batch_size = config.max_export_batch_size,
            schedule_delay_ms = config.schedule_delay.as_millis() as u64,
            "starting batch processor"
        );

        let worker = Worker {
            consumer,
            exporter,
            shared: Arc::clone(&shared),
            control: control_rx,
            config: config.clone(),
            cancel: cancel.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || runtime.block_on(worker.run()))
            .map_err(|e| ConfigError::Spawn(e.to_string()))?;

        Ok(Self {
            producer,
            shared,
            control: control_tx,
            shutdown: Mutex::new(None),
            cancel,
            worker: Some(handle),
            config,
        })
    }

    /// Offers a record. Never blocks and never fails.
    ///
    /// The record is dropped (and counted) when the queue is full or the processor
    /// is no longer running.
    pub fn enqueue(&self, record: T) {
        let shared = &*self.shared;
        shared.active_enqueuers.fetch_add(1, Ordering::SeqCst);

        if shared.state() != ProcessorState::Running {
            shared.active_enqueuers.fetch_sub(1, Ordering::SeqCst);
            shared.record_drop(1);
            return;
        }

        match self.producer.try_push(record) {
            Ok(()) => {
                shared.metrics.record_enqueued();
                if shared.dropping.load(Ordering::Relaxed) {
                    shared.dropping.store(false, Ordering::Relaxed);
                }
                if self.producer.queue().len() >= self.config.max_export_batch_size {
                    // Pairs with the fence after the worker clears `wake_pending`
                    fence(Ordering::SeqCst);
                    if !shared.wake_pending.load(Ordering::SeqCst)
                        && !shared.wake_pending.swap(true, Ordering::SeqCst)
                    {
                        shared.wake.notify_one();
                    }
                }
            }
            Err(_rejected) => shared.record_drop(1),
        }

        shared.active_enqueuers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Exports every record queued at the time of the call.
    ///
    /// Resolves once those batches and `exporter.force_flush()` are terminal; fails if
    /// any of them failed. Enqueues keep being accepted meanwhile.
    pub fn force_flush(&self) -> Completion {
        if self.shared.state() != ProcessorState::Running {
            return Completion::failed(ExportError::ShutDown);
        }

        let mark = self.producer.queue().tail_position();
        let done = Completion::new();
        let guard = CompletionGuard::new(done.clone());
        if let Err(mpsc::error::SendError(message)) =
            self.control.send(Control::Flush { mark, guard })
        {
            message.into_guard().complete(Err(ExportError::WorkerGone));
        }
        done
    }

    /// Stops accepting records, exports what is queued, then shuts the exporter down.
    ///
    /// Idempotent: every call returns the same completion and the drain runs once.
    pub fn shutdown(&self) -> Completion {
        let mut slot = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }

        let done = Completion::new();
        *slot = Some(done.clone());
        self.shared.set_state(ProcessorState::ShuttingDown);
        tracing::info!(queued = self.queue_len(), "shutting down batch processor");

        let guard = CompletionGuard::new(done.clone());
        if let Err(mpsc::error::SendError(message)) = self.control.send(Control::Shutdown(guard)) {
            self.shared.set_state(ProcessorState::ShutDown);
            message.into_guard().complete(Err(ExportError::WorkerGone));
        }
        done
    }

    pub fn state(&self) -> ProcessorState {
        self.shared.state()
    }

    pub fn metrics(&self) -> &Arc<ProcessorMetrics> {
        &self.shared.metrics
    }

    /// Monotonic count of records dropped so far.
    pub fn dropped_records(&self) -> u64 {
        self.shared.metrics.dropped()
    }

    /// Records currently queued and not yet batched.
    pub fn queue_len(&self) -> usize {
        self.producer.queue().len()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

impl<T: Send + 'static> Drop for BatchProcessor<T> {
    fn drop(&mut self) {
        let done = self.shutdown();
        if !done.join(self.config.shutdown_timeout) {
            tracing::warn!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "graceful shutdown timed out; cancelling worker"
            );
            self.cancel.cancel();
        }

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("batch processor worker panicked");
            }
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

struct Worker<T> {
    consumer: Consumer<T>,
    exporter: Arc<dyn Exporter<T>>,
    shared: Arc<Shared>,
    control: mpsc::UnboundedReceiver<Control>,
    config: BatchConfig,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Worker<T> {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let cancelled = tokio::select! {
            biased;
            () = cancel.cancelled() => true,
            () = self.run_loop() => false,
        };
        if cancelled {
            tracing::warn!(exporter = self.exporter.name(), "worker cancelled");
        }

        // Only non-empty after cancellation
        let leftover = self.consumer.drain_up_to(usize::MAX, drop);
        if leftover > 0 {
            self.shared.record_drop(leftover as u64);
        }
        self.shared.set_state(ProcessorState::ShutDown);
        tracing::debug!("batch processor worker exiting");
    }

    async fn run_loop(&mut self) {
        let mut deadline = Instant::now() + self.config.schedule_delay;

        loop {
            tokio::select! {
                biased;
                message = self.control.recv() => match message {
                    Some(Control::Flush { mark, guard }) => {
                        self.flush(mark, guard).await;
                        deadline = Instant::now() + self.config.schedule_delay;
                    }
                    Some(Control::Shutdown(guard)) => {
                        self.shutdown(guard).await;
                        return;
                    }
                    // Processor handle is gone; its Drop already requested shutdown
                    None => return,
                },
                () = self.shared.wake.notified() => {
                    self.shared.wake_pending.store(false, Ordering::SeqCst);
                    fence(Ordering::SeqCst);
                    let batch_size = self.config.max_export_batch_size;
                    let full = self.consumer.queue().len() / batch_size;
                    if !self.export_up_to(full * batch_size).await.is_empty() {
                        deadline = Instant::now() + self.config.schedule_delay;
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    let queued = self.consumer.queue().len();
                    self.export_up_to(queued).await;
                    deadline = Instant::now() + self.config.schedule_delay;
                }
            }
        }
    }

    /// Drains at most `target` records in batches, exporting each in turn.
    async fn export_up_to(&mut self, target: usize) -> Vec<Completion> {
        let mut completions = Vec::new();
        let mut remaining = target;
        while remaining > 0 {
            let batch = self.take_batch(remaining.min(self.config.max_export_batch_size));
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());
            completions.push(self.export(batch).await);
        }
        completions
    }

    fn take_batch(&self, max: usize) -> Batch<T> {
        let mut records = Vec::with_capacity(max.min(self.consumer.queue().len()));
        self.consumer.drain_up_to(max, |record| records.push(record));
        Batch::new(records)
    }

    /// Calls the exporter and waits for the outcome, up to `export_timeout`.
    async fn export(&self, batch: Batch<T>) -> Completion {
        let records = batch.len() as u64;
        let exporter = self.exporter.name();
        tracing::debug!(exporter, records, "exporting batch");

        let completion = self.exporter.export(batch);
        let metrics = &self.shared.metrics;
        match completion.wait_timeout(self.config.export_timeout).await {
            Some(Ok(())) => metrics.record_export_success(records),
            Some(Err(e)) => {
                metrics.record_export_failure();
                tracing::warn!(exporter, records, "export failed: {e}");
            }
            None => {
                metrics.record_export_timeout();
                tracing::warn!(
                    exporter,
                    records,
                    timeout_ms = self.config.export_timeout.as_millis() as u64,
                    "export timed out; continuing with next batch"
                );
                let metrics = Arc::clone(metrics);
                completion.on_complete(move |outcome| match outcome {
                    Ok(()) => metrics.record_export_success(records),
                    Err(_) => metrics.record_export_failure(),
                });
            }
        }
        completion
    }

    async fn flush(&mut self, mark: u64, guard: CompletionGuard) {
        let queue = self.consumer.queue();
        let before_mark = mark.saturating_sub(queue.head_position()) as usize;
        let mut children = self.export_up_to(before_mark).await;
        children.push(self.exporter.force_flush());

        tracing::debug!(batches = children.len() - 1, "flush exported");
        Completion::combine(children).on_complete(move |outcome| {
            guard.complete(outcome.clone());
        });
    }

    async fn shutdown(&mut self, guard: CompletionGuard) {
        self.consumer.queue().close();
        while self.shared.active_enqueuers.load(Ordering::SeqCst) > 0 {
            tokio::task::yield_now().await;
        }

        let mut children = self.export_up_to(usize::MAX).await;
        let exported = children.len();
        children.push(self.exporter.shutdown());

        let outcome = Completion::combine(children).wait().await;
        let stragglers = self.consumer.drain_up_to(usize::MAX, drop);
        if stragglers > 0 {
            self.shared.record_drop(stragglers as u64);
        }

        self.shared.set_state(ProcessorState::ShutDown);
        match &outcome {
            Ok(()) => tracing::info!(batches = exported, "batch processor shut down"),
            Err(e) => tracing::warn!(batches = exported, "batch processor shut down with error: {e}"),
        }
        guard.complete(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;
    use std::sync::atomic::AtomicU64;
    use std::sync::mpsc as std_mpsc;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn idle_config(queue: usize, batch: usize) -> BatchConfig {
        BatchConfig::default()
            .with_max_queue_size(queue)
            .with_max_export_batch_size(batch)
            .with_schedule_delay(Duration::from_secs(3600))
            .with_shutdown_timeout(WAIT)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < WAIT {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    /// Blocks the worker inside `export` until released.
    struct BlockingExporter {
        entered: Mutex<std_mpsc::Sender<()>>,
        release: Mutex<std_mpsc::Receiver<()>>,
        exported: AtomicU64,
        sizes: Mutex<Vec<usize>>,
    }

    impl BlockingExporter {
        /// Returns the exporter, the "entered export" receiver and the release sender.
        fn new() -> (Arc<Self>, std_mpsc::Receiver<()>, std_mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = std_mpsc::channel();
            let (release_tx, release_rx) = std_mpsc::channel();
            let exporter = Arc::new(Self {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
                exported: AtomicU64::new(0),
                sizes: Mutex::new(Vec::new()),
            });
            (exporter, entered_rx, release_tx)
        }

        fn sizes(&self) -> Vec<usize> {
            self.sizes.lock().unwrap().clone()
        }
    }

    impl Exporter<u64> for BlockingExporter {
        fn export(&self, batch: Batch<u64>) -> Completion {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.exported.fetch_add(batch.len() as u64, Ordering::SeqCst);
            self.sizes.lock().unwrap().push(batch.len());
            Completion::succeeded()
        }

        fn name(&self) -> &str {
            "blocking"
        }
    }

    /// Returns completions that only resolve when the test says so.
    #[derive(Default)]
    struct ManualExporter {
        pending: Mutex<Vec<Completion>>,
        shutdowns: AtomicU64,
    }

    impl ManualExporter {
        fn pending(&self) -> Vec<Completion> {
            self.pending.lock().unwrap().clone()
        }
    }

    impl Exporter<u64> for ManualExporter {
        fn export(&self, _batch: Batch<u64>) -> Completion {
            let completion = Completion::new();
            self.pending.lock().unwrap().push(completion.clone());
            completion
        }

        fn shutdown(&self) -> Completion {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Completion::succeeded()
        }

        fn name(&self) -> &str {
            "manual"
        }
    }

    /// Resolves each export from another thread and tracks overlap.
    #[derive(Default)]
    struct DeferredExporter {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: AtomicUsize,
        worker_threads: Mutex<Vec<Option<String>>>,
        exported: Arc<AtomicU64>,
    }

    impl Exporter<u64> for DeferredExporter {
        fn export(&self, batch: Batch<u64>) -> Completion {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.worker_threads
                .lock()
                .unwrap()
                .push(thread::current().name().map(str::to_owned));

            let completion = Completion::new();
            let resolver = completion.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let exported = Arc::clone(&self.exported);
            let records = batch.len() as u64;
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                exported.fetch_add(records, Ordering::SeqCst);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                resolver.succeed();
            });
            completion
        }

        fn name(&self) -> &str {
            "deferred"
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let exporter: Arc<dyn Exporter<u64>> = Arc::new(InMemoryExporter::<u64>::new());
        let result = BatchProcessor::new(idle_config(4, 8), exporter);
        assert!(matches!(
            result.err(),
            Some(ConfigError::BatchLargerThanQueue { batch: 8, queue: 4 })
        ));
    }

    #[test]
    fn test_force_flush_exports_in_fifo_order() {
        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        let processor = BatchProcessor::new(idle_config(100, 5), exporter.clone()).unwrap();

        for i in 0..12u64 {
            processor.enqueue(i);
        }
        let flushed = processor.force_flush();
        assert!(flushed.join(WAIT));
        assert!(flushed.is_success());

        assert_eq!(exporter.records(), (0..12).collect::<Vec<_>>());
        assert!(exporter.batch_sizes().iter().all(|&n| n <= 5));
        assert_eq!(exporter.force_flush_count(), 1);
        assert_eq!(processor.dropped_records(), 0);
        assert_eq!(processor.metrics().exported_records(), 12);
    }

    #[test]
    fn test_size_trigger_scenario_23_records() {
        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        let processor = BatchProcessor::new(idle_config(10, 5), exporter.clone()).unwrap();

        for i in 0..23u64 {
            processor.enqueue(i);
            if (i + 1) % 5 == 0 {
                let expected = ((i + 1) / 5) as usize;
                assert!(wait_until(|| exporter.batch_count() == expected));
            }
        }

        assert_eq!(exporter.batch_sizes(), vec![5, 5, 5, 5]);
        assert_eq!(processor.queue_len(), 3);
        assert_eq!(processor.dropped_records(), 0);

        assert!(processor.force_flush().join(WAIT));
        assert_eq!(exporter.batch_sizes(), vec![5, 5, 5, 5, 3]);
        assert_eq!(exporter.records(), (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn test_force_flush_ignores_records_enqueued_after_call() {
        let (exporter, entered_rx, release_tx) = BlockingExporter::new();
        let processor = BatchProcessor::new(idle_config(100, 5), exporter.clone()).unwrap();

        // A full batch parks the worker inside export
        for i in 0..5u64 {
            processor.enqueue(i);
        }
        entered_rx.recv_timeout(WAIT).unwrap();

        processor.enqueue(5);
        let flushed = processor.force_flush();
        for i in 6..9u64 {
            processor.enqueue(i);
        }

        for _ in 0..2 {
            release_tx.send(()).unwrap();
        }
        assert!(flushed.join(WAIT));
        assert!(flushed.is_success());
        assert_eq!(exporter.sizes(), vec![5, 1]);
        assert_eq!(processor.queue_len(), 3);

        release_tx.send(()).unwrap();
        assert!(processor.shutdown().join(WAIT));
        assert_eq!(exporter.sizes(), vec![5, 1, 3]);
    }

    #[test]
    fn test_size_trigger_never_misses_a_wake() {
        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        let processor = BatchProcessor::new(idle_config(64, 4), exporter.clone()).unwrap();

        // Only the size trigger can export here; a lost wake stalls until WAIT
        for round in 1..=200usize {
            for i in 0..4u64 {
                processor.enqueue(round as u64 * 10 + i);
            }
            assert!(
                wait_until(|| exporter.batch_count() == round),
                "round {round} not exported"
            );
        }
        assert!(exporter.batch_sizes().iter().all(|&n| n == 4));
    }

    #[test]
    fn test_size_export_pushes_back_timer() {
        let delay = Duration::from_millis(400);
        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        let config = idle_config(100, 5).with_schedule_delay(delay);
        let processor = BatchProcessor::new(config, exporter.clone()).unwrap();

        thread::sleep(Duration::from_millis(300));
        for i in 0..7u64 {
            processor.enqueue(i);
        }
        assert!(wait_until(|| exporter.batch_count() == 1));

        // The first deadline has passed, but the full batch restarted the delay
        thread::sleep(Duration::from_millis(150));
        assert_eq!(exporter.batch_sizes(), vec![5]);

        assert!(wait_until(|| exporter.batch_count() == 2));
        assert_eq!(exporter.batch_sizes(), vec![5, 2]);
    }

    #[test]
    fn test_shutdown_racing_producers_loses_nothing_accepted() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 5_000;

        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        let processor = BatchProcessor::new(idle_config(1024, 64), exporter.clone()).unwrap();
        let start = std::sync::Barrier::new(PRODUCERS as usize + 1);

        let done = thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let processor = &processor;
                let start = &start;
                scope.spawn(move || {
                    start.wait();
                    for i in 0..PER_PRODUCER {
                        processor.enqueue(p * PER_PRODUCER + i);
                    }
                });
            }
            start.wait();
            while processor.metrics().enqueued() < 1_000 {
                thread::yield_now();
            }
            processor.shutdown()
        });

        assert!(done.join(WAIT));
        assert!(done.is_success());
        assert_eq!(processor.state(), ProcessorState::ShutDown);

        let metrics = processor.metrics().snapshot();
        assert_eq!(metrics.enqueued, metrics.exported_records);
        assert_eq!(metrics.enqueued + metrics.dropped, PRODUCERS * PER_PRODUCER);
        assert_eq!(exporter.records().len() as u64, metrics.enqueued);
        assert_eq!(processor.queue_len(), 0);
    }

    #[test]
    fn test_drops_equal_excess_over_capacity() {
        let (exporter, entered_rx, release_tx) = BlockingExporter::new();
        let processor = BatchProcessor::new(idle_config(10, 10), exporter.clone()).unwrap();

        // Park the worker inside export with an empty queue
        for i in 0..10u64 {
            processor.enqueue(i);
        }
        entered_rx.recv_timeout(WAIT).unwrap();
        assert!(wait_until(|| processor.queue_len() == 0));

        for i in 0..25u64 {
            processor.enqueue(100 + i);
        }
        assert_eq!(processor.dropped_records(), 25 - 10);
        assert_eq!(processor.queue_len(), 10);

        // Unblock the parked export and the ones that follow
        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        assert!(processor.shutdown().join(WAIT));
        assert_eq!(exporter.exported.load(Ordering::SeqCst), 20);
        assert_eq!(processor.metrics().enqueued(), 20);
        assert_eq!(processor.dropped_records(), 15);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let exporter = Arc::new(ManualExporter::default());
        let processor = BatchProcessor::new(idle_config(100, 10), exporter.clone()).unwrap();
        for i in 0..15u64 {
            processor.enqueue(i);
        }

        let first = processor.shutdown();
        let second = processor.shutdown();
        assert_eq!(processor.state(), ProcessorState::ShuttingDown);

        // The worker waits on each export in turn; resolve them as they appear.
        assert!(wait_until(|| {
            let pending = exporter.pending();
            for c in &pending {
                c.succeed();
            }
            pending.len() == 2
        }));

        assert!(first.join(WAIT));
        assert!(second.join(WAIT));
        assert_eq!(first.outcome(), second.outcome());
        assert!(first.is_success());
        assert_eq!(exporter.pending().len(), 2);
        assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(processor.state(), ProcessorState::ShutDown);

        assert!(processor.shutdown().is_success());
        assert_eq!(exporter.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_records_dropped_after_shutdown() {
        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        let processor = BatchProcessor::new(idle_config(100, 10), exporter.clone()).unwrap();
        processor.enqueue(1u64);
        assert!(processor.shutdown().join(WAIT));

        processor.enqueue(2);
        processor.enqueue(3);
        assert_eq!(processor.dropped_records(), 2);
        assert_eq!(exporter.records(), vec![1]);
        assert!(exporter.is_shut_down());
        assert_eq!(
            processor.force_flush().outcome(),
            Some(Err(ExportError::ShutDown))
        );
    }

    #[test]
    fn test_schedule_delay_exports_partial_batch() {
        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        let config = idle_config(100, 50).with_schedule_delay(Duration::from_millis(20));
        let processor = BatchProcessor::new(config, exporter.clone()).unwrap();

        for i in 0..3u64 {
            processor.enqueue(i);
        }
        assert!(wait_until(|| exporter.batch_count() == 1));
        assert_eq!(exporter.records(), vec![0, 1, 2]);
    }

    #[test]
    fn test_export_timeout_moves_on() {
        let exporter = Arc::new(ManualExporter::default());
        let config = idle_config(100, 10).with_export_timeout(Duration::from_millis(20));
        let processor = BatchProcessor::new(config, exporter.clone()).unwrap();

        for i in 0..4u64 {
            processor.enqueue(i);
        }
        let first = processor.force_flush();
        assert!(wait_until(|| processor.metrics().export_timeouts() == 1));
        assert!(!first.is_done());

        // The worker gave up waiting on the first export and takes new work
        for i in 4..7u64 {
            processor.enqueue(i);
        }
        let second = processor.force_flush();
        assert!(wait_until(|| exporter.pending().len() == 2));
        assert!(wait_until(|| processor.metrics().export_timeouts() == 2));
        assert!(!first.join(Duration::from_millis(10)));

        for c in exporter.pending() {
            c.succeed();
        }
        assert!(first.join(WAIT) && first.is_success());
        assert!(second.join(WAIT) && second.is_success());
        assert_eq!(processor.metrics().exported_batches(), 2);
        assert_eq!(processor.metrics().exported_records(), 7);
    }

    #[test]
    fn test_flush_reports_export_failure() {
        let exporter = Arc::new(ManualExporter::default());
        let processor = BatchProcessor::new(idle_config(100, 10), exporter.clone()).unwrap();
        for i in 0..7u64 {
            processor.enqueue(i);
        }
        let flushed = processor.force_flush();

        assert!(wait_until(|| exporter.pending().len() == 1));
        exporter.pending()[0].fail(ExportError::RetriesExhausted { attempts: 5 });

        assert!(flushed.join(WAIT));
        assert_eq!(
            flushed.outcome(),
            Some(Err(ExportError::RetriesExhausted { attempts: 5 }))
        );
        assert!(wait_until(|| processor.metrics().export_failures() == 1));
    }

    #[test]
    fn test_exports_serialized_on_worker_thread() {
        let exporter = Arc::new(DeferredExporter::default());
        let processor = BatchProcessor::new(idle_config(1000, 8), exporter.clone()).unwrap();

        thread::scope(|scope| {
            for p in 0..4u64 {
                let processor = &processor;
                scope.spawn(move || {
                    for i in 0..100u64 {
                        processor.enqueue(p * 1_000 + i);
                        if i % 16 == 0 {
                            thread::yield_now();
                        }
                    }
                });
            }
        });

        assert!(processor.shutdown().join(WAIT));
        let accepted = processor.metrics().enqueued();
        assert_eq!(accepted + processor.dropped_records(), 400);
        assert_eq!(exporter.exported.load(Ordering::SeqCst), accepted);
        assert_eq!(exporter.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(exporter
            .worker_threads
            .lock()
            .unwrap()
            .iter()
            .all(|name| name.as_deref() == Some(WORKER_THREAD_NAME)));
    }

    #[test]
    fn test_drop_flushes_and_shuts_down_exporter() {
        let exporter = Arc::new(InMemoryExporter::<u64>::new());
        {
            let processor = BatchProcessor::new(idle_config(100, 10), exporter.clone()).unwrap();
            for i in 0..7u64 {
                processor.enqueue(i);
            }
        }
        assert_eq!(exporter.records(), (0..7).collect::<Vec<_>>());
        assert!(exporter.is_shut_down());
    }

    #[test]
    fn test_drop_cancels_stuck_shutdown() {
        let exporter = Arc::new(ManualExporter::default());
        let config = idle_config(100, 10).with_shutdown_timeout(Duration::from_millis(50));
        let processor = BatchProcessor::new(config, exporter.clone()).unwrap();
        processor.enqueue(1u64);

        let done = processor.shutdown();
        drop(processor);

        // Export never resolved; cancellation fails the shutdown instead of hanging
        assert_eq!(done.outcome(), Some(Err(ExportError::Cancelled)));
        assert!(exporter.pending().iter().all(|c| !c.is_done()));
    }
}
