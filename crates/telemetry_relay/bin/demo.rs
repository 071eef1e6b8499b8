//! # Telemetry Relay Demo
//!
//! End-to-end run of the delivery pipeline against a simulated, unreliable
//! collector backend.
//!
//! ## Features Demonstrated
//!
//! ### 1. Retrying Transport
//! - `SimulatedCollector` implements `Sender` with native async trait syntax
//! - Configurable retryable (503-style) and permanent (400-style) failure rates
//! - Capped exponential backoff with full jitter between attempts
//!
//! ### 2. Batch Processor
//! - Several producer threads calling `enqueue` concurrently, never blocking
//! - Size-triggered and timer-triggered batch export from a single worker
//! - Drop accounting when producers outrun the backend
//!
//! ### 3. Completions
//! - `force_flush()` and `shutdown()` joined with a timeout
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (4 producers, 250 records each)
//! cargo run -p telemetry_relay --bin demo --release -- --quick
//!
//! # Full mode (8 producers, 2000 records each)
//! cargo run -p telemetry_relay --bin demo --release
//!
//! # Verbose mode (debug logs, including every retry)
//! cargo run -p telemetry_relay --bin demo --release -- --verbose
//! ```

use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use telemetry_relay::{
    BatchConfig, BatchProcessor, FailureReason, JsonEncoder, ProcessorMetricsSnapshot,
    RetryPolicy, RetryingTransport, SendOutcome, Sender, TransportExporter,
};
use tracing_subscriber::EnvFilter;

// =============================================================================
// SIMULATED BACKEND
// =============================================================================

/// A collector endpoint that is slow and sometimes unavailable.
struct SimulatedCollector {
    /// Probability of a retryable failure per attempt (0.0 - 1.0)
    unavailable_rate: f64,
    /// Probability of a permanent rejection per attempt (0.0 - 1.0)
    reject_rate: f64,
    latency: Duration,
    attempts: AtomicU64,
    accepted_batches: AtomicU64,
    accepted_bytes: AtomicU64,
}

impl SimulatedCollector {
    fn new(unavailable_rate: f64, reject_rate: f64, latency: Duration) -> Self {
        Self {
            unavailable_rate,
            reject_rate,
            latency,
            attempts: AtomicU64::new(0),
            accepted_batches: AtomicU64::new(0),
            accepted_bytes: AtomicU64::new(0),
        }
    }
}

impl Sender for SimulatedCollector {
    fn attempt(&self, payload: &[u8]) -> impl Future<Output = SendOutcome> + Send {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        // Decide before the await; the thread-local rng is not Send
        let roll: f64 = rand::thread_rng().gen();
        let outcome = if roll < self.reject_rate {
            SendOutcome::Permanent(FailureReason::with_code(400, "payload rejected"))
        } else if roll < self.reject_rate + self.unavailable_rate {
            SendOutcome::Retryable(FailureReason::with_code(503, "collector unavailable"))
        } else {
            self.accepted_batches.fetch_add(1, Ordering::Relaxed);
            self.accepted_bytes
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            SendOutcome::Success
        };
        let latency = self.latency;

        async move {
            tokio::time::sleep(latency).await;
            outcome
        }
    }

    fn name(&self) -> &str {
        "simulated-collector"
    }
}

// =============================================================================
// RECORDS
// =============================================================================

#[derive(Debug, Serialize)]
struct DemoSpan {
    producer: usize,
    seq: u64,
    name: &'static str,
    duration_us: u64,
}

const OPERATIONS: [&str; 5] = [
    "GET /api/orders",
    "db.query",
    "cache.get",
    "grpc.Inventory/Reserve",
    "kafka.publish",
];

fn run_producer(id: usize, count: u64, processor: &BatchProcessor<DemoSpan>) {
    let mut rng = rand::thread_rng();
    for seq in 0..count {
        processor.enqueue(DemoSpan {
            producer: id,
            seq,
            name: OPERATIONS[rng.gen_range(0..OPERATIONS.len())],
            duration_us: rng.gen_range(50..50_000),
        });
        if seq % 64 == 0 {
            thread::sleep(Duration::from_micros(200));
        }
    }
}

fn print_metrics(label: &str, m: &ProcessorMetricsSnapshot) {
    println!(
        "   {label}: enqueued={} exported={} batches={} dropped={} failures={} timeouts={}",
        m.enqueued,
        m.exported_records,
        m.exported_batches,
        m.dropped,
        m.export_failures,
        m.export_timeouts
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.contains(&"--verbose".to_string());
    let quick = args.contains(&"--quick".to_string());

    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_thread_names(true)
        .init();

    let (num_producers, records_per_producer) = if quick { (4, 250) } else { (8, 2_000) };

    println!("📋 Demo Configuration:");
    println!("   Mode: {}", if quick { "quick" } else { "full" });
    println!("   Verbose output: {verbose}");
    println!("   Producers: {num_producers}");
    println!("   Records per producer: {records_per_producer}");
    println!();

    // -------------------------------------------------------------------------
    println!("🔧 Phase 1: Building Export Pipeline\n");

    let policy = RetryPolicy::builder()
        .max_attempts(4)
        .initial_backoff(Duration::from_millis(20))
        .max_backoff(Duration::from_millis(200))
        .backoff_multiplier(1.6)
        .build()?;
    println!(
        "   ✅ Retry: {} attempts, {:?} initial backoff, {:?} cap, {}x growth",
        policy.max_attempts, policy.initial_backoff, policy.max_backoff, policy.backoff_multiplier
    );

    let collector = SimulatedCollector::new(0.25, 0.01, Duration::from_millis(3));
    let transport = RetryingTransport::new(collector, policy)?;
    let exporter = Arc::new(TransportExporter::<DemoSpan, _, _>::new(
        "demo",
        JsonEncoder,
        transport,
    ));

    let config = BatchConfig::low_latency()
        .with_max_queue_size(2_048)
        .with_max_export_batch_size(256)
        .with_schedule_delay(Duration::from_millis(100));
    println!(
        "   ✅ Batching: queue {} records, batch {} records, every {:?}",
        config.max_queue_size, config.max_export_batch_size, config.schedule_delay
    );
    println!();

    let processor = BatchProcessor::new(config, exporter.clone())?;

    // -------------------------------------------------------------------------
    println!("🚀 Phase 2: Starting {num_producers} Producer Threads\n");
    let start = Instant::now();

    thread::scope(|scope| {
        for id in 0..num_producers {
            let processor = &processor;
            scope.spawn(move || {
                run_producer(id, records_per_producer, processor);
                if verbose {
                    println!("   Producer {id} finished");
                }
            });
        }
    });
    let generation_time = start.elapsed();
    println!("\n   ✅ All producers finished in {generation_time:?}");
    print_metrics("after producers", &processor.metrics().snapshot());

    // -------------------------------------------------------------------------
    println!("\n🔁 Phase 3: Force Flush\n");
    let flushed = processor.force_flush();
    if flushed.join(Duration::from_secs(30)) {
        match flushed.outcome() {
            Some(Err(e)) => println!("   ⚠️  Flush finished with error: {e}"),
            _ => println!("   ✅ Flush succeeded"),
        }
    } else {
        println!("   ⚠️  Flush still pending after 30s");
    }

    // -------------------------------------------------------------------------
    println!("\n🛑 Phase 4: Graceful Shutdown\n");
    let done = processor.shutdown();
    if done.join(Duration::from_secs(30)) {
        println!("   ✅ Shutdown complete: {:?}", done.outcome());
    } else {
        println!("   ⚠️  Shutdown did not finish within 30s");
    }

    // -------------------------------------------------------------------------
    println!("\n📊 Phase 5: Final Statistics\n");
    let m = processor.metrics().snapshot();
    let transport = exporter.transport();
    let backend = transport.sender();
    let total_time = start.elapsed();
    let offered = (num_producers as u64) * records_per_producer;

    println!("┌─────────────────────────────────────────────────────┐");
    println!("│             TELEMETRY RELAY DEMO RESULTS            │");
    println!("├─────────────────────────────────────────────────────┤");
    println!("│ Total Execution Time:      {:>12.2?}             │", total_time);
    println!("│ Generation Time:           {:>12.2?}             │", generation_time);
    println!("├─────────────────────────────────────────────────────┤");
    println!("│ Records Offered:           {:>12}             │", offered);
    println!("│ Records Enqueued:          {:>12}             │", m.enqueued);
    println!("│ Records Dropped:           {:>12}             │", m.dropped);
    println!("│ Records Exported:          {:>12}             │", m.exported_records);
    println!("│ Batches Exported:          {:>12}             │", m.exported_batches);
    println!("│ Export Failures:           {:>12}             │", m.export_failures);
    println!("├─────────────────────────────────────────────────────┤");
    println!("│ Send Attempts:             {:>12}             │", transport.attempts_total());
    println!("│ Retries:                   {:>12}             │", transport.retries_total());
    println!("│ Recovered After Retry:     {:>12}             │", transport.recovered_total());
    println!("│ Backend Batches Accepted:  {:>12}             │", backend.accepted_batches.load(Ordering::Relaxed));
    println!("│ Backend Bytes Accepted:    {:>12}             │", backend.accepted_bytes.load(Ordering::Relaxed));
    println!("│ Backend Attempts Seen:     {:>12}             │", backend.attempts.load(Ordering::Relaxed));
    println!("└─────────────────────────────────────────────────────┘");

    let throughput = m.exported_records as f64 / total_time.as_secs_f64();
    println!("\n   Throughput: {throughput:.0} records/sec");

    Ok(())
}
