//! Retrying Transport
//!
//! Wraps a one-shot [`Sender`] with bounded retry and capped exponential backoff
//! with full jitter.
//!
//! # Retry Loop
//!
//! ```text
//! attempt 1 ──► Success ──────────────► Ok(Delivery)
//!           ──► Permanent ────────────► Err(Permanent)       (no retry)
//!           ──► Retryable ─┬─ attempt == max_attempts ─► Err(RetriesExhausted)
//!                          └─ sleep U[0, min(backoff, max_backoff))
//!                             ├─ cancelled ─► Err(Cancelled)
//!                             └─ backoff *= multiplier; attempt += 1; loop
//! ```
//!
//! Classification belongs to the [`Sender`]: the loop never inspects payloads or
//! transport errors, it only reacts to the [`SendOutcome`] tag.
//!
//! # Testing Hooks
//!
//! The random source ([`Jitter`]) and the sleep primitive ([`Sleeper`]) are pluggable
//! so tests can pin delays and record every requested backoff.

use crate::completion::{Completion, CompletionGuard};
use crate::error::{ConfigError, ExportError};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// SENDER SEAM
// =============================================================================

/// Why a single send attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReason {
    /// Protocol status code, when the transport has one.
    pub code: Option<u32>,
    pub message: String,
}

impl FailureReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

/// Classified result of one network attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// Worth trying again after a backoff (connect timeout, 503, throttling).
    Retryable(FailureReason),
    /// Retrying cannot help (malformed payload, auth failure, read timeout after
    /// the server may have processed the request).
    Permanent(FailureReason),
}

/// One network attempt for an already-encoded payload.
///
/// Must be safe to call repeatedly and must not keep references to `payload`
/// after the returned future completes.
pub trait Sender: Send + Sync + 'static {
    fn attempt(&self, payload: &[u8]) -> impl Future<Output = SendOutcome> + Send;

    fn name(&self) -> &str {
        "sender"
    }
}

/// Adapts a closure returning a future into a [`Sender`].
///
/// ```
/// use telemetry_relay::{FnSender, SendOutcome};
///
/// let sender = FnSender::new("loopback", |payload: &[u8]| {
///     let len = payload.len();
///     async move {
///         if len > 0 { SendOutcome::Success } else {
///             SendOutcome::Permanent(telemetry_relay::FailureReason::new("empty"))
///         }
///     }
/// });
/// # let _ = sender;
/// ```
pub struct FnSender<F> {
    name: String,
    f: F,
}

impl<F> FnSender<F> {
    pub fn new<Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[u8]) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SendOutcome> + Send,
    {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F, Fut> Sender for FnSender<F>
where
    F: Fn(&[u8]) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SendOutcome> + Send,
{
    fn attempt(&self, payload: &[u8]) -> impl Future<Output = SendOutcome> + Send {
        (self.f)(payload)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Immutable retry configuration attached to one transport.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retry.
    pub max_attempts: u32,
    /// Cap of the first backoff sleep.
    pub initial_backoff: Duration,
    /// Upper bound on every backoff sleep.
    pub max_backoff: Duration,
    /// Growth factor applied to the backoff cap after each retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "max_attempts",
            });
        }
        // Negated so NaN is rejected too
        if !(self.backoff_multiplier > 1.0) {
            return Err(ConfigError::Multiplier(self.backoff_multiplier));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::BackoffOrder {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        Ok(())
    }

    /// Backoff cap before retry number `retry_index` (0-based):
    /// `min(initial_backoff * multiplier^retry_index, max_backoff)`.
    pub fn backoff_cap(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Validating builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.policy.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.policy.max_backoff = backoff;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

// =============================================================================
// JITTER & SLEEP
// =============================================================================

/// Picks the actual delay given the current backoff cap.
pub trait Jitter: Send + Sync + 'static {
    fn sample(&self, cap: Duration) -> Duration;
}

/// Uniform over `[0, cap)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullJitter;

impl Jitter for FullJitter {
    fn sample(&self, cap: Duration) -> Duration {
        let nanos = u64::try_from(cap.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..nanos))
    }
}

/// Always sleeps the full cap. Deterministic; for tests and demos.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn sample(&self, cap: Duration) -> Duration {
        cap
    }
}

/// Sleep primitive used between attempts.
pub trait Sleeper: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

// =============================================================================
// RETRYING TRANSPORT
// =============================================================================

/// Successful delivery report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// A [`Sender`] with retry, backoff and cancellation.
pub struct RetryingTransport<S: Sender> {
    sender: S,
    policy: RetryPolicy,
    jitter: Arc<dyn Jitter>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    /// Metrics: every call into the sender
    attempts_total: AtomicU64,
    /// Metrics: backoff sleeps started
    retries_total: AtomicU64,
    /// Metrics: deliveries that needed more than one attempt
    recovered_total: AtomicU64,
}

impl<S: Sender> RetryingTransport<S> {
    /// Creates a transport after validating `policy`.
    pub fn new(sender: S, policy: RetryPolicy) -> Result<Self, ConfigError> {
        policy.validate()?;
        Ok(Self {
            sender,
            policy,
            jitter: Arc::new(FullJitter),
            sleeper: Arc::new(TokioSleeper),
            cancel: CancellationToken::new(),
            attempts_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
            recovered_total: AtomicU64::new(0),
        })
    }

    pub fn with_jitter(mut self, jitter: impl Jitter) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Sleeper) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Ties this transport to an external token, e.g. a child of the pipeline's.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Interrupts any backoff in progress and fails every later send with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn attempts_total(&self) -> u64 {
        self.attempts_total.load(Ordering::Relaxed)
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    pub fn recovered_total(&self) -> u64 {
        self.recovered_total.load(Ordering::Relaxed)
    }

    /// Runs the retry loop to completion.
    pub async fn send_async(&self, payload: &[u8]) -> Result<Delivery, ExportError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }

            self.attempts_total.fetch_add(1, Ordering::Relaxed);
            let reason = match self.sender.attempt(payload).await {
                SendOutcome::Success => {
                    if attempt > 1 {
                        self.recovered_total.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(Delivery { attempts: attempt });
                }
                SendOutcome::Permanent(reason) => {
                    tracing::warn!(
                        sender = self.sender.name(),
                        attempt,
                        code = reason.code,
                        "permanent send failure: {}",
                        reason.message
                    );
                    return Err(ExportError::Permanent {
                        code: reason.code,
                        message: reason.message,
                    });
                }
                SendOutcome::Retryable(reason) => reason,
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    sender = self.sender.name(),
                    attempts = attempt,
                    code = reason.code,
                    "giving up after retryable failure: {}",
                    reason.message
                );
                return Err(ExportError::RetriesExhausted { attempts: attempt });
            }

            let cap = self.policy.backoff_cap(attempt - 1);
            let delay = self.jitter.sample(cap).min(cap);
            debug_assert!(delay <= self.policy.max_backoff);

            tracing::debug!(
                sender = self.sender.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retryable send failure: {}",
                reason.message
            );
            self.retries_total.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::debug!(sender = self.sender.name(), attempt, "backoff interrupted");
                    return Err(ExportError::Cancelled);
                }
                () = self.sleeper.sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// Starts delivery on the current tokio runtime and returns its completion.
    ///
    /// Outside a runtime the completion fails with [`ExportError::NoRuntime`]. If the
    /// runtime shuts down mid-flight the completion fails with `Cancelled`.
    pub fn send(self: &Arc<Self>, payload: Vec<u8>) -> Completion {
        let completion = Completion::new();
        let Ok(handle) = Handle::try_current() else {
            completion.fail(ExportError::NoRuntime);
            return completion;
        };

        let guard = CompletionGuard::new(completion.clone());
        let transport = Arc::clone(self);
        handle.spawn(async move {
            let outcome = transport.send_async(&payload).await.map(|_| ());
            guard.complete(outcome);
        });
        completion
    }
}
