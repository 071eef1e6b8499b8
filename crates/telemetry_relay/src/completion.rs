//! One-shot Completion Tokens
//!
//! A [`Completion`] reports the outcome of one asynchronous operation (an export
//! attempt, a flush, a shutdown). It starts pending and moves exactly once to
//! succeeded or failed; whichever caller gets there first wins and every later
//! `succeed`/`fail` is a silent no-op. Racing retry and shutdown paths can both
//! try to resolve the same token without coordinating.
//!
//! # Callback Dispatch
//!
//! Callbacks run synchronously on the thread that resolves the token, or on the
//! registering thread when the token is already terminal. They always run after
//! the internal lock is released, so a callback may call [`Completion::join`],
//! inspect the token, or register more callbacks without deadlocking.
//!
//! # Waiting
//!
//! - [`Completion::join`] blocks an OS thread on a `Condvar` until terminal or timeout
//! - [`Completion::wait`] / [`Completion::wait_timeout`] do the same from async code
//!
//! Timing out a wait is pure observation: the underlying operation keeps running and
//! still resolves the token later.

use crate::error::{ExportError, Outcome};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce(&Outcome) + Send + 'static>;

enum State {
    Pending(Vec<Callback>),
    Done(Outcome),
}

struct Inner {
    state: Mutex<State>,
    done: Condvar,
}

/// Shared handle to a one-shot outcome. Clones observe the same cell.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// Creates a pending completion.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                done: Condvar::new(),
            }),
        }
    }

    /// Creates a completion that has already succeeded.
    pub fn succeeded() -> Self {
        let completion = Self::new();
        completion.succeed();
        completion
    }

    /// Creates a completion that has already failed.
    pub fn failed(error: ExportError) -> Self {
        let completion = Self::new();
        completion.fail(error);
        completion
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves as succeeded. Returns `false` if another caller already resolved it.
    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Resolves as failed. Returns `false` if another caller already resolved it.
    pub fn fail(&self, error: ExportError) -> bool {
        self.complete(Err(error))
    }

    /// Resolves with the given outcome if still pending.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let callbacks = {
            let mut state = self.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(outcome.clone());
                    callbacks
                }
            }
        };

        self.inner.done.notify_all();
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(*self.lock(), State::Done(_))
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(*self.lock(), State::Done(Ok(())))
    }

    /// Returns the terminal outcome, or `None` while pending.
    pub fn outcome(&self) -> Option<Outcome> {
        match &*self.lock() {
            State::Pending(_) => None,
            State::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// Registers a callback invoked exactly once with the terminal outcome.
    ///
    /// If the completion is already terminal the callback runs right here, on the
    /// calling thread, before this method returns.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let outcome = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        callback(&outcome);
    }

    /// Blocks the calling thread until terminal or until `timeout` elapses.
    ///
    /// Returns `true` if the completion is terminal. Never call this from inside
    /// an async task; use [`wait`](Self::wait) there.
    pub fn join(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .inner
            .done
            .wait_timeout_while(state, timeout, |s| matches!(s, State::Pending(_)))
            .unwrap_or_else(PoisonError::into_inner);
        matches!(*state, State::Done(_))
    }

    /// Waits asynchronously for the terminal outcome.
    pub async fn wait(&self) -> Outcome {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        // The sender lives in our own callback list, which outlives `&self`.
        rx.await.unwrap_or(Err(ExportError::Cancelled))
    }

    /// Waits asynchronously for at most `timeout`; `None` means still pending.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Combines children into one completion.
    ///
    /// The result stays pending until every child is terminal. It succeeds iff all
    /// children succeeded; otherwise it fails with the error of the first failed
    /// child in iteration order. An empty collection succeeds immediately.
    pub fn combine<I>(children: I) -> Completion
    where
        I: IntoIterator<Item = Completion>,
    {
        let children: Vec<Completion> = children.into_iter().collect();
        if children.is_empty() {
            return Completion::succeeded();
        }

        let parent = Completion::new();
        let outcomes: Arc<Mutex<Vec<Option<Outcome>>>> =
            Arc::new(Mutex::new(vec![None; children.len()]));
        let remaining = Arc::new(AtomicUsize::new(children.len()));

        for (index, child) in children.iter().enumerate() {
            let parent = parent.clone();
            let outcomes = Arc::clone(&outcomes);
            let remaining = Arc::clone(&remaining);

            child.on_complete(move |outcome| {
                outcomes.lock().unwrap_or_else(PoisonError::into_inner)[index] =
                    Some(outcome.clone());

                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let first_failure = outcomes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .iter()
                        .flatten()
                        .find_map(|o| o.clone().err());
                    parent.complete(first_failure.map_or(Ok(()), Err));
                }
            });
        }

        parent
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.lock() {
            State::Pending(callbacks) => f
                .debug_struct("Completion")
                .field("state", &"pending")
                .field("callbacks", &callbacks.len())
                .finish(),
            State::Done(outcome) => f
                .debug_struct("Completion")
                .field("outcome", outcome)
                .finish(),
        }
    }
}

/// Fails its completion with [`ExportError::Cancelled`] if dropped while pending.
///
/// Owned by in-flight async operations: when the task is aborted or its runtime is
/// torn down, the guard is dropped with the future and the waiting side sees a
/// failure instead of a token that never resolves.
pub struct CompletionGuard {
    completion: Completion,
}

impl CompletionGuard {
    pub fn new(completion: Completion) -> Self {
        Self { completion }
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Resolves the guarded completion, consuming the guard.
    pub fn complete(self, outcome: Outcome) -> bool {
        self.completion.complete(outcome)
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.completion.fail(ExportError::Cancelled) {
            tracing::debug!("operation dropped before completing; resolved as cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_first_transition_wins() {
        let c = Completion::new();
        assert!(!c.is_done());

        assert!(c.succeed());
        assert!(!c.fail(ExportError::Timeout));
        assert!(c.is_success());
        assert_eq!(c.outcome(), Some(Ok(())));

        let c = Completion::new();
        assert!(c.fail(ExportError::Cancelled));
        assert!(!c.succeed());
        assert!(c.is_done());
        assert!(!c.is_success());
        assert_eq!(c.outcome(), Some(Err(ExportError::Cancelled)));
    }

    #[test]
    fn test_racing_resolvers_single_winner() {
        for _ in 0..50 {
            let c = Completion::new();
            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let c = c.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        let won = if i % 2 == 0 {
                            c.succeed()
                        } else {
                            c.fail(ExportError::Transport(format!("thread {i}")))
                        };
                        (i, won)
                    })
                })
                .collect();

            let winners: Vec<_> = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|(_, won)| *won)
                .collect();
            assert_eq!(winners.len(), 1);

            let (winner, _) = winners[0];
            if winner % 2 == 0 {
                assert!(c.is_success());
            } else {
                assert_eq!(
                    c.outcome(),
                    Some(Err(ExportError::Transport(format!("thread {winner}"))))
                );
            }
        }
    }

    #[test]
    fn test_on_complete_after_done_fires_synchronously_once() {
        let c = Completion::succeeded();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        c.on_complete(move |outcome| {
            assert!(outcome.is_ok());
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        // Already fired before on_complete returned
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        c.succeed();
        c.fail(ExportError::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_complete_before_done_fires_once() {
        let c = Completion::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            c.on_complete(move |outcome| {
                assert_eq!(outcome, &Err(ExportError::ShutDown));
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        c.fail(ExportError::ShutDown);
        c.fail(ExportError::ShutDown);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_callback_may_reenter() {
        let c = Completion::new();
        let observed = Arc::new(AtomicUsize::new(0));

        let c_inner = c.clone();
        let observed_clone = Arc::clone(&observed);
        c.on_complete(move |_| {
            // Lock is released before callbacks run, so none of these deadlock.
            assert!(c_inner.join(Duration::from_millis(1)));
            assert!(c_inner.is_done());
            let observed = Arc::clone(&observed_clone);
            c_inner.on_complete(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
            });
        });

        c.succeed();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_times_out_without_changing_outcome() {
        let c = Completion::new();
        let start = Instant::now();
        assert!(!c.join(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!c.is_done());

        c.succeed();
        assert!(c.join(Duration::from_millis(0)));
        assert!(c.is_success());
    }

    #[test]
    fn test_join_wakes_promptly() {
        let c = Completion::new();
        let c_clone = c.clone();
        let resolver = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            c_clone.succeed();
        });

        let start = Instant::now();
        assert!(c.join(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        resolver.join().unwrap();
    }

    #[test]
    fn test_combine_pending_until_all_done() {
        let a = Completion::new();
        let b = Completion::new();
        let parent = Completion::combine([a.clone(), b.clone()]);

        assert!(!parent.is_done());
        a.succeed();
        assert!(!parent.is_done());
        b.succeed();
        assert!(parent.is_success());
    }

    #[test]
    fn test_combine_fails_even_if_other_succeeds_later() {
        let a = Completion::new();
        let b = Completion::new();
        let parent = Completion::combine([a.clone(), b.clone()]);

        a.fail(ExportError::RetriesExhausted { attempts: 5 });
        assert!(!parent.is_done());
        b.succeed();
        assert_eq!(
            parent.outcome(),
            Some(Err(ExportError::RetriesExhausted { attempts: 5 }))
        );
    }

    #[test]
    fn test_combine_reports_first_failure_in_order() {
        let a = Completion::new();
        let b = Completion::new();
        let parent = Completion::combine([a.clone(), b.clone()]);

        b.fail(ExportError::Timeout);
        a.fail(ExportError::Cancelled);
        assert_eq!(parent.outcome(), Some(Err(ExportError::Cancelled)));
    }

    #[test]
    fn test_combine_with_already_terminal_children() {
        let parent = Completion::combine([Completion::succeeded(), Completion::succeeded()]);
        assert!(parent.is_success());

        let parent = Completion::combine([
            Completion::succeeded(),
            Completion::failed(ExportError::ShutDown),
        ]);
        assert_eq!(parent.outcome(), Some(Err(ExportError::ShutDown)));
    }

    #[test]
    fn test_combine_empty_succeeds() {
        assert!(Completion::combine(Vec::new()).is_success());
    }

    #[test]
    fn test_guard_fails_on_drop() {
        let c = Completion::new();
        drop(CompletionGuard::new(c.clone()));
        assert_eq!(c.outcome(), Some(Err(ExportError::Cancelled)));

        let c = Completion::new();
        let guard = CompletionGuard::new(c.clone());
        assert!(guard.complete(Ok(())));
        assert!(c.is_success());
    }

    #[tokio::test]
    async fn test_async_wait() {
        let c = Completion::new();
        let c_clone = c.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c_clone.fail(ExportError::Timeout);
        });

        assert_eq!(c.wait().await, Err(ExportError::Timeout));
        assert_eq!(
            c.wait_timeout(Duration::from_millis(1)).await,
            Some(Err(ExportError::Timeout))
        );
    }

    #[tokio::test]
    async fn test_async_wait_timeout_is_observation_only() {
        let c = Completion::new();
        assert_eq!(c.wait_timeout(Duration::from_millis(5)).await, None);
        assert!(!c.is_done());
        c.succeed();
        assert_eq!(c.wait().await, Ok(()));
    }
}
