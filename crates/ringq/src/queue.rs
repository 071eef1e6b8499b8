use crate::invariants::{debug_assert_bounded_len, debug_assert_monotonic, debug_assert_published};
use crate::metrics::Metrics;
use crate::{MetricsSnapshot, PushError, QueueConfig};
use crossbeam_utils::{Backoff, CachePadded};
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// SLOT STAMP PROTOCOL
// =============================================================================
//
// `head` and `tail` are unbounded u64 positions. Position `p` lives in slot
// `p % capacity`, and every slot carries a stamp saying what it is ready for:
//
//   empty, writable for position p:  2p
//   holds the value of position p:   2p + 1
//
// **Producer (any thread):**
// 1. Load `tail` (Relaxed) and the stamp of its slot (Acquire)
// 2. stamp == 2*tail      -> CAS tail to tail+1; the winner owns the slot
// 3. stamp <  2*tail      -> slot still serves the previous lap: queue is full
// 4. stamp >  2*tail      -> another producer already won this position; reload
// 5. Write the value, then store stamp 2*tail+1 (Release) to publish it
//
// **Consumer (exactly one):**
// 1. Load `head` (Relaxed) and the stamp of its slot (Acquire)
// 2. stamp != 2*head+1    -> nothing published at head yet
// 3. Move the value out, store head+1 (Release), then release the slot for the
//    next lap with stamp 2*(head+capacity) (Release)
//
// Storing `head` before the slot stamp means a producer that observes the freed
// slot also observes the advanced head, so `tail - head <= capacity` holds for
// every observer.
//
// The doubled encoding keeps "full for p" and "empty for p+capacity" distinct even
// when capacity is 1, which is why any capacity >= 1 works.
// =============================================================================

#[inline]
pub(crate) const fn empty_stamp(pos: u64) -> u64 {
    pos << 1
}

#[inline]
pub(crate) const fn full_stamp(pos: u64) -> u64 {
    (pos << 1) | 1
}

struct Slot<T> {
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded multi-producer single-consumer queue.
///
/// Construct through [`bounded`], which hands out a cloneable [`Producer`] and the
/// unique [`Consumer`]. The queue itself only exposes the producer side and
/// status queries.
pub struct RingQueue<T> {
    /// Next position to claim (written by producers via CAS)
    tail: CachePadded<AtomicU64>,
    /// Next position to read (written by the consumer only)
    head: CachePadded<AtomicU64>,
    closed: AtomicBool,
    metrics: Metrics,
    config: QueueConfig,
    slots: Box<[Slot<T>]>,
}

// Safety: values are moved in by one producer and out by the consumer, with the
// stamp protocol ordering every access. No `&T` is ever shared across threads.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Creates a queue with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is zero.
    pub fn new(config: QueueConfig) -> Self {
        assert!(config.capacity > 0, "queue capacity must be at least 1");

        let slots = (0..config.capacity as u64)
            .map(|pos| Slot {
                stamp: AtomicU64::new(empty_stamp(pos)),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            tail: CachePadded::new(AtomicU64::new(0)),
            head: CachePadded::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            metrics: Metrics::default(),
            config,
            slots,
        }
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    /// Returns the queue capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Returns the number of claimed positions not yet consumed.
    ///
    /// Approximate under concurrency, but never above [`capacity`](Self::capacity).
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail.saturating_sub(head) as usize).min(self.capacity())
    }

    /// Positions claimed by successful pushes since creation (published or not).
    ///
    /// Together with [`head_position`](Self::head_position) this marks a point in
    /// the stream: values at positions below a recorded tail were pushed before it.
    #[inline]
    pub fn tail_position(&self) -> u64 {
        self.tail.load(Ordering::SeqCst)
    }

    /// Values popped since creation.
    #[inline]
    pub fn head_position(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the queue. Later pushes fail with [`PushError::Closed`]; queued
    /// items stay available to the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns a snapshot of the counters (all zero unless metrics are enabled).
    pub fn metrics(&self) -> MetricsSnapshot {
        if self.config.enable_metrics {
            self.metrics.snapshot()
        } else {
            MetricsSnapshot::default()
        }
    }

    #[inline]
    fn slot(&self, pos: u64) -> &Slot<T> {
        &self.slots[(pos % self.capacity() as u64) as usize]
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Pushes a value without blocking.
    ///
    /// Returns the value inside [`PushError::Full`] when `capacity` items are
    /// queued, or inside [`PushError::Closed`] after [`close`](Self::close).
    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        if self.is_closed() {
            return Err(PushError::Closed(value));
        }

        let backoff = Backoff::new();
        let mut tail = self.tail.load(Ordering::Relaxed);

        loop {
            let slot = self.slot(tail);
            let stamp = slot.stamp.load(Ordering::Acquire);

            if stamp == empty_stamp(tail) {
                match self.tail.compare_exchange_weak(
                    tail,
                    tail + 1,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for `tail` while the slot is stamped
                        // empty for `tail` gives this producer exclusive access to the
                        // slot until the full stamp below publishes it.
                        unsafe {
                            (*slot.value.get()).write(value);
                        }
                        slot.stamp.store(full_stamp(tail), Ordering::Release);

                        debug_assert_bounded_len!(
                            (tail + 1).saturating_sub(self.head.load(Ordering::Acquire)) as usize,
                            self.capacity()
                        );

                        if self.config.enable_metrics {
                            self.metrics.add_pushed(1);
                        }
                        return Ok(());
                    }
                    Err(current) => {
                        tail = current;
                        backoff.spin();
                    }
                }
            } else if stamp < empty_stamp(tail) {
                // The slot still serves the previous lap.
                if self.config.enable_metrics {
                    self.metrics.add_rejected_full(1);
                }
                return Err(PushError::Full(value));
            } else {
                backoff.spin();
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    // ---------------------------------------------------------------------
    // CONSUMER API (reachable only through `Consumer`)
    // ---------------------------------------------------------------------

    /// Pops the value at `head` if it has been published.
    ///
    /// Must only be called by the single consumer; `Consumer` guarantees that.
    fn pop_single(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = self.slot(head);

        if slot.stamp.load(Ordering::Acquire) != full_stamp(head) {
            return None;
        }

        // SAFETY: the full stamp for `head` was published with Release after the
        // producer finished writing, and the Acquire load above synchronizes with
        // it. Only the consumer reads published slots, and the slot is not handed
        // back to producers until the stamp store below.
        let value = unsafe { (*slot.value.get()).assume_init_read() };

        let new_head = head + 1;
        debug_assert_monotonic!("head", head, new_head);
        self.head.store(new_head, Ordering::Release);
        slot.stamp
            .store(empty_stamp(head + self.capacity() as u64), Ordering::Release);

        Some(value)
    }

    fn drain_single<F>(&self, max: usize, mut handler: F) -> usize
    where
        F: FnMut(T),
    {
        let mut count = 0;
        while count < max {
            match self.pop_single() {
                Some(value) => {
                    handler(value);
                    count += 1;
                }
                None => break,
            }
        }

        if count > 0 && self.config.enable_metrics {
            self.metrics.add_popped(count as u64);
        }
        count
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        // `&mut self` means no producer is mid-push, so every claimed position
        // between head and tail has been published.
        let capacity = self.capacity() as u64;
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();

        for pos in head..tail {
            let slot = &mut self.slots[(pos % capacity) as usize];
            let stamp = *slot.stamp.get_mut();
            debug_assert_published!(stamp, pos);
            if stamp == full_stamp(pos) {
                // SAFETY: a full stamp for `pos` means the slot holds an
                // initialized value nobody has moved out.
                unsafe {
                    slot.value.get_mut().assume_init_drop();
                }
            }
        }
    }
}

/// Creates a bounded queue, returning its producer and consumer halves.
pub fn bounded<T>(config: QueueConfig) -> (Producer<T>, Consumer<T>) {
    let queue = Arc::new(RingQueue::new(config));
    (
        Producer {
            queue: Arc::clone(&queue),
        },
        Consumer {
            queue,
            _not_sync: PhantomData,
        },
    )
}

/// Producer half. Cheap to clone; every clone pushes into the same queue.
pub struct Producer<T> {
    queue: Arc<RingQueue<T>>,
}

impl<T> Producer<T> {
    /// Pushes a value without blocking. See [`RingQueue::try_push`].
    #[inline]
    pub fn try_push(&self, value: T) -> Result<(), PushError<T>> {
        self.queue.try_push(value)
    }

    /// Returns the shared queue for status queries.
    #[inline]
    pub fn queue(&self) -> &RingQueue<T> {
        &self.queue
    }
}

// Not derived: `T` need not be `Clone`.
impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Consumer half.
///
/// Neither `Clone` nor `Sync`: a second consumer would race on `head`. It can
/// still be moved to the consuming thread.
pub struct Consumer<T> {
    queue: Arc<RingQueue<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Consumer<T> {
    /// Pops the oldest published value, if any.
    pub fn pop(&self) -> Option<T> {
        let value = self.queue.pop_single();
        if value.is_some() && self.queue.config.enable_metrics {
            self.queue.metrics.add_popped(1);
        }
        value
    }

    /// Pops up to `max` values in FIFO order, transferring ownership to `handler`.
    ///
    /// Stops early at the first position a producer has claimed but not yet
    /// published. Returns the number of values handed out.
    pub fn drain_up_to<F>(&self, max: usize, handler: F) -> usize
    where
        F: FnMut(T),
    {
        self.queue.drain_single(max, handler)
    }

    /// Returns the shared queue for status queries.
    #[inline]
    pub fn queue(&self) -> &RingQueue<T> {
        &self.queue
    }

    /// Returns a producer attached to this consumer's queue.
    pub fn producer(&self) -> Producer<T> {
        Producer {
            queue: Arc::clone(&self.queue),
        }
    }
}
