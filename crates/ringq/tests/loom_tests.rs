//! Loom-based concurrency tests for the slot stamp protocol.
//!
//! Run with: `cargo test -p ringq --features loom --test loom_tests --release`
//!
//! Loom exhaustively explores thread interleavings. The queue is modelled in
//! isolation with a tiny capacity to keep the state space tractable.

#![cfg(feature = "loom")]

use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;

struct LoomSlot {
    stamp: AtomicU64,
    value: UnsafeCell<u64>,
}

/// Same protocol as `RingQueue`, built on loom primitives.
struct LoomQueue {
    tail: AtomicU64,
    head: AtomicU64,
    slots: Vec<LoomSlot>,
}

unsafe impl Send for LoomQueue {}
unsafe impl Sync for LoomQueue {}

impl LoomQueue {
    fn new(capacity: u64) -> Self {
        Self {
            tail: AtomicU64::new(0),
            head: AtomicU64::new(0),
            slots: (0..capacity)
                .map(|pos| LoomSlot {
                    stamp: AtomicU64::new(pos << 1),
                    value: UnsafeCell::new(0),
                })
                .collect(),
        }
    }

    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn slot(&self, pos: u64) -> &LoomSlot {
        &self.slots[(pos % self.capacity()) as usize]
    }

    /// Producer: returns false when full
    fn push(&self, value: u64) -> bool {
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = self.slot(tail);
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp == tail << 1 {
                match self.tail.compare_exchange(
                    tail,
                    tail + 1,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        slot.value.with_mut(|p| unsafe { *p = value });
                        slot.stamp.store((tail << 1) | 1, Ordering::Release);
                        return true;
                    }
                    Err(current) => tail = current,
                }
            } else if stamp < tail << 1 {
                return false;
            } else {
                thread::yield_now();
                tail = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Consumer: single thread only
    fn pop(&self) -> Option<u64> {
        let head = self.head.load(Ordering::Relaxed);
        let slot = self.slot(head);
        if slot.stamp.load(Ordering::Acquire) != (head << 1) | 1 {
            return None;
        }
        let value = slot.value.with(|p| unsafe { *p });
        self.head.store(head + 1, Ordering::Release);
        slot.stamp
            .store((head + self.capacity()) << 1, Ordering::Release);
        Some(value)
    }
}

/// Two producers, one consumer: nothing lost, nothing duplicated.
#[test]
fn loom_two_producers_no_loss() {
    loom::model(|| {
        let queue = Arc::new(LoomQueue::new(2));

        let producers: Vec<_> = [10u64, 20]
            .into_iter()
            .map(|value| {
                let q = Arc::clone(&queue);
                thread::spawn(move || assert!(q.push(value)))
            })
            .collect();

        let q = Arc::clone(&queue);
        let consumer = thread::spawn(move || {
            let mut got = Vec::new();
            for _ in 0..3 {
                if let Some(v) = q.pop() {
                    got.push(v);
                }
                thread::yield_now();
            }
            got
        });

        for p in producers {
            p.join().unwrap();
        }
        let mut got = consumer.join().unwrap();
        while let Some(v) = queue.pop() {
            got.push(v);
        }

        got.sort_unstable();
        assert_eq!(got, vec![10, 20]);
    });
}

/// Capacity one, two racing producers: exactly one push succeeds.
#[test]
fn loom_full_rejects_exactly_one() {
    loom::model(|| {
        let queue = Arc::new(LoomQueue::new(1));

        let handles: Vec<_> = [1u64, 2]
            .into_iter()
            .map(|value| {
                let q = Arc::clone(&queue);
                thread::spawn(move || q.push(value))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 1);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    });
}

/// A producer racing the consumer across a lap boundary keeps FIFO order.
#[test]
fn loom_wraparound_fifo() {
    loom::model(|| {
        let queue = Arc::new(LoomQueue::new(1));
        assert!(queue.push(1));

        let q = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            while !q.push(2) {
                thread::yield_now();
            }
        });

        assert_eq!(queue.pop(), Some(1));
        producer.join().unwrap();
        assert_eq!(queue.pop(), Some(2));
    });
}
