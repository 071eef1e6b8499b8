//! Debug assertion macros for queue invariants.
//!
//! Only active in debug builds (`debug_assert!`), so release builds pay nothing.

/// Queue length never exceeds capacity.
///
/// Used in: `RingQueue::try_push()` after a successful claim
macro_rules! debug_assert_bounded_len {
    ($len:expr, $capacity:expr) => {
        debug_assert!(
            $len <= $capacity,
            "bounded length violated: len {} exceeds capacity {}",
            $len,
            $capacity
        )
    };
}

/// A sequence position only moves forward.
///
/// Used in: `RingQueue::pop_single()` for head
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            $new > $old,
            "monotonic progress violated: {} went from {} to {}",
            $name,
            $old,
            $new
        )
    };
}

/// A claimed position holds a published value once no producer can be mid-push.
///
/// Used in: `Drop for RingQueue` for every position between head and tail
macro_rules! debug_assert_published {
    ($stamp:expr, $pos:expr) => {
        debug_assert!(
            $stamp == crate::queue::full_stamp($pos),
            "reading unpublished slot: stamp {} at position {}",
            $stamp,
            $pos
        )
    };
}

pub(crate) use debug_assert_bounded_len;
pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_published;
