use thiserror::Error;

/// Rejected push. The value is always handed back so the caller owns the drop.
#[derive(Error, PartialEq, Eq)]
pub enum PushError<T> {
    /// The queue holds `capacity` items.
    #[error("queue is full")]
    Full(T),
    /// The queue has been closed.
    #[error("queue is closed")]
    Closed(T),
}

impl<T> PushError<T> {
    /// Recovers the rejected value.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(value) | Self::Closed(value) => value,
        }
    }

    /// Returns `true` if the push failed only because the queue was full.
    #[inline]
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

// Manual impl so `T` need not be `Debug`.
impl<T> std::fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}
