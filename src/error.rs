use thiserror::Error;

/// Upper bound on `max_producers` for an MPSC channel.
pub const MAX_PRODUCER_LIMIT: usize = 128;

/// Error types for channel creation and runtime operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Requested capacity was zero, or rounding it up to a power of two
    /// overflowed `usize`.
    #[error("invalid capacity: {requested}")]
    InvalidCapacity {
        /// The capacity as requested by the caller.
        requested: usize,
    },
    /// MPSC `max_producers` outside `1..=MAX_PRODUCER_LIMIT`.
    #[error("invalid producer limit: {requested} (must be 1..={MAX_PRODUCER_LIMIT})")]
    InvalidProducerLimit {
        /// The limit as requested by the caller.
        requested: usize,
    },
    /// All producer slots have been assigned. Slot indices are handed out
    /// monotonically and never reused within a channel's lifetime.
    #[error("too many producers registered (max: {max})")]
    TooManyProducers {
        /// The configured maximum number of producers.
        max: usize,
    },
    /// Channel is closed.
    #[error("channel is closed")]
    Closed,
}
