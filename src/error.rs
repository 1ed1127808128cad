//! Error types for Floodgate.

use thiserror::Error;

/// Result type alias using Floodgate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Floodgate operations.
///
/// The first four variants are fatal: a valve that observes one of them
/// delivers it downstream exactly once and tears itself down. The remaining
/// variants are reported synchronously to the caller that triggered them and
/// never travel through the output stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An item arrived while the valve's buffer was already at capacity.
    #[error("backpressure exceeded: buffer of {capacity} items overflowed")]
    BackpressureExceeded {
        /// The configured buffer capacity.
        capacity: usize,
    },

    /// The upstream source reported a failure.
    ///
    /// Items buffered before the failure are still delivered; the failure
    /// follows once the buffer is empty.
    #[error("upstream failed: {0}")]
    Upstream(String),

    /// The gate source reported a failure.
    #[error("gate failed: {0}")]
    Gate(String),

    /// The gate was shut down while the valve was still alive.
    ///
    /// A valve needs a live gate for its whole lifetime; without one, forward
    /// progress is undecidable, so the valve fails rather than stall.
    #[error("gate terminated unexpectedly")]
    GateTerminated,

    /// A demand request with a negative amount.
    #[error("invalid demand: {0} (n >= 0 required)")]
    InvalidDemand(i64),

    /// The valve no longer accepts input (terminated or cancelled).
    #[error("valve disconnected")]
    Disconnected,
}

impl Error {
    /// Whether this error terminates a valve when it reaches the error slot.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::InvalidDemand(_) | Error::Disconnected)
    }
}
