//! Error types for the lease allocation core.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.
//!
//! Protocol outcomes (NAK, no-reply, cached reuse) are *not* errors; they are
//! carried in [`AllocationResult`](crate::engine::AllocationResult). Only
//! conditions that prevent the engine from reaching a decision at all appear
//! here.

/// Errors that can occur while processing a client message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The lease repository failed on a read or write.
    ///
    /// This is a hard failure: the engine cannot fabricate an allocation
    /// decision without a durable lease record, so the caller receives this
    /// error and sends nothing to the client.
    #[error("lease repository error: {0}")]
    Repository(String),

    /// The reservation backend failed on a lookup.
    ///
    /// Raised by backend implementations; the engine catches it and
    /// proceeds as if no reservation existed (fail-open), so it does not
    /// normally cross the engine boundary.
    #[error("reservation backend error: {0}")]
    ReservationLookup(String),

    /// JSON serialization/deserialization error (snapshot or lease blobs).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration snapshot.
    ///
    /// Returned by [`ConfigSnapshot::new`](crate::config::ConfigSnapshot::new)
    /// when subnets, pools, or identifier orderings fail validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A client message missing fields its message type requires.
    ///
    /// A REQUEST with neither a requested-address option nor a non-zero
    /// ciaddr cannot be classified into any protocol state.
    #[error("malformed client message: {0}")]
    InvalidMessage(String),
}

/// A specialized Result type for allocation operations.
pub type Result<T> = std::result::Result<T, Error>;
