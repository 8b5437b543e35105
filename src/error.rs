//! Error taxonomy for the search engine.

use thiserror::Error;

/// Everything that can abort a search.
///
/// Configuration errors are rejected during validation, before any work
/// starts. Resource errors cover worker and device setup. Device errors are
/// faults the GPU reports after a dispatch; they abort the remaining tiles.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The search range must be a positive half-width.
    #[error("range must be positive, got {0}")]
    InvalidRange(i32),

    /// The threshold sign selects the match direction, so zero is
    /// meaningless and rejected rather than guessed at.
    #[error("threshold 0 has no direction; pass a nonzero threshold")]
    ZeroThreshold,

    /// Radii are cell counts and cannot be negative.
    #[error("radii must be non-negative, got outer {outer}, inner {inner}")]
    NegativeRadius { outer: i32, inner: i32 },

    /// The mask bounding box exceeds what the GPU backend can tile.
    #[error("mask side {side} exceeds the device tile limit {limit}")]
    MaskTooLarge { side: i32, limit: i32 },

    /// No compute-capable adapter was found on this machine.
    #[error("no compatible compute adapter available")]
    NoAdapter,

    /// A compute kernel failed to compile or link.
    #[error("kernel compilation failed: {0}")]
    Kernel(String),

    /// A worker thread could not be spawned. Workers that did start are
    /// still joined and their output stands.
    #[error("worker thread failed to start")]
    WorkerSpawn(#[source] std::io::Error),

    /// A worker thread panicked mid-scan.
    #[error("worker thread panicked")]
    WorkerPanic,

    /// The device reported an error after a dispatch or during setup.
    #[error("device error: {0}")]
    Device(String),
}
