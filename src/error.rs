//! Error taxonomy for the sampler.
//!
//! Only conditions that abort a run appear here. Geometry degeneracies and
//! classifier-training skips are recovered locally (see [`crate::shell`] and
//! [`crate::neural`]), and exhausting the likelihood-call budget triggers an
//! orderly phase transition rather than an error.

use thiserror::Error;

/// Fatal conditions surfaced to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// An invalid parameter value, caught at sampler construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The likelihood callable produced an unusable value (NaN or +inf).
    /// Evaluation errors fail the whole batch; no partial results are kept.
    #[error("likelihood evaluation failed: {0}")]
    LikelihoodEvaluation(String),

    /// A checkpoint file could not be decoded or has an incompatible layout.
    #[error("checkpoint corrupted or incompatible: {0}")]
    CheckpointCorruption(String),

    /// Filesystem trouble while reading or writing a checkpoint.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
