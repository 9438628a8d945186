//! Structured error types for the l2nn workspace.

use thiserror::Error;

/// Unified error type for all l2nn operations.
#[derive(Debug, Error)]
pub enum L2nnError {
    /// Invalid input (bad arguments, buffer lengths that do not match the problem)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration the kernel cannot implement (tile shape, alignment, on-chip budget)
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Device runtime failure (context init, copy, launch, module load)
    #[error("device error: {0}")]
    Device(String),

    /// A kernel invariant was violated while assembling the output
    #[error("kernel error: {0}")]
    Kernel(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, L2nnError>;
