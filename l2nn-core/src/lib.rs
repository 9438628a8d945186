//! Shared primitives for the l2nn workspace.
//!
//! - **Error types**: [`L2nnError`] and [`Result`] for structured error handling
//! - **Traits**: [`Summarizable`] for one-line diagnostics of configs and devices

pub mod error;
pub mod traits;

pub use error::{L2nnError, Result};
pub use traits::*;
