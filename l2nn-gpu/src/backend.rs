//! Backend trait and core types for the fused L2 nearest-neighbour kernel.

use core::fmt;

use l2nn_core::{Result, Summarizable};

use crate::buffer::Buffer;
use crate::kernel::KernelConfig;
use crate::reduce::KeyValuePair;

/// Identifies which compute backend is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BackendKind {
    /// Host execution of the persistent kernel.
    Cpu,
    /// NVIDIA CUDA backend.
    Cuda,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Cuda => write!(f, "CUDA"),
        }
    }
}

/// Information about a compute device.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    /// Human-readable device name.
    pub name: String,
    /// Backend kind.
    pub kind: BackendKind,
    /// Total device memory in bytes (0 if unknown).
    pub total_memory: u64,
    /// Compute units available to a persistent launch (SMs, host threads).
    pub compute_units: usize,
    /// On-chip bytes one compute unit can hand to a kernel.
    pub shared_mem_per_unit: usize,
}

impl Summarizable for DeviceInfo {
    fn summary(&self) -> String {
        format!(
            "{} ({}, {} bytes, {} units, {} B shared/unit)",
            self.name, self.kind, self.total_memory, self.compute_units, self.shared_mem_per_unit
        )
    }
}

/// Device-resident inputs of one fused L2 NN call.
///
/// `x` is `m × k` row-major, `y` is `n × k` row-major. The norm buffers hold
/// squared L2 norms of the rows of `x` and `y`.
#[derive(Debug, Clone, Copy)]
pub struct FusedL2NnArgs<'a> {
    pub x: &'a Buffer,
    pub y: &'a Buffer,
    pub x_norms: &'a Buffer,
    pub y_norms: &'a Buffer,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub config: &'a KernelConfig,
}

/// Trait for compute backends.
///
/// All backends must be `Send + Sync` for safe use across threads.
pub trait Backend: Send + Sync {
    // ── Resource info ──────────────────────────────────────────────

    /// Returns information about the underlying compute device.
    fn device_info(&self) -> DeviceInfo;

    // ── Buffer management ──────────────────────────────────────────

    /// Creates a buffer from a host slice, copying data to the device.
    fn buffer_from_slice(&self, data: &[f32]) -> Result<Buffer>;

    /// Creates a zero-initialized buffer of the given length.
    fn buffer_zeros(&self, len: usize) -> Result<Buffer>;

    /// Reads device buffer contents back to host memory.
    fn read_buffer(&self, buf: &Buffer) -> Result<Vec<f32>>;

    /// Overwrites device buffer contents from a host slice.
    ///
    /// Returns an error if `data.len() != buf.len()`.
    fn write_buffer(&self, buf: &mut Buffer, data: &[f32]) -> Result<()>;

    /// Copies the first `count` elements of `src` into `dst` on the device.
    fn copy_buffer(&self, src: &Buffer, dst: &mut Buffer, count: usize) -> Result<()>;

    /// Returns the number of `f32` elements in the buffer.
    fn buffer_len(&self, buf: &Buffer) -> usize;

    // ── Distance operations ────────────────────────────────────────

    /// Squared L2 norm of each row of a `rows × cols` row-major matrix.
    fn row_norms(&self, data: &Buffer, rows: usize, cols: usize) -> Result<Buffer>;

    /// For each row of `x`, the index of and distance to its nearest row
    /// of `y`.
    fn fused_l2_nn(&self, args: &FusedL2NnArgs<'_>) -> Result<Vec<KeyValuePair>>;
}
