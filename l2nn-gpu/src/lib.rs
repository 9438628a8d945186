//! Fused squared-L2 distance and nearest-neighbour reduction.
//!
//! For two point sets `X` (`m × k`) and `Y` (`n × k`) the kernel computes,
//! for every row of `X`, the index of and distance to its closest row of `Y`
//! without materialising the `m × n` distance matrix. Distances use the
//! expanded form `‖x‖² − 2·x·y + ‖y‖²`, with the dot products produced by a
//! tiled multiply-accumulate and reduced per row inside the epilogue.
//!
//! The kernel is persistent: a fixed number of compute units each sweep a
//! contiguous chunk of output tiles. [`CpuBackend`] runs the units on host
//! threads; [`CudaBackend`] (feature `cuda`) runs the same schedule on the
//! GPU.
//!
//! # Quick start
//!
//! ```
//! use l2nn_gpu::{fused_l2_nn, CpuBackend, KernelConfig};
//!
//! let backend = CpuBackend::new();
//! let x = [0.0, 0.0, 5.0, 5.0];
//! let y = [1.0, 0.0, 4.0, 4.0];
//! let nn = fused_l2_nn(&backend, &x, &y, 2, 2, 2, &KernelConfig::default()).unwrap();
//! assert_eq!(nn[0].key, 0);
//! assert_eq!(nn[1].key, 1);
//! assert_eq!(nn[1].value, 2.0);
//! ```
//!
//! # Auto-selecting a backend
//!
//! ```
//! use l2nn_gpu::auto_backend;
//!
//! let backend = auto_backend();
//! let info = backend.device_info();
//! println!("Using: {} ({} units)", info.name, info.compute_units);
//! ```

pub mod backend;
pub mod buffer;
pub mod cpu;
pub mod epilogue;
pub mod kernel;
pub mod mma;
pub mod ops;
pub mod prefetch;
pub mod problem;
pub mod reduce;
pub mod scheduler;
pub mod shared;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use backend::{Backend, BackendKind, DeviceInfo, FusedL2NnArgs};
pub use buffer::Buffer;
pub use cpu::{l2_nn_reference, squared_row_norms, CpuBackend};
pub use kernel::{FusedL2NnKernel, KernelConfig, KernelParams};
pub use ops::{fused_l2_nn, fused_l2_nn_with_op, row_norms};
pub use problem::{Layout, OperandLayout, ProblemDescriptor, ProblemSize, TileShape, WarpShape};
pub use reduce::{
    KeyValuePair, MinAndDistance, MinDistance, ReductionOp, TieBreak, MAX_DISTANCE, NO_INDEX,
};

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

/// Returns the best available backend for the current platform.
///
/// With the `cuda` feature, tries to initialise device 0 and falls back to
/// the CPU when that fails. Without it, always returns the CPU backend.
pub fn auto_backend() -> Box<dyn Backend> {
    #[cfg(feature = "cuda")]
    {
        match CudaBackend::new() {
            Ok(backend) => return Box::new(backend),
            Err(e) => log::warn!("CUDA unavailable, falling back to CPU: {e}"),
        }
    }
    Box::new(CpuBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn auto_backend_returns_cpu() {
        let b = auto_backend();
        assert_eq!(b.device_info().kind, BackendKind::Cpu);
    }

    #[test]
    fn auto_backend_usable_through_trait() {
        let b = auto_backend();
        let out = fused_l2_nn(
            b.as_ref(),
            &[0.0, 0.0, 9.0, 9.0],
            &[10.0, 10.0, 1.0, 1.0],
            2,
            2,
            2,
            &KernelConfig::default(),
        )
        .unwrap();
        assert_eq!(out[0], KeyValuePair::new(1, 2.0));
        assert_eq!(out[1], KeyValuePair::new(0, 2.0));
    }
}
