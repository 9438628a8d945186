//! CPU backend: runs the persistent fused kernel on host threads.

use l2nn_core::{L2nnError, Result};

use crate::backend::{Backend, BackendKind, DeviceInfo, FusedL2NnArgs};
use crate::buffer::Buffer;
use crate::kernel::{FusedL2NnKernel, KernelParams};
use crate::problem::ProblemDescriptor;
use crate::reduce::{KeyValuePair, MinAndDistance, ReductionOp};

/// On-chip budget the host emulation advertises per compute unit.
const SHARED_MEM_PER_UNIT: usize = 48 * 1024;

/// CPU compute backend.
///
/// Each compute unit of the persistent kernel maps to one rayon task, so the
/// default unit count is the host's available parallelism. This backend is
/// the reference implementation and the fallback when no GPU is available.
pub struct CpuBackend {
    parallelism: usize,
}

impl CpuBackend {
    /// Creates a new CPU backend, detecting available parallelism.
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        Self { parallelism }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn host_slice<'b>(buf: &'b Buffer, name: &str) -> Result<&'b [f32]> {
    buf.as_host_slice()
        .ok_or_else(|| L2nnError::Other(format!("{name} buffer has no host data")))
}

impl Backend for CpuBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "CPU".to_string(),
            kind: BackendKind::Cpu,
            total_memory: 0,
            compute_units: self.parallelism,
            shared_mem_per_unit: SHARED_MEM_PER_UNIT,
        }
    }

    fn buffer_from_slice(&self, data: &[f32]) -> Result<Buffer> {
        Ok(Buffer::from_host(data.to_vec()))
    }

    fn buffer_zeros(&self, len: usize) -> Result<Buffer> {
        Ok(Buffer::from_host(vec![0.0; len]))
    }

    fn read_buffer(&self, buf: &Buffer) -> Result<Vec<f32>> {
        host_slice(buf, "source").map(|s| s.to_vec())
    }

    fn write_buffer(&self, buf: &mut Buffer, data: &[f32]) -> Result<()> {
        if data.len() != buf.len() {
            return Err(L2nnError::InvalidInput(format!(
                "write_buffer length mismatch: buffer has {} elements, got {}",
                buf.len(),
                data.len()
            )));
        }
        buf.host_data = Some(data.to_vec());
        Ok(())
    }

    fn copy_buffer(&self, src: &Buffer, dst: &mut Buffer, count: usize) -> Result<()> {
        if count > src.len() || count > dst.len() {
            return Err(L2nnError::InvalidInput(format!(
                "copy_buffer: {count} elements requested, source has {}, destination {}",
                src.len(),
                dst.len()
            )));
        }
        let from = host_slice(src, "source")?;
        let len = dst.len;
        let to = dst.host_data.get_or_insert_with(|| vec![0.0; len]);
        to[..count].copy_from_slice(&from[..count]);
        Ok(())
    }

    fn buffer_len(&self, buf: &Buffer) -> usize {
        buf.len()
    }

    fn row_norms(&self, data: &Buffer, rows: usize, cols: usize) -> Result<Buffer> {
        let flat = host_slice(data, "input")?;
        if flat.len() != rows * cols {
            return Err(L2nnError::InvalidInput(format!(
                "row_norms: expected {} elements ({}×{}), got {}",
                rows * cols,
                rows,
                cols,
                flat.len()
            )));
        }
        Ok(Buffer::from_host(squared_row_norms(flat, rows, cols)))
    }

    fn fused_l2_nn(&self, args: &FusedL2NnArgs<'_>) -> Result<Vec<KeyValuePair>> {
        let params = KernelParams {
            problem: ProblemDescriptor::contiguous(args.m, args.n, args.k),
            a: host_slice(args.x, "x")?,
            b: host_slice(args.y, "y")?,
            row_norms: host_slice(args.x_norms, "x norm")?,
            col_norms: host_slice(args.y_norms, "y norm")?,
        };
        let op = MinAndDistance::new(args.config.tie_break);
        let kernel = FusedL2NnKernel::new(params, args.config, &op)?;
        kernel.check_shared_budget(SHARED_MEM_PER_UNIT)?;
        kernel.launch(args.config.compute_units.unwrap_or(self.parallelism))
    }
}

/// Squared L2 norm of each row of a `rows × cols` row-major matrix,
/// accumulated in `f64`.
pub fn squared_row_norms(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let norm = |i: usize| -> f32 {
        data[i * cols..(i + 1) * cols]
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>() as f32
    };
    #[cfg(feature = "parallel")]
    let norms = {
        use rayon::prelude::*;
        (0..rows).into_par_iter().map(norm).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let norms = (0..rows).map(norm).collect();
    norms
}

/// Materialise-then-reduce reference: builds the full `m × n` distance
/// matrix from direct differences, then takes the lowest-index minimum of
/// every row.
pub fn l2_nn_reference(
    x: &[f32],
    y: &[f32],
    m: usize,
    n: usize,
    k: usize,
    sqrt: bool,
) -> Vec<KeyValuePair> {
    let mut distances = vec![0.0_f32; m * n];
    for i in 0..m {
        let xi = &x[i * k..(i + 1) * k];
        for j in 0..n {
            let yj = &y[j * k..(j + 1) * k];
            let d: f64 = xi
                .iter()
                .zip(yj)
                .map(|(&a, &b)| {
                    let diff = f64::from(a) - f64::from(b);
                    diff * diff
                })
                .sum();
            distances[i * n + j] = if sqrt { d.sqrt() as f32 } else { d as f32 };
        }
    }

    let op = MinAndDistance::default();
    (0..m)
        .map(|i| {
            distances[i * n..(i + 1) * n]
                .iter()
                .enumerate()
                .fold(op.identity(), |acc, (j, &d)| op.combine(acc, op.lift(j, d)))
        })
        .collect()
}
