//! CUDA backend: the persistent fused kernel compiled at runtime.
//!
//! Uses `cudarc` for CUDA driver API access and NVRTC for runtime
//! compilation of the CUDA C kernels to PTX. Operands and norms are `f32`;
//! dot products accumulate in `double`.

pub mod kernels;

use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::compile_ptx;

use l2nn_core::{L2nnError, Result};

use crate::backend::{Backend, BackendKind, DeviceInfo, FusedL2NnArgs};
use crate::buffer::Buffer;
use crate::kernel::KernelConfig;
use crate::problem::{ProblemDescriptor, TileShape};
use crate::reduce::{KeyValuePair, MinAndDistance, ReductionOp, TieBreak, NO_INDEX};

fn device_err(what: &str) -> impl Fn(cudarc::driver::DriverError) -> L2nnError + '_ {
    move |e| L2nnError::Device(format!("CUDA {what}: {e}"))
}

fn to_i32(value: usize, name: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        L2nnError::Unsupported(format!("{name} = {value} exceeds the device index range"))
    })
}

/// NVIDIA CUDA compute backend.
///
/// Compiles the kernels at construction via NVRTC and caches function
/// handles. `cudarc` loads libcuda dynamically, so there is no compile-time
/// CUDA SDK dependency.
pub struct CudaBackend {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    row_norms_fn: CudaFunction,
    fused_fn: CudaFunction,
    name: String,
    sm_count: usize,
    shared_mem_per_block: usize,
}

impl CudaBackend {
    /// Creates a CUDA backend on device 0, compiling all kernels via NVRTC.
    ///
    /// # Errors
    ///
    /// Returns an error if no CUDA device is available, the driver cannot
    /// be loaded, or kernel compilation fails.
    pub fn new() -> Result<Self> {
        let ctx = CudaContext::new(0).map_err(device_err("context init"))?;
        let stream = ctx.default_stream();

        let ptx = compile_ptx(kernels::KERNEL_SOURCE)
            .map_err(|e| L2nnError::Device(format!("CUDA kernel compile: {e}")))?;
        let module = ctx.load_module(ptx).map_err(device_err("module load"))?;
        let load = |name: &str| -> Result<CudaFunction> {
            module
                .load_function(name)
                .map_err(|e| L2nnError::Device(format!("CUDA function '{name}': {e}")))
        };
        let row_norms_fn = load("row_norms")?;
        let fused_fn = load("fused_l2_nn")?;

        let attr = |a: CUdevice_attribute| -> Result<usize> {
            ctx.attribute(a)
                .map(|v| v.max(0) as usize)
                .map_err(device_err("device attribute"))
        };
        let sm_count = attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let shared_mem_per_block =
            attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)?;
        let name = ctx.name().map_err(device_err("device name"))?;
        log::debug!("CUDA device {name}: {sm_count} SMs, {shared_mem_per_block} B shared/block");

        Ok(Self {
            ctx,
            stream,
            row_norms_fn,
            fused_fn,
            name,
            sm_count: sm_count.max(1),
            shared_mem_per_block,
        })
    }

    /// Expose the CUDA context for reuse by callers that own other kernels.
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    fn htod<T: cudarc::driver::DeviceRepr>(&self, data: &[T]) -> Result<CudaSlice<T>> {
        self.stream.memcpy_stod(data).map_err(device_err("htod"))
    }

    fn dtoh<T: cudarc::driver::DeviceRepr>(&self, src: &CudaSlice<T>) -> Result<Vec<T>> {
        self.stream.memcpy_dtov(src).map_err(device_err("dtoh"))
    }

    /// Device view of `buf`, uploading its host data into `scratch` when it
    /// was created by another backend.
    fn device_slice<'b>(
        &self,
        buf: &'b Buffer,
        scratch: &'b mut Option<CudaSlice<f32>>,
    ) -> Result<&'b CudaSlice<f32>> {
        if let Some(ref cs) = buf.cuda_slice {
            return Ok(cs);
        }
        let host = buf
            .as_host_slice()
            .ok_or_else(|| L2nnError::Other("buffer has no data".into()))?;
        Ok(scratch.insert(self.htod(host)?))
    }

    fn check_config(&self, config: &KernelConfig) -> Result<()> {
        let compiled = TileShape::new(kernels::TILE_M, kernels::TILE_N, kernels::TILE_K);
        if config.tile != compiled {
            return Err(L2nnError::Unsupported(format!(
                "CUDA kernel is compiled for a {}x{}x{} tile, got {}x{}x{}",
                compiled.m, compiled.n, compiled.k, config.tile.m, config.tile.n, config.tile.k
            )));
        }
        let need = kernels::FUSED_SHARED_MEM_BYTES;
        if need > self.shared_mem_per_block {
            return Err(L2nnError::Unsupported(format!(
                "kernel needs {need} bytes of shared memory, device offers {}",
                self.shared_mem_per_block
            )));
        }
        Ok(())
    }
}

impl Backend for CudaBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            kind: BackendKind::Cuda,
            total_memory: 0,
            compute_units: self.sm_count,
            shared_mem_per_unit: self.shared_mem_per_block,
        }
    }

    fn buffer_from_slice(&self, data: &[f32]) -> Result<Buffer> {
        let cuda_slice = self.htod(data)?;
        Ok(Buffer::from_cuda(Some(data.to_vec()), cuda_slice, data.len()))
    }

    fn buffer_zeros(&self, len: usize) -> Result<Buffer> {
        let cuda_slice: CudaSlice<f32> =
            self.stream.alloc_zeros(len).map_err(device_err("alloc"))?;
        Ok(Buffer::from_cuda(Some(vec![0.0; len]), cuda_slice, len))
    }

    fn read_buffer(&self, buf: &Buffer) -> Result<Vec<f32>> {
        if let Some(ref data) = buf.host_data {
            return Ok(data.clone());
        }
        if let Some(ref cs) = buf.cuda_slice {
            return self.dtoh(cs);
        }
        Err(L2nnError::Other("buffer has no data".into()))
    }

    fn write_buffer(&self, buf: &mut Buffer, data: &[f32]) -> Result<()> {
        if data.len() != buf.len() {
            return Err(L2nnError::InvalidInput(format!(
                "write_buffer length mismatch: buffer has {} elements, got {}",
                buf.len(),
                data.len()
            )));
        }
        buf.cuda_slice = Some(self.htod(data)?);
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
        if dst.cuda_slice.is_none() {
            let host = dst.host_data.clone().unwrap_or_else(|| vec![0.0; dst.len]);
            dst.cuda_slice = Some(self.htod(&host)?);
        }
        let mut scratch = None;
        let from = self.device_slice(src, &mut scratch)?;
        if let Some(ref mut to) = dst.cuda_slice {
            self.stream
                .memcpy_dtod(&from.slice(..count), &mut to.slice_mut(..count))
                .map_err(device_err("dtod"))?;
        }
        // keep the host mirror only when both sides have one
        match (src.as_host_slice(), dst.host_data.as_mut()) {
            (Some(from), Some(to)) => to[..count].copy_from_slice(&from[..count]),
            _ => dst.host_data = None,
        }
        Ok(())
    }

    fn buffer_len(&self, buf: &Buffer) -> usize {
        buf.len()
    }

    fn row_norms(&self, data: &Buffer, rows: usize, cols: usize) -> Result<Buffer> {
        if data.len() != rows * cols {
            return Err(L2nnError::InvalidInput(format!(
                "row_norms: expected {} elements ({}x{}), got {}",
                rows * cols,
                rows,
                cols,
                data.len()
            )));
        }
        let mut scratch = None;
        let input = self.device_slice(data, &mut scratch)?;
        let out: CudaSlice<f32> = self.stream.alloc_zeros(rows).map_err(device_err("alloc"))?;
        let rows_i = to_i32(rows, "rows")?;
        let cols_i = to_i32(cols, "cols")?;

        if rows > 0 {
            let block = kernels::THREADS;
            let cfg = LaunchConfig {
                grid_dim: ((rows as u32).div_ceil(block), 1, 1),
                block_dim: (block, 1, 1),
                shared_mem_bytes: 0,
            };
            unsafe {
                self.stream
                    .launch_builder(&self.row_norms_fn)
                    .arg(input)
                    .arg(&out)
                    .arg(&rows_i)
                    .arg(&cols_i)
                    .launch(cfg)
            }
            .map_err(device_err("launch"))?;
        }

        let host = self.dtoh(&out)?;
        Ok(Buffer::from_cuda(Some(host), out, rows))
    }

    fn fused_l2_nn(&self, args: &FusedL2NnArgs<'_>) -> Result<Vec<KeyValuePair>> {
        let config = args.config;
        self.check_config(config)?;
        let problem = ProblemDescriptor::contiguous(args.m, args.n, args.k);
        problem.can_implement(&config.tile, &config.warp, config.alignment)?;
        for (name, buf, need) in [
            ("x", args.x, problem.required_len_a()),
            ("y", args.y, problem.required_len_b()),
            ("x norm", args.x_norms, args.m),
            ("y norm", args.y_norms, args.n),
        ] {
            if buf.len() < need {
                return Err(L2nnError::InvalidInput(format!(
                    "{name} buffer too small: expected >= {need}, got {}",
                    buf.len()
                )));
            }
        }

        let units = config.compute_units.unwrap_or(self.sm_count);
        if units == 0 {
            return Err(L2nnError::Unsupported(
                "at least one compute unit is required".into(),
            ));
        }
        let (m, n, k) = (
            to_i32(args.m, "m")?,
            to_i32(args.n, "n")?,
            to_i32(args.k, "k")?,
        );
        let op = MinAndDistance::new(config.tie_break);
        let identity = op.identity();
        if args.m == 0 {
            return Ok(Vec::new());
        }

        let (mut sx, mut sy, mut sxn, mut syn) = (None, None, None, None);
        let x = self.device_slice(args.x, &mut sx)?;
        let y = self.device_slice(args.y, &mut sy)?;
        let xn = self.device_slice(args.x_norms, &mut sxn)?;
        let yn = self.device_slice(args.y_norms, &mut syn)?;

        let edge_len = units * 2 * kernels::TILE_M;
        let out_val = self.htod(&vec![identity.value; args.m])?;
        let out_key = self.htod(&vec![-1i32; args.m])?;
        let edge_val = self.htod(&vec![identity.value; edge_len])?;
        let edge_key = self.htod(&vec![-1i32; edge_len])?;
        let edge_band = self.htod(&vec![-1i32; units * 2])?;
        let sqrt_out = i32::from(config.sqrt);
        let highest = i32::from(config.tie_break == TieBreak::HighestIndex);

        log::debug!(
            "CUDA fused L2 NN: m={} n={} k={} over {units} blocks",
            args.m,
            args.n,
            args.k
        );
        let cfg = LaunchConfig {
            grid_dim: (to_i32(units, "units")? as u32, 1, 1),
            block_dim: (kernels::THREADS, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            self.stream
                .launch_builder(&self.fused_fn)
                .arg(x)
                .arg(y)
                .arg(xn)
                .arg(yn)
                .arg(&m)
                .arg(&n)
                .arg(&k)
                .arg(&sqrt_out)
                .arg(&highest)
                .arg(&out_val)
                .arg(&out_key)
                .arg(&edge_val)
                .arg(&edge_key)
                .arg(&edge_band)
                .launch(cfg)
        }
        .map_err(device_err("launch"))?;

        let vals = self.dtoh(&out_val)?;
        let keys = self.dtoh(&out_key)?;
        let mut result: Vec<KeyValuePair> = vals
            .into_iter()
            .zip(keys)
            .map(|(v, key)| KeyValuePair::new(usize::try_from(key).unwrap_or(NO_INDEX), v))
            .collect();

        // merge rows of bands that straddle blocks
        let edge_val = self.dtoh(&edge_val)?;
        let edge_key = self.dtoh(&edge_key)?;
        let edge_band = self.dtoh(&edge_band)?;
        let mut merged = 0usize;
        for (slot, &band) in edge_band.iter().enumerate() {
            let Ok(band) = usize::try_from(band) else {
                continue;
            };
            let row0 = band * kernels::TILE_M;
            for local in 0..kernels::TILE_M.min(args.m.saturating_sub(row0)) {
                let e = slot * kernels::TILE_M + local;
                let key = usize::try_from(edge_key[e]).unwrap_or(NO_INDEX);
                let row = row0 + local;
                result[row] = op.combine(result[row], KeyValuePair::new(key, edge_val[e]));
                merged += 1;
            }
        }
        if merged > 0 {
            log::debug!("merged {merged} partial row results across blocks");
        }

        if args.n > 0 {
            if let Some(row) = result.iter().position(|kv| kv.is_empty()) {
                return Err(L2nnError::Kernel(format!("row {row} was never finalized")));
            }
        }
        Ok(result)
    }
}
