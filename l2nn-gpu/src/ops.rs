//! High-level operations on host slices that delegate to a [`Backend`].

use l2nn_core::{L2nnError, Result};

use crate::backend::{Backend, FusedL2NnArgs};
use crate::cpu::squared_row_norms;
use crate::kernel::{FusedL2NnKernel, KernelConfig, KernelParams};
use crate::problem::ProblemDescriptor;
use crate::reduce::{KeyValuePair, ReductionOp};

fn check_points(name: &str, data: &[f32], rows: usize, cols: usize) -> Result<()> {
    if data.len() != rows * cols {
        return Err(L2nnError::InvalidInput(format!(
            "{name}: expected {} elements ({}×{}), got {}",
            rows * cols,
            rows,
            cols,
            data.len()
        )));
    }
    Ok(())
}

/// Squared L2 norm of each row of a `rows × cols` row-major matrix.
pub fn row_norms(backend: &dyn Backend, data: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>> {
    check_points("row_norms", data, rows, cols)?;
    let buf = backend.buffer_from_slice(data)?;
    let norms = backend.row_norms(&buf, rows, cols)?;
    backend.read_buffer(&norms)
}

/// For each of the `m` rows of `x`, the index of and squared (or, with
/// `config.sqrt`, plain) Euclidean distance to its nearest of the `n` rows
/// of `y`. Both point sets are row-major with `k` features per point.
///
/// With `n == 0` every row holds the identity `(NO_INDEX, MAX_DISTANCE)`.
pub fn fused_l2_nn(
    backend: &dyn Backend,
    x: &[f32],
    y: &[f32],
    m: usize,
    n: usize,
    k: usize,
    config: &KernelConfig,
) -> Result<Vec<KeyValuePair>> {
    check_points("fused_l2_nn x", x, m, k)?;
    check_points("fused_l2_nn y", y, n, k)?;

    let xb = backend.buffer_from_slice(x)?;
    let yb = backend.buffer_from_slice(y)?;
    let x_norms = backend.row_norms(&xb, m, k)?;
    let y_norms = backend.row_norms(&yb, n, k)?;
    backend.fused_l2_nn(&FusedL2NnArgs {
        x: &xb,
        y: &yb,
        x_norms: &x_norms,
        y_norms: &y_norms,
        m,
        n,
        k,
        config,
    })
}

/// Host execution of the fused kernel with an arbitrary row reduction.
pub fn fused_l2_nn_with_op<R: ReductionOp>(
    x: &[f32],
    y: &[f32],
    m: usize,
    n: usize,
    k: usize,
    config: &KernelConfig,
    op: &R,
) -> Result<Vec<R::Output>> {
    check_points("fused_l2_nn_with_op x", x, m, k)?;
    check_points("fused_l2_nn_with_op y", y, n, k)?;

    let x_norms = squared_row_norms(x, m, k);
    let y_norms = squared_row_norms(y, n, k);
    let params = KernelParams {
        problem: ProblemDescriptor::contiguous(m, n, k),
        a: x,
        b: y,
        row_norms: &x_norms,
        col_norms: &y_norms,
    };
    let units = config.compute_units.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
    });
    FusedL2NnKernel::new(params, config, op)?.launch(units)
}
