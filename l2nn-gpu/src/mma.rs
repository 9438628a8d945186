//! Threadblock-scoped matrix multiply for one output tile.
//!
//! The reduction dimension is walked in `tile.k` steps. Each step stages an
//! A tile and a B tile into the main-loop phase of shared storage (guarded,
//! so partial edge tiles read zeros), then every warp accumulates its
//! `warp.m × warp.n` slice of the output from the staged tiles. Operands are
//! `f32`; the accumulator is `f64`.

use crate::problem::{MatrixCoord, OperandLayout, ProblemSize, TileShape, WarpShape};
use crate::shared::MainLoopStorage;

/// Read-only operand: data plus the layout it is stored in.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'g> {
    pub data: &'g [f32],
    pub layout: OperandLayout,
}

impl<'g> Operand<'g> {
    pub fn new(data: &'g [f32], layout: OperandLayout) -> Self {
        Self { data, layout }
    }

    #[inline]
    fn at(&self, row: usize, col: usize) -> f32 {
        self.data[self.layout.offset(row, col)]
    }
}

/// Per-tile accumulator, `tile.m × tile.n` row-major.
#[derive(Debug, Clone)]
pub struct FragmentC {
    data: Vec<f64>,
    columns: usize,
}

impl FragmentC {
    pub fn new(tile: &TileShape) -> Self {
        Self {
            data: vec![0.0; tile.m * tile.n],
            columns: tile.n,
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.columns + col]
    }
}

/// Multiply-accumulate engine for a fixed tile/warp configuration.
#[derive(Debug, Clone, Copy)]
pub struct MmaEngine {
    tile: TileShape,
    warp: WarpShape,
}

impl MmaEngine {
    pub fn new(tile: TileShape, warp: WarpShape) -> Self {
        Self { tile, warp }
    }

    /// Number of main-loop iterations for reduction depth `k`.
    pub fn k_iterations(&self, k: usize) -> usize {
        k.div_ceil(self.tile.k)
    }

    /// Computes `A[rows, :] · B[:, cols]` for the tile at `offset` into
    /// `accum`, overwriting its previous contents.
    pub fn run(
        &self,
        smem: MainLoopStorage<'_>,
        a: &Operand<'_>,
        b: &Operand<'_>,
        size: &ProblemSize,
        offset: MatrixCoord,
        accum: &mut FragmentC,
    ) {
        accum.clear();
        let MainLoopStorage {
            a: a_tile,
            b: b_tile,
        } = smem;

        for step in 0..self.k_iterations(size.k) {
            let k0 = step * self.tile.k;
            self.load_a(a_tile, a, size, offset.row, k0);
            self.load_b(b_tile, b, size, offset.column, k0);
            // __syncthreads(): tiles are complete before any warp reads them

            let (warps_m, warps_n) = self.warp.warp_grid(&self.tile);
            for wm in 0..warps_m {
                for wn in 0..warps_n {
                    self.warp_mma(a_tile, b_tile, wm * self.warp.m, wn * self.warp.n, accum);
                }
            }
            // __syncthreads(): all warps are done before the next load
        }
    }

    fn load_a(&self, dst: &mut [f32], a: &Operand<'_>, size: &ProblemSize, row0: usize, k0: usize) {
        let tk = self.tile.k;
        for (idx, slot) in dst.iter_mut().enumerate() {
            let (r, kk) = (row0 + idx / tk, k0 + idx % tk);
            *slot = if r < size.m && kk < size.k { a.at(r, kk) } else { 0.0 };
        }
    }

    fn load_b(&self, dst: &mut [f32], b: &Operand<'_>, size: &ProblemSize, col0: usize, k0: usize) {
        let tn = self.tile.n;
        for (idx, slot) in dst.iter_mut().enumerate() {
            let (kk, c) = (k0 + idx / tn, col0 + idx % tn);
            *slot = if kk < size.k && c < size.n { b.at(kk, c) } else { 0.0 };
        }
    }

    /// One warp's multiply-accumulate over the staged `k`-deep tiles.
    fn warp_mma(&self, a_tile: &[f32], b_tile: &[f32], m0: usize, n0: usize, accum: &mut FragmentC) {
        let (tk, tn) = (self.tile.k, self.tile.n);
        for i in m0..m0 + self.warp.m {
            let a_row = &a_tile[i * tk..(i + 1) * tk];
            let acc_row = &mut accum.data[i * tn + n0..i * tn + n0 + self.warp.n];
            for (kk, &av) in a_row.iter().enumerate() {
                let av = f64::from(av);
                let b_row = &b_tile[kk * tn + n0..kk * tn + n0 + self.warp.n];
                for (acc, &bv) in acc_row.iter_mut().zip(b_row) {
                    *acc += av * f64::from(bv);
                }
            }
        }
    }
}
