//! Persistent fused L2 nearest-neighbour kernel (host execution).
//!
//! Each compute unit owns a static [`WorkChunk`] of output tiles and runs
//! them back to back: stage row norms when a band begins, run the
//! multiply-accumulate main loop, then run the fused epilogue, which keeps a
//! running per-row reduction across the band and emits it at flush points.
//! Units share nothing but read-only inputs, so under the `parallel` feature
//! they run concurrently on the rayon pool.
//!
//! Chunks are cut in tile units, so a row-band can straddle two or more
//! units. Such units emit partial flushes, and [`FusedL2NnKernel::launch`]
//! combines the pieces before writing the row. Rows reduced entirely by one
//! unit are written exactly once.

use l2nn_core::{L2nnError, Result, Summarizable};

use crate::epilogue::{EpilogueReducer, RowFlush};
use crate::mma::{FragmentC, MmaEngine, Operand};
use crate::prefetch::NormPrefetcher;
use crate::problem::{ProblemDescriptor, TileShape, WarpShape};
use crate::reduce::{ReductionOp, TieBreak};
use crate::scheduler::{GridShape, TileSchedule, WorkChunk};
use crate::shared::SharedStorage;

/// Tunables of the fused kernel.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelConfig {
    pub tile: TileShape,
    pub warp: WarpShape,
    /// Compute units to launch; `None` uses the device's parallelism.
    pub compute_units: Option<usize>,
    /// Emit Euclidean instead of squared Euclidean distances.
    pub sqrt: bool,
    pub tie_break: TieBreak,
    /// Elements per vectorized operand access; leading dimensions must be a
    /// multiple of it.
    pub alignment: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tile: TileShape::default(),
            warp: WarpShape::default(),
            compute_units: None,
            sqrt: false,
            tie_break: TieBreak::LowestIndex,
            alignment: 1,
        }
    }
}

impl KernelConfig {
    pub fn with_tile(mut self, tile: TileShape, warp: WarpShape) -> Self {
        self.tile = tile;
        self.warp = warp;
        self
    }

    pub fn with_compute_units(mut self, units: usize) -> Self {
        self.compute_units = Some(units);
        self
    }

    pub fn with_sqrt(mut self, sqrt: bool) -> Self {
        self.sqrt = sqrt;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }
}

impl Summarizable for KernelConfig {
    fn summary(&self) -> String {
        let units = self
            .compute_units
            .map_or_else(|| "auto".to_string(), |u| u.to_string());
        format!(
            "tile {}x{}x{}, warp {}x{}, units {}, sqrt={}",
            self.tile.m, self.tile.n, self.tile.k, self.warp.m, self.warp.n, units, self.sqrt
        )
    }
}

/// Caller-owned inputs of one launch.
#[derive(Debug, Clone, Copy)]
pub struct KernelParams<'g> {
    pub problem: ProblemDescriptor,
    pub a: &'g [f32],
    pub b: &'g [f32],
    /// Squared norms of A's rows, length M.
    pub row_norms: &'g [f32],
    /// Squared norms of B's columns, length N.
    pub col_norms: &'g [f32],
}

impl KernelParams<'_> {
    fn validate(&self) -> Result<()> {
        let size = self.problem.size;
        let checks = [
            ("A", self.a.len(), self.problem.required_len_a()),
            ("B", self.b.len(), self.problem.required_len_b()),
            ("row norms", self.row_norms.len(), size.m),
            ("column norms", self.col_norms.len(), size.n),
        ];
        for (name, got, need) in checks {
            if got < need {
                return Err(L2nnError::InvalidInput(format!(
                    "{name} buffer too small: expected >= {need}, got {got}"
                )));
            }
        }
        Ok(())
    }
}

/// Everything one compute unit produced.
#[derive(Debug, Clone)]
pub struct UnitOutput<T> {
    pub unit: usize,
    pub chunk: WorkChunk,
    pub flushes: Vec<RowFlush<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowState {
    Pending,
    Complete,
    Partial,
}

/// A validated launch of the fused kernel for reduction `R`.
#[derive(Debug)]
pub struct FusedL2NnKernel<'g, 'op, R> {
    params: KernelParams<'g>,
    config: KernelConfig,
    op: &'op R,
    grid: GridShape,
}

impl<'g, 'op, R: ReductionOp> FusedL2NnKernel<'g, 'op, R> {
    /// Validates the configuration and buffers; nothing runs yet.
    pub fn new(params: KernelParams<'g>, config: &KernelConfig, op: &'op R) -> Result<Self> {
        params
            .problem
            .can_implement(&config.tile, &config.warp, config.alignment)?;
        params.validate()?;
        Ok(Self {
            grid: GridShape::for_problem(&params.problem.size, &config.tile),
            params,
            config: config.clone(),
            op,
        })
    }

    pub fn grid(&self) -> GridShape {
        self.grid
    }

    /// On-chip bytes one compute unit needs.
    pub fn shared_mem_bytes(&self) -> usize {
        SharedStorage::<R::Output>::bytes_required(&self.config.tile)
    }

    /// Rejects tile shapes whose on-chip footprint exceeds `budget` bytes.
    pub fn check_shared_budget(&self, budget: usize) -> Result<()> {
        let need = self.shared_mem_bytes();
        if need > budget {
            return Err(L2nnError::Unsupported(format!(
                "tile {}x{}x{} needs {need} bytes of on-chip memory per unit, device offers {budget}",
                self.config.tile.m, self.config.tile.n, self.config.tile.k
            )));
        }
        Ok(())
    }

    /// Runs compute unit `unit` of `units` to completion.
    pub fn run_unit(&self, unit: usize, units: usize) -> UnitOutput<R::Output> {
        let chunk = WorkChunk::for_unit(unit, units, self.grid.tile_count());
        let mut out = UnitOutput {
            unit,
            chunk,
            flushes: Vec::new(),
        };
        if chunk.is_empty() {
            return out;
        }

        let tile = self.config.tile;
        let size = self.params.problem.size;
        let mut smem = SharedStorage::new(tile, self.op.identity());
        let mut accum = FragmentC::new(&tile);
        let engine = MmaEngine::new(tile, self.config.warp);
        let epilogue = EpilogueReducer::new(self.op, tile, self.config.sqrt);
        let prefetcher = NormPrefetcher::new(tile.m);
        let a = Operand::new(self.params.a, self.params.problem.a);
        let b = Operand::new(self.params.b, self.params.problem.b);

        for st in TileSchedule::new(chunk, self.grid, &size, tile) {
            let pending = st
                .stage_norms
                .then(|| prefetcher.issue(self.params.row_norms, st.offset.row));

            engine.run(smem.kernel.main_loop(), &a, &b, &size, st.offset, &mut accum);

            if let Some(pending) = pending {
                pending.wait(&mut smem.rownorm_store);
            }
            epilogue.apply(
                smem.kernel.epilogue(),
                &accum,
                &smem.rownorm_store,
                self.params.col_norms,
                &size,
                &st,
                &mut smem.reduced_store,
                &mut out.flushes,
            );
        }
        out
    }

    /// Runs all `units` compute units and assembles the length-M output.
    ///
    /// Rows of an empty column range (N = 0) keep the identity value.
    pub fn launch(&self, units: usize) -> Result<Vec<R::Output>> {
        if units == 0 {
            return Err(L2nnError::Unsupported(
                "at least one compute unit is required".into(),
            ));
        }
        let tiles = self.grid.tile_count();
        log::debug!(
            "fused L2 NN launch: {} tiles ({}x{}) over {} units, chunk {}",
            tiles,
            self.grid.rows,
            self.grid.columns,
            units,
            tiles.div_ceil(units)
        );

        #[cfg(feature = "parallel")]
        let outputs: Vec<UnitOutput<R::Output>> = {
            use rayon::prelude::*;
            (0..units)
                .into_par_iter()
                .map(|unit| self.run_unit(unit, units))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let outputs: Vec<UnitOutput<R::Output>> =
            (0..units).map(|unit| self.run_unit(unit, units)).collect();

        self.assemble(outputs)
    }

    fn assemble(&self, outputs: Vec<UnitOutput<R::Output>>) -> Result<Vec<R::Output>> {
        let size = self.params.problem.size;
        let mut result = vec![self.op.identity(); size.m];
        let mut state = vec![RowState::Pending; size.m];
        let mut merged = 0usize;

        for unit_out in outputs {
            if unit_out.chunk.splits_row_band(&self.grid) {
                log::debug!(
                    "unit {} chunk {}..{} splits a row-band; merging partial rows",
                    unit_out.unit,
                    unit_out.chunk.start,
                    unit_out.chunk.end
                );
            }
            for flush in unit_out.flushes {
                let row = flush.row;
                match (flush.complete, state[row]) {
                    (true, RowState::Pending) => {
                        result[row] = flush.value;
                        state[row] = RowState::Complete;
                    }
                    (false, RowState::Pending | RowState::Partial) => {
                        result[row] = self.op.combine(result[row], flush.value);
                        state[row] = RowState::Partial;
                        merged += 1;
                    }
                    (_, previous) => {
                        return Err(L2nnError::Kernel(format!(
                            "row {row} flushed by unit {} after a {previous:?} write",
                            unit_out.unit
                        )));
                    }
                }
            }
        }

        if size.n > 0 {
            if let Some(row) = state.iter().position(|s| *s == RowState::Pending) {
                return Err(L2nnError::Kernel(format!("row {row} was never finalized")));
            }
        }
        if merged > 0 {
            log::debug!("merged {merged} partial row results across units");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{l2_nn_reference, squared_row_norms};
    use crate::reduce::{KeyValuePair, MinAndDistance, MinDistance};
    use crate::problem::{OperandLayout, ProblemSize};

    struct Points {
        x: Vec<f32>,
        y: Vec<f32>,
        xn: Vec<f32>,
        yn: Vec<f32>,
        problem: ProblemDescriptor,
    }

    impl Points {
        fn new(x: Vec<f32>, y: Vec<f32>, m: usize, n: usize, k: usize) -> Self {
            let xn = squared_row_norms(&x, m, k);
            let yn = squared_row_norms(&y, n, k);
            Self {
                x,
                y,
                xn,
                yn,
                problem: ProblemDescriptor::contiguous(m, n, k),
            }
        }

        fn params(&self) -> KernelParams<'_> {
            KernelParams {
                problem: self.problem,
                a: &self.x,
                b: &self.y,
                row_norms: &self.xn,
                col_norms: &self.yn,
            }
        }
    }

    /// Deterministic pseudo-random values in [-1, 1).
    fn lcg(n: usize, seed: u64) -> Vec<f32> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    fn config(tile: usize, k: usize) -> KernelConfig {
        KernelConfig::default().with_tile(TileShape::new(tile, tile, k), WarpShape::new(2, 2))
    }

    fn four_by_four() -> Points {
        let x = vec![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 5.0, 5.0];
        let y = vec![1.0, 0.0, 4.0, 4.0, 0.0, 3.0, 6.0, 6.0];
        Points::new(x, y, 4, 4, 2)
    }

    #[test]
    fn single_tile_hand_computed() {
        let pts = four_by_four();
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op).unwrap();
        assert_eq!(kernel.grid().tile_count(), 1);
        let out = kernel.launch(1).unwrap();
        assert_eq!(
            out,
            vec![
                KeyValuePair::new(0, 1.0),
                KeyValuePair::new(0, 1.0),
                // (1,0) and (0,3) are both 5 away from (2,2)
                KeyValuePair::new(0, 5.0),
                // (4,4) and (6,6) are both 2 away from (5,5)
                KeyValuePair::new(1, 2.0),
            ]
        );
    }

    #[test]
    fn tie_break_highest_index() {
        let pts = four_by_four();
        let op = MinAndDistance::new(TieBreak::HighestIndex);
        let out = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op)
            .unwrap()
            .launch(1)
            .unwrap();
        assert_eq!(out[2], KeyValuePair::new(2, 5.0));
        assert_eq!(out[3], KeyValuePair::new(3, 2.0));
    }

    #[test]
    fn sqrt_distances() {
        let pts = four_by_four();
        let op = MinDistance;
        let out = FusedL2NnKernel::new(pts.params(), &config(4, 2).with_sqrt(true), &op)
            .unwrap()
            .launch(1)
            .unwrap();
        assert_eq!(out[0], 1.0);
        assert!((out[3] - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn two_bands_finalize_on_second_tile() {
        let (m, n, k) = (8, 8, 3);
        let pts = Points::new(lcg(m * k, 1), lcg(n * k, 2), m, n, k);
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op).unwrap();
        assert_eq!(kernel.grid().tile_count(), 4);

        for unit in 0..2 {
            let out = kernel.run_unit(unit, 2);
            assert_eq!(out.chunk, WorkChunk { start: unit * 2, end: unit * 2 + 2 });
            assert_eq!(out.flushes.len(), 4);
            for (i, f) in out.flushes.iter().enumerate() {
                assert_eq!(f.row, unit * 4 + i);
                assert_eq!(f.tile, unit * 2 + 1);
                assert!(f.complete);
            }
        }

        let out = kernel.launch(2).unwrap();
        let reference = l2_nn_reference(&pts.x, &pts.y, m, n, k, false);
        for (got, want) in out.iter().zip(&reference) {
            assert!((got.value - want.value).abs() < 1e-5);
        }
    }

    #[test]
    fn each_row_written_exactly_once_without_split() {
        let (m, n, k) = (12, 8, 2);
        let pts = Points::new(lcg(m * k, 3), lcg(n * k, 4), m, n, k);
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op).unwrap();
        // 3 bands x 2 column-tiles, 3 units -> one band each
        let mut writes = vec![0; m];
        for unit in 0..3 {
            for f in kernel.run_unit(unit, 3).flushes {
                assert!(f.complete);
                writes[f.row] += 1;
            }
        }
        assert!(writes.iter().all(|&w| w == 1));
    }

    #[test]
    fn split_row_bands_are_merged() {
        // 2 bands x 3 column-tiles over 4 units: chunks of 2 tiles split band 0
        // between units 0 and 1 and band 1 between units 1 and 2.
        let (m, n, k) = (8, 12, 5);
        let pts = Points::new(lcg(m * k, 5), lcg(n * k, 6), m, n, k);
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op).unwrap();

        let u1 = kernel.run_unit(1, 4);
        assert!(u1.flushes.iter().all(|f| !f.complete));
        assert_eq!(u1.flushes.len(), 8);

        let split = kernel.launch(4).unwrap();
        let whole = kernel.launch(1).unwrap();
        assert_eq!(split, whole);
    }

    #[test]
    fn padded_ld_and_row_major_b_match_reference() {
        // A row-major with ld 8 > k; B stored as a row-major K x N matrix
        // with ld 10 > n. Padding holds a value that would win if it leaked.
        let (m, n, k) = (11, 9, 5);
        let (lda, ldb) = (8, 10);
        let x = lcg(m * k, 21);
        let y = lcg(n * k, 22);

        let problem = ProblemDescriptor::new(
            ProblemSize::new(m, n, k),
            OperandLayout::row_major(lda),
            OperandLayout::row_major(ldb),
        );
        let mut a = vec![999.0; problem.required_len_a()];
        for i in 0..m {
            a[i * lda..i * lda + k].copy_from_slice(&x[i * k..(i + 1) * k]);
        }
        let mut b = vec![999.0; problem.required_len_b()];
        for j in 0..n {
            for kk in 0..k {
                b[kk * ldb + j] = y[j * k + kk];
            }
        }
        assert_eq!(a.len(), (m - 1) * lda + k);
        assert_eq!(b.len(), (k - 1) * ldb + n);

        let xn = squared_row_norms(&x, m, k);
        let yn = squared_row_norms(&y, n, k);
        let params = KernelParams {
            problem,
            a: &a,
            b: &b,
            row_norms: &xn,
            col_norms: &yn,
        };
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(params, &config(4, 2), &op).unwrap();
        let reference = l2_nn_reference(&x, &y, m, n, k, false);
        for units in 1..=7 {
            let out = kernel.launch(units).unwrap();
            for (row, (got, want)) in out.iter().zip(&reference).enumerate() {
                assert_eq!(got.key, want.key, "row {row}, units {units}");
                assert!((got.value - want.value).abs() < 1e-4, "row {row}, units {units}");
            }
        }

        // one element short of the last strided row is rejected
        let short = KernelParams {
            a: &a[..a.len() - 1],
            ..params
        };
        assert!(matches!(
            FusedL2NnKernel::new(short, &config(4, 2), &op),
            Err(L2nnError::InvalidInput(_))
        ));
    }

    #[test]
    fn result_independent_of_unit_count() {
        let (m, n, k) = (13, 11, 7);
        let pts = Points::new(lcg(m * k, 7), lcg(n * k, 8), m, n, k);
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(pts.params(), &config(4, 3), &op).unwrap();
        let baseline = kernel.launch(1).unwrap();
        for units in 2..=20 {
            assert_eq!(kernel.launch(units).unwrap(), baseline, "units = {units}");
        }
    }

    #[test]
    fn single_row_and_single_column() {
        let op = MinAndDistance::default();
        let pts = Points::new(vec![0.5, 0.5], lcg(9 * 2, 9), 1, 9, 2);
        let out = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op)
            .unwrap()
            .launch(3)
            .unwrap();
        let reference = l2_nn_reference(&pts.x, &pts.y, 1, 9, 2, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, reference[0].key);

        let pts = Points::new(lcg(9 * 2, 10), vec![0.25, -0.25], 9, 1, 2);
        let out = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op)
            .unwrap()
            .launch(3)
            .unwrap();
        assert!(out.iter().all(|kv| kv.key == 0));
    }

    #[test]
    fn empty_extents() {
        let op = MinAndDistance::default();
        let pts = Points::new(vec![], vec![1.0, 2.0], 0, 1, 2);
        let out = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op)
            .unwrap()
            .launch(4)
            .unwrap();
        assert!(out.is_empty());

        let pts = Points::new(vec![1.0, 2.0], vec![], 1, 0, 2);
        let out = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op)
            .unwrap()
            .launch(4)
            .unwrap();
        assert_eq!(out, vec![op.identity()]);
    }

    #[test]
    fn zero_units_rejected() {
        let pts = four_by_four();
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(pts.params(), &config(4, 2), &op).unwrap();
        assert!(matches!(kernel.launch(0), Err(L2nnError::Unsupported(_))));
    }

    #[test]
    fn short_buffers_rejected() {
        let pts = four_by_four();
        let op = MinAndDistance::default();
        let mut params = pts.params();
        params.col_norms = &pts.yn[..3];
        assert!(matches!(
            FusedL2NnKernel::new(params, &config(4, 2), &op),
            Err(L2nnError::InvalidInput(_))
        ));
    }

    #[test]
    fn shared_budget_check() {
        let pts = four_by_four();
        let op = MinAndDistance::default();
        let kernel = FusedL2NnKernel::new(pts.params(), &KernelConfig::default(), &op).unwrap();
        let need = kernel.shared_mem_bytes();
        assert!(kernel.check_shared_budget(need).is_ok());
        assert!(kernel.check_shared_budget(need - 1).is_err());
    }

    #[test]
    fn config_summary() {
        let cfg = KernelConfig::default().with_compute_units(8);
        assert_eq!(cfg.summary(), "tile 32x32x16, warp 16x16, units 8, sqrt=false");
    }
}
