//! Fused epilogue: accumulator → distances → per-row reduction.
//!
//! For every in-range output `(i, j)` of a tile the epilogue forms
//! `‖xᵢ‖² − 2·xᵢ·yⱼ + ‖yⱼ‖²`, clamps it at zero and stages it in the epilogue
//! phase of shared storage. Each row of the staged tile is then folded into
//! the unit's persistent reduced store. When the scheduler marks the tile as
//! a flush point the finished rows are emitted and their state reset.

use crate::mma::FragmentC;
use crate::problem::{ProblemSize, TileShape};
use crate::reduce::{ReductionOp, MAX_DISTANCE};
use crate::scheduler::ScheduledTile;
use crate::shared::EpilogueStorage;

/// One row's reduced value leaving a compute unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowFlush<T> {
    pub row: usize,
    /// Linear index of the tile after which the row was emitted.
    pub tile: usize,
    pub value: T,
    /// The unit reduced every column of the row. Otherwise this is a partial
    /// result that must be combined with the other units' pieces.
    pub complete: bool,
}

/// Squared distance from the expanded form, clamped against cancellation.
#[inline]
pub fn expanded_distance(row_norm: f32, dot: f64, col_norm: f32, sqrt: bool) -> f32 {
    let d = (f64::from(row_norm) - 2.0 * dot + f64::from(col_norm)).max(0.0);
    if sqrt {
        d.sqrt() as f32
    } else {
        d as f32
    }
}

/// Epilogue for a reduction operator `R`.
#[derive(Debug)]
pub struct EpilogueReducer<'op, R> {
    op: &'op R,
    tile: TileShape,
    sqrt: bool,
}

impl<'op, R: ReductionOp> EpilogueReducer<'op, R> {
    pub fn new(op: &'op R, tile: TileShape, sqrt: bool) -> Self {
        Self { op, tile, sqrt }
    }

    /// Runs the epilogue for `tile`.
    ///
    /// `rownorms` is the staged norm slice of the tile's band, `col_norms` is
    /// the full length-N column norm vector.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        smem: EpilogueStorage<'_>,
        accum: &FragmentC,
        rownorms: &[f32],
        col_norms: &[f32],
        size: &ProblemSize,
        tile: &ScheduledTile,
        reduced: &mut [R::Output],
        flushes: &mut Vec<RowFlush<R::Output>>,
    ) {
        let tn = self.tile.n;
        let rows = self.tile.m.min(size.m.saturating_sub(tile.offset.row));
        let cols = tn.min(size.n.saturating_sub(tile.offset.column));
        let staged = smem.distances;

        for i in 0..self.tile.m {
            for j in 0..tn {
                staged[i * tn + j] = if i < rows && j < cols {
                    expanded_distance(
                        rownorms[i],
                        accum.get(i, j),
                        col_norms[tile.offset.column + j],
                        self.sqrt,
                    )
                } else {
                    MAX_DISTANCE
                };
            }
        }
        // __syncthreads(): staged tile is visible to the row reducers

        for (i, state) in reduced.iter_mut().enumerate().take(rows) {
            let partial = staged[i * tn..i * tn + cols]
                .iter()
                .enumerate()
                .fold(self.op.identity(), |acc, (j, &d)| {
                    self.op.combine(acc, self.op.lift(tile.offset.column + j, d))
                });
            *state = self.op.combine(*state, partial);
        }

        if tile.flush {
            let identity = self.op.identity();
            for (i, state) in reduced.iter_mut().enumerate().take(rows) {
                flushes.push(RowFlush {
                    row: tile.offset.row + i,
                    tile: tile.index,
                    value: *state,
                    complete: tile.complete,
                });
                *state = identity;
            }
        }
    }
}
