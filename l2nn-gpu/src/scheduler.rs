//! Static tile scheduling for the persistent kernel.
//!
//! The output tile grid is swept in row-major order and cut into contiguous
//! chunks of `ceil(tiles / units)` linear tile indices, one chunk per
//! compute unit. Everything here is a pure function of the grid shape and
//! the unit index; there is no shared scheduler state.

use crate::problem::{MatrixCoord, ProblemSize, TileShape};

/// Tile-grid extents: `rows` row-bands by `columns` column-tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub rows: usize,
    pub columns: usize,
}

impl GridShape {
    pub fn for_problem(size: &ProblemSize, tile: &TileShape) -> Self {
        Self {
            rows: size.m.div_ceil(tile.m),
            columns: size.n.div_ceil(tile.n),
        }
    }

    pub fn tile_count(&self) -> usize {
        self.rows * self.columns
    }

    /// Row-major position of linear tile `idx`. Only valid for non-empty grids.
    #[inline]
    pub fn coord(&self, idx: usize) -> TileCoord {
        TileCoord {
            row: idx / self.columns,
            column: idx % self.columns,
        }
    }

    /// First linear tile index of row-band `band`.
    #[inline]
    pub fn band_start(&self, band: usize) -> usize {
        band * self.columns
    }
}

/// Tile position in tile units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub row: usize,
    pub column: usize,
}

impl TileCoord {
    /// Element offset of the tile's top-left output.
    pub fn offset(&self, tile: &TileShape) -> MatrixCoord {
        MatrixCoord::new(self.row * tile.m, self.column * tile.n)
    }
}

/// Half-open range of linear tile indices owned by one compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkChunk {
    pub start: usize,
    pub end: usize,
}

impl WorkChunk {
    /// Chunk owned by `unit` out of `units` over `tile_count` tiles.
    ///
    /// `units` must be non-zero; the launcher validates this.
    pub fn for_unit(unit: usize, units: usize, tile_count: usize) -> Self {
        let chunk = tile_count.div_ceil(units);
        let start = (unit * chunk).min(tile_count);
        let end = (unit * chunk + chunk).min(tile_count);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True if this chunk begins or ends part-way through a row-band, so some
    /// of its rows are shared with a neighbouring unit.
    pub fn splits_row_band(&self, grid: &GridShape) -> bool {
        !self.is_empty() && (self.start % grid.columns != 0 || self.end % grid.columns != 0)
    }
}

/// One step of a unit's persistent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTile {
    pub index: usize,
    pub coord: TileCoord,
    pub offset: MatrixCoord,
    /// Row norms for this tile's band must be staged before the epilogue.
    pub stage_norms: bool,
    /// The reduced state is written out after this tile.
    pub flush: bool,
    /// The flushed rows saw every column-tile of the band in this unit.
    pub complete: bool,
}

/// Iterator over the tiles of one [`WorkChunk`] in sweep order.
#[derive(Debug, Clone)]
pub struct TileSchedule {
    grid: GridShape,
    tile: TileShape,
    n: usize,
    chunk: WorkChunk,
    next: usize,
}

impl TileSchedule {
    pub fn new(chunk: WorkChunk, grid: GridShape, size: &ProblemSize, tile: TileShape) -> Self {
        Self {
            grid,
            tile,
            n: size.n,
            chunk,
            next: chunk.start,
        }
    }
}

impl Iterator for TileSchedule {
    type Item = ScheduledTile;

    fn next(&mut self) -> Option<ScheduledTile> {
        if self.next >= self.chunk.end {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let coord = self.grid.coord(index);
        let offset = coord.offset(&self.tile);
        let band_end = offset.column + self.tile.n >= self.n;
        let has_next = index + 1 < self.chunk.end;

        Some(ScheduledTile {
            index,
            coord,
            offset,
            stage_norms: index == self.chunk.start || coord.column == 0,
            flush: band_end || !has_next,
            complete: band_end && self.grid.band_start(coord.row) >= self.chunk.start,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.chunk.end.saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for TileSchedule {}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn chunks_are_a_disjoint_cover(tiles in 0usize..500, units in 1usize..64) {
            let mut owner = vec![0u32; tiles];
            for unit in 0..units {
                let chunk = WorkChunk::for_unit(unit, units, tiles);
                prop_assert!(chunk.start <= chunk.end);
                prop_assert!(chunk.end <= tiles);
                for slot in &mut owner[chunk.start..chunk.end] {
                    *slot += 1;
                }
            }
            prop_assert!(owner.iter().all(|&c| c == 1));
        }

        #[test]
        fn every_band_is_flushed_completely_at_most_once(
            m in 1usize..40,
            n in 1usize..40,
            units in 1usize..12,
        ) {
            let tile = TileShape::new(4, 4, 1);
            let size = ProblemSize::new(m, n, 1);
            let grid = GridShape::for_problem(&size, &tile);
            let mut complete = vec![0u32; grid.rows];
            let mut partial = vec![0u32; grid.rows];
            for unit in 0..units {
                let chunk = WorkChunk::for_unit(unit, units, grid.tile_count());
                for t in TileSchedule::new(chunk, grid, &size, tile).filter(|t| t.flush) {
                    if t.complete {
                        complete[t.coord.row] += 1;
                    } else {
                        partial[t.coord.row] += 1;
                    }
                }
            }
            for band in 0..grid.rows {
                let whole = complete[band] == 1 && partial[band] == 0;
                let split = complete[band] == 0 && partial[band] >= 2;
                prop_assert!(whole || split, "band {} complete={} partial={}", band, complete[band], partial[band]);
            }
        }
    }
}
