//! Problem descriptor, operand layouts, and tile shapes.
//!
//! A [`ProblemDescriptor`] is built once on the host per launch and is
//! read-only for the kernel's lifetime. Operand A is the M×K query matrix,
//! operand B is the K×N matrix whose columns are the candidate points.

use core::fmt;

use l2nn_core::{L2nnError, Result, Summarizable};

/// Storage order of a dense matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Layout {
    /// Consecutive elements of a row are adjacent in memory.
    RowMajor,
    /// Consecutive elements of a column are adjacent in memory.
    ColumnMajor,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RowMajor => write!(f, "row-major"),
            Self::ColumnMajor => write!(f, "column-major"),
        }
    }
}

/// Layout plus leading dimension of one operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OperandLayout {
    pub layout: Layout,
    /// Distance in elements between the starts of consecutive rows
    /// (row-major) or columns (column-major).
    pub ld: usize,
}

impl OperandLayout {
    pub fn row_major(ld: usize) -> Self {
        Self {
            layout: Layout::RowMajor,
            ld,
        }
    }

    pub fn column_major(ld: usize) -> Self {
        Self {
            layout: Layout::ColumnMajor,
            ld,
        }
    }

    /// Linear element offset of logical `(row, col)`.
    #[inline]
    pub fn offset(&self, row: usize, col: usize) -> usize {
        match self.layout {
            Layout::RowMajor => row * self.ld + col,
            Layout::ColumnMajor => col * self.ld + row,
        }
    }

    /// Minimum buffer length holding a `rows × cols` matrix in this layout.
    pub fn required_len(&self, rows: usize, cols: usize) -> usize {
        if rows == 0 || cols == 0 {
            return 0;
        }
        match self.layout {
            Layout::RowMajor => (rows - 1) * self.ld + cols,
            Layout::ColumnMajor => (cols - 1) * self.ld + rows,
        }
    }

    /// The smallest legal leading dimension for a `rows × cols` matrix.
    fn min_ld(&self, rows: usize, cols: usize) -> usize {
        match self.layout {
            Layout::RowMajor => cols,
            Layout::ColumnMajor => rows,
        }
    }
}

/// Logical GEMM extents: A is `m × k`, B is `k × n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProblemSize {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl ProblemSize {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

/// A `(row, column)` position in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MatrixCoord {
    pub row: usize,
    pub column: usize,
}

impl MatrixCoord {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }
}

/// Threadblock tile: `m × n` outputs per tile, `k` reduction depth per
/// main-loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TileShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl TileShape {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

impl Default for TileShape {
    fn default() -> Self {
        Self { m: 32, n: 32, k: 16 }
    }
}

/// Per-warp slice of the threadblock tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WarpShape {
    pub m: usize,
    pub n: usize,
}

impl WarpShape {
    pub fn new(m: usize, n: usize) -> Self {
        Self { m, n }
    }

    /// Warps along `(m, n)` needed to cover `tile`.
    pub fn warp_grid(&self, tile: &TileShape) -> (usize, usize) {
        (tile.m / self.m, tile.n / self.n)
    }
}

impl Default for WarpShape {
    fn default() -> Self {
        Self { m: 16, n: 16 }
    }
}

/// Immutable description of one fused launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProblemDescriptor {
    pub size: ProblemSize,
    pub a: OperandLayout,
    pub b: OperandLayout,
}

impl ProblemDescriptor {
    pub fn new(size: ProblemSize, a: OperandLayout, b: OperandLayout) -> Self {
        Self { size, a, b }
    }

    /// Both point sets stored row-major with `k` features per point.
    ///
    /// `x` is `m × k` row-major; `y` is `n × k` row-major, which is the
    /// `k × n` B operand in column-major order with `ld = k`.
    pub fn contiguous(m: usize, n: usize, k: usize) -> Self {
        Self {
            size: ProblemSize::new(m, n, k),
            a: OperandLayout::row_major(k),
            b: OperandLayout::column_major(k),
        }
    }

    pub fn required_len_a(&self) -> usize {
        self.a.required_len(self.size.m, self.size.k)
    }

    pub fn required_len_b(&self) -> usize {
        self.b.required_len(self.size.k, self.size.n)
    }

    /// Checks whether the kernel supports this problem with the given tile
    /// configuration. Has no side effects.
    ///
    /// `alignment` is the number of elements moved per vectorized access;
    /// leading dimensions must be a multiple of it.
    pub fn can_implement(
        &self,
        tile: &TileShape,
        warp: &WarpShape,
        alignment: usize,
    ) -> Result<()> {
        if tile.m == 0 || tile.n == 0 || tile.k == 0 {
            return Err(L2nnError::Unsupported(format!(
                "tile shape must be non-zero, got {}x{}x{}",
                tile.m, tile.n, tile.k
            )));
        }
        if warp.m == 0 || warp.n == 0 || tile.m % warp.m != 0 || tile.n % warp.n != 0 {
            return Err(L2nnError::Unsupported(format!(
                "warp shape {}x{} does not evenly divide tile {}x{}",
                warp.m, warp.n, tile.m, tile.n
            )));
        }
        if alignment == 0 {
            return Err(L2nnError::Unsupported(
                "alignment must be at least one element".into(),
            ));
        }

        let ProblemSize { m, n, k } = self.size;
        for (name, op, rows, cols) in [("A", &self.a, m, k), ("B", &self.b, k, n)] {
            let min_ld = op.min_ld(rows, cols);
            if op.ld < min_ld {
                return Err(L2nnError::Unsupported(format!(
                    "leading dimension of {name} ({}) is smaller than its {} extent {min_ld}",
                    op.ld, op.layout
                )));
            }
            if op.ld % alignment != 0 {
                return Err(L2nnError::Unsupported(format!(
                    "leading dimension of {name} ({}) is not a multiple of the {alignment}-element access",
                    op.ld
                )));
            }
        }
        Ok(())
    }
}

impl Summarizable for ProblemDescriptor {
    fn summary(&self) -> String {
        format!(
            "fused L2 NN: m={}, n={}, k={} (A {} ld={}, B {} ld={})",
            self.size.m,
            self.size.n,
            self.size.k,
            self.a.layout,
            self.a.ld,
            self.b.layout,
            self.b.ld
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_layout() {
        let rm = OperandLayout::row_major(5);
        let cm = OperandLayout::column_major(3);
        assert_eq!(rm.offset(2, 1), 11);
        assert_eq!(cm.offset(2, 1), 5);
    }

    #[test]
    fn required_len_with_padding() {
        // 3 rows of 4 columns padded to a stride of 6.
        assert_eq!(OperandLayout::row_major(6).required_len(3, 4), 16);
        assert_eq!(OperandLayout::column_major(6).required_len(4, 3), 16);
        assert_eq!(OperandLayout::row_major(6).required_len(0, 4), 0);
    }

    #[test]
    fn contiguous_descriptor() {
        let p = ProblemDescriptor::contiguous(10, 7, 3);
        assert_eq!(p.required_len_a(), 30);
        assert_eq!(p.required_len_b(), 21);
        assert!(p
            .can_implement(&TileShape::default(), &WarpShape::default(), 1)
            .is_ok());
    }

    #[test]
    fn rejects_short_leading_dimension() {
        let p = ProblemDescriptor::new(
            ProblemSize::new(4, 4, 8),
            OperandLayout::row_major(4),
            OperandLayout::column_major(8),
        );
        let err = p
            .can_implement(&TileShape::default(), &WarpShape::default(), 1)
            .unwrap_err();
        assert!(matches!(err, L2nnError::Unsupported(_)));
    }

    #[test]
    fn rejects_misaligned_stride() {
        let p = ProblemDescriptor::contiguous(4, 4, 6);
        assert!(p
            .can_implement(&TileShape::default(), &WarpShape::default(), 4)
            .is_err());
        let p = ProblemDescriptor::contiguous(4, 4, 8);
        assert!(p
            .can_implement(&TileShape::default(), &WarpShape::default(), 4)
            .is_ok());
    }

    #[test]
    fn rejects_bad_tile_and_warp() {
        let p = ProblemDescriptor::contiguous(4, 4, 4);
        assert!(p
            .can_implement(&TileShape::new(0, 4, 4), &WarpShape::new(4, 4), 1)
            .is_err());
        assert!(p
            .can_implement(&TileShape::new(8, 8, 4), &WarpShape::new(3, 4), 1)
            .is_err());
    }

    #[test]
    fn warp_grid_covers_tile() {
        assert_eq!(
            WarpShape::new(16, 16).warp_grid(&TileShape::new(32, 64, 8)),
            (2, 4)
        );
    }

    #[test]
    fn summary_mentions_layouts() {
        let p = ProblemDescriptor::contiguous(2, 3, 4);
        assert_eq!(
            p.summary(),
            "fused L2 NN: m=2, n=3, k=4 (A row-major ld=4, B column-major ld=4)"
        );
    }
}
