//! Row-norm staging into on-chip storage.
//!
//! [`NormPrefetcher::issue`] records a guarded copy of one band's row norms
//! and hands back a [`PendingNorms`] token. The copy lands only when the
//! token is waited on, and the token must be consumed before the epilogue
//! reads the store.

/// Issues row-norm copies for a fixed band height.
#[derive(Debug, Clone, Copy)]
pub struct NormPrefetcher {
    band_rows: usize,
}

/// An issued, not yet completed, row-norm copy.
#[must_use = "the prefetched norms are only visible after `wait`"]
#[derive(Debug)]
pub struct PendingNorms<'g> {
    src: &'g [f32],
    row: usize,
    band_rows: usize,
}

impl NormPrefetcher {
    pub fn new(band_rows: usize) -> Self {
        Self { band_rows }
    }

    /// Starts staging the norms of the band whose first row is `row`.
    ///
    /// `row_norms` is the full length-M norm vector.
    pub fn issue<'g>(&self, row_norms: &'g [f32], row: usize) -> PendingNorms<'g> {
        PendingNorms {
            src: row_norms,
            row,
            band_rows: self.band_rows,
        }
    }
}

impl PendingNorms<'_> {
    /// Completes the copy into `store`. Rows past the end of the norm vector
    /// are guarded off and read as zero.
    pub fn wait(self, store: &mut [f32]) {
        for (local, slot) in store.iter_mut().take(self.band_rows).enumerate() {
            *slot = self.src.get(self.row + local).copied().unwrap_or(0.0);
        }
    }
}
