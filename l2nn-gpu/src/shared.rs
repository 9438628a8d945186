//! On-chip storage for one compute unit.
//!
//! The main loop and the epilogue of a tile never run at the same time, so
//! their working sets share a single [`PhaseArena`] sized for the larger of
//! the two. Each phase borrows the arena mutably through its own view type,
//! so the two views can never be alive together.
//!
//! Row norms and the running per-row reduction must outlive the phase switch
//! on every tile, so they live in separate allocations next to the arena.

use core::mem::size_of;

use crate::problem::TileShape;

/// Words needed by the main loop: one A tile and one B tile.
fn main_loop_words(tile: &TileShape) -> usize {
    tile.m * tile.k + tile.k * tile.n
}

/// Words needed by the epilogue: the staged distance tile.
fn epilogue_words(tile: &TileShape) -> usize {
    tile.m * tile.n
}

/// Storage shared by the mutually exclusive main-loop and epilogue phases.
#[derive(Debug)]
pub struct PhaseArena {
    words: Vec<f32>,
    tile: TileShape,
}

/// Main-loop view: the current A tile (`m × k`, row-major) and B tile
/// (`k × n`, row-major).
#[derive(Debug)]
pub struct MainLoopStorage<'a> {
    pub a: &'a mut [f32],
    pub b: &'a mut [f32],
}

/// Epilogue view: the staged `m × n` distance tile, row-major.
#[derive(Debug)]
pub struct EpilogueStorage<'a> {
    pub distances: &'a mut [f32],
}

impl PhaseArena {
    pub fn new(tile: TileShape) -> Self {
        let words = main_loop_words(&tile).max(epilogue_words(&tile));
        Self {
            words: vec![0.0; words],
            tile,
        }
    }

    pub fn main_loop(&mut self) -> MainLoopStorage<'_> {
        let a_len = self.tile.m * self.tile.k;
        let b_len = self.tile.k * self.tile.n;
        let (a, rest) = self.words.split_at_mut(a_len);
        MainLoopStorage {
            a,
            b: &mut rest[..b_len],
        }
    }

    pub fn epilogue(&mut self) -> EpilogueStorage<'_> {
        let len = epilogue_words(&self.tile);
        EpilogueStorage {
            distances: &mut self.words[..len],
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Everything a compute unit keeps on chip.
#[derive(Debug)]
pub struct SharedStorage<T> {
    /// Re-purposed every tile.
    pub kernel: PhaseArena,
    /// Running reduction for the rows of the current band; survives tiles.
    pub reduced_store: Vec<T>,
    /// Prefetched row norms for the current band; survives tiles.
    pub rownorm_store: Vec<f32>,
}

impl<T: Copy> SharedStorage<T> {
    pub fn new(tile: TileShape, identity: T) -> Self {
        Self {
            kernel: PhaseArena::new(tile),
            reduced_store: vec![identity; tile.m],
            rownorm_store: vec![0.0; tile.m],
        }
    }

    /// Bytes one unit needs for `tile` with a reduction state of `T`.
    pub fn bytes_required(tile: &TileShape) -> usize {
        let arena = main_loop_words(tile).max(epilogue_words(tile)) * size_of::<f32>();
        arena + tile.m * size_of::<T>() + tile.m * size_of::<f32>()
    }
}
