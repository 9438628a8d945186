//! Row reduction operators for the fused epilogue.
//!
//! A [`ReductionOp`] is a commutative monoid over the candidates of one
//! output row: `identity` seeds the per-row state, `lift` turns a single
//! `(column, distance)` candidate into a state value and `combine` merges two
//! states. Because `combine` is associative and commutative the result does
//! not depend on how the row's columns are split into tiles or compute units.

use core::fmt;

/// Key of a [`KeyValuePair`] that has not seen any candidate yet.
pub const NO_INDEX: usize = usize::MAX;

/// Identity distance; matches the largest finite `f32` like the device kernel.
pub const MAX_DISTANCE: f32 = f32::MAX;

/// A distance together with the column it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyValuePair {
    pub key: usize,
    pub value: f32,
}

impl KeyValuePair {
    pub fn new(key: usize, value: f32) -> Self {
        Self { key, value }
    }

    /// True if no candidate has been folded in.
    pub fn is_empty(&self) -> bool {
        self.key == NO_INDEX
    }
}

impl fmt::Display for KeyValuePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "({}, {})", self.key, self.value)
        }
    }
}

/// Contract for per-row reductions run by the epilogue.
pub trait ReductionOp: Send + Sync {
    /// Per-row state, also the value written to the output buffer.
    type Output: Copy + Send + Sync + fmt::Debug;

    fn identity(&self) -> Self::Output;

    fn lift(&self, column: usize, distance: f32) -> Self::Output;

    /// Must be associative and commutative.
    fn combine(&self, a: Self::Output, b: Self::Output) -> Self::Output;
}

/// Which index wins when two candidates are equally close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TieBreak {
    #[default]
    LowestIndex,
    HighestIndex,
}

impl TieBreak {
    /// Does key `a` beat key `b` on a distance tie? Empty keys always lose.
    #[inline]
    fn prefers(self, a: usize, b: usize) -> bool {
        if a == NO_INDEX {
            return false;
        }
        if b == NO_INDEX {
            return true;
        }
        match self {
            Self::LowestIndex => a < b,
            Self::HighestIndex => a > b,
        }
    }
}

/// Nearest neighbour: smallest distance and its column index.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinAndDistance {
    pub tie_break: TieBreak,
}

impl MinAndDistance {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }
}

impl ReductionOp for MinAndDistance {
    type Output = KeyValuePair;

    fn identity(&self) -> KeyValuePair {
        KeyValuePair::new(NO_INDEX, MAX_DISTANCE)
    }

    fn lift(&self, column: usize, distance: f32) -> KeyValuePair {
        KeyValuePair::new(column, distance)
    }

    #[inline]
    fn combine(&self, a: KeyValuePair, b: KeyValuePair) -> KeyValuePair {
        if b.value < a.value {
            b
        } else if a.value < b.value {
            a
        } else if self.tie_break.prefers(b.key, a.key) {
            b
        } else {
            a
        }
    }
}

/// Distance to the nearest neighbour, without its index.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinDistance;

impl ReductionOp for MinDistance {
    type Output = f32;

    fn identity(&self) -> f32 {
        MAX_DISTANCE
    }

    fn lift(&self, _column: usize, distance: f32) -> f32 {
        distance
    }

    #[inline]
    fn combine(&self, a: f32, b: f32) -> f32 {
        a.min(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_and_distance_picks_smaller_value() {
        let op = MinAndDistance::default();
        let r = op.combine(op.lift(3, 2.0), op.lift(7, 1.0));
        assert_eq!(r, KeyValuePair::new(7, 1.0));
    }

    #[test]
    fn identity_is_neutral() {
        let op = MinAndDistance::default();
        let c = op.lift(4, 0.5);
        assert_eq!(op.combine(op.identity(), c), c);
        assert_eq!(op.combine(c, op.identity()), c);
        assert!(op.identity().is_empty());
    }

    #[test]
    fn identity_never_wins_a_tie_at_max() {
        let op = MinAndDistance::new(TieBreak::HighestIndex);
        let c = op.lift(2, MAX_DISTANCE);
        assert_eq!(op.combine(op.identity(), c).key, 2);
        assert_eq!(op.combine(c, op.identity()).key, 2);
    }

    #[test]
    fn tie_break_rules() {
        let low = MinAndDistance::new(TieBreak::LowestIndex);
        let high = MinAndDistance::new(TieBreak::HighestIndex);
        let (a, b) = (KeyValuePair::new(1, 3.0), KeyValuePair::new(5, 3.0));
        assert_eq!(low.combine(a, b).key, 1);
        assert_eq!(low.combine(b, a).key, 1);
        assert_eq!(high.combine(a, b).key, 5);
        assert_eq!(high.combine(b, a).key, 5);
    }

    #[test]
    fn min_distance() {
        let op = MinDistance;
        assert_eq!(op.combine(op.identity(), 4.0), 4.0);
        assert_eq!(op.combine(2.0, 4.0), 2.0);
    }

    #[test]
    fn display() {
        assert_eq!(KeyValuePair::new(3, 1.5).to_string(), "(3, 1.5)");
        assert_eq!(MinAndDistance::default().identity().to_string(), "(none)");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn candidates() -> impl Strategy<Value = Vec<(usize, f32)>> {
        // Few distinct values so ties are common.
        proptest::collection::vec((0usize..64, (0u8..6).prop_map(f32::from)), 1..40)
    }

    proptest! {
        #[test]
        fn fold_order_does_not_matter(cands in candidates(), split in 0usize..40) {
            for tie_break in [TieBreak::LowestIndex, TieBreak::HighestIndex] {
                let op = MinAndDistance::new(tie_break);
                let forward = cands
                    .iter()
                    .fold(op.identity(), |acc, &(c, d)| op.combine(acc, op.lift(c, d)));
                let backward = cands
                    .iter()
                    .rev()
                    .fold(op.identity(), |acc, &(c, d)| op.combine(op.lift(c, d), acc));
                let split = split.min(cands.len());
                let (l, r) = cands.split_at(split);
                let left = l.iter().fold(op.identity(), |acc, &(c, d)| op.combine(acc, op.lift(c, d)));
                let right = r.iter().fold(op.identity(), |acc, &(c, d)| op.combine(acc, op.lift(c, d)));
                prop_assert_eq!(forward, backward);
                prop_assert_eq!(forward, op.combine(right, left));
            }
        }
    }
}
