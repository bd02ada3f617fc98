//! Index taxonomy and shared enums.

use mpi::traits::Equivalence;

/// Quadrant coordinate type. Coordinates of extended quadrants may be
/// negative, so this stays signed.
pub type Coord = i32;

/// Index type for quadrant counts local to one process.
pub type LocIdx = i32;

/// Index type for global (process-wide) quadrant counts.
pub type GloIdx = i64;

/// Index type for trees in the connectivity.
pub type TopIdx = i32;

/// Which neighbor relations participate in 2:1 balance.
///
/// The integer value doubles as the balance selector: `0` is completion
/// without balancing, `d` is full balance in `d` dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Balance {
    /// Completion only, no neighbor condition.
    None = 0,
    /// Balance across faces.
    Face = 1,
    /// Balance across faces and edges (3D only).
    Edge = 2,
    /// Balance across faces, edges and corners.
    Corner = 3,
}

impl Balance {
    /// The selector as used by the balance engine: the number of neighbor
    /// kinds included, clamped to the dimension.
    pub fn selector<const D: usize>(self) -> usize {
        match (self, D) {
            (Balance::None, _) => 0,
            (Balance::Face, _) => 1,
            (Balance::Corner, 2) | (Balance::Edge, _) => 2,
            (Balance::Corner, _) => 3,
        }
    }

    /// Full balance for the given dimension.
    pub fn full<const D: usize>() -> Self {
        if D == 2 {
            Balance::Edge
        } else {
            Balance::Corner
        }
    }
}

/// The (tree, position) of the first quadrant owned by a process.
///
/// The coordinate array is fixed at three entries so that the same wire
/// type serves both dimensions; the z entry is zero in 2D. The level is
/// always the maximum refinement level, marking a first descendant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Equivalence)]
pub struct Position {
    /// Tree containing the first owned quadrant.
    pub which_tree: TopIdx,
    /// Coordinates of the first owned position, as a deepest-level anchor.
    pub coords: [Coord; 3],
    /// Level of the anchor, always the deepest level.
    pub level: i8,
}

impl Position {
    /// The sentinel entry one past the last process.
    pub fn sentinel(num_trees: TopIdx, max_level: i8) -> Self {
        Self {
            which_tree: num_trees,
            coords: [0; 3],
            level: max_level,
        }
    }
}

/// Message tag reserved for the partition-given exchange.
pub const PARTITION_GIVEN_TAG: i32 = 13;

/// Handle into the per-process payload pool.
///
/// Quadrants carry this instead of a pointer; the pool's backing store
/// may reallocate, so addresses are never held across insertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadRef(pub(crate) u32);

impl PayloadRef {
    /// The vacant handle, used when no payload is attached.
    pub const NULL: PayloadRef = PayloadRef(u32::MAX);

    /// Whether the handle refers to a live payload slot.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}
