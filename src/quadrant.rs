//! Quadrant algebra: Morton order, ancestry and neighborhood arithmetic.
//!
//! A quadrant is identified by the integer coordinates of its lower left
//! (front) corner and a refinement level. All operations here are pure
//! coordinate/bit arithmetic; none of them require the tree or the
//! connectivity. The dimension is a const parameter, `D = 2` for
//! quadtrees and `D = 3` for octrees.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::types::{Coord, PayloadRef};

/// A quadrant (2D) or octant (3D) of a single tree.
///
/// Coordinates are multiples of the side length at `level` and address
/// the corner closest to the tree origin. The payload handle `data` is
/// carried along but never participates in comparisons or hashing; two
/// quadrants are the same cell whenever coordinates and level agree.
#[derive(Clone, Copy)]
pub struct Quadrant<const D: usize> {
    /// Anchor coordinates, aligned to `len(level)`.
    pub coords: [Coord; D],
    /// Refinement level, `0` is the tree root.
    pub level: i8,
    /// Handle into the per-process payload pool, `NULL` if absent.
    pub data: PayloadRef,
}

impl<const D: usize> Quadrant<D> {
    /// Deepest refinement level; coordinates fit into 32 bits.
    pub const MAX_LEVEL: i8 = if D == 2 { 30 } else { 19 };
    /// Side length of the root, `2^MAX_LEVEL`.
    pub const ROOT_LEN: Coord = 1 << Self::MAX_LEVEL;
    /// Number of children of a quadrant, `2^D`.
    pub const NUM_CHILDREN: usize = 1 << D;
    /// Number of faces, `2 * D`.
    pub const NUM_FACES: usize = 2 * D;
    /// Number of corners, `2^D`.
    pub const NUM_CORNERS: usize = 1 << D;
    /// Number of edges, only meaningful in 3D.
    pub const NUM_EDGES: usize = if D == 3 { 12 } else { 0 };
    /// Size of the insulation layer, `3^D`.
    pub const NUM_INSUL: usize = if D == 3 { 27 } else { 9 };

    /// Side length of a quadrant at `level`.
    #[inline]
    pub fn len(level: i8) -> Coord {
        debug_assert!((0..=Self::MAX_LEVEL).contains(&level));
        Self::ROOT_LEN >> level
    }

    /// Create a quadrant from anchor coordinates and level.
    pub fn new(coords: [Coord; D], level: i8) -> Self {
        debug_assert!(D == 2 || D == 3);
        Self {
            coords,
            level,
            data: PayloadRef::NULL,
        }
    }

    /// The root quadrant covering the whole tree.
    pub fn root() -> Self {
        Self::new([0; D], 0)
    }

    /// Child index of this quadrant with respect to its parent.
    pub fn child_id(&self) -> usize {
        self.ancestor_id(self.level)
    }

    /// Child index of this quadrant's ancestor at `level` within the
    /// ancestor's own parent.
    pub fn ancestor_id(&self, level: i8) -> usize {
        debug_assert!(level >= 1 && level <= self.level || level == self.level);
        let h = Self::len(level);
        let mut id = 0;
        for a in 0..D {
            if self.coords[a] & h != 0 {
                id |= 1 << a;
            }
        }
        id
    }

    /// The parent quadrant.
    pub fn parent(&self) -> Self {
        debug_assert!(self.level > 0);
        let h = Self::len(self.level);
        let mut coords = self.coords;
        for c in coords.iter_mut() {
            *c &= !h;
        }
        Self::new(coords, self.level - 1)
    }

    /// The ancestor at the given coarser level.
    pub fn ancestor(&self, level: i8) -> Self {
        debug_assert!((0..self.level).contains(&level));
        let mask = Self::len(level) - 1;
        let mut coords = self.coords;
        for c in coords.iter_mut() {
            *c &= !mask;
        }
        Self::new(coords, level)
    }

    /// The sibling with the given child index, possibly `self`.
    pub fn sibling(&self, id: usize) -> Self {
        debug_assert!(self.level > 0 && id < Self::NUM_CHILDREN);
        let h = Self::len(self.level);
        let mut coords = self.coords;
        for (a, c) in coords.iter_mut().enumerate() {
            if id & (1 << a) != 0 {
                *c |= h;
            } else {
                *c &= !h;
            }
        }
        Self::new(coords, self.level)
    }

    /// All `2^D` children in Morton (z-) order.
    pub fn children(&self) -> Vec<Self> {
        debug_assert!(self.level < Self::MAX_LEVEL);
        let h = Self::len(self.level + 1);
        (0..Self::NUM_CHILDREN)
            .map(|id| {
                let mut coords = self.coords;
                for (a, c) in coords.iter_mut().enumerate() {
                    if id & (1 << a) != 0 {
                        *c += h;
                    }
                }
                Self::new(coords, self.level + 1)
            })
            .collect()
    }

    /// The first (lowest Morton) descendant at the given finer level.
    pub fn first_descendant(&self, level: i8) -> Self {
        debug_assert!(level >= self.level && level <= Self::MAX_LEVEL);
        Self::new(self.coords, level)
    }

    /// The last (highest Morton) descendant at the given finer level.
    pub fn last_descendant(&self, level: i8) -> Self {
        debug_assert!(level >= self.level && level <= Self::MAX_LEVEL);
        let shift = Self::len(self.level) - Self::len(level);
        let mut coords = self.coords;
        for c in coords.iter_mut() {
            *c += shift;
        }
        Self::new(coords, level)
    }

    /// The deepest common ancestor of `self` and `other`.
    pub fn nearest_common_ancestor(&self, other: &Self) -> Self {
        let mut maxclor: u32 = 0;
        for a in 0..D {
            maxclor |= (self.coords[a] as u32) ^ (other.coords[a] as u32);
        }
        let maxlevel = log2_u32(maxclor) + 1;
        debug_assert!(maxlevel <= Self::MAX_LEVEL as i32);
        let level = (Self::MAX_LEVEL as i32 - maxlevel).min(self.level.min(other.level) as i32);
        let mask = !(((1 as Coord) << maxlevel) - 1);
        let mut coords = self.coords;
        for c in coords.iter_mut() {
            *c &= mask;
        }
        Self::new(coords, level as i8)
    }

    /// Whether `self` strictly contains `other`.
    pub fn is_ancestor(&self, other: &Self) -> bool {
        if self.level >= other.level {
            return false;
        }
        let shift = Self::MAX_LEVEL - self.level;
        (0..D).all(|a| ((self.coords[a] ^ other.coords[a]) >> shift) == 0)
    }

    /// Whether `self` is the parent of `other`.
    pub fn is_parent(&self, other: &Self) -> bool {
        if self.level + 1 != other.level {
            return false;
        }
        let h = Self::len(other.level);
        (0..D).all(|a| self.coords[a] == (other.coords[a] & !h))
    }

    /// Whether the two quadrants are distinct and share a parent.
    pub fn is_sibling(&self, other: &Self) -> bool {
        if self.level != other.level || self.level == 0 {
            return false;
        }
        let h = Self::len(self.level);
        let mut any = false;
        for a in 0..D {
            let exclor = self.coords[a] ^ other.coords[a];
            if exclor & !h != 0 {
                return false;
            }
            any |= exclor != 0;
        }
        any
    }

    /// Whether the slice is a complete family of `2^D` siblings in order.
    pub fn is_family(quads: &[Self]) -> bool {
        if quads.len() != Self::NUM_CHILDREN {
            return false;
        }
        let first = &quads[0];
        if first.level == 0 || first.child_id() != 0 {
            return false;
        }
        quads
            .iter()
            .enumerate()
            .all(|(id, q)| q.level == first.level && q.coords == first.sibling(id).coords)
    }

    /// Whether `other` is the Morton successor of `self`, tiling without
    /// gap at the finest common level.
    pub fn is_next(&self, other: &Self) -> bool {
        let minlevel = if self.level > other.level {
            // `self` must be the last child up to the common level.
            let mask = Self::len(other.level) - Self::len(self.level);
            if (0..D).any(|a| self.coords[a] & mask != mask) {
                return false;
            }
            other.level
        } else {
            self.level
        };
        let i1 = self.linear_id(minlevel);
        let i2 = other.linear_id(minlevel);
        i1 + 1 == i2
    }

    /// Morton index of the quadrant among all quadrants of `level`.
    ///
    /// Two extra bits per axis are kept so that extended quadrants
    /// outside the root still map to distinct indices.
    pub fn linear_id(&self, level: i8) -> u64 {
        debug_assert!(level <= self.level);
        let shift = Self::MAX_LEVEL - level;
        let mut id: u64 = 0;
        for a in 0..D {
            // Sign extension keeps the high bits of negative coordinates.
            let x = (self.coords[a] as i64 as u64) >> shift;
            for i in 0..(level as usize + 2) {
                id |= ((x >> i) & 1) << (D * i + a);
            }
        }
        id
    }

    /// Inverse of [`linear_id`](Self::linear_id) for quadrants inside the
    /// root.
    pub fn from_linear_id(id: u64, level: i8) -> Self {
        debug_assert!((0..=Self::MAX_LEVEL).contains(&level));
        let mut coords = [0 as Coord; D];
        for (a, c) in coords.iter_mut().enumerate() {
            let mut x: u64 = 0;
            for i in 0..level as usize {
                x |= ((id >> (D * i + a)) & 1) << i;
            }
            *c = (x as Coord) << (Self::MAX_LEVEL - level);
        }
        Self::new(coords, level)
    }

    /// Whether level and alignment are admissible and the quadrant lies
    /// inside its root.
    pub fn is_valid(&self) -> bool {
        (0..=Self::MAX_LEVEL).contains(&self.level) && self.is_aligned() && self.is_inside_root()
    }

    /// Whether the quadrant lies inside the unit root.
    pub fn is_inside_root(&self) -> bool {
        let h = Self::len(self.level);
        (0..D).all(|a| self.coords[a] >= 0 && self.coords[a] + h <= Self::ROOT_LEN)
    }

    /// Whether level and alignment are admissible and the quadrant lies
    /// inside the root or in the one-layer shell of virtual siblings
    /// around it.
    pub fn is_extended(&self) -> bool {
        if !(0..=Self::MAX_LEVEL).contains(&self.level) || !self.is_aligned() {
            return false;
        }
        let h = Self::len(self.level);
        (0..D).all(|a| self.coords[a] >= -h && self.coords[a] + h <= Self::ROOT_LEN + h)
    }

    /// Whether the quadrant lies inside the 3x3 (3x3x3) insulation box
    /// around the root. The range test is widened to 64 bits; twice the
    /// root length does not fit a coordinate in 2D.
    pub fn is_inside_3x3(&self) -> bool {
        if !(0..=Self::MAX_LEVEL).contains(&self.level) || !self.is_aligned() {
            return false;
        }
        let h = Self::len(self.level) as i64;
        let root = Self::ROOT_LEN as i64;
        (0..D).all(|a| {
            let x = self.coords[a] as i64;
            x >= -root && x + h <= 2 * root
        })
    }

    fn is_aligned(&self) -> bool {
        let mask = Self::len(self.level) - 1;
        (0..D).all(|a| self.coords[a] & mask == 0)
    }

    /// Morton comparison; ancestors sort before their descendants.
    pub fn morton_cmp(&self, other: &Self) -> Ordering {
        let mut dominant = usize::MAX;
        let mut max_log = -1i32;
        for a in 0..D {
            let exclor = (self.coords[a] as u32) ^ (other.coords[a] as u32);
            let log = log2_u32(exclor);
            // Ties go to the higher axis, which owns the higher Morton bit.
            if exclor != 0 && log >= max_log {
                max_log = log;
                dominant = a;
            }
        }
        if dominant == usize::MAX {
            return self.level.cmp(&other.level);
        }
        // Negative (outside) coordinates wrap above the inside range.
        let wrap = 1i64 << (Self::MAX_LEVEL as i64 + 2);
        let key = |c: Coord| c as i64 + if c >= 0 { 0 } else { wrap };
        key(self.coords[dominant]).cmp(&key(other.coords[dominant]))
    }

    /// Comparison that treats overlapping quadrants as equal.
    ///
    /// Used for binary searches that must locate an ancestor or
    /// descendant of the probe as well as the probe itself.
    pub fn disjoint_cmp(&self, other: &Self) -> Ordering {
        if self == other || self.is_ancestor(other) || other.is_ancestor(self) {
            Ordering::Equal
        } else {
            self.morton_cmp(other)
        }
    }
}

impl<const D: usize> Default for Quadrant<D> {
    fn default() -> Self {
        Self::root()
    }
}

impl<const D: usize> PartialEq for Quadrant<D> {
    fn eq(&self, other: &Self) -> bool {
        self.level == other.level && self.coords == other.coords
    }
}

impl<const D: usize> Eq for Quadrant<D> {}

impl<const D: usize> PartialOrd for Quadrant<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const D: usize> Ord for Quadrant<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.morton_cmp(other)
    }
}

impl<const D: usize> Hash for Quadrant<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.coords.hash(state);
        self.level.hash(state);
    }
}

impl<const D: usize> std::fmt::Debug for Quadrant<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Quadrant(l{}", self.level)?;
        for c in &self.coords {
            write!(f, " {:#x}", c)?;
        }
        write!(f, ")")
    }
}

/// Floor of the base-2 logarithm, `-1` for zero.
#[inline]
fn log2_u32(x: u32) -> i32 {
    31 - x.leading_zeros() as i32
}

/// CRC32 over the sequence, one big-endian 32-bit word per coordinate
/// followed by one for the level. Stable across architectures.
pub fn checksum_seq<const D: usize>(quads: &[Quadrant<D>]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for q in quads {
        for a in 0..D {
            hasher.update(&(q.coords[a] as u32).to_be_bytes());
        }
        hasher.update(&(q.level as u8 as u32).to_be_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod test {
    use super::*;

    type Quad = Quadrant<2>;
    type Oct = Quadrant<3>;

    const H2: Coord = Quad::ROOT_LEN / 2;
    const H3: Coord = Oct::ROOT_LEN / 2;

    #[test]
    fn test_child_and_sibling() {
        let q = Quad::new([H2, 0], 1);
        assert_eq!(q.child_id(), 1);
        assert_eq!(q.sibling(0), Quad::new([0, 0], 1));
        assert_eq!(q.sibling(3), Quad::new([H2, H2], 1));

        let o = Oct::new([0, H3, H3], 1);
        assert_eq!(o.child_id(), 6);
        assert_eq!(o.sibling(7), Oct::new([H3, H3, H3], 1));
    }

    #[test]
    fn test_parent_children_roundtrip() {
        let p = Quad::new([H2, H2], 1);
        let children = p.children();
        assert_eq!(children.len(), 4);
        for (id, c) in children.iter().enumerate() {
            assert_eq!(c.child_id(), id);
            assert_eq!(c.parent(), p);
            assert!(p.is_parent(c));
            assert!(p.is_ancestor(c));
        }
        assert!(Quad::is_family(&children));
    }

    #[test]
    fn test_morton_order_of_children() {
        let root = Quad::root();
        let children = root.children();
        for pair in children.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].is_next(&pair[1]));
        }
        for c in &children {
            assert!(root < *c);
            assert!(root.is_ancestor(c));
        }
    }

    #[test]
    fn test_is_next_across_levels() {
        // The last grandchild of child 0 is next to child 1.
        let c0 = Quad::new([0, 0], 1);
        let c1 = Quad::new([H2, 0], 1);
        let last = c0.children()[3];
        assert!(last.is_next(&c1));
        assert!(!c0.children()[2].is_next(&c1));
    }

    #[test]
    fn test_nearest_common_ancestor() {
        let a = Quad::new([0, 0], 2);
        let b = Quad::new([H2, H2], 2);
        assert_eq!(a.nearest_common_ancestor(&b), Quad::root());

        let c = Quad::new([0, 0], 3);
        let d = Quad::new([H2 / 4, H2 / 4], 3);
        let nca = c.nearest_common_ancestor(&d);
        assert!(nca.is_ancestor(&c) && nca.is_ancestor(&d));
        assert_eq!(nca, Quad::new([0, 0], 2));
    }

    #[test]
    fn test_descendants() {
        let q = Quad::new([H2, 0], 1);
        let fd = q.first_descendant(Quad::MAX_LEVEL);
        let ld = q.last_descendant(Quad::MAX_LEVEL);
        assert_eq!(fd.coords, q.coords);
        assert_eq!(ld.coords, [Quad::ROOT_LEN - 1, H2 - 1]);
        assert!(q.is_ancestor(&fd) && q.is_ancestor(&ld));
        assert!(fd < ld);
    }

    #[test]
    fn test_linear_id_roundtrip() {
        for level in 0..6i8 {
            let n = 1u64 << (2 * level as u32);
            let mut prev: Option<Quad> = None;
            for id in 0..n {
                let q = Quad::from_linear_id(id, level);
                assert!(q.is_valid());
                assert_eq!(q.linear_id(level), id);
                if let Some(p) = prev {
                    assert!(p < q);
                    assert!(p.is_next(&q));
                }
                prev = Some(q);
            }
        }
    }

    #[test]
    fn test_extended_and_insulation() {
        let h = Quad::len(2);
        let outside = Quad::new([-h, 0], 2);
        assert!(!outside.is_inside_root());
        assert!(outside.is_extended());
        assert!(outside.is_inside_3x3());

        let far = Quad::new([-2 * h, 0], 2);
        assert!(!far.is_extended());
        assert!(far.is_inside_3x3());
    }

    #[test]
    fn test_outside_sorts_high() {
        // Negative coordinates wrap above the root range in Morton order.
        let h = Quad::len(1);
        let inside = Quad::new([h, h], 1);
        let outside = Quad::new([-h, 0], 1);
        assert!(inside < outside);
    }

    #[test]
    fn test_ancestor_id() {
        let q = Oct::new([H3 + H3 / 2, H3 / 2, 0], 2);
        assert_eq!(q.ancestor_id(1), 1);
        assert_eq!(q.ancestor_id(2), q.child_id());
        assert_eq!(q.ancestor(1), Oct::new([H3, 0, 0], 1));
    }

    #[test]
    fn test_checksum_depends_on_order_and_level() {
        let a = Quad::new([0, 0], 1);
        let b = Quad::new([H2, 0], 1);
        assert_ne!(checksum_seq(&[a, b]), checksum_seq(&[b, a]));
        let deeper = Quad::new([0, 0], 2);
        assert_ne!(checksum_seq(&[a]), checksum_seq(&[deeper]));
    }

    #[test]
    fn test_disjoint_cmp() {
        let root = Quad::root();
        let child = Quad::new([H2, 0], 1);
        assert_eq!(root.disjoint_cmp(&child), Ordering::Equal);
        assert_eq!(child.disjoint_cmp(&root), Ordering::Equal);
        let other = Quad::new([0, H2], 1);
        assert_eq!(child.disjoint_cmp(&other), Ordering::Less);
    }
}
