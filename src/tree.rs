//! The per-tree quadrant container and its structural predicates.
//!
//! A tree owns a Morton-sorted sequence of quadrants together with
//! per-level counts, the maximum occupied level and cached first/last
//! deepest-level descendants. The container never reorders on its own;
//! callers insert in Morton order or sort explicitly.

use itertools::Itertools;

use crate::forest::DataPool;
use crate::quadrant::Quadrant;
use crate::types::LocIdx;

/// One tree of the forest.
#[derive(Clone)]
pub struct Tree<const D: usize> {
    /// The Morton-sorted quadrant sequence.
    pub quadrants: Vec<Quadrant<D>>,
    /// Number of quadrants per level, `MAX_LEVEL + 1` entries.
    pub quadrants_per_level: Vec<LocIdx>,
    /// Highest level with a nonzero count.
    pub maxlevel: i8,
    /// Deepest-level first descendant of the first quadrant.
    pub first_desc: Quadrant<D>,
    /// Deepest-level last descendant of the last quadrant.
    pub last_desc: Quadrant<D>,
    /// Number of quadrants in all earlier trees on this process.
    pub quadrants_offset: LocIdx,
}

impl<const D: usize> Tree<D> {
    /// An empty tree with descendant caches in the cleared state.
    pub fn new() -> Self {
        Self {
            quadrants: Vec::new(),
            quadrants_per_level: vec![0; Quadrant::<D>::MAX_LEVEL as usize + 1],
            maxlevel: 0,
            first_desc: desc_sentinel(),
            last_desc: desc_sentinel(),
            quadrants_offset: 0,
        }
    }

    /// Number of quadrants in the tree.
    pub fn len(&self) -> usize {
        self.quadrants.len()
    }

    /// Whether the tree holds no quadrants.
    pub fn is_empty(&self) -> bool {
        self.quadrants.is_empty()
    }

    /// Append a quadrant, maintaining the level accounting.
    pub fn push(&mut self, q: Quadrant<D>) {
        self.quadrants_per_level[q.level as usize] += 1;
        if q.level > self.maxlevel {
            self.maxlevel = q.level;
        }
        self.quadrants.push(q);
    }

    /// Sort the sequence into Morton order.
    pub fn sort(&mut self) {
        self.quadrants.sort_unstable();
    }

    /// Recompute per-level counts and `maxlevel` from the sequence.
    pub fn recount(&mut self) {
        self.quadrants_per_level.fill(0);
        self.maxlevel = 0;
        for q in &self.quadrants {
            self.quadrants_per_level[q.level as usize] += 1;
            if q.level > self.maxlevel {
                self.maxlevel = q.level;
            }
        }
    }

    /// Refresh the first/last descendant caches from the endpoints.
    pub fn update_desc(&mut self) {
        if let (Some(first), Some(last)) = (self.quadrants.first(), self.quadrants.last()) {
            self.first_desc = first.first_descendant(Quadrant::<D>::MAX_LEVEL);
            self.last_desc = last.last_descendant(Quadrant::<D>::MAX_LEVEL);
        } else {
            self.first_desc = desc_sentinel();
            self.last_desc = desc_sentinel();
        }
    }

    /// Whether the sequence strictly increases in Morton order.
    pub fn is_sorted(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows()
            .all(|(q1, q2)| q1.morton_cmp(q2).is_lt())
    }

    /// Whether the sequence is sorted and free of ancestor pairs.
    pub fn is_linear(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows()
            .all(|(q1, q2)| q1.morton_cmp(q2).is_lt() && !q1.is_ancestor(q2))
    }

    /// Whether consecutive quadrants tile without gaps.
    pub fn is_complete(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows()
            .all(|(q1, q2)| q1.is_next(q2))
    }

    /// Whether the sequence is sorted except between quadrants that both
    /// lie outside the same root edge or corner, where extended
    /// quadrants may legitimately overlap.
    pub fn is_almost_sorted(&self, check_linearity: bool) -> bool {
        let mut prev: Option<(&Quadrant<D>, u32)> = None;
        for q2 in &self.quadrants {
            let contact2 = face_contact(q2);
            if let Some((q1, contact1)) = prev {
                // Outside more than one axis means an edge or corner
                // region; identical contact there permits overlap.
                let n_out = (0..D)
                    .filter(|a| contact2 & (0x3 << (2 * a)) != 0)
                    .count();
                let exempt = n_out >= 2 && contact1 == contact2;
                if !exempt {
                    if q1.morton_cmp(q2).is_ge() {
                        return false;
                    }
                    if check_linearity && q1.is_ancestor(q2) {
                        return false;
                    }
                }
            }
            prev = Some((q2, contact2));
        }
        true
    }

    /// Remove every quadrant that is equal to or an ancestor of its
    /// successor, releasing its payload. Returns the number removed.
    ///
    /// The sequence must be sorted; afterwards it is linear.
    pub fn linearize(&mut self, pool: &mut DataPool) -> usize {
        debug_assert!(self.is_sorted());
        let incount = self.quadrants.len();
        if incount <= 1 {
            return 0;
        }

        let mut removed = 0;
        let mut current = 0;
        for rest in 1..incount {
            let q2 = self.quadrants[rest];
            let q1 = self.quadrants[current];
            if q1 == q2 || q1.is_ancestor(&q2) {
                self.quadrants_per_level[q1.level as usize] -= 1;
                pool.free(q1.data);
                self.quadrants[current] = q2;
                removed += 1;
            } else {
                current += 1;
                self.quadrants[current] = q2;
            }
        }
        self.quadrants.truncate(current + 1);

        self.refresh_maxlevel();
        debug_assert!(self.is_linear());
        removed
    }

    /// Drop quadrants outside the unit root and, for partially owned
    /// trees, outside the `[first_pos, next_pos)` ownership window.
    /// Returns the number removed.
    pub fn remove_nonowned(
        &mut self,
        pool: &mut DataPool,
        full_tree: [bool; 2],
        first_pos: &Quadrant<D>,
        next_pos: &Quadrant<D>,
    ) -> usize {
        debug_assert!(self.is_almost_sorted(false));
        let incount = self.quadrants.len();
        let max_level = Quadrant::<D>::MAX_LEVEL;

        let mut removed = 0;
        let mut kept = 0;
        for zz in 0..incount {
            let q = self.quadrants[zz];
            debug_assert!(q.is_extended());
            let before_window = !full_tree[0]
                && q.morton_cmp(first_pos).is_lt()
                && q.coords != first_pos.coords;
            let after_window = !full_tree[1]
                && next_pos
                    .morton_cmp(&q.last_descendant(max_level))
                    .is_le();
            if !q.is_inside_root() || before_window || after_window {
                self.quadrants_per_level[q.level as usize] -= 1;
                pool.free(q.data);
                removed += 1;
            } else {
                self.quadrants[kept] = q;
                kept += 1;
            }
        }
        self.quadrants.truncate(kept);

        self.refresh_maxlevel();
        debug_assert!(self.is_sorted());
        removed
    }

    fn refresh_maxlevel(&mut self) {
        self.maxlevel = 0;
        for (level, &count) in self.quadrants_per_level.iter().enumerate() {
            debug_assert!(count >= 0);
            if count > 0 {
                self.maxlevel = level as i8;
            }
        }
    }
}

impl<const D: usize> Default for Tree<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// The cleared descendant cache used by empty trees.
pub fn desc_sentinel<const D: usize>() -> Quadrant<D> {
    Quadrant::new([-1; D], -1)
}

/// Bit mask of the root faces a quadrant lies beyond, two bits per axis.
fn face_contact<const D: usize>(q: &Quadrant<D>) -> u32 {
    let mut contact = 0;
    for a in 0..D {
        if q.coords[a] < 0 {
            contact |= 0x1 << (2 * a);
        }
        if q.coords[a] >= Quadrant::<D>::ROOT_LEN {
            contact |= 0x2 << (2 * a);
        }
    }
    contact
}
