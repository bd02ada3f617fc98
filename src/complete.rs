//! Interval completion: fill the Morton gap between two quadrants.

use std::collections::VecDeque;

use crate::forest::{init_quadrant, DataPool, InitFn};
use crate::quadrant::Quadrant;
use crate::tree::Tree;
use crate::types::TopIdx;

/// Build the minimal complete sequence covering the interval between
/// `a` and `b` into an empty tree.
///
/// The open interval `(a, b)` is always covered exactly; the inclusion
/// flags add the endpoints themselves. Payloads are allocated and
/// initialized for every appended quadrant.
///
/// Preconditions (`a < b` in Morton order, empty tree) are programmer
/// errors and fail hard.
pub fn complete_region<const D: usize>(
    a: &Quadrant<D>,
    include_a: bool,
    b: &Quadrant<D>,
    include_b: bool,
    tree: &mut Tree<D>,
    which_tree: TopIdx,
    pool: &mut DataPool,
    init: Option<InitFn<D>>,
) {
    assert!(tree.is_empty());
    assert!(a.morton_cmp(b).is_lt());
    debug_assert!(a.is_valid() && b.is_valid());

    let mut append = |tree: &mut Tree<D>, mut q: Quadrant<D>, pool: &mut DataPool| {
        init_quadrant(pool, init, which_tree, &mut q);
        tree.push(q);
    };

    if include_a {
        append(tree, *a, pool);
    }

    // Work list seeded with the children of the nearest common ancestor;
    // children of relevant ancestors are prepended in Morton order so
    // the output is emitted sorted.
    let afinest = a.nearest_common_ancestor(b);
    let mut work: VecDeque<Quadrant<D>> = afinest.children().into();

    while let Some(w) = work.pop_front() {
        if a.morton_cmp(&w).is_lt() && w.morton_cmp(b).is_lt() && !w.is_ancestor(b) {
            append(tree, w, pool);
        } else if w.is_ancestor(a) || w.is_ancestor(b) {
            for child in w.children().into_iter().rev() {
                work.push_front(child);
            }
        }
    }

    if include_b {
        append(tree, *b, pool);
    }

    debug_assert!(tree.is_complete());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::forest::DataPool;
    use crate::types::Coord;

    type Quad = Quadrant<2>;
    type Oct = Quadrant<3>;

    const H: Coord = Quad::ROOT_LEN / 2;

    #[test]
    fn test_complete_between_root_children() {
        // Between the half-size corner quadrants the interval holds the
        // two middle children of the root.
        let mut pool = DataPool::new(0);
        let mut tree = Tree::new();
        let a = Quad::new([0, 0], 1);
        let b = Quad::new([H, H], 1);
        complete_region(&a, true, &b, true, &mut tree, 0, &mut pool, None);
        assert_eq!(tree.quadrants, Quad::root().children());
        assert!(tree.is_complete());
    }

    #[test]
    fn test_complete_refined_endpoint() {
        let mut pool = DataPool::new(0);
        let mut tree = Tree::new();
        let a = Quad::new([0, 0], 1);
        let b = Quad::new([0, H], 2);
        complete_region(&a, true, &b, true, &mut tree, 0, &mut pool, None);
        // The open interval holds only the second root child; b itself
        // starts the third.
        assert_eq!(
            tree.quadrants,
            vec![a, Quad::new([H, 0], 1), b]
        );
        assert!(tree.is_complete());
    }

    #[test]
    fn test_complete_exclusive_interval() {
        let mut pool = DataPool::new(0);
        let mut tree = Tree::new();
        let a = Quad::new([0, 0], 2);
        let b = Quad::new([H, H], 1);
        complete_region(&a, false, &b, false, &mut tree, 0, &mut pool, None);
        // Covers (a, b): the remaining three grandchildren, then the
        // second and third root children.
        assert_eq!(tree.quadrants.len(), 5);
        for pair in tree.quadrants.windows(2) {
            assert!(pair[0].is_next(&pair[1]));
        }
        assert!(a.is_next(&tree.quadrants[0]));
        assert!(tree.quadrants[4].is_next(&b));
    }

    #[test]
    fn test_complete_deep_gap() {
        // Endpoints several levels apart; the result is the minimal
        // staircase of largest-fitting quadrants.
        let mut pool = DataPool::new(0);
        let mut tree = Tree::new();
        let a = Quad::new([0, 0], 4);
        let b = Quad::new([H, H], 4);
        complete_region(&a, true, &b, true, &mut tree, 0, &mut pool, None);
        assert!(tree.is_complete());
        assert_eq!(tree.quadrants.first(), Some(&a));
        assert_eq!(tree.quadrants.last(), Some(&b));
        // The union is exactly [a, b]: completeness plus the endpoints
        // pin both boundaries.
        assert!(tree.is_linear());
    }

    #[test]
    fn test_complete_payload_init() {
        fn init(_t: TopIdx, q: &Quadrant<2>, bytes: &mut [u8]) {
            bytes[0] = q.level as u8;
        }
        let mut pool = DataPool::new(1);
        let mut tree = Tree::new();
        let a = Quad::new([0, 0], 1);
        let b = Quad::new([H, H], 1);
        complete_region(&a, true, &b, true, &mut tree, 0, &mut pool, Some(init));
        assert_eq!(pool.live(), tree.len());
        for q in &tree.quadrants {
            assert_eq!(pool.get(q.data)[0], q.level as u8);
        }
    }

    #[test]
    fn test_complete_3d() {
        let mut pool = DataPool::new(0);
        let mut tree: Tree<3> = Tree::new();
        let h = Oct::ROOT_LEN / 2;
        let a = Oct::new([0, 0, 0], 1);
        let b = Oct::new([h, h, h], 1);
        complete_region(&a, true, &b, true, &mut tree, 0, &mut pool, None);
        assert_eq!(tree.quadrants, Oct::root().children());
    }
}
