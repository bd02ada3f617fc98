//! Overlap computation for the parallel balance exchange.
//!
//! Given quadrants received from other processes, expressed in a local
//! tree's coordinate system (and outside its root when they arrived
//! across a tree boundary), find the locally owned quadrants fine enough
//! to matter for the sender's 2:1 balance and return them transformed
//! into the sender's coordinate system.

use itertools::Itertools;

use crate::forest::Forest;
use crate::quadrant::Quadrant;
use crate::types::{Balance, Coord, PayloadRef, TopIdx};

/// A quadrant tagged with the tree whose coordinates it uses and the
/// tree it originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OverlapQuad<const D: usize> {
    /// The quadrant, inside or extended around `which_tree`.
    pub quad: Quadrant<D>,
    /// Tree whose coordinate system the quadrant is expressed in.
    pub which_tree: TopIdx,
    /// Tree of origin; overlap answers travel back to this tree.
    pub from_tree: TopIdx,
}

impl<const D: usize> OverlapQuad<D> {
    /// Tag a quadrant that lives and originates in the same tree.
    pub fn local(quad: Quadrant<D>, which_tree: TopIdx) -> Self {
        Self {
            quad,
            which_tree,
            from_tree: which_tree,
        }
    }
}

/// Ordering by (tree, Morton position); equality means an identical
/// entry since the level breaks coordinate ties.
pub fn piggy_cmp<const D: usize>(a: &OverlapQuad<D>, b: &OverlapQuad<D>) -> std::cmp::Ordering {
    a.which_tree
        .cmp(&b.which_tree)
        .then_with(|| a.quad.morton_cmp(&b.quad))
}

/* Which corner of the center quadrant touches each insulation cell. */
const INSUL_TO_C_2D: [i32; 9] = [0, -1, 1, -1, -1, -1, 2, -1, 3];

#[rustfmt::skip]
const INSUL_TO_C_3D: [i32; 27] = [
    0, -1, 1, -1, -1, -1, 2, -1, 3,
    -1, -1, -1, -1, -1, -1, -1, -1, -1,
    4, -1, 5, -1, -1, -1, 6, -1, 7,
];

fn insul_to_c<const D: usize>(which: usize) -> i32 {
    if D == 2 {
        INSUL_TO_C_2D[which]
    } else {
        INSUL_TO_C_3D[which]
    }
}

/// How a quadrant outside the root crosses the tree boundary.
enum Contact {
    Face(usize),
    Edge(usize),
    Corner(usize),
}

fn classify_contact<const D: usize>(q: &Quadrant<D>) -> Contact {
    let root = Quadrant::<D>::ROOT_LEN;
    let mut outface = [false; 6];
    let mut face_axis = [false; 3];
    for a in 0..D {
        outface[2 * a] = q.coords[a] < 0;
        outface[2 * a + 1] = q.coords[a] >= root;
        face_axis[a] = outface[2 * a] || outface[2 * a + 1];
    }
    let n_axes = face_axis.iter().filter(|&&x| x).count();
    debug_assert!(n_axes > 0);
    if n_axes == 1 {
        let a = face_axis.iter().position(|&x| x).unwrap();
        Contact::Face(2 * a + usize::from(outface[2 * a + 1]))
    } else if D == 3 && n_axes == 2 {
        let a = face_axis.iter().position(|&x| !x).unwrap();
        let mut sides = 0;
        let mut k = 0;
        for b in 0..D {
            if b == a {
                continue;
            }
            if outface[2 * b + 1] {
                sides |= 1 << k;
            }
            k += 1;
        }
        Contact::Edge(4 * a + sides)
    } else {
        let mut corner = 0;
        for a in 0..D {
            if outface[2 * a + 1] {
                corner |= 1 << a;
            }
        }
        Contact::Corner(corner)
    }
}

/// Seeds inside `inq` that the finer quadrant `tq` forces to exist.
///
/// The deepest ring of the 2:1 ripple around `tq` reaches two of its
/// lengths; every cell one level above `tq` within that reach and inside
/// `inq` must be present in the sender's balanced tree. Coarser rings
/// follow from balancing the seeds themselves, so only the deepest level
/// is emitted.
fn forced_seeds<const D: usize>(
    inq: &Quadrant<D>,
    tq: &Quadrant<D>,
    seeds: &mut Vec<Quadrant<D>>,
) {
    seeds.clear();
    debug_assert!(tq.level > inq.level + 1);
    let ls = tq.level - 1;
    let hs = Quadrant::<D>::len(ls) as i64;
    let ht = Quadrant::<D>::len(tq.level) as i64;
    let hq = Quadrant::<D>::len(inq.level) as i64;
    let reach = 2 * ht;

    let mut lo = [0i64; 3];
    let mut hi = [0i64; 3];
    for a in 0..D {
        let ix = inq.coords[a] as i64;
        let tx = tq.coords[a] as i64;
        let from = (tx - reach).max(ix);
        let to = (tx + ht + reach - 1).min(ix + hq - 1);
        if from > to {
            return;
        }
        lo[a] = ix + (from - ix).div_euclid(hs) * hs;
        hi[a] = ix + (to - ix).div_euclid(hs) * hs;
    }

    let mut cur = lo;
    loop {
        let mut dmax = 0i64;
        for a in 0..D {
            let tx = tq.coords[a] as i64;
            let gap = (cur[a] - (tx + ht)).max(tx - (cur[a] + hs)).max(0);
            dmax = dmax.max(gap);
        }
        if dmax < reach {
            let mut coords = [0 as Coord; D];
            for a in 0..D {
                coords[a] = cur[a] as Coord;
            }
            let seed = Quadrant::new(coords, ls);
            debug_assert!(inq.is_ancestor(&seed));
            seeds.push(seed);
        }
        let mut a = 0;
        loop {
            if a == D {
                return;
            }
            cur[a] += hs;
            if cur[a] <= hi[a] {
                break;
            }
            cur[a] = lo[a];
            a += 1;
        }
    }
}

/// Seed-based overlap: emit the zero-siblings of the minimal quadrants
/// the origin tree must contain so that each input quadrant ends up
/// balanced against the local refinement.
pub fn compute_overlap<const D: usize>(
    forest: &Forest<D>,
    input: &[OverlapQuad<D>],
    balance: Balance,
    borders: Option<&[Vec<Quadrant<D>>]>,
    out: &mut Vec<OverlapQuad<D>>,
) {
    // Completion alone needs no neighbor information; the selector is
    // recorded for the caller's intent, while the insulation walk stays
    // conservative for partial balance types.
    debug_assert!(balance != Balance::None);
    compute_overlap_internal(forest, input, true, balance, borders, out);
}

/// Legacy overlap: emit the fine local quadrants themselves, transformed
/// into the origin tree's coordinate system.
pub fn compute_overlap_legacy<const D: usize>(
    forest: &Forest<D>,
    input: &[OverlapQuad<D>],
    out: &mut Vec<OverlapQuad<D>>,
) {
    compute_overlap_internal(forest, input, false, Balance::None, None, out);
}

fn compute_overlap_internal<const D: usize>(
    forest: &Forest<D>,
    input: &[OverlapQuad<D>],
    new: bool,
    _balance: Balance,
    borders: Option<&[Vec<Quadrant<D>>]>,
    out: &mut Vec<OverlapQuad<D>>,
) {
    let conn = &forest.conn;
    let root = Quadrant::<D>::ROOT_LEN;
    let max_level = Quadrant::<D>::MAX_LEVEL;
    let mut seeds: Vec<Quadrant<D>> = Vec::new();

    let mut qtree: TopIdx = -1;
    let mut tquadrants: &[Quadrant<D>] = &[];
    let mut treefd = Quadrant::<D>::root();
    let mut treeld = Quadrant::<D>::root();

    for inq_tagged in input {
        let inq = inq_tagged.quad;
        let ftree = inq_tagged.from_tree;

        // Input arrives grouped by local tree in ascending order.
        if inq_tagged.which_tree != qtree {
            debug_assert!(qtree < inq_tagged.which_tree);
            qtree = inq_tagged.which_tree;
            let tree = forest.tree(qtree);
            treefd = tree.first_desc;
            treeld = tree.last_desc;
            tquadrants = match borders {
                None => &tree.quadrants,
                Some(borders) => &borders[(qtree - forest.first_local_tree) as usize],
            };
            debug_assert!(!tquadrants.is_empty());
        }

        let inter_tree = !inq.is_inside_root();
        let contact = if inter_tree {
            debug_assert!(inq.is_extended());
            Some(classify_contact(&inq))
        } else {
            None
        };
        let qh = Quadrant::<D>::len(inq.level);

        // Walk the insulation layer of inq.
        let num_insul = Quadrant::<D>::NUM_INSUL;
        for which in 0..num_insul {
            if which == num_insul / 2 {
                continue;
            }
            let mut level_floor = inq.level + 1;
            let mut legacy_corner_level: i8 = 0;
            let mut s = inq;
            s.coords[0] += ((which % 3) as Coord - 1) * qh;
            s.coords[1] += (((which / 3) % 3) as Coord - 1) * qh;
            if D == 3 {
                s.coords[2] += ((which / 9) as Coord - 1) * qh;
            }
            if (0..D).any(|a| s.coords[a] < 0 || s.coords[a] >= root) {
                // Outside this tree, no overlap.
                continue;
            }
            let fd = s.first_descendant(max_level);
            let ld = s.last_descendant(max_level);

            // Skip insulation quadrants clear of the local window.
            if ld.morton_cmp(&treefd).is_lt() || treeld.morton_cmp(&fd).is_lt() {
                continue;
            }

            // Window of local quadrants between fd and ld. Only
            // quadrants no larger than s are of interest; ancestors of s
            // sort below it and fall outside the window on purpose.
            let first_index = if fd.morton_cmp(&treefd).is_le() {
                0
            } else {
                let idx = tquadrants.partition_point(|t| t.morton_cmp(&s).is_lt());
                if idx == tquadrants.len() {
                    continue;
                }
                idx
            };
            let last_index = if treeld.morton_cmp(&ld).is_le() {
                tquadrants.len() - 1
            } else {
                let idx = tquadrants.partition_point(|t| t.morton_cmp(&ld).is_le());
                debug_assert!(idx > 0);
                idx - 1
            };
            if first_index > last_index {
                continue;
            }

            if new {
                let c = insul_to_c::<D>(which);
                for tq in &tquadrants[first_index..=last_index] {
                    if tq.level <= level_floor {
                        continue;
                    }
                    forced_seeds(&inq, tq, &mut seeds);
                    for u in &seeds {
                        match &contact {
                            None => out.push(OverlapQuad {
                                quad: u.sibling(0),
                                which_tree: qtree,
                                from_tree: qtree,
                            }),
                            Some(Contact::Face(face)) => {
                                let ft = conn
                                    .find_face_transform(qtree, *face)
                                    .expect("face contact across a boundary face");
                                debug_assert_eq!(ft.ntree, ftree);
                                let tempq = ft.transform_face(u);
                                out.push(OverlapQuad {
                                    quad: tempq.sibling(0),
                                    which_tree: ft.ntree,
                                    from_tree: ft.ntree,
                                });
                            }
                            Some(Contact::Edge(edge)) => {
                                for et in conn.find_edge_transform(qtree, *edge) {
                                    if et.ntree == ftree {
                                        let tempq = et.transform_edge(u, *edge as u8);
                                        out.push(OverlapQuad {
                                            quad: tempq.sibling(0),
                                            which_tree: et.ntree,
                                            from_tree: et.ntree,
                                        });
                                    }
                                }
                            }
                            Some(Contact::Corner(corner)) => {
                                for ct in conn.find_corner_transform(qtree, *corner) {
                                    if ct.ntree == ftree {
                                        let tempq =
                                            u.transform_corner(ct.ncorner as usize, true);
                                        out.push(OverlapQuad {
                                            quad: tempq.sibling(0),
                                            which_tree: ct.ntree,
                                            from_tree: ct.ntree,
                                        });
                                    }
                                }
                            }
                        }
                        if c >= 0 {
                            level_floor = level_floor.max(u.level);
                        }
                    }
                }
            } else {
                match &contact {
                    Some(Contact::Corner(corner)) => {
                        // Across a corner only the finest level matters.
                        for tq in &tquadrants[first_index..=last_index] {
                            if tq.level <= legacy_corner_level.max(inq.level + 1) {
                                continue;
                            }
                            let tempq = tq.shift_corner(*corner);
                            debug_assert!(s.is_ancestor(&tempq));
                            legacy_corner_level = legacy_corner_level.max(tempq.level);
                        }
                        if legacy_corner_level > 0 {
                            for ct in conn.find_corner_transform(qtree, *corner) {
                                let mut outq = Quadrant::new([0; D], legacy_corner_level)
                                    .transform_corner(ct.ncorner as usize, false);
                                outq.data = PayloadRef::NULL;
                                out.push(OverlapQuad {
                                    quad: outq,
                                    which_tree: ct.ntree,
                                    from_tree: ct.ntree,
                                });
                            }
                        }
                    }
                    contact => {
                        for tq in &tquadrants[first_index..=last_index] {
                            if tq.level <= inq.level + 1 {
                                continue;
                            }
                            debug_assert!(s.is_ancestor(tq));
                            match contact {
                                None => {
                                    let mut outq = *tq;
                                    outq.data = PayloadRef::NULL;
                                    out.push(OverlapQuad {
                                        quad: outq,
                                        which_tree: qtree,
                                        from_tree: qtree,
                                    });
                                }
                                Some(Contact::Face(face)) => {
                                    let ft = conn
                                        .find_face_transform(qtree, *face)
                                        .expect("face contact across a boundary face");
                                    out.push(OverlapQuad {
                                        quad: ft.transform_face(tq),
                                        which_tree: ft.ntree,
                                        from_tree: ft.ntree,
                                    });
                                }
                                Some(Contact::Edge(edge)) => {
                                    let shifted = tq.shift_edge(*edge);
                                    for et in conn.find_edge_transform(qtree, *edge) {
                                        out.push(OverlapQuad {
                                            quad: et.transform_edge(&shifted, *edge as u8),
                                            which_tree: et.ntree,
                                            from_tree: et.ntree,
                                        });
                                    }
                                }
                                Some(Contact::Corner(_)) => unreachable!(),
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Sort the overlap output by (tree, Morton), dropping duplicates and
/// entries present in the sorted `skip` list.
pub fn uniqify_overlap<const D: usize>(skip: &[OverlapQuad<D>], out: &mut Vec<OverlapQuad<D>>) {
    if out.is_empty() {
        return;
    }
    debug_assert!(skip
        .iter()
        .tuple_windows()
        .all(|(a, b)| piggy_cmp(a, b).is_lt()));
    out.sort_unstable_by(piggy_cmp);
    let mut write = 0;
    for read in 0..out.len() {
        let cur = out[read];
        if read + 1 < out.len() && piggy_cmp(&cur, &out[read + 1]).is_eq() {
            continue;
        }
        if skip.binary_search_by(|s| piggy_cmp(s, &cur)).is_ok() {
            continue;
        }
        out[write] = cur;
        write += 1;
    }
    out.truncate(write);
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::balance::{balance_border, balance_subtree};
    use crate::connectivity::Connectivity;
    use crate::forest::Forest;

    type Quad = Quadrant<2>;

    const R: Coord = Quad::ROOT_LEN;

    fn two_tree_forest(fine: &[Quad]) -> Forest<2> {
        let conn = Rc::new(Connectivity::<2>::brick([2, 1]));
        let mut forest = Forest::new_with_rank(conn, 0, 1, 0, 0, None);
        let tree = &mut forest.trees[1];
        tree.quadrants.clear();
        for &q in fine {
            tree.quadrants.push(q);
        }
        tree.recount();
        tree.update_desc();
        forest.update_local_meta();
        balance_subtree(&mut forest, Balance::full::<2>(), 1, None);
        forest
    }

    #[test]
    fn test_forced_seeds_near_face() {
        // A level-4 quadrant right across the face of a coarse neighbor
        // forces level-3 cells on the neighbor's side of the boundary.
        let inq = Quad::new([-R, 0], 0);
        let tq = Quad::new([0, 0], 4);
        let mut seeds = Vec::new();
        forced_seeds(&inq, &tq, &mut seeds);
        assert!(!seeds.is_empty());
        for s in &seeds {
            assert_eq!(s.level, 3);
            assert!(inq.is_ancestor(s));
        }
        // The adjacent cell across the face is among them.
        let h3 = Quad::len(3);
        assert!(seeds.contains(&Quad::new([-h3, 0], 3)));
    }

    #[test]
    fn test_forced_seeds_distance_cutoff() {
        // A fine quadrant far from the coarse neighbor forces nothing.
        let inq = Quad::new([-R, 0], 0);
        let h4 = Quad::len(4);
        let tq = Quad::new([8 * h4, 0], 4);
        let mut seeds = Vec::new();
        forced_seeds(&inq, &tq, &mut seeds);
        assert!(seeds.is_empty());
    }

    #[test]
    fn test_overlap_intra_tree() {
        // Another process owns a coarse quadrant next to our fine local
        // window of the same tree; the forced splits come back as
        // zero-siblings inside the coarse quadrant.
        let conn = Rc::new(Connectivity::<2>::unit());
        let mut forest = Forest::new_with_rank(conn, 0, 1, 0, 0, None);
        let h = R / 2;
        let h4 = Quad::len(4);
        let fine = Quad::new([h - h4, 0], 4);
        let tree = &mut forest.trees[0];
        tree.quadrants.clear();
        tree.quadrants.push(fine);
        tree.recount();
        tree.update_desc();
        forest.update_local_meta();

        let inq = OverlapQuad::local(Quad::new([h, 0], 1), 0);
        let mut out = Vec::new();
        compute_overlap(&forest, &[inq], Balance::full::<2>(), None, &mut out);
        assert!(!out.is_empty());
        for o in &out {
            assert_eq!(o.which_tree, 0);
            assert_eq!(o.quad.child_id(), 0);
            assert!(o.quad.is_inside_root());
            assert_eq!(o.quad.level, fine.level - 1);
            assert!(inq.quad.is_ancestor(&o.quad));
        }
        // The cell directly across from the fine quadrant is among them.
        assert!(out.iter().any(|o| o.quad == Quad::new([h, 0], 3)));
    }

    #[test]
    fn test_overlap_across_face_balances_neighbor() {
        // Tree 1 carries a level-4 corner refinement against the face it
        // shares with tree 0; tree 0 is a single root quadrant. The
        // overlap seeds plus a border balance give tree 0 at most one
        // level step per face cell and satisfy 2:1 across the face.
        let mut forest = two_tree_forest(&[Quad::new([0, 0], 4)]);

        // Tree 0's root as seen from tree 1: across tree 1's -x face.
        let ft01 = forest.conn.find_face_transform(0, 1).unwrap().clone();
        let remote_root = ft01.transform_face(&Quad::root());
        assert!(!remote_root.is_inside_root());

        let input = [OverlapQuad {
            quad: remote_root,
            which_tree: 1,
            from_tree: 0,
        }];
        let mut out = Vec::new();
        compute_overlap(&forest, &input, Balance::full::<2>(), None, &mut out);
        uniqify_overlap(&[], &mut out);
        assert!(!out.is_empty());
        for o in &out {
            assert_eq!(o.which_tree, 0);
            assert!(o.quad.is_inside_root());
            assert_eq!(o.quad.child_id(), 0);
        }

        // Feed the seeds into tree 0's border balance.
        let mut borders = vec![{
            let mut b = vec![Quad::root()];
            b.extend(out.iter().map(|o| o.quad));
            b
        }];
        balance_border(&mut forest, Balance::full::<2>(), 0, None, &mut borders);
        let tree0 = forest.tree(0).clone();
        assert!(tree0.is_complete());

        // Cross-face 2:1: every tree-0 leaf touching the shared face,
        // mapped into tree 1, differs at most one level from touching
        // tree-1 leaves.
        for q0 in tree0.quadrants.iter() {
            let h = Quad::len(q0.level);
            if q0.coords[0] + h != R {
                continue;
            }
            let mapped = ft01.transform_face(q0);
            for q1 in forest.tree(1).quadrants.iter() {
                let h1 = Quad::len(q1.level) as i64;
                let hm = Quad::len(mapped.level) as i64;
                let touch = (0..2).all(|a| {
                    let (a0, a1) = (mapped.coords[a] as i64, mapped.coords[a] as i64 + hm);
                    let (b0, b1) = (q1.coords[a] as i64, q1.coords[a] as i64 + h1);
                    a1 >= b0 && b1 >= a0
                });
                if touch {
                    assert!(
                        (q0.level - q1.level).abs() <= 1,
                        "cross-face violation {:?} vs {:?}",
                        q0,
                        q1
                    );
                }
            }
        }
    }

    #[test]
    fn test_overlap_legacy_emits_fine_quadrants() {
        let forest = two_tree_forest(&[Quad::new([0, 0], 4)]);
        let ft01 = forest.conn.find_face_transform(0, 1).unwrap().clone();
        let remote_root = ft01.transform_face(&Quad::root());
        let input = [OverlapQuad {
            quad: remote_root,
            which_tree: 1,
            from_tree: 0,
        }];
        let mut out = Vec::new();
        compute_overlap_legacy(&forest, &input, &mut out);
        assert!(!out.is_empty());
        // Legacy answers are the fine quadrants themselves, expressed in
        // the origin tree's extended shell.
        for o in &out {
            assert_eq!(o.which_tree, 0);
            assert!(!o.quad.is_inside_root());
            assert!(o.quad.is_extended());
            assert!(o.quad.level > 1);
        }
    }

    #[test]
    fn test_uniqify_overlap() {
        let q = Quad::new([0, 0], 2);
        let r = Quad::new([0, R / 4], 2);
        let a = OverlapQuad::local(q, 0);
        let b = OverlapQuad::local(r, 0);
        let c = OverlapQuad::local(q, 1);
        let mut out = vec![c, a, b, a, a];
        uniqify_overlap(&[], &mut out);
        assert_eq!(out, vec![a, b, c]);

        // Entries in the skip list are dropped.
        let mut out = vec![a, b];
        uniqify_overlap(&[b], &mut out);
        assert_eq!(out, vec![a]);
    }
}
