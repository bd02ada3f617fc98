//! Local completion and 2:1 balance of a single tree.
//!
//! The engine walks the tree bottom-up, inserting for every quadrant its
//! missing siblings, its parent and the parent's relevant indirect
//! neighbors, deduplicated through a per-level bank of hash tables and
//! outlists. Appending the collected candidates, sorting, trimming to
//! the owned window and linearizing restores the tree invariants and,
//! for a positive balance selector, the 2:1 condition.

use std::collections::HashMap;

use crate::forest::{init_quadrant, Forest, InitFn};
use crate::quadrant::Quadrant;
use crate::types::{Balance, Coord, PayloadRef, TopIdx};

/// Marks a work-list quadrant that lost leaf status to a finer insert.
const BLOCKED: PayloadRef = PayloadRef(u32::MAX - 1);

/// Why a candidate entered the hash bank. A parent candidate that is hit
/// again as a parent proves the whole chain above it was already
/// triggered, so the stage can stop early.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    Plain,
    Parent,
}

/// Number of stage-1 candidates per quadrant for a balance selector.
fn balance_count<const D: usize>(balance: usize) -> usize {
    match D {
        2 => [5, 7, 8][balance],
        3 => [9, 12, 15, 16][balance],
        _ => unreachable!(),
    }
}

/// Coordinate multipliers, relative to the zero-shifted parent and in
/// units of the parent length, of the candidates inserted for balancing.
/// Layout: faces, then edges (3D), then corners.
const BALANCE_COORD_2D: [[Coord; 3]; 8] = [
    [-1, 1, 0],
    [2, 0, 0],
    [1, -1, 0],
    [0, 2, 0],
    [-1, -1, 0],
    [2, -1, 0],
    [-1, 2, 0],
    [2, 2, 0],
];

const BALANCE_COORD_3D: [[Coord; 3]; 26] = [
    // faces
    [-1, 1, 1],
    [2, 0, 0],
    [1, -1, 1],
    [0, 2, 0],
    [1, 1, -1],
    [0, 0, 2],
    // edges
    [1, -1, -1],
    [1, 2, -1],
    [1, -1, 2],
    [0, 2, 2],
    [-1, 1, -1],
    [2, 1, -1],
    [-1, 1, 2],
    [2, 0, 2],
    [-1, -1, 1],
    [2, -1, 1],
    [-1, 2, 1],
    [2, 2, 0],
    // corners
    [-1, -1, -1],
    [2, -1, -1],
    [-1, 2, -1],
    [2, 2, -1],
    [-1, -1, 2],
    [2, -1, 2],
    [-1, 2, 2],
    [2, 2, 2],
];

/// Faces adjacent to each corner.
const CORNER_FACES_2D: [[usize; 2]; 4] = [[0, 2], [1, 2], [0, 3], [1, 3]];
const CORNER_FACES_3D: [[usize; 3]; 8] = [
    [0, 2, 4],
    [1, 2, 4],
    [0, 3, 4],
    [1, 3, 4],
    [0, 2, 5],
    [1, 2, 5],
    [0, 3, 5],
    [1, 3, 5],
];

/// Edges adjacent to each corner (3D).
const CORNER_EDGES_3D: [[usize; 3]; 8] = [
    [0, 4, 8],
    [0, 5, 9],
    [1, 4, 10],
    [1, 5, 11],
    [2, 6, 8],
    [2, 7, 9],
    [3, 6, 10],
    [3, 7, 11],
];

fn face_entry<const D: usize>(face: usize) -> [Coord; 3] {
    if D == 2 {
        BALANCE_COORD_2D[face]
    } else {
        BALANCE_COORD_3D[face]
    }
}

fn corner_entry<const D: usize>(corner: usize) -> [Coord; 3] {
    if D == 2 {
        BALANCE_COORD_2D[4 + corner]
    } else {
        BALANCE_COORD_3D[18 + corner]
    }
}

fn corner_face<const D: usize>(corner: usize, which: usize) -> usize {
    if D == 2 {
        CORNER_FACES_2D[corner][which]
    } else {
        CORNER_FACES_3D[corner][which]
    }
}

/// Which unit-root cell of the 3x3 neighborhood a coordinate falls into.
fn root_bucket<const D: usize>(c: Coord) -> i64 {
    (c as i64).div_euclid(Quadrant::<D>::ROOT_LEN as i64)
}

/// Complete a tree without imposing any neighbor condition.
pub fn complete_subtree<const D: usize>(
    forest: &mut Forest<D>,
    which_tree: TopIdx,
    init: Option<InitFn<D>>,
) {
    complete_or_balance(forest, which_tree, init, 0);
}

/// Complete a tree and establish the 2:1 condition for the selected
/// neighbor kinds.
pub fn balance_subtree<const D: usize>(
    forest: &mut Forest<D>,
    btype: Balance,
    which_tree: TopIdx,
    init: Option<InitFn<D>>,
) {
    complete_or_balance(forest, which_tree, init, btype.selector::<D>());
}

fn complete_or_balance<const D: usize>(
    forest: &mut Forest<D>,
    which_tree: TopIdx,
    init: Option<InitFn<D>>,
    balance: usize,
) {
    assert!(which_tree >= forest.first_local_tree && which_tree <= forest.last_local_tree);
    assert!(balance <= D);

    let (full_tree, first_pos, next_pos) = forest.tree_info(which_tree);
    let Forest { trees, data, .. } = forest;
    let tree = &mut trees[which_tree as usize];
    debug_assert!(tree.is_almost_sorted(true));

    let incount = tree.len();
    if incount == 0 {
        return;
    }
    let inmaxl = tree.maxlevel as usize;
    let num_children = Quadrant::<D>::NUM_CHILDREN;
    let fbound = balance_count::<D>(D);
    let bbound = balance_count::<D>(balance);

    // Per-level bank: hash tables against duplicates, outlists holding
    // the candidates in insertion order. Slots above the input maxlevel
    // are never touched.
    let mut hash: Vec<HashMap<Quadrant<D>, CandidateKind>> = vec![HashMap::new(); inmaxl + 1];
    let mut outlist: Vec<Vec<Quadrant<D>>> = vec![Vec::new(); inmaxl + 1];

    let mut count_outside_root = 0usize;
    let mut count_already_inlist = 0usize;
    let mut count_already_outlist = 0usize;

    // Bottom-up sweep over the input quadrants and the candidates
    // accumulated at each level so far.
    for l in (1..=inmaxl).rev() {
        let ocount = outlist[l].len();
        let mut iz = 0usize;
        while iz < incount + ocount {
            let mut isfamily = false;
            let q = if iz < incount {
                let q = tree.quadrants[iz];
                if q.level as usize != l {
                    iz += 1;
                    continue;
                }
                // Catch a complete run of adjacent siblings at once.
                if iz + num_children <= incount
                    && Quadrant::is_family(&tree.quadrants[iz..iz + num_children])
                {
                    isfamily = true;
                    iz += num_children - 1;
                }
                q
            } else {
                let q = outlist[l][iz - incount];
                debug_assert_eq!(q.level as usize, l);
                q
            };
            iz += 1;
            debug_assert!(q.is_extended());
            let isoutroot = !q.is_inside_root();
            // Outside quadrants always get the full candidate set; their
            // in-root siblings are skipped below instead. Completion
            // alone never looks past the parent.
            let rbound = if isoutroot && balance > 0 { fbound } else { bbound };
            let qid = q.child_id();

            let mut pshift = q;
            let mut ph: Coord = 0;
            let mut pid = 0usize;

            'stage: for sid in 0..rbound {
                // Stage 1: generate the candidate.
                let mut cand;
                if sid < num_children {
                    if qid == sid || isfamily || isoutroot {
                        continue;
                    }
                    cand = q.sibling(sid);
                } else if sid == num_children {
                    cand = q.parent();
                    if balance > 0 {
                        pshift = cand;
                        ph = Quadrant::<D>::len(pshift.level);
                        pid = pshift.child_id();
                        if pid > 0 && pshift.level > 0 {
                            pshift = pshift.sibling(0);
                        }
                    }
                } else {
                    if l == 1 {
                        // No tree-size neighbors of the parent.
                        break 'stage;
                    }
                    let c0 = balance_count::<D>(0);
                    let c1 = balance_count::<D>(1);
                    let offs: [Coord; 3] = if sid < c1 {
                        face_entry::<D>(corner_face::<D>(pid, sid - c0))
                    } else if D == 3 && sid < balance_count::<D>(2) {
                        BALANCE_COORD_3D[6 + CORNER_EDGES_3D[pid][sid - c1]]
                    } else {
                        corner_entry::<D>(pid)
                    };
                    cand = pshift;
                    for a in 0..D {
                        cand.coords[a] = pshift.coords[a] + offs[a] * ph;
                    }
                    if !isoutroot {
                        if !cand.is_inside_root() {
                            count_outside_root += 1;
                            continue;
                        }
                    } else {
                        if !cand.is_inside_3x3() {
                            count_outside_root += 1;
                            continue;
                        }
                        // Cross-tree neighbors travel through the overlap
                        // exchange; outside candidates must stay within
                        // the triggering quadrant's virtual root.
                        if !cand.is_inside_root()
                            && (0..D).any(|a| {
                                root_bucket::<D>(q.coords[a]) != root_bucket::<D>(cand.coords[a])
                            })
                        {
                            count_outside_root += 1;
                            continue;
                        }
                    }
                }
                debug_assert!(cand.is_extended());

                // Stage 2: include the candidate unless known.
                let lvl = cand.level as usize;
                if let Some(kind) = hash[lvl].get(&cand) {
                    count_already_outlist += 1;
                    if sid == num_children && *kind == CandidateKind::Parent {
                        // This parent chain has been triggered before.
                        break 'stage;
                    }
                    continue;
                }
                if tree.quadrants.binary_search(&cand).is_ok() {
                    count_already_inlist += 1;
                    continue;
                }
                let kind = if sid == num_children {
                    CandidateKind::Parent
                } else {
                    CandidateKind::Plain
                };
                hash[lvl].insert(cand, kind);
                outlist[lvl].push(cand);
            }
        }
    }

    // Merge the candidates that lie inside the root into the tree.
    let mut num_added = 0usize;
    for level_list in &outlist {
        for &cand in level_list {
            if cand.is_inside_root() {
                let mut c = cand;
                init_quadrant(data, init, which_tree, &mut c);
                tree.push(c);
                num_added += 1;
            }
        }
    }
    debug_assert_eq!(incount + num_added, tree.len());

    tree.sort();
    let num_nonowned = tree.remove_nonowned(data, full_tree, &first_pos, &next_pos);
    let num_linearized = tree.linearize(data);

    tracing::debug!(
        which_tree,
        num_added,
        num_nonowned,
        num_linearized,
        count_already_inlist,
        count_already_outlist,
        count_outside_root,
        "completed subtree"
    );

    debug_assert!(tree.is_complete());
    forest.update_local_meta();
}

/// Balance the subtrees of selected border quadrants.
///
/// The border array of each local tree holds containing quadrants `p`
/// (leaves of the tree) followed by zero-child-id descendants at various
/// levels. Each `p` is replaced in the tree by the Morton-sorted linear
/// filling of its balanced subtree.
pub fn balance_border<const D: usize>(
    forest: &mut Forest<D>,
    btype: Balance,
    which_tree: TopIdx,
    init: Option<InitFn<D>>,
    borders: &mut [Vec<Quadrant<D>>],
) {
    let num_children = Quadrant::<D>::NUM_CHILDREN;
    let selector = btype.selector::<D>();
    let bound = if selector == D {
        num_children
    } else if D == 3 && selector == 2 {
        num_children - 1
    } else {
        D + 1
    };

    assert!(which_tree >= forest.first_local_tree && which_tree <= forest.last_local_tree);
    let first_tree = forest.first_local_tree;
    let Forest { trees, data, .. } = forest;
    let tree = &mut trees[which_tree as usize];
    let qarray = &mut borders[(which_tree - first_tree) as usize];
    if qarray.is_empty() {
        return;
    }

    qarray.sort_unstable();
    qarray.dedup();

    let tqorig = tree.len();
    let mut tqoffset = 0usize;
    let mut num_added_total = 0usize;
    let mut count_already_inlist = 0usize;
    let mut count_already_outlist = 0usize;
    let mut count_ancestor_inlist = 0usize;

    let mut iz = 0usize;
    while iz < qarray.len() {
        let p = qarray[iz];
        iz += 1;

        // Skip border quadrants outside the owned part of the tree.
        if p.morton_cmp(&tree.first_desc).is_lt() && !p.is_ancestor(&tree.first_desc) {
            continue;
        }
        if p.morton_cmp(&tree.last_desc).is_gt() {
            continue;
        }
        debug_assert!(p.is_valid());

        // Collect the run of descendants seeded under p.
        let jz = iz;
        let mut kz = jz;
        let minlevel = p.level + 1;
        let mut maxlevel = minlevel;
        while kz < qarray.len() && p.is_ancestor(&qarray[kz]) {
            maxlevel = maxlevel.max(qarray[kz].level);
            debug_assert_eq!(qarray[kz].child_id(), 0);
            kz += 1;
        }
        let incount = kz - jz;
        if incount == 0 {
            continue;
        }
        iz = kz;

        // p must be a leaf of the tree, past everything already filled.
        let tqindex = tqoffset
            + tree.quadrants[tqoffset..]
                .binary_search(&p)
                .expect("border quadrant is not a leaf");
        tqoffset = tqindex + 1;

        let mut inlist: Vec<Quadrant<D>> = qarray[jz..kz].to_vec();
        for q in inlist.iter_mut() {
            q.data = PayloadRef::NULL;
        }

        // Balance the seeds within p. No hash is needed at minlevel or
        // below (gap filling creates those), nor at maxlevel (a quadrant
        // only spawns larger ones).
        let mut hash: Vec<HashMap<Quadrant<D>, ()>> =
            vec![HashMap::new(); maxlevel as usize + 1];
        let mut outlist: Vec<Vec<Quadrant<D>>> = vec![Vec::new(); maxlevel as usize + 1];

        let mut l = maxlevel;
        while l > minlevel + 1 {
            let ocount = outlist[l as usize].len();
            let mut jj = 0usize;
            while jj < incount + ocount {
                let q = if jj < incount {
                    let q = inlist[jj];
                    if q.level != l || q.data == BLOCKED {
                        jj += 1;
                        continue;
                    }
                    q
                } else {
                    outlist[l as usize][jj - incount]
                };
                jj += 1;
                debug_assert!(p.is_ancestor(&q));
                debug_assert_eq!(q.child_id(), 0);

                let par = q.parent();
                let ph = Quadrant::<D>::len(par.level - 1);
                let pid = par.child_id();
                let par = par.sibling(0);

                for sid in 0..bound {
                    let mut cand = par;
                    if sid == 0 {
                        // The smallest ancestor that is still needed.
                        while cand.level > minlevel + 1
                            && cand.ancestor_id(cand.level - 1) == pid
                        {
                            cand = cand.parent();
                        }
                        debug_assert!(p.is_ancestor(&cand));
                        cand = cand.sibling(0);
                    } else if sid <= D {
                        let axis = sid - 1;
                        cand.coords[axis] =
                            par.coords[axis] + if pid & (1 << axis) != 0 { ph } else { -ph };
                    } else if D == 3 && sid < 7 {
                        for &axis in &[[1usize, 2], [0, 2], [0, 1]][sid - 4] {
                            cand.coords[axis] =
                                par.coords[axis] + if pid & (1 << axis) != 0 { ph } else { -ph };
                        }
                    } else {
                        for axis in 0..D {
                            cand.coords[axis] =
                                par.coords[axis] + if pid & (1 << axis) != 0 { ph } else { -ph };
                        }
                    }
                    debug_assert_eq!(cand.child_id(), 0);
                    if sid != 0 && !p.is_ancestor(&cand) {
                        continue;
                    }

                    let lvl = cand.level as usize;
                    if hash[lvl].contains_key(&cand) {
                        count_already_outlist += 1;
                        continue;
                    }
                    if let Ok(ri) = inlist.binary_search_by(|e| e.disjoint_cmp(&cand)) {
                        let r = inlist[ri];
                        if r == cand {
                            count_already_inlist += 1;
                            continue;
                        }
                        if r.is_ancestor(&cand) {
                            // r is no longer a leaf of the subtree.
                            inlist[ri].data = BLOCKED;
                        } else if sid != 0 {
                            debug_assert!(cand.is_ancestor(&r));
                            count_ancestor_inlist += 1;
                            continue;
                        }
                    }
                    hash[lvl].insert(cand, ());
                    outlist[lvl].push(cand);
                }
            }
            l -= 1;
        }

        // Merge candidates and restore Morton order.
        for level_list in outlist.iter().skip(minlevel as usize + 1) {
            inlist.extend_from_slice(level_list);
        }
        inlist.sort_unstable();

        // Walk the subtree of p, emitting the largest quadrant that fits
        // each gap; blocked entries are subdivided on the way.
        let mut flist: Vec<Quadrant<D>> = Vec::new();
        let mut tempq = p.first_descendant(minlevel);
        let mut pid_walk = 0usize;
        let mut jw = 0usize;
        let mut cur: Option<Quadrant<D>> = Some(inlist[0]);
        debug_assert_eq!(inlist[0].child_id(), 0);
        'fill: loop {
            // Emit while tempq comes before the next listed quadrant.
            loop {
                if let Some(qq) = cur {
                    if tempq == qq || tempq.is_ancestor(&qq) {
                        break;
                    }
                    debug_assert!(tempq.morton_cmp(&qq).is_lt());
                }
                flist.push(tempq);

                // A last sibling closes its family; go up.
                while tempq.level >= minlevel && pid_walk == num_children - 1 {
                    tempq = tempq.parent();
                    pid_walk = tempq.child_id();
                }
                if tempq.level < minlevel {
                    break 'fill;
                }
                pid_walk += 1;
                tempq = tempq.sibling(pid_walk);
            }

            let qq = cur.unwrap();
            if qq.coords == tempq.coords {
                // tempq descends onto the listed quadrant.
                if qq.level > tempq.level {
                    pid_walk = 0;
                }
                tempq.level = qq.level;
                jw += 1;
                cur = inlist.get(jw).copied();
                debug_assert!(cur.map_or(true, |n| n.child_id() == 0));
            } else {
                // The largest first descendant of tempq before qq.
                let tempp = tempq.first_descendant(Quadrant::<D>::MAX_LEVEL);
                tempq = tempp.nearest_common_ancestor(&qq);
                tempq.level += 1;
                pid_walk = 0;
                debug_assert!(tempq.is_valid());
                debug_assert!(tempq.morton_cmp(&qq).is_lt() && !tempq.is_ancestor(&qq));
            }
        }

        debug_assert!(flist.len() >= num_children);
        debug_assert!(flist.windows(2).all(|w| w[0].is_next(&w[1])));

        // Replace p by the filled subtree.
        let old = tree.quadrants[tqindex];
        debug_assert_eq!(old, p);
        data.free(old.data);
        tree.quadrants_per_level[old.level as usize] -= 1;

        for f in flist.iter_mut() {
            debug_assert!(p.is_ancestor(f));
            init_quadrant(data, init, which_tree, f);
            tree.quadrants_per_level[f.level as usize] += 1;
            if f.level > tree.maxlevel {
                tree.maxlevel = f.level;
            }
        }
        let num_this_added = flist.len() - 1;
        num_added_total += num_this_added;
        tree.quadrants.splice(tqindex..=tqindex, flist.iter().copied());
        tqoffset += num_this_added;
    }

    tracing::debug!(
        which_tree,
        num_added_total,
        count_already_inlist,
        count_already_outlist,
        count_ancestor_inlist,
        "balanced border"
    );

    debug_assert_eq!(tqorig + num_added_total, tree.len());
    debug_assert!(tree.is_complete());
    forest.update_local_meta();
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::connectivity::Connectivity;
    use crate::forest::Forest;
    use crate::tree::Tree;

    type Quad = Quadrant<2>;

    fn forest_with_tree(quads: &[Quad]) -> Forest<2> {
        let conn = Rc::new(Connectivity::<2>::unit());
        let mut forest = Forest::new_with_rank(conn, 0, 1, 0, 0, None);
        let tree = &mut forest.trees[0];
        tree.quadrants.clear();
        for &q in quads {
            tree.quadrants.push(q);
        }
        tree.recount();
        tree.update_desc();
        forest.update_local_meta();
        forest
    }

    /// Whether the closed regions of two quadrants touch at all.
    fn touches<const D: usize>(a: &Quadrant<D>, b: &Quadrant<D>) -> bool {
        let ha = Quadrant::<D>::len(a.level) as i64;
        let hb = Quadrant::<D>::len(b.level) as i64;
        (0..D).all(|i| {
            let (a0, a1) = (a.coords[i] as i64, a.coords[i] as i64 + ha);
            let (b0, b1) = (b.coords[i] as i64, b.coords[i] as i64 + hb);
            a1 >= b0 && b1 >= a0
        })
    }

    fn assert_two_to_one<const D: usize>(tree: &Tree<D>) {
        for a in &tree.quadrants {
            for b in &tree.quadrants {
                if touches(a, b) {
                    assert!(
                        (a.level - b.level).abs() <= 1,
                        "{:?} and {:?} violate 2:1",
                        a,
                        b
                    );
                }
            }
        }
    }

    /// 2:1 among the descendants of `p` only; border balance does not
    /// touch the rest of the tree.
    fn assert_two_to_one_within(tree: &Tree<2>, p: &Quad) {
        for a in tree.quadrants.iter().filter(|q| p.is_ancestor(q)) {
            for b in tree.quadrants.iter().filter(|q| p.is_ancestor(q)) {
                if touches(a, b) {
                    assert!((a.level - b.level).abs() <= 1);
                }
            }
        }
    }

    #[test]
    fn test_complete_subtree_from_two_quadrants() {
        // One level-1 quadrant plus a level-2 quadrant in the third
        // child: completion keeps both and splits only where needed.
        let h = Quad::ROOT_LEN / 2;
        let a = Quad::new([0, 0], 1);
        let b = Quad::new([0, h], 2);
        let mut forest = forest_with_tree(&[a, b]);
        complete_subtree(&mut forest, 0, None);
        let tree = forest.tree(0);
        assert!(tree.is_complete());
        // Four root children with the third split into its children.
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.quadrants_per_level[1], 3);
        assert_eq!(tree.quadrants_per_level[2], 4);
        assert!(tree.quadrants.contains(&b));
    }

    #[test]
    fn test_balance_staircase_from_corner() {
        // A single deep quadrant in the root corner; balance produces
        // the minimal staircase of levels down to the far corner.
        let q = Quad::new([0, 0], 5);
        let mut forest = forest_with_tree(&[q]);
        balance_subtree(&mut forest, Balance::full::<2>(), 0, None);
        let tree = forest.tree(0);
        assert!(tree.is_complete());
        assert_two_to_one(tree);
        // Family at level 5 plus three siblings at each of 4, 3, 2, 1.
        assert_eq!(tree.len(), 16);
        for level in 1..=4 {
            assert_eq!(tree.quadrants_per_level[level], 3);
        }
        assert_eq!(tree.quadrants_per_level[5], 4);
    }

    #[test]
    fn test_balance_interior_fine_quadrant() {
        // A fine quadrant at the center of the tree; the ripple spreads
        // in all directions and stays minimal.
        let h = Quad::ROOT_LEN / 2;
        let q = Quad::new([h, h], 5);
        let mut forest = forest_with_tree(&[q]);
        balance_subtree(&mut forest, Balance::full::<2>(), 0, None);
        let tree = forest.tree(0).clone();
        assert!(tree.is_complete());
        assert_two_to_one(&tree);
        assert!(tree.quadrants.contains(&q));

        // Idempotence: balancing again changes nothing.
        balance_subtree(&mut forest, Balance::full::<2>(), 0, None);
        assert_eq!(forest.tree(0).quadrants, tree.quadrants);
    }

    #[test]
    fn test_balance_face_only_weaker_than_full() {
        let h = Quad::ROOT_LEN / 2;
        let q = Quad::new([h, h], 4);
        let mut face = forest_with_tree(&[q]);
        balance_subtree(&mut face, Balance::Face, 0, None);
        let mut full = forest_with_tree(&[q]);
        balance_subtree(&mut full, Balance::full::<2>(), 0, None);
        assert!(face.tree(0).is_complete());
        assert!(full.tree(0).is_complete());
        assert!(face.tree(0).len() <= full.tree(0).len());
        assert_two_to_one(full.tree(0));
    }

    #[test]
    fn test_balance_empty_and_coarse_tree() {
        // The root alone is already complete and balanced.
        let mut forest = forest_with_tree(&[Quad::root()]);
        balance_subtree(&mut forest, Balance::full::<2>(), 0, None);
        assert_eq!(forest.tree(0).quadrants, vec![Quad::root()]);
    }

    #[test]
    fn test_balance_3d_corner() {
        let q = Quadrant::<3>::new([0, 0, 0], 3);
        let conn = Rc::new(Connectivity::<3>::unit());
        let mut forest = Forest::new_with_rank(conn, 0, 1, 0, 0, None);
        let tree = &mut forest.trees[0];
        tree.quadrants.clear();
        tree.quadrants.push(q);
        tree.recount();
        tree.update_desc();
        forest.update_local_meta();

        balance_subtree(&mut forest, Balance::full::<3>(), 0, None);
        let tree = forest.tree(0);
        assert!(tree.is_complete());
        // Family of eight at level 3 plus seven siblings at 2 and 1.
        assert_eq!(tree.quadrants_per_level[3], 8);
        assert_eq!(tree.quadrants_per_level[2], 7);
        assert_eq!(tree.quadrants_per_level[1], 7);
        assert_eq!(tree.len(), 22);
        assert_two_to_one(tree);
    }

    #[test]
    fn test_balance_3d_interior() {
        // A fine octant away from the root boundary drives the edge and
        // corner candidates of the sweep.
        let h = Quadrant::<3>::ROOT_LEN / 2;
        let q = Quadrant::<3>::new([h, h, h], 4);
        let conn = Rc::new(Connectivity::<3>::unit());
        let mut forest = Forest::new_with_rank(conn, 0, 1, 0, 0, None);
        let tree = &mut forest.trees[0];
        tree.quadrants.clear();
        tree.quadrants.push(q);
        tree.recount();
        tree.update_desc();
        forest.update_local_meta();

        balance_subtree(&mut forest, Balance::full::<3>(), 0, None);
        let tree = forest.tree(0).clone();
        assert!(tree.is_complete());
        assert!(tree.quadrants.contains(&q));
        assert_two_to_one(&tree);

        balance_subtree(&mut forest, Balance::full::<3>(), 0, None);
        assert_eq!(forest.tree(0).quadrants, tree.quadrants);
    }

    #[test]
    fn test_balance_idempotent_on_random_input() {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..5 {
            let mut quads = Vec::new();
            for _ in 0..12 {
                let level = rng.gen_range(1..=6);
                let h = Quad::len(level);
                let cells = Quad::ROOT_LEN / h;
                let x = rng.gen_range(0..cells) * h;
                let y = rng.gen_range(0..cells) * h;
                quads.push(Quad::new([x, y], level));
            }
            quads.sort_unstable();
            quads.dedup();
            // Balance expects linear input; drop ancestors up front.
            let mut linear: Vec<Quad> = Vec::new();
            for q in quads {
                while linear.last().is_some_and(|p| p.is_ancestor(&q)) {
                    linear.pop();
                }
                linear.push(q);
            }

            let mut forest = forest_with_tree(&linear);
            balance_subtree(&mut forest, Balance::full::<2>(), 0, None);
            let once = forest.tree(0).quadrants.clone();
            assert!(forest.tree(0).is_complete());
            assert_two_to_one(forest.tree(0));
            // Balance refines but never coarsens: no output leaf strictly
            // contains an input quadrant.
            for q in &linear {
                assert!(!once.iter().any(|o| o.is_ancestor(q)));
            }

            balance_subtree(&mut forest, Balance::full::<2>(), 0, None);
            assert_eq!(once, forest.tree(0).quadrants);
        }
    }

    #[test]
    fn test_balance_border_fills_subtree() {
        // A tree of the four root children; the border requests a seed
        // at level 3 inside the first child.
        let root = Quad::root();
        let mut forest = forest_with_tree(&root.children());
        let p = root.children()[0];
        let seed = Quad::new([0, 0], 3);
        let mut borders = vec![vec![p, seed]];
        balance_border(&mut forest, Balance::full::<2>(), 0, None, &mut borders);
        let tree = forest.tree(0);
        assert!(tree.is_complete());
        assert!(tree.quadrants.contains(&seed));
        assert_two_to_one_within(tree, &p);
        // The other three children are untouched.
        for c in &root.children()[1..] {
            assert!(tree.quadrants.contains(c));
        }
    }

    #[test]
    fn test_balance_border_multiple_seeds() {
        let root = Quad::root();
        let mut forest = forest_with_tree(&root.children());
        let p = root.children()[3];
        let h = Quad::ROOT_LEN / 2;
        let s1 = Quad::new([h, h], 3);
        let s2 = Quad::new([h + h / 4, h + h / 4], 4);
        let mut borders = vec![vec![p, s1, s2]];
        balance_border(&mut forest, Balance::full::<2>(), 0, None, &mut borders);
        let tree = forest.tree(0);
        assert!(tree.is_complete());
        assert_two_to_one_within(tree, &p);
        assert!(tree.quadrants.contains(&s2));
    }
}
