//! Cross-tree, cross-process 2:1 balance: one tree carries a deep corner
//! refinement against the face it shares with a coarse neighbor tree.
//! The refinement travels through the overlap computation to the ranks
//! owning the neighbor, which balance their border; afterwards the level
//! difference across the shared face is at most one everywhere.

use std::rc::Rc;

use mpi::traits::{Communicator, CommunicatorCollectives};
use quadforest::{
    balance_border, balance_subtree, compute_overlap, tools::gather_to_all, uniqify_overlap,
    Balance, Connectivity, Coord, Forest, OverlapQuad, Position, Quadrant,
};

type Quad = Quadrant<2>;

const R: Coord = Quad::ROOT_LEN;

/// Demo wire encoding of a (tree, quadrant) pair.
fn encode(which_tree: i32, q: &Quad) -> Position {
    Position {
        which_tree,
        coords: [q.coords[0], q.coords[1], 0],
        level: q.level,
    }
}

fn decode(p: &Position) -> Quad {
    Quad::new([p.coords[0], p.coords[1]], p.level)
}

/// Recompute the replicated global counts after local refinement.
fn refresh_global_counts<C: CommunicatorCollectives>(forest: &mut Forest<2>, comm: &C) {
    let counts = gather_to_all(&[forest.local_num_quadrants], comm);
    forest.global_first_quadrant[0] = 0;
    for (i, &c) in counts.iter().enumerate() {
        forest.global_first_quadrant[i + 1] = forest.global_first_quadrant[i] + c as i64;
    }
    forest.global_num_quadrants = *forest.global_first_quadrant.last().unwrap();
}

/// The locally owned leaves of `tree` touching the face `x == R`
/// (face 1) or `x == 0` (face 0).
fn face_leaves(forest: &Forest<2>, which_tree: i32, face: usize) -> Vec<Quad> {
    if which_tree < forest.first_local_tree || which_tree > forest.last_local_tree {
        return Vec::new();
    }
    forest
        .tree(which_tree)
        .quadrants
        .iter()
        .filter(|q| {
            let h = Quad::len(q.level);
            match face {
                0 => q.coords[0] == 0,
                _ => q.coords[0] + h == R,
            }
        })
        .copied()
        .collect()
}

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank();

    let conn = Rc::new(Connectivity::<2>::brick([2, 1]));
    let mut forest = Forest::new(conn.clone(), &comm, 0, 2, None);
    assert!(forest.is_valid(&comm));

    // Refine the corner of tree 1 at the shared face down to level 4.
    // The level-2 quadrant at the corner is owned by exactly one rank.
    let corner = Quad::new([0, 0], 2);
    if (forest.first_local_tree..=forest.last_local_tree).contains(&1)
        && forest.tree(1).quadrants.first() == Some(&corner)
    {
        let mut fine = corner.children()[0].children();
        fine.extend_from_slice(&corner.children()[1..]);
        let tree = &mut forest.trees[1];
        tree.quadrants.splice(0..1, fine);
        tree.recount();
        tree.update_desc();
        balance_subtree(&mut forest, Balance::full::<2>(), 1, None);
    }
    refresh_global_counts(&mut forest, &comm);
    assert!(forest.is_valid(&comm));

    // Tree 0 owners publish their leaves along the shared face; tree 1
    // owners see them as extended quadrants across their -x face.
    let ft01 = *conn.find_face_transform(0, 1).unwrap();
    let published: Vec<Position> = face_leaves(&forest, 0, 1)
        .iter()
        .map(|q| encode(0, &ft01.transform_face(q)))
        .collect();
    let remote = gather_to_all(&published, &comm);

    // Ranks holding tree 1 answer with the seeds the tree 0 owners need.
    let mut out: Vec<OverlapQuad<2>> = Vec::new();
    if (forest.first_local_tree..=forest.last_local_tree).contains(&1)
        && !forest.tree(1).is_empty()
    {
        let input: Vec<OverlapQuad<2>> = remote
            .iter()
            .map(|p| OverlapQuad {
                quad: decode(p),
                which_tree: 1,
                from_tree: 0,
            })
            .collect();
        compute_overlap(&forest, &input, Balance::full::<2>(), None, &mut out);
        uniqify_overlap(&[], &mut out);
    }
    let seeds = gather_to_all(
        &out.iter()
            .map(|o| encode(o.which_tree, &o.quad))
            .collect::<Vec<_>>(),
        &comm,
    );

    // Tree 0 owners fold the seeds into a border and balance it.
    if (forest.first_local_tree..=forest.last_local_tree).contains(&0)
        && !forest.tree(0).is_empty()
    {
        let mut border: Vec<Quad> = Vec::new();
        for s in seeds.iter().filter(|s| s.which_tree == 0) {
            let seed = decode(s);
            let quads = &forest.tree(0).quadrants;
            if let Ok(i) = quads.binary_search_by(|q| q.disjoint_cmp(&seed)) {
                if quads[i].level < seed.level {
                    border.push(quads[i]);
                    border.push(seed);
                }
            }
        }
        if !border.is_empty() {
            let mut borders = vec![border];
            balance_border(&mut forest, Balance::full::<2>(), 0, None, &mut borders);
        }
    }
    refresh_global_counts(&mut forest, &comm);
    assert!(forest.is_valid(&comm));

    // Cross-face condition: collect both sides of the shared face on
    // every rank and compare touching pairs in tree 1 coordinates.
    let mine: Vec<Position> = face_leaves(&forest, 0, 1)
        .iter()
        .map(|q| encode(0, &ft01.transform_face(q)))
        .chain(face_leaves(&forest, 1, 0).iter().map(|q| encode(1, q)))
        .collect();
    let all = gather_to_all(&mine, &comm);
    let side0: Vec<Quad> = all.iter().filter(|p| p.which_tree == 0).map(decode).collect();
    let side1: Vec<Quad> = all.iter().filter(|p| p.which_tree == 1).map(decode).collect();
    assert!(!side0.is_empty() && !side1.is_empty());
    for a in &side0 {
        let ha = Quad::len(a.level) as i64;
        for b in &side1 {
            let hb = Quad::len(b.level) as i64;
            let touch = (0..2).all(|i| {
                let (a0, a1) = (a.coords[i] as i64, a.coords[i] as i64 + ha);
                let (b0, b1) = (b.coords[i] as i64, b.coords[i] as i64 + hb);
                a1 >= b0 && b1 >= a0
            });
            if touch {
                assert!(
                    (a.level - b.level).abs() <= 1,
                    "2:1 violated across the tree face: {:?} vs {:?}",
                    a,
                    b
                );
            }
        }
    }

    if rank == 0 {
        println!(
            "cross-tree balance holds, {} quadrants total",
            forest.global_num_quadrants
        );
    }
}
