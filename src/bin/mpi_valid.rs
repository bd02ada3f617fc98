//! Validate a freshly constructed forest: collective validity, agreement
//! of the replicated partition arrays, and Morton order across rank
//! boundaries.

use std::rc::Rc;

use mpi::traits::Communicator;
use quadforest::{tools::communicate_back, Connectivity, Forest, Quadrant};

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank();
    let size = comm.size();

    let conn = Rc::new(Connectivity::<2>::brick([2, 2]));
    let forest = Forest::new(conn, &comm, 0, 3, None);
    assert!(forest.is_valid(&comm));

    // The partition arrays are replicated; every rank must agree with
    // its successor about where the successor starts.
    let mine = [forest.global_first_position[rank as usize]];
    if let Some(next) = communicate_back(&mine, &comm) {
        assert_eq!(next, forest.global_first_position[rank as usize + 1]);
    }

    // Across a rank boundary within one tree, the last local quadrant is
    // the Morton predecessor of the successor's first position.
    if rank < size - 1 && forest.last_local_tree >= 0 {
        let nextpos = forest.global_first_position[rank as usize + 1];
        if nextpos.which_tree == forest.last_local_tree {
            let last = *forest
                .tree(forest.last_local_tree)
                .quadrants
                .last()
                .unwrap();
            let anchor =
                Quadrant::<2>::new([nextpos.coords[0], nextpos.coords[1]], nextpos.level);
            assert!(last.is_next(&anchor));
        }
    }

    // Per-tree invariants on the local trees.
    if forest.first_local_tree >= 0 {
        for t in forest.first_local_tree..=forest.last_local_tree {
            let tree = forest.tree(t);
            assert!(tree.is_sorted());
            assert!(tree.is_linear());
            assert!(tree.is_complete());
        }
    }

    if rank == 0 {
        println!(
            "forest of {} quadrants valid on {} ranks",
            forest.global_num_quadrants, size
        );
    }
}
