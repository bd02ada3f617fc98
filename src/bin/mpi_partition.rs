//! Exercise partition-given redistribution: ship every quadrant to rank
//! zero, then return to the uniform block partition, checking validity,
//! payload preservation and checksum invariance at each step.

use std::rc::Rc;

use mpi::traits::Communicator;
use quadforest::{
    checksum_seq, partition_given, Connectivity, Forest, GloIdx, LocIdx, Quadrant, TopIdx,
};

fn init(tree: TopIdx, q: &Quadrant<2>, bytes: &mut [u8]) {
    bytes[..4].copy_from_slice(&q.coords[0].to_ne_bytes());
    bytes[4..8].copy_from_slice(&tree.to_ne_bytes());
}

fn check_payloads(forest: &Forest<2>) {
    if forest.first_local_tree < 0 {
        return;
    }
    for t in forest.first_local_tree..=forest.last_local_tree {
        for q in &forest.tree(t).quadrants {
            let bytes = forest.data.get(q.data);
            assert_eq!(bytes[..4], q.coords[0].to_ne_bytes());
            assert_eq!(bytes[4..8], t.to_ne_bytes());
        }
    }
}

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank();
    let size = comm.size();

    let initial_level = 2;
    let conn = Rc::new(Connectivity::<2>::brick([2, 1]));
    let mut forest = Forest::new(conn, &comm, 8, initial_level, Some(init));
    assert!(forest.is_valid(&comm));
    check_payloads(&forest);

    let crc = forest.checksum(&comm);
    let total = forest.global_num_quadrants;

    // The checksum is that of the uniform refinement in global Morton
    // order, independent of the process count.
    if rank == 0 {
        let per_tree = 1u64 << (2 * initial_level as u32);
        let mut quads = Vec::new();
        for _ in 0..2 {
            for id in 0..per_tree {
                quads.push(Quadrant::<2>::from_linear_id(id, initial_level));
            }
        }
        assert_eq!(crc, checksum_seq(&quads));
    }

    // Ship everything to rank zero.
    let mut counts = vec![0 as LocIdx; size as usize];
    counts[0] = total as LocIdx;
    let shipped = partition_given(&mut forest, &comm, &counts);
    assert!((0..=total).contains(&shipped));
    if rank == 0 {
        assert_eq!(forest.local_num_quadrants, total as LocIdx);
        assert_eq!(forest.first_local_tree, 0);
        assert_eq!(forest.last_local_tree, 1);
    } else {
        assert_eq!(forest.local_num_quadrants, 0);
        assert_eq!(forest.first_local_tree, -1);
        assert_eq!(forest.last_local_tree, -2);
    }
    assert!(forest.is_valid(&comm));
    assert_eq!(crc, forest.checksum(&comm));
    check_payloads(&forest);

    // And back to the uniform block partition.
    let counts: Vec<LocIdx> = (0..size as GloIdx)
        .map(|p| (total * (p + 1) / size as GloIdx - total * p / size as GloIdx) as LocIdx)
        .collect();
    partition_given(&mut forest, &comm, &counts);
    assert_eq!(forest.local_num_quadrants, counts[rank as usize]);
    assert!(forest.is_valid(&comm));
    assert_eq!(crc, forest.checksum(&comm));
    check_payloads(&forest);

    if rank == 0 {
        println!(
            "partition_given round trip of {} quadrants, checksum {:#010x}",
            total, crc
        );
    }
}
