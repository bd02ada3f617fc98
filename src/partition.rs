//! Partition-given redistribution: move quadrants between processes so
//! that each ends up with a caller-specified count, preserving global
//! Morton order and the per-quadrant payloads.

use mpi::traits::{CommunicatorCollectives, Destination, Source};

use crate::forest::Forest;
use crate::quadrant::Quadrant;
use crate::types::{Coord, GloIdx, LocIdx, TopIdx, PARTITION_GIVEN_TAG};

/// Wire size of one quadrant record plus its payload.
fn quad_bytes<const D: usize>(data_size: usize) -> usize {
    4 * (D + 1) + data_size
}

/// Redistribute the forest so that process `i` owns exactly
/// `new_counts[i]` quadrants. Returns the global number of quadrants
/// shipped between processes.
///
/// Collective; all ranks must pass the same counts, and the counts must
/// sum to the current global total.
pub fn partition_given<const D: usize, C: CommunicatorCollectives>(
    forest: &mut Forest<D>,
    comm: &C,
    new_counts: &[LocIdx],
) -> GloIdx {
    let num_procs = forest.mpisize as usize;
    let rank = forest.mpirank as usize;
    assert_eq!(new_counts.len(), num_procs);
    let data_size = forest.data_size;
    let wire = quad_bytes::<D>(data_size);

    tracing::debug!(
        total = forest.global_num_quadrants,
        "into partition_given"
    );
    #[cfg(debug_assertions)]
    let crc_before = forest.checksum(comm);

    // Running prefix endpoints of the old and requested partitions.
    let global_last: Vec<GloIdx> = (0..num_procs)
        .map(|i| forest.global_first_quadrant[i + 1] - 1)
        .collect();
    let mut new_global_last = vec![0 as GloIdx; num_procs];
    new_global_last[0] = new_counts[0] as GloIdx - 1;
    for i in 1..num_procs {
        debug_assert!(new_counts[i] >= 0);
        new_global_last[i] = new_global_last[i - 1] + new_counts[i] as GloIdx;
    }
    assert_eq!(
        new_global_last[num_procs - 1],
        forest.global_num_quadrants - 1
    );

    let mut total_shipped: GloIdx = 0;
    for i in 1..num_procs {
        let diff = global_last[i - 1] - new_global_last[i - 1];
        total_shipped += if diff >= 0 {
            diff.min(new_counts[i] as GloIdx)
        } else {
            (-diff).min(new_counts[i - 1] as GloIdx)
        };
    }

    // Local index of the last quadrant of each local tree.
    let first_local_tree = forest.first_local_tree;
    let last_local_tree = forest.last_local_tree;
    let num_trees = forest.conn.num_trees() as usize;
    let mut local_tree_last = vec![-1 as GloIdx; num_trees];
    if first_local_tree >= 0 {
        let mut running: GloIdx = -1;
        for t in first_local_tree..=last_local_tree {
            running += forest.trees[t as usize].len() as GloIdx;
            local_tree_last[t as usize] = running;
        }
    } else {
        assert!(first_local_tree == -1 && last_local_tree == -2);
    }

    // Where the new quadrants come from.
    let mut num_recv_from = vec![0 as LocIdx; num_procs];
    let my_new_begin = if rank == 0 {
        0
    } else {
        new_global_last[rank - 1] + 1
    };
    let my_new_end = new_global_last[rank];
    for from in 0..num_procs {
        let from_begin = if from == 0 { 0 } else { global_last[from - 1] + 1 };
        let from_end = global_last[from];
        if from_begin <= my_new_end && from_end >= my_new_begin {
            num_recv_from[from] =
                (my_new_end.min(from_end) - my_new_begin.max(from_begin) + 1) as LocIdx;
            debug_assert!(num_recv_from[from] >= 0);
        }
    }

    // Where the old quadrants go.
    let my_old_begin = if rank == 0 { 0 } else { global_last[rank - 1] + 1 };
    let my_old_end = global_last[rank];
    let mut num_send_to = vec![0 as LocIdx; num_procs];
    let mut begin_send_to = vec![-1 as GloIdx; num_procs];
    for to in 0..num_procs {
        let to_begin = if to == 0 { 0 } else { new_global_last[to - 1] + 1 };
        let to_end = new_global_last[to];
        if to_begin <= my_old_end && to_end >= my_old_begin {
            num_send_to[to] = (my_old_end.min(to_end) - my_old_begin.max(to_begin) + 1) as LocIdx;
            begin_send_to[to] = my_old_begin.max(to_begin);
            debug_assert!(num_send_to[to] >= 0);
        }
    }

    // Per-tree windows of a range of local quadrant indices.
    let tree_windows = |w_begin: GloIdx, w_end: GloIdx| -> Vec<(TopIdx, GloIdx, GloIdx)> {
        let mut windows = Vec::new();
        if first_local_tree < 0 {
            return windows;
        }
        for t in first_local_tree..=last_local_tree {
            let from_begin = if t == first_local_tree {
                0
            } else {
                local_tree_last[t as usize - 1] + 1
            };
            let from_end = local_tree_last[t as usize];
            if from_begin <= w_end && from_end >= w_begin {
                windows.push((
                    t,
                    w_begin.max(from_begin) - from_begin,
                    w_end.min(from_end) - from_begin,
                ));
            }
        }
        windows
    };
    let send_windows = |to: usize| -> Vec<(TopIdx, GloIdx, GloIdx)> {
        if num_send_to[to] == 0 {
            return Vec::new();
        }
        let wb = begin_send_to[to] - my_old_begin;
        let we = begin_send_to[to] + num_send_to[to] as GloIdx - 1 - my_old_begin;
        tree_windows(wb, we)
    };

    let my_first_send_tree = forest.global_first_position[rank].which_tree;
    let num_send_trees =
        (forest.global_first_position[rank + 1].which_tree - my_first_send_tree + 1) as usize;

    // Pack one buffer per receiving peer: per-tree counts, quadrant
    // records, then the tightly strided payload stream.
    let mut send_bufs: Vec<Option<Vec<u8>>> = vec![None; num_procs];
    for to in 0..num_procs {
        if to == rank || num_send_to[to] == 0 {
            continue;
        }
        let windows = send_windows(to);
        let mut per_tree = vec![0 as LocIdx; num_send_trees];
        for &(t, b, e) in &windows {
            per_tree[(t - my_first_send_tree) as usize] = (e - b + 1) as LocIdx;
        }
        let mut buf =
            Vec::with_capacity(num_send_trees * 4 + wire * num_send_to[to] as usize);
        buf.extend_from_slice(bytemuck::cast_slice(&per_tree));
        for &(t, b, e) in &windows {
            for q in &forest.trees[t as usize].quadrants[b as usize..=e as usize] {
                for a in 0..D {
                    buf.extend_from_slice(&q.coords[a].to_ne_bytes());
                }
                buf.extend_from_slice(&(q.level as i32).to_ne_bytes());
            }
        }
        if data_size > 0 {
            for &(t, b, e) in &windows {
                for q in &forest.trees[t as usize].quadrants[b as usize..=e as usize] {
                    debug_assert!(!q.data.is_null());
                    buf.extend_from_slice(forest.data.get(q.data));
                }
            }
        }
        tracing::debug!(to, count = num_send_to[to], "partition send");
        send_bufs[to] = Some(buf);
    }

    // Buffers for the incoming quadrants and their payloads.
    let mut recv_bufs: Vec<Option<Vec<u8>>> = vec![None; num_procs];
    for from in 0..num_procs {
        if from == rank || num_recv_from[from] == 0 {
            continue;
        }
        let num_recv_trees = (forest.global_first_position[from + 1].which_tree
            - forest.global_first_position[from].which_tree
            + 1) as usize;
        tracing::debug!(from, count = num_recv_from[from], "partition recv");
        recv_bufs[from] = Some(vec![0u8; num_recv_trees * 4 + wire * num_recv_from[from] as usize]);
    }

    // Exchange. The receives are posted first, the sends follow, and a
    // single wait-all closes the round.
    let nreq = recv_bufs.iter().flatten().count() + send_bufs.iter().flatten().count();
    mpi::request::multiple_scope::<[u8], _, _>(nreq.max(1), |scope, coll| {
        for (from, buf) in recv_bufs.iter_mut().enumerate() {
            if let Some(buf) = buf {
                coll.add(
                    comm.process_at_rank(from as i32)
                        .immediate_receive_into_with_tag(scope, &mut buf[..], PARTITION_GIVEN_TAG),
                );
            }
        }
        for (to, buf) in send_bufs.iter().enumerate() {
            if let Some(buf) = buf {
                coll.add(
                    comm.process_at_rank(to as i32)
                        .immediate_send_with_tag(scope, &buf[..], PARTITION_GIVEN_TAG),
                );
            }
        }
        let mut statuses = Vec::with_capacity(nreq);
        coll.wait_all(&mut statuses);
    });

    // Tear down local trees: release payloads leaving this process and
    // pull out the retained runs.
    let keep = send_windows(rank);
    let mut kept: Vec<(TopIdx, Vec<Quadrant<D>>)> = Vec::new();
    if first_local_tree >= 0 {
        for t in first_local_tree..=last_local_tree {
            let window = keep
                .iter()
                .find(|&&(wt, _, _)| wt == t)
                .map(|&(_, b, e)| (b as usize, e as usize));
            let tree = &mut forest.trees[t as usize];
            let quads = std::mem::take(&mut tree.quadrants);
            match window {
                Some((b, e)) => {
                    for q in quads[..b].iter().chain(quads[e + 1..].iter()) {
                        forest.data.free(q.data);
                    }
                    kept.push((t, quads[b..=e].to_vec()));
                }
                None => {
                    for q in &quads {
                        forest.data.free(q.data);
                    }
                }
            }
        }
    }

    // Refill the trees in rank order so that every tree's sequence stays
    // globally Morton sorted.
    let mut kept = Some(kept);
    for from in 0..num_procs {
        if from == rank {
            for (t, quads) in kept.take().unwrap() {
                forest.trees[t as usize].quadrants.extend(quads);
            }
            continue;
        }
        let Some(buf) = &recv_bufs[from] else {
            continue;
        };
        let first_from_tree = forest.global_first_position[from].which_tree;
        let num_recv_trees = (forest.global_first_position[from + 1].which_tree
            - first_from_tree
            + 1) as usize;
        let counts: Vec<LocIdx> = buf[..num_recv_trees * 4]
            .chunks_exact(4)
            .map(|c| LocIdx::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        let total: usize = num_recv_from[from] as usize;
        debug_assert_eq!(counts.iter().sum::<LocIdx>() as usize, total);
        let quad_base = num_recv_trees * 4;
        let data_base = quad_base + total * 4 * (D + 1);

        let mut index = 0usize;
        for (it, &count) in counts.iter().enumerate() {
            let t = first_from_tree + it as TopIdx;
            debug_assert!(count == 0 || (t >= 0 && (t as usize) < num_trees));
            for _ in 0..count {
                let rec = &buf[quad_base + index * 4 * (D + 1)..];
                let mut coords = [0 as Coord; D];
                for (a, c) in coords.iter_mut().enumerate() {
                    *c = Coord::from_ne_bytes(rec[4 * a..4 * a + 4].try_into().unwrap());
                }
                let level = i32::from_ne_bytes(rec[4 * D..4 * D + 4].try_into().unwrap());
                let mut q = Quadrant::<D>::new(coords, level as i8);
                q.data = forest.data.alloc();
                if data_size > 0 {
                    let payload = &buf[data_base + index * data_size..][..data_size];
                    forest.data.get_mut(q.data).copy_from_slice(payload);
                }
                forest.trees[t as usize].quadrants.push(q);
                index += 1;
            }
        }
        debug_assert_eq!(index, total);
    }
    drop(recv_bufs);
    drop(send_bufs);

    // Rebuild tree metadata and the ownership range.
    let mut new_first: TopIdx = -1;
    let mut new_last: TopIdx = -2;
    for (t, tree) in forest.trees.iter_mut().enumerate() {
        tree.recount();
        tree.update_desc();
        if !tree.is_empty() {
            if new_first < 0 {
                new_first = t as TopIdx;
            }
            new_last = t as TopIdx;
        }
    }
    forest.first_local_tree = new_first;
    forest.last_local_tree = new_last;
    forest.update_local_meta();
    assert_eq!(forest.local_num_quadrants, new_counts[rank]);

    forest.global_first_quadrant[0] = 0;
    for i in 0..num_procs {
        forest.global_first_quadrant[i + 1] = new_global_last[i] + 1;
    }
    forest.update_global_partition(comm);

    #[cfg(debug_assertions)]
    debug_assert_eq!(crc_before, forest.checksum(comm));

    tracing::debug!(
        total_shipped,
        "done partition_given"
    );
    total_shipped
}

/// For a family of `2^D` quadrants straddling process boundaries in the
/// given partition, the signed count correction that pulls the whole
/// family onto the process currently owning most of it; ties go to the
/// lower rank.
pub fn partition_correction<const D: usize>(
    partition: &[GloIdx],
    num_procs: usize,
    rank: usize,
    min_quadrant_id: GloIdx,
    max_quadrant_id: GloIdx,
) -> LocIdx {
    // No correction unless the id range is exactly one family.
    if max_quadrant_id - min_quadrant_id + 1 != Quadrant::<D>::NUM_CHILDREN as GloIdx {
        return 0;
    }

    let mut rank_with_max = rank;
    let mut max_quads =
        max_quadrant_id.min(partition[rank + 1] - 1) - partition[rank] + 1;

    // Decreasing search for the process owning most of the family.
    let mut i = rank as i64 - 1;
    while i >= 0 && min_quadrant_id < partition[i as usize + 1] {
        let h = partition[i as usize + 1] - min_quadrant_id.max(partition[i as usize]);
        if max_quads <= h {
            max_quads = h;
            rank_with_max = i as usize;
        }
        i -= 1;
    }

    // Increasing search.
    let mut i = rank_with_max + 1;
    while i < num_procs && partition[i] <= max_quadrant_id {
        let h = max_quadrant_id.min(partition[i + 1] - 1) - partition[i] + 1;
        if max_quads < h {
            max_quads = h;
            rank_with_max = i;
        }
        i += 1;
    }

    if rank_with_max < rank {
        (partition[rank] - max_quadrant_id - 1) as LocIdx
    } else {
        (partition[rank] - min_quadrant_id) as LocIdx
    }
}

/// The next process at or after `rank` with a nonzero count, or
/// `num_procs` when there is none.
pub fn next_nonempty_process(
    rank: usize,
    num_procs: usize,
    num_quadrants_in_proc: &[LocIdx],
) -> usize {
    let mut rank = rank;
    while rank < num_procs && num_quadrants_in_proc[rank] == 0 {
        rank += 1;
    }
    rank
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_next_nonempty_process() {
        let counts = [4, 0, 0, 2];
        assert_eq!(next_nonempty_process(0, 4, &counts), 0);
        assert_eq!(next_nonempty_process(1, 4, &counts), 3);
        assert_eq!(next_nonempty_process(3, 4, &counts), 3);
        let empty = [0, 0];
        assert_eq!(next_nonempty_process(0, 2, &empty), 2);
    }

    #[test]
    fn test_partition_correction_needs_family() {
        // An id range that is not a whole family is never corrected.
        let partition = [0, 5, 10, 16];
        assert_eq!(partition_correction::<2>(&partition, 3, 1, 4, 6), 0);
    }

    #[test]
    fn test_partition_correction_pulls_to_majority() {
        // Family ids 4..=7 straddle the boundary at 5: rank 0 owns one
        // member, rank 1 owns three. Rank 1 keeps the family, so its
        // boundary moves down to the family start.
        let partition = [0, 5, 16];
        assert_eq!(partition_correction::<2>(&partition, 2, 1, 4, 7), 1);
    }

    #[test]
    fn test_partition_correction_tie_goes_low() {
        // Family 4..=7 split two and two across the boundary at 6; the
        // lower rank wins and the boundary moves past the family end.
        let partition = [0, 6, 16];
        assert_eq!(partition_correction::<2>(&partition, 2, 1, 4, 7), -2);
    }
}
