//! MPI utility routines shared by the collective forest operations.

use mpi::{
    datatype::PartitionMut,
    point_to_point as p2p,
    traits::{Communicator, CommunicatorCollectives, Destination, Equivalence, Root, Source},
};

/// Gather an array to all processes.
pub fn gather_to_all<T: Equivalence, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> Vec<T> {
    // First broadcast the individual sizes of each contribution.
    let size = comm.size();
    let local_len = arr.len() as i32;
    let mut sizes = vec![0_i32; size as usize];
    comm.all_gather_into(&local_len, &mut sizes);

    let recv_len = sizes.iter().sum::<i32>() as usize;

    let mut recvbuffer = Vec::<T>::with_capacity(recv_len);
    let buf: &mut [T] = unsafe { std::mem::transmute(recvbuffer.spare_capacity_mut()) };

    let recv_displs = displacements(&sizes);
    let mut partition = PartitionMut::new(buf, sizes, &recv_displs[..]);
    comm.all_gather_varcount_into(arr, &mut partition);

    unsafe { recvbuffer.set_len(recv_len) };
    recvbuffer
}

/// Gather a distributed array to the root rank.
///
/// The result is a `Vec<T>` on root and `None` on all other ranks.
pub fn gather_to_root<T: Equivalence, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Option<Vec<T>> {
    let n = arr.len() as i32;
    let rank = comm.rank();
    let size = comm.size();
    let root_process = comm.process_at_rank(0);

    if rank == 0 {
        let mut counts = vec![0_i32; size as usize];
        root_process.gather_into_root(&n, &mut counts);

        let nelements = counts.iter().sum::<i32>() as usize;
        let mut new_arr = Vec::<T>::with_capacity(nelements);
        let new_arr_buf: &mut [T] = unsafe { std::mem::transmute(new_arr.spare_capacity_mut()) };

        let displs = displacements(&counts);
        let mut partition = PartitionMut::new(new_arr_buf, counts, &displs[..]);
        root_process.gather_varcount_into_root(arr, &mut partition);

        unsafe { new_arr.set_len(nelements) };
        Some(new_arr)
    } else {
        root_process.gather_into(&n);
        root_process.gather_varcount_into(arr);
        None
    }
}

/// Send the first element of `arr` to the previous rank and return the
/// first element of the next rank, `None` on the last rank.
pub fn communicate_back<T: Equivalence + Clone, C: Communicator>(
    arr: &[T],
    comm: &C,
) -> Option<T> {
    let rank = comm.rank();
    let size = comm.size();
    if size == 1 {
        return None;
    }
    if rank == size - 1 {
        comm.process_at_rank(rank - 1).send(arr.first().unwrap());
        None
    } else if rank > 0 {
        let (next, _status) = p2p::send_receive(
            arr.first().unwrap(),
            &comm.process_at_rank(rank - 1),
            &comm.process_at_rank(rank + 1),
        );
        Some(next)
    } else {
        let (next, _status) = comm.process_at_rank(1).receive::<T>();
        Some(next)
    }
}

/// Displacements corresponding to a vector of counts: counts `[3, 4, 5]`
/// give `[0, 3, 7]`.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}
