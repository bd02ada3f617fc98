//! The distributed forest: trees, ownership ranges and payload storage.

use std::rc::Rc;

use mpi::collective::SystemOperation;
use mpi::traits::{Communicator, CommunicatorCollectives, Root};

use crate::connectivity::Connectivity;
use crate::quadrant::Quadrant;
use crate::tools::gather_to_all;
use crate::tree::{desc_sentinel, Tree};
use crate::types::{GloIdx, LocIdx, PayloadRef, Position, TopIdx};

/// Callback invoked whenever a quadrant is materialized inside the unit
/// root, after its payload slot has been allocated and zeroed.
pub type InitFn<const D: usize> = fn(TopIdx, &Quadrant<D>, &mut [u8]);

/// Fixed-size payload arena with index handles.
///
/// Quadrant payloads are allocated here at insertion and released at
/// removal. Handles stay stable; freed slots are recycled through a free
/// list. A `data_size` of zero turns every operation into a no-op.
pub struct DataPool {
    data_size: usize,
    bytes: Vec<u8>,
    free_list: Vec<u32>,
    live: usize,
}

impl DataPool {
    /// Create a pool for payloads of `data_size` bytes each.
    pub fn new(data_size: usize) -> Self {
        Self {
            data_size,
            bytes: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    /// Payload size in bytes.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Number of live payload slots.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Allocate a zeroed payload slot.
    pub fn alloc(&mut self) -> PayloadRef {
        if self.data_size == 0 {
            return PayloadRef::NULL;
        }
        self.live += 1;
        if let Some(slot) = self.free_list.pop() {
            let begin = slot as usize * self.data_size;
            self.bytes[begin..begin + self.data_size].fill(0);
            PayloadRef(slot)
        } else {
            let slot = (self.bytes.len() / self.data_size) as u32;
            self.bytes.resize(self.bytes.len() + self.data_size, 0);
            PayloadRef(slot)
        }
    }

    /// Release a payload slot; the null handle is ignored.
    pub fn free(&mut self, r: PayloadRef) {
        if self.data_size == 0 || r.is_null() {
            return;
        }
        debug_assert!(self.live > 0);
        self.live -= 1;
        self.free_list.push(r.0);
    }

    /// Borrow the payload bytes of a handle.
    pub fn get(&self, r: PayloadRef) -> &[u8] {
        if self.data_size == 0 || r.is_null() {
            return &[];
        }
        let begin = r.0 as usize * self.data_size;
        &self.bytes[begin..begin + self.data_size]
    }

    /// Borrow the payload bytes of a handle mutably.
    pub fn get_mut(&mut self, r: PayloadRef) -> &mut [u8] {
        if self.data_size == 0 || r.is_null() {
            return &mut [];
        }
        let begin = r.0 as usize * self.data_size;
        &mut self.bytes[begin..begin + self.data_size]
    }
}

/// Allocate and initialize the payload of a freshly created quadrant.
pub(crate) fn init_quadrant<const D: usize>(
    pool: &mut DataPool,
    init: Option<InitFn<D>>,
    which_tree: TopIdx,
    q: &mut Quadrant<D>,
) {
    debug_assert!(q.is_extended());
    q.data = pool.alloc();
    if let Some(init) = init {
        if q.is_inside_root() {
            init(which_tree, q, pool.get_mut(q.data));
        }
    }
}

/// A forest of quadtrees (`D = 2`) or octrees (`D = 3`) distributed
/// across the processes of a communicator.
pub struct Forest<const D: usize> {
    /// The coarse topology shared by all processes.
    pub conn: Rc<Connectivity<D>>,
    /// One tree per connectivity entry; non-local trees stay empty.
    pub trees: Vec<Tree<D>>,
    /// First tree with local quadrants, `-1` on empty processes.
    pub first_local_tree: TopIdx,
    /// Last tree with local quadrants, `-2` on empty processes.
    pub last_local_tree: TopIdx,
    /// Number of quadrants on this process.
    pub local_num_quadrants: LocIdx,
    /// Number of quadrants across all processes.
    pub global_num_quadrants: GloIdx,
    /// Prefix sum of per-process quadrant counts, `P + 1` entries.
    pub global_first_quadrant: Vec<GloIdx>,
    /// First owned position per process plus a sentinel, `P + 1` entries.
    pub global_first_position: Vec<Position>,
    /// Rank of this process.
    pub mpirank: i32,
    /// Size of the communicator.
    pub mpisize: i32,
    /// Payload size in bytes, fixed at construction.
    pub data_size: usize,
    /// Per-process payload arena.
    pub data: DataPool,
}

impl<const D: usize> Forest<D> {
    /// Create a forest uniformly refined to `initial_level`, with
    /// quadrants block-distributed across the communicator in global
    /// Morton order.
    pub fn new<C: Communicator>(
        conn: Rc<Connectivity<D>>,
        comm: &C,
        data_size: usize,
        initial_level: i8,
        init: Option<InitFn<D>>,
    ) -> Self {
        Self::new_with_rank(conn, comm.rank(), comm.size(), data_size, initial_level, init)
    }

    /// Rank-parameterized constructor; the partition is computed without
    /// communication, so a forest can be built for any (rank, size) pair.
    pub(crate) fn new_with_rank(
        conn: Rc<Connectivity<D>>,
        rank: i32,
        size: i32,
        data_size: usize,
        initial_level: i8,
        init: Option<InitFn<D>>,
    ) -> Self {
        assert!((0..=Quadrant::<D>::MAX_LEVEL).contains(&initial_level));
        let num_trees = conn.num_trees();
        let per_tree: GloIdx = 1 << (D as u32 * initial_level as u32);
        let global_num = num_trees as GloIdx * per_tree;

        let cut = |p: i32| -> GloIdx {
            (global_num as i128 * p as i128 / size as i128) as GloIdx
        };

        let mut forest = Self {
            conn: conn.clone(),
            trees: (0..num_trees).map(|_| Tree::new()).collect(),
            first_local_tree: -1,
            last_local_tree: -2,
            local_num_quadrants: 0,
            global_num_quadrants: global_num,
            global_first_quadrant: (0..=size).map(cut).collect(),
            global_first_position: Vec::new(),
            mpirank: rank,
            mpisize: size,
            data_size,
            data: DataPool::new(data_size),
        };

        // The uniform partition is known on every process; positions are
        // derived from the cut points directly.
        forest.global_first_position = (0..=size)
            .map(|p| {
                let gidx = cut(p);
                if gidx >= global_num {
                    Position::sentinel(num_trees, Quadrant::<D>::MAX_LEVEL)
                } else {
                    let tree = (gidx / per_tree) as TopIdx;
                    let q = Quadrant::<D>::from_linear_id((gidx % per_tree) as u64, initial_level);
                    position_of(tree, &q)
                }
            })
            .collect();

        let my_begin = cut(rank);
        let my_end = cut(rank + 1);
        if my_begin < my_end {
            forest.first_local_tree = (my_begin / per_tree) as TopIdx;
            forest.last_local_tree = ((my_end - 1) / per_tree) as TopIdx;
            for t in forest.first_local_tree..=forest.last_local_tree {
                let tree_begin = t as GloIdx * per_tree;
                let lo = my_begin.max(tree_begin);
                let hi = my_end.min(tree_begin + per_tree);
                let tree = &mut forest.trees[t as usize];
                for id in lo..hi {
                    let mut q =
                        Quadrant::<D>::from_linear_id((id - tree_begin) as u64, initial_level);
                    init_quadrant(&mut forest.data, init, t, &mut q);
                    tree.push(q);
                }
                tree.update_desc();
            }
        }
        forest.update_local_meta();
        forest
    }

    /// Borrow a tree by index.
    pub fn tree(&self, which_tree: TopIdx) -> &Tree<D> {
        &self.trees[which_tree as usize]
    }

    /// Recompute tree offsets and the local quadrant count.
    pub(crate) fn update_local_meta(&mut self) {
        let mut offset: LocIdx = 0;
        for tree in self.trees.iter_mut() {
            tree.quadrants_offset = offset;
            offset += tree.len() as LocIdx;
        }
        self.local_num_quadrants = offset;
    }

    /// Ownership window of one local tree: whether this process owns the
    /// tree's beginning and end, and the first/next position anchors.
    pub(crate) fn tree_info(&self, which_tree: TopIdx) -> ([bool; 2], Quadrant<D>, Quadrant<D>) {
        let firstq = &self.global_first_position[self.mpirank as usize];
        let nextq = &self.global_first_position[self.mpirank as usize + 1];
        let full = [
            which_tree > firstq.which_tree
                || (0..D).all(|a| firstq.coords[a] == 0),
            which_tree < nextq.which_tree,
        ];
        (full, quadrant_of(firstq), quadrant_of(nextq))
    }

    /// Exchange first positions after a repartition.
    pub(crate) fn update_global_partition<C: CommunicatorCollectives>(&mut self, comm: &C) {
        let mine = if self.first_local_tree >= 0 {
            let tree = &self.trees[self.first_local_tree as usize];
            position_of(self.first_local_tree, &tree.quadrants[0])
        } else {
            // Marker for an empty process, resolved below.
            Position {
                which_tree: -1,
                coords: [0; 3],
                level: Quadrant::<D>::MAX_LEVEL,
            }
        };
        let mut positions = gather_to_all(std::slice::from_ref(&mine), comm);
        positions.push(Position::sentinel(
            self.conn.num_trees(),
            Quadrant::<D>::MAX_LEVEL,
        ));
        // An empty process starts where its successor starts.
        for p in (0..self.mpisize as usize).rev() {
            if positions[p].which_tree < 0 {
                positions[p] = positions[p + 1];
            }
        }
        self.global_first_position = positions;
    }

    /// The words fed into the forest checksum, local quadrants in order.
    pub(crate) fn checksum_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.local_num_quadrants as usize * (D + 1));
        if self.first_local_tree < 0 {
            return words;
        }
        for t in self.first_local_tree..=self.last_local_tree {
            for q in &self.trees[t as usize].quadrants {
                for a in 0..D {
                    words.push(q.coords[a] as u32);
                }
                words.push(q.level as u8 as u32);
            }
        }
        words
    }

    /// CRC32 over all quadrants of the forest in global Morton order.
    ///
    /// The words are gathered to rank zero, hashed there and the result
    /// broadcast, so every rank returns the same value regardless of the
    /// partition.
    pub fn checksum<C: CommunicatorCollectives>(&self, comm: &C) -> u32 {
        let words = self.checksum_words();
        let gathered = crate::tools::gather_to_root(&words, comm);
        let mut crc: u32 = 0;
        if comm.rank() == 0 {
            let mut hasher = crc32fast::Hasher::new();
            for word in gathered.unwrap() {
                hasher.update(&word.to_be_bytes());
            }
            crc = hasher.finalize();
        }
        comm.process_at_rank(0).broadcast_into(&mut crc);
        crc
    }

    /// Local half of [`is_valid`](Self::is_valid): every check that does
    /// not require communication.
    pub(crate) fn is_valid_local(&self) -> bool {
        let rank = self.mpirank as usize;
        let num_procs = self.mpisize as usize;
        let max_level = Quadrant::<D>::MAX_LEVEL;

        // Sentinel entry of the global partition.
        let sentinel = &self.global_first_position[num_procs];
        if sentinel.which_tree != self.conn.num_trees()
            || sentinel.coords != [0; 3]
        {
            tracing::warn!("invalid global partition sentinel");
            return false;
        }
        if self
            .global_first_position
            .iter()
            .any(|p| p.level != max_level)
        {
            tracing::warn!("invalid global partition level");
            return false;
        }
        if self.trees.len() != self.conn.num_trees() as usize {
            tracing::warn!("invalid tree count");
            return false;
        }

        // First tree in the global partition.
        if self.first_local_tree < 0 {
            if !(self.first_local_tree == -1 && self.last_local_tree == -2) {
                tracing::warn!("invalid empty tree range");
                return false;
            }
        } else {
            let firstq = &self.global_first_position[rank];
            if firstq.which_tree != self.first_local_tree {
                tracing::warn!("invalid first tree");
                return false;
            }
            let mylow = quadrant_of::<D>(firstq);
            let tree = &self.trees[self.first_local_tree as usize];
            if let Some(q) = tree.quadrants.first() {
                if q.coords != mylow.coords {
                    tracing::warn!("invalid low quadrant");
                    return false;
                }
            }
        }

        // Last tree in the global partition.
        if self.last_local_tree >= 0 {
            let nextq = &self.global_first_position[rank + 1];
            let next_tree = nextq.which_tree;
            if next_tree != self.last_local_tree && next_tree != self.last_local_tree + 1 {
                tracing::warn!("invalid last tree");
                return false;
            }
            let nextlow = quadrant_of::<D>(nextq);
            if next_tree == self.last_local_tree + 1 && nextlow.coords != [0; D] {
                tracing::warn!("invalid next coordinates");
                return false;
            }
            let tree = &self.trees[self.last_local_tree as usize];
            if let Some(q) = tree.quadrants.last() {
                if next_tree == self.last_local_tree {
                    if !q.is_next(&nextlow) {
                        tracing::warn!("invalid next quadrant");
                        return false;
                    }
                } else {
                    let ld = q.last_descendant(max_level);
                    let mh = Quadrant::<D>::len(max_level);
                    if (0..D).any(|a| ld.coords[a] + mh != Quadrant::<D>::ROOT_LEN) {
                        tracing::warn!("invalid last quadrant");
                        return false;
                    }
                }
            }
        }

        // Individual trees.
        let mut lquadrants: LocIdx = 0;
        for (jt, tree) in self.trees.iter().enumerate() {
            let jt = jt as TopIdx;
            if tree.quadrants_offset != lquadrants {
                tracing::warn!("invalid quadrants offset");
                return false;
            }
            if !tree.is_complete() {
                tracing::warn!("invalid not complete");
                return false;
            }
            if !tree.is_empty() {
                if jt < self.first_local_tree || jt > self.last_local_tree {
                    tracing::warn!("invalid outside count");
                    return false;
                }
                let fd = tree.quadrants[0].first_descendant(max_level);
                let ld = tree.quadrants[tree.len() - 1].last_descendant(max_level);
                if fd != tree.first_desc || ld != tree.last_desc {
                    tracing::warn!("invalid tree descendant");
                    return false;
                }
            } else if tree.first_desc.level != -1 || tree.last_desc.level != -1 {
                tracing::warn!("invalid empty descendant");
                return false;
            }

            let mut maxlevel = 0i8;
            let mut nquadrants: LocIdx = 0;
            for (level, &perlevel) in tree.quadrants_per_level.iter().enumerate() {
                debug_assert!(perlevel >= 0);
                nquadrants += perlevel;
                if perlevel > 0 {
                    maxlevel = level as i8;
                }
            }
            lquadrants += nquadrants;
            if maxlevel != tree.maxlevel {
                tracing::warn!("invalid wrong maxlevel");
                return false;
            }
            if nquadrants != tree.len() as LocIdx {
                tracing::warn!("invalid tree quadrant count");
                return false;
            }
        }

        if lquadrants != self.local_num_quadrants {
            tracing::warn!("invalid local quadrant count");
            return false;
        }

        if self.global_first_quadrant[0] != 0
            || self.global_first_quadrant[num_procs] != self.global_num_quadrants
        {
            tracing::warn!("invalid global quadrant index");
            return false;
        }

        true
    }

    /// Establish global validity of the forest.
    ///
    /// Collective; the local results are combined with a bitwise-OR
    /// reduction so that a single failing rank fails every rank.
    pub fn is_valid<C: CommunicatorCollectives>(&self, comm: &C) -> bool {
        let failed: u8 = u8::from(!self.is_valid_local());
        let mut global_failed: u8 = 0;
        comm.all_reduce_into(&failed, &mut global_failed, SystemOperation::bitwise_or());
        global_failed == 0
    }
}

/// Encode a (tree, quadrant) pair as a deepest-level partition position.
pub(crate) fn position_of<const D: usize>(which_tree: TopIdx, q: &Quadrant<D>) -> Position {
    let mut coords = [0; 3];
    coords[..D].copy_from_slice(&q.coords);
    Position {
        which_tree,
        coords,
        level: Quadrant::<D>::MAX_LEVEL,
    }
}

/// Decode a partition position into its anchor quadrant.
pub(crate) fn quadrant_of<const D: usize>(p: &Position) -> Quadrant<D> {
    let mut coords = [0; D];
    coords.copy_from_slice(&p.coords[..D]);
    Quadrant::new(coords, p.level)
}
