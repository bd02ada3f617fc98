//! A Rust library for distributed forests of adaptive quadtrees and
//! octrees.
//!
//! A forest tiles a coarse topology, described by a [`Connectivity`],
//! with one recursively subdivided quadtree (`D = 2`) or octree
//! (`D = 3`) per coarse cell. Every tree owns a Morton-sorted sequence
//! of [`Quadrant`]s; the forest is distributed across the processes of
//! an MPI communicator in global Morton order.
//!
//! The library provides the primitives an adaptive-mesh driver composes
//! into a refinement cycle:
//!
//! - quadrant algebra (ancestry, siblings, neighbors, cross-tree
//!   transforms) in [`quadrant`] and [`connectivity`],
//! - interval completion in [`complete`],
//! - local completion and 2:1 balance in [`balance`],
//! - the overlap computation feeding the parallel balance exchange in
//!   [`overlap`],
//! - repartitioning to caller-specified counts in [`partition`].
//!
//! All parallel operations are collective and bulk-synchronous: each
//! process is single threaded, the only communication primitives are
//! nonblocking point-to-point exchanges closed by a wait-all and a few
//! reductions, and every rank must call with the same inputs. Local
//! precondition violations are programmer errors and fail hard; global
//! consistency is established collectively by [`Forest::is_valid`].
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! use quadforest::{balance_subtree, Balance, Connectivity, Forest};
//!
//! let universe = mpi::initialize().unwrap();
//! let comm = universe.world();
//!
//! // Two unit squares joined along a face, uniformly refined twice.
//! let conn = Rc::new(Connectivity::<2>::brick([2, 1]));
//! let mut forest = Forest::new(conn, &comm, 0, 2, None);
//!
//! for t in forest.first_local_tree..=forest.last_local_tree {
//!     balance_subtree(&mut forest, Balance::full::<2>(), t, None);
//! }
//! assert!(forest.is_valid(&comm));
//! ```
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod balance;
pub mod complete;
pub mod connectivity;
pub mod forest;
pub mod overlap;
pub mod partition;
pub mod quadrant;
pub mod tools;
pub mod tree;
pub mod types;

pub use crate::balance::{balance_border, balance_subtree, complete_subtree};
pub use crate::complete::complete_region;
pub use crate::connectivity::Connectivity;
pub use crate::forest::{DataPool, Forest, InitFn};
pub use crate::overlap::{compute_overlap, compute_overlap_legacy, uniqify_overlap, OverlapQuad};
pub use crate::partition::{next_nonempty_process, partition_correction, partition_given};
pub use crate::quadrant::{checksum_seq, Quadrant};
pub use crate::tree::Tree;
pub use crate::types::{Balance, Coord, GloIdx, LocIdx, PayloadRef, Position, TopIdx};
