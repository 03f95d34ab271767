//! A Rust based distributed quadtree forest library
//!
//! This library maintains a collection of 2:1 balanced, Morton-ordered
//! quadtrees partitioned across a set of cooperating processes. The forest
//! represents an adaptive mesh: each leaf is an axis-aligned square
//! addressed by integer coordinates and a refinement level, and the union
//! of leaves over all trees tiles a coarse topological mesh (the
//! [Connectivity](crate::connectivity::Connectivity)) exactly once.
//!
//! The building blocks are the quadrant algebra in
//! [quadrant](crate::quadrant) (Morton ids, ancestry, sibling and neighbor
//! relations, the square symmetries used when crossing into a rotated
//! neighbor tree), the per-tree algorithms in [balance](crate::balance)
//! (interval completion, bottom-up 2:1 balancing, linearization), the
//! ghost layer machinery in [overlap](crate::overlap), and the distributed
//! operations on the [Forest](crate::forest::Forest): refinement,
//! coarsening, global balance and repartitioning by an explicit per-process
//! count vector ([partition_given](crate::partition::partition_given)).
//!
//! All distributed operations are written against the
//! [Communicator](crate::comm::Communicator) trait. By default the crate
//! has no MPI dependency and runs on a single rank through
//! [DummyComm](crate::comm::DummyComm); the `"mpi"` feature enables an
//! rsmpi backed communicator with identical semantics. A thread-per-rank
//! in-process backend in [comm::local](crate::comm::local) drives the
//! multi-rank tests.
//!
//! ## Using the library
//!
//! A forest is created from a connectivity, which can be read from a
//! plain-text mesh file:
//!
//! ```
//! use quadforest::{BalanceKind, Connectivity, DummyComm, Forest};
//!
//! let comm = DummyComm::new();
//! let conn = Connectivity::parse(include_str!("../demos/lshape.mesh")).unwrap();
//! let mut forest = Forest::new(&comm, &conn, 0, None);
//!
//! forest.refine(false, &|_, _| true, None);
//! forest.balance(BalanceKind::FaceCorner, None);
//! assert!(forest.is_valid());
//! ```
//!
//! Note that in `debug` mode a number of expensive assertion checks run
//! during every forest operation, some of which communicate across all
//! ranks. These checks are disabled in `release` mode.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod balance;
pub mod comm;
pub mod connectivity;
pub mod constants;
pub mod forest;
pub mod overlap;
pub mod partition;
pub mod quadrant;
pub mod tree;
pub mod types;
pub mod vtk;

pub use crate::balance::BalanceKind;
pub use crate::comm::{Communicator, DummyComm};
pub use crate::connectivity::Connectivity;
pub use crate::forest::Forest;
pub use crate::partition::{partition_given, partition_uniform};
pub use crate::quadrant::Quadrant;
