//! The communication surface consumed by the forest algorithms.
//!
//! All distributed operations are written against the [Communicator] trait,
//! which covers the collectives the algorithms need plus a byte-message
//! exchange for repartitioning. Three backends exist:
//!
//! - [DummyComm], a single-process shim with send-to-self as an in-memory
//!   copy, so a build without a real MPI library runs identically on one
//!   rank;
//! - [local::LocalComm], a thread-per-rank in-process backend used by the
//!   multi-rank tests;
//! - `MpiComm` (feature `"mpi"`), an adapter over an rsmpi communicator.
//!
//! Messages between a `(sender, receiver, tag)` triple are FIFO. Between
//! suspension points each rank runs deterministically.

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;

use bytemuck::Pod;

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

/// Reduction operations over `i64` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum of the contributions.
    Sum,
    /// Minimum of the contributions.
    Min,
    /// Maximum of the contributions.
    Max,
}

impl ReduceOp {
    fn fold(self, acc: i64, value: i64) -> i64 {
        match self {
            ReduceOp::Sum => acc + value,
            ReduceOp::Min => acc.min(value),
            ReduceOp::Max => acc.max(value),
        }
    }
}

/// The collective and point-to-point surface used by the forest.
pub trait Communicator {
    /// The rank of this process.
    fn rank(&self) -> usize;

    /// The number of processes.
    fn size(&self) -> usize;

    /// Wait until every process has entered the barrier.
    fn barrier(&self);

    /// Wall-clock seconds since an arbitrary epoch.
    fn wtime(&self) -> f64;

    /// Replace `value` on every process with the root's value.
    fn broadcast_value<T: Pod>(&self, root: usize, value: &mut T);

    /// Replace `data` on every process with the root's vector.
    fn broadcast_vec<T: Pod>(&self, root: usize, data: &mut Vec<T>);

    /// Gather one element from every process, in rank order, on all
    /// processes.
    fn all_gather<T: Pod>(&self, item: T) -> Vec<T>;

    /// Concatenate the per-process arrays in rank order on the root.
    /// Returns `None` away from the root.
    fn gather_to_root<T: Pod>(&self, arr: &[T]) -> Option<Vec<T>>;

    /// Concatenate the per-process arrays in rank order on all processes.
    fn all_gather_varcount<T: Pod>(&self, arr: &[T]) -> Vec<T> {
        let mut all = self.gather_to_root(arr).unwrap_or_default();
        self.broadcast_vec(0, &mut all);
        all
    }

    /// Reduce one `i64` contribution per process onto all processes.
    fn all_reduce_i64(&self, op: ReduceOp, value: i64) -> i64;

    /// Logical and of one contribution per process, on all processes.
    fn all_reduce_and(&self, value: bool) -> bool {
        self.all_reduce_i64(ReduceOp::Min, value as i64) != 0
    }

    /// Exchange byte messages on a single tag.
    ///
    /// `sends` lists `(destination, message)` pairs, `recvs` lists
    /// `(source, exact_size)` pairs; the result holds the received messages
    /// in the order of `recvs`. Receives are posted before any send so the
    /// pattern cannot deadlock; the call returns when all receives have
    /// completed and all send buffers may be reused.
    fn exchange_bytes(
        &self,
        tag: u16,
        sends: Vec<(usize, Vec<u8>)>,
        recvs: &[(usize, usize)],
    ) -> Vec<Vec<u8>>;
}

/// Compute displacements from a vector of counts.
///
/// For counts `[3, 4, 5]` the displacements are `[0, 3, 7]`; the last count
/// is ignored.
pub fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &x| {
            let tmp = *acc;
            *acc += x;
            Some(tmp)
        })
        .collect()
}

/// The single-process communicator.
///
/// Collectives are identity copies and send-to-self is an in-memory copy,
/// so code written against [Communicator] runs unchanged on one rank.
pub struct DummyComm {
    epoch: Instant,
    mail: RefCell<HashMap<u16, VecDeque<Vec<u8>>>>,
}

impl DummyComm {
    /// Create a single-process communicator.
    pub fn new() -> Self {
        Self { epoch: Instant::now(), mail: RefCell::new(HashMap::new()) }
    }
}

impl Default for DummyComm {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for DummyComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn wtime(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn broadcast_value<T: Pod>(&self, root: usize, _value: &mut T) {
        assert_eq!(root, 0);
    }

    fn broadcast_vec<T: Pod>(&self, root: usize, _data: &mut Vec<T>) {
        assert_eq!(root, 0);
    }

    fn all_gather<T: Pod>(&self, item: T) -> Vec<T> {
        vec![item]
    }

    fn gather_to_root<T: Pod>(&self, arr: &[T]) -> Option<Vec<T>> {
        Some(arr.to_vec())
    }

    fn all_reduce_i64(&self, _op: ReduceOp, value: i64) -> i64 {
        value
    }

    fn exchange_bytes(
        &self,
        tag: u16,
        sends: Vec<(usize, Vec<u8>)>,
        recvs: &[(usize, usize)],
    ) -> Vec<Vec<u8>> {
        let mut mail = self.mail.borrow_mut();
        for (dst, buf) in sends {
            assert_eq!(dst, 0, "dummy communicator can only send to itself");
            mail.entry(tag).or_default().push_back(buf);
        }
        recvs
            .iter()
            .map(|&(src, size)| {
                assert_eq!(src, 0, "dummy communicator can only receive from itself");
                let buf = mail
                    .get_mut(&tag)
                    .and_then(|q| q.pop_front())
                    .expect("receive posted without a matching self send");
                assert_eq!(buf.len(), size);
                buf
            })
            .collect()
    }
}
