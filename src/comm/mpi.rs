//! The rsmpi backed communicator, enabled by the `"mpi"` feature.

use bytemuck::Pod;

use ::mpi::collective::SystemOperation;
use ::mpi::datatype::PartitionMut;
use ::mpi::topology::SimpleCommunicator;
use ::mpi::traits::Communicator as _;
use ::mpi::traits::{CommunicatorCollectives, Destination, Root, Source};

use super::{displacements, Communicator, ReduceOp};

/// A [Communicator] over an MPI communicator.
///
/// The caller keeps the rsmpi universe alive for the lifetime of this value:
///
/// ```no_run
/// use quadforest::comm::mpi::MpiComm;
///
/// let universe = mpi::initialize().unwrap();
/// let comm = MpiComm::new(universe.world());
/// ```
pub struct MpiComm {
    comm: SimpleCommunicator,
}

impl MpiComm {
    /// Wrap an MPI communicator.
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn barrier(&self) {
        self.comm.barrier();
    }

    fn wtime(&self) -> f64 {
        ::mpi::time()
    }

    fn broadcast_value<T: Pod>(&self, root: usize, value: &mut T) {
        let root_process = self.comm.process_at_rank(root as i32);
        root_process.broadcast_into(bytemuck::bytes_of_mut(value));
    }

    fn broadcast_vec<T: Pod>(&self, root: usize, data: &mut Vec<T>) {
        let root_process = self.comm.process_at_rank(root as i32);
        let mut len = data.len() as u64;
        root_process.broadcast_into(&mut len);

        let mut bytes: Vec<u8> = if self.rank() == root {
            bytemuck::cast_slice(data.as_slice()).to_vec()
        } else {
            vec![0u8; len as usize * std::mem::size_of::<T>()]
        };
        root_process.broadcast_into(&mut bytes[..]);
        if self.rank() != root {
            *data = bytemuck::pod_collect_to_vec(&bytes);
        }
    }

    fn all_gather<T: Pod>(&self, item: T) -> Vec<T> {
        let bytes = bytemuck::bytes_of(&item);
        let mut recv = vec![0u8; bytes.len() * self.size()];
        self.comm.all_gather_into(bytes, &mut recv[..]);
        bytemuck::pod_collect_to_vec(&recv)
    }

    fn gather_to_root<T: Pod>(&self, arr: &[T]) -> Option<Vec<T>> {
        let bytes: &[u8] = bytemuck::cast_slice(arr);
        let local_len = bytes.len() as i32;
        let root_process = self.comm.process_at_rank(0);

        if self.rank() == 0 {
            let mut counts = vec![0i32; self.size()];
            root_process.gather_into_root(&local_len, &mut counts);

            let total: i32 = counts.iter().sum();
            let mut recv = vec![0u8; total as usize];
            let displs: Vec<i32> = displacements(
                &counts.iter().map(|&c| c as usize).collect::<Vec<_>>(),
            )
            .iter()
            .map(|&d| d as i32)
            .collect();
            let mut partition = PartitionMut::new(&mut recv[..], counts, &displs[..]);
            root_process.gather_varcount_into_root(bytes, &mut partition);
            Some(bytemuck::pod_collect_to_vec(&recv))
        } else {
            root_process.gather_into(&local_len);
            root_process.gather_varcount_into(bytes);
            None
        }
    }

    fn all_reduce_i64(&self, op: ReduceOp, value: i64) -> i64 {
        let mut result = 0i64;
        match op {
            ReduceOp::Sum => {
                self.comm
                    .all_reduce_into(&value, &mut result, SystemOperation::sum())
            }
            ReduceOp::Min => {
                self.comm
                    .all_reduce_into(&value, &mut result, SystemOperation::min())
            }
            ReduceOp::Max => {
                self.comm
                    .all_reduce_into(&value, &mut result, SystemOperation::max())
            }
        }
        result
    }

    fn exchange_bytes(
        &self,
        tag: u16,
        sends: Vec<(usize, Vec<u8>)>,
        recvs: &[(usize, usize)],
    ) -> Vec<Vec<u8>> {
        let mut bufs: Vec<Vec<u8>> = recvs.iter().map(|&(_, n)| vec![0u8; n]).collect();

        // Post all receives first; only then send. Every rank follows the
        // same order, so the sends cannot deadlock.
        ::mpi::request::multiple_scope(recvs.len(), |scope, requests| {
            for (buf, &(src, _)) in bufs.iter_mut().zip(recvs) {
                let request = self
                    .comm
                    .process_at_rank(src as i32)
                    .immediate_receive_into_with_tag(scope, &mut buf[..], tag as i32);
                requests.add(request);
            }

            for (dst, buf) in &sends {
                self.comm
                    .process_at_rank(*dst as i32)
                    .send_with_tag(&buf[..], tag as i32);
            }

            let mut statuses = Vec::new();
            requests.wait_all(&mut statuses);
        });

        bufs
    }
}
