//! A thread-per-rank in-process communicator.
//!
//! [run] spawns one thread per rank and hands each a [LocalComm] sharing a
//! set of mailboxes and a barrier. The backend implements the full
//! [Communicator](super::Communicator) surface and lets the multi-rank
//! protocols run inside ordinary tests without an MPI launcher.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::time::Instant;

use bytemuck::Pod;

use super::{Communicator, ReduceOp};

struct Shared {
    size: usize,
    barrier: Barrier,
    // one scratch slot per rank for the collectives
    slots: Mutex<Vec<Vec<u8>>>,
    mail: Mutex<HashMap<(usize, usize, u16), VecDeque<Vec<u8>>>>,
    mail_ready: Condvar,
    epoch: Instant,
}

/// One rank of an in-process communicator created by [run].
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

/// Run `f` once per rank on `size` threads sharing one communicator.
///
/// Panics in any rank propagate when the threads are joined.
pub fn run<F>(size: usize, f: F)
where
    F: Fn(LocalComm) + Send + Sync,
{
    assert!(size > 0);
    let shared = Arc::new(Shared {
        size,
        barrier: Barrier::new(size),
        slots: Mutex::new(vec![Vec::new(); size]),
        mail: Mutex::new(HashMap::new()),
        mail_ready: Condvar::new(),
        epoch: Instant::now(),
    });
    std::thread::scope(|scope| {
        for rank in 0..size {
            let comm = LocalComm { rank, shared: shared.clone() };
            let f = &f;
            scope.spawn(move || f(comm));
        }
    });
}

impl LocalComm {
    /// Write this rank's contribution, wait, read, and wait again so that a
    /// fast rank cannot race ahead into the next collective.
    fn collective<R>(
        &self,
        write: impl FnOnce(&mut Vec<Vec<u8>>),
        read: impl FnOnce(&[Vec<u8>]) -> R,
    ) -> R {
        {
            let mut slots = self.shared.slots.lock().unwrap();
            write(&mut slots);
        }
        self.shared.barrier.wait();
        let result = {
            let slots = self.shared.slots.lock().unwrap();
            read(&slots)
        };
        self.shared.barrier.wait();
        result
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn wtime(&self) -> f64 {
        self.shared.epoch.elapsed().as_secs_f64()
    }

    fn broadcast_value<T: Pod>(&self, root: usize, value: &mut T) {
        let rank = self.rank;
        let bytes = bytemuck::bytes_of(value).to_vec();
        let received = self.collective(
            |slots| {
                if rank == root {
                    slots[root] = bytes;
                }
            },
            |slots| slots[root].clone(),
        );
        *value = bytemuck::pod_read_unaligned(&received);
    }

    fn broadcast_vec<T: Pod>(&self, root: usize, data: &mut Vec<T>) {
        let rank = self.rank;
        let bytes = bytemuck::cast_slice(data.as_slice()).to_vec();
        let received = self.collective(
            |slots| {
                if rank == root {
                    slots[root] = bytes;
                }
            },
            |slots| slots[root].clone(),
        );
        *data = bytemuck::pod_collect_to_vec(&received);
    }

    fn all_gather<T: Pod>(&self, item: T) -> Vec<T> {
        let rank = self.rank;
        let bytes = bytemuck::bytes_of(&item).to_vec();
        let received = self.collective(
            |slots| slots[rank] = bytes,
            |slots| slots.concat(),
        );
        bytemuck::pod_collect_to_vec(&received)
    }

    fn gather_to_root<T: Pod>(&self, arr: &[T]) -> Option<Vec<T>> {
        let rank = self.rank;
        let bytes = bytemuck::cast_slice(arr).to_vec();
        let received = self.collective(
            |slots| slots[rank] = bytes,
            |slots| {
                if rank == 0 {
                    Some(slots.concat())
                } else {
                    None
                }
            },
        );
        received.map(|bytes| bytemuck::pod_collect_to_vec(&bytes))
    }

    fn all_reduce_i64(&self, op: ReduceOp, value: i64) -> i64 {
        let contributions = self.all_gather(value);
        let mut acc = contributions[0];
        for &contribution in &contributions[1..] {
            acc = op.fold(acc, contribution);
        }
        acc
    }

    fn exchange_bytes(
        &self,
        tag: u16,
        sends: Vec<(usize, Vec<u8>)>,
        recvs: &[(usize, usize)],
    ) -> Vec<Vec<u8>> {
        {
            let mut mail = self.shared.mail.lock().unwrap();
            for (dst, buf) in sends {
                assert!(dst < self.shared.size);
                mail.entry((self.rank, dst, tag)).or_default().push_back(buf);
            }
            self.shared.mail_ready.notify_all();
        }
        recvs
            .iter()
            .map(|&(src, size)| {
                let mut mail = self.shared.mail.lock().unwrap();
                loop {
                    if let Some(buf) = mail
                        .get_mut(&(src, self.rank, tag))
                        .and_then(|q| q.pop_front())
                    {
                        assert_eq!(buf.len(), size, "message size mismatch");
                        return buf;
                    }
                    mail = self.shared.mail_ready.wait(mail).unwrap();
                }
            })
            .collect()
    }
}
