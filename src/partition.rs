//! Repartitioning of the forest by an explicit per-process count vector.
//!
//! [partition_given] moves a prefix-count slice of the globally
//! Morton-ordered leaf sequence to a new process assignment through
//! point-to-point byte messages on a single tag. Each message is
//! self-describing: a header of per-tree counts, the quadrant records, and
//! the payload bytes in the same order.

use log::{debug, info};

use crate::comm::Communicator;
use crate::forest::Forest;
use crate::tree::{Leaf, Payload};
use crate::types::{Coord, GlobalIndex, LocalIndex, TreeIndex};

use bytemuck::{Pod, Zeroable};

/// The message tag of the repartition exchange.
const PARTITION_TAG: u16 = 1;

/// The flat form of a quadrant shipped between processes. The payload
/// travels separately; the record carries no payload meaning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct WireQuadrant {
    x: Coord,
    y: Coord,
    level: i32,
}

const WIRE_QUAD_SIZE: usize = std::mem::size_of::<WireQuadrant>();
const TREE_COUNT_SIZE: usize = std::mem::size_of::<i32>();

/// Repartition the forest so that process `p` owns exactly
/// `new_counts[p]` leaves of the global Morton sequence.
///
/// The counts must be non-negative and sum to the global number of
/// quadrants. Returns the total number of quadrants shipped between
/// processes. The forest checksum is unchanged.
pub fn partition_given<C: Communicator>(
    forest: &mut Forest<'_, C>,
    new_counts: &[LocalIndex],
) -> GlobalIndex {
    let num_procs = forest.comm.size();
    let rank = forest.comm.rank();
    assert_eq!(new_counts.len(), num_procs);

    let data_size = forest.data_size;
    let quad_plus_data_size = WIRE_QUAD_SIZE + data_size;
    let num_trees = forest.trees.len();
    let first_local_tree = forest.first_local_tree;
    let last_local_tree = forest.last_local_tree;
    let old_global_last = forest.global_last_quad_index.clone();

    info!(
        "into partition_given with {} total quadrants",
        forest.global_num_quadrants
    );

    #[cfg(debug_assertions)]
    let checksum_before = forest.checksum();

    // the repartitioned cumulative quadrant index
    let mut new_global_last = Vec::with_capacity(num_procs);
    let mut cumulative: GlobalIndex = 0;
    for &count in new_counts {
        assert!(count >= 0);
        cumulative += count as GlobalIndex;
        new_global_last.push(cumulative - 1);
    }
    assert_eq!(cumulative, forest.global_num_quadrants);

    // the global number of shipped quadrants
    let mut total_shipped: GlobalIndex = 0;
    for p in 1..num_procs {
        let diff = old_global_last[p - 1] - new_global_last[p - 1];
        if diff >= 0 {
            total_shipped += diff.min(new_counts[p] as GlobalIndex);
        } else {
            total_shipped += (-diff).min(new_counts[p - 1] as GlobalIndex);
        }
    }
    debug_assert!((0..=forest.global_num_quadrants).contains(&total_shipped));

    // local index of the end of each local tree
    let mut local_tree_last = vec![-1 as GlobalIndex; num_trees];
    if first_local_tree >= 0 {
        let mut cumulative = 0;
        for which_tree in first_local_tree..=last_local_tree {
            cumulative += forest.trees[which_tree as usize].len() as GlobalIndex;
            local_tree_last[which_tree as usize] = cumulative - 1;
        }
    }

    // how many quadrants arrive from each process
    let my_begin_new = if rank == 0 { 0 } else { new_global_last[rank - 1] + 1 };
    let my_end_new = new_global_last[rank];
    let mut num_recv_from = vec![0 as GlobalIndex; num_procs];
    for from_proc in 0..num_procs {
        let from_begin = if from_proc == 0 {
            0
        } else {
            old_global_last[from_proc - 1] + 1
        };
        let from_end = old_global_last[from_proc];
        if from_begin <= my_end_new && from_end >= my_begin_new {
            num_recv_from[from_proc] =
                from_end.min(my_end_new) - from_begin.max(my_begin_new) + 1;
            debug!(
                "partition receive {} quadrants from {}",
                num_recv_from[from_proc], from_proc
            );
        }
    }

    // the tree span of each sender determines its header size
    let global_first_position = forest.global_first_position.clone();
    let tree_span = |p: usize| -> usize {
        (global_first_position[p + 1].which_tree - global_first_position[p].which_tree
            + 1) as usize
    };

    let mut recvs = Vec::new();
    for from_proc in 0..num_procs {
        if from_proc != rank && num_recv_from[from_proc] > 0 {
            let recv_size = tree_span(from_proc) * TREE_COUNT_SIZE
                + quad_plus_data_size * num_recv_from[from_proc] as usize;
            recvs.push((from_proc, recv_size));
        }
    }

    // how many quadrants go to each process, and from which global index
    let my_begin_old = if rank == 0 { 0 } else { old_global_last[rank - 1] + 1 };
    let my_end_old = old_global_last[rank];
    let mut num_send_to = vec![0 as GlobalIndex; num_procs];
    let mut begin_send_to = vec![-1 as GlobalIndex; num_procs];
    for to_proc in 0..num_procs {
        let to_begin = if to_proc == 0 { 0 } else { new_global_last[to_proc - 1] + 1 };
        let to_end = new_global_last[to_proc];
        if to_begin <= my_end_old && to_end >= my_begin_old {
            num_send_to[to_proc] = to_end.min(my_end_old) - to_begin.max(my_begin_old) + 1;
            begin_send_to[to_proc] = to_begin.max(my_begin_old);
            debug!(
                "partition send {} quadrants to {}",
                num_send_to[to_proc], to_proc
            );
        }
    }

    // per-tree counts of the slice this process keeps for itself
    let num_send_trees = tree_span(rank);
    let mut num_per_tree_local = vec![0 as LocalIndex; num_send_trees];
    if begin_send_to[rank] >= 0 && first_local_tree >= 0 {
        let my_begin = begin_send_to[rank] - my_begin_old;
        let my_end = begin_send_to[rank] + num_send_to[rank] - 1 - my_begin_old;
        for which_tree in first_local_tree..=last_local_tree {
            let from_begin = if which_tree == first_local_tree {
                0
            } else {
                local_tree_last[which_tree as usize - 1] + 1
            };
            let from_end = local_tree_last[which_tree as usize];
            if from_begin <= my_end && from_end >= my_begin {
                let num_copy = my_end.min(from_end) - my_begin.max(from_begin) + 1;
                num_per_tree_local[(which_tree - first_local_tree) as usize] =
                    num_copy as LocalIndex;
            }
        }
    }

    // pack one buffer per peer receiver
    let mut sends = Vec::new();
    for to_proc in 0..num_procs {
        if to_proc == rank || num_send_to[to_proc] == 0 {
            continue;
        }
        let send_size = num_send_trees * TREE_COUNT_SIZE
            + quad_plus_data_size * num_send_to[to_proc] as usize;
        let mut buf = vec![0u8; send_size];
        let quads_base = num_send_trees * TREE_COUNT_SIZE;
        let payload_base = quads_base + num_send_to[to_proc] as usize * WIRE_QUAD_SIZE;

        let mut my_begin = begin_send_to[to_proc] - my_begin_old;
        let my_end = begin_send_to[to_proc] + num_send_to[to_proc] - 1 - my_begin_old;
        let mut record = 0usize;
        for which_tree in first_local_tree..=last_local_tree {
            let from_begin = if which_tree == first_local_tree {
                0
            } else {
                local_tree_last[which_tree as usize - 1] + 1
            };
            let from_end = local_tree_last[which_tree as usize];
            if from_begin > my_end || from_end < my_begin {
                continue;
            }
            let tree_from_begin = (my_begin.max(from_begin) - from_begin) as usize;
            let tree_from_end = (my_end.min(from_end) - from_begin) as usize;
            let num_copy = tree_from_end - tree_from_begin + 1;

            let header = (which_tree - first_local_tree) as usize;
            buf[header * TREE_COUNT_SIZE..(header + 1) * TREE_COUNT_SIZE]
                .copy_from_slice(bytemuck::bytes_of(&(num_copy as i32)));

            debug!(
                "partition send {} [{},{}] quadrants from tree {} to proc {}",
                num_copy, tree_from_begin, tree_from_end, which_tree, to_proc
            );

            let tree = &forest.trees[which_tree as usize];
            for (j, leaf) in tree.quadrants[tree_from_begin..=tree_from_end]
                .iter()
                .enumerate()
            {
                let wire = WireQuadrant {
                    x: leaf.quad.x,
                    y: leaf.quad.y,
                    level: leaf.quad.level as i32,
                };
                let offset = quads_base + (record + j) * WIRE_QUAD_SIZE;
                buf[offset..offset + WIRE_QUAD_SIZE]
                    .copy_from_slice(bytemuck::bytes_of(&wire));
                if data_size > 0 {
                    let offset = payload_base + (record + j) * data_size;
                    buf[offset..offset + data_size]
                        .copy_from_slice(leaf.payload.as_bytes());
                }
            }

            my_begin += num_copy as GlobalIndex;
            record += num_copy;
        }
        sends.push((to_proc, buf));
    }

    // the exchange posts all receives, then sends, then waits
    let received = forest.comm.exchange_bytes(PARTITION_TAG, sends, &recvs);
    let mut recv_buf: Vec<Option<Vec<u8>>> = vec![None; num_procs];
    for (&(from_proc, _), buf) in recvs.iter().zip(received) {
        recv_buf[from_proc] = Some(buf);
    }

    let tree_counts = |from_proc: usize| -> Vec<LocalIndex> {
        if from_proc == rank {
            num_per_tree_local.clone()
        } else {
            let buf = recv_buf[from_proc].as_ref().unwrap();
            (0..tree_span(from_proc))
                .map(|i| {
                    bytemuck::pod_read_unaligned::<i32>(
                        &buf[i * TREE_COUNT_SIZE..(i + 1) * TREE_COUNT_SIZE],
                    )
                })
                .collect()
        }
    };

    // per-tree totals of the repartitioned forest, and how many arrive
    // from lower ranks
    let mut new_tree_count = vec![0 as LocalIndex; num_trees];
    let mut new_tree_before = vec![0 as LocalIndex; num_trees];
    let mut new_first_local_tree = num_trees as TreeIndex;
    let mut new_last_local_tree: TreeIndex = -1;
    for from_proc in 0..num_procs {
        if num_recv_from[from_proc] == 0 {
            continue;
        }
        let first_from_tree = global_first_position[from_proc].which_tree;
        for (i, &count) in tree_counts(from_proc).iter().enumerate() {
            if count > 0 {
                let which_tree = first_from_tree + i as TreeIndex;
                debug_assert!((0..num_trees as TreeIndex).contains(&which_tree));
                new_first_local_tree = new_first_local_tree.min(which_tree);
                new_last_local_tree = new_last_local_tree.max(which_tree);
                new_tree_count[which_tree as usize] += count;
                if from_proc < rank {
                    new_tree_before[which_tree as usize] += count;
                }
            }
        }
    }
    if new_first_local_tree > new_last_local_tree {
        new_first_local_tree = -1;
        new_last_local_tree = -2;
    }
    info!(
        "partition new forest [{},{}]",
        new_first_local_tree, new_last_local_tree
    );

    // move the kept slice of each old local tree to its new offset and
    // drop the payloads of everything else
    let first_tree = if first_local_tree >= 0 && new_first_local_tree >= 0 {
        first_local_tree.min(new_first_local_tree)
    } else {
        first_local_tree.max(new_first_local_tree)
    };
    let last_tree = last_local_tree.max(new_last_local_tree);

    let (my_begin, my_end) = if begin_send_to[rank] >= 0 {
        (
            begin_send_to[rank] - my_begin_old,
            begin_send_to[rank] + num_send_to[rank] - 1 - my_begin_old,
        )
    } else {
        (0, -1)
    };

    let mut tree_iter = first_tree;
    while first_tree >= 0 && tree_iter <= last_tree {
        let which_tree = tree_iter;
        tree_iter += 1;

        let was_local =
            (first_local_tree..=last_local_tree).contains(&which_tree);
        let tree = &mut forest.trees[which_tree as usize];
        let target = new_tree_count[which_tree as usize] as usize;

        if target == 0 {
            if was_local {
                // the whole tree is dropped
                tree.quadrants.clear();
                tree.recount();
            }
            continue;
        }

        let mut new_leaves: Vec<Leaf> = Vec::with_capacity(target);
        new_leaves.resize_with(target, Leaf::default);
        if was_local {
            let from_begin = if which_tree == first_local_tree {
                0
            } else {
                local_tree_last[which_tree as usize - 1] + 1
            };
            let from_end = local_tree_last[which_tree as usize];
            if from_begin <= my_end && from_end >= my_begin {
                let tree_from_begin = (my_begin.max(from_begin) - from_begin) as usize;
                let tree_from_end = (my_end.min(from_end) - from_begin) as usize;
                let before = new_tree_before[which_tree as usize] as usize;
                debug!(
                    "partition keep {} quadrants of tree {} at {}",
                    tree_from_end - tree_from_begin + 1,
                    which_tree,
                    before
                );
                for (j, leaf) in tree
                    .quadrants
                    .drain(tree_from_begin..=tree_from_end)
                    .enumerate()
                {
                    new_leaves[before + j] = leaf;
                }
            }
        }
        // remaining old leaves drop their payloads here
        tree.quadrants = new_leaves;
    }

    // copy in the received quadrants, in sender order
    let mut filled = vec![0 as LocalIndex; num_trees];
    for from_proc in 0..num_procs {
        if num_recv_from[from_proc] == 0 {
            continue;
        }
        let first_from_tree = global_first_position[from_proc].which_tree;
        let counts = tree_counts(from_proc);
        let span = tree_span(from_proc);
        let quads_base = span * TREE_COUNT_SIZE;
        let payload_base =
            quads_base + num_recv_from[from_proc] as usize * WIRE_QUAD_SIZE;

        let mut record = 0usize;
        for (i, &count) in counts.iter().enumerate() {
            let which_tree = first_from_tree + i as TreeIndex;
            let count = count as usize;
            if count > 0 && from_proc != rank {
                let buf = recv_buf[from_proc].as_ref().unwrap();
                let tree = &mut forest.trees[which_tree as usize];
                let before = filled[which_tree as usize] as usize;
                debug!(
                    "partition copy {} quadrants into tree {} from proc {}",
                    count, which_tree, from_proc
                );
                for j in 0..count {
                    let offset = quads_base + (record + j) * WIRE_QUAD_SIZE;
                    let wire: WireQuadrant = bytemuck::pod_read_unaligned(
                        &buf[offset..offset + WIRE_QUAD_SIZE],
                    );
                    let mut payload = Payload::alloc(data_size);
                    if data_size > 0 {
                        let offset = payload_base + (record + j) * data_size;
                        payload
                            .as_bytes_mut()
                            .copy_from_slice(&buf[offset..offset + data_size]);
                    }
                    tree.quadrants[before + j] = Leaf {
                        quad: crate::quadrant::Quadrant {
                            x: wire.x,
                            y: wire.y,
                            level: wire.level as i8,
                        },
                        payload,
                    };
                }
            }
            if count > 0 {
                filled[which_tree as usize] += count as LocalIndex;
            }
            record += count;
        }
    }

    // install the new partition state
    forest.global_last_quad_index = new_global_last;
    forest.first_local_tree = new_first_local_tree;
    forest.last_local_tree = new_last_local_tree;
    let mut local_num_quadrants = 0;
    for which_tree in forest.local_trees() {
        let tree = &mut forest.trees[which_tree as usize];
        tree.recount();
        local_num_quadrants += tree.len() as LocalIndex;
    }
    forest.local_num_quadrants = local_num_quadrants;
    forest.update_global_first_position();

    #[cfg(debug_assertions)]
    {
        assert!(forest.is_valid());
        assert_eq!(checksum_before, forest.checksum());
    }

    info!(
        "done partition_given shipped {} quadrants {:.3}%",
        total_shipped,
        total_shipped as f64 * 100.0 / forest.global_num_quadrants as f64
    );

    total_shipped
}

/// Repartition the forest into uniform slices.
pub fn partition_uniform<C: Communicator>(forest: &mut Forest<'_, C>) -> GlobalIndex {
    let num_procs = forest.comm.size();
    let total = forest.global_num_quadrants;
    let cut =
        |p: usize| -> GlobalIndex { p as GlobalIndex * total / num_procs as GlobalIndex };
    let new_counts: Vec<LocalIndex> = (0..num_procs)
        .map(|p| (cut(p + 1) - cut(p)) as LocalIndex)
        .collect();
    partition_given(forest, &new_counts)
}
