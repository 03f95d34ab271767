//! The distributed forest of quadtrees.
//!
//! A forest owns one [Tree] per connectivity tree, of which a contiguous
//! range is local to this process, and the global partition tables
//! describing which process owns which Morton slice of the global leaf
//! sequence. All processes of the communicator must call every collective
//! forest operation.

use log::info;

use crate::balance::{balance_subtree, BalanceKind};
use crate::comm::{Communicator, ReduceOp};
use crate::connectivity::Connectivity;
use crate::constants::{quadrant_len, CORNER_TO_ZORDER, MAXLEVEL, NFACES, ROOT_LEN};
use crate::overlap::{compute_overlap, uniqify_overlap, PiggyQuad, WirePiggy};
use crate::quadrant::Quadrant;
use crate::tree::{init_payload, InitFn, Leaf, Tree};
use crate::types::{Coord, GlobalIndex, GlobalPosition, LocalIndex, TreeIndex};

/// A parallel collection of quadtrees over a shared connectivity.
pub struct Forest<'a, C: Communicator> {
    /// The communicator coordinating the forest.
    pub comm: &'a C,
    /// The coarse mesh topology, immutable during the session.
    pub connectivity: &'a Connectivity,
    /// One tree per connectivity tree; only local trees hold leaves.
    pub trees: Vec<Tree>,
    /// First tree with local leaves, `-1` when this process holds none.
    pub first_local_tree: TreeIndex,
    /// Last tree with local leaves, `-2` when this process holds none.
    pub last_local_tree: TreeIndex,
    /// Size in bytes of the per-leaf payload, zero for none.
    pub data_size: usize,
    /// Number of leaves on this process.
    pub local_num_quadrants: LocalIndex,
    /// Number of leaves across all processes.
    pub global_num_quadrants: GlobalIndex,
    /// First leaf of each process as a point at [MAXLEVEL], with a final
    /// sentinel `(num_trees, 0, 0)`. Empty processes repeat the position of
    /// the next process.
    pub global_first_position: Vec<GlobalPosition>,
    /// Cumulative global leaf count per process.
    pub global_last_quad_index: Vec<GlobalIndex>,
}

fn position_cmp(a: &GlobalPosition, b: &GlobalPosition) -> std::cmp::Ordering {
    a.which_tree.cmp(&b.which_tree).then_with(|| {
        let qa = Quadrant { x: a.x, y: a.y, level: MAXLEVEL };
        let qb = Quadrant { x: b.x, y: b.y, level: MAXLEVEL };
        qa.cmp(&qb)
    })
}

impl<'a, C: Communicator> Forest<'a, C> {
    /// Create a forest holding one root leaf per connectivity tree, with
    /// the trees block-partitioned over the processes.
    pub fn new(
        comm: &'a C,
        connectivity: &'a Connectivity,
        data_size: usize,
        init: Option<&InitFn>,
    ) -> Self {
        assert!(connectivity.is_valid());
        let num_procs = comm.size();
        let rank = comm.rank();
        let num_trees = connectivity.num_trees;

        let cut = |p: usize| -> GlobalIndex {
            p as GlobalIndex * num_trees as GlobalIndex / num_procs as GlobalIndex
        };

        let global_first_position: Vec<GlobalPosition> = (0..=num_procs)
            .map(|p| GlobalPosition { which_tree: cut(p) as TreeIndex, x: 0, y: 0 })
            .collect();
        let global_last_quad_index: Vec<GlobalIndex> =
            (0..num_procs).map(|p| cut(p + 1) - 1).collect();

        let (first_local_tree, last_local_tree) = if cut(rank) == cut(rank + 1) {
            (-1, -2)
        } else {
            (cut(rank) as TreeIndex, (cut(rank + 1) - 1) as TreeIndex)
        };

        let mut trees = Vec::with_capacity(num_trees as usize);
        let mut local_num_quadrants = 0;
        for which_tree in 0..num_trees {
            let mut tree = Tree::new();
            if first_local_tree >= 0
                && (first_local_tree..=last_local_tree).contains(&which_tree)
            {
                let quad = Quadrant::root();
                let payload = init_payload(which_tree, &quad, data_size, init);
                tree.push(Leaf { quad, payload });
                local_num_quadrants += 1;
            }
            trees.push(tree);
        }

        let forest = Self {
            comm,
            connectivity,
            trees,
            first_local_tree,
            last_local_tree,
            data_size,
            local_num_quadrants,
            global_num_quadrants: num_trees as GlobalIndex,
            global_first_position,
            global_last_quad_index,
        };
        info!(
            "new forest with {} trees on {} processes",
            num_trees, num_procs
        );
        debug_assert!(forest.is_valid());
        forest
    }

    /// The local trees as an index range, empty on an empty process.
    pub fn local_trees(&self) -> std::ops::Range<TreeIndex> {
        if self.first_local_tree < 0 {
            0..0
        } else {
            self.first_local_tree..self.last_local_tree + 1
        }
    }

    /// Replace every leaf for which the callback is true by its four
    /// children, recursively when requested.
    pub fn refine(
        &mut self,
        recursive: bool,
        refine_fn: &dyn Fn(TreeIndex, &Quadrant) -> bool,
        init: Option<&InitFn>,
    ) {
        fn push_refined(
            tree: &mut Tree,
            which_tree: TreeIndex,
            quad: Quadrant,
            recursive: bool,
            refine_fn: &dyn Fn(TreeIndex, &Quadrant) -> bool,
            data_size: usize,
            init: Option<&InitFn>,
        ) {
            if recursive && quad.level < MAXLEVEL && refine_fn(which_tree, &quad) {
                for child in quad.children() {
                    push_refined(
                        tree, which_tree, child, recursive, refine_fn, data_size, init,
                    );
                }
            } else {
                let payload = init_payload(which_tree, &quad, data_size, init);
                tree.push(Leaf { quad, payload });
            }
        }

        for which_tree in self.local_trees() {
            let tree = &mut self.trees[which_tree as usize];
            let leaves = std::mem::take(&mut tree.quadrants);
            tree.quadrants_per_level = Default::default();
            tree.maxlevel = 0;
            for leaf in leaves {
                if leaf.quad.level < MAXLEVEL && refine_fn(which_tree, &leaf.quad) {
                    for child in leaf.quad.children() {
                        push_refined(
                            tree,
                            which_tree,
                            child,
                            recursive,
                            refine_fn,
                            self.data_size,
                            init,
                        );
                    }
                } else {
                    tree.push(leaf);
                }
            }
            debug_assert!(tree.is_complete());
        }
        self.update_counts();
        debug_assert!(self.is_valid());
    }

    /// Replace every complete, locally owned family for which the callback
    /// is true by its parent, cascading upwards when requested.
    pub fn coarsen(
        &mut self,
        recursive: bool,
        coarsen_fn: &dyn Fn(TreeIndex, &[Quadrant; 4]) -> bool,
        init: Option<&InitFn>,
    ) {
        loop {
            let mut changed = false;
            for which_tree in self.local_trees() {
                let tree = &mut self.trees[which_tree as usize];
                let mut leaves = std::mem::take(&mut tree.quadrants);
                tree.quadrants_per_level = Default::default();
                tree.maxlevel = 0;
                let mut index = 0;
                while index < leaves.len() {
                    if index + 4 <= leaves.len() {
                        let family = [
                            leaves[index].quad,
                            leaves[index + 1].quad,
                            leaves[index + 2].quad,
                            leaves[index + 3].quad,
                        ];
                        if Quadrant::is_family(
                            &family[0], &family[1], &family[2], &family[3],
                        ) && coarsen_fn(which_tree, &family)
                        {
                            let quad = family[0].parent();
                            let payload =
                                init_payload(which_tree, &quad, self.data_size, init);
                            tree.push(Leaf { quad, payload });
                            index += 4;
                            changed = true;
                            continue;
                        }
                    }
                    tree.push(std::mem::take(&mut leaves[index]));
                    index += 1;
                }
                debug_assert!(tree.is_complete());
            }
            if !recursive || !changed {
                break;
            }
        }
        self.update_counts();
        debug_assert!(self.is_valid());
    }

    /// Enforce the 2:1 balance condition across the whole forest.
    ///
    /// Each local tree is balanced, then leaves constraining other trees
    /// and other processes travel through the ghost layer machinery and
    /// the affected trees are rebalanced, until no process inserts
    /// anything new.
    pub fn balance(&mut self, kind: BalanceKind, init: Option<&InitFn>) {
        for which_tree in self.local_trees() {
            let tree = &mut self.trees[which_tree as usize];
            balance_subtree(tree, which_tree, kind, self.data_size, init);
        }

        loop {
            // every process contributes its boundary leaves, mapped into
            // the receiving tree's coordinate frame
            let seeds = self.balance_seeds(kind);
            let wire_seeds: Vec<WirePiggy> =
                seeds.iter().map(|&pq| pq.into()).collect();
            let all_seeds: Vec<PiggyQuad> = self
                .comm
                .all_gather_varcount(&wire_seeds)
                .into_iter()
                .map(PiggyQuad::from)
                .collect();

            // answer with the local leaves that constrain foreign quadrants
            let mut responses = Vec::new();
            for which_tree in self.local_trees() {
                compute_overlap(
                    self.connectivity,
                    &self.trees[which_tree as usize],
                    which_tree,
                    &all_seeds,
                    &mut responses,
                );
            }
            let wire_responses: Vec<WirePiggy> =
                responses.iter().map(|&pq| pq.into()).collect();
            let all_responses: Vec<PiggyQuad> = self
                .comm
                .all_gather_varcount(&wire_responses)
                .into_iter()
                .map(PiggyQuad::from)
                .collect();

            // merge the constraints into the local trees and rebalance
            let mut changed = false;
            for which_tree in self.local_trees() {
                let tree = &mut self.trees[which_tree as usize];
                if tree.is_empty() {
                    continue;
                }
                let own_first = tree.quadrants[0].quad.first_descendant(MAXLEVEL);
                let own_last = tree
                    .quadrants
                    .last()
                    .unwrap()
                    .quad
                    .last_descendant(MAXLEVEL);

                let mut additions: Vec<PiggyQuad> = all_seeds
                    .iter()
                    .chain(all_responses.iter())
                    .filter(|pq| pq.which_tree == which_tree)
                    .copied()
                    .collect();
                let own: Vec<PiggyQuad> = tree
                    .quadrants
                    .iter()
                    .map(|leaf| PiggyQuad::new(leaf.quad, which_tree))
                    .collect();
                uniqify_overlap(&own, &mut additions);
                if additions.is_empty() {
                    continue;
                }

                let before: Vec<Quadrant> =
                    tree.quadrants.iter().map(|leaf| leaf.quad).collect();
                for pq in &additions {
                    tree.quadrants.push(Leaf::new(pq.quad));
                }
                tree.quadrants.sort_unstable_by(|a, b| a.quad.cmp(&b.quad));
                tree.recount();
                balance_subtree(tree, which_tree, kind, self.data_size, init);

                // keep only the slice this process owns
                tree.quadrants.retain(|leaf| {
                    let fd = leaf.quad.first_descendant(MAXLEVEL);
                    own_first <= fd && fd <= own_last
                });
                tree.recount();
                debug_assert!(tree.is_complete());

                let after: Vec<Quadrant> =
                    tree.quadrants.iter().map(|leaf| leaf.quad).collect();
                changed |= before != after;
            }

            if self.comm.all_reduce_i64(ReduceOp::Sum, changed as i64) == 0 {
                break;
            }
        }

        self.update_counts();
        debug_assert!(self.is_valid());
    }

    /// Boundary leaves of the local trees, expressed in each neighbor
    /// tree's frame, plus local leaves whose insulation layer crosses a
    /// process boundary within their own tree.
    fn balance_seeds(&self, kind: BalanceKind) -> Vec<PiggyQuad> {
        let conn = self.connectivity;
        let mut seeds = Vec::new();
        for which_tree in self.local_trees() {
            let tree = &self.trees[which_tree as usize];
            if tree.is_empty() {
                continue;
            }
            let own_first = tree.quadrants[0].quad.first_descendant(MAXLEVEL);
            let own_last = tree
                .quadrants
                .last()
                .unwrap()
                .quad
                .last_descendant(MAXLEVEL);

            for leaf in &tree.quadrants {
                let q = leaf.quad;
                let qh = quadrant_len(q.level);
                let touches =
                    [q.y == 0, q.x + qh == ROOT_LEN, q.y + qh == ROOT_LEN, q.x == 0];

                for face in 0..NFACES {
                    if !touches[face] {
                        continue;
                    }
                    let index = NFACES * which_tree as usize + face;
                    let ntree = conn.tree_to_tree[index];
                    if ntree == which_tree
                        && (conn.tree_to_face[index] & 3) as usize == face
                    {
                        // physical boundary
                        continue;
                    }
                    let transform = conn.face_transform(which_tree, face);
                    seeds.push(PiggyQuad::new(
                        q.translated(face).transformed(transform),
                        ntree,
                    ));
                }

                if kind == BalanceKind::FaceCorner {
                    let corner_touch = [
                        touches[0] && touches[3],
                        touches[0] && touches[1],
                        touches[1] && touches[2],
                        touches[2] && touches[3],
                    ];
                    for corner in 0..4 {
                        if !corner_touch[corner] {
                            continue;
                        }
                        for info in conn.corner_info(which_tree, corner) {
                            let outq = Quadrant::at_corner(
                                q.level,
                                CORNER_TO_ZORDER[info.ncorner],
                                false,
                            );
                            seeds.push(PiggyQuad::new(outq, info.ntree));
                        }
                    }
                }

                // a leaf whose insulation layer reaches into another
                // process's slice of the same tree
                'insulation: for k in 0..3 {
                    for l in 0..3 {
                        if k * 3 + l == 4 {
                            continue;
                        }
                        let s = Quadrant {
                            x: q.x + (l as Coord - 1) * qh,
                            y: q.y + (k as Coord - 1) * qh,
                            level: q.level,
                        };
                        if !s.is_inside() {
                            continue;
                        }
                        if s.first_descendant(MAXLEVEL) < own_first
                            || own_last < s.last_descendant(MAXLEVEL)
                        {
                            seeds.push(PiggyQuad::new(q, which_tree));
                            break 'insulation;
                        }
                    }
                }
            }
        }
        seeds
    }

    /// Recompute the local and global leaf counts after a local change.
    fn update_counts(&mut self) {
        self.local_num_quadrants = self
            .local_trees()
            .map(|which_tree| self.trees[which_tree as usize].len() as LocalIndex)
            .sum();
        let counts = self.comm.all_gather(self.local_num_quadrants as GlobalIndex);
        let mut cumulative = 0;
        self.global_last_quad_index = counts
            .iter()
            .map(|&count| {
                cumulative += count;
                cumulative - 1
            })
            .collect();
        self.global_num_quadrants = cumulative;
    }

    /// Recompute [Forest::global_first_position] from the local trees.
    ///
    /// Empty processes inherit the position of the next process, fixed up
    /// from the highest rank downward.
    pub(crate) fn update_global_first_position(&mut self) {
        let num_procs = self.comm.size();
        let num_trees = self.connectivity.num_trees;

        let own = if self.first_local_tree >= 0 {
            let tree = &self.trees[self.first_local_tree as usize];
            let first = tree.quadrants[0].quad.first_descendant(MAXLEVEL);
            GlobalPosition {
                which_tree: self.first_local_tree,
                x: first.x,
                y: first.y,
            }
        } else {
            // marked empty, resolved below
            GlobalPosition { which_tree: -1, x: 0, y: 0 }
        };

        let mut positions = self.comm.all_gather(own);
        positions.push(GlobalPosition { which_tree: num_trees, x: 0, y: 0 });
        for p in (0..num_procs).rev() {
            if positions[p].which_tree < 0 {
                positions[p] = positions[p + 1];
            }
        }
        self.global_first_position = positions;
    }

    /// The process owning the given quadrant of the given tree.
    pub fn find_owner(&self, which_tree: TreeIndex, quad: &Quadrant) -> usize {
        debug_assert!(quad.is_valid());
        debug_assert!((0..self.connectivity.num_trees).contains(&which_tree));
        let first = quad.first_descendant(MAXLEVEL);
        let position = GlobalPosition { which_tree, x: first.x, y: first.y };
        let num_procs = self.comm.size();
        self.global_first_position[..num_procs]
            .partition_point(|gp| position_cmp(gp, &position).is_le())
            .saturating_sub(1)
    }

    /// Check the forest invariants on all processes.
    pub fn is_valid(&self) -> bool {
        let rank = self.comm.rank();
        let num_procs = self.comm.size();
        let positions = &self.global_first_position;

        let mut valid = positions.len() == num_procs + 1
            && self.global_last_quad_index.len() == num_procs
            && self.trees.len() == self.connectivity.num_trees as usize
            && positions[num_procs].which_tree == self.connectivity.num_trees
            && positions[num_procs].x == 0
            && positions[num_procs].y == 0;

        if self.first_local_tree < 0 || self.last_local_tree < 0 {
            valid &= self.first_local_tree == -1 && self.last_local_tree == -2;
        } else {
            // the first local quadrant realizes this process's position
            valid &= positions[rank].which_tree == self.first_local_tree;
            let tree = &self.trees[self.first_local_tree as usize];
            if let Some(first) = tree.quadrants.first() {
                valid &= first.quad.x == positions[rank].x
                    && first.quad.y == positions[rank].y;
            }

            // the last local quadrant reaches up to the next position
            let next = positions[rank + 1];
            valid &= next.which_tree == self.last_local_tree
                || next.which_tree == self.last_local_tree + 1;
            let tree = &self.trees[self.last_local_tree as usize];
            if let Some(last) = tree.quadrants.last() {
                if next.which_tree == self.last_local_tree {
                    let nextlow =
                        Quadrant { x: next.x, y: next.y, level: MAXLEVEL };
                    valid &= last.quad.is_next(&nextlow);
                } else {
                    let end = last.quad.last_descendant(MAXLEVEL);
                    valid &= end.x + 1 == ROOT_LEN && end.y + 1 == ROOT_LEN;
                }
            }
        }

        let mut local_count = 0;
        for (which_tree, tree) in self.trees.iter().enumerate() {
            valid &= tree.is_complete() && tree.counters_consistent();
            let local = self.local_trees().contains(&(which_tree as TreeIndex));
            if !local {
                valid &= tree.is_empty();
            }
            local_count += tree.len();
        }
        valid &= local_count == self.local_num_quadrants as usize;

        self.comm.all_reduce_and(valid)
    }

    /// A checksum over all leaves of the forest, identical on all
    /// processes and invariant under repartitioning.
    pub fn checksum(&self) -> u32 {
        let mut bytes = Vec::new();
        for which_tree in self.local_trees() {
            self.trees[which_tree as usize].checksum_bytes(0, &mut bytes);
        }
        let mut crc = self
            .comm
            .gather_to_root(&bytes)
            .map(|all| crc32c::crc32c(&all))
            .unwrap_or(0);
        self.comm.broadcast_value(0, &mut crc);
        crc
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::DummyComm;

    fn unit_square() -> Connectivity {
        Connectivity {
            num_trees: 1,
            num_vertices: 4,
            tree_to_vertex: vec![0, 1, 2, 3],
            tree_to_tree: vec![0, 0, 0, 0],
            tree_to_face: vec![0, 1, 2, 3],
            vertices: vec![
                0.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                1.0, 1.0, 0.0, //
                0.0, 1.0, 0.0,
            ],
            vtt_offset: vec![0, 1, 2, 3, 4],
            vertex_to_tree: vec![0, 0, 0, 0],
            vertex_to_vertex: vec![0, 1, 2, 3],
        }
    }

    #[test]
    fn test_new_forest_single_tree() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let forest = Forest::new(&comm, &conn, 0, None);
        assert_eq!(forest.local_num_quadrants, 1);
        assert_eq!(forest.global_num_quadrants, 1);
        assert_eq!(forest.first_local_tree, 0);
        assert_eq!(forest.last_local_tree, 0);
        assert!(forest.is_valid());
    }

    #[test]
    fn test_uniform_refine() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let mut forest = Forest::new(&comm, &conn, 0, None);
        for _ in 0..3 {
            forest.refine(false, &|_, _| true, None);
        }
        let tree = &forest.trees[0];
        assert_eq!(tree.len(), 64);
        assert_eq!(tree.maxlevel, 3);
        assert_eq!(tree.quadrants_per_level[3], 64);
        assert!(tree.is_complete() && tree.is_linear());
        assert_eq!(forest.global_num_quadrants, 64);
    }

    #[test]
    fn test_recursive_refine_to_fixed_level() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let mut forest = Forest::new(&comm, &conn, 0, None);
        forest.refine(true, &|_, q| q.level < 2, None);
        assert_eq!(forest.trees[0].len(), 16);
        assert!(forest.trees[0].is_complete());
    }

    #[test]
    fn test_coarsen_undoes_refine() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let mut forest = Forest::new(&comm, &conn, 4, None);
        forest.refine(true, &|_, q| q.level < 2, None);
        forest.coarsen(true, &|_, _| true, None);
        assert_eq!(forest.trees[0].len(), 1);
        assert_eq!(forest.trees[0].quadrants[0].quad, Quadrant::root());
        assert_eq!(forest.global_num_quadrants, 1);
    }

    #[test]
    fn test_refine_initializes_payloads() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let init: &InitFn = &|_, quad, bytes: &mut [u8]| {
            bytes.copy_from_slice(&(quad.level as u32).to_le_bytes());
        };
        let mut forest = Forest::new(&comm, &conn, 4, Some(init));
        forest.refine(false, &|_, _| true, Some(init));
        for leaf in &forest.trees[0].quadrants {
            assert_eq!(leaf.payload.as_bytes(), 1u32.to_le_bytes());
        }
    }

    #[test]
    fn test_balance_single_tree_center_refinement() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let mut forest = Forest::new(&comm, &conn, 0, None);
        // refine only the path of quadrants whose lower left region corner
        // approaches the center of the tree; the coarse siblings left
        // behind violate the 2:1 condition
        forest.refine(true, &|_, q| {
            let len = quadrant_len(q.level);
            let center = ROOT_LEN / 2;
            q.level < 6
                && q.x <= center
                && center < q.x + len
                && q.y <= center
                && center < q.y + len
        }, None);
        let before = forest.global_num_quadrants;
        forest.balance(BalanceKind::FaceCorner, None);
        assert!(forest.global_num_quadrants > before);
        assert!(forest.trees[0].is_linear());
        assert!(forest.is_valid());
    }

    #[test]
    fn test_checksum_changes_with_refinement() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let mut forest = Forest::new(&comm, &conn, 0, None);
        let empty = forest.checksum();
        forest.refine(false, &|_, _| true, None);
        assert_ne!(empty, forest.checksum());
        // deterministic for a given forest
        assert_eq!(forest.checksum(), forest.checksum());
    }

    #[test]
    fn test_find_owner_single_rank() {
        let comm = DummyComm::new();
        let conn = unit_square();
        let forest = Forest::new(&comm, &conn, 0, None);
        assert_eq!(forest.find_owner(0, &Quadrant::root()), 0);
    }
}
