//! Ghost layer computation across tree boundaries.
//!
//! [compute_overlap] collects the local leaves that lie inside the
//! insulation layer of foreign quadrants and are fine enough to constrain
//! them under 2:1 balancing, re-expressed in the foreign tree's coordinate
//! frame. [uniqify_overlap] sorts the result by `(tree, morton)` and drops
//! duplicates and entries the receiver already has.

use std::cmp::Ordering;

use bytemuck::{Pod, Zeroable};
use itertools::Itertools;

use crate::connectivity::Connectivity;
use crate::constants::{quadrant_len, CORNER_TO_ZORDER, MAXLEVEL, NFACES, ROOT_LEN};
use crate::quadrant::Quadrant;
use crate::tree::Tree;
use crate::types::{Coord, TreeIndex};

/// A quadrant in transit, carrying the tree it belongs to.
///
/// This is the "piggy" interpretation of a quadrant's payload slot made
/// explicit: while a quadrant moves between trees or processes it has no
/// user data, only a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PiggyQuad {
    /// The quadrant, in the coordinate frame of `which_tree`.
    pub quad: Quadrant,
    /// The tree the quadrant refers to.
    pub which_tree: TreeIndex,
}

impl PiggyQuad {
    /// Tag a quadrant with its tree.
    pub fn new(quad: Quadrant, which_tree: TreeIndex) -> Self {
        Self { quad, which_tree }
    }
}

/// The flat form of a [PiggyQuad] sent between processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct WirePiggy {
    /// x coordinate of the quadrant.
    pub x: Coord,
    /// y coordinate of the quadrant.
    pub y: Coord,
    /// Level of the quadrant, widened for the wire.
    pub level: i32,
    /// The tree the quadrant refers to.
    pub which_tree: TreeIndex,
}

impl From<PiggyQuad> for WirePiggy {
    fn from(pq: PiggyQuad) -> Self {
        Self {
            x: pq.quad.x,
            y: pq.quad.y,
            level: pq.quad.level as i32,
            which_tree: pq.which_tree,
        }
    }
}

impl From<WirePiggy> for PiggyQuad {
    fn from(wire: WirePiggy) -> Self {
        Self {
            quad: Quadrant {
                x: wire.x,
                y: wire.y,
                level: wire.level as i8,
            },
            which_tree: wire.which_tree,
        }
    }
}

/// Order by tree, then by the quadrant order.
pub fn piggy_cmp(a: &PiggyQuad, b: &PiggyQuad) -> Ordering {
    a.which_tree
        .cmp(&b.which_tree)
        .then_with(|| a.quad.cmp(&b.quad))
}

/// Append to `out` every leaf of the local tree `qtree` that lies strictly
/// inside the insulation layer of an `input` quadrant and is more than one
/// level finer than it.
///
/// Input quadrants not tagged with `qtree` are skipped. An input quadrant
/// outside the root originated from a neighbor tree; the collected leaves
/// are then translated and transformed back into that tree's frame and
/// tagged with its id. Across a corner, every tree meeting at the shared
/// vertex receives the single smallest corner-touching quadrant instead of
/// the full overlap set.
pub fn compute_overlap(
    conn: &Connectivity,
    tree: &Tree,
    qtree: TreeIndex,
    input: &[PiggyQuad],
    out: &mut Vec<PiggyQuad>,
) {
    debug_assert!(tree.is_complete());

    let treecount = tree.len();
    if treecount == 0 || input.is_empty() {
        return;
    }

    // first and last descendants of the local tree
    let treefd = tree.quadrants[0].quad.first_descendant(MAXLEVEL);
    let treeld = tree.quadrants[treecount - 1]
        .quad
        .last_descendant(MAXLEVEL);

    /// How an input quadrant relates to the local tree.
    enum Across {
        /// The quadrant lives inside the local tree.
        Intra,
        /// The quadrant came across the given local face.
        Face { face: usize, ntree: TreeIndex, transform: u8 },
        /// The quadrant came across the given local corner.
        Corner { zcorner: usize, info: Vec<crate::connectivity::CornerInfo> },
    }

    for inq in input {
        if inq.which_tree != qtree {
            continue;
        }
        let q = inq.quad;

        let across = if q.is_inside() {
            Across::Intra
        } else {
            // this quadrant comes from a different tree
            debug_assert!(q.is_extended());
            let outface = [q.y < 0, q.x >= ROOT_LEN, q.y >= ROOT_LEN, q.x < 0];
            if (outface[0] || outface[2]) && (outface[1] || outface[3]) {
                // a corner neighbor
                let corner = (0..4)
                    .find(|&c| outface[(c + 3) % 4] && outface[c])
                    .unwrap();
                Across::Corner {
                    zcorner: CORNER_TO_ZORDER[corner],
                    info: conn.corner_info(qtree, corner),
                }
            } else {
                // a face neighbor
                let face = (0..NFACES).find(|&f| outface[f]).unwrap();
                Across::Face {
                    face,
                    ntree: conn.tree_to_tree[NFACES * qtree as usize + face],
                    transform: conn.face_transform(qtree, face),
                }
            }
        };
        let qh = quadrant_len(q.level);

        // loop over the insulation layer of q
        for k in 0..3 {
            for l in 0..3 {
                // exclude q itself from the queries
                if k * 3 + l == 4 {
                    continue;
                }
                let s = Quadrant {
                    x: q.x + (l as Coord - 1) * qh,
                    y: q.y + (k as Coord - 1) * qh,
                    level: q.level,
                };
                if !s.is_inside() {
                    // outside this tree, no overlap
                    continue;
                }
                let fd = s.first_descendant(MAXLEVEL);
                let ld = s.last_descendant(MAXLEVEL);

                // skip if the insulation quadrant misses the local range
                if ld < treefd || treeld < fd {
                    continue;
                }

                // bracket the local leaves that fall between fd and ld
                let mut guess = treecount / 2;
                let first_index = if fd <= treefd {
                    0
                } else {
                    match tree.find_lower_bound(&s, guess) {
                        Some(index) => {
                            guess = index;
                            index
                        }
                        None => continue,
                    }
                };
                let last_index = if treeld <= ld {
                    treecount - 1
                } else {
                    match tree.find_higher_bound(&ld, guess) {
                        Some(index) => index,
                        None => continue,
                    }
                };
                if first_index > last_index {
                    continue;
                }

                match &across {
                    Across::Corner { zcorner, info } => {
                        // across the corner, find the smallest corner
                        // quadrant to be sent
                        let mut level = 0;
                        for leaf in &tree.quadrants[first_index..=last_index] {
                            if leaf.quad.level <= level {
                                continue;
                            }
                            level = leaf.quad.corner_level(*zcorner, level);
                        }

                        // every neighbor tree at the shared vertex receives
                        // it, expressed at that tree's own corner
                        for ci in info {
                            let nzcorner = CORNER_TO_ZORDER[ci.ncorner];
                            let outq = Quadrant::at_corner(level, nzcorner, false);
                            out.push(PiggyQuad::new(outq, ci.ntree));
                        }
                    }
                    Across::Face { face, ntree, transform } => {
                        // take the leaves that are fine enough to constrain q
                        for leaf in &tree.quadrants[first_index..=last_index] {
                            if leaf.quad.level > q.level + 1 {
                                let outq =
                                    leaf.quad.translated(*face).transformed(*transform);
                                out.push(PiggyQuad::new(outq, *ntree));
                            }
                        }
                    }
                    Across::Intra => {
                        for leaf in &tree.quadrants[first_index..=last_index] {
                            if leaf.quad.level > q.level + 1 {
                                out.push(PiggyQuad::new(leaf.quad, qtree));
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Sort `out` by `(tree, morton)`, drop duplicates and drop entries present
/// in `already_have`, which must be sorted the same way.
pub fn uniqify_overlap(already_have: &[PiggyQuad], out: &mut Vec<PiggyQuad>) {
    debug_assert!(already_have
        .iter()
        .tuple_windows()
        .all(|(a, b)| piggy_cmp(a, b).is_lt()));
    if out.is_empty() {
        return;
    }
    out.sort_unstable_by(piggy_cmp);
    out.dedup();
    out.retain(|pq| {
        already_have
            .binary_search_by(|probe| piggy_cmp(probe, pq))
            .is_err()
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::balance::complete_region;
    use crate::tree::Leaf;

    fn single_tree_conn() -> Connectivity {
        // one tree, all faces on the boundary
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

    fn uniform_tree(level: i8) -> Tree {
        let mut tree = Tree::new();
        for id in 0..1u64 << (2 * level as u64) {
            tree.push(Leaf::new(Quadrant::from_morton(level, id)));
        }
        tree
    }

    #[test]
    fn test_intra_tree_overlap_picks_fine_leaves() {
        let conn = single_tree_conn();
        // a tree refined to level 3 everywhere
        let tree = uniform_tree(3);

        // a coarse level-1 quadrant wants to know who constrains it
        let input = vec![PiggyQuad::new(Quadrant::new(0, 0, 1), 0)];
        let mut out = Vec::new();
        compute_overlap(&conn, &tree, 0, &input, &mut out);

        // every collected leaf is inside the insulation layer and finer
        // than level 2
        assert!(!out.is_empty());
        for pq in &out {
            assert_eq!(pq.which_tree, 0);
            assert!(pq.quad.level > 2);
        }
    }

    #[test]
    fn test_overlap_skips_other_trees() {
        let conn = single_tree_conn();
        let tree = uniform_tree(2);
        let input = vec![PiggyQuad::new(Quadrant::new(0, 0, 1), 7)];
        let mut out = Vec::new();
        compute_overlap(&conn, &tree, 0, &input, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_overlap_ignores_coarse_leaves() {
        let conn = single_tree_conn();
        let tree = uniform_tree(2);
        // leaves at level 2 do not constrain a level-1 quadrant
        let input = vec![PiggyQuad::new(Quadrant::new(0, 0, 1), 0)];
        let mut out = Vec::new();
        compute_overlap(&conn, &tree, 0, &input, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_overlap_respects_interval_bounds() {
        let conn = single_tree_conn();
        // a partial tree holding only one refined region
        let q1 = Quadrant::from_morton(3, 9);
        let q2 = Quadrant::from_morton(3, 17);
        let mut tree = crate::tree::Tree::new();
        complete_region(q1, true, q2, true, &mut tree, 0, 0, None);

        let input = vec![PiggyQuad::new(Quadrant::root().children()[0], 0)];
        let mut out = Vec::new();
        compute_overlap(&conn, &tree, 0, &input, &mut out);
        for pq in &out {
            assert!(pq.quad.level > 2);
            assert!(pq.quad >= q1 && pq.quad <= q2);
        }
    }

    #[test]
    fn test_uniqify_overlap() {
        let a = PiggyQuad::new(Quadrant::from_morton(2, 3), 0);
        let b = PiggyQuad::new(Quadrant::from_morton(2, 1), 1);
        let c = PiggyQuad::new(Quadrant::from_morton(2, 2), 1);
        let mut out = vec![c, a, b, a, c, b];
        uniqify_overlap(&[], &mut out);
        assert_eq!(out, vec![a, b, c]);

        let mut out = vec![c, a, b, a];
        uniqify_overlap(&[b], &mut out);
        assert_eq!(out, vec![a, c]);

        // strictly sorted by (tree, morton) afterwards
        let mut out = vec![c, b, a, c];
        uniqify_overlap(&[a], &mut out);
        assert!(out.windows(2).all(|w| piggy_cmp(&w[0], &w[1]).is_lt()));
        assert!(!out.contains(&a));
    }
}
