//! Completion, 2:1 balancing and linearization of a single subtree.
//!
//! [complete_region] fills a Morton interval with the minimal linear set of
//! quadrants. [balance_subtree] inserts the minimum set of quadrants so
//! that no leaf differs by more than one level from any face or corner
//! neighbor, working bottom-up through per-level hash sets.
//! [complete_subtree] is the same machinery with the neighbor enumeration
//! disabled and yields a complete linear tree over the convex Morton hull
//! of the input. [linearize_subtree] removes ancestors subsumed by their
//! descendants.

use std::collections::{HashMap, VecDeque};

use log::{debug, info};

use crate::constants::{quadrant_len, ROOT_LEN};
use crate::quadrant::{Quadrant, CORNERS_OMITTED, INDIRECT_NEIGHBORS};
use crate::tree::{init_payload, InitFn, Leaf, Tree};
use crate::types::TreeIndex;

/// Which neighbor relations the balance condition covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceKind {
    /// Balance across faces only.
    Face,
    /// Balance across faces and corners.
    FaceCorner,
}

/// Observable counters of one completion or balance pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalanceStats {
    /// Candidates rejected for lying outside the root tree.
    pub outside_root: usize,
    /// Candidates rejected for lying outside the span of the input leaves.
    pub outside_tree: usize,
    /// Candidates skipped because the input already contains them.
    pub already_in_input: usize,
    /// Candidates skipped because an earlier pass already produced them.
    pub already_in_outlist: usize,
    /// Quadrants added to the tree.
    pub inserted: usize,
}

/// Tag distinguishing how a quadrant entered the balance hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Probe {
    /// Inserted as a sibling or indirect neighbor candidate.
    User,
    /// Inserted while probing a parent; a second probe of the same parent
    /// ends the candidate enumeration early.
    Parent,
}

/// Fill the open interval `(q1, q2)` with the minimal linear set of
/// quadrants, with the endpoints included as requested.
///
/// The tree must be empty; on return it is sorted, linear and complete over
/// the interval. Both endpoints must be valid and `q1 < q2`.
pub fn complete_region(
    q1: Quadrant,
    include_q1: bool,
    q2: Quadrant,
    include_q2: bool,
    tree: &mut Tree,
    which_tree: TreeIndex,
    data_size: usize,
    init: Option<&InitFn>,
) {
    assert!(tree.is_empty());
    assert!(q1.is_valid() && q2.is_valid());
    assert!(q1 < q2);

    if include_q1 {
        let payload = init_payload(which_tree, &q1, data_size, init);
        tree.push(Leaf { quad: q1, payload });
    }

    let mut work = VecDeque::new();
    work.extend(q1.nearest_common_ancestor(&q2).children());

    while let Some(w) = work.pop_front() {
        if q1 < w && w < q2 && !w.is_ancestor_of(&q2) {
            let payload = init_payload(which_tree, &w, data_size, init);
            tree.push(Leaf { quad: w, payload });
        } else if w.is_ancestor_of(&q1) || w.is_ancestor_of(&q2) {
            for child in w.children().iter().rev() {
                work.push_front(*child);
            }
        }
    }

    if include_q2 {
        let payload = init_payload(which_tree, &q2, data_size, init);
        tree.push(Leaf { quad: q2, payload });
    }

    debug_assert!(tree.is_complete());
    debug_assert!(tree.counters_consistent());
}

/// Make the tree 2:1 balanced with respect to the chosen neighbor relation.
///
/// The tree must be almost-sorted; it may contain extended leaves
/// representing neighbor-tree quadrants. On return the tree is sorted,
/// linear and balanced, and only inside leaves remain.
pub fn balance_subtree(
    tree: &mut Tree,
    which_tree: TreeIndex,
    kind: BalanceKind,
    data_size: usize,
    init: Option<&InitFn>,
) -> BalanceStats {
    complete_or_balance(tree, Some(kind), which_tree, data_size, init)
}

/// Complete the tree over the convex Morton hull of its leaves.
///
/// Same machinery as [balance_subtree] with the neighbor enumeration
/// disabled: only siblings and parents are considered.
pub fn complete_subtree(
    tree: &mut Tree,
    which_tree: TreeIndex,
    data_size: usize,
    init: Option<&InitFn>,
) -> BalanceStats {
    complete_or_balance(tree, None, which_tree, data_size, init)
}

fn complete_or_balance(
    tree: &mut Tree,
    kind: Option<BalanceKind>,
    which_tree: TreeIndex,
    data_size: usize,
    init: Option<&InitFn>,
) -> BalanceStats {
    debug_assert!(tree.is_almost_sorted(true));
    let mut stats = BalanceStats::default();

    // sid 0..3 are the siblings of a quadrant, 4 its parent, 5..7 the
    // relevant indirect neighbors of the parent
    let bbound: usize = if kind.is_none() { 5 } else { 8 };
    let incount = tree.quadrants.len();
    if incount <= 1 {
        return stats;
    }
    let inmaxl = tree.maxlevel;

    // determine the finest descendants of the first and last inside leaf
    let mut inside = None;
    let mut tree_first = Quadrant::root();
    let mut tree_last = Quadrant::root();
    for i in 0..incount {
        let q = tree.quadrants[i].quad;
        if q.is_inside() {
            inside = Some(i);
            tree_first = q.first_descendant(inmaxl);
            tree_last = q.last_descendant(inmaxl);
            break;
        }
    }
    let Some(first_inside) = inside else {
        // only extended quadrants, nothing to do
        return stats;
    };
    for i in first_inside + 1..incount {
        let q = tree.quadrants[i].quad;
        if !q.is_inside() {
            break;
        }
        let ld = q.last_descendant(inmaxl);
        if tree_last < ld {
            tree_last = ld;
        }
    }
    debug_assert!(tree_first.is_valid() && tree_last.is_valid());

    let mut hash: Vec<HashMap<Quadrant, Probe>> =
        vec![HashMap::new(); inmaxl as usize + 1];
    let mut outlist: Vec<Vec<Quadrant>> = vec![Vec::new(); inmaxl as usize + 1];

    // walk through the input bottom-up
    for l in (1..=inmaxl).rev() {
        let lu = l as usize;
        // additions to the current level are siblings whose parents the
        // originating quadrant already probes, so the count is fixed here
        let ocount = outlist[lu].len();
        let mut i = 0;
        while i < incount + ocount {
            let mut isfamily = false;
            let q = if i < incount {
                let q = tree.quadrants[i].quad;
                if q.level != l {
                    i += 1;
                    continue;
                }
                // catch four adjacent siblings in one step
                if i + 4 <= incount
                    && Quadrant::is_family(
                        &q,
                        &tree.quadrants[i + 1].quad,
                        &tree.quadrants[i + 2].quad,
                        &tree.quadrants[i + 3].quad,
                    )
                {
                    isfamily = true;
                    i += 3;
                }
                q
            } else {
                let q = outlist[lu][i - incount];
                debug_assert_eq!(q.level, l);
                q
            };
            debug_assert!(q.is_extended());
            let isoutroot = !q.is_inside();
            let qid = q.child_id();

            let mut parent = Quadrant::root();
            let mut ph = 0;
            let mut pid = 0;
            for sid in 0..bbound {
                // stage 1: determine the candidate for this sid
                let candidate = if sid < 4 {
                    if qid == sid || isfamily || isoutroot {
                        continue;
                    }
                    q.sibling(sid)
                } else if sid == 4 {
                    let p = q.parent();
                    if bbound > 5 {
                        parent = p;
                        ph = quadrant_len(parent.level);
                        pid = parent.child_id();
                    }
                    p
                } else {
                    if kind == Some(BalanceKind::Face) && sid - 5 == CORNERS_OMITTED[pid]
                    {
                        // only needed for corner balance
                        continue;
                    }
                    let candidate = Quadrant {
                        x: parent.x + INDIRECT_NEIGHBORS[pid][sid - 5][0] * ph,
                        y: parent.y + INDIRECT_NEIGHBORS[pid][sid - 5][1] * ph,
                        level: parent.level,
                    };
                    let outface = [
                        candidate.y < 0,
                        candidate.x >= ROOT_LEN,
                        candidate.y >= ROOT_LEN,
                        candidate.x < 0,
                    ];
                    if !isoutroot {
                        if outface.iter().any(|&f| f) {
                            stats.outside_root += 1;
                            continue;
                        }
                    } else if (outface[0] || outface[2]) && (outface[1] || outface[3]) {
                        // outside the root and across a corner
                        stats.outside_root += 1;
                        continue;
                    }
                    candidate
                };

                // stage 2: include the candidate if necessary
                if candidate.is_inside() {
                    let ld = candidate.last_descendant(inmaxl);
                    if (tree_first > candidate
                        && (candidate.x != tree_first.x || candidate.y != tree_first.y))
                        || ld > tree_last
                    {
                        stats.outside_tree += 1;
                        continue;
                    }
                }
                if let Some(&probe) = hash[candidate.level as usize].get(&candidate) {
                    stats.already_in_outlist += 1;
                    if sid == 4 && probe == Probe::Parent {
                        // this parent has been triggered before
                        break;
                    }
                    continue;
                }
                if tree.bsearch(&candidate).is_some() {
                    stats.already_in_input += 1;
                    continue;
                }
                let probe = if sid == 4 { Probe::Parent } else { Probe::User };
                hash[candidate.level as usize].insert(candidate, probe);
                outlist[candidate.level as usize].push(candidate);
            }
            i += 1;
        }
    }

    // merge the inside quadrants of the out lists into the tree
    for (l, list) in outlist.iter().enumerate() {
        let mut merged_any = false;
        for &quad in list {
            debug_assert_eq!(quad.level as usize, l);
            if quad.is_inside() {
                let payload = init_payload(which_tree, &quad, data_size, init);
                tree.quadrants.push(Leaf { quad, payload });
                tree.quadrants_per_level[l] += 1;
                stats.inserted += 1;
                merged_any = true;
            }
        }
        if merged_any && l as i8 > tree.maxlevel {
            tree.maxlevel = l as i8;
        }
    }

    debug!(
        "tree {} outside root {} tree {}",
        which_tree, stats.outside_root, stats.outside_tree
    );
    info!(
        "tree {} already in input {} outlist {} insertions {}",
        which_tree, stats.already_in_input, stats.already_in_outlist, stats.inserted
    );

    // sort, linearize and drop the extended quadrants
    tree.quadrants.sort_unstable_by(|a, b| a.quad.cmp(&b.quad));
    linearize_subtree(tree);
    if !tree.quadrants.iter().all(|leaf| leaf.quad.is_inside()) {
        tree.quadrants.retain(|leaf| leaf.quad.is_inside());
        tree.recount();
    }

    debug_assert!(tree.is_linear());
    debug_assert!(tree.counters_consistent());
    stats
}

/// Remove every leaf that is equal to or an ancestor of its successor,
/// keeping the sort order and recomputing the counters.
pub fn linearize_subtree(tree: &mut Tree) {
    debug_assert!(tree.is_almost_sorted(false));

    let incount = tree.quadrants.len();
    if incount <= 1 {
        return;
    }
    let mut removed = 0;

    let mut current = 0;
    for rest in 1..incount {
        let q1 = tree.quadrants[current].quad;
        let q2 = tree.quadrants[rest].quad;
        if q1 == q2 || q1.is_ancestor_of(&q2) {
            tree.quadrants_per_level[q1.level as usize] -= 1;
            // the successor replaces its ancestor; the ancestor's payload is
            // parked at the end of the window and dropped by the truncate
            tree.quadrants.swap(current, rest);
            removed += 1;
        } else {
            current += 1;
            if current < rest {
                tree.quadrants.swap(current, rest);
            }
        }
    }
    tree.quadrants.truncate(current + 1);

    // update the level counters
    let mut maxlevel = 0;
    let mut num_quadrants = 0usize;
    for (level, &count) in tree.quadrants_per_level.iter().enumerate() {
        debug_assert!(count >= 0);
        num_quadrants += count as usize;
        if count > 0 {
            maxlevel = level as i8;
        }
    }
    tree.maxlevel = maxlevel;

    debug_assert_eq!(num_quadrants, tree.quadrants.len());
    debug_assert_eq!(tree.quadrants.len(), incount - removed);
    debug_assert!(tree.is_sorted());
    debug_assert!(tree.is_linear());
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::MAXLEVEL;
    use crate::tree::Payload;

    fn tree_of(quads: &[Quadrant]) -> Tree {
        let mut tree = Tree::new();
        for &q in quads {
            tree.push(Leaf::new(q));
        }
        tree
    }

    #[test]
    fn test_complete_region_endpoints() {
        let q1 = Quadrant::from_morton(3, 5);
        let q2 = Quadrant::from_morton(3, 53);
        let mut tree = Tree::new();
        complete_region(q1, true, q2, true, &mut tree, 0, 0, None);

        assert_eq!(tree.quadrants.first().unwrap().quad, q1);
        assert_eq!(tree.quadrants.last().unwrap().quad, q2);
        assert!(tree.is_complete());
        assert!(tree.is_linear());
    }

    #[test]
    fn test_complete_region_is_minimal_between_corners() {
        // between the very first and very last deepest quadrants the
        // minimal covering of the open interval is everything in between
        let q1 = Quadrant::from_morton(2, 0);
        let q2 = Quadrant::from_morton(2, 15);
        let mut tree = Tree::new();
        complete_region(q1, false, q2, false, &mut tree, 0, 0, None);

        // three siblings of q1, two middle root children, three of q2
        assert!(tree.is_linear());
        assert!(tree.quadrants.first().unwrap().quad > q1);
        assert!(tree.quadrants.last().unwrap().quad < q2);
        assert!(q1.is_next(&tree.quadrants.first().unwrap().quad));
        assert!(tree.quadrants.last().unwrap().quad.is_next(&q2));
    }

    #[test]
    fn test_complete_region_area_covers_interval() {
        let q1 = Quadrant::from_morton(4, 17);
        let q2 = Quadrant::from_morton(4, 231);
        let mut tree = Tree::new();
        complete_region(q1, true, q2, true, &mut tree, 0, 0, None);

        // the union of the emitted leaves is exactly [q1, q2] in Morton
        // terms, counted in units of level-4 cells
        let cells: u64 = tree
            .quadrants
            .iter()
            .map(|leaf| 1 << (2 * (4 - leaf.quad.level as u64)))
            .sum();
        assert_eq!(cells, 231 - 17 + 1);
    }

    #[test]
    fn test_complete_subtree_fills_the_hull() {
        // the first and last level-2 quadrants of the tree anchor the hull;
        // completion bridges the middle with the two level-1 quadrants
        let a = Quadrant::from_morton(2, 0);
        let b = Quadrant::from_morton(2, 15);
        let mut tree = tree_of(&[a, b]);
        complete_subtree(&mut tree, 0, 0, None);

        assert!(tree.is_linear());
        assert!(tree.is_complete());
        assert_eq!(tree.quadrants.first().unwrap().quad, a);
        assert_eq!(tree.quadrants.last().unwrap().quad, b);
        assert_eq!(tree.len(), 10);
        assert_eq!(tree.quadrants_per_level[1], 2);
        assert_eq!(tree.quadrants_per_level[2], 8);
    }

    fn is_two_to_one(tree: &Tree, corners: bool) -> bool {
        // brute force check over all pairs of leaves
        for a in &tree.quadrants {
            for b in &tree.quadrants {
                if (a.quad.level - b.quad.level).abs() <= 1 {
                    continue;
                }
                let (coarse, fine) = if a.quad.level < b.quad.level {
                    (a.quad, b.quad)
                } else {
                    (b.quad, a.quad)
                };
                let ch = quadrant_len(coarse.level);
                let fh = quadrant_len(fine.level);
                let touch_x =
                    fine.x + fh >= coarse.x && fine.x <= coarse.x + ch;
                let touch_y =
                    fine.y + fh >= coarse.y && fine.y <= coarse.y + ch;
                let face_touch = (fine.x + fh == coarse.x || fine.x == coarse.x + ch)
                    ^ (fine.y + fh == coarse.y || fine.y == coarse.y + ch);
                if touch_x && touch_y {
                    if corners || face_touch {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Refine the first root child, then keep refining towards the center
    /// of the root. The deep leaves end up corner-adjacent to the other
    /// level-1 children, so balancing has real work to do.
    fn center_refinement(deep_level: i8) -> Vec<Quadrant> {
        let mut quads = Vec::new();
        let children = Quadrant::root().children();
        quads.extend_from_slice(&children[1..]);
        let mut q = children[0];
        for _ in 1..deep_level {
            let children = q.children();
            quads.extend([children[0], children[1], children[2]]);
            q = children[3];
        }
        quads.push(q);
        quads.sort_unstable();
        quads
    }

    #[test]
    fn test_balance_pathological_refinement() {
        let mut tree = tree_of(&center_refinement(6));

        let stats = balance_subtree(&mut tree, 0, BalanceKind::FaceCorner, 0, None);
        assert!(stats.inserted > 0);
        assert!(tree.is_linear());
        assert!(tree.is_complete());
        assert!(is_two_to_one(&tree, true));

        // balancing again changes nothing
        let before: Vec<Quadrant> =
            tree.quadrants.iter().map(|leaf| leaf.quad).collect();
        let stats = balance_subtree(&mut tree, 0, BalanceKind::FaceCorner, 0, None);
        assert_eq!(stats.inserted, 0);
        let after: Vec<Quadrant> =
            tree.quadrants.iter().map(|leaf| leaf.quad).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_balance_corner_path_is_already_balanced() {
        // refining only the 0-corner path keeps the tree balanced; the
        // pass must not insert anything
        let deep_level = 6;
        let mut quads = Vec::new();
        let mut q = Quadrant::root();
        for _ in 0..deep_level {
            let children = q.children();
            quads.extend_from_slice(&children[1..]);
            q = children[0];
        }
        quads.push(q);
        quads.sort_unstable();
        let mut tree = tree_of(&quads);
        assert_eq!(tree.len(), 3 * deep_level as usize + 1);

        let stats = balance_subtree(&mut tree, 0, BalanceKind::FaceCorner, 0, None);
        assert_eq!(stats.inserted, 0);
        assert_eq!(tree.len(), 3 * deep_level as usize + 1);
        assert!(is_two_to_one(&tree, true));
    }

    #[test]
    fn test_balance_face_mode_leaves_face_neighbors_balanced() {
        let mut tree = tree_of(&center_refinement(5));

        balance_subtree(&mut tree, 0, BalanceKind::Face, 0, None);
        assert!(tree.is_linear());
        assert!(is_two_to_one(&tree, false));
    }

    #[test]
    fn test_balance_counts_outside_root_rejections() {
        // a quadrant in the tree corner forces candidates beyond the root
        let mut q = Quadrant::root();
        let mut quads = Vec::new();
        for _ in 0..4 {
            let children = q.children();
            quads.extend_from_slice(&children[1..]);
            q = children[0];
        }
        quads.push(q);
        quads.sort_unstable();
        let mut tree = tree_of(&quads);

        let stats = balance_subtree(&mut tree, 0, BalanceKind::FaceCorner, 0, None);
        assert!(stats.outside_root > 0);
    }

    #[test]
    fn test_balance_initializes_payloads() {
        let mut tree = Tree::new();
        for quad in center_refinement(4) {
            let mut payload = Payload::alloc(4);
            payload.as_bytes_mut().copy_from_slice(&7i32.to_le_bytes());
            tree.push(Leaf { quad, payload });
        }
        // missing siblings of the root child are created with data 9
        let init: &InitFn = &|_, _, bytes: &mut [u8]| {
            bytes.copy_from_slice(&9i32.to_le_bytes());
        };
        balance_subtree(&mut tree, 0, BalanceKind::FaceCorner, 4, Some(init));
        assert!(tree
            .quadrants
            .iter()
            .all(|leaf| leaf.payload.as_bytes().len() == 4));
        assert!(tree
            .quadrants
            .iter()
            .any(|leaf| leaf.payload.as_bytes() == 9i32.to_le_bytes()));
    }

    #[test]
    fn test_linearize_removes_ancestors() {
        let root = Quadrant::root();
        let child = root.children()[2];
        let grandchildren = child.children();
        let mut quads = vec![root, child];
        quads.extend_from_slice(&grandchildren);
        quads.sort_unstable();
        let mut tree = tree_of(&quads);

        linearize_subtree(&mut tree);
        assert!(tree.is_linear());
        assert_eq!(tree.len(), 4);
        assert!(tree
            .quadrants
            .iter()
            .zip(grandchildren.iter())
            .all(|(leaf, &q)| leaf.quad == q));
    }

    #[test]
    fn test_linearize_removes_duplicates() {
        let q = Quadrant::from_morton(3, 12);
        let mut tree = tree_of(&[q, q, q]);
        linearize_subtree(&mut tree);
        assert_eq!(tree.len(), 1);
        assert!(tree.counters_consistent());
    }

    #[test]
    fn test_linearize_after_sort_is_linear_for_any_input() {
        use rand::SeedableRng;
        use rand_chacha::ChaCha8Rng;
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        for _ in 0..20 {
            let mut quads = Vec::new();
            for _ in 0..100 {
                use rand::Rng;
                let level = rng.gen_range(0..=6i8);
                let cells = 1i64 << level;
                let len = quadrant_len(level);
                quads.push(Quadrant::new(
                    (rng.gen_range(0..cells) as i32) * len,
                    (rng.gen_range(0..cells) as i32) * len,
                    level,
                ));
            }
            quads.sort_unstable();
            let mut tree = tree_of(&quads);
            linearize_subtree(&mut tree);
            assert!(tree.is_linear());
        }
    }

    #[test]
    fn test_balance_keeps_only_inside_leaves() {
        // an extended neighbor forces refinement but is not retained
        let mut quads = vec![
            Quadrant::new(-(quadrant_len(4)), 0, 4),
        ];
        let root = Quadrant::root();
        quads.extend_from_slice(&root.children());
        quads.sort_unstable();
        let mut tree = tree_of(&quads);
        assert!(tree.is_almost_sorted(true));

        balance_subtree(&mut tree, 0, BalanceKind::FaceCorner, 0, None);
        assert!(tree.quadrants.iter().all(|leaf| leaf.quad.is_inside()));
        assert!(tree.is_linear());
        // the extended level-4 quadrant forced its face neighbors to level 3
        assert!(tree.maxlevel >= 3);
        assert!(is_two_to_one(&tree, true));
    }

    #[test]
    fn test_complete_region_at_the_deepest_level() {
        let q1 = Quadrant::from_morton(MAXLEVEL, 1);
        let q2 = Quadrant::from_morton(MAXLEVEL, 7);
        assert!(q1 < q2);
        let mut tree = Tree::new();
        complete_region(q1, true, q2, true, &mut tree, 0, 0, None);
        assert!(tree.is_complete());
        assert_eq!(tree.len(), 7);
    }
}
