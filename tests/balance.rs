//! Balance of a pathological refinement in a single-tree forest.

use quadforest::balance::BalanceKind;
use quadforest::comm::DummyComm;
use quadforest::connectivity::Connectivity;
use quadforest::constants::{quadrant_len, MAXLEVEL};
use quadforest::forest::Forest;
use quadforest::quadrant::Quadrant;

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

/// Face- or corner-adjacent leaves differ by at most one level.
fn is_two_to_one(quads: &[Quadrant]) -> bool {
    for a in quads {
        for b in quads {
            if (a.level - b.level).abs() <= 1 {
                continue;
            }
            let (coarse, fine) = if a.level < b.level { (a, b) } else { (b, a) };
            let ch = quadrant_len(coarse.level);
            let fh = quadrant_len(fine.level);
            if fine.x + fh >= coarse.x
                && fine.x <= coarse.x + ch
                && fine.y + fh >= coarse.y
                && fine.y <= coarse.y + ch
            {
                return false;
            }
        }
    }
    true
}

#[test]
fn balance_of_a_deep_corner_path() {
    let refined_level = MAXLEVEL / 2 + 1;
    let comm = DummyComm::new();
    let conn = unit_square();
    let mut forest = Forest::new(&comm, &conn, 0, None);

    // refine only the leaf whose child-id path is 0,0,0,...
    forest.refine(
        true,
        &|_, q| q.x == 0 && q.y == 0 && q.level < refined_level,
        None,
    );
    assert_eq!(
        forest.global_num_quadrants,
        3 * refined_level as i64 + 1
    );

    forest.balance(BalanceKind::FaceCorner, None);
    let tree = &forest.trees[0];
    assert!(tree.is_complete());
    assert!(tree.is_linear());
    assert!(forest.is_valid());

    // the corner path is balanced as refined: exactly three siblings per
    // level plus the deepest leaf
    assert_eq!(forest.global_num_quadrants, 3 * refined_level as i64 + 1);
    for level in 1..=refined_level {
        let expected = if level == refined_level { 4 } else { 3 };
        assert_eq!(tree.quadrants_per_level[level as usize], expected);
    }

    // every leaf touching the deepest leaf is at most one level coarser
    let deepest = tree.quadrants[0].quad;
    assert_eq!(deepest.level, refined_level);
    for leaf in &tree.quadrants {
        let q = leaf.quad;
        let qh = quadrant_len(q.level);
        let dh = quadrant_len(refined_level);
        let touches = q.x <= deepest.x + dh
            && deepest.x <= q.x + qh
            && q.y <= deepest.y + dh
            && deepest.y <= q.y + qh;
        if touches {
            assert!(q.level >= refined_level - 1);
        }
    }

    let quads: Vec<Quadrant> = tree.quadrants.iter().map(|leaf| leaf.quad).collect();
    assert!(is_two_to_one(&quads));
}

#[test]
fn balance_inserts_the_minimum_for_a_center_path() {
    let comm = DummyComm::new();
    let conn = unit_square();
    let mut forest = Forest::new(&comm, &conn, 0, None);

    // refine towards the far corner of the first root child; the coarse
    // level-1 siblings end up corner-adjacent to deep leaves
    let deep_level = 7;
    forest.refine(
        true,
        &|_, q| {
            let len = quadrant_len(q.level);
            let target = quadrant_len(1);
            q.level < deep_level
                && q.x <= target
                && target < q.x + len
                && q.y <= target
                && target < q.y + len
        },
        None,
    );

    let before = forest.global_num_quadrants;
    forest.balance(BalanceKind::FaceCorner, None);
    assert!(forest.global_num_quadrants > before);

    let tree = &forest.trees[0];
    assert!(tree.is_complete());
    let quads: Vec<Quadrant> = tree.quadrants.iter().map(|leaf| leaf.quad).collect();
    assert!(is_two_to_one(&quads));

    // a second balance is a no-op
    let count = forest.global_num_quadrants;
    forest.balance(BalanceKind::FaceCorner, None);
    assert_eq!(forest.global_num_quadrants, count);
}
