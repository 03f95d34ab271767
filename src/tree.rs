//! The per-tree quadrant container.
//!
//! A tree owns the sorted sequence of leaves that live in it on this
//! process, together with per-level counts and the maximum level, which are
//! maintained eagerly. Code that manipulates the raw sequence must call
//! [Tree::recount] before re-entering public operations.

use itertools::Itertools;

use crate::constants::{NLEVELS, ROOT_LEN};
use crate::quadrant::Quadrant;
use crate::types::{LocalIndex, TreeIndex};

/// Callback initializing the payload of a newly created leaf.
pub type InitFn<'a> = dyn Fn(TreeIndex, &Quadrant, &mut [u8]) + 'a;

/// Per-leaf user data.
///
/// A leaf either carries no data (the forest was created with a zero data
/// size) or an owned buffer of exactly the forest's data size. Quadrants in
/// transit between trees or processes do not use this type at all; they
/// carry their destination in an explicit [crate::overlap::PiggyQuad].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Payload {
    /// No per-leaf data.
    #[default]
    None,
    /// An owned data buffer of the forest's data size.
    Bytes(Box<[u8]>),
}

impl Payload {
    /// Allocate a zero-filled payload of the given size, or none.
    pub fn alloc(data_size: usize) -> Payload {
        if data_size == 0 {
            Payload::None
        } else {
            Payload::Bytes(vec![0u8; data_size].into_boxed_slice())
        }
    }

    /// View the payload bytes, empty when there is no data.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::None => &[],
            Payload::Bytes(b) => b,
        }
    }

    /// Mutable view of the payload bytes, empty when there is no data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Payload::None => &mut [],
            Payload::Bytes(b) => b,
        }
    }
}

/// Allocate and initialize the payload of a newly created leaf.
///
/// The callback only runs for quadrants inside the root tree; extended
/// quadrants are transient and never carry user data.
pub(crate) fn init_payload(
    which_tree: TreeIndex,
    quad: &Quadrant,
    data_size: usize,
    init: Option<&InitFn>,
) -> Payload {
    let mut payload = Payload::alloc(data_size);
    if let Some(init) = init {
        if quad.is_inside() {
            init(which_tree, quad, payload.as_bytes_mut());
        }
    }
    payload
}

/// A quadrant stored in a tree together with its payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// The quadrant.
    pub quad: Quadrant,
    /// The per-leaf user data.
    pub payload: Payload,
}

impl Leaf {
    /// A leaf without payload.
    pub fn new(quad: Quadrant) -> Self {
        Self { quad, payload: Payload::None }
    }
}

/// The ordered sequence of quadrants of one tree on this process.
#[derive(Debug, Default, Clone)]
pub struct Tree {
    /// The leaves, sorted by the quadrant order.
    pub quadrants: Vec<Leaf>,
    /// Number of leaves per level, consistent with the sequence.
    pub quadrants_per_level: [LocalIndex; NLEVELS],
    /// The deepest level that occurs in the sequence.
    pub maxlevel: i8,
}

impl Tree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves in the tree.
    pub fn len(&self) -> usize {
        self.quadrants.len()
    }

    /// True if the tree holds no leaves.
    pub fn is_empty(&self) -> bool {
        self.quadrants.is_empty()
    }

    /// Append a leaf, maintaining the per-level counters.
    ///
    /// The caller is responsible for keeping the sequence sorted.
    pub fn push(&mut self, leaf: Leaf) {
        let level = leaf.quad.level;
        self.quadrants_per_level[level as usize] += 1;
        self.maxlevel = self.maxlevel.max(level);
        self.quadrants.push(leaf);
    }

    /// Recompute the per-level counters and maximum level from the sequence.
    pub fn recount(&mut self) {
        self.quadrants_per_level = [0; NLEVELS];
        self.maxlevel = 0;
        for leaf in &self.quadrants {
            self.quadrants_per_level[leaf.quad.level as usize] += 1;
            self.maxlevel = self.maxlevel.max(leaf.quad.level);
        }
    }

    /// True if the counters agree with the sequence.
    pub fn counters_consistent(&self) -> bool {
        let mut maxlevel = 0i8;
        let mut total = 0usize;
        for (level, &count) in self.quadrants_per_level.iter().enumerate() {
            if count < 0 {
                return false;
            }
            total += count as usize;
            if count > 0 {
                maxlevel = level as i8;
            }
        }
        total == self.quadrants.len() && maxlevel == self.maxlevel
    }

    /// True if the sequence is strictly increasing.
    pub fn is_sorted(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows()
            .all(|(a, b)| a.quad < b.quad)
    }

    /// True if the sequence is sorted and no leaf is an ancestor of its
    /// successor.
    pub fn is_linear(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows()
            .all(|(a, b)| a.quad < b.quad && !a.quad.is_ancestor_of(&b.quad))
    }

    /// True if every consecutive pair of leaves is Morton-adjacent.
    pub fn is_complete(&self) -> bool {
        self.quadrants
            .iter()
            .tuple_windows()
            .all(|(a, b)| a.quad.is_next(&b.quad))
    }

    /// True if the sequence is sorted except across runs of extended
    /// quadrants that lie outside the same corner of the root, which may
    /// overlap each other.
    pub fn is_almost_sorted(&self, check_linearity: bool) -> bool {
        fn face_contact(q: &Quadrant) -> u8 {
            let mut contact = 0;
            if q.y < 0 {
                contact |= 0x01;
            }
            if q.x >= ROOT_LEN {
                contact |= 0x02;
            }
            if q.y >= ROOT_LEN {
                contact |= 0x04;
            }
            if q.x < 0 {
                contact |= 0x08;
            }
            contact
        }

        self.quadrants.iter().tuple_windows().all(|(a, b)| {
            let contact1 = face_contact(&a.quad);
            let contact2 = face_contact(&b.quad);
            if (contact1 & 0x05) != 0 && (contact1 & 0x0a) != 0 && contact1 == contact2 {
                // both quadrants are outside the same corner and may overlap
                true
            } else {
                a.quad < b.quad
                    && (!check_linearity || !a.quad.is_ancestor_of(&b.quad))
            }
        })
    }

    /// Exact binary search for a quadrant, by the quadrant order.
    pub fn bsearch(&self, q: &Quadrant) -> Option<usize> {
        self.quadrants
            .binary_search_by(|leaf| leaf.quad.cmp(q))
            .ok()
    }

    /// Index of the lowest leaf that is greater than or equal to `q`,
    /// bisecting from the given starting guess.
    pub fn find_lower_bound(&self, q: &Quadrant, guess: usize) -> Option<usize> {
        let count = self.quadrants.len();
        if count == 0 {
            return None;
        }
        let mut quad_low = 0usize;
        let mut quad_high = count - 1;
        let mut guess = guess.min(quad_high);

        loop {
            debug_assert!(quad_low <= guess && guess <= quad_high);
            let cur = &self.quadrants[guess].quad;

            // guess is high enough but there is room below it
            if q <= cur && guess > 0 && *q <= self.quadrants[guess - 1].quad {
                quad_high = guess - 1;
                guess = (quad_low + quad_high + 1) / 2;
                continue;
            }

            // guess is too low
            if q > cur {
                quad_low = guess + 1;
                if quad_low > quad_high {
                    return None;
                }
                guess = (quad_low + quad_high) / 2;
                continue;
            }

            return Some(guess);
        }
    }

    /// Index of the highest leaf that is less than or equal to `q`,
    /// bisecting from the given starting guess.
    pub fn find_higher_bound(&self, q: &Quadrant, guess: usize) -> Option<usize> {
        let count = self.quadrants.len();
        if count == 0 {
            return None;
        }
        let mut quad_low = 0usize;
        let mut quad_high = count - 1;
        let mut guess = guess.min(quad_high);

        loop {
            debug_assert!(quad_low <= guess && guess <= quad_high);
            let cur = &self.quadrants[guess].quad;

            // guess is low enough but there is room above it
            if *cur <= *q && guess < count - 1 && self.quadrants[guess + 1].quad <= *q {
                quad_low = guess + 1;
                guess = (quad_low + quad_high) / 2;
                continue;
            }

            // guess is too high
            if *cur > *q {
                if guess == 0 {
                    return None;
                }
                quad_high = guess - 1;
                if quad_high < quad_low {
                    return None;
                }
                guess = (quad_low + quad_high + 1) / 2;
                continue;
            }

            return Some(guess);
        }
    }

    /// Append the big-endian `(x, y, level)` words of every leaf starting at
    /// the given index, for the forest checksum.
    pub fn checksum_bytes(&self, first_quadrant: usize, out: &mut Vec<u8>) {
        for leaf in &self.quadrants[first_quadrant..] {
            out.extend_from_slice(&(leaf.quad.x as u32).to_be_bytes());
            out.extend_from_slice(&(leaf.quad.y as u32).to_be_bytes());
            out.extend_from_slice(&(leaf.quad.level as u32).to_be_bytes());
        }
    }

}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::MAXLEVEL;

    fn tree_of(quads: &[Quadrant]) -> Tree {
        let mut tree = Tree::new();
        for &q in quads {
            tree.push(Leaf::new(q));
        }
        tree
    }

    #[test]
    fn test_predicates_on_uniform_level() {
        let quads: Vec<Quadrant> =
            (0..16).map(|id| Quadrant::from_morton(2, id)).collect();
        let tree = tree_of(&quads);
        assert!(tree.is_sorted());
        assert!(tree.is_linear());
        assert!(tree.is_complete());
        assert!(tree.counters_consistent());
        assert_eq!(tree.quadrants_per_level[2], 16);
        assert_eq!(tree.maxlevel, 2);
    }

    #[test]
    fn test_sorted_but_not_linear() {
        let root = Quadrant::root();
        let child = root.children()[0];
        let tree = tree_of(&[root, child]);
        assert!(tree.is_sorted());
        assert!(!tree.is_linear());
    }

    #[test]
    fn test_complete_implies_linear_implies_sorted() {
        let root = Quadrant::root();
        let [c0, c1, c2, c3] = root.children();
        let [g0, g1, g2, g3] = c1.children();
        let tree = tree_of(&[c0, g0, g1, g2, g3, c2, c3]);
        assert!(tree.is_complete());
        assert!(tree.is_linear());
        assert!(tree.is_sorted());
    }

    #[test]
    fn test_almost_sorted_allows_corner_overlap() {
        // two quadrants of different size outside the same root corner
        let big = Quadrant::at_corner(2, 0, false);
        let small = Quadrant::at_corner(5, 0, false);
        let inside = Quadrant::root().children()[0];
        let tree = tree_of(&[inside, big, small]);
        assert!(tree.is_almost_sorted(true));
    }

    #[test]
    fn test_find_bounds() {
        let quads: Vec<Quadrant> =
            (0..64).map(|id| Quadrant::from_morton(3, id)).collect();
        let tree = tree_of(&quads);
        for (index, q) in quads.iter().enumerate() {
            for guess in [0usize, 31, 63] {
                assert_eq!(tree.find_lower_bound(q, guess), Some(index));
                assert_eq!(tree.find_higher_bound(q, guess), Some(index));
            }
        }

        // a point below everything has no higher bound and vice versa
        let first = quads[0];
        let beyond = quads[63].last_descendant(MAXLEVEL);
        assert_eq!(tree.find_higher_bound(&first.first_descendant(4), 10), Some(0));
        assert_eq!(tree.find_lower_bound(&beyond, 10), None);
    }

    #[test]
    fn test_find_bounds_between_leaves() {
        // leaves at level 2 but only every other one
        let quads: Vec<Quadrant> = (0..16)
            .filter(|id| id % 2 == 0)
            .map(|id| Quadrant::from_morton(2, id))
            .collect();
        let tree = tree_of(&quads);
        let missing = Quadrant::from_morton(2, 3);
        // lowest leaf >= missing is the one with id 4
        assert_eq!(tree.find_lower_bound(&missing, 4), Some(2));
        // highest leaf <= missing is the one with id 2
        assert_eq!(tree.find_higher_bound(&missing, 4), Some(1));
    }

    #[test]
    fn test_recount() {
        let root = Quadrant::root();
        let mut tree = tree_of(&root.children());
        tree.quadrants.pop();
        assert!(!tree.counters_consistent());
        tree.recount();
        assert!(tree.counters_consistent());
        assert_eq!(tree.quadrants_per_level[1], 3);
    }
}
