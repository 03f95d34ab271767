//! The quadrant algebra.
//!
//! A quadrant is an axis-aligned dyadic square inside a tree, identified by
//! the integer coordinates of its lower left corner and a refinement level.
//! The total order on quadrants is the Morton (z-)order with the level as
//! tie-breaker, so that a quadrant sorts directly before its descendants.
//!
//! Quadrants with coordinates outside `[0, ROOT_LEN)` are called *extended*
//! and represent images of neighbor-tree quadrants in the current tree's
//! coordinate frame. All routines accept extended quadrants unless stated
//! otherwise; none of them allocate.

use std::cmp::Ordering;

use crate::constants::{
    last_offset, log2_u32, quadrant_len, CORNER_TO_ZORDER, MAXLEVEL, ROOT_LEN,
};
use crate::types::Coord;

/// An axis-aligned dyadic square addressed by corner coordinates and level.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quadrant {
    /// x coordinate of the lower left corner, a multiple of the side length.
    pub x: Coord,
    /// y coordinate of the lower left corner, a multiple of the side length.
    pub y: Coord,
    /// Refinement level, between 0 and [MAXLEVEL].
    pub level: i8,
}

/// Offsets of the three indirect parent neighbors in units of the parent
/// size, indexed by the parent's child id. Neighbors are listed in z-order.
pub(crate) const INDIRECT_NEIGHBORS: [[[Coord; 2]; 3]; 4] = [
    [[-1, -1], [1, -1], [-1, 1]],
    [[0, -1], [2, -1], [1, 0]],
    [[-1, 0], [-2, 1], [0, 1]],
    [[1, -1], [-1, 1], [1, 1]],
];

/// Which indirect neighbor to omit when only faces are balanced,
/// indexed by the parent's child id.
pub(crate) const CORNERS_OMITTED: [usize; 4] = [0, 1, 1, 2];

/// Steps towards each z-order corner in units of the quadrant size.
const ZCORNER_STEPS: [[Coord; 2]; 4] = [[-1, -1], [1, -1], [-1, 1], [1, 1]];

fn rebias(coord: Coord) -> i64 {
    // Signed coordinates compare as if shifted into [0, 4 * ROOT_LEN).
    coord as i64
        + if coord < 0 {
            1i64 << (MAXLEVEL as u32 + 2)
        } else {
            0
        }
}

impl Quadrant {
    /// Create a quadrant from coordinates and level.
    pub fn new(x: Coord, y: Coord, level: i8) -> Self {
        let q = Self { x, y, level };
        debug_assert!(q.is_extended());
        q
    }

    /// The quadrant covering the whole tree.
    pub fn root() -> Self {
        Self { x: 0, y: 0, level: 0 }
    }

    /// True if the quadrant lies inside the root tree.
    pub fn is_inside(&self) -> bool {
        (0..ROOT_LEN).contains(&self.x) && (0..ROOT_LEN).contains(&self.y)
    }

    /// True if the quadrant is inside the root tree with aligned coordinates.
    pub fn is_valid(&self) -> bool {
        self.is_extended() && self.is_inside()
    }

    /// True if the level is in range and the coordinates are aligned.
    ///
    /// Extended quadrants may lie outside the root tree.
    pub fn is_extended(&self) -> bool {
        (0..=MAXLEVEL).contains(&self.level)
            && (self.x & (quadrant_len(self.level) - 1)) == 0
            && (self.y & (quadrant_len(self.level) - 1)) == 0
    }

    /// The child id of the quadrant within its parent, in z-order.
    pub fn child_id(&self) -> usize {
        debug_assert!(self.is_extended());
        if self.level == 0 {
            return 0;
        }
        let len = quadrant_len(self.level);
        let mut id = 0;
        if self.x & len != 0 {
            id |= 0x01;
        }
        if self.y & len != 0 {
            id |= 0x02;
        }
        id
    }

    /// True if both quadrants are distinct children of the same parent.
    pub fn is_sibling(&self, other: &Quadrant) -> bool {
        debug_assert!(self.is_extended() && other.is_extended());
        if self.level == 0 {
            return false;
        }
        let exclorx = self.x ^ other.x;
        let exclory = self.y ^ other.y;
        if exclorx == 0 && exclory == 0 {
            return false;
        }
        let len = quadrant_len(self.level);
        self.level == other.level && (exclorx & !len) == 0 && (exclory & !len) == 0
    }

    /// True if the four quadrants are the children of one parent, in z-order.
    pub fn is_family(q0: &Quadrant, q1: &Quadrant, q2: &Quadrant, q3: &Quadrant) -> bool {
        debug_assert!(q0.is_extended() && q1.is_extended());
        debug_assert!(q2.is_extended() && q3.is_extended());
        if q0.level == 0
            || q0.level != q1.level
            || q0.level != q2.level
            || q0.level != q3.level
        {
            return false;
        }
        let inc = quadrant_len(q0.level);
        (q0.x + inc == q1.x && q0.y == q1.y)
            && (q0.x == q2.x && q0.y + inc == q2.y)
            && (q1.x == q3.x && q2.y == q3.y)
    }

    /// True if `self` is the parent of `r`.
    pub fn is_parent_of(&self, r: &Quadrant) -> bool {
        debug_assert!(self.is_extended() && r.is_extended());
        self.level + 1 == r.level
            && self.x == (r.x & !quadrant_len(r.level))
            && self.y == (r.y & !quadrant_len(r.level))
    }

    /// True if `self` strictly contains `r`.
    pub fn is_ancestor_of(&self, r: &Quadrant) -> bool {
        debug_assert!(self.is_extended() && r.is_extended());
        if self.level >= r.level {
            return false;
        }
        let shift = (MAXLEVEL - self.level) as u32;
        ((self.x ^ r.x) >> shift) == 0 && ((self.y ^ r.y) >> shift) == 0
    }

    /// True if `r` is the Morton successor of `self` at the coarser of the
    /// two levels.
    pub fn is_next(&self, r: &Quadrant) -> bool {
        debug_assert!(self.is_extended() && r.is_extended());
        let minlevel = if self.level > r.level {
            // self must be the last child up to the common level
            let mask = quadrant_len(r.level) - quadrant_len(self.level);
            if (self.x & mask) != mask || (self.y & mask) != mask {
                return false;
            }
            r.level
        } else {
            self.level
        };
        self.linear_id(minlevel) + 1 == r.linear_id(minlevel)
    }

    /// The parent of the quadrant. The level must be positive.
    pub fn parent(&self) -> Quadrant {
        debug_assert!(self.is_extended());
        assert!(self.level > 0);
        let r = Quadrant {
            x: self.x & !quadrant_len(self.level),
            y: self.y & !quadrant_len(self.level),
            level: self.level - 1,
        };
        debug_assert!(r.is_extended());
        r
    }

    /// The sibling of the quadrant with the given child id.
    pub fn sibling(&self, sibling_id: usize) -> Quadrant {
        debug_assert!(self.is_extended());
        assert!(self.level > 0);
        assert!(sibling_id < 4);
        let shift = quadrant_len(self.level);
        let addx = sibling_id & 0x01 != 0;
        let addy = sibling_id & 0x02 != 0;
        Quadrant {
            x: if addx { self.x | shift } else { self.x & !shift },
            y: if addy { self.y | shift } else { self.y & !shift },
            level: self.level,
        }
    }

    /// The four children of the quadrant, in z-order.
    pub fn children(&self) -> [Quadrant; 4] {
        debug_assert!(self.is_extended());
        assert!(self.level < MAXLEVEL);
        let level = self.level + 1;
        let len = quadrant_len(level);
        [
            Quadrant { x: self.x, y: self.y, level },
            Quadrant { x: self.x | len, y: self.y, level },
            Quadrant { x: self.x, y: self.y | len, level },
            Quadrant { x: self.x | len, y: self.y | len, level },
        ]
    }

    /// The Morton-least descendant of the quadrant at the given level.
    pub fn first_descendant(&self, level: i8) -> Quadrant {
        debug_assert!(self.is_extended());
        debug_assert!(self.level <= level && level <= MAXLEVEL);
        Quadrant { x: self.x, y: self.y, level }
    }

    /// The Morton-greatest descendant of the quadrant at the given level.
    pub fn last_descendant(&self, level: i8) -> Quadrant {
        debug_assert!(self.is_extended());
        debug_assert!(self.level <= level && level <= MAXLEVEL);
        let shift = quadrant_len(self.level) - quadrant_len(level);
        Quadrant { x: self.x + shift, y: self.y + shift, level }
    }

    /// The deepest quadrant containing both `self` and `other`.
    pub fn nearest_common_ancestor(&self, other: &Quadrant) -> Quadrant {
        debug_assert!(self.is_extended() && other.is_extended());
        let exclorx = (self.x ^ other.x) as u32;
        let exclory = (self.y ^ other.y) as u32;
        let maxclor = exclorx | exclory;
        let maxlevel = log2_u32(maxclor) + 1;
        assert!(maxlevel <= MAXLEVEL as i32);

        let mask = !((1 << maxlevel as u32) - 1);
        let r = Quadrant {
            x: self.x & mask,
            y: self.y & mask,
            level: (MAXLEVEL as i32 - maxlevel)
                .min(self.level.min(other.level) as i32) as i8,
        };
        debug_assert!(r.is_extended());
        r
    }

    /// The Morton index of the quadrant among all quadrants of the given
    /// level. The level must not exceed the quadrant's own level.
    ///
    /// The index interleaves the y bits into the odd positions and covers
    /// three extra bit pairs so that extended coordinates survive the
    /// round trip through [Quadrant::from_morton].
    pub fn linear_id(&self, level: i8) -> u64 {
        debug_assert!(self.is_extended());
        debug_assert!((0..=self.level).contains(&level));
        // sign extension keeps the high bits of negative coordinates
        let x = (self.x >> (MAXLEVEL - level) as u32) as u64;
        let y = (self.y >> (MAXLEVEL - level) as u32) as u64;
        let mut id: u64 = 0;
        for i in 0..(level as u64 + 3) {
            id |= (x & (1 << i)) << i;
            id |= (y & (1 << i)) << (i + 1);
        }
        id
    }

    /// The quadrant of the given level with the given Morton index.
    /// Inverse of [Quadrant::linear_id] at the quadrant's own level.
    pub fn from_morton(level: i8, id: u64) -> Quadrant {
        assert!((0..=MAXLEVEL).contains(&level));
        if level < MAXLEVEL {
            debug_assert!(id < 1 << (2 * (level as u64 + 3)));
        }
        let mut x: u32 = 0;
        let mut y: u32 = 0;
        // this may set the sign bit to create negative coordinates
        for i in 0..(level as u64 + 3) {
            x |= ((id & (1 << (2 * i))) >> i) as u32;
            y |= ((id & (1 << (2 * i + 1))) >> (i + 1)) as u32;
        }
        let shift = (MAXLEVEL - level) as u32;
        let q = Quadrant {
            x: (x << shift) as Coord,
            y: (y << shift) as Coord,
            level,
        };
        debug_assert!(q.is_extended());
        q
    }

    /// The quadrant of the given level touching the z-order corner of the
    /// root tree, either just inside or just outside of it.
    pub fn at_corner(level: i8, zcorner: usize, inside: bool) -> Quadrant {
        assert!((0..=MAXLEVEL).contains(&level));
        assert!(zcorner < 4);
        let lshift = if inside { 0 } else { -quadrant_len(level) };
        let rshift = if inside { last_offset(level) } else { ROOT_LEN };
        let (x, y) = match zcorner {
            0 => (lshift, lshift),
            1 => (rshift, lshift),
            2 => (lshift, rshift),
            _ => (rshift, rshift),
        };
        Quadrant { x, y, level }
    }

    /// Walk from the quadrant towards a z-order corner of the root tree.
    ///
    /// Returns the deepest level, at least `level`, at which the quadrant
    /// remains the corner-local quadrant without leaving the tree.
    pub fn corner_level(&self, zcorner: usize, level: i8) -> i8 {
        debug_assert!(self.is_valid());
        assert!(zcorner < 4);
        assert!((0..=MAXLEVEL).contains(&level));
        let stepx = ZCORNER_STEPS[zcorner][0];
        let stepy = ZCORNER_STEPS[zcorner][1];

        let mut quad = *self;
        while quad.level > level {
            let th = last_offset(quad.level);
            let sibling = quad.sibling(zcorner);
            let at_corner = match zcorner {
                0 => sibling.x <= 0 && sibling.y <= 0,
                1 => sibling.x >= th && sibling.y <= 0,
                2 => sibling.x <= 0 && sibling.y >= th,
                _ => sibling.x >= th && sibling.y >= th,
            };
            if at_corner {
                return quad.level;
            }
            quad = quad.parent();
            quad.x += stepx * quadrant_len(quad.level);
            quad.y += stepy * quadrant_len(quad.level);
            debug_assert!(quad.is_extended());
        }
        level
    }

    /// Shift the quadrant across a face of the root tree into the frame of
    /// an aligned neighbor tree on the other side.
    pub fn translated(&self, face: usize) -> Quadrant {
        debug_assert!(self.is_extended());
        let mut r = *self;
        match face {
            0 => r.y += ROOT_LEN,
            1 => r.x -= ROOT_LEN,
            2 => r.y -= ROOT_LEN,
            3 => r.x += ROOT_LEN,
            _ => unreachable!("face out of range"),
        }
        debug_assert!(r.is_extended());
        r
    }

    /// Apply one of the eight symmetries of the square used when crossing a
    /// face into a rotated or mirrored neighbor tree.
    pub fn transformed(&self, transform: u8) -> Quadrant {
        debug_assert!(self.is_extended());
        let th = last_offset(self.level);
        let (x, y) = match transform {
            0 => (self.x, self.y),               // identity
            1 => (th - self.y, self.x),          // rotate -90 degrees
            2 => (th - self.x, th - self.y),     // rotate 180 degrees
            3 => (self.y, th - self.x),          // rotate 90 degrees
            4 => (self.x, th - self.y),          // mirror across 0 degree axis
            5 => (self.y, self.x),               // mirror across 45 degree axis
            6 => (th - self.x, self.y),          // mirror across 90 degree axis
            7 => (th - self.y, th - self.x),     // mirror across 135 degree axis
            _ => unreachable!("transform out of range"),
        };
        let r = Quadrant { x, y, level: self.level };
        debug_assert!(r.is_extended());
        r
    }

    /// The transform undoing the given transform.
    pub fn transform_inverse(transform: u8) -> u8 {
        match transform {
            1 => 3,
            3 => 1,
            t => t,
        }
    }

    /// Map a user corner number through a face transform.
    pub fn node_transform(node: usize, transform: u8) -> usize {
        assert!(node < 4);
        match transform {
            0 => node,
            1 => CORNER_TO_ZORDER[(CORNER_TO_ZORDER[node] + 1) % 4],
            2 => 3 - node,
            3 => CORNER_TO_ZORDER[(CORNER_TO_ZORDER[node] + 3) % 4],
            4 => [2, 3, 0, 1][node],
            5 => [0, 2, 1, 3][node],
            6 => [1, 0, 3, 2][node],
            7 => [3, 1, 2, 0][node],
            _ => unreachable!("transform out of range"),
        }
    }
}

impl Default for Quadrant {
    fn default() -> Self {
        Quadrant::root()
    }
}

impl Ord for Quadrant {
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert!(self.is_extended() && other.is_extended());
        let exclorx = (self.x ^ other.x) as u32;
        let exclory = (self.y ^ other.y) as u32;

        if exclorx == 0 && exclory == 0 {
            self.level.cmp(&other.level)
        } else if log2_u32(exclory) >= log2_u32(exclorx) {
            rebias(self.y).cmp(&rebias(other.y))
        } else {
            rebias(self.x).cmp(&rebias(other.x))
        }
    }
}

impl PartialOrd for Quadrant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for Quadrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x {:#x} y {:#x} level {}", self.x, self.y, self.level)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Slow reference versions of the fast bit-twiddling predicates.
    /// They must agree with the fast versions on all extended quadrants.
    mod slow {
        use super::super::*;

        pub fn is_sibling(q1: &Quadrant, q2: &Quadrant) -> bool {
            if q1.level == 0 || q2.level == 0 {
                return false;
            }
            if q1 == q2 {
                return false;
            }
            q1.level == q2.level && q1.parent() == q2.parent()
        }

        pub fn is_parent_of(q: &Quadrant, r: &Quadrant) -> bool {
            if r.level == 0 {
                return false;
            }
            *q == r.parent()
        }

        pub fn is_ancestor_of(q: &Quadrant, r: &Quadrant) -> bool {
            if q == r {
                return false;
            }
            *q == nearest_common_ancestor(q, r)
        }

        pub fn nearest_common_ancestor(q1: &Quadrant, q2: &Quadrant) -> Quadrant {
            let mut s1 = *q1;
            let mut s2 = *q2;
            while s1.level > s2.level {
                s1 = s1.parent();
            }
            while s1.level < s2.level {
                s2 = s2.parent();
            }
            while s1 != s2 {
                s1 = s1.parent();
                s2 = s2.parent();
            }
            s1
        }

        pub fn is_next(q: &Quadrant, r: &Quadrant) -> bool {
            if q >= r {
                return false;
            }
            let mut a = *q;
            while a.level > r.level {
                if a.child_id() != 3 {
                    return false;
                }
                a = a.parent();
            }
            a.linear_id(a.level) + 1 == r.linear_id(a.level)
        }
    }

    fn random_valid(rng: &mut ChaCha8Rng, max_level: i8) -> Quadrant {
        let level = rng.gen_range(0..=max_level);
        let cells = 1i64 << level;
        let len = quadrant_len(level);
        Quadrant {
            x: (rng.gen_range(0..cells) as Coord) * len,
            y: (rng.gen_range(0..cells) as Coord) * len,
            level,
        }
    }

    fn random_extended(rng: &mut ChaCha8Rng, max_level: i8) -> Quadrant {
        let level = rng.gen_range(0..=max_level);
        let cells = 1i64 << level;
        let len = quadrant_len(level);
        Quadrant {
            x: (rng.gen_range(-cells..2 * cells) as Coord) * len,
            y: (rng.gen_range(-cells..2 * cells) as Coord) * len,
            level,
        }
    }

    #[test]
    fn test_children_parent_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..1000 {
            let q = random_extended(&mut rng, MAXLEVEL - 1);
            let children = q.children();
            for (id, child) in children.iter().enumerate() {
                assert_eq!(child.parent(), q);
                assert_eq!(child.child_id(), id);
                assert!(q.is_parent_of(child));
                assert!(q.is_ancestor_of(child));
            }
            assert!(Quadrant::is_family(
                &children[0],
                &children[1],
                &children[2],
                &children[3]
            ));
        }
    }

    #[test]
    fn test_family_in_zorder_only() {
        let q = Quadrant::root();
        let [c0, c1, c2, c3] = q.children();
        assert!(Quadrant::is_family(&c0, &c1, &c2, &c3));
        assert!(!Quadrant::is_family(&c0, &c2, &c1, &c3));
        assert!(!Quadrant::is_family(&c0, &c1, &c2, &c2));
    }

    #[test]
    fn test_sibling() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1000 {
            let q = random_extended(&mut rng, 12);
            if q.level == 0 {
                continue;
            }
            for id in 0..4 {
                let s = q.sibling(id);
                assert_eq!(s.child_id(), id);
                assert_eq!(q.is_sibling(&s), slow::is_sibling(&q, &s));
            }
        }
    }

    #[test]
    fn test_predicates_agree_with_slow_versions() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for _ in 0..2000 {
            // small levels so that random pairs are actually related sometimes
            let q1 = random_valid(&mut rng, 4);
            let q2 = random_valid(&mut rng, 4);
            assert_eq!(q1.is_sibling(&q2), slow::is_sibling(&q1, &q2));
            assert_eq!(q1.is_parent_of(&q2), slow::is_parent_of(&q1, &q2));
            assert_eq!(q1.is_ancestor_of(&q2), slow::is_ancestor_of(&q1, &q2));
            assert_eq!(q1.is_next(&q2), slow::is_next(&q1, &q2));
            assert_eq!(
                q1.nearest_common_ancestor(&q2),
                slow::nearest_common_ancestor(&q1, &q2)
            );
        }
    }

    #[test]
    fn test_nearest_common_ancestor_contains_both() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..1000 {
            let q1 = random_valid(&mut rng, 10);
            let q2 = random_valid(&mut rng, 10);
            let a = q1.nearest_common_ancestor(&q2);
            assert!(a == q1 || a.is_ancestor_of(&q1));
            assert!(a == q2 || a.is_ancestor_of(&q2));
            // no child of the ancestor contains both, so it is the deepest
            if a.level < MAXLEVEL {
                for child in a.children() {
                    let holds_q1 = child == q1 || child.is_ancestor_of(&q1);
                    let holds_q2 = child == q2 || child.is_ancestor_of(&q2);
                    assert!(!(holds_q1 && holds_q2));
                }
            }
        }
    }

    #[test]
    fn test_morton_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        for _ in 0..2000 {
            let q = random_extended(&mut rng, MAXLEVEL);
            let id = q.linear_id(q.level);
            assert_eq!(Quadrant::from_morton(q.level, id), q);
        }
    }

    #[test]
    fn test_morton_order_matches_compare() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..1000 {
            let level = rng.gen_range(0..=8i8);
            let q1 = random_valid(&mut rng, level).first_descendant(level);
            let q2 = random_valid(&mut rng, level).first_descendant(level);
            assert_eq!(
                q1.linear_id(level).cmp(&q2.linear_id(level)),
                q1.cmp(&q2)
            );
        }
    }

    #[test]
    fn test_compare_coarser_before_finer() {
        let q = Quadrant::new(0, 0, 3);
        let d = q.first_descendant(7);
        assert!(q < d);
        let last = q.last_descendant(7);
        assert!(q < last);
    }

    #[test]
    fn test_is_next_along_a_level() {
        let level = 4;
        for id in 0..(1u64 << (2 * level)) - 1 {
            let q = Quadrant::from_morton(level as i8, id);
            let r = Quadrant::from_morton(level as i8, id + 1);
            assert!(q.is_next(&r));
            assert!(!r.is_next(&q));
        }
    }

    #[test]
    fn test_descendants() {
        let q = Quadrant::new(0, 0, 2);
        let fd = q.first_descendant(MAXLEVEL);
        let ld = q.last_descendant(MAXLEVEL);
        assert_eq!((fd.x, fd.y), (q.x, q.y));
        assert_eq!(ld.x, q.x + quadrant_len(2) - 1);
        assert_eq!(ld.y, q.y + quadrant_len(2) - 1);
    }

    #[test]
    fn test_transform_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        for _ in 0..1000 {
            let q = random_extended(&mut rng, 10);
            for t in 0..8u8 {
                let r = q.transformed(t).transformed(Quadrant::transform_inverse(t));
                assert_eq!(r, q);
            }
        }
    }

    #[test]
    fn test_node_transform_roundtrip() {
        for t in 0..8u8 {
            let inv = Quadrant::transform_inverse(t);
            for node in 0..4 {
                assert_eq!(
                    Quadrant::node_transform(Quadrant::node_transform(node, t), inv),
                    node
                );
            }
        }
    }

    #[test]
    fn test_translate_roundtrip() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            let q = random_valid(&mut rng, 10);
            assert_eq!(q.translated(0).translated(2), q);
            assert_eq!(q.translated(1).translated(3), q);
        }
    }

    #[test]
    fn test_at_corner() {
        let inside = Quadrant::at_corner(3, 3, true);
        assert!(inside.is_valid());
        assert_eq!(inside.x, last_offset(3));
        assert_eq!(inside.y, last_offset(3));

        let outside = Quadrant::at_corner(3, 0, false);
        assert!(outside.is_extended() && !outside.is_inside());
        assert_eq!(outside.x, -quadrant_len(3));
        assert_eq!(outside.y, -quadrant_len(3));
    }

    #[test]
    fn test_corner_level() {
        // the corner-most quadrant stays corner-local all the way down
        let q = Quadrant::at_corner(5, 0, true);
        assert_eq!(q.corner_level(0, 0), 5);

        // a quadrant one step away from the corner stops early
        let off = Quadrant::new(quadrant_len(5), quadrant_len(5), 5);
        assert!(off.corner_level(0, 0) < 5);
    }

    #[test]
    fn test_debug_print() {
        let q = Quadrant::new(0, 0, 1).sibling(3);
        println!("{:?}", q);
    }
}
