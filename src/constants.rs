//! Constants for quadrant coordinate arithmetic.

use crate::types::Coord;

/// The deepest allowed refinement level of a quadrant.
pub const MAXLEVEL: i8 = 29;

/// Number of refinement levels, including level zero.
pub const NLEVELS: usize = MAXLEVEL as usize + 1;

/// Number of children of a quadrant.
pub const NSIBLINGS: usize = 4;

/// Number of faces and corners of a quadrant.
pub const NFACES: usize = 4;

/// Side length of the root quadrant in integer coordinates.
pub const ROOT_LEN: Coord = 1 << MAXLEVEL;

/// Side length of a quadrant at the given level.
#[inline]
pub fn quadrant_len(level: i8) -> Coord {
    debug_assert!((0..=MAXLEVEL).contains(&level));
    1 << (MAXLEVEL - level)
}

/// Offset of the last quadrant of the given level inside the root.
#[inline]
pub fn last_offset(level: i8) -> Coord {
    ROOT_LEN - quadrant_len(level)
}

/// Permutation between the user corner numbering `(0,0),(1,0),(1,1),(0,1)`
/// and the z-order child numbering `(0,0),(1,0),(0,1),(1,1)`.
///
/// The permutation swaps entries 2 and 3 and is its own inverse.
pub const CORNER_TO_ZORDER: [usize; 4] = [0, 1, 3, 2];

/// Integer base-2 logarithm with `log2(0) == -1`.
#[inline]
pub fn log2_u32(value: u32) -> i32 {
    31 - value.leading_zeros() as i32
}
