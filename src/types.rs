//! Index and coordinate types used throughout the crate.

use bytemuck::{Pod, Zeroable};

/// Integer coordinate of a quadrant corner inside a tree.
///
/// Coordinates of valid quadrants lie in `[0, ROOT_LEN)`. Extended quadrants
/// relax the range to represent images of neighbor-tree quadrants.
pub type Coord = i32;

/// Index of a tree inside a connectivity.
pub type TreeIndex = i32;

/// Count or index of quadrants local to one process.
pub type LocalIndex = i32;

/// Count or index of quadrants across all processes.
pub type GlobalIndex = i64;

/// The first quadrant assigned to a process, as a point at the deepest level.
///
/// An array of these, one per process plus a final sentinel
/// `(num_trees, 0, 0)`, describes the global partition of the forest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct GlobalPosition {
    /// Tree holding the first quadrant of the process.
    pub which_tree: TreeIndex,
    /// x coordinate of the first quadrant at the deepest level.
    pub x: Coord,
    /// y coordinate of the first quadrant at the deepest level.
    pub y: Coord,
}
