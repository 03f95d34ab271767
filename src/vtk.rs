//! Export of the local forest leaves to a legacy VTK unstructured grid.

use vtkio;

use crate::comm::Communicator;
use crate::connectivity::Connectivity;
use crate::constants::{quadrant_len, NFACES, ROOT_LEN};
use crate::forest::Forest;
use crate::quadrant::Quadrant;
use crate::types::TreeIndex;

fn corner_vertex<'c>(
    conn: &'c Connectivity,
    which_tree: TreeIndex,
    corner: usize,
) -> &'c [f64] {
    let vertex = conn.tree_to_vertex[NFACES * which_tree as usize + corner] as usize;
    &conn.vertices[3 * vertex..3 * vertex + 3]
}

/// Physical position of a point of the tree, by bilinear interpolation of
/// the tree's corner vertices from reference coordinates in `[0, 1]`.
fn tree_to_physical(conn: &Connectivity, which_tree: TreeIndex, u: f64, v: f64) -> [f64; 3] {
    let v0 = corner_vertex(conn, which_tree, 0);
    let v1 = corner_vertex(conn, which_tree, 1);
    let v2 = corner_vertex(conn, which_tree, 2);
    let v3 = corner_vertex(conn, which_tree, 3);

    let mut point = [0.0; 3];
    for (d, value) in point.iter_mut().enumerate() {
        *value = (1.0 - u) * (1.0 - v) * v0[d]
            + u * (1.0 - v) * v1[d]
            + u * v * v2[d]
            + (1.0 - u) * v * v3[d];
    }
    point
}

/// The physical corners of a quadrant in counterclockwise order.
fn quadrant_corners(
    conn: &Connectivity,
    which_tree: TreeIndex,
    quad: &Quadrant,
) -> [[f64; 3]; 4] {
    let len = quadrant_len(quad.level);
    let u0 = quad.x as f64 / ROOT_LEN as f64;
    let v0 = quad.y as f64 / ROOT_LEN as f64;
    let u1 = (quad.x + len) as f64 / ROOT_LEN as f64;
    let v1 = (quad.y + len) as f64 / ROOT_LEN as f64;

    [
        tree_to_physical(conn, which_tree, u0, v0),
        tree_to_physical(conn, which_tree, u1, v0),
        tree_to_physical(conn, which_tree, u1, v1),
        tree_to_physical(conn, which_tree, u0, v1),
    ]
}

/// Write the local leaves of the forest as quadrilateral cells to
/// `file_path` in the legacy ASCII VTK format.
pub fn write_forest<C: Communicator>(forest: &Forest<'_, C>, file_path: &str) {
    use vtkio::model::*;

    let conn = forest.connectivity;
    let ncells = forest.local_num_quadrants as usize;

    // each cell has 4 corners with 3 coordinates each
    let mut points = Vec::<f64>::with_capacity(12 * ncells);
    let mut connectivity = Vec::<u64>::with_capacity(4 * ncells);
    let mut offsets = Vec::<u64>::with_capacity(ncells);

    // corner coordinates are emitted per cell; doubly counted points from
    // adjacent cells are fine for visualization
    let mut count = 0;
    let mut cell_index = 0;
    for which_tree in forest.local_trees() {
        let tree = &forest.trees[which_tree as usize];
        for leaf in &tree.quadrants {
            let corners = quadrant_corners(conn, which_tree, &leaf.quad);
            offsets.push(4 * (1 + cell_index) as u64);
            cell_index += 1;

            for corner in &corners {
                points.extend_from_slice(corner);
                connectivity.push(count);
                count += 1;
            }
        }
    }

    let vtk_file = vtkio::Vtk {
        version: Version::new((1, 0)),
        title: String::new(),
        byte_order: ByteOrder::LittleEndian,
        file_path: None,
        data: DataSet::inline(UnstructuredGridPiece {
            points: IOBuffer::F64(points),
            cells: Cells {
                cell_verts: VertexNumbers::XML { connectivity, offsets },
                types: vec![CellType::Quad; ncells],
            },
            data: Attributes {
                point: vec![],
                cell: vec![],
            },
        }),
    };

    vtk_file.export_ascii(file_path).unwrap();
}
