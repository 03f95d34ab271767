//! The coarse mesh topology.
//!
//! A connectivity describes how the trees of a forest fit together: which
//! vertex sits at each tree corner, which tree lies across each face and
//! with what orientation, and which trees meet at each vertex. It is
//! immutable during a forest session and identical on all processes.
//!
//! Faces are numbered 0 = -y, 1 = +x, 2 = +y, 3 = -x. Tree corners are
//! numbered counterclockwise `(0,0), (1,0), (1,1), (0,1)`; the
//! [CORNER_TO_ZORDER](crate::constants::CORNER_TO_ZORDER) permutation maps
//! them to z-order child positions.

use std::fmt;
use std::path::Path;

use thiserror::Error;

use crate::comm::Communicator;
use crate::constants::NFACES;
use crate::types::TreeIndex;

/// One tree incident to a vertex, with the corner it touches it at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CornerInfo {
    /// The neighbor tree.
    pub ntree: TreeIndex,
    /// The corner of the neighbor tree at the shared vertex.
    pub ncorner: usize,
}

/// The immutable coarse mesh tables.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Connectivity {
    /// Number of trees.
    pub num_trees: TreeIndex,
    /// Number of mesh vertices.
    pub num_vertices: TreeIndex,
    /// Vertex at each tree corner, `4 * num_trees` entries in corner order.
    pub tree_to_vertex: Vec<TreeIndex>,
    /// Tree across each tree face, the tree itself on the boundary.
    pub tree_to_tree: Vec<TreeIndex>,
    /// Face seen by the neighbor in the low two bits, orientation in bit 2.
    pub tree_to_face: Vec<i8>,
    /// Vertex coordinates, `3 * num_vertices` entries.
    pub vertices: Vec<f64>,
    /// Offsets into [Connectivity::vertex_to_tree], `num_vertices + 1`
    /// entries.
    pub vtt_offset: Vec<TreeIndex>,
    /// Trees meeting at each vertex.
    pub vertex_to_tree: Vec<TreeIndex>,
    /// Vertex images at each vertex, sharing the offsets of
    /// [Connectivity::vertex_to_tree].
    pub vertex_to_vertex: Vec<TreeIndex>,
}

/// Failure to read a connectivity file. The only recoverable error in the
/// crate; every other misuse aborts.
#[derive(Debug, Error)]
pub enum ConnectivityError {
    /// The file could not be read.
    #[error("reading connectivity: {0}")]
    Io(#[from] std::io::Error),
    /// A section header is missing or out of order.
    #[error("line {line}: expected section [{expected}]")]
    MissingSection {
        /// Line at which the section was expected.
        line: usize,
        /// Name of the expected section.
        expected: &'static str,
    },
    /// A content line does not have the expected shape.
    #[error("line {line}: {message}")]
    Malformed {
        /// Offending line.
        line: usize,
        /// What was wrong with it.
        message: String,
    },
    /// An index does not fit the declared counts.
    #[error("line {line}: index out of range")]
    IndexOutOfRange {
        /// Offending line.
        line: usize,
    },
}

impl Connectivity {
    /// The face transform to apply after translating a quadrant across the
    /// given face of the given tree, one of the eight square symmetries.
    pub fn face_transform(&self, tree: TreeIndex, face: usize) -> u8 {
        assert!(face < NFACES);
        let ttf = self.tree_to_face[NFACES * tree as usize + face];
        let nface = (ttf & 0x03) as usize;
        let reversed = ttf & 0x04 != 0;
        if reversed {
            4 + ((nface + face) % 4) as u8
        } else {
            ((nface + 6 - face) % 4) as u8
        }
    }

    /// The trees meeting at the given corner's vertex, each with its own
    /// corner number, excluding the querying tree itself.
    pub fn corner_info(&self, tree: TreeIndex, corner: usize) -> Vec<CornerInfo> {
        assert!(corner < 4);
        let vertex = self.tree_to_vertex[NFACES * tree as usize + corner];
        let lo = self.vtt_offset[vertex as usize] as usize;
        let hi = self.vtt_offset[vertex as usize + 1] as usize;

        self.vertex_to_tree[lo..hi]
            .iter()
            .filter(|&&ntree| ntree != tree)
            .map(|&ntree| {
                let ncorner = (0..4)
                    .find(|&c| self.tree_to_vertex[NFACES * ntree as usize + c] == vertex)
                    .expect("vertex-to-tree entry without matching tree corner");
                CornerInfo { ntree, ncorner }
            })
            .collect()
    }

    /// Check the structural invariants of the tables.
    pub fn is_valid(&self) -> bool {
        let num_trees = self.num_trees as usize;
        let num_vertices = self.num_vertices as usize;
        if self.tree_to_vertex.len() != NFACES * num_trees
            || self.tree_to_tree.len() != NFACES * num_trees
            || self.tree_to_face.len() != NFACES * num_trees
            || self.vertices.len() != 3 * num_vertices
            || self.vtt_offset.len() != num_vertices + 1
            || self.vertex_to_tree.len() != self.vertex_to_vertex.len()
        {
            return false;
        }
        if self.vtt_offset[0] != 0
            || *self.vtt_offset.last().unwrap() as usize != self.vertex_to_tree.len()
        {
            return false;
        }
        for window in self.vtt_offset.windows(2) {
            if window[0] > window[1] {
                return false;
            }
        }
        for &vertex in &self.tree_to_vertex {
            if !(0..self.num_vertices).contains(&vertex) {
                return false;
            }
        }
        for &tree in self.tree_to_tree.iter().chain(&self.vertex_to_tree) {
            if !(0..self.num_trees).contains(&tree) {
                return false;
            }
        }
        // faces are reciprocal, with matching orientation
        for tree in 0..num_trees {
            for face in 0..NFACES {
                let ttf = self.tree_to_face[NFACES * tree + face];
                if !(0..8).contains(&ttf) {
                    return false;
                }
                let ntree = self.tree_to_tree[NFACES * tree + face] as usize;
                let nface = (ttf & 0x03) as usize;
                let back = self.tree_to_face[NFACES * ntree + nface];
                if self.tree_to_tree[NFACES * ntree + nface] as usize != tree
                    || (back & 0x03) as usize != face
                    || (back & 0x04) != (ttf & 0x04)
                {
                    return false;
                }
            }
        }
        true
    }

    /// Read a connectivity from a file in the plain-text mesh format.
    pub fn read(path: impl AsRef<Path>) -> Result<Connectivity, ConnectivityError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse a connectivity from the plain-text mesh format.
    ///
    /// The format consists of bracketed sections in fixed order with
    /// whitespace-delimited numeric tokens, one-based indices and `#`
    /// comments running to the end of the line.
    pub fn parse(contents: &str) -> Result<Connectivity, ConnectivityError> {
        let mut parser = Parser::new(contents);

        parser.expect_section("Forest Info")?;
        let info = parser.read_key_values()?;
        let num_trees = info.get_count("Nk")?;
        let num_vertices = info.get_count("Nv")?;
        let num_vtt = info.get_count("Nve")?;
        for tag_key in ["Net", "Nft", "Ncf", "Nct"] {
            if info.get_count(tag_key).unwrap_or(0) > 0 {
                log::warn!("connectivity: {} > 0, tags are not retained", tag_key);
            }
        }

        parser.expect_section("Coordinates of Element Vertices")?;
        let mut vertices = Vec::with_capacity(3 * num_vertices);
        for row in 0..num_vertices {
            let (line, tokens) = parser.read_row()?;
            if tokens.len() != 4 {
                return Err(ConnectivityError::Malformed {
                    line,
                    message: "expected a vertex index and three coordinates".into(),
                });
            }
            parser.check_index(&tokens[0], row, line)?;
            for token in &tokens[1..] {
                vertices.push(parse_f64(token, line)?);
            }
        }

        let tree_to_vertex =
            parser.read_index_table("Element to Vertex", num_trees, num_vertices)?;
        let tree_to_tree =
            parser.read_index_table("Element to Element", num_trees, num_trees)?;

        parser.expect_section("Element to Face")?;
        let mut tree_to_face = Vec::with_capacity(NFACES * num_trees);
        for row in 0..num_trees {
            let (line, tokens) = parser.read_row()?;
            if tokens.len() != 1 + NFACES {
                return Err(ConnectivityError::Malformed {
                    line,
                    message: format!("expected {} face entries", NFACES),
                });
            }
            parser.check_index(&tokens[0], row, line)?;
            for token in &tokens[1..] {
                let face = parse_i64(token, line)? - 1;
                if !(0..8).contains(&face) {
                    return Err(ConnectivityError::IndexOutOfRange { line });
                }
                tree_to_face.push(face as i8);
            }
        }

        parser.expect_section("Vertex to Element")?;
        let (vtt_offset, vertex_to_tree) =
            parser.read_adjacency(num_vertices, num_trees)?;
        if vertex_to_tree.len() != num_vtt {
            return Err(ConnectivityError::Malformed {
                line: parser.line(),
                message: format!(
                    "vertex-to-element entries {} do not match Nve {}",
                    vertex_to_tree.len(),
                    num_vtt
                ),
            });
        }

        parser.expect_section("Vertex to Vertex")?;
        let (vtv_offset, vertex_to_vertex) =
            parser.read_adjacency(num_vertices, num_vertices)?;
        if vtv_offset != vtt_offset {
            return Err(ConnectivityError::Malformed {
                line: parser.line(),
                message: "vertex-to-vertex counts differ from vertex-to-element".into(),
            });
        }

        for section in ["Element Tags", "Face Tags", "Curved Faces", "Curved Types"] {
            parser.expect_section(section)?;
            parser.skip_section_body();
        }

        let connectivity = Connectivity {
            num_trees: num_trees as TreeIndex,
            num_vertices: num_vertices as TreeIndex,
            tree_to_vertex,
            tree_to_tree,
            tree_to_face,
            vertices,
            vtt_offset,
            vertex_to_tree,
            vertex_to_vertex,
        };
        if !connectivity.is_valid() {
            return Err(ConnectivityError::Malformed {
                line: parser.line(),
                message: "tables are inconsistent".into(),
            });
        }
        Ok(connectivity)
    }

    /// Ship the root's connectivity to all processes.
    pub fn broadcast<C: Communicator>(
        comm: &C,
        root: usize,
        connectivity: Option<Connectivity>,
    ) -> Connectivity {
        let mut conn = if comm.rank() == root {
            connectivity.expect("root must supply the connectivity")
        } else {
            Connectivity::default()
        };
        let mut counts = [conn.num_trees, conn.num_vertices];
        comm.broadcast_value(root, &mut counts);
        conn.num_trees = counts[0];
        conn.num_vertices = counts[1];
        comm.broadcast_vec(root, &mut conn.tree_to_vertex);
        comm.broadcast_vec(root, &mut conn.tree_to_tree);
        comm.broadcast_vec(root, &mut conn.tree_to_face);
        comm.broadcast_vec(root, &mut conn.vertices);
        comm.broadcast_vec(root, &mut conn.vtt_offset);
        comm.broadcast_vec(root, &mut conn.vertex_to_tree);
        comm.broadcast_vec(root, &mut conn.vertex_to_vertex);
        debug_assert!(conn.is_valid());
        conn
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "connectivity with {} trees and {} vertices",
            self.num_trees, self.num_vertices
        )?;
        for tree in 0..self.num_trees as usize {
            writeln!(
                f,
                "tree {}: vertices {:?} neighbors {:?} faces {:?}",
                tree,
                &self.tree_to_vertex[NFACES * tree..NFACES * (tree + 1)],
                &self.tree_to_tree[NFACES * tree..NFACES * (tree + 1)],
                &self.tree_to_face[NFACES * tree..NFACES * (tree + 1)],
            )?;
        }
        Ok(())
    }
}

struct KeyValues(Vec<(String, String)>);

impl KeyValues {
    fn get_count(&self, key: &str) -> Result<usize, ConnectivityError> {
        let value = self
            .0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ConnectivityError::Malformed {
                line: 0,
                message: format!("missing header key {}", key),
            })?;
        value
            .parse::<usize>()
            .map_err(|_| ConnectivityError::Malformed {
                line: 0,
                message: format!("header key {} is not a count", key),
            })
    }
}

struct Parser<'a> {
    // comment-stripped, non-empty lines with their one-based numbers
    lines: Vec<(usize, &'a str)>,
    cursor: usize,
}

impl<'a> Parser<'a> {
    fn new(contents: &'a str) -> Self {
        let lines = contents
            .lines()
            .enumerate()
            .filter_map(|(index, raw)| {
                let stripped = match raw.find('#') {
                    Some(pos) => &raw[..pos],
                    None => raw,
                };
                let trimmed = stripped.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some((index + 1, trimmed))
                }
            })
            .collect();
        Self { lines, cursor: 0 }
    }

    fn line(&self) -> usize {
        self.lines
            .get(self.cursor.saturating_sub(1))
            .map_or(0, |&(line, _)| line)
    }

    fn peek(&self) -> Option<(usize, &'a str)> {
        self.lines.get(self.cursor).copied()
    }

    fn next(&mut self) -> Option<(usize, &'a str)> {
        let item = self.peek();
        if item.is_some() {
            self.cursor += 1;
        }
        item
    }

    fn expect_section(&mut self, name: &'static str) -> Result<(), ConnectivityError> {
        match self.next() {
            Some((line, text)) => {
                let is_header = text.starts_with('[')
                    && text.ends_with(']')
                    && text[1..text.len() - 1].trim() == name;
                if is_header {
                    Ok(())
                } else {
                    Err(ConnectivityError::MissingSection { line, expected: name })
                }
            }
            None => Err(ConnectivityError::MissingSection {
                line: self.line() + 1,
                expected: name,
            }),
        }
    }

    fn at_section(&self) -> bool {
        self.peek().is_some_and(|(_, text)| text.starts_with('['))
    }

    fn skip_section_body(&mut self) {
        while self.peek().is_some() && !self.at_section() {
            self.next();
        }
    }

    fn read_key_values(&mut self) -> Result<KeyValues, ConnectivityError> {
        let mut pairs = Vec::new();
        while let Some((line, text)) = self.peek() {
            if text.starts_with('[') {
                break;
            }
            self.next();
            let (key, value) =
                text.split_once('=').ok_or_else(|| ConnectivityError::Malformed {
                    line,
                    message: "expected key = value".into(),
                })?;
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(KeyValues(pairs))
    }

    fn read_row(&mut self) -> Result<(usize, Vec<&'a str>), ConnectivityError> {
        match self.next() {
            Some((line, text)) if !text.starts_with('[') => {
                Ok((line, text.split_whitespace().collect()))
            }
            Some((line, _)) => Err(ConnectivityError::Malformed {
                line,
                message: "section ended early".into(),
            }),
            None => Err(ConnectivityError::Malformed {
                line: self.line(),
                message: "unexpected end of file".into(),
            }),
        }
    }

    fn check_index(
        &self,
        token: &str,
        row: usize,
        line: usize,
    ) -> Result<(), ConnectivityError> {
        let index = parse_i64(token, line)?;
        if index != row as i64 + 1 {
            return Err(ConnectivityError::Malformed {
                line,
                message: format!("expected row index {}, found {}", row + 1, index),
            });
        }
        Ok(())
    }

    /// Read a section of `rows` rows with one leading index and four
    /// one-based entries below `bound` each.
    fn read_index_table(
        &mut self,
        section: &'static str,
        rows: usize,
        bound: usize,
    ) -> Result<Vec<TreeIndex>, ConnectivityError> {
        self.expect_section(section)?;
        let mut table = Vec::with_capacity(NFACES * rows);
        for row in 0..rows {
            let (line, tokens) = self.read_row()?;
            if tokens.len() != 1 + NFACES {
                return Err(ConnectivityError::Malformed {
                    line,
                    message: format!("expected {} entries", NFACES),
                });
            }
            self.check_index(&tokens[0], row, line)?;
            for token in &tokens[1..] {
                let index = parse_i64(token, line)? - 1;
                if !(0..bound as i64).contains(&index) {
                    return Err(ConnectivityError::IndexOutOfRange { line });
                }
                table.push(index as TreeIndex);
            }
        }
        Ok(table)
    }

    /// Read `rows` rows of the form `index count entries...`, returning the
    /// cumulative offsets and the concatenated zero-based entries.
    fn read_adjacency(
        &mut self,
        rows: usize,
        bound: usize,
    ) -> Result<(Vec<TreeIndex>, Vec<TreeIndex>), ConnectivityError> {
        let mut offsets = Vec::with_capacity(rows + 1);
        let mut entries = Vec::new();
        offsets.push(0);
        for row in 0..rows {
            let (line, tokens) = self.read_row()?;
            if tokens.len() < 2 {
                return Err(ConnectivityError::Malformed {
                    line,
                    message: "expected an index and a count".into(),
                });
            }
            self.check_index(&tokens[0], row, line)?;
            let count = parse_i64(&tokens[1], line)? as usize;
            if tokens.len() != 2 + count {
                return Err(ConnectivityError::Malformed {
                    line,
                    message: format!("expected {} entries", count),
                });
            }
            for token in &tokens[2..] {
                let index = parse_i64(token, line)? - 1;
                if !(0..bound as i64).contains(&index) {
                    return Err(ConnectivityError::IndexOutOfRange { line });
                }
                entries.push(index as TreeIndex);
            }
            offsets.push(entries.len() as TreeIndex);
        }
        Ok((offsets, entries))
    }
}

fn parse_i64(token: &str, line: usize) -> Result<i64, ConnectivityError> {
    token.parse::<i64>().map_err(|_| ConnectivityError::Malformed {
        line,
        message: format!("expected an integer, found {:?}", token),
    })
}

fn parse_f64(token: &str, line: usize) -> Result<f64, ConnectivityError> {
    token.parse::<f64>().map_err(|_| ConnectivityError::Malformed {
        line,
        message: format!("expected a number, found {:?}", token),
    })
}
