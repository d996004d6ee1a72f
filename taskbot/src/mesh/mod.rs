//! Triangle meshes and the streaming mesh octree
//!
//! A displayed model is stored as a tree of [`MeshCell`] objects.  Only leaf
//! cells carry geometry; internal cells have exactly eight children, which
//! tile the parent's bounding box.  The tree is refined and collapsed over
//! time by the [`LodController`](crate::lod::LodController), based on how much
//! of the screen each leaf occupies.
//!
//! ```
//! use taskbot::mesh::{GeometrySource, Mesh, MeshCell};
//! use taskbot::region::BoundingBox;
//! use nalgebra::Vector3;
//!
//! let bounds = BoundingBox::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0));
//! let cell = MeshCell::new(
//!     bounds,
//!     Mesh::new(),
//!     GeometrySource::ExternalFile { path: "part.asdf".into(), depth: 0 },
//! );
//! assert_eq!(cell.leafs().count(), 1);
//! assert!(!cell.collapsible());
//! ```

mod cell;
mod output;
mod snapshot;
mod source;

pub use cell::{CellId, Leafs, MeshCell};
pub use snapshot::Snapshot;
pub use source::{GeometrySource, MAX_DEPTH, sibling_path};

use crate::region::BoundingBox;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// An indexed 3D mesh
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    /// Triangles, as indexes into [`self.vertices`](Self::vertices)
    pub triangles: Vec<Vector3<usize>>,
    /// Vertex positions
    pub vertices: Vec<Vector3<f32>>,
}

impl Mesh {
    /// Builds a new mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vertices in the mesh
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangles in the mesh
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Checks whether the mesh has no vertices
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Returns the tight bounding box of the mesh's vertices
    pub fn bounds(&self) -> Option<BoundingBox> {
        let first = *self.vertices.first()?;
        let (lower, upper) = self
            .vertices
            .iter()
            .fold((first, first), |(lo, hi), v| (lo.inf(v), hi.sup(v)));
        Some(BoundingBox::new(lower, upper))
    }

    /// Combines a set of independent meshes
    ///
    /// Vertices are not deduplicated.
    pub fn merge<'a, I: IntoIterator<Item = &'a Mesh>>(meshes: I) -> Mesh {
        let mut out = Mesh::new();
        for m in meshes {
            let offset = out.vertices.len();
            out.vertices.extend_from_slice(&m.vertices);
            out.triangles.extend(
                m.triangles.iter().map(|t| t.add_scalar(offset)),
            );
        }
        out
    }
}
