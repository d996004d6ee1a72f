//! Provenance of mesh cell geometry
use crate::design::Shape;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Deepest octree level that a cell may be refined to
///
/// Shapes don't promise that refinement terminates on its own, so the depth
/// is capped here; a cell at this depth is never [expandable].
///
/// [expandable]: super::MeshCell::expandable
pub const MAX_DEPTH: u8 = 8;

/// Records how a cell's geometry was produced, so that it can be rebuilt
#[derive(Clone)]
pub enum GeometrySource {
    /// Built by evaluating an expression at the given octree depth
    Expression {
        /// Shape being evaluated
        shape: Arc<dyn Shape>,
        /// Octree depth of the cell
        depth: u8,
        /// Millimeters per design unit
        scale: f32,
    },
    /// Loaded from a pre-subdivided file on disk
    ///
    /// Children live in sibling files named by [`sibling_path`].
    ExternalFile {
        /// File holding this cell's ASDF
        path: PathBuf,
        /// Octree depth of the cell
        depth: u8,
    },
}

impl GeometrySource {
    /// Returns the octree depth of this cell
    pub fn depth(&self) -> u8 {
        match self {
            GeometrySource::Expression { depth, .. }
            | GeometrySource::ExternalFile { depth, .. } => *depth,
        }
    }

    /// Builds the source of child `i` of a cell with this source
    ///
    /// # Panics
    /// If `i >= 8`
    pub fn child(&self, i: usize) -> Self {
        assert!(i < 8);
        match self {
            GeometrySource::Expression {
                shape,
                depth,
                scale,
            } => GeometrySource::Expression {
                shape: shape.clone(),
                depth: depth + 1,
                scale: *scale,
            },
            GeometrySource::ExternalFile { path, depth } => {
                GeometrySource::ExternalFile {
                    path: sibling_path(path, i),
                    depth: depth + 1,
                }
            }
        }
    }

    /// Checks whether a cell with this source can be subdivided
    pub fn expandable(&self) -> bool {
        if self.depth() >= MAX_DEPTH {
            return false;
        }
        match self {
            GeometrySource::Expression { .. } => true,
            GeometrySource::ExternalFile { path, .. } => {
                (0..8).all(|i| sibling_path(path, i).exists())
            }
        }
    }
}

impl std::fmt::Debug for GeometrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeometrySource::Expression { depth, scale, .. } => f
                .debug_struct("Expression")
                .field("depth", depth)
                .field("scale", scale)
                .finish_non_exhaustive(),
            GeometrySource::ExternalFile { path, depth } => f
                .debug_struct("ExternalFile")
                .field("path", path)
                .field("depth", depth)
                .finish(),
        }
    }
}

/// Returns the name of sibling file `i`, one level deeper than `path`
///
/// The index is inserted before the extension, e.g. `part.asdf` becomes
/// `part3.asdf`.
pub fn sibling_path(path: &Path, i: usize) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{i}.{}", ext.to_string_lossy()),
        None => format!("{stem}{i}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sibling_names() {
        assert_eq!(
            sibling_path(Path::new("/tmp/part.asdf"), 3),
            PathBuf::from("/tmp/part3.asdf")
        );
        assert_eq!(
            sibling_path(Path::new("part12.asdf"), 0),
            PathBuf::from("part120.asdf")
        );
        assert_eq!(sibling_path(Path::new("blob"), 7), PathBuf::from("blob7"));
    }

    #[test]
    fn external_children() {
        let s = GeometrySource::ExternalFile {
            path: "a/b.asdf".into(),
            depth: 2,
        };
        match s.child(5) {
            GeometrySource::ExternalFile { path, depth } => {
                assert_eq!(path, PathBuf::from("a/b5.asdf"));
                assert_eq!(depth, 3);
            }
            _ => panic!("invalid source"),
        }
    }

    #[test]
    fn missing_siblings_are_not_expandable() {
        let s = GeometrySource::ExternalFile {
            path: "/this/path/does/not/exist.asdf".into(),
            depth: 0,
        };
        assert!(!s.expandable());
    }
}
