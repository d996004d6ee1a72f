//! Refine and collapse jobs for the mesh octree
//!
//! Both jobs work on a detached clone of the target cell and return its
//! replacement, which keeps the original [`CellId`](crate::mesh::CellId); the
//! orchestrator swaps the replacement into the live tree when it reaps the
//! job.
use crate::{
    Error,
    cancel::JobCancel,
    design::AsdfLoader,
    mesh::{GeometrySource, Mesh, MeshCell, Snapshot},
    region::{BoundingBox, Region},
};
use log::debug;
use std::path::Path;

/// Builds the geometry for a single cell from its source
fn build(
    bounds: &BoundingBox,
    source: &GeometrySource,
    loader: &dyn AsdfLoader,
    cancel: &JobCancel,
) -> Result<Mesh, Error> {
    match source {
        GeometrySource::Expression {
            shape,
            depth,
            scale,
        } => {
            let region = Region::with_depth(*bounds, *depth);
            let asdf = shape.asdf(&region, *scale, true, &cancel.hard)?;
            asdf.triangulate(&cancel.hard)
        }
        GeometrySource::ExternalFile { path, .. } => {
            if !path.exists() {
                return Err(Error::ExternalFileMissing(path.clone()));
            }
            let asdf = loader.load(path)?;
            asdf.triangulate(&cancel.hard)
        }
    }
}

/// Subdivides a leaf cell into eight children, one octree level deeper
///
/// The parent's geometry is snapshotted into its cache, and each new child
/// carries a snapshot of its own geometry, so that the result is collapsible.
pub fn refine(
    cell: MeshCell,
    loader: &dyn AsdfLoader,
    cancel: &JobCancel,
) -> Result<MeshCell, Error> {
    let Some(geometry) = cell.geometry() else {
        return Err(Error::BadCell);
    };
    let parent = match cell.cached() {
        Some(s) => s.clone(),
        None => Snapshot::capture(geometry)?,
    };

    let mut children = Vec::with_capacity(8);
    for (i, bounds) in cell.bounds().split().into_iter().enumerate() {
        cancel.checkpoint()?;
        let source = cell.source().child(i);
        let mesh = build(&bounds, &source, loader, cancel)?;
        let snapshot = Snapshot::capture(&mesh)?;
        children.push(MeshCell::new(bounds, mesh, source).with_snapshot(snapshot));
    }
    debug!(
        "refined cell {} into {} vertices",
        cell.id(),
        children.iter().map(|c| c.vertex_count()).sum::<usize>()
    );
    Ok(cell.into_refined(children, Some(parent)))
}

/// Merges an internal cell's children back into a single leaf
///
/// The cell's cached snapshot is restored if present; otherwise its geometry
/// is rebuilt from its source at its own depth.
pub fn collapse(
    cell: MeshCell,
    loader: &dyn AsdfLoader,
    cancel: &JobCancel,
) -> Result<MeshCell, Error> {
    if cell.is_leaf() {
        return Err(Error::BadCell);
    }
    cancel.checkpoint()?;
    let mesh = match cell.cached() {
        Some(s) => s.restore()?,
        None => build(cell.bounds(), cell.source(), loader, cancel)?,
    };
    debug!("collapsed cell {} to {} vertices", cell.id(), mesh.vertex_count());
    Ok(cell.into_collapsed(mesh))
}

/// Loads the root of a pre-subdivided model stored on disk
///
/// The root's bounding box is taken from its triangulated geometry.
pub fn load_root(
    path: &Path,
    loader: &dyn AsdfLoader,
    cancel: &JobCancel,
) -> Result<MeshCell, Error> {
    if !path.exists() {
        return Err(Error::ExternalFileMissing(path.to_owned()));
    }
    let mesh = loader.load(path)?.triangulate(&cancel.hard)?;
    let bounds = mesh.bounds().ok_or(Error::UnboundedGeometry)?;
    let snapshot = Snapshot::capture(&mesh)?;
    Ok(MeshCell::new(
        bounds,
        mesh,
        GeometrySource::ExternalFile {
            path: path.to_owned(),
            depth: 0,
        },
    )
    .with_snapshot(snapshot))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{FakeLoader, leaf, refined};

    #[test]
    fn refine_leaf() {
        let root = leaf(0);
        let id = root.id();
        let out = refine(root, &FakeLoader, &JobCancel::new()).unwrap();
        assert_eq!(out.id(), id);
        assert_eq!(out.children().len(), 8);
        assert!(out.geometry().is_none());
        assert!(out.cached().is_some());
        assert!(out.collapsible());
        assert!(out.check().is_ok());
        for c in out.children() {
            assert_eq!(c.depth(), 1);
            assert!(c.vertex_count() > 0);
            assert!(c.expandable());
        }
    }

    #[test]
    fn refine_internal_cell() {
        let root = refined(leaf(0));
        assert!(matches!(
            refine(root, &FakeLoader, &JobCancel::new()),
            Err(Error::BadCell)
        ));
    }

    #[test]
    fn refine_cancelled() {
        let cancel = JobCancel::new();
        cancel.cancel();
        assert!(matches!(
            refine(leaf(0), &FakeLoader, &cancel),
            Err(Error::Aborted)
        ));
    }

    #[test]
    fn collapse_restores_snapshot() {
        let root = leaf(0);
        let before = root.geometry().unwrap().as_ref().clone();
        let root = refine(root, &FakeLoader, &JobCancel::new()).unwrap();
        let out = collapse(root, &FakeLoader, &JobCancel::new()).unwrap();
        assert!(out.is_leaf());
        assert_eq!(out.geometry().unwrap().as_ref(), &before);
        assert!(out.check().is_ok());
        assert!(out.expandable());
    }

    #[test]
    fn collapse_leaf() {
        assert!(matches!(
            collapse(leaf(0), &FakeLoader, &JobCancel::new()),
            Err(Error::BadCell)
        ));
    }

    #[test]
    fn external_files() {
        let dir = std::env::temp_dir().join(format!(
            "taskbot-refine-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("part.asdf");
        std::fs::write(&path, b"").unwrap();

        let root = load_root(&path, &FakeLoader, &JobCancel::new()).unwrap();
        assert_eq!(root.depth(), 0);
        // No sibling files yet, so the root can't be refined
        assert!(!root.expandable());

        for i in 0..7 {
            std::fs::write(crate::mesh::sibling_path(&path, i), b"").unwrap();
        }
        assert!(!root.expandable());
        std::fs::write(crate::mesh::sibling_path(&path, 7), b"").unwrap();
        assert!(root.expandable());

        let out = refine(root, &FakeLoader, &JobCancel::new()).unwrap();
        assert_eq!(out.children().len(), 8);
        match out.children()[3].source() {
            GeometrySource::ExternalFile { path: p, depth } => {
                assert_eq!(p, &dir.join("part3.asdf"));
                assert_eq!(*depth, 1);
            }
            s => panic!("unexpected source {s:?}"),
        }

        std::fs::remove_dir_all(&dir).unwrap();
        let missing = dir.join("part.asdf");
        assert!(matches!(
            load_root(&missing, &FakeLoader, &JobCancel::new()),
            Err(Error::ExternalFileMissing(..))
        ));
    }
}
