//! Serialized copies of cell geometry
use super::Mesh;
use std::sync::Arc;

/// Opaque serialized copy of a cell's geometry
///
/// A snapshot is taken when a cell is refined, so that collapsing it later can
/// reinstate the geometry without re-evaluating the shape.  Cloning is cheap;
/// the blob is reference-counted.
#[derive(Clone)]
pub struct Snapshot(Arc<[u8]>);

impl Snapshot {
    /// Serializes the given mesh
    pub fn capture(mesh: &Mesh) -> Result<Self, crate::Error> {
        let data = bincode::serialize(mesh)?;
        Ok(Self(data.into()))
    }

    /// Deserializes the stored mesh
    pub fn restore(&self) -> Result<Mesh, crate::Error> {
        Ok(bincode::deserialize(&self.0)?)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({} bytes)", self.0.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn restore_matches_capture() {
        let m = Mesh {
            vertices: vec![
                Vector3::new(0.0, 0.5, 1.0),
                Vector3::new(1.0, 0.0, 0.25),
                Vector3::new(0.0, 1.0, 0.0),
            ],
            triangles: vec![Vector3::new(2, 1, 0)],
        };
        let s = Snapshot::capture(&m).unwrap();
        assert!(!s.0.is_empty());
        assert_eq!(s.restore().unwrap(), m);
        assert!(format!("{s:?}").ends_with("bytes)"));
    }

    #[test]
    fn corrupt_snapshot() {
        let s = Snapshot(Arc::from(&[1u8, 2, 3][..]));
        assert!(matches!(s.restore(), Err(crate::Error::Snapshot(..))));
    }
}
