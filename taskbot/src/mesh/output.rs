//! Mesh output implementation
use super::Mesh;
use nalgebra::Vector3;
use std::io::{BufWriter, Write};

impl Mesh {
    /// Writes a binary STL to the given output
    pub fn write_stl<F: std::io::Write>(
        &self,
        out: &mut F,
    ) -> Result<(), crate::Error> {
        // Exports write one mesh with many small records, so buffer them
        let mut out = BufWriter::new(out);
        const HEADER: &[u8] = b"Binary STL exported by taskbot";
        static_assertions::const_assert!(HEADER.len() <= 80);
        out.write_all(HEADER)?;
        out.write_all(&[0u8; 80 - HEADER.len()])?;
        out.write_all(&(self.triangles.len() as u32).to_le_bytes())?;
        for t in &self.triangles {
            let a = self.vertices[t.x];
            let ab = self.vertices[t.y] - a;
            let ac = self.vertices[t.z] - a;
            let normal = ab.cross(&ac).try_normalize(f32::EPSILON);
            for p in &normal.unwrap_or_else(Vector3::zeros) {
                out.write_all(&p.to_le_bytes())?;
            }
            for v in t {
                for p in &self.vertices[*v] {
                    out.write_all(&p.to_le_bytes())?;
                }
            }
            out.write_all(&[0u8; std::mem::size_of::<u16>()])?; // attributes
        }
        out.flush()?;
        Ok(())
    }
}
