//! Screen-occupancy sampling of mesh leaves
//!
//! The LOD controller's only view of the world is a score per leaf: the
//! fraction of the viewport covered by that leaf's geometry.  Scores are
//! produced by drawing every leaf in a unique flat color, reading back the
//! frame buffer, and counting pixels per color.
use crate::mesh::{CellId, MeshCell};
use std::collections::HashMap;

/// Produces per-leaf screen occupancy scores
pub trait ScreenSampler {
    /// Checks whether the 3D view is currently visible
    fn is_shown(&self) -> bool;

    /// Returns the fraction of the viewport covered by each leaf
    ///
    /// Leaves which are off-screen or occluded may be absent from the map.
    fn sample(&mut self, leaves: &[&MeshCell]) -> HashMap<CellId, f32>;
}

/// RGB frame buffer read back from a flat-color draw
#[derive(Clone, Debug)]
pub struct Framebuffer {
    /// Width, in pixels
    pub width: usize,
    /// Height, in pixels
    pub height: usize,
    /// Row-major pixel data
    pub pixels: Vec<[u8; 3]>,
}

/// A renderer capable of drawing leaves in flat colors
pub trait FlatRenderer {
    /// Checks whether the 3D view is currently visible
    fn is_shown(&self) -> bool;

    /// Draws each leaf in its assigned color on a black background, with
    /// depth testing, and reads back the result
    fn draw_flat(&mut self, leaves: &[(&MeshCell, [u8; 3])]) -> Framebuffer;
}

/// Returns the flat color assigned to leaf `i`
///
/// Colors pack `i + 1` into 24 bits, so that black remains the background;
/// indexes beyond `2^24 - 2` wrap around.
pub fn flat_color(i: usize) -> [u8; 3] {
    let c = (i + 1) & 0xFFFFFF;
    [(c >> 16) as u8, (c >> 8) as u8, c as u8]
}

/// Inverse of [`flat_color`]; returns `None` for the background
pub fn color_index(c: [u8; 3]) -> Option<usize> {
    let i = ((c[0] as usize) << 16) | ((c[1] as usize) << 8) | c[2] as usize;
    i.checked_sub(1)
}

/// Counts the number of pixels drawn in each of `n` flat colors
pub fn count_by_color(fb: &Framebuffer, n: usize) -> Vec<u32> {
    let mut out = vec![0; n];
    for p in &fb.pixels {
        if let Some(i) = color_index(*p).filter(|i| *i < n) {
            out[i] += 1;
        }
    }
    out
}

/// [`ScreenSampler`] built on top of a [`FlatRenderer`]
pub struct FlatColorSampler<R> {
    renderer: R,
}

impl<R: FlatRenderer> FlatColorSampler<R> {
    /// Wraps the given renderer
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }
}

impl<R: FlatRenderer> ScreenSampler for FlatColorSampler<R> {
    fn is_shown(&self) -> bool {
        self.renderer.is_shown()
    }

    fn sample(&mut self, leaves: &[&MeshCell]) -> HashMap<CellId, f32> {
        let colored = leaves
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, flat_color(i)))
            .collect::<Vec<_>>();
        let fb = self.renderer.draw_flat(&colored);
        let total = (fb.width * fb.height).max(1) as f32;
        count_by_color(&fb, leaves.len())
            .into_iter()
            .zip(leaves)
            .map(|(n, c)| (c.id(), n as f32 / total))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{leaf, refined};
    use approx::assert_relative_eq;

    #[test]
    fn color_round_trip() {
        assert_eq!(flat_color(0), [0, 0, 1]);
        assert_eq!(flat_color(255), [0, 1, 0]);
        assert_eq!(color_index([0, 0, 0]), None);
        for i in [0, 1, 254, 255, 256, 65535, 65536, 1_000_000] {
            assert_eq!(color_index(flat_color(i)), Some(i));
        }
    }

    /// Paints leaf `i` over `weights[i]` pixels of a 10×10 screen
    struct Stripes {
        weights: Vec<usize>,
    }

    impl FlatRenderer for Stripes {
        fn is_shown(&self) -> bool {
            true
        }
        fn draw_flat(&mut self, leaves: &[(&MeshCell, [u8; 3])]) -> Framebuffer {
            let mut pixels = vec![[0; 3]; 100];
            let mut i = 0;
            for ((_, color), w) in leaves.iter().zip(&self.weights) {
                for p in &mut pixels[i..i + w] {
                    *p = *color;
                }
                i += w;
            }
            Framebuffer {
                width: 10,
                height: 10,
                pixels,
            }
        }
    }

    #[test]
    fn sampler_scores() {
        let root = refined(leaf(0));
        let leaves = root.leafs().collect::<Vec<_>>();
        let mut s = FlatColorSampler::new(Stripes {
            weights: vec![50, 10, 0, 0, 0, 0, 0, 5],
        });
        let scores = s.sample(&leaves);
        assert_eq!(scores.len(), 8);
        assert_relative_eq!(scores[&leaves[0].id()], 0.5);
        assert_relative_eq!(scores[&leaves[1].id()], 0.1);
        assert_relative_eq!(scores[&leaves[2].id()], 0.0);
        assert_relative_eq!(scores[&leaves[7].id()], 0.05);
    }
}
