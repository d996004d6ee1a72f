//! Height-map images
use nalgebra::Vector2;
use std::path::Path;

/// A height-map image covering an axis-aligned rectangle
///
/// Pixels are stored row-major, starting at the image's lower-left corner.
/// A depth of zero means that the pixel is empty.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    /// Lower-left corner, in design units
    pub lower: Vector2<f32>,
    /// Pixels per design unit
    pub pixels_per_unit: f32,
    /// Width, in pixels
    pub width: usize,
    /// Height, in pixels
    pub height: usize,
    /// Per-pixel height
    pub depth: Vec<u16>,
    /// Per-pixel display color
    pub rgb: Vec<[u8; 3]>,
}

impl Image {
    /// Builds an empty image
    pub fn new(
        lower: Vector2<f32>,
        pixels_per_unit: f32,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            lower,
            pixels_per_unit,
            width,
            height,
            depth: vec![0; width * height],
            rgb: vec![[0; 3]; width * height],
        }
    }

    /// Paints every non-empty pixel with the given color
    pub fn colorize(&mut self, color: [u8; 3]) {
        for (c, &d) in self.rgb.iter_mut().zip(&self.depth) {
            if d != 0 {
                *c = color;
            }
        }
    }

    /// Combines a set of images onto a single canvas
    ///
    /// The canvas uses the resolution of the first image and covers the union
    /// of every image's footprint.  Where images overlap, the taller pixel
    /// wins, and later images win ties.  Returns `None` if `imgs` is empty.
    pub fn merge(imgs: &[Image]) -> Option<Image> {
        let first = imgs.first()?;
        let ppu = first.pixels_per_unit;

        let mut lower = first.lower;
        let mut upper = first.upper();
        for i in &imgs[1..] {
            lower = lower.inf(&i.lower);
            upper = upper.sup(&i.upper());
        }
        let size = (upper - lower) * ppu;
        let mut out = Image::new(
            lower,
            ppu,
            size.x.round().max(0.0) as usize,
            size.y.round().max(0.0) as usize,
        );

        for img in imgs {
            let scale = ppu / img.pixels_per_unit;
            let offset = (img.lower - lower) * ppu;
            for y in 0..img.height {
                for x in 0..img.width {
                    let d = img.depth[y * img.width + x];
                    if d == 0 {
                        continue;
                    }
                    let px = (offset.x + x as f32 * scale).round() as usize;
                    let py = (offset.y + y as f32 * scale).round() as usize;
                    if px >= out.width || py >= out.height {
                        continue;
                    }
                    let j = py * out.width + px;
                    if d >= out.depth[j] {
                        out.depth[j] = d;
                        out.rgb[j] = img.rgb[y * img.width + x];
                    }
                }
            }
        }
        Some(out)
    }

    /// Upper-right corner, in design units
    pub fn upper(&self) -> Vector2<f32> {
        self.lower
            + Vector2::new(self.width as f32, self.height as f32)
                / self.pixels_per_unit
    }

    /// Saves the height map as a 16-bit grayscale PNG
    ///
    /// The file is flipped vertically, so that +Y points up in the image.
    pub fn save_png(&self, path: &Path) -> Result<(), crate::Error> {
        let mut rows = Vec::with_capacity(self.depth.len());
        for row in self.depth.chunks(self.width.max(1)).rev() {
            rows.extend_from_slice(row);
        }
        let buf = image::ImageBuffer::<image::Luma<u16>, _>::from_raw(
            self.width as u32,
            self.height as u32,
            rows,
        )
        .ok_or_else(|| crate::Error::Engine("bad image dimensions".into()))?;
        buf.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }

    /// Saves the per-pixel display colors as an 8-bit RGB PNG
    ///
    /// Like [`save_png`](Self::save_png), the file is flipped vertically.
    pub fn save_rgb_png(&self, path: &Path) -> Result<(), crate::Error> {
        let mut rows = Vec::with_capacity(self.rgb.len() * 3);
        for row in self.rgb.chunks(self.width.max(1)).rev() {
            rows.extend(row.iter().flatten());
        }
        let buf = image::RgbImage::from_raw(
            self.width as u32,
            self.height as u32,
            rows,
        )
        .ok_or_else(|| crate::Error::Engine("bad image dimensions".into()))?;
        buf.save_with_format(path, image::ImageFormat::Png)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn square(x: f32, d: u16, color: [u8; 3]) -> Image {
        let mut img = Image::new(Vector2::new(x, 0.0), 1.0, 2, 2);
        img.depth.fill(d);
        img.colorize(color);
        img
    }

    #[test]
    fn merge_side_by_side() {
        let a = square(0.0, 10, [255, 0, 0]);
        let b = square(2.0, 20, [0, 255, 0]);
        let m = Image::merge(&[a, b]).unwrap();
        assert_eq!(m.width, 4);
        assert_eq!(m.height, 2);
        assert_eq!(m.depth, vec![10, 10, 20, 20, 10, 10, 20, 20]);
        assert_eq!(m.rgb[0], [255, 0, 0]);
        assert_eq!(m.rgb[3], [0, 255, 0]);
    }

    #[test]
    fn merge_overlapping_keeps_tallest() {
        let a = square(0.0, 30, [255, 0, 0]);
        let b = square(1.0, 20, [0, 255, 0]);
        let m = Image::merge(&[a, b]).unwrap();
        assert_eq!(m.width, 3);
        assert_eq!(m.depth[..3], [30, 30, 20]);
        assert_eq!(m.rgb[1], [255, 0, 0]);
        assert_eq!(m.rgb[2], [0, 255, 0]);
    }

    #[test]
    fn rgb_png_is_flipped() {
        let mut img = Image::new(Vector2::zeros(), 1.0, 1, 2);
        img.rgb = vec![[255, 0, 0], [0, 255, 0]];
        let path = std::env::temp_dir()
            .join(format!("taskbot-raster-{}.png", std::process::id()));
        img.save_rgb_png(&path).unwrap();
        let out = image::open(&path).unwrap().to_rgb8();
        assert_eq!(out.get_pixel(0, 0).0, [0, 255, 0]);
        assert_eq!(out.get_pixel(0, 1).0, [255, 0, 0]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn merge_empty() {
        assert!(Image::merge(&[]).is_none());
    }
}
