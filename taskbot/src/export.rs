//! Export jobs, which write the current design to a file
use crate::{
    Error,
    cancel::JobCancel,
    design::{DesignResult, Shape},
    mesh::Mesh,
    raster::Image,
    region::{BoundingBox, Region},
};
use log::info;
use nalgebra::Vector3;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

/// Output resolution of SVG files, in dots per inch
const SVG_DPI: f32 = 90.0;

/// File formats supported by export jobs
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExportFormat {
    /// Merged image, either colored or as a 16-bit height-map
    Png,
    /// Binary STL of every shape's triangulated mesh
    Stl,
    /// Distance fields in the geometry engine's native format
    Asdf,
    /// Contours of every shape's XY cross-section
    Svg,
    /// Math file, as consumed by the fab modules
    Math,
}

impl ExportFormat {
    /// Picks a format based on a file's extension (case-insensitive)
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        ext.parse().map_err(|_| Error::UnsupportedFormat(ext))
    }
}

/// Settings for an export job
///
/// The boolean flags each apply to a single format, and are ignored by the
/// others.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportOptions {
    /// Target file
    pub path: PathBuf,
    /// Voxels (or pixels) per millimeter
    pub resolution: f32,
    /// Format override; if `None`, the format is picked from the extension
    pub format: Option<ExportFormat>,
    /// `asdf`: merge leaf cells, producing a smaller (decimated) field
    ///
    /// `stl` and `svg` exports always merge leafs.
    pub merge_leafs: bool,
    /// `stl`: triangulate with cubical marching squares
    pub use_cms: bool,
    /// `png`: write a 16-bit grayscale height-map instead of shape colors
    pub heightmap: bool,
}

impl ExportOptions {
    /// Builds options for the given path, using a default resolution
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            resolution: 10.0,
            format: None,
            merge_leafs: false,
            use_cms: false,
            heightmap: false,
        }
    }

    /// Returns the explicit format, or picks one based on the extension
    pub fn format(&self) -> Result<ExportFormat, Error> {
        match self.format {
            Some(f) => Ok(f),
            None => ExportFormat::from_path(&self.path),
        }
    }
}

/// Shared view of an export job's progress, as a percentage
#[derive(Clone, Debug, Default)]
pub struct ExportProgress(Arc<AtomicU8>);

impl ExportProgress {
    fn set(&self, p: usize) {
        self.0.store(p.min(100) as u8, Ordering::Relaxed);
    }

    /// Reads the current progress, from 0 to 100
    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fully-resolved export job, captured on the control thread
pub(crate) struct ExportTask {
    pub design: Arc<DesignResult>,
    pub format: ExportFormat,
    pub options: ExportOptions,
    pub progress: ExportProgress,
}

impl ExportTask {
    /// Runs the export, on the job's own thread
    ///
    /// Returns the path which was written.
    pub fn run(self, cancel: &JobCancel) -> Result<PathBuf, Error> {
        self.progress.set(0);
        match self.format {
            ExportFormat::Png => self.export_png(cancel)?,
            ExportFormat::Stl => self.export_stl(cancel)?,
            ExportFormat::Asdf => self.export_asdf(cancel)?,
            ExportFormat::Svg => self.export_svg(cancel)?,
            ExportFormat::Math => {
                let mut f = BufWriter::new(File::create(&self.options.path)?);
                self.design.write(&mut f)?;
                f.flush()?;
            }
        }
        self.progress.set(100);
        info!("exported {} to {:?}", self.format, self.options.path);
        Ok(self.options.path)
    }

    /// Voxels per design unit
    fn per_unit(&self) -> f32 {
        self.options.resolution * self.design.mm_per_unit
    }

    /// Region around a single shape, widened by the design's border
    fn shape_region(&self, shape: &dyn Shape) -> Result<Region, Error> {
        let b = shape
            .bounds()
            .to_box(self.design.border)
            .ok_or(Error::UnboundedGeometry)?;
        Ok(Region::with_resolution(b, self.per_unit()))
    }

    /// Flat region around a single shape's XY bounds, at Z = 0
    fn flat_region(&self, shape: &dyn Shape) -> Result<Region, Error> {
        let b = shape.bounds();
        let mut lower = Vector3::zeros();
        let mut upper = Vector3::zeros();
        for axis in 0..2 {
            let (Some(lo), Some(hi)) = (b.lower[axis], b.upper[axis]) else {
                return Err(Error::UnboundedGeometry);
            };
            let d = (hi - lo) * self.design.border;
            lower[axis] = lo - d;
            upper[axis] = hi + d;
        }
        Ok(Region::with_resolution(
            BoundingBox::new(lower, upper),
            self.per_unit(),
        ))
    }

    /// Renders every shape over the design's XY bounds, then merges them
    ///
    /// Where shapes overlap, the taller one wins, so the height-map is that
    /// of the union of every shape.
    fn export_png(&self, cancel: &JobCancel) -> Result<(), Error> {
        let b = &self.design.bounds;
        let (Some(xmin), Some(ymin), Some(xmax), Some(ymax)) =
            (b.lower[0], b.lower[1], b.upper[0], b.upper[1])
        else {
            return Err(Error::UnboundedGeometry);
        };
        let region = Region::with_resolution(
            BoundingBox::new(
                Vector3::new(xmin, ymin, b.lower[2].unwrap_or(0.0)),
                Vector3::new(xmax, ymax, b.upper[2].unwrap_or(0.0)),
            ),
            self.per_unit(),
        );

        let n = self.design.shapes.len();
        let mut imgs = vec![];
        for (i, s) in self.design.shapes.iter().enumerate() {
            cancel.checkpoint()?;
            let mut img =
                s.render(&region, self.design.mm_per_unit, &cancel.hard)?;
            img.colorize(s.color().unwrap_or([255; 3]));
            imgs.push(img);
            self.progress.set((i + 1) * 90 / n);
        }
        cancel.checkpoint()?;
        let out = Image::merge(&imgs).ok_or(Error::NoShapes)?;
        if self.options.heightmap {
            out.save_png(&self.options.path)
        } else {
            out.save_rgb_png(&self.options.path)
        }
    }

    fn export_stl(&self, cancel: &JobCancel) -> Result<(), Error> {
        let n = self.design.shapes.len();
        let mut meshes = vec![];
        for (i, s) in self.design.shapes.iter().enumerate() {
            cancel.checkpoint()?;
            let region = self.shape_region(s.as_ref())?;
            let asdf =
                s.asdf(&region, self.design.mm_per_unit, true, &cancel.hard)?;
            self.progress.set((3 * i + 1) * 33 / n);

            cancel.checkpoint()?;
            let mesh = if self.options.use_cms {
                asdf.triangulate_cms(&cancel.hard)?
            } else {
                asdf.triangulate(&cancel.hard)?
            };
            meshes.push(mesh);
            self.progress.set((3 * i + 3) * 33 / n);
        }
        cancel.checkpoint()?;
        let mesh = Mesh::merge(&meshes);
        let mut f = File::create(&self.options.path)?;
        mesh.write_stl(&mut f)
    }

    /// Writes every shape's distance field, one after the other
    fn export_asdf(&self, cancel: &JobCancel) -> Result<(), Error> {
        let n = self.design.shapes.len();
        let mut f = BufWriter::new(File::create(&self.options.path)?);
        for (i, s) in self.design.shapes.iter().enumerate() {
            cancel.checkpoint()?;
            let region = self.shape_region(s.as_ref())?;
            let asdf = s.asdf(
                &region,
                self.design.mm_per_unit,
                self.options.merge_leafs,
                &cancel.hard,
            )?;
            asdf.save(&mut f)?;
            self.progress.set((i + 1) * 100 / n);
        }
        f.flush()?;
        Ok(())
    }

    /// Writes each shape's contours as SVG paths, in the shape's color
    fn export_svg(&self, cancel: &JobCancel) -> Result<(), Error> {
        let b = &self.design.bounds;
        let (Some(xmin), Some(ymin), Some(xmax), Some(ymax)) =
            (b.lower[0], b.lower[1], b.upper[0], b.upper[1])
        else {
            return Err(Error::UnboundedGeometry);
        };
        let mm = self.design.mm_per_unit;
        let (dx, dy) = ((xmax - xmin) * mm, (ymax - ymin) * mm);
        let stroke = dx.max(dy) / 100.0;
        let scale = SVG_DPI / 25.4;

        let mut f = BufWriter::new(File::create(&self.options.path)?);
        writeln!(f, r#"<?xml version="1.0" encoding="ISO-8859-1" standalone="no"?>"#)?;
        writeln!(
            f,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{dx}mm" height="{dy}mm" units="mm">"#
        )?;

        let n = self.design.shapes.len();
        for (i, s) in self.design.shapes.iter().enumerate() {
            cancel.checkpoint()?;
            let region = self.flat_region(s.as_ref())?;
            let asdf = s.asdf(&region, mm, true, &cancel.hard)?;
            self.progress.set((3 * i + 1) * 33 / n);

            cancel.checkpoint()?;
            let contours = asdf.contour(&cancel.hard)?;
            self.progress.set((3 * i + 3) * 33 / n);

            let [r, g, b] = s.color().unwrap_or([0; 3]);
            for c in contours.iter().filter(|c| !c.points.is_empty()) {
                write!(
                    f,
                    r#"  <path style="stroke:rgb({r},{g},{b}); stroke-width:{stroke}; fill:none" d=""#
                )?;
                for (j, p) in c.points.iter().enumerate() {
                    let x = scale * (p.x - xmin) * mm;
                    let y = scale * (ymax - p.y) * mm;
                    let cmd = if j == 0 { 'M' } else { 'L' };
                    write!(f, "{cmd}{x} {y} ")?;
                }
                if c.closed {
                    write!(f, "Z")?;
                }
                writeln!(f, r#""/>"#)?;
            }
        }
        writeln!(f, "</svg>")?;
        f.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{design::Bounds, test_util::FakeShape};

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("taskbot-export-{}-{name}", std::process::id()))
    }

    fn task(path: &Path) -> ExportTask {
        let mut design = DesignResult::new(vec![
            Arc::new(FakeShape::cube()),
            Arc::new(FakeShape::cube()),
        ]);
        design.border = 0.0;
        let options = ExportOptions::new(path);
        ExportTask {
            design: Arc::new(design),
            format: options.format().unwrap(),
            options,
            progress: ExportProgress::default(),
        }
    }

    #[test]
    fn formats() {
        assert_eq!(
            ExportFormat::from_path(Path::new("a/b.STL")).unwrap(),
            ExportFormat::Stl
        );
        assert_eq!(
            ExportFormat::from_path(Path::new("b.math")).unwrap(),
            ExportFormat::Math
        );
        assert_eq!(
            ExportFormat::from_path(Path::new("b.svg")).unwrap(),
            ExportFormat::Svg
        );
        match ExportFormat::from_path(Path::new("b.dot")) {
            Err(Error::UnsupportedFormat(s)) => assert_eq!(s, "dot"),
            e => panic!("unexpected result {e:?}"),
        }
        assert!(ExportFormat::from_path(Path::new("noext")).is_err());

        let mut opts = ExportOptions::new("out.bin");
        assert!(opts.format().is_err());
        opts.format = Some(ExportFormat::Asdf);
        assert_eq!(opts.format().unwrap(), ExportFormat::Asdf);
    }

    #[test]
    fn export_stl() {
        let path = tmp("mesh.stl");
        let t = task(&path);
        let progress = t.progress.clone();
        assert_eq!(t.run(&JobCancel::new()).unwrap(), path);
        assert_eq!(progress.get(), 100);

        // Two shapes with one triangle each
        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 84 + 2 * 50);
        assert_eq!(&data[80..84], &2u32.to_le_bytes());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn export_stl_cms() {
        let path = tmp("cms.stl");
        let mut t = task(&path);
        t.options.use_cms = true;
        t.run(&JobCancel::new()).unwrap();

        // The CMS mesher produces two triangles per shape
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[80..84], &4u32.to_le_bytes());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn export_png() {
        let path = tmp("image.png");
        task(&path).run(&JobCancel::new()).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!(img.width(), 10);
        assert_eq!(img.height(), 10);
        assert_eq!(img.to_rgb8().get_pixel(5, 5).0, [255, 128, 0]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn export_png_heightmap() {
        let path = tmp("heightmap.png");
        let mut t = task(&path);
        t.options.heightmap = true;
        t.run(&JobCancel::new()).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!(img.color(), image::ColorType::L16);
        assert_eq!(img.to_luma16().get_pixel(5, 5).0, [1]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn export_asdf_merge_leafs() {
        let path = tmp("fields.asdf");
        task(&path).run(&JobCancel::new()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("merged=false").count(), 2);

        let mut t = task(&path);
        t.options.merge_leafs = true;
        t.run(&JobCancel::new()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("merged=true").count(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn export_svg() {
        let path = tmp("outline.svg");
        let mut t = task(&path);
        let mut design = DesignResult::new(vec![Arc::new(FakeShape::new(
            Bounds::flat(0.0, 0.0, 2.0, 1.0),
        ))]);
        design.border = 0.0;
        t.design = Arc::new(design);
        let progress = t.progress.clone();
        t.run(&JobCancel::new()).unwrap();
        assert_eq!(progress.get(), 100);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(r#"width="2mm" height="1mm""#));
        assert_eq!(text.matches("<path").count(), 1);
        assert!(text.contains("stroke:rgb(255,128,0)"));
        assert!(text.trim_end().ends_with("</svg>"));

        // The outline is closed, and flipped so that +Y points down
        let d = text.split(r#"d=""#).nth(1).unwrap();
        assert!(d.starts_with("M0 "));
        assert!(d.contains(" Z\""));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn export_svg_needs_flat_bounds() {
        let path = tmp("unbounded.svg");
        let mut t = task(&path);
        t.design = Arc::new(DesignResult::new(vec![Arc::new(
            FakeShape::new(Default::default()),
        )]));
        assert!(matches!(
            t.run(&JobCancel::new()),
            Err(Error::UnboundedGeometry)
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn export_math() {
        let path = tmp("design.math");
        task(&path).run(&JobCancel::new()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("format: taskbot-math 1\n"));
        assert_eq!(text.matches("shape: fake").count(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn export_cancelled() {
        let path = tmp("cancelled.asdf");
        let cancel = JobCancel::new();
        cancel.cancel();
        assert!(matches!(task(&path).run(&cancel), Err(Error::Aborted)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn export_unbounded_stl() {
        let path = tmp("unbounded.stl");
        let mut t = task(&path);
        t.design = Arc::new(DesignResult::new(vec![Arc::new(
            FakeShape::new(Default::default()),
        )]));
        assert!(matches!(
            t.run(&JobCancel::new()),
            Err(Error::UnboundedGeometry)
        ));
        let _ = std::fs::remove_file(&path);
    }
}
