//! Toolpath generation
//!
//! Machine-specific workflows live outside of this crate and implement
//! [`CamWorkflow`]; the orchestrator only runs them on a background thread
//! against a read-only design.  [`RasterWorkflow`] is a simple built-in
//! finishing pass, which scans a height-map of the design row by row.
use crate::{
    Error,
    cancel::JobCancel,
    design::DesignResult,
    raster::Image,
    region::{BoundingBox, Region},
};
use nalgebra::{Vector2, Vector3};

/// A single tool movement, as a polyline
#[derive(Clone, Debug, PartialEq)]
pub struct Stroke {
    /// Points visited by the tool, in millimeters
    pub points: Vec<Vector3<f32>>,
    /// Whether the path returns to its first point
    pub closed: bool,
}

impl Stroke {
    /// Builds an open path
    pub fn new(points: Vec<Vector3<f32>>) -> Self {
        Self {
            points,
            closed: false,
        }
    }

    /// Total length of the path
    pub fn length(&self) -> f32 {
        let mut out: f32 =
            self.points.windows(2).map(|w| (w[1] - w[0]).norm()).sum();
        if self.closed {
            if let (Some(a), Some(b)) = (self.points.first(), self.points.last())
            {
                out += (a - b).norm();
            }
        }
        out
    }
}

/// Ordered set of paths produced by a [`CamWorkflow`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Toolpath {
    /// Paths, in cutting order
    pub paths: Vec<Stroke>,
}

impl Toolpath {
    /// Checks whether there are no paths
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Total cutting length of every path
    pub fn length(&self) -> f32 {
        self.paths.iter().map(|p| p.length()).sum()
    }
}

/// A toolpath generator, with its settings captured at construction
pub trait CamWorkflow: Send + Sync {
    /// Short name of the workflow, for status text
    fn name(&self) -> &str;

    /// Generates a toolpath for the given design
    ///
    /// Long-running workflows should poll `cancel` between paths and pass
    /// `cancel.hard` into the geometry engine.
    fn run(
        &self,
        design: &DesignResult,
        cancel: &JobCancel,
    ) -> Result<Toolpath, Error>;
}

/// Raster finishing pass over a height-map of the design
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RasterWorkflow {
    /// Pixels per millimeter of the height-map
    pub resolution: f32,
    /// Distance between rows, in pixels
    pub stepover: usize,
}

impl Default for RasterWorkflow {
    fn default() -> Self {
        Self {
            resolution: 10.0,
            stepover: 1,
        }
    }
}

impl CamWorkflow for RasterWorkflow {
    fn name(&self) -> &str {
        "raster"
    }

    fn run(
        &self,
        design: &DesignResult,
        cancel: &JobCancel,
    ) -> Result<Toolpath, Error> {
        let b = &design.bounds;
        let (Some(xmin), Some(ymin), Some(xmax), Some(ymax)) =
            (b.lower[0], b.lower[1], b.upper[0], b.upper[1])
        else {
            return Err(Error::UnboundedGeometry);
        };
        let zmin = b.lower[2].unwrap_or(0.0);
        let zmax = b.upper[2].unwrap_or(0.0);
        let region = Region::with_resolution(
            BoundingBox::new(
                Vector3::new(xmin, ymin, zmin),
                Vector3::new(xmax, ymax, zmax),
            ),
            self.resolution * design.mm_per_unit,
        );

        let mut imgs = vec![];
        for s in &design.shapes {
            cancel.checkpoint()?;
            imgs.push(s.render(&region, design.mm_per_unit, &cancel.hard)?);
        }
        let Some(img) = Image::merge(&imgs) else {
            return Err(Error::NoShapes);
        };
        let height = |d: u16| zmin + (zmax - zmin) * d as f32 / u16::MAX as f32;

        let mut out = Toolpath::default();
        for (n, y) in (0..img.height).step_by(self.stepover.max(1)).enumerate()
        {
            cancel.checkpoint()?;
            let mut row = scan_row(&img, y, design.mm_per_unit, height);
            // Alternate directions to avoid long rapid moves
            if n % 2 == 1 {
                row.reverse();
                for p in &mut row {
                    p.points.reverse();
                }
            }
            out.paths.extend(row);
        }
        Ok(out)
    }
}

/// Splits one image row into runs of non-empty pixels
///
/// `height` converts pixel depth into design units, and `scale` converts
/// design units into millimeters.
fn scan_row<F: Fn(u16) -> f32>(
    img: &Image,
    y: usize,
    scale: f32,
    height: F,
) -> Vec<Stroke> {
    let pos = |x: usize| {
        img.lower
            + Vector2::new(x as f32 + 0.5, y as f32 + 0.5) / img.pixels_per_unit
    };
    let mut out = vec![];
    let mut run = vec![];
    for x in 0..img.width {
        let d = img.depth[y * img.width + x];
        if d == 0 {
            if !run.is_empty() {
                out.push(Stroke::new(std::mem::take(&mut run)));
            }
            continue;
        }
        let p = pos(x);
        run.push(Vector3::new(p.x, p.y, height(d)) * scale);
    }
    if !run.is_empty() {
        out.push(Stroke::new(run));
    }
    out
}
