//! Render jobs: script evaluation, images, and mesh octree roots
//!
//! A render job moves through the stages in [`RenderStage`].  It builds
//! everything into local values and returns a [`RenderOutput`]; the
//! orchestrator publishes that output after the job's thread has exited.
use crate::{
    Error,
    cancel::JobCancel,
    design::{DesignResult, Evaluator, RenderMode, Shape},
    mesh::{GeometrySource, Mesh, MeshCell},
    raster::Image,
    region::{BoundingBox, Region},
};
use log::debug;
use nalgebra::Vector3;
use std::{
    fmt::Write,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};

/// Deepest octree level tried when looking for a non-empty initial mesh
pub const MESH_RETRY_DEPTH: u8 = 4;

/// Progress of a render job
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::FromRepr)]
#[repr(u8)]
pub enum RenderStage {
    /// Not yet started
    Pending,
    /// Running the user's script
    EvaluatingScript,
    /// Building images and distance fields
    BuildingGeometry,
    /// Assembling images and mesh roots
    RenderingOutputs,
    /// Finished
    Done,
}

impl RenderStage {
    /// Human-readable status for this stage
    pub fn status(&self) -> &'static str {
        match self {
            RenderStage::Pending => "Waiting to render",
            RenderStage::EvaluatingScript => "Converting to math string",
            RenderStage::BuildingGeometry => "Rendering geometry",
            RenderStage::RenderingOutputs => "Assembling outputs",
            RenderStage::Done => "",
        }
    }
}

/// Shared view of a render job's current stage
#[derive(Clone, Debug)]
pub struct StageCell(Arc<AtomicU8>);

impl Default for StageCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(RenderStage::Pending as u8)))
    }
}

impl StageCell {
    /// Records a new stage
    pub fn set(&self, s: RenderStage) {
        self.0.store(s as u8, Ordering::Relaxed);
    }

    /// Reads the current stage
    pub fn get(&self) -> RenderStage {
        RenderStage::from_repr(self.0.load(Ordering::Relaxed))
            .unwrap_or(RenderStage::Pending)
    }
}

/// Region visible in the 2D view, and the user's preferred render mode
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct View {
    /// Visible region, in design units
    pub bounds: BoundingBox,
    /// Image resolution, in pixels per design unit
    pub pixels_per_unit: f32,
    /// Render mode selected in the UI (the design may override it)
    pub mode: RenderMode,
}

impl Default for View {
    fn default() -> Self {
        Self {
            bounds: BoundingBox::new(
                Vector3::new(-10.0, -10.0, -10.0),
                Vector3::new(10.0, 10.0, 10.0),
            ),
            pixels_per_unit: 10.0,
            mode: RenderMode::Shaded,
        }
    }
}

/// What a render job should render
#[derive(Clone, Debug)]
pub enum RenderInput {
    /// Evaluate this script text
    Script(String),
    /// Re-render the current design (e.g. after the view changed)
    Cached,
}

/// Fully-resolved inputs to a render job, captured on the control thread
pub(crate) struct RenderTask {
    pub view: View,
    pub script: Option<String>,
    pub design: Option<Arc<DesignResult>>,
    pub make_mesh: bool,
    pub evaluator: Arc<dyn Evaluator>,
    pub stage: StageCell,
}

/// Values produced by a successful render job
#[derive(Debug)]
pub struct RenderOutput {
    /// Design which was rendered
    pub design: Arc<DesignResult>,
    /// Render mode after applying the design's override
    pub mode: RenderMode,
    /// Merged height-map image, if rendered in height mode
    pub image: Option<Image>,
    /// Merged flat images of 2D shapes, if rendered in shaded mode
    pub flat: Option<Image>,
    /// Mesh roots (one per 3D shape), or `None` if meshes were not rebuilt
    pub meshes: Option<Vec<MeshCell>>,
    /// Whether the design came from a freshly-evaluated script
    pub from_script: bool,
    /// Log of timings and counts, for the output pane
    pub log: String,
}

impl RenderTask {
    /// Runs the render job, on the job's own thread
    pub fn run(self, cancel: &JobCancel) -> Result<RenderOutput, Error> {
        let start = Instant::now();
        let mut log = String::new();
        let _ = writeln!(log, "####       Rendering image      ####");

        let from_script = self.script.is_some();
        let design = match (&self.script, &self.design) {
            (Some(script), _) => {
                self.stage.set(RenderStage::EvaluatingScript);
                let _ = writeln!(log, ">>  Compiling to math file");
                let now = Instant::now();
                let d = self
                    .evaluator
                    .evaluate(script, &cancel.hard)
                    .map_err(|e| {
                        // An interrupted evaluation is reported as an error
                        // by most evaluators, but is really a cancellation
                        if cancel.is_cancelled() {
                            Error::Aborted
                        } else {
                            Error::from(e)
                        }
                    })?;
                let _ = writeln!(log, "#   cad_math time: {:?}", now.elapsed());
                Arc::new(d)
            }
            (None, Some(d)) => d.clone(),
            (None, None) => return Err(Error::NoDesign),
        };
        if design.shapes.is_empty() {
            return Err(Error::NoShapes);
        }
        cancel.checkpoint()?;

        let mode = design.render_mode.unwrap_or(self.view.mode);
        self.stage.set(RenderStage::BuildingGeometry);

        let mut images = vec![];
        if mode.height() {
            for s in &design.shapes {
                cancel.checkpoint()?;
                images.push(self.make_image(&design, s.as_ref(), cancel, &mut log)?);
            }
        }

        let mut meshes = vec![];
        let mut flat = vec![];
        let make_mesh = self.make_mesh && mode.shaded();
        if make_mesh {
            let image_scale = flat_image_scale(&design);
            for s in &design.shapes {
                cancel.checkpoint()?;
                let b = s.bounds();
                if b.bounded() {
                    meshes.push(make_mesh_root(&design, s, cancel, &mut log)?);
                } else if design.bounds.xy_bounded() && b.xy_bounded() {
                    flat.push(make_flat_image(
                        &design,
                        s.as_ref(),
                        image_scale,
                        cancel,
                        &mut log,
                    )?);
                } else {
                    return Err(Error::UnboundedGeometry);
                }
            }
        }

        cancel.checkpoint()?;
        self.stage.set(RenderStage::RenderingOutputs);
        let out = RenderOutput {
            mode,
            image: Image::merge(&images),
            flat: Image::merge(&flat),
            meshes: make_mesh.then_some(meshes),
            design,
            from_script,
            log: {
                let _ = write!(log, "# #    Total time: {:?}\n#", start.elapsed());
                log
            },
        };
        self.stage.set(RenderStage::Done);
        Ok(out)
    }

    /// Renders a height-map image, clipped to the view
    fn make_image(
        &self,
        design: &DesignResult,
        shape: &dyn Shape,
        cancel: &JobCancel,
        log: &mut String,
    ) -> Result<Image, Error> {
        let b = shape.bounds();
        let view = &self.view.bounds;
        let mut lower = view.lower;
        let mut upper = view.upper;
        for axis in 0..2 {
            let d = b.size(axis).unwrap_or(0.0) * design.border;
            if let Some(v) = b.lower[axis] {
                lower[axis] = lower[axis].max(v - d);
            }
            if let Some(v) = b.upper[axis] {
                upper[axis] = upper[axis].min(v + d);
            }
        }
        lower.z = design.bounds.lower[2].unwrap_or(0.0);
        upper.z = design.bounds.upper[2].unwrap_or(0.0);
        if (upper - lower).iter().any(|d| *d < 0.0) {
            // The shape is entirely outside of the view
            upper = upper.sup(&lower);
        }

        let region = Region::with_resolution(
            BoundingBox::new(lower, upper),
            self.view.pixels_per_unit,
        );
        let _ = writeln!(log, ">>  Rendering image");
        let now = Instant::now();
        let mut img = shape.render(&region, design.mm_per_unit, &cancel.hard)?;
        img.colorize(shape.color().unwrap_or([255; 3]));
        let _ = writeln!(log, "#   render time: {:?}", now.elapsed());
        Ok(img)
    }
}

/// Resolution for flat images of 2D shapes in the 3D view
///
/// Picks a resolution such that the largest flat shape is about a megapixel.
fn flat_image_scale(design: &DesignResult) -> f32 {
    design
        .shapes
        .iter()
        .map(|s| s.bounds())
        .filter(|b| !b.bounded())
        .filter_map(|b| Some(b.size(0)? * b.size(1)?))
        .filter(|area| *area > 0.0)
        .map(|area| (1e6 / area).sqrt())
        .reduce(f32::max)
        .unwrap_or(1.0)
}

fn make_flat_image(
    design: &DesignResult,
    shape: &dyn Shape,
    scale: f32,
    cancel: &JobCancel,
    log: &mut String,
) -> Result<Image, Error> {
    let b = shape.bounds();
    let mut lower = Vector3::zeros();
    let mut upper = Vector3::zeros();
    for axis in 0..2 {
        let (Some(lo), Some(hi), Some(d)) =
            (b.lower[axis], b.upper[axis], b.size(axis))
        else {
            return Err(Error::UnboundedGeometry);
        };
        lower[axis] = lo - d * design.border;
        upper[axis] = hi + d * design.border;
    }
    let region = Region::with_resolution(BoundingBox::new(lower, upper), scale);
    let _ = writeln!(log, ">>  Rendering flat image");
    let mut img = shape.render(&region, design.mm_per_unit, &cancel.hard)?;
    img.colorize(shape.color().unwrap_or([255; 3]));
    Ok(img)
}

/// Builds a depth-0 mesh octree root for a bounded shape
///
/// Starting from depth 0, retries at increasing depth until triangulation
/// produces vertices (or [`MESH_RETRY_DEPTH`] is reached); small features can
/// be missed entirely at coarse depths.
fn make_mesh_root(
    design: &DesignResult,
    shape: &Arc<dyn Shape>,
    cancel: &JobCancel,
    log: &mut String,
) -> Result<MeshCell, Error> {
    let _ = writeln!(log, ">>  Generating triangulated mesh");
    let bounds = shape
        .bounds()
        .to_box(design.border)
        .ok_or(Error::UnboundedGeometry)?;

    let mut depth = 0;
    let mesh = loop {
        let region = Region::with_depth(bounds, depth);
        let now = Instant::now();
        let asdf =
            shape.asdf(&region, design.mm_per_unit, true, &cancel.hard)?;
        let _ = writeln!(log, "#   ASDF render time: {:?}", now.elapsed());
        cancel.checkpoint()?;

        let now = Instant::now();
        let mesh = asdf.triangulate(&cancel.hard)?;
        let _ = writeln!(log, "#   Meshing time: {:?}", now.elapsed());
        if !mesh.is_empty() || depth >= MESH_RETRY_DEPTH {
            break mesh;
        }
        debug!("empty mesh at depth {depth}; retrying");
        depth += 1;
    };
    log_counts(log, &mesh);

    Ok(MeshCell::new(
        bounds,
        mesh,
        GeometrySource::Expression {
            shape: shape.clone(),
            depth,
            scale: design.mm_per_unit,
        },
    ))
}

fn log_counts(log: &mut String, mesh: &Mesh) {
    let _ = writeln!(
        log,
        "Generated {} vertices and {} triangles",
        mesh.vertex_count(),
        mesh.triangle_count()
    );
}
