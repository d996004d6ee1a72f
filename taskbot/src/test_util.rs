//! Fake geometry engine, evaluator, and sampler for unit tests
//!
//! These are exported when the `test-util` feature is enabled, so that
//! integration tests (and downstream crates) can drive the orchestrator
//! without a real geometry engine.
//!
//! [`FakeEvaluator`] understands a tiny line-oriented language:
//!
//! - `cube` adds a shape bounded on all three axes (the unit cube)
//! - `flat` adds a shape bounded only on X and Y
//! - `unbounded` adds a shape with no bounds
//! - `delay N` sleeps for `N` milliseconds (cancellable)
//! - `fail` makes evaluation fail, naming the current line
//! - `shaded` / `height` force the design's render mode
//!
//! Blank lines are ignored; anything else is an error.
use crate::{
    Error,
    cam::Stroke,
    cancel::CancelToken,
    design::{
        Asdf, AsdfLoader, Bounds, DesignResult, EvaluationError, Evaluator,
        RenderMode, Shape,
    },
    mesh::{CellId, GeometrySource, Mesh, MeshCell, Snapshot},
    raster::Image,
    region::{BoundingBox, Detail, Region},
    sampler::ScreenSampler,
};
use nalgebra::Vector3;
use std::{
    collections::HashMap,
    io::Write,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

/// Sleeps for the given duration, bailing out early if `cancel` is set
pub fn cancellable_sleep(
    d: Duration,
    cancel: &CancelToken,
) -> Result<(), Error> {
    let end = Instant::now() + d;
    while Instant::now() < end {
        cancel.check()?;
        std::thread::sleep(Duration::from_millis(1));
    }
    cancel.check()
}

/// Returns the unit cube `[0, 1]³`
pub fn unit_box() -> BoundingBox {
    BoundingBox::new(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0))
}

/// Builds a single triangle spanning the given box
pub fn triangle_in(b: &BoundingBox) -> Mesh {
    Mesh {
        vertices: vec![
            b.lower,
            Vector3::new(b.upper.x, b.lower.y, b.center().z),
            Vector3::new(b.lower.x, b.upper.y, b.upper.z),
        ],
        triangles: vec![Vector3::new(0, 1, 2)],
    }
}

/// Fake shape, which produces one triangle per distance field
pub struct FakeShape {
    /// Bounds reported by the shape
    pub bounds: Bounds,
    /// Distance fields shallower than this depth triangulate to nothing
    pub min_depth: u8,
    /// Delay applied to every `asdf` call
    pub delay: Duration,
    /// Number of calls to `asdf`
    pub asdf_calls: AtomicUsize,
}

impl FakeShape {
    /// Builds a shape with the given bounds
    pub fn new(bounds: Bounds) -> Self {
        Self {
            bounds,
            min_depth: 0,
            delay: Duration::ZERO,
            asdf_calls: AtomicUsize::new(0),
        }
    }

    /// Builds a shape bounded by the unit cube
    pub fn cube() -> Self {
        Self::new(Bounds::from_box(&unit_box()))
    }
}

impl Shape for FakeShape {
    fn bounds(&self) -> Bounds {
        self.bounds
    }

    fn color(&self) -> Option<[u8; 3]> {
        Some([255, 128, 0])
    }

    fn asdf(
        &self,
        region: &Region,
        _scale: f32,
        merge_leafs: bool,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Asdf>, Error> {
        self.asdf_calls.fetch_add(1, Ordering::Relaxed);
        cancellable_sleep(self.delay, cancel)?;
        let empty = match region.detail {
            Detail::Depth(d) => d < self.min_depth,
            Detail::Resolution(..) => false,
        };
        Ok(Box::new(FakeAsdf {
            bounds: region.bounds,
            empty,
            merged: merge_leafs,
        }))
    }

    fn render(
        &self,
        region: &Region,
        _scale: f32,
        cancel: &CancelToken,
    ) -> Result<Image, Error> {
        cancel.check()?;
        let ppu = match region.detail {
            Detail::Resolution(r) => r,
            Detail::Depth(d) => (1 << d) as f32,
        };
        let size = region.bounds.size() * ppu;
        let mut img = Image::new(
            region.bounds.lower.xy(),
            ppu,
            size.x.round() as usize,
            size.y.round() as usize,
        );
        img.depth.fill(1);
        Ok(img)
    }

    fn write_math(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write!(out, "fake")
    }
}

/// Distance field produced by [`FakeShape`] and [`FakeLoader`]
pub struct FakeAsdf {
    /// Region covered by this field
    pub bounds: BoundingBox,
    /// If true, triangulation produces no geometry
    pub empty: bool,
    /// Whether the field was built with merged leafs
    pub merged: bool,
}

impl Asdf for FakeAsdf {
    fn triangulate(&self, cancel: &CancelToken) -> Result<Mesh, Error> {
        cancel.check()?;
        if self.empty {
            Ok(Mesh::new())
        } else {
            Ok(triangle_in(&self.bounds))
        }
    }

    /// Produces two triangles, so that callers can tell the meshers apart
    fn triangulate_cms(&self, cancel: &CancelToken) -> Result<Mesh, Error> {
        let t = self.triangulate(cancel)?;
        Ok(Mesh::merge(&[t.clone(), t]))
    }

    /// Returns the outline of the field's XY footprint
    fn contour(&self, cancel: &CancelToken) -> Result<Vec<Stroke>, Error> {
        cancel.check()?;
        if self.empty {
            return Ok(vec![]);
        }
        let (lo, hi) = (self.bounds.lower, self.bounds.upper);
        Ok(vec![Stroke {
            points: vec![
                Vector3::new(lo.x, lo.y, 0.0),
                Vector3::new(hi.x, lo.y, 0.0),
                Vector3::new(hi.x, hi.y, 0.0),
                Vector3::new(lo.x, hi.y, 0.0),
            ],
            closed: true,
        }])
    }

    fn save(&self, out: &mut dyn Write) -> Result<(), Error> {
        writeln!(
            out,
            "asdf {:?} {:?} merged={}",
            self.bounds.lower, self.bounds.upper, self.merged
        )?;
        Ok(())
    }
}

/// Loader which ignores file contents, returning a unit-cube field
#[derive(Default)]
pub struct FakeLoader;

impl AsdfLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Asdf>, Error> {
        if !path.exists() {
            return Err(Error::ExternalFileMissing(path.to_owned()));
        }
        Ok(Box::new(FakeAsdf {
            bounds: unit_box(),
            empty: false,
            merged: false,
        }))
    }
}

/// Evaluator for the tiny language described in the module docs
#[derive(Default)]
pub struct FakeEvaluator {
    /// Number of scripts evaluated
    pub calls: AtomicUsize,
}

impl Evaluator for FakeEvaluator {
    fn evaluate(
        &self,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<DesignResult, EvaluationError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut shapes: Vec<Arc<dyn Shape>> = vec![];
        let mut mode = None;
        for (i, line) in script.lines().enumerate() {
            let words = line.split_whitespace().collect::<Vec<_>>();
            match words.as_slice() {
                [] => (),
                ["cube"] => shapes.push(Arc::new(FakeShape::cube())),
                ["flat"] => shapes.push(Arc::new(FakeShape::new(
                    Bounds::flat(0.0, 0.0, 1.0, 1.0),
                ))),
                ["unbounded"] => {
                    shapes.push(Arc::new(FakeShape::new(Bounds::default())))
                }
                ["shaded"] => mode = Some(RenderMode::Shaded),
                ["height"] => mode = Some(RenderMode::Height),
                ["delay", ms] => {
                    let ms = ms.parse::<u64>().map_err(|e| {
                        EvaluationError::new(format!("{e} (line {})", i + 1))
                    })?;
                    cancellable_sleep(Duration::from_millis(ms), cancel)
                        .map_err(|_| EvaluationError::new("interrupted"))?;
                }
                ["fail"] => {
                    return Err(EvaluationError::new(format!(
                        "failed on purpose (line {})",
                        i + 1
                    )));
                }
                _ => {
                    return Err(EvaluationError::new(format!(
                        "unknown statement {line:?} (line {})",
                        i + 1
                    )));
                }
            }
        }
        let mut d = DesignResult::new(shapes);
        d.render_mode = mode;
        d.border = 0.0;
        Ok(d)
    }
}

/// Sampler returning a fixed set of scores
pub struct FixedSampler {
    /// Scores to return
    pub scores: HashMap<CellId, f32>,
    /// Value returned by `is_shown`
    pub shown: bool,
    /// Number of calls to `sample`
    pub calls: usize,
}

impl FixedSampler {
    /// Builds a sampler returning the given scores
    pub fn new<I: IntoIterator<Item = (CellId, f32)>>(scores: I) -> Self {
        Self {
            scores: scores.into_iter().collect(),
            shown: true,
            calls: 0,
        }
    }
}

impl ScreenSampler for FixedSampler {
    fn is_shown(&self) -> bool {
        self.shown
    }

    fn sample(&mut self, leaves: &[&MeshCell]) -> HashMap<CellId, f32> {
        self.calls += 1;
        leaves
            .iter()
            .filter_map(|c| Some((c.id(), *self.scores.get(&c.id())?)))
            .collect()
    }
}

/// Sampler which gives every leaf a score computed from its depth
///
/// Leaf scores are `f(depth)`; this is handy for driving the LOD controller
/// through many ticks without tracking cell ids.
pub struct DepthSampler<F> {
    /// Score function
    pub f: F,
}

impl<F: Fn(u8) -> f32> ScreenSampler for DepthSampler<F> {
    fn is_shown(&self) -> bool {
        true
    }

    fn sample(&mut self, leaves: &[&MeshCell]) -> HashMap<CellId, f32> {
        leaves.iter().map(|c| (c.id(), (self.f)(c.depth()))).collect()
    }
}

/// Builds a leaf cell over the appropriate octant-sized box at `depth`
///
/// The cell is built from a [`FakeShape`] expression.
pub fn leaf(depth: u8) -> MeshCell {
    let scale = 0.5f32.powi(depth as i32);
    let bounds = BoundingBox::new(
        Vector3::zeros(),
        Vector3::new(scale, scale, scale),
    );
    MeshCell::new(
        bounds,
        triangle_in(&bounds),
        GeometrySource::Expression {
            shape: Arc::new(FakeShape::cube()),
            depth,
            scale: 1.0,
        },
    )
}

/// Refines a leaf cell in-memory, as a refine job would
///
/// Every new child carries a snapshot of its geometry, and the parent
/// carries a snapshot of its old geometry.
///
/// # Panics
/// If the cell is not a leaf
pub fn refined(cell: MeshCell) -> MeshCell {
    let geometry = cell.geometry().expect("cell must be a leaf");
    let snapshot = Snapshot::capture(geometry).unwrap();
    let children = (0..8)
        .map(|i| {
            let b = cell.bounds().octant(i);
            let mesh = triangle_in(&b);
            let s = Snapshot::capture(&mesh).unwrap();
            MeshCell::new(b, mesh, cell.source().child(i)).with_snapshot(s)
        })
        .collect();
    cell.into_refined(children, Some(snapshot))
}
