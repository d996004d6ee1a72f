//! Designs produced by the external evaluator, and the geometry interfaces
//! that they expose
//!
//! Everything in this module is implemented outside of `taskbot`: a script
//! evaluator turns text into a [`DesignResult`], and each [`Shape`] in that
//! design knows how to build distance fields ([`Asdf`]) and height-map images
//! through a native geometry engine.  Every potentially long-running call
//! takes a [`CancelToken`], which the engine must poll.
use crate::{
    Error,
    cam::Stroke,
    cancel::CancelToken,
    mesh::Mesh,
    raster::Image,
    region::{BoundingBox, Region},
};
use nalgebra::Vector3;
use std::{io::Write, path::Path, sync::Arc};

/// A single expression shape within a design
pub trait Shape: Send + Sync {
    /// Bounds of the shape, in design units
    fn bounds(&self) -> Bounds;

    /// Display color, if the design assigned one
    fn color(&self) -> Option<[u8; 3]> {
        None
    }

    /// Builds an adaptively-sampled distance field over the given region
    ///
    /// `scale` is the design's millimeters-per-unit.  If `merge_leafs` is
    /// set, the engine may combine leaf cells that are well-approximated by
    /// their parent, trading accuracy for a smaller field.
    fn asdf(
        &self,
        region: &Region,
        scale: f32,
        merge_leafs: bool,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Asdf>, Error>;

    /// Renders a height-map image of the given region
    fn render(
        &self,
        region: &Region,
        scale: f32,
        cancel: &CancelToken,
    ) -> Result<Image, Error>;

    /// Writes the shape's math string, as consumed by the fab modules
    fn write_math(&self, out: &mut dyn Write) -> std::io::Result<()>;
}

/// An adaptively-sampled distance field, owned by the geometry engine
pub trait Asdf: Send {
    /// Triangulates the distance field
    fn triangulate(&self, cancel: &CancelToken) -> Result<Mesh, Error>;

    /// Triangulates the distance field with cubical marching squares
    ///
    /// Engines without a CMS mesher fall back to
    /// [`triangulate`](Self::triangulate).
    fn triangulate_cms(&self, cancel: &CancelToken) -> Result<Mesh, Error> {
        self.triangulate(cancel)
    }

    /// Finds the contours of a flat (2D) distance field
    ///
    /// Points are in design units, with Z set to zero.
    fn contour(&self, cancel: &CancelToken) -> Result<Vec<Stroke>, Error>;

    /// Writes the distance field in the engine's native format
    fn save(&self, out: &mut dyn Write) -> Result<(), Error>;
}

/// Loads distance fields from disk
pub trait AsdfLoader: Send + Sync {
    /// Loads the ASDF stored at `path`
    fn load(&self, path: &Path) -> Result<Box<dyn Asdf>, Error>;
}

/// Turns script text into a design
pub trait Evaluator: Send + Sync {
    /// Runs the script
    ///
    /// Evaluators which can be interrupted should poll `cancel`; others are
    /// free to ignore it.
    fn evaluate(
        &self,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<DesignResult, EvaluationError>;
}

/// Diagnostic returned by a failed script evaluation
#[derive(Clone, Debug)]
pub struct EvaluationError {
    /// Human-readable diagnostic, possibly multi-line
    pub message: String,
}

impl EvaluationError {
    /// Builds a new error from a diagnostic message
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Finds the (zero-indexed) line number named by the diagnostic
    ///
    /// Diagnostics may mention several lines, e.g. in a traceback; the last
    /// mention of `line N` is the innermost one and wins.
    pub fn line(&self) -> Option<usize> {
        let mut out = None;
        let mut rest = self.message.as_str();
        while let Some(i) = rest.find("line ") {
            rest = &rest[i + "line ".len()..];
            let digits = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if let Ok(n) = rest[..digits].parse::<usize>() {
                out = n.checked_sub(1).or(out);
            }
        }
        out
    }
}

impl From<EvaluationError> for Error {
    fn from(e: EvaluationError) -> Self {
        Error::ScriptEvaluation {
            line: e.line(),
            message: e.message,
        }
    }
}

/// Render mode requested by a design or by the view
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RenderMode {
    /// Triangulated 3D meshes
    Shaded,
    /// Height-map images
    Height,
    /// Both meshes and images
    Both,
}

impl RenderMode {
    /// Checks whether this mode draws triangulated meshes
    pub fn shaded(&self) -> bool {
        matches!(self, RenderMode::Shaded | RenderMode::Both)
    }

    /// Checks whether this mode draws height-map images
    pub fn height(&self) -> bool {
        matches!(self, RenderMode::Height | RenderMode::Both)
    }
}

/// Axis-aligned bounds, where each bound may be missing
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Bounds {
    /// Lower bounds on each axis
    pub lower: [Option<f32>; 3],
    /// Upper bounds on each axis
    pub upper: [Option<f32>; 3],
}

impl Bounds {
    /// Builds fully-specified bounds from a bounding box
    pub fn from_box(b: &BoundingBox) -> Self {
        Self {
            lower: [Some(b.lower.x), Some(b.lower.y), Some(b.lower.z)],
            upper: [Some(b.upper.x), Some(b.upper.y), Some(b.upper.z)],
        }
    }

    /// Builds bounds on the X and Y axes only
    pub fn flat(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            lower: [Some(xmin), Some(ymin), None],
            upper: [Some(xmax), Some(ymax), None],
        }
    }

    /// Size on the given axis, if both bounds are present
    pub fn size(&self, axis: usize) -> Option<f32> {
        Some(self.upper[axis]? - self.lower[axis]?)
    }

    /// Checks whether the X and Y axes are bounded
    pub fn xy_bounded(&self) -> bool {
        self.size(0).is_some() && self.size(1).is_some()
    }

    /// Checks whether all three axes are bounded
    pub fn bounded(&self) -> bool {
        self.xy_bounded() && self.size(2).is_some()
    }

    /// Converts to a bounding box, widened by `border` times the size on
    /// each axis
    ///
    /// Returns `None` unless all three axes are bounded.
    pub fn to_box(&self, border: f32) -> Option<BoundingBox> {
        let mut lower = Vector3::zeros();
        let mut upper = Vector3::zeros();
        for axis in 0..3 {
            let d = self.size(axis)? * border;
            lower[axis] = self.lower[axis]? - d;
            upper[axis] = self.upper[axis]? + d;
        }
        Some(BoundingBox::new(lower, upper))
    }

    /// Union of two sets of bounds
    ///
    /// A bound is only present in the output if it's present in both inputs.
    pub fn union(&self, other: &Bounds) -> Bounds {
        let mut out = Bounds::default();
        for axis in 0..3 {
            out.lower[axis] = self.lower[axis]
                .zip(other.lower[axis])
                .map(|(a, b)| a.min(b));
            out.upper[axis] = self.upper[axis]
                .zip(other.upper[axis])
                .map(|(a, b)| a.max(b));
        }
        out
    }
}

/// Result of evaluating a design script
///
/// After publication, a design is shared read-only behind an `Arc` and is
/// never modified; re-rendering produces a new `DesignResult`.
#[derive(Clone)]
pub struct DesignResult {
    /// Shapes to render
    pub shapes: Vec<Arc<dyn Shape>>,
    /// Render mode forced by the design, if any
    pub render_mode: Option<RenderMode>,
    /// Millimeters per design unit
    pub mm_per_unit: f32,
    /// Fractional border added around each shape's bounds when rendering
    pub border: f32,
    /// Combined bounds of every shape
    pub bounds: Bounds,
}

impl DesignResult {
    /// Builds a design from a set of shapes, deriving its bounds
    pub fn new(shapes: Vec<Arc<dyn Shape>>) -> Self {
        let bounds = shapes
            .iter()
            .map(|s| s.bounds())
            .reduce(|a, b| a.union(&b))
            .unwrap_or_default();
        Self {
            shapes,
            render_mode: None,
            mm_per_unit: 1.0,
            border: 0.05,
            bounds,
        }
    }

    /// Writes the design as a math file, for consumption by the fab modules
    pub fn write(&self, out: &mut dyn Write) -> std::io::Result<()> {
        fn opt(v: Option<f32>) -> String {
            v.map(|v| v.to_string()).unwrap_or_else(|| "none".to_owned())
        }
        writeln!(out, "format: taskbot-math 1")?;
        writeln!(out, "mm_per_unit: {}", self.mm_per_unit)?;
        for (axis, name) in ["x", "y", "z"].iter().enumerate() {
            writeln!(
                out,
                "{name}: {} {}",
                opt(self.bounds.lower[axis]),
                opt(self.bounds.upper[axis])
            )?;
        }
        for s in &self.shapes {
            write!(out, "shape: ")?;
            s.write_math(out)?;
            writeln!(out)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for DesignResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DesignResult")
            .field("shapes", &self.shapes.len())
            .field("render_mode", &self.render_mode)
            .field("mm_per_unit", &self.mm_per_unit)
            .field("bounds", &self.bounds)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_line() {
        let e = EvaluationError::new("boom");
        assert_eq!(e.line(), None);

        let e = EvaluationError::new(
            "Traceback:\n  File \"<string>\", line 12, in <module>\n  \
             File \"<string>\", line 4, in helper\nNameError",
        );
        assert_eq!(e.line(), Some(3));

        let e = EvaluationError::new("Variable not found: x (line 7, position 2)");
        assert_eq!(e.line(), Some(6));

        match Error::from(e) {
            Error::ScriptEvaluation { line, .. } => assert_eq!(line, Some(6)),
            e => panic!("unexpected error {e:?}"),
        }
    }

    #[test]
    fn bounds_union() {
        let a = Bounds::from_box(&BoundingBox::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 1.0, 1.0),
        ));
        let b = Bounds::flat(-1.0, 0.5, 0.5, 2.0);
        let u = a.union(&b);
        assert_eq!(u.lower, [Some(-1.0), Some(0.0), None]);
        assert_eq!(u.upper, [Some(1.0), Some(2.0), None]);
        assert!(u.xy_bounded());
        assert!(!u.bounded());
        assert!(u.to_box(0.0).is_none());
        assert!(a.bounded());

        let bb = a.to_box(0.5).unwrap();
        assert_eq!(bb.lower, Vector3::new(-0.5, -0.5, -0.5));
        assert_eq!(bb.upper, Vector3::new(1.5, 1.5, 1.5));
    }

    #[test]
    fn render_modes() {
        assert!(RenderMode::Both.shaded() && RenderMode::Both.height());
        assert!(!RenderMode::Height.shaded());
        assert_eq!(RenderMode::Shaded.to_string(), "shaded");
    }
}
