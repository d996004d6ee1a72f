//! A tiny voxel geometry engine, used to drive the orchestrator from the
//! command line
//!
//! Scripts are line-oriented:
//!
//! ```text
//! # comments start with a hash
//! units mm            # or cm, in
//! mode shaded         # or height, both
//! sphere 0 0 0 5      # center and radius
//! box -4 -4 -1 4 4 1  # lower and upper corners
//! ```
use nalgebra::{Rotation3, Vector2, Vector3};
use std::{
    io::{BufRead, BufReader, Write},
    path::Path,
    sync::Arc,
};
use taskbot::{
    Error,
    cam::Stroke,
    cancel::CancelToken,
    design::{
        Asdf, AsdfLoader, Bounds, DesignResult, EvaluationError, Evaluator,
        RenderMode, Shape,
    },
    mesh::{Mesh, MeshCell},
    raster::Image,
    region::{BoundingBox, Detail, Region},
    sampler::{FlatRenderer, Framebuffer},
};

/// Voxels per axis when meshing a single octree cell
const CELL_VOXELS: usize = 8;

#[derive(Copy, Clone, Debug)]
enum Primitive {
    Sphere { center: Vector3<f32>, radius: f32 },
    Box { lower: Vector3<f32>, upper: Vector3<f32> },
}

impl Primitive {
    fn contains(&self, p: Vector3<f32>) -> bool {
        match self {
            Primitive::Sphere { center, radius } => {
                (p - center).norm() <= *radius
            }
            Primitive::Box { lower, upper } => (0..3)
                .all(|i| p[i] >= lower[i] && p[i] <= upper[i]),
        }
    }

    /// Highest point of the primitive above the given XY position
    fn top(&self, x: f32, y: f32) -> Option<f32> {
        match self {
            Primitive::Sphere { center, radius } => {
                let d2 = (x - center.x).powi(2) + (y - center.y).powi(2);
                let r2 = radius.powi(2);
                (d2 <= r2).then(|| center.z + (r2 - d2).sqrt())
            }
            Primitive::Box { lower, upper } => (x >= lower.x
                && x <= upper.x
                && y >= lower.y
                && y <= upper.y)
                .then_some(upper.z),
        }
    }

    fn bounding_box(&self) -> BoundingBox {
        match self {
            Primitive::Sphere { center, radius } => BoundingBox::new(
                center.add_scalar(-radius),
                center.add_scalar(*radius),
            ),
            Primitive::Box { lower, upper } => {
                BoundingBox::new(lower.inf(upper), lower.sup(upper))
            }
        }
    }
}

/// Shape built from a single primitive
pub struct VoxelShape(Primitive);

impl Shape for VoxelShape {
    fn bounds(&self) -> Bounds {
        Bounds::from_box(&self.0.bounding_box())
    }

    fn asdf(
        &self,
        region: &Region,
        _scale: f32,
        _merge_leafs: bool,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Asdf>, Error> {
        let size = region.bounds.size();
        let dims = match region.detail {
            Detail::Depth(..) => [CELL_VOXELS; 3],
            Detail::Resolution(r) => {
                std::array::from_fn(|i| ((size[i] * r).ceil() as usize).max(1))
            }
        };
        let step = Vector3::from_fn(|i, _| size[i] / dims[i] as f32);
        let mut field = VoxelField {
            lower: region.bounds.lower,
            step,
            dims,
            filled: Vec::with_capacity(
                dims.iter().map(|d| d + 2).product::<usize>(),
            ),
        };

        // One voxel of padding on every side, so that faces on the region's
        // boundary are only emitted where the surface actually is
        for k in 0..dims[2] + 2 {
            cancel.check()?;
            for j in 0..dims[1] + 2 {
                for i in 0..dims[0] + 2 {
                    let p = field.center(i, j, k);
                    field.filled.push(self.0.contains(p));
                }
            }
        }
        Ok(Box::new(field))
    }

    fn render(
        &self,
        region: &Region,
        _scale: f32,
        cancel: &CancelToken,
    ) -> Result<Image, Error> {
        let ppu = match region.detail {
            Detail::Resolution(r) => r,
            Detail::Depth(d) => (CELL_VOXELS << d) as f32,
        };
        let b = &region.bounds;
        let size = b.size();
        let width = ((size.x * ppu).ceil() as usize).max(1);
        let height = ((size.y * ppu).ceil() as usize).max(1);
        let mut img = Image::new(b.lower.xy(), ppu, width, height);
        for row in 0..height {
            cancel.check()?;
            let y = b.lower.y + (row as f32 + 0.5) / ppu;
            for col in 0..width {
                let x = b.lower.x + (col as f32 + 0.5) / ppu;
                let Some(z) = self.0.top(x, y) else { continue };
                if z < b.lower.z {
                    continue;
                }
                let frac = if size.z > 0.0 {
                    ((z.min(b.upper.z) - b.lower.z) / size.z).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                img.depth[row * width + col] = 1 + (frac * 65534.0) as u16;
            }
        }
        Ok(img)
    }

    fn write_math(&self, out: &mut dyn Write) -> std::io::Result<()> {
        match self.0 {
            Primitive::Sphere { center, radius } => write!(
                out,
                "sphere {} {} {} {radius}",
                center.x, center.y, center.z
            ),
            Primitive::Box { lower, upper } => write!(
                out,
                "box {} {} {} {} {} {}",
                lower.x, lower.y, lower.z, upper.x, upper.y, upper.z
            ),
        }
    }
}

/// Occupancy grid, padded by one voxel on each side
pub struct VoxelField {
    lower: Vector3<f32>,
    step: Vector3<f32>,
    dims: [usize; 3],
    filled: Vec<bool>,
}

impl VoxelField {
    /// Center of the voxel at the given (padded) index
    fn center(&self, i: usize, j: usize, k: usize) -> Vector3<f32> {
        let idx = Vector3::new(i, j, k).map(|v| v as f32 - 0.5);
        self.lower + idx.component_mul(&self.step)
    }

    fn get(&self, i: usize, j: usize, k: usize) -> bool {
        let [nx, ny, _] = self.dims.map(|d| d + 2);
        self.filled[i + nx * (j + ny * k)]
    }
}

impl Asdf for VoxelField {
    fn triangulate(&self, cancel: &CancelToken) -> Result<Mesh, Error> {
        let mut mesh = Mesh::new();
        for k in 1..=self.dims[2] {
            cancel.check()?;
            for j in 1..=self.dims[1] {
                for i in 1..=self.dims[0] {
                    if !self.get(i, j, k) {
                        continue;
                    }
                    let pos = [i, j, k];
                    for axis in 0..3 {
                        for dir in [-1isize, 1] {
                            let mut n = pos;
                            n[axis] = n[axis].wrapping_add_signed(dir);
                            if !self.get(n[0], n[1], n[2]) {
                                self.push_face(&mut mesh, pos, axis, dir > 0);
                            }
                        }
                    }
                }
            }
        }
        Ok(mesh)
    }

    /// Emits one segment per voxel edge on the boundary of the first layer
    fn contour(&self, cancel: &CancelToken) -> Result<Vec<Stroke>, Error> {
        let mut out = vec![];
        for j in 1..=self.dims[1] {
            cancel.check()?;
            for i in 1..=self.dims[0] {
                if !self.get(i, j, 1) {
                    continue;
                }
                let x0 = self.lower.x + (i - 1) as f32 * self.step.x;
                let y0 = self.lower.y + (j - 1) as f32 * self.step.y;
                let (x1, y1) = (x0 + self.step.x, y0 + self.step.y);
                let edges = [
                    (!self.get(i - 1, j, 1), (x0, y0), (x0, y1)),
                    (!self.get(i + 1, j, 1), (x1, y1), (x1, y0)),
                    (!self.get(i, j - 1, 1), (x1, y0), (x0, y0)),
                    (!self.get(i, j + 1, 1), (x0, y1), (x1, y1)),
                ];
                for (_, a, b) in edges.into_iter().filter(|e| e.0) {
                    out.push(Stroke::new(vec![
                        Vector3::new(a.0, a.1, 0.0),
                        Vector3::new(b.0, b.1, 0.0),
                    ]));
                }
            }
        }
        Ok(out)
    }

    fn save(&self, out: &mut dyn Write) -> Result<(), Error> {
        let [nx, ny, nz] = self.dims;
        writeln!(out, "voxels {nx} {ny} {nz}")?;
        writeln!(out, "{} {} {}", self.lower.x, self.lower.y, self.lower.z)?;
        writeln!(out, "{} {} {}", self.step.x, self.step.y, self.step.z)?;
        let bits = self
            .filled
            .iter()
            .map(|b| if *b { '1' } else { '0' })
            .collect::<String>();
        writeln!(out, "{bits}")?;
        Ok(())
    }
}

impl VoxelField {
    /// Adds a single square face to the mesh
    fn push_face(
        &self,
        mesh: &mut Mesh,
        pos: [usize; 3],
        axis: usize,
        upper: bool,
    ) {
        let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);
        let corner = |du: usize, dv: usize| {
            let mut p = pos.map(|c| c - 1);
            p[axis] += upper as usize;
            p[u] += du;
            p[v] += dv;
            self.lower
                + Vector3::from(p.map(|c| c as f32)).component_mul(&self.step)
        };
        let i = mesh.vertices.len();
        mesh.vertices.extend([
            corner(0, 0),
            corner(1, 0),
            corner(1, 1),
            corner(0, 1),
        ]);
        if upper {
            mesh.triangles.push(Vector3::new(i, i + 1, i + 2));
            mesh.triangles.push(Vector3::new(i, i + 2, i + 3));
        } else {
            mesh.triangles.push(Vector3::new(i, i + 2, i + 1));
            mesh.triangles.push(Vector3::new(i, i + 3, i + 2));
        }
    }
}

/// Loads voxel fields written by [`VoxelField::save`]
#[derive(Default)]
pub struct VoxelLoader;

impl AsdfLoader for VoxelLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Asdf>, Error> {
        if !path.exists() {
            return Err(Error::ExternalFileMissing(path.to_owned()));
        }
        let bad = || Error::Engine(format!("malformed voxel file {path:?}"));
        let mut lines = BufReader::new(std::fs::File::open(path)?).lines();
        let mut next = || -> Result<String, Error> {
            Ok(lines.next().ok_or_else(bad)??)
        };

        let header = next()?;
        let dims = header
            .strip_prefix("voxels ")
            .map(parse_floats)
            .and_then(|v| <[f32; 3]>::try_from(v).ok())
            .ok_or_else(bad)?
            .map(|d| d as usize);
        let mut vec3 = || -> Result<Vector3<f32>, Error> {
            let v = parse_floats(&next()?);
            <[f32; 3]>::try_from(v).map(Vector3::from).map_err(|_| bad())
        };
        let lower = vec3()?;
        let step = vec3()?;
        let filled = next()?.chars().map(|c| c == '1').collect::<Vec<_>>();
        if filled.len() != dims.iter().map(|d| d + 2).product::<usize>() {
            return Err(bad());
        }
        Ok(Box::new(VoxelField {
            lower,
            step,
            dims,
            filled,
        }))
    }
}

fn parse_floats(s: &str) -> Vec<f32> {
    s.split_whitespace().filter_map(|w| w.parse().ok()).collect()
}

/// Evaluates the line-oriented script format described in the module docs
#[derive(Default)]
pub struct ScriptEvaluator;

impl Evaluator for ScriptEvaluator {
    fn evaluate(
        &self,
        script: &str,
        cancel: &CancelToken,
    ) -> Result<DesignResult, EvaluationError> {
        let mut shapes: Vec<Arc<dyn Shape>> = vec![];
        let mut mode = None;
        let mut mm_per_unit = 1.0;
        for (i, line) in script.lines().enumerate() {
            if cancel.is_cancelled() {
                return Err(EvaluationError::new("evaluation cancelled"));
            }
            let err = |msg: String| {
                EvaluationError::new(format!("line {}: {msg}", i + 1))
            };
            let line = line.split('#').next().unwrap_or_default();
            let mut words = line.split_whitespace();
            let Some(cmd) = words.next() else { continue };
            let args = words.collect::<Vec<_>>();
            let nums = || -> Result<Vec<f32>, EvaluationError> {
                args.iter()
                    .map(|a| {
                        a.parse::<f32>()
                            .map_err(|_| err(format!("invalid number `{a}`")))
                    })
                    .collect()
            };
            match (cmd, args.as_slice()) {
                ("sphere", _) => {
                    let [x, y, z, r] = nums()?[..] else {
                        return Err(err("sphere takes 4 arguments".to_owned()));
                    };
                    if r <= 0.0 {
                        return Err(err("radius must be positive".to_owned()));
                    }
                    shapes.push(Arc::new(VoxelShape(Primitive::Sphere {
                        center: Vector3::new(x, y, z),
                        radius: r,
                    })));
                }
                ("box", _) => {
                    let [x0, y0, z0, x1, y1, z1] = nums()?[..] else {
                        return Err(err("box takes 6 arguments".to_owned()));
                    };
                    shapes.push(Arc::new(VoxelShape(Primitive::Box {
                        lower: Vector3::new(x0, y0, z0),
                        upper: Vector3::new(x1, y1, z1),
                    })));
                }
                ("units", [u]) => {
                    mm_per_unit = match u.to_lowercase().as_str() {
                        "mm" => 1.0,
                        "cm" => 10.0,
                        "in" => 25.4,
                        _ => return Err(err(format!("unknown unit `{u}`"))),
                    }
                }
                ("mode", [m]) => {
                    mode = Some(match *m {
                        "shaded" => RenderMode::Shaded,
                        "height" => RenderMode::Height,
                        "both" => RenderMode::Both,
                        _ => return Err(err(format!("unknown mode `{m}`"))),
                    })
                }
                _ => return Err(err(format!("unknown command `{cmd}`"))),
            }
        }
        let mut design = DesignResult::new(shapes);
        design.render_mode = mode;
        design.mm_per_unit = mm_per_unit;
        Ok(design)
    }
}

/// Software renderer which draws leaves from an isometric viewpoint
///
/// The camera is framed around the union of every leaf's bounds, so that the
/// model spans `zoom` times the width (or height) of the image.
pub struct IsoRenderer {
    /// Image size, in pixels
    pub size: usize,
    /// Fraction of the image covered by the model
    pub zoom: f32,
}

impl FlatRenderer for IsoRenderer {
    fn is_shown(&self) -> bool {
        true
    }

    fn draw_flat(&mut self, leaves: &[(&MeshCell, [u8; 3])]) -> Framebuffer {
        let n = self.size;
        let mut fb = Framebuffer {
            width: n,
            height: n,
            pixels: vec![[0; 3]; n * n],
        };
        let rot = Rotation3::from_euler_angles(
            -std::f32::consts::FRAC_PI_4 * 1.2,
            0.0,
            std::f32::consts::FRAC_PI_4,
        );

        // Frame the camera on the rotated corners of every leaf
        let corners = leaves.iter().flat_map(|(c, _)| {
            let b = c.bounds();
            (0..8).map(move |i| {
                rot * Vector3::from_fn(|a, _| {
                    if i & (1 << a) != 0 { b.upper[a] } else { b.lower[a] }
                })
            })
        });
        let Some((lo, hi)) = corners.fold(None, |acc, p| match acc {
            None => Some((p, p)),
            Some((lo, hi)) => Some((p.inf(&lo), p.sup(&hi))),
        }) else {
            return fb;
        };
        let center = (lo + hi).xy() / 2.0;
        let extent = (hi - lo).xy().max().max(f32::EPSILON);
        let scale = self.zoom * n as f32 / extent;
        let project = |p: Vector3<f32>| {
            let q = rot * p;
            let xy = (q.xy() - center) * scale + Vector2::repeat(n as f32 / 2.0);
            Vector3::new(xy.x, xy.y, q.z)
        };

        let mut depth = vec![f32::NEG_INFINITY; n * n];
        for (cell, color) in leaves {
            let Some(mesh) = cell.geometry() else { continue };
            let verts =
                mesh.vertices.iter().map(|v| project(*v)).collect::<Vec<_>>();
            for t in &mesh.triangles {
                let tri = [verts[t.x], verts[t.y], verts[t.z]];
                fill_triangle(tri, *color, &mut fb, &mut depth);
            }
        }
        fb
    }
}

/// Rasterizes a single screen-space triangle with depth testing
///
/// Larger Z values are closer to the camera.
fn fill_triangle(
    [a, b, c]: [Vector3<f32>; 3],
    color: [u8; 3],
    fb: &mut Framebuffer,
    depth: &mut [f32],
) {
    let edge = |p: &Vector3<f32>, q: &Vector3<f32>, x: f32, y: f32| {
        (q.x - p.x) * (y - p.y) - (q.y - p.y) * (x - p.x)
    };
    let area = edge(&a, &b, c.x, c.y);
    if area.abs() < f32::EPSILON {
        return;
    }
    let clamp = |v: f32, n: usize| (v.max(0.0) as usize).min(n);
    let x0 = clamp(a.x.min(b.x).min(c.x).floor(), fb.width);
    let x1 = clamp(a.x.max(b.x).max(c.x).ceil(), fb.width);
    let y0 = clamp(a.y.min(b.y).min(c.y).floor(), fb.height);
    let y1 = clamp(a.y.max(b.y).max(c.y).ceil(), fb.height);
    for y in y0..y1 {
        let py = y as f32 + 0.5;
        for x in x0..x1 {
            let px = x as f32 + 0.5;
            let w0 = edge(&b, &c, px, py) / area;
            let w1 = edge(&c, &a, px, py) / area;
            let w2 = edge(&a, &b, px, py) / area;
            if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                continue;
            }
            let z = w0 * a.z + w1 * b.z + w2 * c.z;
            let i = x + y * fb.width;
            if z > depth[i] {
                depth[i] = z;
                fb.pixels[i] = color;
            }
        }
    }
}
