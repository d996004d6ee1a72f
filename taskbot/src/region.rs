//! Axis-aligned boxes and evaluation regions
use nalgebra::Vector3;

/// Closed axis-aligned bounding box
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    /// Lower corner
    pub lower: Vector3<f32>,
    /// Upper corner
    pub upper: Vector3<f32>,
}

impl BoundingBox {
    /// Builds a new bounding box
    ///
    /// # Panics
    /// If `lower` is above `upper` on any axis (in debug builds)
    pub fn new(lower: Vector3<f32>, upper: Vector3<f32>) -> Self {
        debug_assert!(lower.iter().zip(upper.iter()).all(|(a, b)| a <= b));
        Self { lower, upper }
    }

    /// Size of the box on each axis
    pub fn size(&self) -> Vector3<f32> {
        self.upper - self.lower
    }

    /// Center of the box
    pub fn center(&self) -> Vector3<f32> {
        (self.lower + self.upper) / 2.0
    }

    /// Returns one octant of this box
    ///
    /// Bit 0 of `i` selects the upper half on the X axis, bit 1 the upper half
    /// on the Y axis, and bit 2 the upper half on the Z axis.
    ///
    /// # Panics
    /// If `i >= 8`
    pub fn octant(&self, i: usize) -> Self {
        assert!(i < 8);
        let mid = self.center();
        let mut lower = self.lower;
        let mut upper = self.upper;
        for axis in 0..3 {
            if i & (1 << axis) != 0 {
                lower[axis] = mid[axis];
            } else {
                upper[axis] = mid[axis];
            }
        }
        Self { lower, upper }
    }

    /// Splits the box into its eight octants, in octant order
    pub fn split(&self) -> [Self; 8] {
        std::array::from_fn(|i| self.octant(i))
    }

    /// Checks whether `other` is (approximately) equal to this box
    pub fn approx_eq(&self, other: &Self, eps: f32) -> bool {
        (self.lower - other.lower).amax() <= eps
            && (self.upper - other.upper).amax() <= eps
    }
}

/// Level of detail at which a region is evaluated
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Detail {
    /// Octree depth, used when streaming meshes
    Depth(u8),
    /// Voxels per (design) unit, used for images and exports
    Resolution(f32),
}

/// Region handed to the geometry engine
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Region {
    /// Bounds of the region, in design units
    pub bounds: BoundingBox,
    /// Requested level of detail
    pub detail: Detail,
}

impl Region {
    /// Builds a region evaluated at the given octree depth
    pub fn with_depth(bounds: BoundingBox, depth: u8) -> Self {
        Self {
            bounds,
            detail: Detail::Depth(depth),
        }
    }

    /// Builds a region evaluated at the given resolution
    pub fn with_resolution(bounds: BoundingBox, per_unit: f32) -> Self {
        Self {
            bounds,
            detail: Detail::Resolution(per_unit),
        }
    }
}
