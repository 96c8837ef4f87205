#![warn(missing_docs)]

//! Geometric primitives for the hexspring mesher.
//!
//! Thin wrappers around nalgebra plus the small set of solid-geometry
//! helpers the grid core needs: bounding boxes, line segments, planes,
//! triangle measures, and a box-keyed spatial tree over indices.

use nalgebra::Vector3;

pub mod spatial;

pub use spatial::SpatialTree;

/// A point or displacement in 3D space. The mesher does not distinguish
/// points from vectors; everything is a double-precision triple.
pub type Vec3 = Vector3<f64>;

/// Distance below which two points are considered the same.
pub const SAME_DIST_TOL: f64 = 1.0e-8;

/// `SAME_DIST_TOL` squared, for squared-distance comparisons.
pub const SAME_DIST_TOL_SQR: f64 = SAME_DIST_TOL * SAME_DIST_TOL;

/// Step size below which the line-search optimiser stops.
pub const OPTIMIZER_TOL: f64 = 1.0e-6;

/// Magnitude below which a vector is not normalised (treated as zero).
pub const MIN_NORMALIZE_DIVISOR: f64 = 1.0e-12;

/// Decimal digits written for points in grid files.
pub const FILE_PRECISION: usize = 15;

/// Unit X axis.
pub const AXIS_X: Vec3 = Vec3::new(1.0, 0.0, 0.0);
/// Unit Y axis.
pub const AXIS_Y: Vec3 = Vec3::new(0.0, 1.0, 0.0);
/// Unit Z axis.
pub const AXIS_Z: Vec3 = Vec3::new(0.0, 0.0, 1.0);

/// The three coordinate axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// X.
    X = 0,
    /// Y.
    Y = 1,
    /// Z.
    Z = 2,
}

impl Axis {
    /// All three axes in order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// The unit vector along this axis.
    pub fn unit(self) -> Vec3 {
        match self {
            Axis::X => AXIS_X,
            Axis::Y => AXIS_Y,
            Axis::Z => AXIS_Z,
        }
    }
}

/// Scalar equality within `SAME_DIST_TOL`.
pub fn tolerant_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < SAME_DIST_TOL
}

/// Point equality within `SAME_DIST_TOL` (per the Euclidean norm).
pub fn tolerant_eq_pt(a: &Vec3, b: &Vec3) -> bool {
    (a - b).norm() < SAME_DIST_TOL
}

/// Panics on NaN or infinity. Numeric inner loops have no sensible
/// recovery from a poisoned value.
pub fn check_finite(v: f64) {
    if !v.is_finite() {
        panic!("non-finite value in geometric computation: {v}");
    }
}

/// Normalise, returning `None` when the magnitude is below
/// `MIN_NORMALIZE_DIVISOR`.
pub fn safe_normalize(v: &Vec3) -> Option<Vec3> {
    let mag = v.norm();
    if mag < MIN_NORMALIZE_DIVISOR {
        None
    } else {
        Some(v / mag)
    }
}

/// An axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Minimum corner.
    pub min: Vec3,
    /// Maximum corner.
    pub max: Vec3,
}

impl BoundingBox {
    /// An empty (inverted) box suitable for merging.
    pub fn empty() -> Self {
        Self {
            min: Vec3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            max: Vec3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    /// A box from min and max corners.
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// A degenerate box containing a single point.
    pub fn from_point(pt: &Vec3) -> Self {
        Self { min: *pt, max: *pt }
    }

    /// True if no point has been merged yet.
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    /// Grow to include a point.
    pub fn merge_point(&mut self, pt: &Vec3) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(pt[i]);
            self.max[i] = self.max[i].max(pt[i]);
        }
    }

    /// Grow to include another box.
    pub fn merge(&mut self, other: &BoundingBox) {
        if !other.is_empty() {
            self.merge_point(&other.min);
            self.merge_point(&other.max);
        }
    }

    /// Expand by `dist` in all six directions.
    pub fn grow(&mut self, dist: f64) {
        for i in 0..3 {
            self.min[i] -= dist;
            self.max[i] += dist;
        }
    }

    /// Extent along each axis.
    pub fn range(&self) -> Vec3 {
        self.max - self.min
    }

    /// Point containment (closed box).
    pub fn contains(&self, pt: &Vec3) -> bool {
        (0..3).all(|i| self.min[i] <= pt[i] && pt[i] <= self.max[i])
    }

    /// Overlap test; touching counts.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        (0..3).all(|i| self.min[i] <= other.max[i] && self.max[i] >= other.min[i])
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::empty()
    }
}

/// A line segment between two points.
#[derive(Debug, Clone, Copy)]
pub struct LineSegment {
    /// Start point.
    pub p0: Vec3,
    /// End point.
    pub p1: Vec3,
}

/// Closest-approach result for a point against a segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentApproach {
    /// Distance to the closest point on the segment (endpoints clamp).
    pub dist: f64,
    /// Unclamped projection parameter; < 0 before the start, > 1 past
    /// the end.
    pub t: f64,
}

impl LineSegment {
    /// A segment from `p0` to `p1`.
    pub fn new(p0: Vec3, p1: Vec3) -> Self {
        Self { p0, p1 }
    }

    /// Segment length.
    pub fn length(&self) -> f64 {
        (self.p1 - self.p0).norm()
    }

    /// Unit direction from `p0` to `p1`.
    pub fn dir(&self) -> Vec3 {
        safe_normalize(&(self.p1 - self.p0)).unwrap_or_else(Vec3::zeros)
    }

    /// Point at parameter `t` (0 = start, 1 = end, unclamped).
    pub fn interpolate(&self, t: f64) -> Vec3 {
        self.p0 + t * (self.p1 - self.p0)
    }

    /// Distance from `pt` to the segment and the unclamped projection
    /// parameter.
    pub fn approach(&self, pt: &Vec3) -> SegmentApproach {
        let v = self.p1 - self.p0;
        let len_sqr = v.norm_squared();
        let t = if len_sqr < MIN_NORMALIZE_DIVISOR {
            0.0
        } else {
            (pt - self.p0).dot(&v) / len_sqr
        };
        let closest = self.interpolate(t.clamp(0.0, 1.0));
        SegmentApproach {
            dist: (pt - closest).norm(),
            t,
        }
    }
}

/// A plane given by a point and a unit normal.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    /// A point on the plane.
    pub origin: Vec3,
    /// Unit normal.
    pub normal: Vec3,
}

impl Plane {
    /// Plane through `origin` with (unnormalised) `normal`.
    pub fn new(origin: Vec3, normal: Vec3) -> Self {
        Self {
            origin,
            normal: safe_normalize(&normal).unwrap_or(AXIS_Z),
        }
    }

    /// Plane of a triangle.
    pub fn from_triangle(tri: &[Vec3; 3]) -> Self {
        Self::new(tri[0], triangle_normal(tri))
    }

    /// Signed distance from `pt`; positive on the normal side.
    pub fn signed_distance(&self, pt: &Vec3) -> f64 {
        (pt - self.origin).dot(&self.normal)
    }

    /// Absolute distance from `pt`.
    pub fn distance(&self, pt: &Vec3) -> f64 {
        self.signed_distance(pt).abs()
    }
}

/// Unit normal of a triangle (right-handed winding).
pub fn triangle_normal(tri: &[Vec3; 3]) -> Vec3 {
    let n = (tri[1] - tri[0]).cross(&(tri[2] - tri[0]));
    safe_normalize(&n).unwrap_or_else(Vec3::zeros)
}

/// Centroid of a triangle.
pub fn triangle_centroid(tri: &[Vec3; 3]) -> Vec3 {
    (tri[0] + tri[1] + tri[2]) / 3.0
}

/// Signed volume of the prism between a triangle and its projection on
/// the plane `z = 0`. Summing this over a closed surface's triangles
/// gives the enclosed volume.
pub fn volume_under_triangle(tri: &[Vec3; 3]) -> f64 {
    let cross = (tri[1] - tri[0]).cross(&(tri[2] - tri[0]));
    let projected_area = 0.5 * cross.dot(&AXIS_Z);
    let avg_z = (tri[0].z + tri[1].z + tri[2].z) / 3.0;
    projected_area * avg_z
}

/// Intersection of a segment with a triangle.
#[derive(Debug, Clone, Copy)]
pub struct RayHit {
    /// The intersection point.
    pub hit_pt: Vec3,
    /// Parameter along the segment (0..=1).
    pub t: f64,
}

/// Intersect a line segment with a triangle. Returns the hit inside the
/// triangle (inclusive of edges within `SAME_DIST_TOL`) or `None`.
pub fn intersect_segment_triangle(seg: &LineSegment, tri: &[Vec3; 3]) -> Option<RayHit> {
    let normal = triangle_normal(tri);
    if normal.norm_squared() < MIN_NORMALIZE_DIVISOR {
        return None;
    }
    let d = seg.p1 - seg.p0;
    let denom = d.dot(&normal);
    if denom.abs() < MIN_NORMALIZE_DIVISOR {
        return None;
    }
    let t = (tri[0] - seg.p0).dot(&normal) / denom;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }
    let hit_pt = seg.interpolate(t);

    // Inside test: the hit must be on the inner side of each edge.
    for i in 0..3 {
        let e = tri[(i + 1) % 3] - tri[i];
        let to_pt = hit_pt - tri[i];
        if normal.dot(&e.cross(&to_pt)) < -SAME_DIST_TOL {
            return None;
        }
    }
    Some(RayHit { hit_pt, t })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bbox_merge_and_contains() {
        let mut bb = BoundingBox::empty();
        assert!(bb.is_empty());
        bb.merge_point(&Vec3::new(1.0, 2.0, 3.0));
        bb.merge_point(&Vec3::new(-1.0, 0.0, 5.0));
        assert!(bb.contains(&Vec3::new(0.0, 1.0, 4.0)));
        assert!(!bb.contains(&Vec3::new(0.0, 3.0, 4.0)));
        assert_relative_eq!(bb.range().x, 2.0);
    }

    #[test]
    fn test_bbox_intersects_touching() {
        let a = BoundingBox::new(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0));
        let b = BoundingBox::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));
        assert!(a.intersects(&b));
        let c = BoundingBox::new(Vec3::new(3.0, 0.0, 0.0), Vec3::new(4.0, 1.0, 1.0));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_segment_approach_interior() {
        let seg = LineSegment::new(Vec3::zeros(), Vec3::new(2.0, 0.0, 0.0));
        let a = seg.approach(&Vec3::new(1.0, 1.0, 0.0));
        assert_relative_eq!(a.dist, 1.0);
        assert_relative_eq!(a.t, 0.5);
    }

    #[test]
    fn test_segment_approach_past_end() {
        let seg = LineSegment::new(Vec3::zeros(), Vec3::new(1.0, 0.0, 0.0));
        let a = seg.approach(&Vec3::new(2.0, 0.0, 0.0));
        // Distance clamps to the endpoint, t does not.
        assert_relative_eq!(a.dist, 1.0);
        assert_relative_eq!(a.t, 2.0);
    }

    #[test]
    fn test_plane_signed_distance() {
        let pl = Plane::new(Vec3::zeros(), AXIS_Z);
        assert_relative_eq!(pl.signed_distance(&Vec3::new(5.0, 5.0, 2.0)), 2.0);
        assert_relative_eq!(pl.signed_distance(&Vec3::new(0.0, 0.0, -3.0)), -3.0);
    }

    #[test]
    fn test_volume_under_closed_cube() {
        // Unit cube as 12 triangles; the summed volume-under must be 1.
        let p = |x: f64, y: f64, z: f64| Vec3::new(x, y, z);
        let corners = [
            p(0., 0., 0.),
            p(1., 0., 0.),
            p(1., 1., 0.),
            p(0., 1., 0.),
            p(0., 0., 1.),
            p(1., 0., 1.),
            p(1., 1., 1.),
            p(0., 1., 1.),
        ];
        let quads: [[usize; 4]; 6] = [
            [0, 3, 2, 1], // bottom, outward -Z
            [4, 5, 6, 7], // top, outward +Z
            [0, 1, 5, 4], // front
            [2, 3, 7, 6], // back
            [0, 4, 7, 3], // left
            [1, 2, 6, 5], // right
        ];
        let mut vol = 0.0;
        for q in &quads {
            vol += volume_under_triangle(&[corners[q[0]], corners[q[1]], corners[q[2]]]);
            vol += volume_under_triangle(&[corners[q[0]], corners[q[2]], corners[q[3]]]);
        }
        assert_relative_eq!(vol, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_intersect_segment_triangle() {
        let tri = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(2.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
        ];
        let seg = LineSegment::new(Vec3::new(0.5, 0.5, -1.0), Vec3::new(0.5, 0.5, 1.0));
        let hit = intersect_segment_triangle(&seg, &tri).unwrap();
        assert_relative_eq!(hit.hit_pt.z, 0.0, epsilon = 1e-12);
        assert_relative_eq!(hit.t, 0.5);

        let miss = LineSegment::new(Vec3::new(3.0, 3.0, -1.0), Vec3::new(3.0, 3.0, 1.0));
        assert!(intersect_segment_triangle(&miss, &tri).is_none());
    }

    #[test]
    fn test_safe_normalize_zero() {
        assert!(safe_normalize(&Vec3::zeros()).is_none());
        let n = safe_normalize(&Vec3::new(3.0, 0.0, 0.0)).unwrap();
        assert_relative_eq!(n.x, 1.0);
    }
}
