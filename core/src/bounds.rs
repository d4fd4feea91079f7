//! Axis-aligned bounding volumes.
//!
//! [`BoundingBox`] is the workhorse of visibility and shadow fitting: boxes
//! are merged across drawables, transformed into light view space, and
//! projected through shadow projections. An empty box starts undefined and
//! becomes defined by the first merge.

use crate::math::{transform_point, Mat4, Vec3, Vec4, EPSILON};

/// Result of a containment test between volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intersection {
    Outside,
    Intersects,
    Inside,
}

/// Axis-aligned bounding box.
///
/// A default box is undefined (min > max). Merging a point or box into an
/// undefined box defines it as that operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

impl BoundingBox {
    /// The undefined box: merges as the identity element.
    pub const UNDEFINED: Self = Self {
        min: Vec3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
        max: Vec3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Box centered at `center` with the given half-extents.
    pub fn from_center_half_size(center: Vec3, half_size: Vec3) -> Self {
        Self {
            min: center - half_size,
            max: center + half_size,
        }
    }

    /// Smallest box containing all of `points`. Undefined for an empty slice.
    pub fn from_points(points: &[Vec3]) -> Self {
        let mut result = Self::UNDEFINED;
        for p in points {
            result.merge_point(*p);
        }
        result
    }

    pub fn is_defined(&self) -> bool {
        self.min.x <= self.max.x
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn half_size(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn merge_point(&mut self, point: Vec3) {
        self.min = self.min.inf(&point);
        self.max = self.max.sup(&point);
    }

    pub fn merge(&mut self, other: &BoundingBox) {
        if !other.is_defined() {
            return;
        }
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.is_defined()
            && point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Containment test against another box.
    pub fn is_inside(&self, other: &BoundingBox) -> Intersection {
        if other.max.x < self.min.x
            || other.min.x > self.max.x
            || other.max.y < self.min.y
            || other.min.y > self.max.y
            || other.max.z < self.min.z
            || other.min.z > self.max.z
        {
            Intersection::Outside
        } else if other.min.x >= self.min.x
            && other.max.x <= self.max.x
            && other.min.y >= self.min.y
            && other.max.y <= self.max.y
            && other.min.z >= self.min.z
            && other.max.z <= self.max.z
        {
            Intersection::Inside
        } else {
            Intersection::Intersects
        }
    }

    /// Transform by an affine matrix, returning the enclosing axis-aligned box.
    pub fn transformed(&self, m: &Mat4) -> BoundingBox {
        let center = self.center();
        let half = self.half_size();
        let new_center = transform_point(m, center);
        // Absolute value of the upper-left 3x3 maps half-extents.
        let new_half = Vec3::new(
            m[(0, 0)].abs() * half.x + m[(0, 1)].abs() * half.y + m[(0, 2)].abs() * half.z,
            m[(1, 0)].abs() * half.x + m[(1, 1)].abs() * half.y + m[(1, 2)].abs() * half.z,
            m[(2, 0)].abs() * half.x + m[(2, 1)].abs() * half.y + m[(2, 2)].abs() * half.z,
        );
        BoundingBox::from_center_half_size(new_center, new_half)
    }

    /// Project through a projection matrix, returning the enclosing box of
    /// the corners in normalized device coordinates. Corners behind the
    /// projection origin are clamped to a small positive depth first.
    pub fn projected(&self, projection: &Mat4) -> BoundingBox {
        let mut result = BoundingBox::UNDEFINED;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 != 0 { self.max.x } else { self.min.x },
                if i & 2 != 0 { self.max.y } else { self.min.y },
                if i & 4 != 0 { self.max.z } else { self.min.z },
            );
            // Clamp to in front of the near plane so the divide stays sane.
            let clipped = if corner.z > -EPSILON {
                Vec3::new(corner.x, corner.y, -EPSILON)
            } else {
                corner
            };
            let v = projection * Vec4::new(clipped.x, clipped.y, clipped.z, 1.0);
            let inv_w = 1.0 / v.w.max(EPSILON);
            result.merge_point(Vec3::new(v.x * inv_w, v.y * inv_w, v.z * inv_w));
        }
        result
    }
}

/// Bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Enclosing sphere of a point cloud: centroid center, max-distance radius.
    pub fn from_points(points: &[Vec3]) -> Self {
        if points.is_empty() {
            return Self::new(Vec3::zeros(), 0.0);
        }
        let mut center = Vec3::zeros();
        for p in points {
            center += *p;
        }
        center /= points.len() as f32;
        let mut radius: f32 = 0.0;
        for p in points {
            radius = radius.max((p - center).norm());
        }
        Self { center, radius }
    }

    /// Distance from a point to the sphere surface, zero when inside.
    pub fn distance(&self, point: Vec3) -> f32 {
        ((point - self.center).norm() - self.radius).max(0.0)
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        (point - self.center).norm_squared() <= self.radius * self.radius
    }

    /// Sphere-box overlap test via closest point.
    pub fn intersects_box(&self, box_: &BoundingBox) -> bool {
        let closest = Vec3::new(
            self.center.x.clamp(box_.min.x, box_.max.x),
            self.center.y.clamp(box_.min.y, box_.max.y),
            self.center.z.clamp(box_.min.z, box_.max.z),
        );
        (closest - self.center).norm_squared() <= self.radius * self.radius
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::mat4_from_translation;

    #[test]
    fn undefined_box_merges_to_operand() {
        let mut b = BoundingBox::UNDEFINED;
        assert!(!b.is_defined());
        b.merge_point(Vec3::new(1.0, 2.0, 3.0));
        assert!(b.is_defined());
        assert_eq!(b.min, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(b.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn merge_undefined_is_noop() {
        let mut b = BoundingBox::new(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0));
        let before = b;
        b.merge(&BoundingBox::UNDEFINED);
        assert_eq!(b, before);
    }

    #[test]
    fn box_containment() {
        let outer = BoundingBox::new(Vec3::new(-10.0, -10.0, -10.0), Vec3::new(10.0, 10.0, 10.0));
        let inner = BoundingBox::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
        let crossing = BoundingBox::new(Vec3::new(5.0, 5.0, 5.0), Vec3::new(15.0, 15.0, 15.0));
        let outside = BoundingBox::new(Vec3::new(20.0, 20.0, 20.0), Vec3::new(30.0, 30.0, 30.0));

        assert_eq!(outer.is_inside(&inner), Intersection::Inside);
        assert_eq!(outer.is_inside(&crossing), Intersection::Intersects);
        assert_eq!(outer.is_inside(&outside), Intersection::Outside);
    }

    #[test]
    fn transformed_by_translation() {
        let b = BoundingBox::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
        let t = b.transformed(&mat4_from_translation(Vec3::new(10.0, 0.0, 0.0)));
        assert_eq!(t.min, Vec3::new(9.0, -1.0, -1.0));
        assert_eq!(t.max, Vec3::new(11.0, -1.0 + 2.0, 1.0));
    }

    #[test]
    fn sphere_from_points_encloses_all() {
        let points = [
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
        ];
        let s = Sphere::from_points(&points);
        for p in &points {
            assert!(s.contains_point(*p) || s.distance(*p) < 1e-5);
        }
    }

    #[test]
    fn sphere_box_intersection() {
        let b = BoundingBox::new(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0));
        assert!(Sphere::new(Vec3::new(2.0, 0.5, 0.5), 1.5).intersects_box(&b));
        assert!(!Sphere::new(Vec3::new(5.0, 5.0, 5.0), 1.0).intersects_box(&b));
    }
}
