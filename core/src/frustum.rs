//! View frusta and convex volumes.
//!
//! [`Frustum`] is defined by its 8 corner vertices with 6 inward-facing
//! planes derived from them. Cameras build frusta for culling; shadow
//! processing transforms them into light view space and intersects them
//! with caster bounds. [`Polyhedron`] supports clipping a frustum volume by
//! a bounding box for directional shadow focusing.

use crate::bounds::{BoundingBox, Intersection};
use crate::math::{transform_point, Mat4, Vec3, EPSILON};

/// A plane in normal + offset form. `distance` is positive on the side the
/// normal points toward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    /// Plane through three points; normal orientation follows the winding.
    pub fn from_points(a: Vec3, b: Vec3, c: Vec3) -> Self {
        let normal = (b - a).cross(&(c - a)).normalize();
        Self {
            normal,
            d: -normal.dot(&a),
        }
    }

    pub fn distance(&self, point: Vec3) -> f32 {
        self.normal.dot(&point) + self.d
    }
}

/// Frustum corner count. Vertices 0..4 lie on the near plane, 4..8 on the
/// far plane.
pub const NUM_FRUSTUM_VERTICES: usize = 8;

/// Number of bounding planes.
pub const NUM_FRUSTUM_PLANES: usize = 6;

/// Convex view volume with precomputed inward-facing planes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub vertices: [Vec3; NUM_FRUSTUM_VERTICES],
    planes: [Plane; NUM_FRUSTUM_PLANES],
}

impl Default for Frustum {
    fn default() -> Self {
        Self::from_vertices([Vec3::zeros(); NUM_FRUSTUM_VERTICES])
    }
}

impl Frustum {
    /// Define from perspective parameters in local space (camera looks down
    /// -Z), then transform to world space.
    pub fn from_perspective(
        fov_y: f32,
        aspect: f32,
        zoom: f32,
        near: f32,
        far: f32,
        world: &Mat4,
    ) -> Self {
        let half_height = (fov_y * 0.5).tan() / zoom;
        let half_width = half_height * aspect;

        let near_h = half_height * near;
        let near_w = half_width * near;
        let far_h = half_height * far;
        let far_w = half_width * far;

        Self::from_extents(near_w, near_h, near, far_w, far_h, far, world)
    }

    /// Define from orthographic parameters in local space, then transform.
    pub fn from_ortho(
        ortho_size: f32,
        aspect: f32,
        zoom: f32,
        near: f32,
        far: f32,
        world: &Mat4,
    ) -> Self {
        let half_height = ortho_size * 0.5 / zoom;
        let half_width = half_height * aspect;
        Self::from_extents(half_width, half_height, near, half_width, half_height, far, world)
    }

    fn from_extents(
        near_w: f32,
        near_h: f32,
        near: f32,
        far_w: f32,
        far_h: f32,
        far: f32,
        world: &Mat4,
    ) -> Self {
        let local = [
            Vec3::new(near_w, near_h, -near),
            Vec3::new(near_w, -near_h, -near),
            Vec3::new(-near_w, -near_h, -near),
            Vec3::new(-near_w, near_h, -near),
            Vec3::new(far_w, far_h, -far),
            Vec3::new(far_w, -far_h, -far),
            Vec3::new(-far_w, -far_h, -far),
            Vec3::new(-far_w, far_h, -far),
        ];
        let mut vertices = [Vec3::zeros(); NUM_FRUSTUM_VERTICES];
        for (dst, src) in vertices.iter_mut().zip(local.iter()) {
            *dst = transform_point(world, *src);
        }
        Self::from_vertices(vertices)
    }

    /// Rebuild planes from explicit corner vertices.
    pub fn from_vertices(vertices: [Vec3; NUM_FRUSTUM_VERTICES]) -> Self {
        let mut centroid = Vec3::zeros();
        for v in &vertices {
            centroid += *v;
        }
        let centroid = centroid / NUM_FRUSTUM_VERTICES as f32;
        let face = |a: usize, b: usize, c: usize| -> Plane {
            let mut plane = Plane::from_points(vertices[a], vertices[b], vertices[c]);
            // Orient inward so interior points have positive distance.
            if plane.distance(centroid) < 0.0 {
                plane.normal = -plane.normal;
                plane.d = -plane.d;
            }
            plane
        };
        let planes = [
            face(0, 1, 2), // near
            face(4, 5, 6), // far
            face(0, 1, 5), // right
            face(2, 3, 7), // left
            face(0, 3, 7), // top
            face(1, 2, 6), // bottom
        ];
        Self { vertices, planes }
    }

    pub fn planes(&self) -> &[Plane; NUM_FRUSTUM_PLANES] {
        &self.planes
    }

    /// True when the volume has collapsed (near and far corners coincide).
    pub fn is_degenerate(&self) -> bool {
        (self.vertices[0] - self.vertices[4]).norm_squared() < EPSILON
    }

    pub fn transformed(&self, m: &Mat4) -> Frustum {
        let mut vertices = [Vec3::zeros(); NUM_FRUSTUM_VERTICES];
        for (dst, src) in vertices.iter_mut().zip(self.vertices.iter()) {
            *dst = transform_point(m, *src);
        }
        Self::from_vertices(vertices)
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes.iter().all(|p| p.distance(point) >= 0.0)
    }

    /// Precise box test returning inside/intersects/outside.
    pub fn is_inside(&self, box_: &BoundingBox) -> Intersection {
        let center = box_.center();
        let edge = box_.half_size();
        let mut all_inside = true;

        for plane in &self.planes {
            let dist = plane.distance(center);
            let abs_dist = plane.normal.x.abs() * edge.x
                + plane.normal.y.abs() * edge.y
                + plane.normal.z.abs() * edge.z;
            if dist < -abs_dist {
                return Intersection::Outside;
            }
            if dist < abs_dist {
                all_inside = false;
            }
        }
        if all_inside {
            Intersection::Inside
        } else {
            Intersection::Intersects
        }
    }

    /// Fast conservative box test: only reports definite rejection.
    pub fn is_inside_fast(&self, box_: &BoundingBox) -> Intersection {
        let center = box_.center();
        let edge = box_.half_size();

        for plane in &self.planes {
            let dist = plane.distance(center);
            let abs_dist = plane.normal.x.abs() * edge.x
                + plane.normal.y.abs() * edge.y
                + plane.normal.z.abs() * edge.z;
            if dist < -abs_dist {
                return Intersection::Outside;
            }
        }
        Intersection::Inside
    }

    /// Sphere test returning inside/intersects/outside.
    pub fn is_inside_sphere(&self, center: Vec3, radius: f32) -> Intersection {
        let mut all_inside = true;
        for plane in &self.planes {
            let dist = plane.distance(center);
            if dist < -radius {
                return Intersection::Outside;
            }
            if dist < radius {
                all_inside = false;
            }
        }
        if all_inside {
            Intersection::Inside
        } else {
            Intersection::Intersects
        }
    }

    /// Distance from a point to the closest bounding plane, zero inside.
    pub fn distance(&self, point: Vec3) -> f32 {
        let mut max_outside: f32 = 0.0;
        for plane in &self.planes {
            let dist = plane.distance(point);
            if dist < 0.0 {
                max_outside = max_outside.max(-dist);
            }
        }
        max_outside
    }

    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.vertices)
    }
}

/// A convex volume as a collection of face polygons.
///
/// Used for directional shadow focusing: the split frustum is converted to a
/// polyhedron, clipped by the lit-geometry bounds, transformed to light
/// space and fitted with a box or sphere.
#[derive(Debug, Clone, Default)]
pub struct Polyhedron {
    pub faces: Vec<Vec<Vec3>>,
}

impl Polyhedron {
    pub fn from_frustum(frustum: &Frustum) -> Self {
        let v = &frustum.vertices;
        Self {
            faces: vec![
                vec![v[0], v[1], v[2], v[3]], // near
                vec![v[4], v[5], v[6], v[7]], // far
                vec![v[0], v[1], v[5], v[4]], // right
                vec![v[3], v[2], v[6], v[7]], // left
                vec![v[0], v[4], v[7], v[3]], // top
                vec![v[1], v[5], v[6], v[2]], // bottom
            ],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.faces.iter().all(|f| f.len() < 3)
    }

    pub fn transform(&mut self, m: &Mat4) {
        for face in &mut self.faces {
            for v in face.iter_mut() {
                *v = transform_point(m, *v);
            }
        }
    }

    /// Clip every face by the half-spaces of an axis-aligned box.
    /// Faces clipped away entirely are removed.
    pub fn clip(&mut self, box_: &BoundingBox) {
        let clip_planes = [
            (Vec3::new(1.0, 0.0, 0.0), -box_.min.x),
            (Vec3::new(-1.0, 0.0, 0.0), box_.max.x),
            (Vec3::new(0.0, 1.0, 0.0), -box_.min.y),
            (Vec3::new(0.0, -1.0, 0.0), box_.max.y),
            (Vec3::new(0.0, 0.0, 1.0), -box_.min.z),
            (Vec3::new(0.0, 0.0, -1.0), box_.max.z),
        ];

        for (normal, d) in clip_planes {
            for face in &mut self.faces {
                *face = clip_polygon(face, normal, d);
            }
            self.faces.retain(|f| f.len() >= 3);
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let mut result = BoundingBox::UNDEFINED;
        for face in &self.faces {
            for v in face {
                result.merge_point(*v);
            }
        }
        result
    }

    /// All face vertices flattened, for sphere fitting.
    pub fn vertices(&self) -> Vec<Vec3> {
        self.faces.iter().flatten().copied().collect()
    }
}

/// Sutherland-Hodgman clip of a polygon against one half-space
/// (`dot(normal, p) + d >= 0` kept).
fn clip_polygon(polygon: &[Vec3], normal: Vec3, d: f32) -> Vec<Vec3> {
    if polygon.is_empty() {
        return Vec::new();
    }
    let mut result = Vec::with_capacity(polygon.len() + 2);
    for i in 0..polygon.len() {
        let current = polygon[i];
        let next = polygon[(i + 1) % polygon.len()];
        let cur_dist = normal.dot(&current) + d;
        let next_dist = normal.dot(&next) + d;

        if cur_dist >= 0.0 {
            result.push(current);
        }
        if (cur_dist >= 0.0) != (next_dist >= 0.0) {
            let t = cur_dist / (cur_dist - next_dist);
            result.push(current + (next - current) * t);
        }
    }
    result
}
