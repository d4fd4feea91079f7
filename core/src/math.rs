//! Math type aliases and helper functions.
//!
//! Provides the f32 rendering types used throughout the engine, plus the
//! integer viewport types the renderer deals in.

pub use nalgebra;

// ===== Rendering math (always f32) =====

/// 2D vector (f32).
pub type Vec2 = nalgebra::Vector2<f32>;

/// 3D vector (f32).
pub type Vec3 = nalgebra::Vector3<f32>;

/// 4D vector (f32).
pub type Vec4 = nalgebra::Vector4<f32>;

/// 4x4 matrix (f32).
pub type Mat4 = nalgebra::Matrix4<f32>;

/// Unit quaternion (f32).
pub type Quat = nalgebra::UnitQuaternion<f32>;

/// Small epsilon for degenerate-size guards.
pub const EPSILON: f32 = 1e-6;

// ===== Helper functions =====

/// Build a right-handed perspective projection with depth range [0, 1].
pub fn perspective_rh(yfov: f32, aspect: f32, znear: f32, zfar: f32) -> Mat4 {
    let f = 1.0 / (yfov / 2.0).tan();
    let nf = 1.0 / (znear - zfar);
    #[rustfmt::skip]
    let result = Mat4::new(
        f / aspect, 0.0,  0.0,              0.0,
        0.0,        f,    0.0,              0.0,
        0.0,        0.0,  zfar * nf,        znear * zfar * nf,
        0.0,        0.0,  -1.0,             0.0,
    );
    result
}

/// Build a right-handed orthographic projection with depth range [0, 1].
pub fn orthographic_rh(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    let rml = right - left;
    let tmb = top - bottom;
    let fmn = far - near;
    #[rustfmt::skip]
    let result = Mat4::new(
        2.0 / rml, 0.0,       0.0,         -(right + left) / rml,
        0.0,       2.0 / tmb, 0.0,         -(top + bottom) / tmb,
        0.0,       0.0,       -1.0 / fmn,  -near / fmn,
        0.0,       0.0,       0.0,          1.0,
    );
    result
}

/// Right-handed look-at view matrix.
pub fn look_at_rh(eye: &Vec3, target: &Vec3, up: &Vec3) -> Mat4 {
    let eye_point = nalgebra::Point3::from(*eye);
    let target_point = nalgebra::Point3::from(*target);
    nalgebra::Isometry3::look_at_rh(&eye_point, &target_point, up).to_homogeneous()
}

/// Build a translation-only 4x4 matrix.
pub fn mat4_from_translation(t: Vec3) -> Mat4 {
    Mat4::new_translation(&t)
}

/// Build a rigid transform (rotation + translation) matrix.
pub fn mat4_from_rotation_translation(rotation: Quat, translation: Vec3) -> Mat4 {
    nalgebra::Isometry3::from_parts(nalgebra::Translation3::from(translation), rotation)
        .to_homogeneous()
}

/// Transform a point by an affine 4x4 matrix (w assumed 1).
pub fn transform_point(m: &Mat4, p: Vec3) -> Vec3 {
    let v = m * Vec4::new(p.x, p.y, p.z, 1.0);
    Vec3::new(v.x, v.y, v.z)
}

/// Transform a direction by an affine 4x4 matrix (w assumed 0).
pub fn transform_direction(m: &Mat4, d: Vec3) -> Vec3 {
    let v = m * Vec4::new(d.x, d.y, d.z, 0.0);
    Vec3::new(v.x, v.y, v.z)
}

/// Transform a point by a projection matrix with perspective divide.
pub fn project_point(m: &Mat4, p: Vec3) -> Vec3 {
    let v = m * Vec4::new(p.x, p.y, p.z, 1.0);
    let inv_w = if v.w.abs() > EPSILON { 1.0 / v.w } else { 1.0 };
    Vec3::new(v.x * inv_w, v.y * inv_w, v.z * inv_w)
}

// ===== Integer viewport math =====

/// 2D integer vector for pixel coordinates and sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntVec2 {
    pub x: i32,
    pub y: i32,
}

impl IntVec2 {
    pub const ZERO: Self = Self { x: 0, y: 0 };

    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Integer rectangle with exclusive right/bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl IntRect {
    pub const ZERO: Self = Self {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn size(&self) -> IntVec2 {
        IntVec2::new(self.width(), self.height())
    }

    /// Clamp a requested rect inside a render target of the given size,
    /// keeping at least one pixel of area.
    pub fn clamped_to(&self, rt_width: i32, rt_height: i32) -> IntRect {
        let left = self.left.clamp(0, rt_width - 1);
        let top = self.top.clamp(0, rt_height - 1);
        IntRect {
            left,
            top,
            right: self.right.clamp(left + 1, rt_width),
            bottom: self.bottom.clamp(top + 1, rt_height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_matrix() {
        let t = Vec3::new(1.0, 2.0, 3.0);
        let m = mat4_from_translation(t);
        assert_eq!(m[(0, 3)], 1.0);
        assert_eq!(m[(1, 3)], 2.0);
        assert_eq!(m[(2, 3)], 3.0);
    }

    #[test]
    fn perspective_depth_range() {
        let proj = perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 1.0, 100.0);
        // A point at the near plane projects to depth 0, far plane to depth 1.
        let near = project_point(&proj, Vec3::new(0.0, 0.0, -1.0));
        let far = project_point(&proj, Vec3::new(0.0, 0.0, -100.0));
        assert!(near.z.abs() < 1e-4);
        assert!((far.z - 1.0).abs() < 1e-4);
    }

    #[test]
    fn orthographic_maps_extents() {
        let proj = orthographic_rh(-2.0, 2.0, -1.0, 1.0, 0.0, 10.0);
        let p = project_point(&proj, Vec3::new(2.0, 1.0, -10.0));
        assert!((p.x - 1.0).abs() < 1e-5);
        assert!((p.y - 1.0).abs() < 1e-5);
        assert!((p.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn look_at_view_space() {
        let view = look_at_rh(
            &Vec3::new(0.0, 0.0, 5.0),
            &Vec3::zeros(),
            &Vec3::new(0.0, 1.0, 0.0),
        );
        // The origin ends up 5 units in front of the camera (negative Z).
        let p = transform_point(&view, Vec3::zeros());
        assert!((p.z - (-5.0)).abs() < 1e-5);
    }

    #[test]
    fn rect_clamping() {
        let rect = IntRect::new(-10, -10, 5000, 5000).clamped_to(1280, 720);
        assert_eq!(rect, IntRect::new(0, 0, 1280, 720));

        let degenerate = IntRect::new(100, 100, 100, 100).clamped_to(1280, 720);
        assert_eq!(degenerate.width(), 1);
        assert_eq!(degenerate.height(), 1);
    }
}
