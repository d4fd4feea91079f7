//! Cameras: view/projection math and frusta.
//!
//! Cameras are plain values. The view copies the viewport camera at define
//! time so parallel frame phases can read it freely, and shadow processing
//! builds throwaway shadow cameras per split.

use nightshade_core::frustum::Frustum;
use nightshade_core::math::{
    mat4_from_rotation_translation, orthographic_rh, perspective_rh, Mat4, Quat, Vec2, Vec3,
};

use crate::types::FillMode;

bitflags::bitflags! {
    /// Per-camera overrides of renderer quality settings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ViewOverrideFlags: u8 {
        const LOW_MATERIAL_QUALITY = 0x1;
        const DISABLE_SHADOWS = 0x2;
        const DISABLE_OCCLUSION = 0x4;
    }
}

/// Local forward direction: cameras look down negative Z.
pub const FORWARD: Vec3 = Vec3::new(0.0, 0.0, -1.0);

/// Rotation taking [`FORWARD`] onto an arbitrary direction. Antiparallel
/// directions (no unique rotation) flip about the Y axis.
pub(crate) fn rotation_to(direction: Vec3) -> Quat {
    match Quat::rotation_between(&FORWARD, &direction.normalize()) {
        Some(rotation) => rotation,
        None => Quat::from_axis_angle(
            &nightshade_core::math::nalgebra::Vector3::y_axis(),
            std::f32::consts::PI,
        ),
    }
}

/// A perspective or orthographic camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub rotation: Quat,
    near: f32,
    far: f32,
    /// Vertical field of view in radians (perspective).
    fov: f32,
    aspect: f32,
    zoom: f32,
    orthographic: bool,
    /// Vertical size of the orthographic view volume.
    ortho_size: f32,
    auto_aspect: bool,
    pub view_mask: u32,
    pub fill_mode: FillMode,
    pub use_clipping: bool,
    pub clip_plane: [f32; 4],
    pub view_override_flags: ViewOverrideFlags,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            near: 0.1,
            far: 1000.0,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 1.0,
            zoom: 1.0,
            orthographic: false,
            ortho_size: 20.0,
            auto_aspect: true,
            view_mask: u32::MAX,
            fill_mode: FillMode::Solid,
            use_clipping: false,
            clip_plane: [0.0; 4],
            view_override_flags: ViewOverrideFlags::empty(),
        }
    }
}

impl Camera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn near_clip(&self) -> f32 {
        self.near
    }

    pub fn far_clip(&self) -> f32 {
        self.far
    }

    pub fn fov(&self) -> f32 {
        self.fov
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.aspect
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn is_orthographic(&self) -> bool {
        self.orthographic
    }

    pub fn ortho_size(&self) -> f32 {
        self.ortho_size
    }

    pub fn auto_aspect_ratio(&self) -> bool {
        self.auto_aspect
    }

    pub fn set_near_clip(&mut self, near: f32) {
        self.near = near.max(0.0);
    }

    pub fn set_far_clip(&mut self, far: f32) {
        self.far = far;
    }

    pub fn set_fov(&mut self, fov: f32) {
        self.fov = fov;
    }

    pub fn set_aspect_ratio(&mut self, aspect: f32) {
        self.aspect = aspect;
        self.auto_aspect = false;
    }

    /// Internal aspect update that keeps auto-aspect mode on.
    pub fn set_aspect_ratio_internal(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn set_auto_aspect_ratio(&mut self, auto: bool) {
        self.auto_aspect = auto;
    }

    pub fn set_zoom(&mut self, zoom: f32) {
        self.zoom = zoom;
    }

    pub fn set_orthographic(&mut self, orthographic: bool) {
        self.orthographic = orthographic;
    }

    /// Set the vertical orthographic size.
    pub fn set_ortho_size(&mut self, size: f32) {
        self.ortho_size = size;
    }

    /// Set a possibly non-square orthographic size; aspect follows.
    pub fn set_ortho_size_2d(&mut self, size: Vec2) {
        self.ortho_size = size.y;
        self.aspect = if size.y.abs() > f32::EPSILON {
            size.x / size.y
        } else {
            1.0
        };
    }

    /// Point the camera along a world direction.
    pub fn set_direction(&mut self, direction: Vec3) {
        self.rotation = rotation_to(direction);
    }

    pub fn direction(&self) -> Vec3 {
        self.rotation * FORWARD
    }

    /// Translate along local axes.
    pub fn translate_local(&mut self, delta: Vec3) {
        self.position += self.rotation * delta;
    }

    /// Camera-to-world transform.
    pub fn world_transform(&self) -> Mat4 {
        mat4_from_rotation_translation(self.rotation, self.position)
    }

    /// World-to-camera (view) matrix.
    pub fn view_matrix(&self) -> Mat4 {
        // Rigid transform inverse.
        let rot_inv = self.rotation.inverse();
        mat4_from_rotation_translation(rot_inv, -(rot_inv * self.position))
    }

    /// Projection matrix with zoom applied.
    pub fn projection(&self) -> Mat4 {
        if self.orthographic {
            let half_h = self.ortho_size * 0.5 / self.zoom;
            let half_w = half_h * self.aspect;
            orthographic_rh(-half_w, half_w, -half_h, half_h, self.near, self.far)
        } else {
            let mut proj = perspective_rh(self.fov, self.aspect, self.near.max(1e-3), self.far);
            proj[(0, 0)] *= self.zoom;
            proj[(1, 1)] *= self.zoom;
            proj
        }
    }

    /// World-space view frustum.
    pub fn frustum(&self) -> Frustum {
        self.split_frustum(self.near, self.far)
    }

    /// World-space frustum limited to a sub-range of the depth span.
    pub fn split_frustum(&self, near: f32, far: f32) -> Frustum {
        let near = near.max(self.near);
        let far = far.min(self.far).max(near);
        let world = self.world_transform();
        if self.orthographic {
            Frustum::from_ortho(self.ortho_size, self.aspect, self.zoom, near, far, &world)
        } else {
            Frustum::from_perspective(self.fov, self.aspect, self.zoom, near, far, &world)
        }
    }

    /// Euclidean distance from the camera to a world position.
    pub fn distance(&self, world_position: Vec3) -> f32 {
        (world_position - self.position).norm()
    }

    /// Half of the view extent at unit distance; used for screen-size
    /// estimates of occluders.
    pub fn half_view_size(&self) -> f32 {
        if self.orthographic {
            self.ortho_size * 0.5 / self.zoom
        } else {
            (self.fov * 0.5).tan() / self.zoom
        }
    }

    /// Reject cameras whose projection would be degenerate.
    pub fn is_projection_valid(&self) -> bool {
        let finite = self.near.is_finite() && self.far.is_finite() && self.aspect.is_finite();
        finite
            && self.far > self.near
            && self.aspect > 0.0
            && self.zoom > 0.0
            && (self.orthographic || (self.fov > 0.0 && self.fov < std::f32::consts::PI))
            && (!self.orthographic || self.ortho_size > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightshade_core::bounds::{BoundingBox, Intersection};

    #[test]
    fn default_projection_is_valid() {
        assert!(Camera::new().is_projection_valid());
    }

    #[test]
    fn inverted_planes_are_invalid() {
        let mut camera = Camera::new();
        camera.set_near_clip(100.0);
        camera.set_far_clip(1.0);
        assert!(!camera.is_projection_valid());
    }

    #[test]
    fn frustum_contains_forward_point() {
        let mut camera = Camera::new();
        camera.set_near_clip(1.0);
        camera.set_far_clip(100.0);
        let frustum = camera.frustum();
        assert!(frustum.contains_point(Vec3::new(0.0, 0.0, -50.0)));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 50.0)));
    }

    #[test]
    fn split_frustum_clamps_to_camera_range() {
        let mut camera = Camera::new();
        camera.set_near_clip(1.0);
        camera.set_far_clip(100.0);
        let split = camera.split_frustum(0.0, 1000.0);
        let full = camera.frustum();
        for (a, b) in split.vertices.iter().zip(full.vertices.iter()) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn set_direction_points_frustum() {
        let mut camera = Camera::new();
        camera.set_near_clip(0.1);
        camera.set_far_clip(100.0);
        camera.set_direction(Vec3::new(1.0, 0.0, 0.0));

        let target = BoundingBox::from_center_half_size(
            Vec3::new(50.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 1.0),
        );
        assert_ne!(camera.frustum().is_inside(&target), Intersection::Outside);
    }

    #[test]
    fn ortho_size_2d_sets_aspect() {
        let mut camera = Camera::new();
        camera.set_orthographic(true);
        camera.set_ortho_size_2d(Vec2::new(40.0, 20.0));
        assert_eq!(camera.ortho_size(), 20.0);
        assert_eq!(camera.aspect_ratio(), 2.0);
    }

    #[test]
    fn view_matrix_inverts_world_transform() {
        let mut camera = Camera::new();
        camera.position = Vec3::new(3.0, 4.0, 5.0);
        camera.set_direction(Vec3::new(0.0, 0.0, 1.0));

        let m = camera.world_transform() * camera.view_matrix();
        assert!((m - Mat4::identity()).norm() < 1e-4);
    }
}
