//! Light sources.
//!
//! Three kinds: directional (global, cascaded shadows), spot (cone, one
//! shadow camera) and point (sphere, six cube-face shadow cameras). Shadow
//! parameters mirror what shadow processing needs: cascade distances,
//! focusing controls, depth bias and intensity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nightshade_core::bounds::BoundingBox;
use nightshade_core::frustum::Frustum;
use nightshade_core::math::{mat4_from_rotation_translation, Mat4, Quat, Vec3};

use crate::scene::camera::FORWARD;
use crate::types::{Color, DEFAULT_MASK};

static NEXT_LIGHT_ID: AtomicU64 = AtomicU64::new(1);

/// Maximum cascade splits for a directional light.
pub const MAX_CASCADE_SPLITS: usize = 4;

/// Maximum shadow cameras for any light (point light cube faces).
pub const MAX_LIGHT_SPLITS: usize = 6;

/// Cube face directions for point light shadows, aligned to world axes.
pub const CUBE_FACE_DIRECTIONS: [Vec3; 6] = [
    Vec3::new(1.0, 0.0, 0.0),
    Vec3::new(-1.0, 0.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
    Vec3::new(0.0, -1.0, 0.0),
    Vec3::new(0.0, 0.0, -1.0),
    Vec3::new(0.0, 0.0, 1.0),
];

/// Kind of light source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightType {
    Directional,
    Spot,
    Point,
}

/// Directional shadow cascade configuration.
#[derive(Debug, Clone)]
pub struct CascadeParameters {
    /// Far distance of each split; a non-positive entry ends the cascade.
    pub splits: [f32; MAX_CASCADE_SPLITS],
    /// How strongly depth bias scales up for distant splits (0..1).
    pub bias_auto_adjust: f32,
}

impl Default for CascadeParameters {
    fn default() -> Self {
        Self {
            splits: [10.0, 50.0, 200.0, 0.0],
            bias_auto_adjust: 1.0,
        }
    }
}

impl CascadeParameters {
    /// Number of active splits.
    pub fn num_splits(&self) -> usize {
        self.splits.iter().take_while(|s| **s > 0.0).count()
    }
}

/// Shadow camera focusing / quantization configuration.
#[derive(Debug, Clone)]
pub struct FocusParameters {
    /// Shrink the shadow camera to the visible casters/receivers.
    pub focus: bool,
    /// Allow non-square, non-centered shadow views.
    pub non_uniform: bool,
    /// Step for quantizing the shadow view size to reduce shimmer.
    pub quantize: f32,
    /// Smallest allowed shadow view size.
    pub min_view: f32,
}

impl Default for FocusParameters {
    fn default() -> Self {
        Self {
            focus: true,
            non_uniform: true,
            quantize: 0.5,
            min_view: 3.0,
        }
    }
}

/// Shadow depth bias configuration.
#[derive(Debug, Clone, Default)]
pub struct BiasParameters {
    pub constant_bias: f32,
    pub slope_scaled_bias: f32,
}

/// A light source.
#[derive(Debug)]
pub struct Light {
    id: u64,
    pub light_type: LightType,
    pub position: Vec3,
    pub rotation: Quat,
    pub color: Color,
    pub brightness: f32,
    pub specular_intensity: f32,
    pub range: f32,
    /// Spot cone angle in radians.
    pub fov: f32,
    pub aspect_ratio: f32,
    /// Computed per-vertex instead of per-pixel.
    pub per_vertex: bool,
    pub cast_shadows: bool,
    /// Beyond this camera distance the light stops casting shadows; zero
    /// disables the cutoff.
    pub shadow_distance: f32,
    /// 1.0 means fully faded-out shadows (not worth rendering).
    pub shadow_intensity: f32,
    pub shadow_cascade: CascadeParameters,
    pub shadow_focus: FocusParameters,
    pub shadow_bias: BiasParameters,
    /// Shadow camera near clip as a fraction of the light range.
    pub shadow_near_far_ratio: f32,
    pub view_mask: u32,
    pub light_mask: u32,
}

impl Light {
    pub fn new(light_type: LightType) -> Self {
        Self {
            id: NEXT_LIGHT_ID.fetch_add(1, Ordering::Relaxed),
            light_type,
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            color: Color::WHITE,
            brightness: 1.0,
            specular_intensity: 1.0,
            range: 10.0,
            fov: std::f32::consts::FRAC_PI_4,
            aspect_ratio: 1.0,
            per_vertex: false,
            cast_shadows: false,
            shadow_distance: 0.0,
            shadow_intensity: 0.0,
            shadow_cascade: CascadeParameters::default(),
            shadow_focus: FocusParameters::default(),
            shadow_bias: BiasParameters::default(),
            shadow_near_far_ratio: 0.002,
            view_mask: DEFAULT_MASK,
            light_mask: DEFAULT_MASK,
        }
    }

    pub fn directional(direction: Vec3) -> Arc<Self> {
        let mut light = Self::new(LightType::Directional);
        light.set_direction(direction);
        Arc::new(light)
    }

    pub fn point(position: Vec3, range: f32) -> Arc<Self> {
        let mut light = Self::new(LightType::Point);
        light.position = position;
        light.range = range;
        Arc::new(light)
    }

    pub fn spot(position: Vec3, direction: Vec3, fov: f32, range: f32) -> Arc<Self> {
        let mut light = Self::new(LightType::Spot);
        light.position = position;
        light.set_direction(direction);
        light.fov = fov;
        light.range = range;
        Arc::new(light)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_direction(&mut self, direction: Vec3) {
        self.rotation = crate::scene::camera::rotation_to(direction);
    }

    pub fn direction(&self) -> Vec3 {
        self.rotation * FORWARD
    }

    /// Color scaled by brightness; black means the light contributes
    /// nothing and is culled.
    pub fn effective_color(&self) -> Color {
        self.color.scaled(self.brightness.max(0.0))
    }

    /// Negative lights darken instead of brighten.
    pub fn is_negative(&self) -> bool {
        self.brightness < 0.0
    }

    pub fn world_transform(&self) -> Mat4 {
        mat4_from_rotation_translation(self.rotation, self.position)
    }

    /// Spot light cone frustum.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_perspective(
            self.fov,
            self.aspect_ratio,
            1.0,
            (self.shadow_near_far_ratio * self.range).max(1e-3),
            self.range.max(1e-3),
            &self.world_transform(),
        )
    }

    /// World bounds used for octree storage and frustum culling.
    pub fn world_bounding_box(&self) -> BoundingBox {
        match self.light_type {
            // Directional lights affect everything; an unbounded box keeps
            // them in every query.
            LightType::Directional => BoundingBox::new(
                Vec3::new(f32::MIN, f32::MIN, f32::MIN),
                Vec3::new(f32::MAX, f32::MAX, f32::MAX),
            ),
            LightType::Spot => self.frustum().bounding_box(),
            LightType::Point => BoundingBox::from_center_half_size(
                self.position,
                Vec3::new(self.range, self.range, self.range),
            ),
        }
    }

    /// Number of requested directional shadow splits.
    pub fn num_shadow_splits(&self) -> usize {
        self.shadow_cascade.num_splits().max(1)
    }

    /// Model transform for deferred light volume geometry.
    pub fn volume_transform(&self) -> Mat4 {
        match self.light_type {
            // Directional volumes are fullscreen; identity with view override.
            LightType::Directional => Mat4::identity(),
            LightType::Spot => {
                let scale = self.range;
                self.world_transform() * Mat4::new_scaling(scale)
            }
            // Slightly inflated so the camera near plane never clips the
            // sphere while inside the light.
            LightType::Point => {
                mat4_from_translation_scale(self.position, self.range * 1.25)
            }
        }
    }
}

fn mat4_from_translation_scale(t: Vec3, scale: f32) -> Mat4 {
    let mut m = Mat4::new_scaling(scale);
    m[(0, 3)] = t.x;
    m[(1, 3)] = t.y;
    m[(2, 3)] = t.z;
    m[(3, 3)] = 1.0;
    m
}

/// Ordering used after culling: per-vertex lights first (their base pass is
/// evaluated first), then nearest lights, so shadow-map allocation favors
/// the most prominent lights.
pub fn compare_lights(a: &(Arc<Light>, f32), b: &(Arc<Light>, f32)) -> std::cmp::Ordering {
    match (a.0.per_vertex, b.0.per_vertex) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_color_scales_with_brightness() {
        let mut light = Light::new(LightType::Point);
        light.color = Color::new(1.0, 0.5, 0.0, 1.0);
        light.brightness = 2.0;
        let c = light.effective_color();
        assert_eq!(c.r, 2.0);
        assert_eq!(c.g, 1.0);

        light.brightness = 0.0;
        assert!(light.effective_color().is_black());
    }

    #[test]
    fn cascade_split_counting() {
        let cascade = CascadeParameters {
            splits: [30.0, 100.0, 0.0, 0.0],
            bias_auto_adjust: 1.0,
        };
        assert_eq!(cascade.num_splits(), 2);

        let none = CascadeParameters {
            splits: [0.0; MAX_CASCADE_SPLITS],
            bias_auto_adjust: 1.0,
        };
        assert_eq!(none.num_splits(), 0);
    }

    #[test]
    fn point_light_bounds_follow_range() {
        let light = Light::point(Vec3::new(5.0, 0.0, 0.0), 3.0);
        let bounds = light.world_bounding_box();
        assert_eq!(bounds.min, Vec3::new(2.0, -3.0, -3.0));
        assert_eq!(bounds.max, Vec3::new(8.0, 3.0, 3.0));
    }

    #[test]
    fn light_sort_puts_vertex_lights_first() {
        let mut per_vertex = Light::new(LightType::Point);
        per_vertex.per_vertex = true;
        let a = (Arc::new(per_vertex), 100.0f32);
        let b = (Arc::new(Light::new(LightType::Point)), 1.0f32);
        let mut lights = vec![b.clone(), a.clone()];
        lights.sort_by(compare_lights);
        assert!(lights[0].0.per_vertex);
    }

    #[test]
    fn spot_frustum_points_along_direction() {
        let light = Light::spot(
            Vec3::zeros(),
            Vec3::new(0.0, 0.0, -1.0),
            std::f32::consts::FRAC_PI_2,
            10.0,
        );
        let frustum = light.frustum();
        assert!(frustum.contains_point(Vec3::new(0.0, 0.0, -5.0)));
        assert!(!frustum.contains_point(Vec3::new(0.0, 0.0, 5.0)));
    }
}
