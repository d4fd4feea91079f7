//! The drawable capability surface.
//!
//! Anything contributing renderable geometry implements [`Drawable`].
//! Immutable configuration (masks, distances, flags) lives in
//! [`DrawableCore`]; per-frame cached state (distance, zone, light lists,
//! view-space Z range) sits behind a mutex so worker threads can finalize
//! visibility in parallel. Each drawable is owned by exactly one partition
//! per parallel region, so the lock is effectively uncontended.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nightshade_core::bounds::BoundingBox;
use nightshade_core::math::{IntVec2, Mat4, Vec3};

use crate::geometry::{Geometry, GeometryType};
use crate::material::Material;
use crate::occlusion::OcclusionBuffer;
use crate::scene::light::Light;
use crate::scene::zone::Zone;
use crate::types::{DrawableFlags, DEFAULT_MASK};

/// Per-frame context handed to drawables during update.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub frame_number: u64,
    pub time_step: f32,
    pub view_size: IntVec2,
    pub camera_position: Vec3,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self {
            frame_number: 0,
            time_step: 0.0,
            view_size: IntVec2::ZERO,
            camera_position: Vec3::zeros(),
        }
    }
}

/// Where a drawable's geometry update must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateGeometryType {
    /// No geometry update needed.
    #[default]
    None,
    /// Safe to update from a worker thread.
    WorkerThread,
    /// Must update on the thread owning the graphics context.
    MainThread,
}

/// One source of draw data from a drawable: geometry + material + world
/// transforms. Batches with no geometry or no transforms are degenerate and
/// never reach a queue.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub distance: f32,
    pub geometry: Option<Arc<Geometry>>,
    pub material: Option<Arc<Material>>,
    pub transforms: Arc<Vec<Mat4>>,
    pub geometry_type: GeometryType,
}

impl Default for SourceBatch {
    fn default() -> Self {
        Self {
            distance: 0.0,
            geometry: None,
            material: None,
            transforms: Arc::new(Vec::new()),
            geometry_type: GeometryType::Static,
        }
    }
}

/// Mutable per-frame drawable state.
#[derive(Debug, Default)]
pub struct DrawableFrameState {
    pub distance: f32,
    pub lod_distance: f32,
    /// Occluder ordering key (triangles per unit of screen size).
    pub sort_value: f32,
    pub min_z: f32,
    pub max_z: f32,
    in_view_frame: u64,
    in_any_view_frame: u64,
    pub zone: Option<Arc<Zone>>,
    zone_dirty: bool,
    lights: Vec<Arc<Light>>,
    vertex_lights: Vec<Arc<Light>>,
    /// Which source batch indices already produced a base pass this frame.
    /// Growable bitset; there is no cap on sub-batch count.
    base_pass_flags: Vec<u64>,
}

/// Shared drawable configuration + frame state.
#[derive(Debug)]
pub struct DrawableCore {
    pub flags: DrawableFlags,
    pub view_mask: u32,
    pub light_mask: u32,
    pub shadow_mask: u32,
    pub zone_mask: u32,
    pub draw_distance: f32,
    pub shadow_distance: f32,
    pub cast_shadows: bool,
    pub occluder: bool,
    pub occludee: bool,
    /// Per-pixel light cap; zero means unlimited.
    pub max_lights: usize,
    state: Mutex<DrawableFrameState>,
}

impl Default for DrawableCore {
    fn default() -> Self {
        Self {
            flags: DrawableFlags::GEOMETRY,
            view_mask: DEFAULT_MASK,
            light_mask: DEFAULT_MASK,
            shadow_mask: DEFAULT_MASK,
            zone_mask: DEFAULT_MASK,
            draw_distance: 0.0,
            shadow_distance: 0.0,
            cast_shadows: false,
            occluder: false,
            occludee: true,
            max_lights: 0,
            state: Mutex::new(DrawableFrameState {
                zone_dirty: true,
                ..Default::default()
            }),
        }
    }
}

impl DrawableCore {
    pub fn distance(&self) -> f32 {
        self.state.lock().distance
    }

    pub fn set_distance(&self, distance: f32) {
        let mut state = self.state.lock();
        state.distance = distance;
        state.lod_distance = distance;
    }

    pub fn lod_distance(&self) -> f32 {
        self.state.lock().lod_distance
    }

    pub fn sort_value(&self) -> f32 {
        self.state.lock().sort_value
    }

    pub fn set_sort_value(&self, value: f32) {
        self.state.lock().sort_value = value;
    }

    pub fn min_max_z(&self) -> (f32, f32) {
        let state = self.state.lock();
        (state.min_z, state.max_z)
    }

    pub fn set_min_max_z(&self, min_z: f32, max_z: f32) {
        let mut state = self.state.lock();
        state.min_z = min_z;
        state.max_z = max_z;
    }

    /// Mark visible this frame. `main_view` distinguishes the camera view
    /// from shadow-caster marking.
    pub fn mark_in_view(&self, frame_number: u64, main_view: bool) {
        let mut state = self.state.lock();
        if main_view {
            state.in_view_frame = frame_number;
        }
        state.in_any_view_frame = frame_number;
    }

    /// Visible in the main camera view this frame.
    pub fn is_in_view(&self, frame_number: u64) -> bool {
        self.state.lock().in_view_frame == frame_number
    }

    /// Visible in any view (including shadow maps) this frame.
    pub fn is_in_any_view(&self, frame_number: u64) -> bool {
        let state = self.state.lock();
        state.in_view_frame == frame_number || state.in_any_view_frame == frame_number
    }

    pub fn zone(&self) -> Option<Arc<Zone>> {
        self.state.lock().zone.clone()
    }

    /// Assign a zone; a temporary assignment is re-evaluated next frame.
    pub fn set_zone(&self, zone: Option<Arc<Zone>>, temporary: bool) {
        let mut state = self.state.lock();
        state.zone = zone;
        state.zone_dirty = temporary;
    }

    pub fn is_zone_dirty(&self) -> bool {
        self.state.lock().zone_dirty
    }

    /// Reset light lists and base pass flags for a new frame.
    pub fn clear_lights(&self) {
        let mut state = self.state.lock();
        state.lights.clear();
        state.vertex_lights.clear();
        state.base_pass_flags.clear();
    }

    pub fn add_light(&self, light: Arc<Light>) {
        self.state.lock().lights.push(light);
    }

    pub fn add_vertex_light(&self, light: Arc<Light>) {
        self.state.lock().vertex_lights.push(light);
    }

    pub fn lights(&self) -> Vec<Arc<Light>> {
        self.state.lock().lights.clone()
    }

    pub fn vertex_lights(&self) -> Vec<Arc<Light>> {
        self.state.lock().vertex_lights.clone()
    }

    pub fn first_light(&self) -> Option<Arc<Light>> {
        self.state.lock().lights.first().cloned()
    }

    /// Rank lights by proximity to the drawable and truncate to the
    /// per-drawable cap.
    pub fn limit_lights(&self, center: Vec3) {
        let max_lights = self.max_lights;
        if max_lights == 0 {
            return;
        }
        let mut state = self.state.lock();
        if state.lights.len() <= max_lights {
            return;
        }
        state.lights.sort_by(|a, b| {
            let da = light_rank(a, center);
            let db = light_rank(b, center);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        state.lights.truncate(max_lights);
    }

    /// Cap vertex lights to the fixed shader register budget.
    pub fn limit_vertex_lights(&self, center: Vec3, max_vertex_lights: usize) {
        let mut state = self.state.lock();
        if state.vertex_lights.len() <= max_vertex_lights {
            return;
        }
        state.vertex_lights.sort_by(|a, b| {
            let da = light_rank(a, center);
            let db = light_rank(b, center);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        state.vertex_lights.truncate(max_vertex_lights);
    }

    /// Record that source batch `index` produced a base pass this frame.
    pub fn set_base_pass(&self, index: usize) {
        let mut state = self.state.lock();
        let word = index / 64;
        if state.base_pass_flags.len() <= word {
            state.base_pass_flags.resize(word + 1, 0);
        }
        state.base_pass_flags[word] |= 1 << (index % 64);
    }

    pub fn has_base_pass(&self, index: usize) -> bool {
        let state = self.state.lock();
        state
            .base_pass_flags
            .get(index / 64)
            .is_some_and(|word| word & (1 << (index % 64)) != 0)
    }
}

/// Proximity rank of a light relative to a point; directional lights rank
/// first.
fn light_rank(light: &Light, center: Vec3) -> f32 {
    match light.light_type {
        crate::scene::light::LightType::Directional => 0.0,
        _ => (light.position - center).norm() / light.brightness.abs().max(1e-3),
    }
}

/// Capability surface of a renderable scene object.
pub trait Drawable: Send + Sync {
    /// Shared configuration and per-frame state.
    fn core(&self) -> &DrawableCore;

    /// World-space bounds, valid whenever the octree holds the drawable.
    fn world_bounding_box(&self) -> BoundingBox;

    /// Refresh per-frame batch state (distance, LOD). May be called more
    /// than once per frame from different light tasks; must be idempotent.
    fn update_batches(&self, frame: &FrameInfo) {
        let distance = (self.world_bounding_box().center() - frame.camera_position).norm();
        self.core().set_distance(distance);
    }

    /// Update GPU-side geometry. Runs on the thread class reported by
    /// [`update_geometry_type`](Drawable::update_geometry_type).
    fn update_geometry(&self, _frame: &FrameInfo) {}

    /// Which thread class the geometry update needs.
    fn update_geometry_type(&self) -> UpdateGeometryType {
        UpdateGeometryType::None
    }

    /// Source batches to render this frame.
    fn batches(&self) -> Vec<SourceBatch> {
        Vec::new()
    }

    /// Triangles this drawable would contribute to the occlusion buffer.
    fn num_occluder_triangles(&self) -> u32 {
        0
    }

    /// Rasterize into the occlusion buffer. Returns false when the
    /// triangle budget ran out.
    fn draw_occlusion(&self, _buffer: &mut OcclusionBuffer) -> bool {
        true
    }
}

/// A static mesh: one geometry, one optional material, one world transform.
pub struct StaticMesh {
    core: DrawableCore,
    geometry: Arc<Geometry>,
    material: Option<Arc<Material>>,
    transforms: Arc<Vec<Mat4>>,
    world_bounding_box: BoundingBox,
    geometry_type: GeometryType,
    update_type: UpdateGeometryType,
    occluder_triangles: u32,
    geometry_updates: AtomicU32,
}

impl StaticMesh {
    pub fn new(geometry: Arc<Geometry>, world_bounding_box: BoundingBox) -> Self {
        Self {
            core: DrawableCore::default(),
            geometry,
            material: None,
            transforms: Arc::new(vec![Mat4::identity()]),
            world_bounding_box,
            geometry_type: GeometryType::Static,
            update_type: UpdateGeometryType::None,
            occluder_triangles: 0,
            geometry_updates: AtomicU32::new(0),
        }
    }

    pub fn with_material(mut self, material: Arc<Material>) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transforms = Arc::new(vec![transform]);
        self
    }

    /// Multiple pre-transformed copies sharing one source batch.
    pub fn with_transforms(mut self, transforms: Vec<Mat4>) -> Self {
        self.transforms = Arc::new(transforms);
        self
    }

    pub fn with_geometry_type(mut self, geometry_type: GeometryType) -> Self {
        self.geometry_type = geometry_type;
        self
    }

    pub fn with_update_type(mut self, update_type: UpdateGeometryType) -> Self {
        self.update_type = update_type;
        self
    }

    pub fn as_occluder(mut self, triangles: u32) -> Self {
        self.core.occluder = true;
        self.occluder_triangles = triangles;
        self
    }

    pub fn casting_shadows(mut self) -> Self {
        self.core.cast_shadows = true;
        self
    }

    pub fn with_max_lights(mut self, max_lights: usize) -> Self {
        self.core.max_lights = max_lights;
        self
    }

    pub fn with_draw_distance(mut self, distance: f32) -> Self {
        self.core.draw_distance = distance;
        self
    }

    pub fn core_mut(&mut self) -> &mut DrawableCore {
        &mut self.core
    }

    /// How many times update_geometry ran; used by scheduling tests.
    pub fn geometry_update_count(&self) -> u32 {
        self.geometry_updates.load(Ordering::Relaxed)
    }
}

impl Drawable for StaticMesh {
    fn core(&self) -> &DrawableCore {
        &self.core
    }

    fn world_bounding_box(&self) -> BoundingBox {
        self.world_bounding_box
    }

    fn update_geometry(&self, _frame: &FrameInfo) {
        self.geometry_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn update_geometry_type(&self) -> UpdateGeometryType {
        self.update_type
    }

    fn batches(&self) -> Vec<SourceBatch> {
        vec![SourceBatch {
            distance: self.core.distance(),
            geometry: Some(self.geometry.clone()),
            material: self.material.clone(),
            transforms: self.transforms.clone(),
            geometry_type: self.geometry_type,
        }]
    }

    fn num_occluder_triangles(&self) -> u32 {
        self.occluder_triangles
    }

    fn draw_occlusion(&self, buffer: &mut OcclusionBuffer) -> bool {
        buffer.draw_box(&self.world_bounding_box)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mesh() -> StaticMesh {
        StaticMesh::new(
            Geometry::indexed(8, 36),
            BoundingBox::from_center_half_size(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0)),
        )
    }

    #[test]
    fn base_pass_bitset_grows_past_64() {
        let mesh = test_mesh();
        let core = mesh.core();

        core.set_base_pass(3);
        core.set_base_pass(100);

        assert!(core.has_base_pass(3));
        assert!(core.has_base_pass(100));
        assert!(!core.has_base_pass(4));
        assert!(!core.has_base_pass(64));

        core.clear_lights();
        assert!(!core.has_base_pass(3));
        assert!(!core.has_base_pass(100));
    }

    #[test]
    fn in_view_marking_distinguishes_main_view() {
        let mesh = test_mesh();
        let core = mesh.core();

        core.mark_in_view(7, false);
        assert!(!core.is_in_view(7));
        assert!(core.is_in_any_view(7));

        core.mark_in_view(7, true);
        assert!(core.is_in_view(7));
    }

    #[test]
    fn light_limit_keeps_closest() {
        let mesh = test_mesh().with_max_lights(1);
        let core = mesh.core();

        let near = Light::point(Vec3::new(1.0, 0.0, 0.0), 5.0);
        let far = Light::point(Vec3::new(50.0, 0.0, 0.0), 5.0);
        core.add_light(far.clone());
        core.add_light(near.clone());

        core.limit_lights(Vec3::zeros());
        let lights = core.lights();
        assert_eq!(lights.len(), 1);
        assert_eq!(lights[0].id(), near.id());
    }

    #[test]
    fn update_batches_sets_distance() {
        let mesh = test_mesh();
        let frame = FrameInfo {
            camera_position: Vec3::new(0.0, 0.0, 10.0),
            ..Default::default()
        };
        mesh.update_batches(&frame);
        assert!((mesh.core().distance() - 10.0).abs() < 1e-5);
    }

    #[test]
    fn source_batch_carries_transforms() {
        let mesh = test_mesh().with_transforms(vec![Mat4::identity(); 3]);
        let batches = mesh.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].transforms.len(), 3);
    }
}
