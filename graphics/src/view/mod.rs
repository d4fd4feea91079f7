//! The frame view: per-camera, per-frame rendering pipeline.
//!
//! A [`View`] turns a scene octree + camera + render path into device draw
//! calls, in three phases per frame:
//!
//! 1. [`define`](View::define) — resolve the viewport: validate camera and
//!    octree, scan the render path for scene passes and lighting roles,
//!    compute the view rectangle.
//! 2. [`update`](View::update) — cull the octree, process lights in
//!    parallel, build sorted batch queues.
//! 3. [`render`](View::render) — sort queues and update geometry in
//!    parallel, allocate screen buffers, execute the render path commands.
//!
//! Everything per-frame is rebuilt each frame; only pooled allocations and
//! persistent named render targets survive.

pub mod batch;
pub(crate) mod culling;
pub(crate) mod executor;
pub(crate) mod lights;

pub use batch::{Batch, BatchGroup, BatchQueue, LightBatchQueue, LightQueueRef, ShadowBatchQueue};
pub use lights::LightQueryResult;

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nightshade_core::math::{IntRect, IntVec2};
use nightshade_core::pool::{Poolable, Pooled};
use nightshade_core::thread::WorkQueue;

use crate::device::{GraphicsDevice, TextureHandle};
use crate::geometry::GeometryType;
use crate::material::{
    Material, MaterialQuality, Pass, Technique, PASS_ALPHA, PASS_BASE, PASS_LIGHT, PASS_LITALPHA,
    PASS_LITBASE, PASS_SHADOW,
};
use crate::path::{RenderCommandType, RenderPath, SortMode};
use crate::renderer::Renderer;
use crate::scene::light::LightType;
use crate::scene::{Camera, Drawable, FrameInfo, Light, Octree, SourceBatch, ViewOverrideFlags, Zone};
use crate::types::BlendMode;

use lights::{finalize_shadow_camera, process_light, shadow_map_viewport, LightProcessContext};

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

/// What a view renders from and to.
pub struct Viewport {
    pub render_path: RenderPath,
    pub octree: Option<Arc<Octree>>,
    pub camera: Option<Camera>,
    /// Sub-rectangle of the destination; zero means the whole surface.
    pub rect: IntRect,
}

impl Viewport {
    pub fn new(render_path: RenderPath) -> Self {
        Self {
            render_path,
            octree: None,
            camera: None,
            rect: IntRect::ZERO,
        }
    }
}

/// Per-scene-pass bookkeeping resolved at define time.
#[derive(Debug, Clone)]
pub struct ScenePassInfo {
    pub pass: String,
    pub allow_instancing: bool,
    pub mark_to_stencil: bool,
    pub vertex_lights: bool,
}

/// Per-partition output of the parallel visibility pass.
pub(crate) struct PerThreadSceneResult {
    pub geometries: Vec<Arc<dyn Drawable>>,
    pub lights: Vec<Arc<Light>>,
    pub min_z: f32,
    pub max_z: f32,
}

impl Default for PerThreadSceneResult {
    fn default() -> Self {
        Self {
            geometries: Vec::new(),
            lights: Vec::new(),
            min_z: f32::INFINITY,
            max_z: 0.0,
        }
    }
}

/// Pooled per-frame light query storage.
#[derive(Default)]
struct LightQueryScratch {
    queries: Vec<LightQueryResult>,
}

impl Poolable for LightQueryScratch {
    fn new_empty() -> Self {
        Self::default()
    }
    fn reset(&mut self) {
        self.queries.clear();
    }
}

/// One camera's rendering pipeline for one frame.
pub struct View {
    id: u64,
    work_queue: Arc<WorkQueue>,

    // Defined per viewport.
    render_path: RenderPath,
    render_path_version: Option<u64>,
    octree: Option<Arc<Octree>>,
    pub(crate) camera: Option<Camera>,
    render_target: Option<TextureHandle>,
    view_rect: IntRect,
    view_size: IntVec2,
    rt_size: IntVec2,
    has_scene_passes: bool,
    scene_passes: Vec<ScenePassInfo>,
    gbuffer_pass: String,
    base_pass: String,
    alpha_pass: String,
    light_pass: String,
    litbase_pass: String,
    litalpha_pass: String,
    pub(crate) deferred: bool,
    pub(crate) deferred_ambient: bool,
    use_lit_base: bool,
    light_volume_vs: String,
    light_volume_ps: String,
    pub(crate) draw_shadows: bool,
    material_quality: MaterialQuality,
    pub(crate) max_occluder_triangles: u32,
    pub(crate) occluder_size_threshold: f32,
    min_instances: usize,
    max_vertex_lights: usize,

    // Rebuilt per frame.
    pub(crate) frame: FrameInfo,
    pub(crate) camera_zone: Arc<Zone>,
    pub(crate) far_clip_zone: Arc<Zone>,
    pub(crate) camera_zone_override: bool,
    pub(crate) highest_zone_priority: i32,
    pub(crate) zones: Vec<Arc<Zone>>,
    pub(crate) occluders: Vec<Arc<dyn Drawable>>,
    pub(crate) geometries: Vec<Arc<dyn Drawable>>,
    pub(crate) lights: Vec<Arc<Light>>,
    pub(crate) light_distances: HashMap<u64, f32>,
    pub(crate) min_z: f32,
    pub(crate) max_z: f32,
    pub(crate) occlusion_buffer: Option<crate::occlusion::OcclusionBuffer>,
    pub(crate) batch_queues: HashMap<String, BatchQueue>,
    pub(crate) light_queues: Vec<LightBatchQueue>,
    light_queue_indices: HashMap<u64, usize>,
    pub(crate) vertex_light_queues: HashMap<u64, LightBatchQueue>,
    max_lights_drawables: Vec<Arc<dyn Drawable>>,
    light_query_scratch: Pooled<LightQueryScratch>,
    threaded_geometries: Vec<Option<Arc<dyn Drawable>>>,
    non_threaded_geometries: Vec<Arc<dyn Drawable>>,
}

impl View {
    /// Create a view bound to a worker pool. Collaborators (device,
    /// renderer, octree) arrive through the per-frame calls.
    pub fn new(work_queue: Arc<WorkQueue>) -> Self {
        let placeholder_zone = Zone::default_zone();
        Self {
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            work_queue,
            render_path: RenderPath::new(),
            render_path_version: None,
            octree: None,
            camera: None,
            render_target: None,
            view_rect: IntRect::ZERO,
            view_size: IntVec2::ZERO,
            rt_size: IntVec2::ZERO,
            has_scene_passes: false,
            scene_passes: Vec::new(),
            gbuffer_pass: String::new(),
            base_pass: PASS_BASE.to_string(),
            alpha_pass: PASS_ALPHA.to_string(),
            light_pass: PASS_LIGHT.to_string(),
            litbase_pass: PASS_LITBASE.to_string(),
            litalpha_pass: PASS_LITALPHA.to_string(),
            deferred: false,
            deferred_ambient: false,
            use_lit_base: true,
            light_volume_vs: String::new(),
            light_volume_ps: String::new(),
            draw_shadows: true,
            material_quality: MaterialQuality::High,
            max_occluder_triangles: 0,
            occluder_size_threshold: 0.025,
            min_instances: 2,
            max_vertex_lights: 4,
            frame: FrameInfo::default(),
            camera_zone: placeholder_zone.clone(),
            far_clip_zone: placeholder_zone,
            camera_zone_override: false,
            highest_zone_priority: i32::MIN,
            zones: Vec::new(),
            occluders: Vec::new(),
            geometries: Vec::new(),
            lights: Vec::new(),
            light_distances: HashMap::new(),
            min_z: 0.0,
            max_z: 0.0,
            occlusion_buffer: None,
            batch_queues: HashMap::new(),
            light_queues: Vec::new(),
            light_queue_indices: HashMap::new(),
            vertex_light_queues: HashMap::new(),
            max_lights_drawables: Vec::new(),
            light_query_scratch: Pooled::default(),
            threaded_geometries: Vec::new(),
            non_threaded_geometries: Vec::new(),
        }
    }

    /// Stable identity used to key persistent render targets.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn view_rect(&self) -> IntRect {
        self.view_rect
    }

    pub fn view_size(&self) -> IntVec2 {
        self.view_size
    }

    pub fn scene_passes(&self) -> &[ScenePassInfo] {
        &self.scene_passes
    }

    pub fn light_queues(&self) -> &[LightBatchQueue] {
        &self.light_queues
    }

    pub fn batch_queue(&self, pass: &str) -> Option<&BatchQueue> {
        self.batch_queues.get(pass)
    }

    pub fn geometries(&self) -> &[Arc<dyn Drawable>] {
        &self.geometries
    }

    pub fn lights(&self) -> &[Arc<Light>] {
        &self.lights
    }

    pub fn zones(&self) -> &[Arc<Zone>] {
        &self.zones
    }

    pub fn min_max_z(&self) -> (f32, f32) {
        (self.min_z, self.max_z)
    }

    /// Set up the view for a viewport and destination surface.
    ///
    /// Returns false when this frame cannot be rendered (no camera or
    /// octree while scene passes exist, invalid projection); a false
    /// return makes the whole frame a no-op, never a crash.
    pub fn define(
        &mut self,
        render_target: Option<TextureHandle>,
        viewport: &Viewport,
        renderer: &Renderer,
        device: &dyn GraphicsDevice,
    ) -> bool {
        // Re-cache the render path only when the viewport's copy changed;
        // state the executor clears (failed shader names) stays cleared
        // otherwise.
        if self.render_path_version != Some(viewport.render_path.version()) {
            self.render_path = viewport.render_path.clone();
            self.render_path_version = Some(viewport.render_path.version());
        }
        if self.render_path.commands().is_empty() {
            return false;
        }

        // Reset pass-name roles, then let command metadata override them.
        self.gbuffer_pass.clear();
        self.base_pass = PASS_BASE.to_string();
        self.alpha_pass = PASS_ALPHA.to_string();
        self.light_pass = PASS_LIGHT.to_string();
        self.litbase_pass = PASS_LITBASE.to_string();
        self.litalpha_pass = PASS_LITALPHA.to_string();

        self.has_scene_passes = false;
        self.scene_passes.clear();
        self.deferred = false;
        self.deferred_ambient = false;
        self.use_lit_base = false;

        for command in self.render_path.commands() {
            if !command.enabled {
                continue;
            }
            match command.command_type {
                RenderCommandType::ScenePass => {
                    self.has_scene_passes = true;
                    self.scene_passes.push(ScenePassInfo {
                        pass: command.pass.clone(),
                        allow_instancing: command.sort_mode != SortMode::BackToFront,
                        mark_to_stencil: command.mark_to_stencil,
                        vertex_lights: command.vertex_lights,
                    });
                    self.batch_queues.entry(command.pass.clone()).or_default();

                    // Metadata defines custom passes that interact with
                    // lighting.
                    match command.metadata.as_str() {
                        "gbuffer" => self.gbuffer_pass = command.pass.clone(),
                        "base" if command.pass != PASS_BASE => {
                            self.base_pass = command.pass.clone();
                            self.litbase_pass = format!("lit{}", command.pass);
                        }
                        "alpha" if command.pass != PASS_ALPHA => {
                            self.alpha_pass = command.pass.clone();
                            self.litalpha_pass = format!("lit{}", command.pass);
                        }
                        _ => {}
                    }

                    // Ambient written together with multiple targets means
                    // deferred G-buffer + ambient in one pass.
                    if command.output_names.len() > 1 && command.writes_viewport() {
                        self.deferred_ambient = true;
                    }
                }
                RenderCommandType::ForwardLights => {
                    if !command.pass.is_empty() {
                        self.light_pass = command.pass.clone();
                    }
                    self.use_lit_base = command.use_lit_base;
                }
                RenderCommandType::LightVolumes => {
                    self.light_volume_vs = command.vertex_shader.clone();
                    self.light_volume_ps = command.pixel_shader.clone();
                    self.deferred = true;
                }
                _ => {}
            }
        }

        self.octree = None;
        self.camera = viewport.camera.clone();
        self.camera_zone = renderer.default_zone().clone();
        self.far_clip_zone = renderer.default_zone().clone();

        if self.has_scene_passes {
            let Some(camera) = &self.camera else {
                return false;
            };
            if !camera.is_projection_valid() {
                return false;
            }
            let Some(octree) = &viewport.octree else {
                return false;
            };
            self.octree = Some(octree.clone());
        }

        self.render_target = render_target;

        // Validate the rect; a zero rect means the whole target.
        let rt_size = match render_target {
            Some(texture) => device.texture_size(texture).unwrap_or(IntVec2::ZERO),
            None => device.backbuffer_size(),
        };
        self.view_rect = if viewport.rect == IntRect::ZERO {
            IntRect::new(0, 0, rt_size.x, rt_size.y)
        } else {
            viewport.rect.clamped_to(rt_size.x, rt_size.y)
        };
        self.view_size = self.view_rect.size();
        self.rt_size = rt_size;

        let config = renderer.config();
        self.draw_shadows = config.draw_shadows;
        self.material_quality = config.material_quality;
        self.max_occluder_triangles = config.max_occluder_triangles;
        self.occluder_size_threshold = config.occluder_size_threshold;
        self.min_instances = config.min_instances;
        self.max_vertex_lights = config.max_vertex_lights;
        self.use_lit_base &= config.use_lit_base;

        // Camera quality overrides.
        if let Some(camera) = &self.camera {
            let overrides = camera.view_override_flags;
            if overrides.contains(ViewOverrideFlags::LOW_MATERIAL_QUALITY) {
                self.material_quality = MaterialQuality::Low;
            }
            if overrides.contains(ViewOverrideFlags::DISABLE_SHADOWS) {
                self.draw_shadows = false;
            }
            if overrides.contains(ViewOverrideFlags::DISABLE_OCCLUSION) {
                self.max_occluder_triangles = 0;
            }
        }

        // Extreme aspect ratios make the fixed-width occlusion buffer
        // useless.
        if self.view_size.y > self.view_size.x * 4 {
            self.max_occluder_triangles = 0;
        }

        true
    }

    /// Per-frame update: cull, process lights, build batches.
    pub fn update(
        &mut self,
        frame_number: u64,
        time_step: f32,
        renderer: &mut Renderer,
        device: &mut dyn GraphicsDevice,
    ) {
        self.frame = FrameInfo {
            frame_number,
            time_step,
            view_size: self.view_size,
            camera_position: self.camera.as_ref().map_or_else(
                nightshade_core::math::Vec3::zeros,
                |c| c.position,
            ),
        };

        // Reset per-frame state, keeping allocations.
        self.zones.clear();
        self.occluders.clear();
        self.geometries.clear();
        self.lights.clear();
        self.light_queues.clear();
        self.light_queue_indices.clear();
        self.vertex_light_queues.clear();
        self.max_lights_drawables.clear();
        for queue in self.batch_queues.values_mut() {
            queue.clear();
        }

        if self.has_scene_passes && (self.camera.is_none() || self.octree.is_none()) {
            return;
        }

        if let Some(camera) = &mut self.camera {
            if camera.auto_aspect_ratio() && self.view_size.y > 0 {
                camera.set_aspect_ratio_internal(self.view_size.x as f32 / self.view_size.y as f32);
            }
        }

        self.get_drawables(renderer);
        self.get_batches(renderer, device);
    }

    /// Effective zone of a drawable for ambient/fog parameters.
    pub(crate) fn zone_of(&self, drawable: &Arc<dyn Drawable>) -> Arc<Zone> {
        if self.camera_zone_override {
            return self.camera_zone.clone();
        }
        drawable
            .core()
            .zone()
            .unwrap_or_else(|| self.camera_zone.clone())
    }

    /// Technique for a drawable + material under the current quality level.
    fn technique_for(
        &self,
        drawable: &Arc<dyn Drawable>,
        material: Option<&Arc<Material>>,
        renderer: &Renderer,
    ) -> Option<Arc<Technique>> {
        let lod_distance = drawable.core().lod_distance();
        match material {
            Some(material) => material.technique_for(lod_distance, self.material_quality),
            None => renderer
                .default_material()
                .technique_for(lod_distance, self.material_quality),
        }
    }

    fn classify_geometry_update(&mut self, drawable: &Arc<dyn Drawable>) {
        match drawable.update_geometry_type() {
            crate::scene::UpdateGeometryType::MainThread => {
                self.non_threaded_geometries.push(drawable.clone());
            }
            crate::scene::UpdateGeometryType::WorkerThread => {
                self.threaded_geometries.push(Some(drawable.clone()));
            }
            crate::scene::UpdateGeometryType::None => {}
        }
    }

    /// Build light queues, shadow batches and base-pass batches.
    fn get_batches(&mut self, renderer: &mut Renderer, device: &mut dyn GraphicsDevice) {
        if self.octree.is_none() || self.camera.is_none() {
            return;
        }
        self.non_threaded_geometries.clear();
        self.threaded_geometries.clear();

        // ----- Parallel per-light processing -----
        let mut queries = std::mem::take(&mut self.light_query_scratch.activate().queries);
        queries.clear();
        queries.extend(self.lights.iter().map(|l| LightQueryResult::new(l.clone())));

        {
            let camera = self.camera.as_ref().unwrap();
            let octree: &Octree = self.octree.as_deref().unwrap();
            let geometries: &[Arc<dyn Drawable>] = &self.geometries;
            let distances = &self.light_distances;
            let frame = self.frame;
            let min_z = self.min_z;
            let max_z = self.max_z;
            let draw_shadows = self.draw_shadows;
            let cube_shadow_support = renderer.config().cube_shadow_support;

            let partitions = self.work_queue.num_partitions();
            let per = (queries.len() / partitions).max(1);
            self.work_queue.pool().scope(|s| {
                let mut rest = queries.as_mut_slice();
                while !rest.is_empty() {
                    let take = per.min(rest.len());
                    let (chunk, tail) = rest.split_at_mut(take);
                    rest = tail;
                    let is_last = rest.is_empty();
                    let work = move || {
                        for query in chunk {
                            let context = LightProcessContext {
                                frame,
                                camera,
                                octree,
                                geometries,
                                min_z,
                                max_z,
                                draw_shadows,
                                cube_shadow_support,
                                light_distance: distances
                                    .get(&query.light.id())
                                    .copied()
                                    .unwrap_or(0.0),
                            };
                            process_light(&context, query);
                        }
                    };
                    if is_last {
                        // The calling thread takes the final partition.
                        work();
                    } else {
                        s.spawn(work);
                    }
                }
            });
        }

        // ----- Sequential light queue building -----
        let volume_pass = Arc::new(
            Pass::new("lightvolume", BlendMode::Add)
                .with_shaders(&self.light_volume_vs, &self.light_volume_ps),
        );

        let mut seen_max_lights: HashSet<usize> = HashSet::new();

        for query in &mut queries {
            if query.lit_geometries.is_empty() {
                continue;
            }
            let light = query.light.clone();

            if !light.per_vertex {
                let queue_index = self.light_queues.len();
                self.light_queue_indices.insert(light.id(), queue_index);

                let mut light_queue = LightBatchQueue {
                    light: Some(light.clone()),
                    ..Default::default()
                };

                // Allocate the shadow map only now that casters are known;
                // allocation failure demotes the light to unshadowed.
                let mut shadow_splits = query.num_splits;
                if shadow_splits > 0 {
                    light_queue.shadow_map = renderer.get_shadow_map(device);
                    if light_queue.shadow_map.is_none() {
                        shadow_splits = 0;
                    }
                }

                let shadow_map_size = light_queue
                    .shadow_map
                    .and_then(|map| device.texture_size(map))
                    .unwrap_or(IntVec2::ZERO);
                let shadow_cameras = std::mem::take(&mut query.shadow_cameras);

                for (split, mut shadow_camera) in
                    shadow_cameras.into_iter().take(shadow_splits).enumerate()
                {
                    let shadow_viewport = shadow_map_viewport(&light, split, shadow_map_size);
                    finalize_shadow_camera(
                        &mut shadow_camera,
                        &light,
                        shadow_viewport,
                        &query.shadow_caster_box[split],
                    );

                    let mut shadow_queue = ShadowBatchQueue {
                        shadow_camera,
                        shadow_viewport,
                        near_split: query.shadow_near_splits[split],
                        far_split: query.shadow_far_splits[split],
                        shadow_batches: BatchQueue::new(),
                    };

                    let begin = query.shadow_caster_begin[split];
                    let end = query.shadow_caster_end[split];
                    for caster in &query.shadow_casters[begin..end] {
                        // Casters outside the main view still need geometry
                        // updates scheduled.
                        if !caster.core().is_in_any_view(self.frame.frame_number) {
                            caster.core().mark_in_view(self.frame.frame_number, false);
                            self.classify_geometry_update(caster);
                        }

                        let zone = self.zone_of(caster);
                        for source in caster.batches() {
                            let Some(technique) =
                                self.technique_for(caster, source.material.as_ref(), renderer)
                            else {
                                continue;
                            };
                            let Some(pass) = technique.supported_pass(PASS_SHADOW) else {
                                continue;
                            };
                            let batch = make_batch(
                                &source,
                                pass,
                                Some(zone.clone()),
                                LightQueueRef::PerPixel(queue_index),
                                drawable_light_mask_of(caster),
                                false,
                            );
                            shadow_queue.shadow_batches.add_batch(
                                batch,
                                renderer.default_material(),
                                true,
                                self.min_instances,
                            );
                        }
                    }
                    light_queue.shadow_splits.push(shadow_queue);
                }

                // Deferred light volume batch.
                if self.deferred {
                    let mut volume_batch = Batch {
                        distance: self.light_distances.get(&light.id()).copied().unwrap_or(0.0),
                        sort_key: 0,
                        geometry: Some(renderer.light_geometry(light.light_type).clone()),
                        material: Some(renderer.default_material().clone()),
                        pass: volume_pass.clone(),
                        transforms: Arc::new(vec![light.volume_transform()]),
                        transform_offset: 0,
                        num_transforms: 1,
                        geometry_type: if light.light_type == LightType::Directional {
                            GeometryType::ViewOverride
                        } else {
                            GeometryType::Static
                        },
                        zone: None,
                        light_queue: LightQueueRef::PerPixel(queue_index),
                        light_mask: light.light_mask,
                        is_base: false,
                    };
                    volume_batch.calculate_sort_key();
                    light_queue.volume_batches.push(volume_batch);
                }

                self.light_queues.push(light_queue);

                // Lit batches per affected geometry; drawables with a light
                // cap defer to a second pass.
                for drawable in &query.lit_geometries {
                    drawable.core().add_light(light.clone());
                    if drawable.core().max_lights == 0 {
                        self.get_lit_batches(drawable, queue_index, renderer);
                    } else {
                        let key = Arc::as_ptr(drawable) as *const () as usize;
                        if seen_max_lights.insert(key) {
                            self.max_lights_drawables.push(drawable.clone());
                        }
                    }
                }

            } else {
                // Vertex lights accumulate on the drawable and are folded
                // into base-pass batches later.
                for drawable in &query.lit_geometries {
                    drawable.core().add_vertex_light(light.clone());
                }
            }
        }

        self.light_query_scratch.inner_mut().queries = queries;

        // ----- Deferred max-lights pass -----
        let max_lights_drawables = std::mem::take(&mut self.max_lights_drawables);
        for drawable in &max_lights_drawables {
            drawable
                .core()
                .limit_lights(drawable.world_bounding_box().center());
            for light in drawable.core().lights() {
                if let Some(&queue_index) = self.light_queue_indices.get(&light.id()) {
                    self.get_lit_batches(drawable, queue_index, renderer);
                }
            }
        }
        self.max_lights_drawables = max_lights_drawables;

        // ----- Base pass batches -----
        let geometries = std::mem::take(&mut self.geometries);
        for drawable in &geometries {
            self.classify_geometry_update(drawable);
            let zone = self.zone_of(drawable);
            let light_mask = drawable_light_mask_of(drawable);

            let vertex_lights = drawable.core().vertex_lights();
            if !vertex_lights.is_empty() {
                drawable.core().limit_vertex_lights(
                    drawable.world_bounding_box().center(),
                    self.max_vertex_lights,
                );
            }

            for (batch_index, source) in drawable.batches().into_iter().enumerate() {
                let Some(technique) =
                    self.technique_for(drawable, source.material.as_ref(), renderer)
                else {
                    continue;
                };
                if source.geometry.is_none() || source.transforms.is_empty() {
                    continue;
                }

                for info in &self.scene_passes {
                    let Some(pass) = technique.supported_pass(&info.pass) else {
                        // Not an error; the material is inert for this pass.
                        continue;
                    };

                    // Skip the plain base pass where a lit-base batch was
                    // already produced.
                    if info.pass == self.base_pass
                        && drawable.core().has_base_pass(batch_index)
                    {
                        continue;
                    }

                    let mut light_queue = LightQueueRef::None;
                    if info.vertex_lights && !vertex_lights.is_empty() {
                        // A deferred opaque batch must not double-light
                        // through converted per-pixel lights.
                        let effective: Vec<Arc<Light>> =
                            if self.deferred && pass.blend_mode == BlendMode::Replace {
                                drawable
                                    .core()
                                    .vertex_lights()
                                    .into_iter()
                                    .filter(|l| l.per_vertex)
                                    .collect()
                            } else {
                                drawable.core().vertex_lights()
                            };

                        if !effective.is_empty() {
                            let hash = vertex_light_queue_hash(&effective);
                            self.vertex_light_queues.entry(hash).or_insert_with(|| {
                                LightBatchQueue {
                                    light: None,
                                    vertex_lights: effective.clone(),
                                    ..Default::default()
                                }
                            });
                            light_queue = LightQueueRef::Vertex(hash);
                        }
                    }

                    let mut allow_instancing = info.allow_instancing;
                    if allow_instancing
                        && info.mark_to_stencil
                        && light_mask != (zone.light_mask & 0xff)
                    {
                        allow_instancing = false;
                    }

                    let mut batch = make_batch(
                        &source,
                        pass.clone(),
                        Some(zone.clone()),
                        light_queue,
                        light_mask,
                        true,
                    );
                    batch.is_base = true;
                    if let Some(queue) = self.batch_queues.get_mut(&info.pass) {
                        queue.add_batch(
                            batch,
                            renderer.default_material(),
                            allow_instancing,
                            self.min_instances,
                        );
                    }
                }
            }
        }
        self.geometries = geometries;
    }

    /// Build lit batches for one drawable under one per-pixel light.
    fn get_lit_batches(
        &mut self,
        drawable: &Arc<dyn Drawable>,
        queue_index: usize,
        renderer: &Renderer,
    ) {
        let Some(light) = self.light_queues[queue_index].light.clone() else {
            return;
        };
        let zone = self.zone_of(drawable);
        let light_mask = drawable_light_mask_of(drawable);
        let has_ambient_gradient = zone.has_ambient_gradient();

        // Lit base folds ambient + first light into one replace-blend pass;
        // vertex lights or an ambient gradient require the plain base pass.
        let is_first_light = drawable
            .core()
            .first_light()
            .is_some_and(|first| first.id() == light.id());
        let allow_lit_base = self.use_lit_base
            && !light.is_negative()
            && is_first_light
            && drawable.core().vertex_lights().is_empty()
            && !has_ambient_gradient;

        for (batch_index, source) in drawable.batches().into_iter().enumerate() {
            let Some(technique) = self.technique_for(drawable, source.material.as_ref(), renderer)
            else {
                continue;
            };
            if source.geometry.is_none() || source.transforms.is_empty() {
                continue;
            }
            // Materials rendering into the G-buffer receive their lighting
            // from light volumes, not forward passes.
            if !self.gbuffer_pass.is_empty() && technique.has_pass(&self.gbuffer_pass) {
                continue;
            }

            let mut is_base = false;
            let mut pass = None;
            if allow_lit_base {
                pass = technique.supported_pass(&self.litbase_pass);
                if pass.is_some() {
                    is_base = true;
                    drawable.core().set_base_pass(batch_index);
                } else {
                    pass = technique.supported_pass(&self.light_pass);
                }
            } else {
                pass = technique.supported_pass(&self.light_pass);
            }

            // No lit pass: check for lit transparency.
            let mut is_lit_alpha = false;
            if pass.is_none() {
                pass = technique.supported_pass(&self.litalpha_pass);
                is_lit_alpha = true;
            }
            let Some(pass) = pass else {
                // The material does not receive light at all.
                continue;
            };

            let mut batch = make_batch(
                &source,
                pass,
                Some(zone.clone()),
                LightQueueRef::PerPixel(queue_index),
                light_mask,
                is_base,
            );

            if !is_lit_alpha {
                let queue = &mut self.light_queues[queue_index];
                let target = if is_base {
                    &mut queue.lit_base_batches
                } else {
                    &mut queue.lit_batches
                };
                target.add_batch(batch, renderer.default_material(), true, self.min_instances);
            } else if let Some(alpha_queue) = self.batch_queues.get_mut(&self.alpha_pass) {
                // Transparent batches cannot be instanced.
                batch.is_base = false;
                alpha_queue.add_batch(batch, renderer.default_material(), false, self.min_instances);
            }
        }
    }

    /// Sort batch queues and update drawable geometry, in parallel.
    pub(crate) fn update_geometries(&mut self) {
        // Collect sort jobs: one per necessary scene pass + per light queue.
        let mut sort_modes: HashMap<String, SortMode> = HashMap::new();
        for command in self.render_path.commands() {
            if command.command_type == RenderCommandType::ScenePass
                && command.enabled
                && !command.output_names.is_empty()
            {
                sort_modes.insert(command.pass.clone(), command.sort_mode);
            }
        }

        {
            let batch_queues = &mut self.batch_queues;
            let light_queues = &mut self.light_queues;
            let vertex_light_queues = &mut self.vertex_light_queues;
            self.work_queue.pool().scope(|s| {
                for (pass, queue) in batch_queues.iter_mut() {
                    let Some(mode) = sort_modes.get(pass).copied() else {
                        continue;
                    };
                    s.spawn(move || match mode {
                        SortMode::FrontToBack => queue.sort_front_to_back(),
                        SortMode::BackToFront => queue.sort_back_to_front(),
                    });
                }
                for queue in light_queues.iter_mut() {
                    s.spawn(move || {
                        queue.lit_base_batches.sort_front_to_back();
                        queue.lit_batches.sort_front_to_back();
                        for split in &mut queue.shadow_splits {
                            split.shadow_batches.sort_front_to_back();
                        }
                    });
                }
                for queue in vertex_light_queues.values_mut() {
                    s.spawn(move || {
                        queue.lit_base_batches.sort_front_to_back();
                        queue.lit_batches.sort_front_to_back();
                    });
                }
            });
        }

        // A drawable may have reported a worker-thread update but turn out
        // to need the main thread; move it over, leaving a hole the worker
        // routine tolerates.
        for slot in &mut self.threaded_geometries {
            if let Some(drawable) = slot {
                if drawable.update_geometry_type() == crate::scene::UpdateGeometryType::MainThread {
                    self.non_threaded_geometries.push(drawable.clone());
                    *slot = None;
                }
            }
        }

        let frame = self.frame;
        let threaded = &self.threaded_geometries;
        let non_threaded = &self.non_threaded_geometries;
        let partitions = self.work_queue.num_partitions();
        let per = (threaded.len() / partitions).max(1);
        self.work_queue.pool().scope(|s| {
            for chunk in threaded.chunks(per) {
                s.spawn(move || {
                    for drawable in chunk.iter().flatten() {
                        drawable.update_geometry(&frame);
                    }
                });
            }
            // Main-thread updates run on the calling thread while workers
            // process the rest.
            for drawable in non_threaded {
                drawable.update_geometry(&frame);
            }
        });
    }

    /// Forget per-frame scene references after rendering.
    pub(crate) fn end_frame(&mut self) {
        self.octree = None;
        self.camera = None;
        self.occlusion_buffer = None;
        self.light_query_scratch.release();
    }
}

/// Effective light mask of a drawable (its mask intersected with its
/// zone's).
fn drawable_light_mask_of(drawable: &Arc<dyn Drawable>) -> u32 {
    lights::drawable_light_mask(drawable)
}

/// Build a batch from a drawable source batch + resolved pass.
fn make_batch(
    source: &SourceBatch,
    pass: Arc<Pass>,
    zone: Option<Arc<Zone>>,
    light_queue: LightQueueRef,
    light_mask: u32,
    is_base: bool,
) -> Batch {
    Batch {
        distance: source.distance,
        sort_key: 0,
        geometry: source.geometry.clone(),
        material: source.material.clone(),
        pass,
        transforms: source.transforms.clone(),
        transform_offset: 0,
        num_transforms: source.transforms.len(),
        geometry_type: source.geometry_type,
        zone,
        light_queue,
        light_mask,
        is_base,
    }
}

/// Hash of an exact vertex light combination.
fn vertex_light_queue_hash(lights: &[Arc<Light>]) -> u64 {
    let mut ids: Vec<u64> = lights.iter().map(|l| l.id()).collect();
    ids.sort_unstable();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    ids.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCommand, NullDevice};
    use crate::geometry::Geometry;
    use crate::material::default_material;
    use crate::renderer::RendererConfig;
    use crate::scene::{SceneNode, StaticMesh, UpdateGeometryType};
    use nightshade_core::bounds::BoundingBox;
    use nightshade_core::math::Vec3;

    const FORWARD_PATH: &str = r#"
(commands: [
    (type: "clear", color: Some(Color((0.1, 0.1, 0.1, 1.0))), depth: Some(1.0)),
    (type: "scenepass", pass: "base", metadata: "base", vertex_lights: true),
    (type: "forwardlights", pass: "light"),
    (type: "scenepass", pass: "alpha", sort: "backtofront", metadata: "alpha"),
])
"#;

    fn forward_viewport(octree: Octree) -> Viewport {
        let mut path = RenderPath::new();
        path.load(FORWARD_PATH).unwrap();
        let mut viewport = Viewport::new(path);
        let mut camera = Camera::new();
        camera.set_near_clip(1.0);
        camera.set_far_clip(100.0);
        viewport.camera = Some(camera);
        viewport.octree = Some(Arc::new(octree));
        viewport
    }

    fn lit_mesh(position: Vec3) -> StaticMesh {
        StaticMesh::new(
            Geometry::indexed(8, 36),
            BoundingBox::from_center_half_size(position, Vec3::new(1.0, 1.0, 1.0)),
        )
        .with_material(default_material())
        .casting_shadows()
    }

    fn run_frame(
        view: &mut View,
        viewport: &Viewport,
        renderer: &mut Renderer,
        device: &mut NullDevice,
    ) {
        assert!(view.define(None, viewport, renderer, device));
        view.update(1, 0.016, renderer, device);
        view.render(renderer, device);
    }

    #[test]
    fn forward_frame_draws_visible_geometry() {
        let mut octree = Octree::with_size(200.0);
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            0.0, 0.0, -10.0,
        )))));
        // Behind the camera: culled.
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            0.0, 0.0, 50.0,
        )))));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        run_frame(&mut view, &viewport, &mut renderer, &mut device);

        assert_eq!(device.clear_count(), 1);
        // One visible geometry, one base batch.
        assert_eq!(device.draw_count(), 1);
    }

    #[test]
    fn directional_light_produces_lit_and_shadow_draws() {
        let mut octree = Octree::with_size(200.0);
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            0.0, 0.0, -10.0,
        )))));
        let mut light = Light::new(LightType::Directional);
        light.set_direction(Vec3::new(0.3, -1.0, 0.2));
        light.cast_shadows = true;
        light.shadow_cascade.splits = [30.0, 100.0, 0.0, 0.0];
        octree.insert(SceneNode::Light(Arc::new(light)));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        run_frame(&mut view, &viewport, &mut renderer, &mut device);

        assert_eq!(view.light_queues().len(), 1);
        // Shadow map cleared (depth) + color clear.
        assert!(device.clear_count() >= 2);
        // Lit-base batch plus shadow caster batches drew something.
        assert!(device.draw_count() >= 2);
        // The light allocated a shadow map and bound it.
        assert!(device.commands().iter().any(|c| matches!(
            c,
            DeviceCommand::SetTexture { unit: crate::types::TextureUnit::ShadowMap, texture: Some(_) }
        )));
    }

    #[test]
    fn lit_base_replaces_separate_base_pass() {
        let mut octree = Octree::with_size(200.0);
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            0.0, 0.0, -10.0,
        )))));
        let mut light = Light::new(LightType::Directional);
        light.set_direction(Vec3::new(0.0, -1.0, 0.0));
        octree.insert(SceneNode::Light(Arc::new(light)));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        assert!(view.define(None, &viewport, &renderer, &device));
        view.update(1, 0.016, &mut renderer, &mut device);

        // The geometry's first (and only) light folded ambient into a
        // lit-base batch; the plain base queue stays empty.
        assert_eq!(view.light_queues().len(), 1);
        assert!(!view.light_queues()[0].lit_base_batches.is_empty());
        assert!(view.batch_queue("base").unwrap().is_empty());
    }

    #[test]
    fn occluder_budget_zero_skips_occlusion_entirely() {
        let mut octree = Octree::with_size(200.0);
        // A big occluder in front of a small mesh.
        octree.insert(SceneNode::Geometry(Arc::new(
            lit_mesh(Vec3::new(0.0, 0.0, -5.0)).as_occluder(12),
        )));
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            0.0, 0.0, -50.0,
        )))));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig {
            max_occluder_triangles: 0,
            ..Default::default()
        });
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        assert!(view.define(None, &viewport, &renderer, &device));
        view.update(1, 0.016, &mut renderer, &mut device);

        // No occlusion buffer was built and nothing was occlusion-culled:
        // both meshes are visible.
        assert!(view.occlusion_buffer.is_none());
        assert_eq!(view.geometries().len(), 2);
    }

    #[test]
    fn occluder_hides_geometry_behind_it() {
        let mut octree = Octree::with_size(2000.0);
        // A wall close to the camera, wide enough to cover the view.
        let wall = StaticMesh::new(
            Geometry::indexed(8, 36),
            BoundingBox::from_center_half_size(
                Vec3::new(0.0, 0.0, -5.0),
                Vec3::new(500.0, 500.0, 0.5),
            ),
        )
        .with_material(default_material())
        .as_occluder(12);
        octree.insert(SceneNode::Geometry(Arc::new(wall)));
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            0.0, 0.0, -80.0,
        )))));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        assert!(view.define(None, &viewport, &renderer, &device));
        view.update(1, 0.016, &mut renderer, &mut device);

        assert!(view.occlusion_buffer.is_some());
        // Only the wall survives; the mesh behind it is occluded.
        assert_eq!(view.geometries().len(), 1);
    }

    #[test]
    fn instancing_threshold_across_full_frame() {
        let min_instances = 4;
        let shared_geometry = Geometry::indexed(8, 36);
        let shared_material = default_material();

        let mut octree = Octree::with_size(200.0);
        for i in 0..min_instances {
            let mesh = StaticMesh::new(
                shared_geometry.clone(),
                BoundingBox::from_center_half_size(
                    Vec3::new(i as f32 * 3.0 - 6.0, 0.0, -20.0),
                    Vec3::new(1.0, 1.0, 1.0),
                ),
            )
            .with_material(shared_material.clone());
            octree.insert(SceneNode::Geometry(Arc::new(mesh)));
        }

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig {
            min_instances,
            ..Default::default()
        });
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        run_frame(&mut view, &viewport, &mut renderer, &mut device);

        // K identical static batches at the threshold: exactly one
        // instanced draw covering K instances.
        let instanced: Vec<u32> = device
            .commands()
            .iter()
            .filter_map(|c| match c {
                DeviceCommand::DrawInstanced { instances, .. } => Some(*instances),
                _ => None,
            })
            .collect();
        assert_eq!(instanced, vec![min_instances as u32]);
        // The instance transforms were uploaded in one buffer write.
        assert!(device.commands().iter().any(|c| matches!(
            c,
            DeviceCommand::WriteInstanceBuffer { instances } if *instances == min_instances
        )));
    }

    #[test]
    fn max_lights_cap_limits_lit_batches() {
        let mut octree = Octree::with_size(200.0);
        let mesh = lit_mesh(Vec3::new(0.0, 0.0, -10.0)).with_max_lights(1);
        octree.insert(SceneNode::Geometry(Arc::new(mesh)));
        // Two point lights in range; only the closest may contribute.
        octree.insert(SceneNode::Light(Light::point(Vec3::new(0.0, 2.0, -10.0), 20.0)));
        octree.insert(SceneNode::Light(Light::point(Vec3::new(0.0, 8.0, -10.0), 20.0)));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        assert!(view.define(None, &viewport, &renderer, &device));
        view.update(1, 0.016, &mut renderer, &mut device);

        let lit_batches: usize = view
            .light_queues()
            .iter()
            .map(|q| {
                (!q.lit_base_batches.is_empty()) as usize + (!q.lit_batches.is_empty()) as usize
            })
            .sum();
        assert_eq!(lit_batches, 1);
    }

    #[test]
    fn vertex_lights_merge_into_keyed_queues() {
        let mut octree = Octree::with_size(200.0);
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            -3.0, 0.0, -10.0,
        )))));
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            3.0, 0.0, -10.0,
        )))));

        let mut vertex_light = Light::new(LightType::Point);
        vertex_light.position = Vec3::new(0.0, 2.0, -10.0);
        vertex_light.range = 30.0;
        vertex_light.per_vertex = true;
        octree.insert(SceneNode::Light(Arc::new(vertex_light)));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        assert!(view.define(None, &viewport, &renderer, &device));
        view.update(1, 0.016, &mut renderer, &mut device);

        // Both drawables share the same light combination: one queue.
        assert_eq!(view.vertex_light_queues.len(), 1);
        assert!(view.light_queues().is_empty());
    }

    #[test]
    fn geometry_updates_split_by_thread_class() {
        let mut octree = Octree::with_size(200.0);
        let worker = Arc::new(
            lit_mesh(Vec3::new(-3.0, 0.0, -10.0))
                .with_update_type(UpdateGeometryType::WorkerThread),
        );
        let main = Arc::new(
            lit_mesh(Vec3::new(3.0, 0.0, -10.0))
                .with_update_type(UpdateGeometryType::MainThread),
        );
        octree.insert(SceneNode::Geometry(worker.clone()));
        octree.insert(SceneNode::Geometry(main.clone()));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        run_frame(&mut view, &viewport, &mut renderer, &mut device);

        assert_eq!(worker.geometry_update_count(), 1);
        assert_eq!(main.geometry_update_count(), 1);
    }

    #[test]
    fn define_fails_without_octree_when_scene_passes_exist() {
        let mut path = RenderPath::new();
        path.load(FORWARD_PATH).unwrap();
        let mut viewport = Viewport::new(path);
        viewport.camera = Some(Camera::new());
        // No octree.

        let device = NullDevice::new(640, 480);
        let renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));

        assert!(!view.define(None, &viewport, &renderer, &device));
    }

    #[test]
    fn define_fails_with_invalid_projection() {
        let mut path = RenderPath::new();
        path.load(FORWARD_PATH).unwrap();
        let mut viewport = Viewport::new(path);
        let mut camera = Camera::new();
        camera.set_near_clip(50.0);
        camera.set_far_clip(1.0);
        viewport.camera = Some(camera);
        viewport.octree = Some(Arc::new(Octree::with_size(100.0)));

        let device = NullDevice::new(640, 480);
        let renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));

        assert!(!view.define(None, &viewport, &renderer, &device));
    }

    #[test]
    fn zone_assignment_prefers_priority() {
        let mut octree = Octree::with_size(200.0);
        octree.insert(SceneNode::Geometry(Arc::new(lit_mesh(Vec3::new(
            0.0, 0.0, -10.0,
        )))));
        let low = Zone::new(
            BoundingBox::from_center_half_size(Vec3::new(0.0, 0.0, -10.0), Vec3::new(50.0, 50.0, 50.0)),
            1,
        );
        let high = Zone::new(
            BoundingBox::from_center_half_size(Vec3::new(0.0, 0.0, -10.0), Vec3::new(20.0, 20.0, 20.0)),
            10,
        );
        octree.insert(SceneNode::Zone(low));
        octree.insert(SceneNode::Zone(high.clone()));

        let mut device = NullDevice::new(640, 480);
        let mut renderer = Renderer::new(RendererConfig::default());
        let mut view = View::new(Arc::new(WorkQueue::new(2)));
        let viewport = forward_viewport(octree);

        assert!(view.define(None, &viewport, &renderer, &device));
        view.update(1, 0.016, &mut renderer, &mut device);

        let drawable = &view.geometries()[0];
        let zone = drawable.core().zone().expect("zone assigned");
        assert_eq!(zone.id(), high.id());
    }
}
