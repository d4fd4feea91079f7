//! Draw batches and batch queues.
//!
//! A [`Batch`] is one draw submission unit: geometry + resolved technique
//! pass + world transform(s) + lighting context. [`BatchQueue`] collects
//! batches for one render pass, groups instanceable ones, sorts, and issues
//! device calls. [`LightBatchQueue`] aggregates the per-light queues
//! (lit-base, additive lit, shadow splits, deferred volumes).

use std::collections::HashMap;
use std::sync::Arc;

use nightshade_core::math::{IntRect, Mat4};

use crate::device::{GraphicsDevice, InstanceData, StencilTest, TextureHandle};
use crate::geometry::{Geometry, GeometryType};
use crate::material::{Material, Pass};
use crate::scene::{Camera, Light, Zone};
use crate::types::{CullMode, ShaderParam, ShaderStage};

/// Which light queue a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LightQueueRef {
    /// Unlit or ambient-only.
    #[default]
    None,
    /// Index into the view's per-pixel light queues.
    PerPixel(usize),
    /// Key into the view's vertex light queues.
    Vertex(u64),
}

impl LightQueueRef {
    fn sort_bits(&self) -> u64 {
        match self {
            Self::None => 0,
            Self::PerPixel(i) => (*i as u64).wrapping_add(1),
            Self::Vertex(h) => *h,
        }
    }
}

/// One draw submission unit.
#[derive(Clone)]
pub struct Batch {
    pub distance: f32,
    pub sort_key: u64,
    pub geometry: Option<Arc<Geometry>>,
    pub material: Option<Arc<Material>>,
    pub pass: Arc<Pass>,
    pub transforms: Arc<Vec<Mat4>>,
    pub transform_offset: usize,
    pub num_transforms: usize,
    pub geometry_type: GeometryType,
    pub zone: Option<Arc<Zone>>,
    pub light_queue: LightQueueRef,
    pub light_mask: u32,
    /// Produces the drawable's base (replace-blend) contribution.
    pub is_base: bool,
}

impl Batch {
    /// Combined state key: pass, light context, material, geometry. Equal
    /// keys mean state-compatible submissions that sort adjacently.
    pub fn calculate_sort_key(&mut self) {
        let pass_bits = self.pass.id() & 0xffff;
        let light_bits = self.light_queue.sort_bits() & 0xffff;
        let material_bits = self.material.as_ref().map_or(0, |m| m.id()) & 0xffff;
        let geometry_bits = self.geometry.as_ref().map_or(0, |g| g.id()) & 0xffff;
        self.sort_key =
            (pass_bits << 48) | (light_bits << 32) | (material_bits << 16) | geometry_bits;
    }

    fn world_transform(&self) -> Mat4 {
        self.transforms
            .get(self.transform_offset)
            .copied()
            .unwrap_or_else(Mat4::identity)
    }

    /// Bind per-batch state and shaders.
    fn prepare(&self, device: &mut dyn GraphicsDevice, instanced: bool) {
        device.set_blend_mode(self.pass.blend_mode);
        device.set_depth_test(self.pass.depth_test);
        device.set_depth_write(self.pass.depth_write);
        device.set_cull_mode(CullMode::Ccw);

        let mut vs_defines = self.pass.vertex_defines.clone();
        if instanced {
            if !vs_defines.is_empty() {
                vs_defines.push(' ');
            }
            vs_defines.push_str("INSTANCED");
        }
        let vs = device.get_shader(ShaderStage::Vertex, &self.pass.vertex_shader, &vs_defines);
        let ps = device.get_shader(
            ShaderStage::Pixel,
            &self.pass.pixel_shader,
            &self.pass.pixel_defines,
        );
        device.set_shaders(vs, ps);

        if let Some(zone) = &self.zone {
            device.set_shader_parameter("AmbientColor", &ShaderParam::Color(zone.ambient_color));
            device.set_shader_parameter("FogColor", &ShaderParam::Color(zone.fog_color));
            device.set_shader_parameter(
                "FogParams",
                &ShaderParam::Vec2([zone.fog_start, zone.fog_end]),
            );
        }
        if let Some(material) = &self.material {
            for (name, value) in material.shader_parameters() {
                device.set_shader_parameter(name, value);
            }
        }
    }

    fn draw_single(&self, device: &mut dyn GraphicsDevice, mark_to_stencil: bool) {
        let Some(geometry) = &self.geometry else {
            return;
        };
        self.prepare(device, false);
        if mark_to_stencil {
            device.set_stencil_test(Some(StencilTest::write_ref(self.light_mask & 0xff)));
        }
        device.set_shader_parameter("Model", &ShaderParam::Mat4(mat_to_array(self.world_transform())));
        device.draw(geometry);
    }
}

/// Structural identity of an instanceable batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    pub zone: u64,
    pub light_queue: LightQueueRef,
    pub pass: u64,
    pub material: u64,
    pub geometry: u64,
}

impl BatchGroupKey {
    fn new(batch: &Batch) -> Self {
        Self {
            zone: batch.zone.as_ref().map_or(0, |z| z.id()),
            light_queue: batch.light_queue,
            pass: batch.pass.id(),
            material: batch.material.as_ref().map_or(0, |m| m.id()),
            geometry: batch.geometry.as_ref().map_or(0, |g| g.id()),
        }
    }
}

/// Aggregated instances of one (geometry, material, pass, light context).
#[derive(Clone)]
pub struct BatchGroup {
    pub batch: Batch,
    pub instances: Vec<InstanceData>,
    /// First index in the frame's instancing buffer, set during buffer
    /// preparation.
    pub start_index: Option<u32>,
}

impl BatchGroup {
    fn new(batch: Batch) -> Self {
        Self {
            batch,
            instances: Vec::new(),
            start_index: None,
        }
    }

    fn add_transforms(&mut self, batch: &Batch) {
        for i in 0..batch.num_transforms {
            if let Some(m) = batch.transforms.get(batch.transform_offset + i) {
                self.instances.push(InstanceData {
                    world: [
                        [m[(0, 0)], m[(0, 1)], m[(0, 2)], m[(0, 3)]],
                        [m[(1, 0)], m[(1, 1)], m[(1, 2)], m[(1, 3)]],
                        [m[(2, 0)], m[(2, 1)], m[(2, 2)], m[(2, 3)]],
                    ],
                });
            }
        }
        // Group distance follows its nearest member.
        if batch.distance < self.batch.distance {
            self.batch.distance = batch.distance;
        }
    }

    fn draw(&self, device: &mut dyn GraphicsDevice, mark_to_stencil: bool) {
        let Some(geometry) = &self.batch.geometry else {
            return;
        };
        if self.batch.geometry_type == GeometryType::Instanced {
            self.batch.prepare(device, true);
            if mark_to_stencil {
                device.set_stencil_test(Some(StencilTest::write_ref(self.batch.light_mask & 0xff)));
            }
            if let Some(start) = self.start_index {
                device.set_shader_parameter("InstanceStart", &ShaderParam::Float(start as f32));
            }
            device.draw_instanced(geometry, self.instances.len() as u32);
        } else {
            // Below the instancing threshold: ordinary static draws.
            self.batch.prepare(device, false);
            if mark_to_stencil {
                device.set_stencil_test(Some(StencilTest::write_ref(self.batch.light_mask & 0xff)));
            }
            for instance in &self.instances {
                device.set_shader_parameter("Model", &ShaderParam::Mat4(rows_to_array(instance)));
                device.draw(geometry);
            }
        }
    }
}

/// An ordered, sortable collection of batches for one render pass.
#[derive(Default)]
pub struct BatchQueue {
    batches: Vec<Batch>,
    groups: HashMap<BatchGroupKey, BatchGroup>,
    sorted_groups: Vec<BatchGroup>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new frame, keeping allocations.
    pub fn clear(&mut self) {
        self.batches.clear();
        self.groups.clear();
        self.sorted_groups.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.groups.is_empty() && self.sorted_groups.is_empty()
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn groups(&self) -> impl Iterator<Item = &BatchGroup> {
        self.groups.values().chain(self.sorted_groups.iter())
    }

    /// Add a batch, resolving the default material, promoting to hardware
    /// instancing at the threshold, and expanding non-instanceable
    /// multi-transform batches into single-transform copies. Degenerate
    /// batches (no geometry, no transforms) are dropped.
    pub fn add_batch(
        &mut self,
        mut batch: Batch,
        default_material: &Arc<Material>,
        allow_instancing: bool,
        min_instances: usize,
    ) {
        if batch.geometry.is_none() || batch.num_transforms == 0 {
            return;
        }
        if batch.material.is_none() {
            batch.material = Some(default_material.clone());
        }

        // Promote to instanced when the geometry can support it.
        let can_instance = allow_instancing
            && batch.geometry_type == GeometryType::Static
            && batch
                .geometry
                .as_ref()
                .is_some_and(|g| g.has_index_buffer());
        if can_instance {
            batch.geometry_type = GeometryType::Instanced;
        }

        if batch.geometry_type == GeometryType::Instanced {
            let key = BatchGroupKey::new(&batch);
            let group = self.groups.entry(key).or_insert_with(|| {
                // Until the group reaches the instancing threshold it
                // renders with ordinary static shaders.
                let mut first = batch.clone();
                first.geometry_type = GeometryType::Static;
                first.calculate_sort_key();
                BatchGroup::new(first)
            });

            let old_size = group.instances.len();
            group.add_transforms(&batch);
            // Switch to instancing shaders at the threshold; never reverted
            // within the same frame.
            if old_size < min_instances && group.instances.len() >= min_instances {
                group.batch.geometry_type = GeometryType::Instanced;
                group.batch.calculate_sort_key();
            }
        } else {
            batch.calculate_sort_key();
            if batch.geometry_type == GeometryType::Static && batch.num_transforms > 1 {
                // Expand into single-transform copies.
                let num = batch.num_transforms;
                batch.num_transforms = 1;
                for i in 0..num {
                    let mut copy = batch.clone();
                    copy.transform_offset = batch.transform_offset + i;
                    self.batches.push(copy);
                }
            } else {
                self.batches.push(batch);
            }
        }
    }

    fn take_groups_for_sort(&mut self) {
        if !self.groups.is_empty() {
            self.sorted_groups.extend(self.groups.drain().map(|(_, g)| g));
        }
    }

    /// Opaque ordering: distance ascending, state key as tiebreak so equal
    /// state submits adjacently.
    pub fn sort_front_to_back(&mut self) {
        self.take_groups_for_sort();
        self.batches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.sort_key.cmp(&b.sort_key))
        });
        self.sorted_groups.sort_by(|a, b| {
            a.batch
                .distance
                .partial_cmp(&b.batch.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.batch.sort_key.cmp(&b.batch.sort_key))
        });
    }

    /// Blended ordering: distance descending for correct compositing.
    pub fn sort_back_to_front(&mut self) {
        self.take_groups_for_sort();
        self.batches.sort_by(|a, b| {
            b.distance
                .partial_cmp(&a.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.sort_key.cmp(&b.sort_key))
        });
        self.sorted_groups.sort_by(|a, b| {
            b.batch
                .distance
                .partial_cmp(&a.batch.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Instances needed in the frame instancing buffer.
    pub fn num_instances(&self) -> usize {
        self.groups
            .values()
            .chain(self.sorted_groups.iter())
            .filter(|g| g.batch.geometry_type == GeometryType::Instanced)
            .map(|g| g.instances.len())
            .sum()
    }

    /// Append instance transforms to the frame buffer and record each
    /// group's start index.
    pub fn fill_instance_data(&mut self, data: &mut Vec<InstanceData>, free_index: &mut u32) {
        for group in self
            .groups
            .values_mut()
            .chain(self.sorted_groups.iter_mut())
        {
            if group.batch.geometry_type != GeometryType::Instanced {
                continue;
            }
            group.start_index = Some(*free_index);
            data.extend_from_slice(&group.instances);
            *free_index += group.instances.len() as u32;
        }
    }

    /// Issue device calls for all groups and batches in sorted order.
    pub fn draw(&self, device: &mut dyn GraphicsDevice, camera: &Camera, mark_to_stencil: bool) {
        let view_proj = camera.projection() * camera.view_matrix();
        device.set_shader_parameter("ViewProj", &ShaderParam::Mat4(mat_to_array(view_proj)));

        for group in self.sorted_groups.iter().chain(self.groups.values()) {
            group.draw(device, mark_to_stencil);
        }
        for batch in &self.batches {
            batch.draw_single(device, mark_to_stencil);
        }
        if mark_to_stencil {
            device.set_stencil_test(None);
        }
    }
}

/// Shadow batches of one shadow-map split.
pub struct ShadowBatchQueue {
    pub shadow_camera: Camera,
    pub shadow_viewport: IntRect,
    pub near_split: f32,
    pub far_split: f32,
    pub shadow_batches: BatchQueue,
}

/// Per-light batch collection: shadows, lit-base, additive lit, volumes.
#[derive(Default)]
pub struct LightBatchQueue {
    pub light: Option<Arc<Light>>,
    pub vertex_lights: Vec<Arc<Light>>,
    pub shadow_map: Option<TextureHandle>,
    pub shadow_splits: Vec<ShadowBatchQueue>,
    pub lit_base_batches: BatchQueue,
    pub lit_batches: BatchQueue,
    pub volume_batches: Vec<Batch>,
}

pub(crate) fn mat_to_array(m: Mat4) -> [[f32; 4]; 4] {
    let mut out = [[0.0f32; 4]; 4];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = m[(r, c)];
        }
    }
    out
}

fn rows_to_array(instance: &InstanceData) -> [[f32; 4]; 4] {
    [
        instance.world[0],
        instance.world[1],
        instance.world[2],
        [0.0, 0.0, 0.0, 1.0],
    ]
}
