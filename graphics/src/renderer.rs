//! Renderer resource hub.
//!
//! [`Renderer`] owns everything that outlives a single view-frame:
//! configuration, the default material and zone, shared quad/light-volume
//! geometry, the screen-buffer pool and the shadow-map pool. Views receive
//! a reference at construction; nothing here is looked up through globals.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{GraphicsDevice, TextureDesc, TextureHandle};
use crate::geometry::Geometry;
use crate::material::{default_material, Material, MaterialQuality};
use crate::scene::light::LightType;
use crate::scene::Zone;
use crate::types::TextureFormat;

/// Renderer tunables, loadable from RON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Global shadow switch.
    pub draw_shadows: bool,
    pub material_quality: MaterialQuality,
    /// Occluder triangle budget; zero disables software occlusion.
    pub max_occluder_triangles: u32,
    /// Minimum on-screen size for a drawable to act as occluder.
    pub occluder_size_threshold: f32,
    /// Group size at which static batches switch to hardware instancing.
    pub min_instances: usize,
    /// Vertex lights a single drawable may accumulate.
    pub max_vertex_lights: usize,
    pub shadow_map_size: i32,
    /// Shadow maps available per frame; exhaustion demotes lights to
    /// unshadowed.
    pub max_shadow_maps: usize,
    /// Render shadow maps just-in-time inside light commands instead of
    /// all up front.
    pub reuse_shadow_maps: bool,
    pub hdr_rendering: bool,
    pub dynamic_instancing: bool,
    /// Whether the backend supports cube shadow maps (point light shadows).
    pub cube_shadow_support: bool,
    /// Enable the single-pass lit-base optimization.
    pub use_lit_base: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            draw_shadows: true,
            material_quality: MaterialQuality::High,
            max_occluder_triangles: 5000,
            occluder_size_threshold: 0.025,
            min_instances: 2,
            max_vertex_lights: 4,
            shadow_map_size: 1024,
            max_shadow_maps: 8,
            reuse_shadow_maps: true,
            hdr_rendering: false,
            dynamic_instancing: true,
            cube_shadow_support: true,
            use_lit_base: true,
        }
    }
}

impl RendererConfig {
    /// Parse from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ScreenBufferKey {
    width: i32,
    height: i32,
    format: TextureFormat,
    filtered: bool,
    srgb: bool,
    /// Non-zero for persistent targets (name hash + view identity).
    persist_key: u64,
}

#[derive(Default)]
struct ScreenBufferSlot {
    textures: Vec<TextureHandle>,
    used_this_frame: usize,
}

/// Long-lived renderer resources and pools.
pub struct Renderer {
    config: RendererConfig,
    default_material: Arc<Material>,
    default_zone: Arc<Zone>,
    quad_geometry: Arc<Geometry>,
    point_volume_geometry: Arc<Geometry>,
    spot_volume_geometry: Arc<Geometry>,
    screen_buffers: HashMap<ScreenBufferKey, ScreenBufferSlot>,
    shadow_maps: Vec<TextureHandle>,
    shadow_maps_used: usize,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        Self {
            config,
            default_material: default_material(),
            default_zone: Zone::default_zone(),
            // Fullscreen triangle.
            quad_geometry: Geometry::non_indexed(3),
            // Low-poly sphere and cone hulls for deferred light volumes.
            point_volume_geometry: Geometry::indexed(42, 240),
            spot_volume_geometry: Geometry::indexed(18, 96),
            screen_buffers: HashMap::new(),
            shadow_maps: Vec::new(),
            shadow_maps_used: 0,
        }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RendererConfig {
        &mut self.config
    }

    pub fn default_material(&self) -> &Arc<Material> {
        &self.default_material
    }

    pub fn default_zone(&self) -> &Arc<Zone> {
        &self.default_zone
    }

    pub fn quad_geometry(&self) -> &Arc<Geometry> {
        &self.quad_geometry
    }

    /// Pre-built volume geometry for deferred light rendering.
    pub fn light_geometry(&self, light_type: LightType) -> &Arc<Geometry> {
        match light_type {
            LightType::Directional => &self.quad_geometry,
            LightType::Point => &self.point_volume_geometry,
            LightType::Spot => &self.spot_volume_geometry,
        }
    }

    /// Reset per-frame pool usage. Allocations survive for reuse.
    pub fn begin_frame(&mut self) {
        for slot in self.screen_buffers.values_mut() {
            slot.used_this_frame = 0;
        }
        self.shadow_maps_used = 0;
    }

    /// Request a scratch or persistent render texture.
    ///
    /// Non-persistent requests (`persist_key == 0`) rotate through the
    /// allocations of matching dimensions made this frame; persistent
    /// requests always map to the same texture for the same key.
    pub fn get_screen_buffer(
        &mut self,
        device: &mut dyn GraphicsDevice,
        width: i32,
        height: i32,
        format: TextureFormat,
        filtered: bool,
        srgb: bool,
        persist_key: u64,
    ) -> TextureHandle {
        let key = ScreenBufferKey {
            width,
            height,
            format,
            filtered,
            srgb,
            persist_key,
        };
        let slot = self.screen_buffers.entry(key).or_default();

        if persist_key != 0 {
            if let Some(&texture) = slot.textures.first() {
                return texture;
            }
        } else if slot.used_this_frame < slot.textures.len() {
            let texture = slot.textures[slot.used_this_frame];
            slot.used_this_frame += 1;
            return texture;
        }

        let texture = device.create_texture(&TextureDesc {
            width,
            height,
            format,
            filtered,
            srgb,
        });
        slot.textures.push(texture);
        slot.used_this_frame = slot.textures.len();
        log::trace!(
            "Allocated screen buffer {}x{} {:?} (persist {:x})",
            width,
            height,
            format,
            persist_key
        );
        texture
    }

    /// Request a shadow map for a light. Returns `None` when the per-frame
    /// budget is exhausted; the caller demotes the light to unshadowed.
    pub fn get_shadow_map(&mut self, device: &mut dyn GraphicsDevice) -> Option<TextureHandle> {
        if self.shadow_maps_used >= self.config.max_shadow_maps {
            log::trace!("Shadow map budget exhausted");
            return None;
        }
        let index = self.shadow_maps_used;
        self.shadow_maps_used += 1;

        if let Some(&existing) = self.shadow_maps.get(index) {
            return Some(existing);
        }
        let size = self.config.shadow_map_size;
        let texture = device.create_texture(&TextureDesc {
            width: size,
            height: size,
            format: TextureFormat::Depth16,
            filtered: true,
            srgb: false,
        });
        self.shadow_maps.push(texture);
        Some(texture)
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(RendererConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;

    #[test]
    fn config_loads_from_ron() {
        let config = RendererConfig::from_ron(
            "(draw_shadows: false, min_instances: 16, material_quality: Low)",
        )
        .unwrap();
        assert!(!config.draw_shadows);
        assert_eq!(config.min_instances, 16);
        assert_eq!(config.material_quality, MaterialQuality::Low);
        // Unspecified fields keep defaults.
        assert!(config.reuse_shadow_maps);
    }

    #[test]
    fn transient_screen_buffers_rotate_within_frame() {
        let mut renderer = Renderer::default();
        let mut device = NullDevice::new(640, 480);

        let a = renderer.get_screen_buffer(
            &mut device,
            128,
            128,
            TextureFormat::Rgba8,
            true,
            false,
            0,
        );
        let b = renderer.get_screen_buffer(
            &mut device,
            128,
            128,
            TextureFormat::Rgba8,
            true,
            false,
            0,
        );
        assert_ne!(a, b);

        // Next frame both allocations are reusable in request order.
        renderer.begin_frame();
        let a2 = renderer.get_screen_buffer(
            &mut device,
            128,
            128,
            TextureFormat::Rgba8,
            true,
            false,
            0,
        );
        assert_eq!(a, a2);
        assert_eq!(device.live_texture_count(), 2);
    }

    #[test]
    fn persistent_buffers_are_stable_across_frames() {
        let mut renderer = Renderer::default();
        let mut device = NullDevice::new(640, 480);

        let first = renderer.get_screen_buffer(
            &mut device,
            256,
            256,
            TextureFormat::Rgba8,
            false,
            false,
            0xfeed,
        );
        renderer.begin_frame();
        let second = renderer.get_screen_buffer(
            &mut device,
            256,
            256,
            TextureFormat::Rgba8,
            false,
            false,
            0xfeed,
        );
        assert_eq!(first, second);

        // A different key maps to a different texture.
        let other = renderer.get_screen_buffer(
            &mut device,
            256,
            256,
            TextureFormat::Rgba8,
            false,
            false,
            0xbeef,
        );
        assert_ne!(first, other);
    }

    #[test]
    fn shadow_map_budget_exhaustion() {
        let mut renderer = Renderer::new(RendererConfig {
            max_shadow_maps: 2,
            ..Default::default()
        });
        let mut device = NullDevice::new(640, 480);

        assert!(renderer.get_shadow_map(&mut device).is_some());
        assert!(renderer.get_shadow_map(&mut device).is_some());
        assert!(renderer.get_shadow_map(&mut device).is_none());

        // Budget resets with the frame, reusing prior allocations.
        renderer.begin_frame();
        assert!(renderer.get_shadow_map(&mut device).is_some());
        assert_eq!(device.live_texture_count(), 2);
    }
}
