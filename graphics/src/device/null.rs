//! Null graphics device for testing and headless runs.
//!
//! This device doesn't perform actual GPU operations but provides a valid
//! implementation for exercising the renderer without hardware. Every call
//! is trace-logged and the interesting ones are recorded into an
//! inspectable command log.

use std::collections::{HashMap, HashSet};

use nightshade_core::math::{IntRect, IntVec2};

use crate::geometry::Geometry;
use crate::types::{
    BlendMode, ClearFlags, Color, CompareMode, CullMode, FillMode, ShaderParam, ShaderStage,
    TextureFormat, TextureUnit,
};

use super::{
    GraphicsDevice, InstanceData, ShaderHandle, StencilTest, TextureDesc, TextureHandle,
    MAX_RENDERTARGETS,
};

/// A recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    SetRenderTarget {
        slot: usize,
        target: Option<TextureHandle>,
    },
    SetDepthStencil {
        target: Option<TextureHandle>,
    },
    SetViewport {
        rect: IntRect,
    },
    Clear {
        flags: ClearFlags,
        color: Color,
        depth: f32,
        stencil: u32,
    },
    Draw {
        geometry: u64,
    },
    DrawInstanced {
        geometry: u64,
        instances: u32,
    },
    SetShaders {
        vs: Option<ShaderHandle>,
        ps: Option<ShaderHandle>,
    },
    SetTexture {
        unit: TextureUnit,
        texture: Option<TextureHandle>,
    },
    SetScissorTest {
        enable: bool,
    },
    SetStencilTest {
        enable: bool,
    },
    ResolveToTexture {
        dest: TextureHandle,
    },
    WriteInstanceBuffer {
        instances: usize,
    },
}

/// Null device: records calls, owns no GPU resources.
pub struct NullDevice {
    size: IntVec2,
    multisample: u32,
    srgb: bool,
    next_texture_id: u64,
    textures: HashMap<TextureHandle, TextureDesc>,
    render_targets: [Option<TextureHandle>; MAX_RENDERTARGETS],
    /// Shader names that should fail resolution, for degradation tests.
    missing_shaders: HashSet<String>,
    /// When set, instance buffer writes report a failed map.
    fail_instance_writes: bool,
    commands: Vec<DeviceCommand>,
}

impl NullDevice {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            size: IntVec2::new(width, height),
            multisample: 1,
            srgb: false,
            next_texture_id: 1,
            textures: HashMap::new(),
            render_targets: [None; MAX_RENDERTARGETS],
            missing_shaders: HashSet::new(),
            fail_instance_writes: false,
            commands: Vec::new(),
        }
    }

    /// Mark a shader name as unresolvable.
    pub fn set_shader_missing(&mut self, name: &str) {
        self.missing_shaders.insert(name.to_string());
    }

    /// Make instance buffer maps fail.
    pub fn set_fail_instance_writes(&mut self, fail: bool) {
        self.fail_instance_writes = fail;
    }

    pub fn set_multisample(&mut self, samples: u32) {
        self.multisample = samples.max(1);
    }

    /// Recorded command log.
    pub fn commands(&self) -> &[DeviceCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Count of recorded commands matching a predicate.
    pub fn count_commands(&self, mut pred: impl FnMut(&DeviceCommand) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(c)).count()
    }

    /// Number of clear calls issued.
    pub fn clear_count(&self) -> usize {
        self.count_commands(|c| matches!(c, DeviceCommand::Clear { .. }))
    }

    /// Number of draw calls (plain + instanced).
    pub fn draw_count(&self) -> usize {
        self.count_commands(|c| {
            matches!(
                c,
                DeviceCommand::Draw { .. } | DeviceCommand::DrawInstanced { .. }
            )
        })
    }

    /// Textures still alive on the device.
    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }
}

impl GraphicsDevice for NullDevice {
    fn name(&self) -> &'static str {
        "Null"
    }

    fn backbuffer_size(&self) -> IntVec2 {
        self.size
    }

    fn multisample(&self) -> u32 {
        self.multisample
    }

    fn srgb(&self) -> bool {
        self.srgb
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> TextureHandle {
        let handle = TextureHandle(self.next_texture_id);
        self.next_texture_id += 1;
        self.textures.insert(handle, *desc);
        log::trace!(
            "NullDevice: creating texture {:?} ({}x{} {:?})",
            handle,
            desc.width,
            desc.height,
            desc.format
        );
        handle
    }

    fn release_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture);
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<IntVec2> {
        self.textures.get(&texture).map(|d| d.size())
    }

    fn texture_format(&self, texture: TextureHandle) -> Option<TextureFormat> {
        self.textures.get(&texture).map(|d| d.format)
    }

    fn get_shader(
        &mut self,
        stage: ShaderStage,
        name: &str,
        defines: &str,
    ) -> Option<ShaderHandle> {
        if name.is_empty() || self.missing_shaders.contains(name) {
            return None;
        }
        // Stable hash of (stage, name, defines) stands in for compilation.
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        stage.hash(&mut hasher);
        name.hash(&mut hasher);
        defines.hash(&mut hasher);
        Some(ShaderHandle(hasher.finish()))
    }

    fn write_instance_buffer(&mut self, data: &[InstanceData]) -> bool {
        if self.fail_instance_writes {
            log::trace!("NullDevice: instance buffer map failed (simulated)");
            return false;
        }
        self.commands.push(DeviceCommand::WriteInstanceBuffer {
            instances: data.len(),
        });
        true
    }

    fn set_render_target(&mut self, slot: usize, target: Option<TextureHandle>) {
        if slot < MAX_RENDERTARGETS {
            self.render_targets[slot] = target;
        }
        self.commands
            .push(DeviceCommand::SetRenderTarget { slot, target });
    }

    fn set_depth_stencil(&mut self, target: Option<TextureHandle>) {
        self.commands.push(DeviceCommand::SetDepthStencil { target });
    }

    fn set_viewport(&mut self, rect: IntRect) {
        self.commands.push(DeviceCommand::SetViewport { rect });
    }

    fn render_target(&self, slot: usize) -> Option<TextureHandle> {
        self.render_targets.get(slot).copied().flatten()
    }

    fn render_target_dimensions(&self) -> IntVec2 {
        match self.render_targets[0] {
            Some(handle) => self.texture_size(handle).unwrap_or(self.size),
            None => self.size,
        }
    }

    fn set_blend_mode(&mut self, mode: BlendMode) {
        log::trace!("NullDevice: blend mode {:?}", mode);
    }

    fn set_color_write(&mut self, enable: bool) {
        log::trace!("NullDevice: color write {}", enable);
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        log::trace!("NullDevice: cull mode {:?}", mode);
    }

    fn set_fill_mode(&mut self, mode: FillMode) {
        log::trace!("NullDevice: fill mode {:?}", mode);
    }

    fn set_depth_test(&mut self, compare: CompareMode) {
        log::trace!("NullDevice: depth test {:?}", compare);
    }

    fn set_depth_write(&mut self, enable: bool) {
        log::trace!("NullDevice: depth write {}", enable);
    }

    fn set_depth_bias(&mut self, constant: f32, slope_scaled: f32) {
        log::trace!("NullDevice: depth bias {} {}", constant, slope_scaled);
    }

    fn set_scissor_test(&mut self, enable: bool, rect: IntRect) {
        log::trace!("NullDevice: scissor {} {:?}", enable, rect);
        self.commands.push(DeviceCommand::SetScissorTest { enable });
    }

    fn set_stencil_test(&mut self, test: Option<StencilTest>) {
        log::trace!("NullDevice: stencil {:?}", test);
        self.commands.push(DeviceCommand::SetStencilTest {
            enable: test.is_some(),
        });
    }

    fn set_clip_plane(&mut self, enable: bool, _plane: [f32; 4]) {
        log::trace!("NullDevice: clip plane {}", enable);
    }

    fn set_shaders(&mut self, vs: Option<ShaderHandle>, ps: Option<ShaderHandle>) {
        self.commands.push(DeviceCommand::SetShaders { vs, ps });
    }

    fn set_shader_parameter(&mut self, name: &str, _value: &ShaderParam) {
        log::trace!("NullDevice: shader parameter {}", name);
    }

    fn clear_parameter_sources(&mut self) {
        log::trace!("NullDevice: clear parameter sources");
    }

    fn set_texture(&mut self, unit: TextureUnit, texture: Option<TextureHandle>) {
        self.commands.push(DeviceCommand::SetTexture { unit, texture });
    }

    fn clear(&mut self, flags: ClearFlags, color: Color, depth: f32, stencil: u32) {
        self.commands.push(DeviceCommand::Clear {
            flags,
            color,
            depth,
            stencil,
        });
    }

    fn draw(&mut self, geometry: &Geometry) {
        self.commands.push(DeviceCommand::Draw {
            geometry: geometry.id(),
        });
    }

    fn draw_instanced(&mut self, geometry: &Geometry, instance_count: u32) {
        self.commands.push(DeviceCommand::DrawInstanced {
            geometry: geometry.id(),
            instances: instance_count,
        });
    }

    fn resolve_to_texture(&mut self, dest: TextureHandle, _viewport: IntRect) {
        self.commands.push(DeviceCommand::ResolveToTexture { dest });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_draws_and_clears() {
        let mut device = NullDevice::new(640, 480);
        let geometry = Geometry::indexed(4, 6);

        device.clear(ClearFlags::COLOR, Color::BLACK, 1.0, 0);
        device.draw(&geometry);
        device.draw_instanced(&geometry, 8);

        assert_eq!(device.clear_count(), 1);
        assert_eq!(device.draw_count(), 2);
    }

    #[test]
    fn texture_lifecycle() {
        let mut device = NullDevice::new(640, 480);
        let desc = TextureDesc::new(128, 128, TextureFormat::Rgba8);
        let handle = device.create_texture(&desc);

        assert_eq!(device.texture_size(handle), Some(IntVec2::new(128, 128)));
        assert_eq!(device.texture_format(handle), Some(TextureFormat::Rgba8));

        device.release_texture(handle);
        assert_eq!(device.texture_size(handle), None);
    }

    #[test]
    fn missing_shader_resolution() {
        let mut device = NullDevice::new(640, 480);
        assert!(device
            .get_shader(ShaderStage::Vertex, "Bloom", "HIGHQUALITY")
            .is_some());

        device.set_shader_missing("Bloom");
        assert!(device
            .get_shader(ShaderStage::Vertex, "Bloom", "HIGHQUALITY")
            .is_none());
        assert!(device.get_shader(ShaderStage::Pixel, "", "").is_none());
    }

    #[test]
    fn render_target_dimensions_follow_binding() {
        let mut device = NullDevice::new(640, 480);
        let tex = device.create_texture(&TextureDesc::new(256, 256, TextureFormat::Rgba8));

        assert_eq!(device.render_target_dimensions(), IntVec2::new(640, 480));
        device.set_render_target(0, Some(tex));
        assert_eq!(device.render_target_dimensions(), IntVec2::new(256, 256));
    }

    #[test]
    fn failed_instance_write_reports_false() {
        let mut device = NullDevice::new(640, 480);
        assert!(device.write_instance_buffer(&[]));
        device.set_fail_instance_writes(true);
        assert!(!device.write_instance_buffer(&[]));
    }
}
