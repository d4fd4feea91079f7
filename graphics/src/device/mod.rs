//! Abstract graphics device interface.
//!
//! The renderer drives a [`GraphicsDevice`] purely through stateful setters
//! and draw primitives; it never sees a GPU API. Real backends live outside
//! this crate. [`NullDevice`] provides a recording implementation for tests
//! and headless runs.

mod null;

pub use null::{DeviceCommand, NullDevice};

use nightshade_core::math::{IntRect, IntVec2};

use crate::geometry::Geometry;
use crate::types::{
    BlendMode, ClearFlags, Color, CompareMode, CullMode, FillMode, ShaderParam, ShaderStage,
    StencilOp, TextureFormat, TextureUnit,
};

/// Maximum simultaneously bound color render targets.
pub const MAX_RENDERTARGETS: usize = 4;

/// Handle to a device-owned texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Handle to a resolved shader variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderHandle(pub u64);

/// Description of a texture to allocate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureDesc {
    pub width: i32,
    pub height: i32,
    pub format: TextureFormat,
    pub filtered: bool,
    pub srgb: bool,
}

impl TextureDesc {
    pub fn new(width: i32, height: i32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            filtered: false,
            srgb: false,
        }
    }

    pub fn size(&self) -> IntVec2 {
        IntVec2::new(self.width, self.height)
    }
}

/// Stencil test state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilTest {
    pub compare: CompareMode,
    pub pass_op: StencilOp,
    pub fail_op: StencilOp,
    pub z_fail_op: StencilOp,
    pub reference: u32,
    pub mask: u32,
}

impl StencilTest {
    /// Write `reference` wherever the test passes, keeping depth behavior.
    pub fn write_ref(reference: u32) -> Self {
        Self {
            compare: CompareMode::Always,
            pass_op: StencilOp::Ref,
            fail_op: StencilOp::Keep,
            z_fail_op: StencilOp::Keep,
            reference,
            mask: u32::MAX,
        }
    }

    /// Pass where the buffer differs from `reference` under `mask`.
    pub fn not_equal(reference: u32, mask: u32) -> Self {
        Self {
            compare: CompareMode::NotEqual,
            pass_op: StencilOp::Keep,
            fail_op: StencilOp::Keep,
            z_fail_op: StencilOp::Keep,
            reference,
            mask,
        }
    }
}

/// Per-instance transform data written to the instancing stream.
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct InstanceData {
    /// World transform, row-major 3x4 (rotation/scale rows + translation).
    pub world: [[f32; 4]; 3],
}

static_assertions::const_assert_eq!(std::mem::size_of::<InstanceData>(), 48);

/// Abstract, synchronous graphics device.
///
/// State set through this trait is sticky until overwritten; the renderer
/// re-establishes all state it depends on at the start of each command, so
/// implementations need no defaults beyond "something valid".
pub trait GraphicsDevice {
    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;

    // ----- Backbuffer properties -----

    /// Backbuffer size in pixels.
    fn backbuffer_size(&self) -> IntVec2;

    /// Backbuffer multisample count (1 = no MSAA).
    fn multisample(&self) -> u32;

    /// Whether the backbuffer is sRGB.
    fn srgb(&self) -> bool;

    // ----- Resources -----

    /// Allocate a texture; the device owns it until the handle is released.
    fn create_texture(&mut self, desc: &TextureDesc) -> TextureHandle;

    /// Release a texture handle.
    fn release_texture(&mut self, texture: TextureHandle);

    /// Dimensions of a previously created texture.
    fn texture_size(&self, texture: TextureHandle) -> Option<IntVec2>;

    /// Format of a previously created texture.
    fn texture_format(&self, texture: TextureHandle) -> Option<TextureFormat>;

    /// Resolve a shader variation by name and compile-time defines.
    /// Returns `None` when the shader does not exist or failed to build;
    /// callers are expected to stop re-requesting it.
    fn get_shader(&mut self, stage: ShaderStage, name: &str, defines: &str)
        -> Option<ShaderHandle>;

    /// Upload the per-frame instancing stream. Returns `false` when the
    /// buffer could not be mapped; previous contents remain valid.
    fn write_instance_buffer(&mut self, data: &[InstanceData]) -> bool;

    // ----- Output state -----

    /// Bind a color render target slot; `None` restores the backbuffer on
    /// slot 0 and unbinds other slots.
    fn set_render_target(&mut self, slot: usize, target: Option<TextureHandle>);

    /// Bind the depth-stencil surface; `None` uses the backbuffer's.
    fn set_depth_stencil(&mut self, target: Option<TextureHandle>);

    fn set_viewport(&mut self, rect: IntRect);

    /// Currently bound color target in a slot.
    fn render_target(&self, slot: usize) -> Option<TextureHandle>;

    /// Dimensions of the currently bound render target (backbuffer if none).
    fn render_target_dimensions(&self) -> IntVec2;

    // ----- Render state -----

    fn set_blend_mode(&mut self, mode: BlendMode);
    fn set_color_write(&mut self, enable: bool);
    fn set_cull_mode(&mut self, mode: CullMode);
    fn set_fill_mode(&mut self, mode: FillMode);
    fn set_depth_test(&mut self, compare: CompareMode);
    fn set_depth_write(&mut self, enable: bool);
    fn set_depth_bias(&mut self, constant: f32, slope_scaled: f32);
    fn set_scissor_test(&mut self, enable: bool, rect: IntRect);
    fn set_stencil_test(&mut self, test: Option<StencilTest>);
    fn set_clip_plane(&mut self, enable: bool, plane: [f32; 4]);

    // ----- Shaders & bindings -----

    fn set_shaders(&mut self, vs: Option<ShaderHandle>, ps: Option<ShaderHandle>);
    fn set_shader_parameter(&mut self, name: &str, value: &ShaderParam);

    /// Forget which parameter sources are bound, forcing re-binding.
    fn clear_parameter_sources(&mut self);

    fn set_texture(&mut self, unit: TextureUnit, texture: Option<TextureHandle>);

    // ----- Draw primitives -----

    fn clear(&mut self, flags: ClearFlags, color: Color, depth: f32, stencil: u32);

    fn draw(&mut self, geometry: &Geometry);

    fn draw_instanced(&mut self, geometry: &Geometry, instance_count: u32);

    /// Copy the current backbuffer/viewport contents into a texture.
    fn resolve_to_texture(&mut self, dest: TextureHandle, viewport: IntRect);
}
