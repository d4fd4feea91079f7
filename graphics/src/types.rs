//! Common graphics types shared between the render path model, the view,
//! and the device interface.

use serde::{Deserialize, Serialize};

/// RGBA color in linear space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// True when all color channels are zero (brightness-scaled black).
    pub fn is_black(&self) -> bool {
        self.r == 0.0 && self.g == 0.0 && self.b == 0.0
    }

    pub fn scaled(&self, factor: f32) -> Color {
        Color::new(self.r * factor, self.g * factor, self.b * factor, self.a)
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

/// Texture formats the renderer allocates intermediate targets in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureFormat {
    /// 8-bit RGBA, the backbuffer-compatible default.
    #[default]
    Rgba8,
    /// 8-bit RGB without alpha.
    Rgb8,
    /// 16-bit float RGBA for HDR rendering.
    Rgba16F,
    /// 32-bit float RGBA.
    Rgba32F,
    /// Single-channel 32-bit float.
    R32F,
    /// 24-bit depth with 8-bit stencil.
    Depth24Stencil8,
    /// Depth-only format used by shadow maps.
    Depth16,
}

impl TextureFormat {
    /// Resolve a format from its declarative name. Unrecognized names fall
    /// back to [`TextureFormat::Rgba8`], matching the tolerant loader.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "rgba8" | "rgba" => Self::Rgba8,
            "rgb8" | "rgb" => Self::Rgb8,
            "rgba16f" => Self::Rgba16F,
            "rgba32f" => Self::Rgba32F,
            "r32f" => Self::R32F,
            "d24s8" | "depth24stencil8" => Self::Depth24Stencil8,
            "d16" | "depth16" => Self::Depth16,
            _ => Self::Rgba8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Rgba8 => "rgba8",
            Self::Rgb8 => "rgb8",
            Self::Rgba16F => "rgba16f",
            Self::Rgba32F => "rgba32f",
            Self::R32F => "r32f",
            Self::Depth24Stencil8 => "d24s8",
            Self::Depth16 => "d16",
        }
    }

    pub fn is_depth(&self) -> bool {
        matches!(self, Self::Depth24Stencil8 | Self::Depth16)
    }
}

bitflags::bitflags! {
    /// Which channels a clear command touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClearFlags: u8 {
        const COLOR = 0x1;
        const DEPTH = 0x2;
        const STENCIL = 0x4;
    }
}

bitflags::bitflags! {
    /// What a drawable contributes to a frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawableFlags: u8 {
        const GEOMETRY = 0x1;
        const LIGHT = 0x2;
        const ZONE = 0x4;
    }
}

/// Mask accepting every view/light/shadow/zone.
pub const DEFAULT_MASK: u32 = u32::MAX;

/// Fixed set of texture units a command may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureUnit {
    Diffuse,
    Normal,
    Specular,
    Emissive,
    Environment,
    Volume,
    Custom1,
    Custom2,
    LightRamp,
    LightShape,
    ShadowMap,
    DepthBuffer,
    LightBuffer,
    ZoneTexture,
}

/// Number of texture units addressable by render path commands.
pub const MAX_TEXTURE_UNITS: usize = 14;

impl TextureUnit {
    pub const ALL: [TextureUnit; MAX_TEXTURE_UNITS] = [
        TextureUnit::Diffuse,
        TextureUnit::Normal,
        TextureUnit::Specular,
        TextureUnit::Emissive,
        TextureUnit::Environment,
        TextureUnit::Volume,
        TextureUnit::Custom1,
        TextureUnit::Custom2,
        TextureUnit::LightRamp,
        TextureUnit::LightShape,
        TextureUnit::ShadowMap,
        TextureUnit::DepthBuffer,
        TextureUnit::LightBuffer,
        TextureUnit::ZoneTexture,
    ];

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|u| u == self).unwrap_or(0)
    }

    /// Resolve a unit from its declarative name, `None` if unrecognized.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "diffuse" | "diff" | "albedo" => Some(Self::Diffuse),
            "normal" | "norm" => Some(Self::Normal),
            "specular" | "spec" => Some(Self::Specular),
            "emissive" => Some(Self::Emissive),
            "environment" | "env" => Some(Self::Environment),
            "volume" => Some(Self::Volume),
            "custom1" => Some(Self::Custom1),
            "custom2" => Some(Self::Custom2),
            "lightramp" => Some(Self::LightRamp),
            "lightshape" => Some(Self::LightShape),
            "shadowmap" => Some(Self::ShadowMap),
            "depth" | "depthbuffer" => Some(Self::DepthBuffer),
            "lightbuffer" => Some(Self::LightBuffer),
            "zone" => Some(Self::ZoneTexture),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Diffuse => "diffuse",
            Self::Normal => "normal",
            Self::Specular => "specular",
            Self::Emissive => "emissive",
            Self::Environment => "environment",
            Self::Volume => "volume",
            Self::Custom1 => "custom1",
            Self::Custom2 => "custom2",
            Self::LightRamp => "lightramp",
            Self::LightShape => "lightshape",
            Self::ShadowMap => "shadowmap",
            Self::DepthBuffer => "depthbuffer",
            Self::LightBuffer => "lightbuffer",
            Self::ZoneTexture => "zone",
        }
    }
}

/// Blend state for a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Replace,
    Add,
    Multiply,
    Alpha,
    AddAlpha,
    Subtract,
}

/// Depth / stencil comparison function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompareMode {
    Always,
    Equal,
    NotEqual,
    Less,
    #[default]
    LessEqual,
    Greater,
    GreaterEqual,
}

/// Triangle culling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CullMode {
    None,
    #[default]
    Ccw,
    Cw,
}

/// Polygon fill mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
    Point,
}

/// Stencil buffer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Ref,
    Incr,
    Decr,
}

/// A shader parameter value bound by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShaderParam {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Color(Color),
    Mat4([[f32; 4]; 4]),
}

/// Kind of shader stage, for resolution requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_name_round_trip() {
        for format in [
            TextureFormat::Rgba8,
            TextureFormat::Rgba16F,
            TextureFormat::R32F,
            TextureFormat::Depth24Stencil8,
        ] {
            assert_eq!(TextureFormat::from_name(format.name()), format);
        }
    }

    #[test]
    fn unknown_format_falls_back() {
        assert_eq!(TextureFormat::from_name("bc7"), TextureFormat::Rgba8);
    }

    #[test]
    fn texture_unit_names_resolve() {
        for unit in TextureUnit::ALL {
            assert_eq!(TextureUnit::from_name(unit.name()), Some(unit));
        }
        assert_eq!(TextureUnit::from_name("bogus"), None);
    }

    #[test]
    fn unit_indices_are_dense() {
        for (i, unit) in TextureUnit::ALL.iter().enumerate() {
            assert_eq!(unit.index(), i);
        }
    }

    #[test]
    fn black_color_detection() {
        assert!(Color::BLACK.is_black());
        assert!(Color::new(0.0, 0.0, 0.0, 0.5).is_black());
        assert!(!Color::new(0.1, 0.0, 0.0, 1.0).is_black());
    }
}
