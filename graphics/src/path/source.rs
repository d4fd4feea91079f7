//! Declarative render path source.
//!
//! The on-disk representation of a render path, loaded from RON. The
//! source is tolerant: unknown command types and unnamed render targets
//! are discarded with a warning, unknown texture units are skipped, and
//! unknown formats fall back to RGBA8. `load → serialize → load` is
//! lossless for everything the model keeps.

use nightshade_core::math::Vec2;
use serde::{Deserialize, Serialize};

use crate::types::{ClearFlags, Color, ShaderParam, TextureFormat, TextureUnit};

use super::{
    RenderCommandType, RenderPath, RenderPathCommand, RenderTargetInfo, RenderTargetSizeMode,
    SortMode, VIEWPORT_NAME,
};

fn default_true() -> bool {
    true
}

/// Root of a declarative render path definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathSource {
    #[serde(default)]
    pub render_targets: Vec<RenderTargetSource>,
    #[serde(default)]
    pub commands: Vec<CommandSource>,
}

/// A render target declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderTargetSource {
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub filter: bool,
    #[serde(default)]
    pub srgb: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub size: Option<[f32; 2]>,
    #[serde(default)]
    pub size_divisor: Option<[f32; 2]>,
    #[serde(default)]
    pub size_multiplier: Option<[f32; 2]>,
    #[serde(default)]
    pub width: Option<f32>,
    #[serde(default)]
    pub height: Option<f32>,
}

impl RenderTargetSource {
    /// Convert to the runtime model; `None` when the trimmed name is empty.
    pub fn to_info(&self) -> Option<RenderTargetInfo> {
        if self.name.trim().is_empty() {
            return None;
        }
        let mut info = RenderTargetInfo {
            name: self.name.clone(),
            tag: self.tag.clone(),
            enabled: self.enabled,
            format: TextureFormat::from_name(&self.format),
            filtered: self.filter,
            srgb: self.srgb,
            persistent: self.persistent,
            ..Default::default()
        };
        if let Some(size) = self.size {
            info.size = Vec2::new(size[0], size[1]);
        }
        if let Some(divisor) = self.size_divisor {
            info.size = Vec2::new(divisor[0], divisor[1]);
            info.size_mode = RenderTargetSizeMode::ViewportDivisor;
        } else if let Some(multiplier) = self.size_multiplier {
            info.size = Vec2::new(multiplier[0], multiplier[1]);
            info.size_mode = RenderTargetSizeMode::ViewportMultiplier;
        }
        if let Some(width) = self.width {
            info.size.x = width;
        }
        if let Some(height) = self.height {
            info.size.y = height;
        }
        Some(info)
    }

    fn from_info(info: &RenderTargetInfo) -> Self {
        let size = [info.size.x, info.size.y];
        Self {
            name: info.name.clone(),
            tag: info.tag.clone(),
            enabled: info.enabled,
            format: info.format.name().to_string(),
            filter: info.filtered,
            srgb: info.srgb,
            persistent: info.persistent,
            size: (info.size_mode == RenderTargetSizeMode::Absolute).then_some(size),
            size_divisor: (info.size_mode == RenderTargetSizeMode::ViewportDivisor)
                .then_some(size),
            size_multiplier: (info.size_mode == RenderTargetSizeMode::ViewportMultiplier)
                .then_some(size),
            width: None,
            height: None,
        }
    }
}

/// Clear color: explicit value or fog-color substitution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClearColorSource {
    Fog,
    Color([f32; 4]),
}

/// A numbered output binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSource {
    pub index: u32,
    pub name: String,
}

/// A command declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSource {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: String,

    // Clear
    #[serde(default)]
    pub color: Option<ClearColorSource>,
    #[serde(default)]
    pub depth: Option<f32>,
    #[serde(default)]
    pub stencil: Option<u32>,

    // ScenePass / ForwardLights
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub sort: String,
    #[serde(default)]
    pub mark_to_stencil: bool,
    #[serde(default)]
    pub vertex_lights: bool,
    #[serde(default = "default_true")]
    pub use_lit_base: bool,

    // Quad / LightVolumes
    #[serde(default)]
    pub vs: String,
    #[serde(default)]
    pub ps: String,
    #[serde(default)]
    pub vs_defines: String,
    #[serde(default)]
    pub ps_defines: String,
    #[serde(default)]
    pub parameters: Vec<(String, ShaderParam)>,

    /// Shorthand for a single output at index 0.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub outputs: Vec<OutputSource>,
    /// Texture bindings as (unit name, texture name); last write per unit
    /// wins.
    #[serde(default)]
    pub textures: Vec<(String, String)>,
}

impl CommandSource {
    /// Convert to the runtime model; `None` when the type is unrecognized.
    pub fn to_command(&self) -> Option<RenderPathCommand> {
        let command_type = RenderCommandType::from_name(&self.command_type)?;

        let mut cmd = match command_type {
            RenderCommandType::Clear => {
                let mut flags = ClearFlags::empty();
                let mut clear_color = Color::TRANSPARENT;
                let mut use_fog_color = false;
                match &self.color {
                    Some(ClearColorSource::Fog) => {
                        flags |= ClearFlags::COLOR;
                        use_fog_color = true;
                    }
                    Some(ClearColorSource::Color(c)) => {
                        flags |= ClearFlags::COLOR;
                        clear_color = Color::new(c[0], c[1], c[2], c[3]);
                    }
                    None => {}
                }
                if self.depth.is_some() {
                    flags |= ClearFlags::DEPTH;
                }
                if self.stencil.is_some() {
                    flags |= ClearFlags::STENCIL;
                }
                let mut cmd = RenderPathCommand::clear(
                    flags,
                    clear_color,
                    self.depth.unwrap_or(1.0),
                    self.stencil.unwrap_or(0),
                );
                cmd.use_fog_color = use_fog_color;
                cmd
            }
            RenderCommandType::ScenePass => {
                let mut cmd =
                    RenderPathCommand::scene_pass(&self.pass, SortMode::from_name(&self.sort));
                cmd.mark_to_stencil = self.mark_to_stencil;
                cmd.vertex_lights = self.vertex_lights;
                cmd
            }
            RenderCommandType::ForwardLights => {
                let mut cmd = RenderPathCommand::forward_lights(&self.pass);
                cmd.use_lit_base = self.use_lit_base;
                cmd
            }
            RenderCommandType::Quad => RenderPathCommand::quad(&self.vs, &self.ps),
            RenderCommandType::LightVolumes => {
                RenderPathCommand::light_volumes(&self.vs, &self.ps)
            }
        };

        cmd.tag = self.tag.clone();
        cmd.enabled = self.enabled;
        cmd.metadata = self.metadata.clone();
        cmd.vertex_defines = self.vs_defines.clone();
        cmd.pixel_defines = self.ps_defines.clone();
        for (name, value) in &self.parameters {
            cmd.set_shader_parameter(name, value.clone());
        }

        if let Some(output) = &self.output {
            cmd.output_names[0] = output.clone();
        }
        for output in &self.outputs {
            cmd.set_output_name(output.index as usize, &output.name);
        }

        for (unit_name, texture_name) in &self.textures {
            match TextureUnit::from_name(unit_name) {
                Some(unit) => cmd.set_texture_name(unit, texture_name),
                None => log::warn!("Skipping texture binding for unknown unit '{unit_name}'"),
            }
        }

        Some(cmd)
    }

    fn from_command(cmd: &RenderPathCommand) -> Self {
        let mut source = Self {
            command_type: cmd.command_type.name().to_string(),
            tag: cmd.tag.clone(),
            enabled: cmd.enabled,
            metadata: cmd.metadata.clone(),
            use_lit_base: cmd.use_lit_base,
            ..Default::default()
        };

        match cmd.command_type {
            RenderCommandType::Clear => {
                if cmd.clear_flags.contains(ClearFlags::COLOR) {
                    source.color = Some(if cmd.use_fog_color {
                        ClearColorSource::Fog
                    } else {
                        ClearColorSource::Color([
                            cmd.clear_color.r,
                            cmd.clear_color.g,
                            cmd.clear_color.b,
                            cmd.clear_color.a,
                        ])
                    });
                }
                if cmd.clear_flags.contains(ClearFlags::DEPTH) {
                    source.depth = Some(cmd.clear_depth);
                }
                if cmd.clear_flags.contains(ClearFlags::STENCIL) {
                    source.stencil = Some(cmd.clear_stencil);
                }
            }
            RenderCommandType::ScenePass => {
                source.pass = cmd.pass.clone();
                source.sort = cmd.sort_mode.name().to_string();
                source.mark_to_stencil = cmd.mark_to_stencil;
                source.vertex_lights = cmd.vertex_lights;
            }
            RenderCommandType::ForwardLights => {
                source.pass = cmd.pass.clone();
            }
            RenderCommandType::Quad | RenderCommandType::LightVolumes => {
                source.vs = cmd.vertex_shader.clone();
                source.ps = cmd.pixel_shader.clone();
                source.vs_defines = cmd.vertex_defines.clone();
                source.ps_defines = cmd.pixel_defines.clone();
                source.parameters = cmd
                    .shader_parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
            }
        }

        source.outputs = cmd
            .output_names
            .iter()
            .enumerate()
            .filter(|(i, name)| !(*i == 0 && name.as_str() == VIEWPORT_NAME))
            .map(|(i, name)| OutputSource {
                index: i as u32,
                name: name.clone(),
            })
            .collect();

        source.textures = TextureUnit::ALL
            .iter()
            .filter(|unit| !cmd.texture_name(**unit).is_empty())
            .map(|unit| {
                (
                    unit.name().to_string(),
                    cmd.texture_name(*unit).to_string(),
                )
            })
            .collect();

        source
    }
}

impl PathSource {
    /// Rebuild a source from a runtime render path.
    pub fn from_path(path: &RenderPath) -> Self {
        Self {
            render_targets: path
                .render_targets()
                .iter()
                .map(RenderTargetSource::from_info)
                .collect(),
            commands: path
                .commands()
                .iter()
                .map(CommandSource::from_command)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORWARD_PATH: &str = r#"
(
    render_targets: [
        (name: "blur", tag: "postprocess", format: "rgba8", size_divisor: Some((2.0, 2.0)), filter: true),
        (name: "", format: "rgba8"),
    ],
    commands: [
        (type: "clear", color: Some(Color((0.1, 0.1, 0.1, 1.0))), depth: Some(1.0)),
        (type: "scenepass", pass: "base", metadata: "base", vertex_lights: true),
        (type: "forwardlights", pass: "light"),
        (type: "scenepass", pass: "alpha", sort: "backtofront", metadata: "alpha"),
        (type: "quad", tag: "postprocess", vs: "Blur", ps: "Blur",
         textures: [("diffuse", "viewport")],
         parameters: [("BlurSigma", Float(2.0))]),
        (type: "wiggle", pass: "nope"),
    ],
)
"#;

    #[test]
    fn load_discards_invalid_entries() {
        let mut path = RenderPath::new();
        path.load(FORWARD_PATH).unwrap();

        // The unnamed render target and the unknown command are gone.
        assert_eq!(path.render_targets().len(), 1);
        assert_eq!(path.commands().len(), 5);
    }

    #[test]
    fn load_parses_fields() {
        let mut path = RenderPath::new();
        path.load(FORWARD_PATH).unwrap();

        let blur_target = &path.render_targets()[0];
        assert_eq!(blur_target.size_mode, RenderTargetSizeMode::ViewportDivisor);
        assert!(blur_target.filtered);

        let clear = &path.commands()[0];
        assert_eq!(clear.command_type, RenderCommandType::Clear);
        assert!(clear.clear_flags.contains(ClearFlags::COLOR | ClearFlags::DEPTH));
        assert!(!clear.clear_flags.contains(ClearFlags::STENCIL));

        let alpha = &path.commands()[3];
        assert_eq!(alpha.sort_mode, SortMode::BackToFront);

        let quad = &path.commands()[4];
        assert_eq!(quad.texture_name(TextureUnit::Diffuse), "viewport");
        assert!(quad.reads_viewport());
        assert!(quad.writes_viewport());
        assert_eq!(
            quad.shader_parameter("BlurSigma"),
            Some(&ShaderParam::Float(2.0))
        );
    }

    #[test]
    fn fog_clear_color_round_trips() {
        let mut path = RenderPath::new();
        path.load(r#"(commands: [(type: "clear", color: Some(Fog))])"#)
            .unwrap();
        assert!(path.commands()[0].use_fog_color);

        let text = path.serialize();
        let mut reloaded = RenderPath::new();
        reloaded.load(&text).unwrap();
        assert!(reloaded.commands()[0].use_fog_color);
    }

    #[test]
    fn round_trip_reproduces_model() {
        let mut path = RenderPath::new();
        path.load(FORWARD_PATH).unwrap();

        let text = path.serialize();
        let mut reloaded = RenderPath::new();
        reloaded.load(&text).unwrap();

        assert_eq!(path.render_targets(), reloaded.render_targets());
        assert_eq!(path.commands(), reloaded.commands());
    }

    #[test]
    fn append_does_not_clear() {
        let mut path = RenderPath::new();
        path.load(FORWARD_PATH).unwrap();
        let count = path.commands().len();

        path.append(r#"(commands: [(type: "quad", vs: "FXAA", ps: "FXAA")])"#)
            .unwrap();
        assert_eq!(path.commands().len(), count + 1);
    }

    #[test]
    fn parse_error_is_reported() {
        let mut path = RenderPath::new();
        assert!(path.load("(((").is_err());
    }
}
