//! The render path: a declarative multi-pass pipeline description.
//!
//! A render path is an ordered list of [`RenderPathCommand`]s plus the
//! intermediate [`RenderTargetInfo`]s they write. It is loaded from a RON
//! source, cloneable (clones never alias the original's containers), and
//! mutable only through index-validated accessors. Every mutation bumps a
//! version counter so views can re-cache their working copy when the path
//! actually changed.

mod source;

pub use source::{ClearColorSource, CommandSource, OutputSource, PathSource, RenderTargetSource};

use std::collections::BTreeMap;

use nightshade_core::math::Vec2;

use crate::device::MAX_RENDERTARGETS;
use crate::error::RenderPathError;
use crate::types::{ClearFlags, Color, ShaderParam, TextureUnit, MAX_TEXTURE_UNITS};

/// Reserved output/texture name addressing the current render surface.
pub const VIEWPORT_NAME: &str = "viewport";

/// How a render target's size is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderTargetSizeMode {
    /// Fixed size in pixels.
    #[default]
    Absolute,
    /// Viewport size divided by the size value.
    ViewportDivisor,
    /// Viewport size multiplied by the size value.
    ViewportMultiplier,
}

/// A named intermediate render target declared by the path.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetInfo {
    pub name: String,
    pub tag: String,
    pub enabled: bool,
    pub format: crate::types::TextureFormat,
    pub filtered: bool,
    pub srgb: bool,
    /// Survives across frames, keyed by name + owning view.
    pub persistent: bool,
    pub size_mode: RenderTargetSizeMode,
    pub size: Vec2,
}

impl Default for RenderTargetInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            tag: String::new(),
            enabled: true,
            format: crate::types::TextureFormat::Rgba8,
            filtered: false,
            srgb: false,
            persistent: false,
            size_mode: RenderTargetSizeMode::Absolute,
            size: Vec2::zeros(),
        }
    }
}

/// Kind of render path command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderCommandType {
    Clear,
    ScenePass,
    Quad,
    ForwardLights,
    LightVolumes,
}

impl RenderCommandType {
    /// Resolve from the declarative type string; `None` discards the entry.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "clear" => Some(Self::Clear),
            "scenepass" => Some(Self::ScenePass),
            "quad" => Some(Self::Quad),
            "forwardlights" => Some(Self::ForwardLights),
            "lightvolumes" => Some(Self::LightVolumes),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::ScenePass => "scenepass",
            Self::Quad => "quad",
            Self::ForwardLights => "forwardlights",
            Self::LightVolumes => "lightvolumes",
        }
    }
}

/// Batch ordering for a scene pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    /// Opaque ordering: distance ascending, state-collapsing tiebreak.
    #[default]
    FrontToBack,
    /// Blended ordering: distance descending.
    BackToFront,
}

impl SortMode {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "backtofront" => Self::BackToFront,
            _ => Self::FrontToBack,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FrontToBack => "fronttoback",
            Self::BackToFront => "backtofront",
        }
    }
}

/// One step of the render path.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPathCommand {
    pub command_type: RenderCommandType,
    pub tag: String,
    pub enabled: bool,
    /// Semantic role ("gbuffer", "base", "alpha") interpreted by the view.
    pub metadata: String,

    // Clear
    pub clear_flags: ClearFlags,
    pub clear_color: Color,
    /// Substitute the far-clip zone's fog color for the clear color.
    pub use_fog_color: bool,
    pub clear_depth: f32,
    pub clear_stencil: u32,

    // ScenePass / ForwardLights
    pub pass: String,
    pub sort_mode: SortMode,
    pub mark_to_stencil: bool,
    pub vertex_lights: bool,
    pub use_lit_base: bool,

    // Quad / LightVolumes
    pub vertex_shader: String,
    pub pixel_shader: String,
    pub vertex_defines: String,
    pub pixel_defines: String,
    pub shader_parameters: BTreeMap<String, ShaderParam>,

    /// Texture bindings by unit; empty = unbound.
    pub texture_names: [String; MAX_TEXTURE_UNITS],
    /// Output target names by index; "viewport" is the render surface.
    pub output_names: Vec<String>,
}

impl RenderPathCommand {
    fn new(command_type: RenderCommandType) -> Self {
        Self {
            command_type,
            tag: String::new(),
            enabled: true,
            metadata: String::new(),
            clear_flags: ClearFlags::empty(),
            clear_color: Color::TRANSPARENT,
            use_fog_color: false,
            clear_depth: 1.0,
            clear_stencil: 0,
            pass: String::new(),
            sort_mode: SortMode::FrontToBack,
            mark_to_stencil: false,
            vertex_lights: false,
            use_lit_base: true,
            vertex_shader: String::new(),
            pixel_shader: String::new(),
            vertex_defines: String::new(),
            pixel_defines: String::new(),
            shader_parameters: BTreeMap::new(),
            texture_names: Default::default(),
            output_names: vec![VIEWPORT_NAME.to_string()],
        }
    }

    pub fn clear(flags: ClearFlags, color: Color, depth: f32, stencil: u32) -> Self {
        let mut cmd = Self::new(RenderCommandType::Clear);
        cmd.clear_flags = flags;
        cmd.clear_color = color;
        cmd.clear_depth = depth;
        cmd.clear_stencil = stencil;
        cmd
    }

    pub fn scene_pass(pass: &str, sort_mode: SortMode) -> Self {
        let mut cmd = Self::new(RenderCommandType::ScenePass);
        cmd.pass = pass.to_string();
        cmd.sort_mode = sort_mode;
        cmd
    }

    pub fn quad(vertex_shader: &str, pixel_shader: &str) -> Self {
        let mut cmd = Self::new(RenderCommandType::Quad);
        cmd.vertex_shader = vertex_shader.to_string();
        cmd.pixel_shader = pixel_shader.to_string();
        cmd
    }

    pub fn forward_lights(pass: &str) -> Self {
        let mut cmd = Self::new(RenderCommandType::ForwardLights);
        cmd.pass = pass.to_string();
        cmd
    }

    pub fn light_volumes(vertex_shader: &str, pixel_shader: &str) -> Self {
        let mut cmd = Self::new(RenderCommandType::LightVolumes);
        cmd.vertex_shader = vertex_shader.to_string();
        cmd.pixel_shader = pixel_shader.to_string();
        cmd
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn with_metadata(mut self, metadata: &str) -> Self {
        self.metadata = metadata.to_string();
        self
    }

    pub fn with_output(mut self, index: usize, name: &str) -> Self {
        self.set_output_name(index, name);
        self
    }

    pub fn with_texture(mut self, unit: TextureUnit, name: &str) -> Self {
        self.set_texture_name(unit, name);
        self
    }

    pub fn with_parameter(mut self, name: &str, value: ShaderParam) -> Self {
        self.shader_parameters.insert(name.to_string(), value);
        self
    }

    pub fn set_texture_name(&mut self, unit: TextureUnit, name: &str) {
        self.texture_names[unit.index()] = name.to_string();
    }

    pub fn texture_name(&self, unit: TextureUnit) -> &str {
        &self.texture_names[unit.index()]
    }

    pub fn set_shader_parameter(&mut self, name: &str, value: ShaderParam) {
        self.shader_parameters.insert(name.to_string(), value);
    }

    pub fn remove_shader_parameter(&mut self, name: &str) {
        self.shader_parameters.remove(name);
    }

    pub fn shader_parameter(&self, name: &str) -> Option<&ShaderParam> {
        self.shader_parameters.get(name)
    }

    /// Clamp the output list to 1..=MAX_RENDERTARGETS entries.
    pub fn set_num_outputs(&mut self, num: usize) {
        let num = num.clamp(1, MAX_RENDERTARGETS);
        self.output_names.resize(num, String::new());
    }

    /// Set an output by index; a sparse index pads intermediate entries.
    pub fn set_output_name(&mut self, index: usize, name: &str) {
        if index >= MAX_RENDERTARGETS {
            return;
        }
        if index >= self.output_names.len() {
            self.output_names.resize(index + 1, String::new());
        }
        self.output_names[index] = name.to_string();
    }

    pub fn output_name(&self, index: usize) -> &str {
        self.output_names.get(index).map_or("", |s| s.as_str())
    }

    /// Whether any output addresses the viewport surface.
    pub fn writes_viewport(&self) -> bool {
        self.output_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(VIEWPORT_NAME))
    }

    /// Whether any texture binding reads the viewport surface.
    pub fn reads_viewport(&self) -> bool {
        self.texture_names
            .iter()
            .any(|n| !n.is_empty() && n.eq_ignore_ascii_case(VIEWPORT_NAME))
    }
}

/// The render path: targets plus an ordered command list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderPath {
    render_targets: Vec<RenderTargetInfo>,
    commands: Vec<RenderPathCommand>,
    version: u64,
}

impl RenderPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a RON source, replacing current contents.
    pub fn load(&mut self, source_text: &str) -> Result<(), RenderPathError> {
        self.render_targets.clear();
        self.commands.clear();
        self.append(source_text)
    }

    /// Append targets and commands from a RON source without clearing.
    /// Entries with an empty target name or unknown command type are
    /// discarded, not errors.
    pub fn append(&mut self, source_text: &str) -> Result<(), RenderPathError> {
        let source: PathSource = ron::from_str(source_text)
            .map_err(|e| RenderPathError::ParseFailed(e.to_string()))?;
        self.append_source(&source);
        Ok(())
    }

    /// Append from an already-parsed source.
    pub fn append_source(&mut self, source: &PathSource) {
        for target in &source.render_targets {
            match target.to_info() {
                Some(info) => self.render_targets.push(info),
                None => log::warn!("Discarding render target with empty name"),
            }
        }
        for command in &source.commands {
            match command.to_command() {
                Some(cmd) => self.commands.push(cmd),
                None => log::warn!(
                    "Discarding render path command with unknown type '{}'",
                    command.command_type
                ),
            }
        }
        self.bump();
    }

    /// Rebuild the declarative source from the current state.
    pub fn to_source(&self) -> PathSource {
        PathSource::from_path(self)
    }

    /// Serialize to RON text.
    pub fn serialize(&self) -> String {
        ron::ser::to_string_pretty(&self.to_source(), ron::ser::PrettyConfig::default())
            .unwrap_or_default()
    }

    /// Version counter; bumped by every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub fn render_targets(&self) -> &[RenderTargetInfo] {
        &self.render_targets
    }

    pub fn commands(&self) -> &[RenderPathCommand] {
        &self.commands
    }

    /// Enable or disable all targets and commands sharing a tag
    /// (case-insensitive).
    pub fn set_enabled(&mut self, tag: &str, active: bool) {
        for target in &mut self.render_targets {
            if target.tag.eq_ignore_ascii_case(tag) {
                target.enabled = active;
            }
        }
        for command in &mut self.commands {
            if command.tag.eq_ignore_ascii_case(tag) {
                command.enabled = active;
            }
        }
        self.bump();
    }

    /// Flip the enabled state of all targets and commands sharing a tag.
    pub fn toggle_enabled(&mut self, tag: &str) {
        for target in &mut self.render_targets {
            if target.tag.eq_ignore_ascii_case(tag) {
                target.enabled = !target.enabled;
            }
        }
        for command in &mut self.commands {
            if command.tag.eq_ignore_ascii_case(tag) {
                command.enabled = !command.enabled;
            }
        }
        self.bump();
    }

    pub fn add_render_target(&mut self, info: RenderTargetInfo) {
        self.render_targets.push(info);
        self.bump();
    }

    /// Replace a target by index; index == len appends.
    pub fn set_render_target(&mut self, index: usize, info: RenderTargetInfo) {
        if index < self.render_targets.len() {
            self.render_targets[index] = info;
            self.bump();
        } else if index == self.render_targets.len() {
            self.add_render_target(info);
        }
    }

    pub fn remove_render_target(&mut self, name: &str) {
        if let Some(pos) = self
            .render_targets
            .iter()
            .position(|t| t.name.eq_ignore_ascii_case(name))
        {
            self.render_targets.remove(pos);
            self.bump();
        }
    }

    pub fn remove_render_targets_with_tag(&mut self, tag: &str) {
        self.render_targets
            .retain(|t| !t.tag.eq_ignore_ascii_case(tag));
        self.bump();
    }

    pub fn add_command(&mut self, command: RenderPathCommand) {
        self.commands.push(command);
        self.bump();
    }

    /// Replace a command by index; index == len appends.
    pub fn set_command(&mut self, index: usize, command: RenderPathCommand) {
        if index < self.commands.len() {
            self.commands[index] = command;
            self.bump();
        } else if index == self.commands.len() {
            self.add_command(command);
        }
    }

    pub fn insert_command(&mut self, index: usize, command: RenderPathCommand) {
        if index <= self.commands.len() {
            self.commands.insert(index, command);
            self.bump();
        }
    }

    pub fn remove_command(&mut self, index: usize) {
        if index < self.commands.len() {
            self.commands.remove(index);
            self.bump();
        }
    }

    pub fn remove_commands_with_tag(&mut self, tag: &str) {
        self.commands.retain(|c| !c.tag.eq_ignore_ascii_case(tag));
        self.bump();
    }

    pub fn command_mut(&mut self, index: usize) -> Option<&mut RenderPathCommand> {
        self.bump();
        self.commands.get_mut(index)
    }

    /// Update an existing shader parameter across all commands; does
    /// nothing when no command declares the name.
    pub fn set_shader_parameter(&mut self, name: &str, value: ShaderParam) {
        let mut changed = false;
        for command in &mut self.commands {
            if let Some(slot) = command.shader_parameters.get_mut(name) {
                *slot = value.clone();
                changed = true;
            }
        }
        if changed {
            self.bump();
        }
    }

    /// First matching shader parameter across all commands.
    pub fn shader_parameter(&self, name: &str) -> Option<&ShaderParam> {
        self.commands
            .iter()
            .find_map(|c| c.shader_parameters.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_path() -> RenderPath {
        let mut path = RenderPath::new();
        path.add_command(
            RenderPathCommand::clear(ClearFlags::COLOR | ClearFlags::DEPTH, Color::BLACK, 1.0, 0)
                .with_tag("setup"),
        );
        path.add_command(RenderPathCommand::scene_pass("base", SortMode::FrontToBack));
        path.add_command(
            RenderPathCommand::quad("Bloom", "Bloom")
                .with_tag("bloom")
                .with_parameter("BloomMix", ShaderParam::Vec2([0.9, 0.4])),
        );
        path
    }

    #[test]
    fn clone_does_not_alias() {
        let original = sample_path();
        let mut clone = original.clone();

        clone.set_enabled("bloom", false);

        assert!(original.commands()[2].enabled);
        assert!(!clone.commands()[2].enabled);
    }

    #[test]
    fn tag_enable_is_case_insensitive() {
        let mut path = sample_path();
        path.set_enabled("BLOOM", false);
        assert!(!path.commands()[2].enabled);
        path.toggle_enabled("Bloom");
        assert!(path.commands()[2].enabled);
    }

    #[test]
    fn shader_parameter_updates_existing_only() {
        let mut path = sample_path();

        path.set_shader_parameter("BloomMix", ShaderParam::Vec2([0.1, 0.1]));
        assert_eq!(
            path.shader_parameter("BloomMix"),
            Some(&ShaderParam::Vec2([0.1, 0.1]))
        );

        // No implicit creation.
        path.set_shader_parameter("DoesNotExist", ShaderParam::Float(1.0));
        assert_eq!(path.shader_parameter("DoesNotExist"), None);
    }

    #[test]
    fn sparse_output_index_pads() {
        let mut cmd = RenderPathCommand::scene_pass("deferred", SortMode::FrontToBack);
        cmd.set_output_name(2, "normals");
        assert_eq!(cmd.output_names.len(), 3);
        assert_eq!(cmd.output_name(0), VIEWPORT_NAME);
        assert_eq!(cmd.output_name(1), "");
        assert_eq!(cmd.output_name(2), "normals");

        // Beyond the render target budget the write is ignored.
        cmd.set_output_name(MAX_RENDERTARGETS, "extra");
        assert_eq!(cmd.output_names.len(), 3);
    }

    #[test]
    fn last_texture_write_per_unit_wins() {
        let mut cmd = RenderPathCommand::quad("Blit", "Blit");
        cmd.set_texture_name(TextureUnit::Diffuse, "first");
        cmd.set_texture_name(TextureUnit::Diffuse, "second");
        assert_eq!(cmd.texture_name(TextureUnit::Diffuse), "second");
    }

    #[test]
    fn mutation_bumps_version() {
        let mut path = sample_path();
        let v0 = path.version();
        path.remove_command(0);
        assert_ne!(path.version(), v0);

        let v1 = path.version();
        path.set_enabled("setup", false);
        assert_ne!(path.version(), v1);
    }

    #[test]
    fn out_of_range_mutations_are_ignored() {
        let mut path = sample_path();
        let count = path.commands().len();
        path.remove_command(99);
        path.insert_command(99, RenderPathCommand::scene_pass("x", SortMode::FrontToBack));
        assert_eq!(path.commands().len(), count);
    }
}
