//! Materials, techniques and passes.
//!
//! A [`Material`] orders [`Technique`]s by distance and quality; a
//! [`Technique`] owns named [`Pass`]es. Pass resolution by name is the
//! contract the batch builder relies on: a technique with no pass for a
//! scene pass simply renders nothing there, which is not an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{BlendMode, CompareMode, ShaderParam};

static NEXT_MATERIAL_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_PASS_ID: AtomicU64 = AtomicU64::new(1);

// Well-known pass names. Scene passes are free-form; these are the ones the
// forward lighting pipeline resolves itself.
pub const PASS_BASE: &str = "base";
pub const PASS_LITBASE: &str = "litbase";
pub const PASS_LIGHT: &str = "light";
pub const PASS_ALPHA: &str = "alpha";
pub const PASS_LITALPHA: &str = "litalpha";
pub const PASS_SHADOW: &str = "shadow";

/// Material quality levels, ordered low to high.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum MaterialQuality {
    Low,
    Medium,
    #[default]
    High,
}

/// One render pass of a technique: render state plus shader names.
#[derive(Debug)]
pub struct Pass {
    id: u64,
    name: String,
    pub blend_mode: BlendMode,
    pub depth_test: CompareMode,
    pub depth_write: bool,
    pub vertex_shader: String,
    pub pixel_shader: String,
    pub vertex_defines: String,
    pub pixel_defines: String,
}

impl Pass {
    pub fn new(name: &str, blend_mode: BlendMode) -> Self {
        Self {
            id: NEXT_PASS_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            blend_mode,
            depth_test: CompareMode::LessEqual,
            depth_write: blend_mode == BlendMode::Replace,
            vertex_shader: String::new(),
            pixel_shader: String::new(),
            vertex_defines: String::new(),
            pixel_defines: String::new(),
        }
    }

    pub fn with_shaders(mut self, vs: &str, ps: &str) -> Self {
        self.vertex_shader = vs.to_string();
        self.pixel_shader = ps.to_string();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An ordered collection of passes forming one way to render a material.
#[derive(Debug, Default)]
pub struct Technique {
    passes: Vec<Arc<Pass>>,
}

impl Technique {
    pub fn new(passes: Vec<Pass>) -> Arc<Self> {
        Arc::new(Self {
            passes: passes.into_iter().map(Arc::new).collect(),
        })
    }

    /// Resolve a pass by name, `None` when the technique does not define it.
    pub fn supported_pass(&self, name: &str) -> Option<Arc<Pass>> {
        self.passes
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn has_pass(&self, name: &str) -> bool {
        self.passes.iter().any(|p| p.name().eq_ignore_ascii_case(name))
    }
}

/// A technique with the conditions under which it applies.
///
/// Entries are ordered most-distant & highest-quality first, so the first
/// entry whose requirements are met is the best choice.
#[derive(Debug, Clone)]
pub struct TechniqueEntry {
    pub technique: Arc<Technique>,
    pub quality_level: MaterialQuality,
    pub lod_distance: f32,
}

/// A material: ordered techniques plus shader parameters.
#[derive(Debug, Default)]
pub struct Material {
    id: u64,
    name: String,
    techniques: Vec<TechniqueEntry>,
    shader_parameters: HashMap<String, ShaderParam>,
}

impl Material {
    pub fn new(name: &str, techniques: Vec<TechniqueEntry>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MATERIAL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            techniques,
            shader_parameters: HashMap::new(),
        })
    }

    /// Material with a single unconditional technique.
    pub fn with_technique(name: &str, technique: Arc<Technique>) -> Arc<Self> {
        Self::new(
            name,
            vec![TechniqueEntry {
                technique,
                quality_level: MaterialQuality::Low,
                lod_distance: 0.0,
            }],
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn techniques(&self) -> &[TechniqueEntry] {
        &self.techniques
    }

    pub fn shader_parameters(&self) -> &HashMap<String, ShaderParam> {
        &self.shader_parameters
    }

    /// Choose a technique by LOD distance and quality level.
    ///
    /// Entries whose quality requirement exceeds the current level are
    /// skipped; the first remaining entry whose LOD threshold the distance
    /// satisfies wins. With no suitable entry, the last (lowest-detail)
    /// technique is the fallback.
    pub fn technique_for(
        &self,
        lod_distance: f32,
        quality: MaterialQuality,
    ) -> Option<Arc<Technique>> {
        if self.techniques.len() == 1 {
            return Some(self.techniques[0].technique.clone());
        }
        for entry in &self.techniques {
            if quality < entry.quality_level {
                continue;
            }
            if lod_distance >= entry.lod_distance {
                return Some(entry.technique.clone());
            }
        }
        self.techniques.last().map(|e| e.technique.clone())
    }
}

/// Build the engine default material used when a drawable specifies none:
/// an unconditional technique with the standard forward passes.
pub fn default_material() -> Arc<Material> {
    let technique = Technique::new(vec![
        Pass::new(PASS_BASE, BlendMode::Replace).with_shaders("Basic", "Basic"),
        Pass::new(PASS_LITBASE, BlendMode::Replace).with_shaders("LitBasic", "LitBasic"),
        Pass::new(PASS_LIGHT, BlendMode::Add).with_shaders("LitBasic", "LitBasic"),
        Pass::new(PASS_SHADOW, BlendMode::Replace).with_shaders("Shadow", "Shadow"),
    ]);
    Material::with_technique("DefaultMaterial", technique)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_lod_material() -> Arc<Material> {
        let near = Technique::new(vec![Pass::new(PASS_BASE, BlendMode::Replace)]);
        let far = Technique::new(vec![Pass::new(PASS_BASE, BlendMode::Replace)]);
        Material::new(
            "lod",
            vec![
                TechniqueEntry {
                    technique: far.clone(),
                    quality_level: MaterialQuality::Low,
                    lod_distance: 50.0,
                },
                TechniqueEntry {
                    technique: near.clone(),
                    quality_level: MaterialQuality::Low,
                    lod_distance: 0.0,
                },
            ],
        )
    }

    #[test]
    fn pass_resolution_is_case_insensitive() {
        let technique = Technique::new(vec![Pass::new(PASS_BASE, BlendMode::Replace)]);
        assert!(technique.supported_pass("Base").is_some());
        assert!(technique.supported_pass("light").is_none());
    }

    #[test]
    fn lod_selection_prefers_distant_entry() {
        let material = two_lod_material();
        let far = material.technique_for(100.0, MaterialQuality::High).unwrap();
        let near = material.technique_for(10.0, MaterialQuality::High).unwrap();
        assert!(Arc::ptr_eq(&far, &material.techniques()[0].technique));
        assert!(Arc::ptr_eq(&near, &material.techniques()[1].technique));
    }

    #[test]
    fn quality_gate_skips_entries() {
        let high = Technique::new(vec![Pass::new(PASS_BASE, BlendMode::Replace)]);
        let low = Technique::new(vec![Pass::new(PASS_BASE, BlendMode::Replace)]);
        let material = Material::new(
            "quality",
            vec![
                TechniqueEntry {
                    technique: high.clone(),
                    quality_level: MaterialQuality::High,
                    lod_distance: 0.0,
                },
                TechniqueEntry {
                    technique: low.clone(),
                    quality_level: MaterialQuality::Low,
                    lod_distance: 0.0,
                },
            ],
        );

        let chosen = material.technique_for(0.0, MaterialQuality::Low).unwrap();
        assert!(Arc::ptr_eq(&chosen, &low));

        let chosen = material.technique_for(0.0, MaterialQuality::High).unwrap();
        assert!(Arc::ptr_eq(&chosen, &high));
    }

    #[test]
    fn default_material_supports_forward_passes() {
        let material = default_material();
        let technique = material
            .technique_for(0.0, MaterialQuality::Low)
            .expect("default technique");
        assert!(technique.supported_pass(PASS_BASE).is_some());
        assert!(technique.supported_pass(PASS_LIGHT).is_some());
        assert!(technique.supported_pass(PASS_SHADOW).is_some());
        assert!(!technique.has_pass("deferred"));
    }
}
