//! Scene-side collaborator surfaces: cameras, drawables, lights, zones and
//! the octree spatial index.
//!
//! The renderer consumes these through narrow interfaces; the scene graph
//! that owns and updates them lives outside this crate.

pub mod camera;
pub mod drawable;
pub mod light;
pub mod octree;
pub mod zone;

pub use camera::{Camera, ViewOverrideFlags};
pub use drawable::{
    Drawable, DrawableCore, FrameInfo, SourceBatch, StaticMesh, UpdateGeometryType,
};
pub use light::{
    BiasParameters, CascadeParameters, FocusParameters, Light, LightType, MAX_CASCADE_SPLITS,
    MAX_LIGHT_SPLITS,
};
pub use octree::{FrustumQuery, OccludedFrustumQuery, Octree, OctreeQuery, SphereQuery};
pub use zone::Zone;

use std::sync::Arc;

use nightshade_core::bounds::BoundingBox;

use crate::types::DrawableFlags;

/// A scene object as stored in the octree: geometry, light or zone.
///
/// Tagged-union dispatch — queries filter on the variant's flags and the
/// consumers match on the kind they care about.
#[derive(Clone)]
pub enum SceneNode {
    Geometry(Arc<dyn Drawable>),
    Light(Arc<Light>),
    Zone(Arc<Zone>),
}

impl SceneNode {
    pub fn flags(&self) -> DrawableFlags {
        match self {
            Self::Geometry(_) => DrawableFlags::GEOMETRY,
            Self::Light(_) => DrawableFlags::LIGHT,
            Self::Zone(_) => DrawableFlags::ZONE,
        }
    }

    pub fn view_mask(&self) -> u32 {
        match self {
            Self::Geometry(d) => d.core().view_mask,
            Self::Light(l) => l.view_mask,
            Self::Zone(z) => z.view_mask,
        }
    }

    pub fn world_bounding_box(&self) -> BoundingBox {
        match self {
            Self::Geometry(d) => d.world_bounding_box(),
            Self::Light(l) => l.world_bounding_box(),
            Self::Zone(z) => z.bounding_box,
        }
    }

    pub fn as_geometry(&self) -> Option<&Arc<dyn Drawable>> {
        match self {
            Self::Geometry(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_light(&self) -> Option<&Arc<Light>> {
        match self {
            Self::Light(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_zone(&self) -> Option<&Arc<Zone>> {
        match self {
            Self::Zone(z) => Some(z),
            _ => None,
        }
    }
}

impl std::fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Geometry(_) => write!(f, "SceneNode::Geometry"),
            Self::Light(l) => write!(f, "SceneNode::Light({:?})", l.light_type),
            Self::Zone(z) => write!(f, "SceneNode::Zone(priority {})", z.priority),
        }
    }
}
