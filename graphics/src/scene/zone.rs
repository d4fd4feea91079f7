//! Zones: volumes carrying ambient and fog parameters.
//!
//! Overlapping zones resolve by priority; the highest-priority zone
//! containing a point wins. The renderer owns a default zone used whenever
//! no authored zone applies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nightshade_core::bounds::BoundingBox;
use nightshade_core::math::Vec3;

use crate::types::{Color, DEFAULT_MASK};

static NEXT_ZONE_ID: AtomicU64 = AtomicU64::new(1);

/// An ambient/fog volume.
#[derive(Debug)]
pub struct Zone {
    id: u64,
    pub bounding_box: BoundingBox,
    pub priority: i32,
    pub ambient_color: Color,
    pub fog_color: Color,
    pub fog_start: f32,
    pub fog_end: f32,
    /// Gradient between this zone's ambient color and the neighbor's.
    pub ambient_gradient: bool,
    pub ambient_start_color: Color,
    pub ambient_end_color: Color,
    /// When set, the camera's zone overrides all per-drawable zones.
    pub override_mode: bool,
    pub view_mask: u32,
    pub light_mask: u32,
    pub shadow_mask: u32,
    pub zone_mask: u32,
}

impl Default for Zone {
    fn default() -> Self {
        Self {
            id: NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed),
            bounding_box: BoundingBox::new(
                Vec3::new(-10.0, -10.0, -10.0),
                Vec3::new(10.0, 10.0, 10.0),
            ),
            priority: 0,
            ambient_color: Color::new(0.1, 0.1, 0.1, 1.0),
            fog_color: Color::new(0.0, 0.0, 0.0, 1.0),
            fog_start: 250.0,
            fog_end: 1000.0,
            ambient_gradient: false,
            ambient_start_color: Color::BLACK,
            ambient_end_color: Color::BLACK,
            override_mode: false,
            view_mask: DEFAULT_MASK,
            light_mask: DEFAULT_MASK,
            shadow_mask: DEFAULT_MASK,
            zone_mask: DEFAULT_MASK,
        }
    }
}

impl Zone {
    pub fn new(bounding_box: BoundingBox, priority: i32) -> Arc<Self> {
        Arc::new(Self {
            bounding_box,
            priority,
            ..Self::default()
        })
    }

    /// The renderer's fallback zone: lowest priority, unbounded volume.
    pub fn default_zone() -> Arc<Self> {
        Arc::new(Self {
            priority: i32::MIN,
            bounding_box: BoundingBox::new(
                Vec3::new(f32::MIN, f32::MIN, f32::MIN),
                Vec3::new(f32::MAX, f32::MAX, f32::MAX),
            ),
            ..Self::default()
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_inside(&self, point: Vec3) -> bool {
        self.bounding_box.contains_point(point)
    }

    /// Whether the ambient gradient is actually in effect.
    pub fn has_ambient_gradient(&self) -> bool {
        self.ambient_gradient && self.ambient_start_color != self.ambient_end_color
    }
}
