//! # Nightshade Graphics
//!
//! The Nightshade engine frame renderer. Once per camera per frame, a
//! [`View`] converts a scene octree into a sequence of graphics device
//! calls: visibility culling, per-light shadow/lighting decomposition,
//! batch sorting and instancing, and execution of a configurable
//! multi-pass [`RenderPath`] with intermediate render-target ping-ponging.
//!
//! ## Overview
//!
//! - [`RenderPath`] — declarative multi-pass pipeline description (RON)
//! - [`View`] — per-viewport frame pipeline: define → update → render
//! - [`Renderer`] — long-lived resources: pools, defaults, configuration
//! - [`GraphicsDevice`] — abstract device; [`NullDevice`] records calls
//!   for tests and headless runs
//! - [`scene`] — collaborator surfaces: octree, camera, drawables, lights,
//!   zones
//!
//! ## Example
//!
//! ```ignore
//! use nightshade_graphics::{NullDevice, Renderer, RendererConfig, View, Viewport};
//!
//! let mut device = NullDevice::new(1280, 720);
//! let mut renderer = Renderer::new(RendererConfig::default());
//! let mut view = View::new(work_queue);
//!
//! // Each frame:
//! if view.define(None, &viewport, &renderer, &device) {
//!     view.update(frame_number, time_step, &mut renderer, &mut device);
//!     view.render(&mut renderer, &mut device);
//! }
//! ```

pub mod device;
pub mod error;
pub mod geometry;
pub mod material;
pub mod occlusion;
pub mod path;
pub mod renderer;
pub mod scene;
pub mod types;
pub mod view;

// Re-export main types for convenience
pub use device::{DeviceCommand, GraphicsDevice, NullDevice, TextureDesc, TextureHandle};
pub use error::RenderPathError;
pub use geometry::{Geometry, GeometryType};
pub use material::{Material, MaterialQuality, Pass, Technique};
pub use occlusion::OcclusionBuffer;
pub use path::{
    RenderCommandType, RenderPath, RenderPathCommand, RenderTargetInfo, SortMode,
};
pub use renderer::{Renderer, RendererConfig};
pub use scene::{Camera, Drawable, FrameInfo, Light, Octree, SceneNode, StaticMesh, Zone};
pub use types::{ClearFlags, Color, ShaderParam, TextureFormat, TextureUnit};
pub use view::{BatchQueue, LightBatchQueue, View, Viewport};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_null_device() {
        let device = NullDevice::new(640, 480);
        assert_eq!(device.name(), "Null");
    }
}
