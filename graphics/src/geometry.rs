//! Geometry resource descriptions.
//!
//! The renderer treats geometry as opaque: it needs identity (for batch
//! grouping), draw ranges, and whether an index buffer exists (instancing
//! requires one). Vertex data itself lives behind the graphics device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);

/// How a batch's geometry is transformed and submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GeometryType {
    /// Static geometry with a single world transform per instance.
    #[default]
    Static,
    /// Static geometry promoted to hardware instancing.
    Instanced,
    /// Skinned geometry; transforms are bone matrices, never instanced.
    Skinned,
    /// Geometry whose view matrix is overridden (e.g. directional light
    /// volumes); never instanced.
    ViewOverride,
}

/// A drawable range of GPU geometry.
#[derive(Debug)]
pub struct Geometry {
    id: u64,
    vertex_count: u32,
    index_count: u32,
    indexed: bool,
}

impl Geometry {
    /// Indexed geometry.
    pub fn indexed(vertex_count: u32, index_count: u32) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed),
            vertex_count,
            index_count,
            indexed: true,
        })
    }

    /// Non-indexed geometry (draw by vertex range only).
    pub fn non_indexed(vertex_count: u32) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_GEOMETRY_ID.fetch_add(1, Ordering::Relaxed),
            vertex_count,
            index_count: 0,
            indexed: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Whether an index buffer backs this geometry. Instancing requires one.
    pub fn has_index_buffer(&self) -> bool {
        self.indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Geometry::indexed(4, 6);
        let b = Geometry::indexed(4, 6);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn index_buffer_presence() {
        assert!(Geometry::indexed(4, 6).has_index_buffer());
        assert!(!Geometry::non_indexed(3).has_index_buffer());
    }
}
