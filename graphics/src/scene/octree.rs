//! Octree spatial index over scene nodes.
//!
//! The octree subdivides world space hierarchically; a node lives in the
//! deepest octant that fully contains its bounds. Queries walk the tree
//! with a volume test per octant and a filter per candidate. The tree is
//! strictly read-only during a frame's parallel phases.

use std::sync::Arc;

use nightshade_core::bounds::{BoundingBox, Intersection, Sphere};
use nightshade_core::frustum::Frustum;
use nightshade_core::math::Vec3;

use crate::occlusion::OcclusionBuffer;
use crate::types::DrawableFlags;

use super::SceneNode;

/// Configuration for octree behavior.
#[derive(Debug, Clone)]
pub struct OctreeConfig {
    /// Maximum nodes per octant before subdivision.
    pub max_nodes_per_octant: usize,
    /// Maximum subdivision depth.
    pub max_depth: u32,
}

impl Default for OctreeConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_octant: 8,
            max_depth: 8,
        }
    }
}

/// A query that walks the octree: one volume test per octant, one filter
/// pass per candidate list.
pub trait OctreeQuery {
    /// Intersection of an octant's bounds with the query volume. `inside`
    /// means an enclosing octant already tested fully inside.
    fn test_octant(&self, bounds: &BoundingBox, inside: bool) -> Intersection;

    /// Filter candidate nodes of an accepted octant and collect matches.
    fn test_nodes(&mut self, nodes: &[SceneNode], inside: bool);
}

struct Octant {
    bounds: BoundingBox,
    nodes: Vec<SceneNode>,
    children: Option<Box<[Octant; 8]>>,
    depth: u32,
}

impl Octant {
    fn new(bounds: BoundingBox, depth: u32) -> Self {
        Self {
            bounds,
            nodes: Vec::new(),
            children: None,
            depth,
        }
    }

    fn child_bounds(&self, octant: usize) -> BoundingBox {
        let center = self.bounds.center();
        let quarter = self.bounds.half_size() * 0.5;
        let sign = |bit: bool| if bit { 1.0 } else { -1.0 };
        let child_center = Vec3::new(
            center.x + quarter.x * sign(octant & 1 != 0),
            center.y + quarter.y * sign(octant & 2 != 0),
            center.z + quarter.z * sign(octant & 4 != 0),
        );
        BoundingBox::from_center_half_size(child_center, quarter)
    }

    fn subdivide(&mut self) {
        if self.children.is_some() {
            return;
        }
        let depth = self.depth + 1;
        let make = |i: usize| Octant::new(self.child_bounds(i), depth);
        self.children = Some(Box::new([
            make(0),
            make(1),
            make(2),
            make(3),
            make(4),
            make(5),
            make(6),
            make(7),
        ]));

        // Push existing nodes down into any child that fully contains them.
        let nodes = std::mem::take(&mut self.nodes);
        for node in nodes {
            self.place(node);
        }
    }

    fn place(&mut self, node: SceneNode) {
        if let Some(children) = &mut self.children {
            let bounds = node.world_bounding_box();
            for child in children.iter_mut() {
                if child.bounds.is_inside(&bounds) == Intersection::Inside {
                    child.place(node);
                    return;
                }
            }
        }
        self.nodes.push(node);
    }

    fn query(&self, query: &mut dyn OctreeQuery, parent_inside: bool) {
        let result = if parent_inside {
            Intersection::Inside
        } else {
            query.test_octant(&self.bounds, false)
        };
        if result == Intersection::Outside {
            return;
        }
        let inside = result == Intersection::Inside;

        if !self.nodes.is_empty() {
            query.test_nodes(&self.nodes, inside);
        }
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query(query, inside);
            }
        }
    }

    fn count(&self) -> usize {
        let mut total = self.nodes.len();
        if let Some(children) = &self.children {
            for child in children.iter() {
                total += child.count();
            }
        }
        total
    }
}

/// Octree spatial index.
pub struct Octree {
    root: Octant,
    config: OctreeConfig,
}

impl Octree {
    pub fn new(world_bounds: BoundingBox, config: OctreeConfig) -> Self {
        Self {
            root: Octant::new(world_bounds, 0),
            config,
        }
    }

    /// Octree spanning a cube of the given half-extent around the origin.
    pub fn with_size(half_extent: f32) -> Self {
        Self::new(
            BoundingBox::from_center_half_size(
                Vec3::zeros(),
                Vec3::new(half_extent, half_extent, half_extent),
            ),
            OctreeConfig::default(),
        )
    }

    /// Insert a scene node. The tree must not be mutated while a frame is
    /// in flight.
    pub fn insert(&mut self, node: SceneNode) {
        Self::insert_into(&mut self.root, node, &self.config);
    }

    fn insert_into(octant: &mut Octant, node: SceneNode, config: &OctreeConfig) {
        if octant.children.is_none()
            && octant.nodes.len() >= config.max_nodes_per_octant
            && octant.depth < config.max_depth
        {
            octant.subdivide();
        }
        if let Some(children) = &mut octant.children {
            let bounds = node.world_bounding_box();
            for child in children.iter_mut() {
                if child.bounds.is_inside(&bounds) == Intersection::Inside {
                    Self::insert_into(child, node, config);
                    return;
                }
            }
        }
        octant.nodes.push(node);
    }

    pub fn node_count(&self) -> usize {
        self.root.count()
    }

    /// Run a query over the tree.
    pub fn execute_query(&self, query: &mut dyn OctreeQuery) {
        self.root.query(query, false);
    }
}

/// Shared flag + mask + volume filtering for the standard queries.
fn accept_node(
    node: &SceneNode,
    flags: DrawableFlags,
    view_mask: u32,
    inside: bool,
    volume_test: impl Fn(&BoundingBox) -> bool,
) -> bool {
    if !node.flags().intersects(flags) || node.view_mask() & view_mask == 0 {
        return false;
    }
    inside || volume_test(&node.world_bounding_box())
}

/// Frustum query with flag/mask filtering and an optional extra accept test.
pub struct FrustumQuery {
    pub results: Vec<SceneNode>,
    frustum: Frustum,
    flags: DrawableFlags,
    view_mask: u32,
    accept: Option<fn(&SceneNode) -> bool>,
}

impl FrustumQuery {
    pub fn new(frustum: Frustum, flags: DrawableFlags, view_mask: u32) -> Self {
        Self {
            results: Vec::new(),
            frustum,
            flags,
            view_mask,
            accept: None,
        }
    }

    /// Attach a per-candidate accept test (e.g. shadow casters only).
    pub fn with_accept(mut self, accept: fn(&SceneNode) -> bool) -> Self {
        self.accept = Some(accept);
        self
    }
}

impl OctreeQuery for FrustumQuery {
    fn test_octant(&self, bounds: &BoundingBox, inside: bool) -> Intersection {
        if inside {
            Intersection::Inside
        } else {
            self.frustum.is_inside(bounds)
        }
    }

    fn test_nodes(&mut self, nodes: &[SceneNode], inside: bool) {
        for node in nodes {
            if let Some(accept) = self.accept {
                if !accept(node) {
                    continue;
                }
            }
            if accept_node(node, self.flags, self.view_mask, inside, |b| {
                self.frustum.is_inside_fast(b) != Intersection::Outside
            }) {
                self.results.push(node.clone());
            }
        }
    }
}

/// Frustum query that additionally rejects occluded octants and nodes
/// against a software occlusion buffer.
pub struct OccludedFrustumQuery<'a> {
    pub results: Vec<SceneNode>,
    frustum: Frustum,
    buffer: &'a OcclusionBuffer,
    flags: DrawableFlags,
    view_mask: u32,
}

impl<'a> OccludedFrustumQuery<'a> {
    pub fn new(
        frustum: Frustum,
        buffer: &'a OcclusionBuffer,
        flags: DrawableFlags,
        view_mask: u32,
    ) -> Self {
        Self {
            results: Vec::new(),
            frustum,
            buffer,
            flags,
            view_mask,
        }
    }
}

impl OctreeQuery for OccludedFrustumQuery<'_> {
    fn test_octant(&self, bounds: &BoundingBox, inside: bool) -> Intersection {
        if inside {
            if self.buffer.is_visible(bounds) {
                Intersection::Inside
            } else {
                Intersection::Outside
            }
        } else {
            let mut result = self.frustum.is_inside(bounds);
            if result != Intersection::Outside && !self.buffer.is_visible(bounds) {
                result = Intersection::Outside;
            }
            result
        }
    }

    /// Per-node occlusion runs later in the worker threads; here only
    /// frustum and mask filtering apply.
    fn test_nodes(&mut self, nodes: &[SceneNode], inside: bool) {
        for node in nodes {
            if accept_node(node, self.flags, self.view_mask, inside, |b| {
                self.frustum.is_inside_fast(b) != Intersection::Outside
            }) {
                self.results.push(node.clone());
            }
        }
    }
}

/// Sphere query, used for point light influence gathering.
pub struct SphereQuery {
    pub results: Vec<SceneNode>,
    sphere: Sphere,
    flags: DrawableFlags,
    view_mask: u32,
}

impl SphereQuery {
    pub fn new(sphere: Sphere, flags: DrawableFlags, view_mask: u32) -> Self {
        Self {
            results: Vec::new(),
            sphere,
            flags,
            view_mask,
        }
    }
}

impl OctreeQuery for SphereQuery {
    fn test_octant(&self, bounds: &BoundingBox, inside: bool) -> Intersection {
        if inside {
            return Intersection::Inside;
        }
        if !self.sphere.intersects_box(bounds) {
            return Intersection::Outside;
        }
        // Fully inside when every corner is within the sphere.
        let all_inside = [
            bounds.min,
            bounds.max,
            Vec3::new(bounds.min.x, bounds.min.y, bounds.max.z),
            Vec3::new(bounds.min.x, bounds.max.y, bounds.min.z),
            Vec3::new(bounds.max.x, bounds.min.y, bounds.min.z),
            Vec3::new(bounds.min.x, bounds.max.y, bounds.max.z),
            Vec3::new(bounds.max.x, bounds.min.y, bounds.max.z),
            Vec3::new(bounds.max.x, bounds.max.y, bounds.min.z),
        ]
        .iter()
        .all(|c| self.sphere.contains_point(*c));
        if all_inside {
            Intersection::Inside
        } else {
            Intersection::Intersects
        }
    }

    fn test_nodes(&mut self, nodes: &[SceneNode], inside: bool) {
        for node in nodes {
            if accept_node(node, self.flags, self.view_mask, inside, |b| {
                self.sphere.intersects_box(b)
            }) {
                self.results.push(node.clone());
            }
        }
    }
}
