//! Visibility and culling: zone/occluder collection, software occlusion,
//! frustum queries and the parallel per-drawable visibility finalization.

use std::sync::Arc;

use nightshade_core::frustum::Frustum;
use nightshade_core::math::{Mat4, Vec3};

use crate::occlusion::OcclusionBuffer;
use crate::renderer::Renderer;
use crate::scene::light::compare_lights;
use crate::scene::{
    Camera, Drawable, FrameInfo, FrustumQuery, Light, OccludedFrustumQuery, SceneNode, Zone,
};
use crate::types::DrawableFlags;

use super::{PerThreadSceneResult, View};

/// Read-only inputs of the parallel visibility pass.
struct VisibilityContext<'a> {
    frame: FrameInfo,
    camera_frustum: Frustum,
    camera_view: Mat4,
    camera_view_mask: u32,
    camera_zone_override: bool,
    occlusion: Option<&'a OcclusionBuffer>,
    zones: &'a [Arc<Zone>],
    highest_zone_priority: i32,
}

impl View {
    /// Collect zones, occluders, geometries and lights for the frame.
    pub(crate) fn get_drawables(&mut self, renderer: &mut Renderer) {
        let Some(camera) = self.camera.clone() else {
            return;
        };
        let Some(octree) = self.octree.clone() else {
            return;
        };

        // Zones and occluders first.
        let mut query = FrustumQuery::new(
            camera.frustum(),
            DrawableFlags::GEOMETRY | DrawableFlags::ZONE,
            camera.view_mask,
        )
        .with_accept(|node| match node {
            SceneNode::Zone(_) => true,
            SceneNode::Geometry(d) => d.core().occluder,
            _ => false,
        });
        octree.execute_query(&mut query);

        self.highest_zone_priority = i32::MIN;
        let mut best_priority = i32::MIN;
        let camera_pos = camera.position;

        for node in &query.results {
            match node {
                SceneNode::Zone(zone) => {
                    self.zones.push(zone.clone());
                    if zone.priority > self.highest_zone_priority {
                        self.highest_zone_priority = zone.priority;
                    }
                    if zone.priority > best_priority && zone.is_inside(camera_pos) {
                        self.camera_zone = zone.clone();
                        best_priority = zone.priority;
                    }
                }
                SceneNode::Geometry(drawable) => self.occluders.push(drawable.clone()),
                SceneNode::Light(_) => {}
            }
        }

        // Pick the zone at the far clip point for fog-color substitution.
        // With a camera-zone override, the camera zone rules everything.
        self.camera_zone_override = self.camera_zone.override_mode;
        if !self.camera_zone_override {
            let far_clip_pos = camera_pos + camera.direction() * camera.far_clip();
            let mut best_priority = i32::MIN;
            for zone in &self.zones {
                if zone.priority > best_priority && zone.is_inside(far_clip_pos) {
                    self.far_clip_zone = zone.clone();
                    best_priority = zone.priority;
                }
            }
        }
        if Arc::ptr_eq(&self.far_clip_zone, renderer.default_zone()) {
            self.far_clip_zone = self.camera_zone.clone();
        }

        // Software occlusion: select, sort and rasterize occluders.
        self.occlusion_buffer = None;
        if self.max_occluder_triangles > 0 {
            self.update_occluders(&camera);
            if !self.occluders.is_empty() {
                let view_proj = camera.projection() * camera.view_matrix();
                let mut buffer = OcclusionBuffer::new(view_proj, camera.aspect_ratio());
                buffer.set_max_triangles(self.max_occluder_triangles);
                draw_occluders(&mut buffer, &self.occluders);
                self.occlusion_buffer = Some(buffer);
            }
        } else {
            self.occluders.clear();
        }

        // Geometries and lights, with coarse occlusion when available.
        let candidates = match &self.occlusion_buffer {
            Some(buffer) => {
                let mut query = OccludedFrustumQuery::new(
                    camera.frustum(),
                    buffer,
                    DrawableFlags::GEOMETRY | DrawableFlags::LIGHT,
                    camera.view_mask,
                );
                octree.execute_query(&mut query);
                query.results
            }
            None => {
                let mut query = FrustumQuery::new(
                    camera.frustum(),
                    DrawableFlags::GEOMETRY | DrawableFlags::LIGHT,
                    camera.view_mask,
                );
                octree.execute_query(&mut query);
                query.results
            }
        };

        // Parallel per-drawable visibility finalization.
        let partitions = self.work_queue.num_partitions();
        let mut results: Vec<PerThreadSceneResult> = (0..partitions)
            .map(|_| PerThreadSceneResult::default())
            .collect();

        {
            let context = VisibilityContext {
                frame: self.frame,
                camera_frustum: camera.frustum(),
                camera_view: camera.view_matrix(),
                camera_view_mask: camera.view_mask,
                camera_zone_override: self.camera_zone_override,
                occlusion: self.occlusion_buffer.as_ref(),
                zones: &self.zones,
                highest_zone_priority: self.highest_zone_priority,
            };
            self.work_queue
                .for_each_partition(&candidates, &mut results, |_, chunk, out| {
                    check_visibility(&context, chunk, out);
                });
        }

        // Merge by concatenation + min/max reduction; cross-partition order
        // is not significant.
        self.min_z = f32::INFINITY;
        self.max_z = 0.0;
        for result in &mut results {
            self.geometries.append(&mut result.geometries);
            self.lights.append(&mut result.lights);
            self.min_z = self.min_z.min(result.min_z);
            self.max_z = self.max_z.max(result.max_z);
        }
        if self.min_z == f32::INFINITY {
            self.min_z = 0.0;
        }

        // Sort lights nearest-first (vertex lights ahead) so shadow map
        // allocation favors the most prominent lights.
        self.light_distances.clear();
        let mut ranked: Vec<(Arc<Light>, f32)> = self
            .lights
            .drain(..)
            .map(|light| {
                let distance = match light.light_type {
                    crate::scene::light::LightType::Directional => 0.0,
                    _ => camera.distance(light.position),
                };
                (light, distance)
            })
            .collect();
        ranked.sort_by(compare_lights);
        for (light, distance) in ranked {
            self.light_distances.insert(light.id(), distance);
            self.lights.push(light);
        }
    }

    /// Filter occluders by draw distance and screen-size heuristic, then
    /// order best-first (fewest triangles per unit of screen size).
    fn update_occluders(&mut self, camera: &Camera) {
        let size_threshold = self.occluder_size_threshold;
        let half_view_size = camera.half_view_size();
        let inv_ortho_size = 1.0 / camera.ortho_size().max(1e-3);
        let frame = self.frame;

        self.occluders.retain(|occluder| {
            if !occluder.core().is_in_any_view(frame.frame_number) {
                occluder.update_batches(&frame);
            }
            let max_distance = occluder.core().draw_distance;
            if max_distance > 0.0 && occluder.core().distance() > max_distance {
                return false;
            }

            let diagonal = occluder.world_bounding_box().size().norm();
            let compare = if camera.is_orthographic() {
                diagonal * inv_ortho_size
            } else {
                diagonal * half_view_size / occluder.core().distance().max(1e-3)
            };
            if compare < size_threshold {
                return false;
            }

            // Best occluders are big and cheap.
            occluder
                .core()
                .set_sort_value(occluder.num_occluder_triangles() as f32 / compare);
            true
        });

        self.occluders.sort_by(|a, b| {
            a.core()
                .sort_value()
                .partial_cmp(&b.core().sort_value())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Zone assignment for a drawable whose cached zone went stale.
    pub(crate) fn find_zone(context_zones: &[Arc<Zone>], drawable: &Arc<dyn Drawable>, camera_frustum: &Frustum, camera_view_mask: u32, highest_zone_priority: i32) {
        let center = drawable.world_bounding_box().center();
        // A center outside the view is only a temporary answer; it must be
        // re-evaluated next frame.
        let temporary = !camera_frustum.contains_point(center);

        let core = drawable.core();
        let last_zone = core.zone();

        let new_zone = match last_zone {
            Some(ref zone)
                if zone.view_mask & camera_view_mask != 0
                    && zone.priority >= highest_zone_priority
                    && core.zone_mask & zone.zone_mask != 0
                    && zone.is_inside(center) =>
            {
                Some(zone.clone())
            }
            _ => {
                let mut best: Option<Arc<Zone>> = None;
                let mut best_priority = i32::MIN;
                for zone in context_zones {
                    if zone.priority > best_priority
                        && core.zone_mask & zone.zone_mask != 0
                        && zone.is_inside(center)
                    {
                        best = Some(zone.clone());
                        best_priority = zone.priority;
                    }
                }
                best
            }
        };
        core.set_zone(new_zone, temporary);
    }
}

/// Per-drawable visibility finalization, run per partition.
fn check_visibility(
    context: &VisibilityContext<'_>,
    chunk: &[SceneNode],
    out: &mut PerThreadSceneResult,
) {
    let view = &context.camera_view;
    let view_z = Vec3::new(view[(2, 0)], view[(2, 1)], view[(2, 2)]);
    let abs_view_z = view_z.abs();

    for node in chunk {
        match node {
            SceneNode::Geometry(drawable) => {
                let core = drawable.core();
                let mut batches_updated = false;

                // Draw distance cutoff.
                let max_distance = core.draw_distance;
                if max_distance > 0.0 {
                    drawable.update_batches(&context.frame);
                    batches_updated = true;
                    if core.distance() > max_distance {
                        continue;
                    }
                }

                // Per-object occlusion test.
                let bounding_box = drawable.world_bounding_box();
                if let Some(buffer) = context.occlusion {
                    if core.occludee && !buffer.is_visible(&bounding_box) {
                        continue;
                    }
                }

                if !batches_updated {
                    drawable.update_batches(&context.frame);
                }
                core.mark_in_view(context.frame.frame_number, true);

                // Zone (re)assignment when the cached zone is stale.
                let zone_stale = core.is_zone_dirty()
                    || core
                        .zone()
                        .map_or(true, |z| z.view_mask & context.camera_view_mask == 0);
                if !context.camera_zone_override && zone_stale {
                    View::find_zone(
                        context.zones,
                        drawable,
                        &context.camera_frustum,
                        context.camera_view_mask,
                        context.highest_zone_priority,
                    );
                }

                // View-space depth range.
                let center = bounding_box.center();
                let view_center_z = -(view_z.dot(&center) + view[(2, 3)]);
                let edge = bounding_box.half_size();
                let view_edge_z = abs_view_z.dot(&edge);
                let min_z = view_center_z - view_edge_z;
                let max_z = view_center_z + view_edge_z;

                core.set_min_max_z(min_z, max_z);
                core.clear_lights();

                if edge.norm_squared().is_finite() {
                    out.min_z = out.min_z.min(min_z);
                    out.max_z = out.max_z.max(max_z);
                }
                out.geometries.push(drawable.clone());
            }
            SceneNode::Light(light) => {
                // Cull lights contributing no color.
                if !light.effective_color().is_black() {
                    out.lights.push(light.clone());
                }
            }
            SceneNode::Zone(_) => {}
        }
    }
}

/// Rasterize occluders best-first until the triangle budget runs out.
fn draw_occluders(buffer: &mut OcclusionBuffer, occluders: &[Arc<dyn Drawable>]) {
    for (i, occluder) in occluders.iter().enumerate() {
        if i > 0 {
            // Occluders hidden by previously drawn occluders contribute
            // nothing.
            if !buffer.is_visible(&occluder.world_bounding_box()) {
                continue;
            }
        }
        if !occluder.draw_occlusion(buffer) {
            break;
        }
    }
    buffer.build_depth_hierarchy();
}
