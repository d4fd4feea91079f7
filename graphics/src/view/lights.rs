//! Per-light processing: lit-geometry gathering, shadow eligibility,
//! shadow camera setup and fitting, and shadow caster collection.
//!
//! Each visible light is processed independently on the worker pool. The
//! result is a [`LightQueryResult`] per light: lit geometries, flattened
//! shadow casters with per-split index ranges, and fitted shadow cameras.

use std::sync::Arc;

use nightshade_core::bounds::{BoundingBox, Intersection, Sphere};
use nightshade_core::frustum::{Frustum, Polyhedron};
use nightshade_core::math::{IntRect, IntVec2, Vec2, Vec3};

use crate::scene::light::{
    Light, LightType, CUBE_FACE_DIRECTIONS, MAX_CASCADE_SPLITS, MAX_LIGHT_SPLITS,
};
use crate::scene::{Camera, Drawable, FrameInfo, FrustumQuery, Octree, SceneNode, SphereQuery};
use crate::types::DrawableFlags;

/// Per-light scratch record; lives for one light's processing in one frame.
pub struct LightQueryResult {
    pub light: Arc<Light>,
    /// Geometries the light affects.
    pub lit_geometries: Vec<Arc<dyn Drawable>>,
    /// Shadow casters of all splits, flattened.
    pub shadow_casters: Vec<Arc<dyn Drawable>>,
    /// Fitted shadow cameras, one per split.
    pub shadow_cameras: Vec<Camera>,
    pub num_splits: usize,
    pub shadow_near_splits: Vec<f32>,
    pub shadow_far_splits: Vec<f32>,
    /// Per-split [begin, end) ranges into `shadow_casters`.
    pub shadow_caster_begin: Vec<usize>,
    pub shadow_caster_end: Vec<usize>,
    /// Merged light-space bounds of the casters per split.
    pub shadow_caster_box: Vec<BoundingBox>,
}

impl LightQueryResult {
    pub fn new(light: Arc<Light>) -> Self {
        Self {
            light,
            lit_geometries: Vec::new(),
            shadow_casters: Vec::new(),
            shadow_cameras: Vec::new(),
            num_splits: 0,
            shadow_near_splits: Vec::new(),
            shadow_far_splits: Vec::new(),
            shadow_caster_begin: Vec::new(),
            shadow_caster_end: Vec::new(),
            shadow_caster_box: Vec::new(),
        }
    }
}

/// Read-only frame inputs for light processing.
pub(crate) struct LightProcessContext<'a> {
    pub frame: FrameInfo,
    pub camera: &'a Camera,
    pub octree: &'a Octree,
    pub geometries: &'a [Arc<dyn Drawable>],
    pub min_z: f32,
    pub max_z: f32,
    pub draw_shadows: bool,
    pub cube_shadow_support: bool,
    /// Camera distance per light id, from the culling phase.
    pub light_distance: f32,
}

/// Effective light mask of a drawable: its own mask intersected with its
/// zone's.
pub(crate) fn drawable_light_mask(drawable: &Arc<dyn Drawable>) -> u32 {
    let core = drawable.core();
    match core.zone() {
        Some(zone) => core.light_mask & zone.light_mask,
        None => core.light_mask,
    }
}

fn drawable_shadow_mask(drawable: &Arc<dyn Drawable>) -> u32 {
    let core = drawable.core();
    match core.zone() {
        Some(zone) => core.shadow_mask & zone.shadow_mask,
        None => core.shadow_mask,
    }
}

/// Process one light: gather lit geometry, decide shadowing, set up and fit
/// shadow cameras, collect casters per split.
pub(crate) fn process_light(context: &LightProcessContext<'_>, query: &mut LightQueryResult) {
    let light = query.light.clone();
    let light_type = light.light_type;
    let frustum = context.camera.frustum();

    // Check if the light should be shadowed.
    let mut is_shadowed = context.draw_shadows
        && light.cast_shadows
        && !light.per_vertex
        && light.shadow_intensity < 1.0;
    if is_shadowed && light.shadow_distance > 0.0 && context.light_distance > light.shadow_distance
    {
        is_shadowed = false;
    }
    if is_shadowed && light_type == LightType::Point && !context.cube_shadow_support {
        is_shadowed = false;
    }

    // Gather lit geometries: they must match the light mask and, for local
    // lights, already be visible in the main view.
    query.lit_geometries.clear();
    let mut candidates: Vec<Arc<dyn Drawable>> = Vec::new();

    match light_type {
        LightType::Directional => {
            for drawable in context.geometries {
                if drawable_light_mask(drawable) & light.light_mask != 0 {
                    query.lit_geometries.push(drawable.clone());
                }
            }
        }
        LightType::Spot => {
            let mut octree_query = FrustumQuery::new(
                light.frustum(),
                DrawableFlags::GEOMETRY,
                context.camera.view_mask,
            );
            context.octree.execute_query(&mut octree_query);
            collect_lit_geometries(context, &light, octree_query.results, &mut candidates, query);
        }
        LightType::Point => {
            let mut octree_query = SphereQuery::new(
                Sphere::new(light.position, light.range),
                DrawableFlags::GEOMETRY,
                context.camera.view_mask,
            );
            context.octree.execute_query(&mut octree_query);
            collect_lit_geometries(context, &light, octree_query.results, &mut candidates, query);
        }
    }

    // No lit geometries or no shadows: cheapest path, no shadow cameras.
    if query.lit_geometries.is_empty() || !is_shadowed {
        query.num_splits = 0;
        return;
    }

    setup_shadow_cameras(context, query);

    // Collect casters per split.
    query.shadow_casters.clear();
    query.shadow_caster_begin.clear();
    query.shadow_caster_end.clear();
    query.shadow_caster_box.clear();

    for split in 0..query.num_splits {
        let begin = query.shadow_casters.len();
        query.shadow_caster_begin.push(begin);
        query.shadow_caster_end.push(begin);
        query.shadow_caster_box.push(BoundingBox::UNDEFINED);

        let shadow_frustum = query.shadow_cameras[split].frustum();

        // A cube face not visible in the main view can be skipped outright.
        if light_type == LightType::Point
            && frustum.is_inside_fast(&shadow_frustum.bounding_box()) == Intersection::Outside
        {
            continue;
        }

        // A directional split entirely outside the visible depth range can
        // be skipped; otherwise its casters come from a fresh octree query
        // with the split frustum. Spot and point lights reuse the
        // lit-geometry query result.
        if light_type == LightType::Directional {
            if context.min_z > query.shadow_far_splits[split]
                || context.max_z < query.shadow_near_splits[split]
            {
                continue;
            }
            let mut caster_query = FrustumQuery::new(
                shadow_frustum,
                DrawableFlags::GEOMETRY,
                context.camera.view_mask,
            )
            .with_accept(|node| {
                node.as_geometry().is_some_and(|d| d.core().cast_shadows)
            });
            context.octree.execute_query(&mut caster_query);
            let split_candidates: Vec<Arc<dyn Drawable>> = caster_query
                .results
                .into_iter()
                .filter_map(|n| n.as_geometry().cloned())
                .collect();
            process_shadow_casters(context, query, &split_candidates, split);
        } else {
            process_shadow_casters(context, query, &candidates, split);
        }
    }

    // With no casters anywhere, render the light unshadowed; no shadow map
    // gets allocated.
    if query.shadow_casters.is_empty() {
        query.num_splits = 0;
    }
}

/// Filter an octree query result into lit geometries (visible this frame,
/// light mask match), keeping the unfiltered list as caster candidates.
fn collect_lit_geometries(
    context: &LightProcessContext<'_>,
    light: &Light,
    results: Vec<SceneNode>,
    candidates: &mut Vec<Arc<dyn Drawable>>,
    query: &mut LightQueryResult,
) {
    for node in results {
        let Some(drawable) = node.as_geometry() else {
            continue;
        };
        candidates.push(drawable.clone());
        if drawable.core().is_in_view(context.frame.frame_number)
            && drawable_light_mask(drawable) & light.light_mask != 0
        {
            query.lit_geometries.push(drawable.clone());
        }
    }
}

/// Determine the number of shadow cameras and set up their initial state.
fn setup_shadow_cameras(context: &LightProcessContext<'_>, query: &mut LightQueryResult) {
    let light = query.light.clone();
    query.shadow_cameras.clear();
    query.shadow_near_splits.clear();
    query.shadow_far_splits.clear();

    match light.light_type {
        LightType::Directional => {
            let num_splits = light.num_shadow_splits().min(MAX_CASCADE_SPLITS);
            let mut near_split = context.camera.near_clip();

            for split in 0..num_splits {
                // A split beyond the far clip ends the cascade.
                if near_split > context.camera.far_clip() {
                    break;
                }
                let far_split = context
                    .camera
                    .far_clip()
                    .min(light.shadow_cascade.splits[split]);
                if far_split <= near_split {
                    break;
                }

                let mut shadow_camera = Camera::new();
                setup_dir_light_shadow_camera(
                    context,
                    &mut shadow_camera,
                    &light,
                    near_split,
                    far_split,
                );
                query.shadow_cameras.push(shadow_camera);
                query.shadow_near_splits.push(near_split);
                query.shadow_far_splits.push(far_split);

                near_split = far_split;
            }
        }
        LightType::Spot => {
            let mut shadow_camera = Camera::new();
            shadow_camera.position = light.position;
            shadow_camera.rotation = light.rotation;
            shadow_camera.set_near_clip((light.shadow_near_far_ratio * light.range).max(1e-3));
            shadow_camera.set_far_clip(light.range);
            shadow_camera.set_fov(light.fov);
            shadow_camera.set_aspect_ratio(light.aspect_ratio);
            query.shadow_cameras.push(shadow_camera);
            query.shadow_near_splits.push(shadow_camera_near(&light));
            query.shadow_far_splits.push(light.range);
        }
        LightType::Point => {
            // Six cube faces aligned to world axes, regardless of light
            // rotation.
            for direction in CUBE_FACE_DIRECTIONS {
                let mut shadow_camera = Camera::new();
                shadow_camera.position = light.position;
                shadow_camera.set_direction(direction);
                shadow_camera.set_near_clip((light.shadow_near_far_ratio * light.range).max(1e-3));
                shadow_camera.set_far_clip(light.range);
                shadow_camera.set_fov(std::f32::consts::FRAC_PI_2);
                shadow_camera.set_aspect_ratio(1.0);
                query.shadow_cameras.push(shadow_camera);
                query.shadow_near_splits.push(shadow_camera_near(&light));
                query.shadow_far_splits.push(light.range);
            }
        }
    }

    query.num_splits = query.shadow_cameras.len().min(MAX_LIGHT_SPLITS);
}

fn shadow_camera_near(light: &Light) -> f32 {
    (light.shadow_near_far_ratio * light.range).max(1e-3)
}

/// Position and fit a directional shadow camera over one cascade split.
fn setup_dir_light_shadow_camera(
    context: &LightProcessContext<'_>,
    shadow_camera: &mut Camera,
    light: &Light,
    near_split: f32,
    far_split: f32,
) {
    let extrusion_distance = context.camera.far_clip();
    let parameters = &light.shadow_focus;

    // Pull the shadow camera back along the light direction from the view
    // camera.
    shadow_camera.position = context.camera.position - light.direction() * extrusion_distance;
    shadow_camera.rotation = light.rotation;

    let mut near = near_split;
    let mut far = far_split.min(context.camera.far_clip());
    // Focusing limits the covered depth range to the visible scene.
    if parameters.focus {
        near = near.max(context.min_z);
        far = far.min(context.max_z).max(near);
    }

    let split_frustum = context.camera.split_frustum(near, far);
    let mut frustum_volume = Polyhedron::from_frustum(&split_frustum);

    // Clip the volume by the bounds of the lit geometries inside the split.
    if parameters.focus {
        let mut lit_box = BoundingBox::UNDEFINED;
        for drawable in context.geometries {
            let (geom_min_z, geom_max_z) = drawable.core().min_max_z();
            if geom_min_z <= far
                && geom_max_z >= near
                && drawable_light_mask(drawable) & light.light_mask != 0
            {
                let bounds = drawable.world_bounding_box();
                if bounds.size().norm_squared().is_finite() {
                    lit_box.merge(&bounds);
                }
            }
        }
        if lit_box.is_defined() {
            frustum_volume.clip(&lit_box);
            // An empty clip result restores the full split volume.
            if frustum_volume.is_empty() {
                frustum_volume = Polyhedron::from_frustum(&split_frustum);
            }
        }
    }

    // Fit the volume in light view space with a box, or a sphere when a
    // uniform-size shadow view is requested.
    frustum_volume.transform(&shadow_camera.view_matrix());
    let shadow_box = if parameters.non_uniform {
        frustum_volume.bounding_box()
    } else {
        let sphere = Sphere::from_points(&frustum_volume.vertices());
        BoundingBox::from_center_half_size(
            sphere.center,
            Vec3::new(sphere.radius, sphere.radius, sphere.radius),
        )
    };

    shadow_camera.set_orthographic(true);
    shadow_camera.set_aspect_ratio(1.0);
    shadow_camera.set_near_clip(0.0);
    // Looking down -Z: the farthest covered depth is the most negative Z.
    shadow_camera.set_far_clip((-shadow_box.min.z).max(1e-3));

    // Center on the bounding box; texel snapping waits until the shadow map
    // viewport is known.
    quantize_dir_light_shadow_camera(shadow_camera, light, IntRect::ZERO, &shadow_box);
}

/// Center the shadow camera on a view-space box, quantize its size against
/// shimmer and, once the viewport is known, snap to whole texels.
pub(crate) fn quantize_dir_light_shadow_camera(
    shadow_camera: &mut Camera,
    light: &Light,
    shadow_viewport: IntRect,
    view_box: &BoundingBox,
) {
    let parameters = &light.shadow_focus;
    let shadow_map_width = shadow_viewport.width() as f32;

    let center = Vec2::new(
        (view_box.min.x + view_box.max.x) * 0.5,
        (view_box.min.y + view_box.max.y) * 0.5,
    );
    let mut view_size = Vec2::new(
        view_box.max.x - view_box.min.x,
        view_box.max.y - view_box.min.y,
    );

    // Quantize size to reduce swimming; uniform unfocused cascades do not
    // need it.
    if parameters.non_uniform {
        view_size.x = quantize_size(view_size.x, parameters.quantize, parameters.min_view);
        view_size.y = quantize_size(view_size.y, parameters.quantize, parameters.min_view);
    } else if parameters.focus {
        view_size.x = quantize_size(
            view_size.x.max(view_size.y),
            parameters.quantize,
            parameters.min_view,
        );
        view_size.y = view_size.x;
    }
    shadow_camera.set_ortho_size_2d(view_size);

    // Center the camera on the box in its own view plane.
    let rotation = shadow_camera.rotation;
    shadow_camera.position += rotation * Vec3::new(center.x, center.y, 0.0);

    // Snap to whole shadow map texels to eliminate sub-texel swimming.
    if shadow_map_width > 2.0 {
        let view_pos = rotation.inverse() * shadow_camera.position;
        // The 2-texel border shrink is accounted for in the texel size.
        let inv_actual_size = 1.0 / (shadow_map_width - 2.0);
        let texel_size = Vec2::new(
            view_size.x * inv_actual_size,
            view_size.y * inv_actual_size,
        );
        if texel_size.x > 0.0 && texel_size.y > 0.0 {
            let snap = Vec3::new(
                -(view_pos.x % texel_size.x),
                -(view_pos.y % texel_size.y),
                0.0,
            );
            shadow_camera.position += rotation * snap;
        }
    }
}

fn quantize_size(size: f32, quantize: f32, min_view: f32) -> f32 {
    let quantized = (size / quantize).sqrt().ceil();
    (quantized * quantized * quantize).max(min_view)
}

/// Final fitting once the shadow map viewport is known: requantize
/// directional cascades, focus spot lights, and shrink by a border to
/// avoid filtering across shadow map tile edges.
pub(crate) fn finalize_shadow_camera(
    shadow_camera: &mut Camera,
    light: &Light,
    shadow_viewport: IntRect,
    shadow_caster_box: &BoundingBox,
) {
    let parameters = &light.shadow_focus;
    let shadow_map_width = shadow_viewport.width() as f32;

    match light.light_type {
        LightType::Directional => {
            let half_y = shadow_camera.ortho_size() * 0.5;
            let half_x = shadow_camera.aspect_ratio() * half_y;
            let shadow_box = BoundingBox::new(
                Vec3::new(-half_x, -half_y, 0.0),
                Vec3::new(half_x, half_y, 0.0),
            );
            quantize_dir_light_shadow_camera(shadow_camera, light, shadow_viewport, &shadow_box);
        }
        LightType::Spot => {
            if parameters.focus && shadow_caster_box.is_defined() {
                // Caster box is in projection space (-1..1); focus the
                // camera by zooming in on it.
                let view_size_x = shadow_caster_box
                    .min
                    .x
                    .abs()
                    .max(shadow_caster_box.max.x.abs());
                let view_size_y = shadow_caster_box
                    .min
                    .y
                    .abs()
                    .max(shadow_caster_box.max.y.abs());
                let mut view_size = view_size_x.max(view_size_y);

                let inv_ortho_size = 1.0 / shadow_camera.ortho_size().max(1e-3);
                let quantize = parameters.quantize * inv_ortho_size;
                let min_view = parameters.min_view * inv_ortho_size;

                view_size = ((view_size / quantize).ceil() * quantize).max(min_view);
                if view_size < 1.0 {
                    shadow_camera.set_zoom(1.0 / view_size);
                }
            }
        }
        LightType::Point => {}
    }

    // Zoom out slightly so bilinear filtering never bleeds across the
    // shadow map border: 2 texels normally, 4 for cube faces which must not
    // cross sides of the virtual cube map.
    if shadow_camera.zoom() >= 1.0 && shadow_map_width > 0.0 {
        let border = if light.light_type == LightType::Point {
            4.0
        } else {
            2.0
        };
        shadow_camera
            .set_zoom(shadow_camera.zoom() * ((shadow_map_width - border) / shadow_map_width));
    }
}

/// Shadow map tile for a split: directional cascades tile 1/2/4 ways,
/// point lights tile six faces 2x3, spot lights use the whole map.
pub(crate) fn shadow_map_viewport(
    light: &Light,
    split_index: usize,
    shadow_map_size: IntVec2,
) -> IntRect {
    let width = shadow_map_size.x;
    let height = shadow_map_size.y;
    let split = split_index as i32;

    match light.light_type {
        LightType::Directional => match light.num_shadow_splits() {
            1 => IntRect::new(0, 0, width, height),
            2 => IntRect::new(split * width / 2, 0, (split + 1) * width / 2, height),
            _ => IntRect::new(
                (split & 1) * width / 2,
                (split / 2) * height / 2,
                ((split & 1) + 1) * width / 2,
                (split / 2 + 1) * height / 2,
            ),
        },
        LightType::Spot => IntRect::new(0, 0, width, height),
        LightType::Point => IntRect::new(
            (split & 1) * width / 2,
            (split / 2) * height / 3,
            ((split & 1) + 1) * width / 2,
            (split / 2 + 1) * height / 3,
        ),
    }
}

/// Collect the shadow casters contributing to one split.
fn process_shadow_casters(
    context: &LightProcessContext<'_>,
    query: &mut LightQueryResult,
    candidates: &[Arc<dyn Drawable>],
    split_index: usize,
) {
    let light = query.light.clone();
    let light_type = light.light_type;
    let shadow_camera = query.shadow_cameras[split_index].clone();
    let shadow_frustum = shadow_camera.frustum();
    let light_view = shadow_camera.view_matrix();
    let light_proj = shadow_camera.projection();

    // The receiver volume in light view space: for point and spot lights
    // the whole visible scene, for directional lights the intersection
    // with the split's depth range so casters stay out of foreign splits.
    let light_view_frustum = if light_type != LightType::Directional {
        context
            .camera
            .split_frustum(context.min_z, context.max_z)
            .transformed(&light_view)
    } else {
        context
            .camera
            .split_frustum(
                context.min_z.max(query.shadow_near_splits[split_index]),
                context.max_z.min(query.shadow_far_splits[split_index]),
            )
            .transformed(&light_view)
    };
    let light_view_frustum_box = light_view_frustum.bounding_box();

    // A degenerate split frustum cannot receive shadows.
    if light_view_frustum.is_degenerate() {
        return;
    }

    for drawable in candidates {
        let core = drawable.core();
        // Spot/point query reuse may include non-casters.
        if !core.cast_shadows {
            continue;
        }
        if drawable_shadow_mask(drawable) & light.light_mask == 0 {
            continue;
        }
        // Point light: the caster must be inside this face's frustum.
        if light_type == LightType::Point
            && shadow_frustum.is_inside_fast(&drawable.world_bounding_box())
                == Intersection::Outside
        {
            continue;
        }

        // Shadow distance cutoff, bounded by the draw distance.
        let mut max_shadow_distance = core.shadow_distance;
        let draw_distance = core.draw_distance;
        let mut batches_updated = core.is_in_any_view(context.frame.frame_number);
        if draw_distance > 0.0 && (max_shadow_distance <= 0.0 || draw_distance < max_shadow_distance)
        {
            max_shadow_distance = draw_distance;
        }
        if max_shadow_distance > 0.0 {
            if !batches_updated {
                drawable.update_batches(&context.frame);
                batches_updated = true;
            }
            if core.distance() > max_shadow_distance {
                continue;
            }
        }
        // Lights process in parallel, so a drawable may get multiple
        // update_batches calls; that is harmless as the scene is frozen.
        if !batches_updated {
            drawable.update_batches(&context.frame);
        }

        let light_view_box = drawable.world_bounding_box().transformed(&light_view);
        if is_shadow_caster_visible(
            context,
            drawable,
            light_view_box,
            &shadow_camera,
            &light_view_frustum,
            &light_view_frustum_box,
        ) {
            if light_type == LightType::Directional {
                query.shadow_caster_box[split_index].merge(&light_view_box);
            } else {
                let light_proj_box = light_view_box.projected(&light_proj);
                query.shadow_caster_box[split_index].merge(&light_proj_box);
            }
            query.shadow_casters.push(drawable.clone());
        }
    }

    query.shadow_caster_end[split_index] = query.shadow_casters.len();
}

/// Test whether a caster's shadow can fall inside the receiver volume.
fn is_shadow_caster_visible(
    context: &LightProcessContext<'_>,
    drawable: &Arc<dyn Drawable>,
    mut light_view_box: BoundingBox,
    shadow_camera: &Camera,
    light_view_frustum: &Frustum,
    light_view_frustum_box: &BoundingBox,
) -> bool {
    if shadow_camera.is_orthographic() {
        // Extrude the box toward the light up to the receiver volume's
        // near edge and test against the receiver frustum.
        light_view_box.max.z = light_view_box.max.z.max(light_view_frustum_box.max.z);
        light_view_frustum.is_inside_fast(&light_view_box) != Intersection::Outside
    } else {
        // A caster visible in the main view shadows something visible.
        if drawable.core().is_in_view(context.frame.frame_number) {
            return true;
        }

        // Extrude the box away from the light origin, growing it with
        // perspective divergence, and test conservatively.
        let center = light_view_box.center();
        let extrusion_distance = shadow_camera.far_clip();
        let original_distance = center.norm().clamp(1e-5, extrusion_distance);
        let size_factor = extrusion_distance / original_distance;

        let direction = center / original_distance;
        let new_center = direction * extrusion_distance;
        let new_half_size = light_view_box.size() * size_factor * 0.5;
        let extruded = BoundingBox::from_center_half_size(new_center, new_half_size);
        light_view_box.merge(&extruded);

        light_view_frustum.is_inside_fast(&light_view_box) != Intersection::Outside
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::scene::StaticMesh;

    fn context_camera() -> Camera {
        let mut camera = Camera::new();
        camera.set_near_clip(1.0);
        camera.set_far_clip(100.0);
        camera
    }

    fn shadow_scene() -> Octree {
        let mut octree = Octree::with_size(500.0);
        for i in 0..5 {
            let mesh = StaticMesh::new(
                Geometry::indexed(8, 36),
                BoundingBox::from_center_half_size(
                    Vec3::new(0.0, 0.0, -10.0 * (i + 1) as f32),
                    Vec3::new(1.0, 1.0, 1.0),
                ),
            )
            .casting_shadows();
            octree.insert(SceneNode::Geometry(Arc::new(mesh)));
        }
        octree
    }

    fn visible_geometries(octree: &Octree, camera: &Camera, frame: &FrameInfo) -> Vec<Arc<dyn Drawable>> {
        let mut query = FrustumQuery::new(camera.frustum(), DrawableFlags::GEOMETRY, u32::MAX);
        octree.execute_query(&mut query);
        let geometries: Vec<Arc<dyn Drawable>> = query
            .results
            .into_iter()
            .filter_map(|n| n.as_geometry().cloned())
            .collect();
        for g in &geometries {
            g.update_batches(frame);
            g.core().mark_in_view(frame.frame_number, true);
        }
        geometries
    }

    #[test]
    fn two_cascades_produce_expected_split_ranges() {
        let camera = context_camera();
        let octree = shadow_scene();
        let frame = FrameInfo {
            frame_number: 1,
            ..Default::default()
        };
        let geometries = visible_geometries(&octree, &camera, &frame);

        let mut light = Light::new(LightType::Directional);
        light.set_direction(Vec3::new(0.0, -1.0, 0.0));
        light.cast_shadows = true;
        light.shadow_cascade.splits = [30.0, 100.0, 0.0, 0.0];

        let context = LightProcessContext {
            frame,
            camera: &camera,
            octree: &octree,
            geometries: &geometries,
            min_z: 1.0,
            max_z: 100.0,
            draw_shadows: true,
            cube_shadow_support: true,
            light_distance: 0.0,
        };
        let mut query = LightQueryResult::new(Arc::new(light));
        process_light(&context, &mut query);

        assert_eq!(query.num_splits, 2);
        assert_eq!(query.shadow_near_splits[0], 1.0);
        assert_eq!(query.shadow_far_splits[0], 30.0);
        assert_eq!(query.shadow_near_splits[1], 30.0);
        assert_eq!(query.shadow_far_splits[1], 100.0);
    }

    #[test]
    fn split_caster_ranges_partition_the_caster_list() {
        let camera = context_camera();
        let octree = shadow_scene();
        let frame = FrameInfo {
            frame_number: 1,
            ..Default::default()
        };
        let geometries = visible_geometries(&octree, &camera, &frame);

        let mut light = Light::new(LightType::Directional);
        light.set_direction(Vec3::new(0.3, -1.0, 0.2));
        light.cast_shadows = true;
        light.shadow_cascade.splits = [20.0, 60.0, 100.0, 0.0];

        let context = LightProcessContext {
            frame,
            camera: &camera,
            octree: &octree,
            geometries: &geometries,
            min_z: 1.0,
            max_z: 100.0,
            draw_shadows: true,
            cube_shadow_support: true,
            light_distance: 0.0,
        };
        let mut query = LightQueryResult::new(Arc::new(light));
        process_light(&context, &mut query);

        // Union of per-split ranges covers the whole caster list with no
        // gaps: each begin equals the previous end, the last end is the
        // list length.
        assert!(query.num_splits > 0);
        let mut expected_begin = 0;
        for split in 0..query.num_splits {
            assert_eq!(query.shadow_caster_begin[split], expected_begin);
            assert!(query.shadow_caster_end[split] >= query.shadow_caster_begin[split]);
            expected_begin = query.shadow_caster_end[split];
        }
        assert_eq!(expected_begin, query.shadow_casters.len());
        assert!(!query.shadow_casters.is_empty());
    }

    #[test]
    fn unshadowed_light_short_circuits() {
        let camera = context_camera();
        let octree = shadow_scene();
        let frame = FrameInfo {
            frame_number: 1,
            ..Default::default()
        };
        let geometries = visible_geometries(&octree, &camera, &frame);

        // cast_shadows off: lit geometries still collected, zero splits.
        let light = Light::directional(Vec3::new(0.0, -1.0, 0.0));
        let context = LightProcessContext {
            frame,
            camera: &camera,
            octree: &octree,
            geometries: &geometries,
            min_z: 1.0,
            max_z: 100.0,
            draw_shadows: true,
            cube_shadow_support: true,
            light_distance: 0.0,
        };
        let mut query = LightQueryResult::new(light);
        process_light(&context, &mut query);

        assert!(!query.lit_geometries.is_empty());
        assert_eq!(query.num_splits, 0);
    }

    #[test]
    fn point_light_without_cube_support_is_unshadowed() {
        let camera = context_camera();
        let octree = shadow_scene();
        let frame = FrameInfo {
            frame_number: 1,
            ..Default::default()
        };
        let geometries = visible_geometries(&octree, &camera, &frame);

        let mut light = Light::new(LightType::Point);
        light.position = Vec3::new(0.0, 3.0, -10.0);
        light.range = 20.0;
        light.cast_shadows = true;

        let context = LightProcessContext {
            frame,
            camera: &camera,
            octree: &octree,
            geometries: &geometries,
            min_z: 1.0,
            max_z: 100.0,
            draw_shadows: true,
            cube_shadow_support: false,
            light_distance: 10.0,
        };
        let mut query = LightQueryResult::new(Arc::new(light));
        process_light(&context, &mut query);

        assert!(!query.lit_geometries.is_empty());
        assert_eq!(query.num_splits, 0);
    }

    #[test]
    fn point_light_with_casters_uses_cube_faces() {
        let camera = context_camera();
        let octree = shadow_scene();
        let frame = FrameInfo {
            frame_number: 1,
            ..Default::default()
        };
        let geometries = visible_geometries(&octree, &camera, &frame);

        let mut light = Light::new(LightType::Point);
        light.position = Vec3::new(0.0, 3.0, -10.0);
        light.range = 30.0;
        light.cast_shadows = true;

        let context = LightProcessContext {
            frame,
            camera: &camera,
            octree: &octree,
            geometries: &geometries,
            min_z: 1.0,
            max_z: 100.0,
            draw_shadows: true,
            cube_shadow_support: true,
            light_distance: 10.0,
        };
        let mut query = LightQueryResult::new(Arc::new(light));
        process_light(&context, &mut query);

        assert_eq!(query.num_splits, 6);
        assert!(!query.shadow_casters.is_empty());
    }

    #[test]
    fn shadow_map_tiling() {
        let size = IntVec2::new(1024, 1024);

        let mut dir = Light::new(LightType::Directional);
        dir.shadow_cascade.splits = [30.0, 100.0, 0.0, 0.0];
        assert_eq!(
            shadow_map_viewport(&dir, 0, size),
            IntRect::new(0, 0, 512, 1024)
        );
        assert_eq!(
            shadow_map_viewport(&dir, 1, size),
            IntRect::new(512, 0, 1024, 1024)
        );

        let spot = Light::new(LightType::Spot);
        assert_eq!(
            shadow_map_viewport(&spot, 0, size),
            IntRect::new(0, 0, 1024, 1024)
        );

        let point = Light::new(LightType::Point);
        assert_eq!(
            shadow_map_viewport(&point, 0, size),
            IntRect::new(0, 0, 512, 341)
        );
        assert_eq!(
            shadow_map_viewport(&point, 5, size),
            IntRect::new(512, 682, 1024, 1024)
        );
    }
}
