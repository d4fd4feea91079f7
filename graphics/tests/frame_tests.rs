//! End-to-end frame tests against the null device.

use std::sync::Arc;

use nightshade_core::bounds::BoundingBox;
use nightshade_core::math::{IntRect, Vec3};
use nightshade_core::thread::WorkQueue;

use nightshade_graphics::material::default_material;
use nightshade_graphics::scene::LightType;
use nightshade_graphics::{
    Camera, DeviceCommand, Geometry, GraphicsDevice, Light, NullDevice, Octree, RenderPath,
    Renderer, RendererConfig, SceneNode, StaticMesh, View, Viewport,
};

use rstest::rstest;

const FORWARD_PATH: &str = r#"
(commands: [
    (type: "clear", color: Some(Color((0.1, 0.1, 0.1, 1.0))), depth: Some(1.0)),
    (type: "scenepass", pass: "base", metadata: "base", vertex_lights: true),
    (type: "forwardlights", pass: "light"),
    (type: "scenepass", pass: "alpha", sort: "backtofront", metadata: "alpha"),
])
"#;

const POSTPROCESS_PATH: &str = r#"
(
    render_targets: [
        (name: "half", format: "rgba8", size_divisor: Some((2.0, 2.0)), filter: true),
    ],
    commands: [
        (type: "clear", color: Some(Color((0.0, 0.0, 0.0, 1.0))), depth: Some(1.0)),
        (type: "scenepass", pass: "base", metadata: "base"),
        (type: "quad", vs: "Downsample", ps: "Downsample",
         textures: [("diffuse", "viewport")], output: Some("half")),
        (type: "quad", vs: "Composite", ps: "Composite",
         textures: [("diffuse", "viewport"), ("normal", "half")]),
    ],
)
"#;

fn mesh_at(position: Vec3) -> StaticMesh {
    StaticMesh::new(
        Geometry::indexed(8, 36),
        BoundingBox::from_center_half_size(position, Vec3::new(1.0, 1.0, 1.0)),
    )
    .with_material(default_material())
    .casting_shadows()
}

fn scene_octree(mesh_count: usize) -> Octree {
    let mut octree = Octree::with_size(500.0);
    for i in 0..mesh_count {
        let offset = i as f32 * 4.0 - (mesh_count as f32 * 2.0);
        octree.insert(SceneNode::Geometry(Arc::new(mesh_at(Vec3::new(
            offset, 0.0, -20.0,
        )))));
    }
    octree
}

fn viewport_for(path_text: &str, octree: Octree) -> Viewport {
    let mut path = RenderPath::new();
    path.load(path_text).unwrap();
    let mut viewport = Viewport::new(path);
    let mut camera = Camera::new();
    camera.set_near_clip(1.0);
    camera.set_far_clip(200.0);
    viewport.camera = Some(camera);
    viewport.octree = Some(Arc::new(octree));
    viewport
}

fn run_frame(
    view: &mut View,
    viewport: &Viewport,
    renderer: &mut Renderer,
    device: &mut NullDevice,
    frame_number: u64,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(view.define(None, viewport, renderer, device));
    view.update(frame_number, 0.016, renderer, device);
    view.render(renderer, device);
}

#[rstest]
#[case(1)]
#[case(8)]
#[case(64)]
fn forward_frame_scales_with_scene_size(#[case] mesh_count: usize) {
    let mut device = NullDevice::new(1280, 720);
    let mut renderer = Renderer::new(RendererConfig::default());
    let mut view = View::new(Arc::new(WorkQueue::with_default_threads()));
    let viewport = viewport_for(FORWARD_PATH, scene_octree(mesh_count));

    run_frame(&mut view, &viewport, &mut renderer, &mut device, 1);

    assert_eq!(device.clear_count(), 1);
    assert!(device.draw_count() >= 1);
}

#[test]
fn lit_frame_draws_shadows_and_light_batches() {
    let mut octree = scene_octree(4);
    let mut light = Light::new(LightType::Directional);
    light.set_direction(Vec3::new(0.2, -1.0, 0.1));
    light.cast_shadows = true;
    octree.insert(SceneNode::Light(Arc::new(light)));

    let mut device = NullDevice::new(1280, 720);
    let mut renderer = Renderer::new(RendererConfig::default());
    let mut view = View::new(Arc::new(WorkQueue::with_default_threads()));
    let viewport = viewport_for(FORWARD_PATH, octree);

    run_frame(&mut view, &viewport, &mut renderer, &mut device, 1);

    // Shadow map depth clear + color clear, plus draws for shadow casters
    // and lit batches.
    assert!(device.clear_count() >= 2);
    assert!(device.draw_count() >= 4);
}

#[test]
fn postprocess_chain_reads_named_target() {
    let mut device = NullDevice::new(1280, 720);
    let mut renderer = Renderer::new(RendererConfig::default());
    let mut view = View::new(Arc::new(WorkQueue::with_default_threads()));
    let viewport = viewport_for(POSTPROCESS_PATH, scene_octree(2));

    run_frame(&mut view, &viewport, &mut renderer, &mut device, 1);

    // The downsample quad renders into the declared half-size target and
    // the composite quad samples it.
    let half_target = device
        .commands()
        .iter()
        .find_map(|c| match c {
            DeviceCommand::SetRenderTarget {
                slot: 0,
                target: Some(t),
            } if device.texture_size(*t).is_some_and(|s| s.x == 640) => Some(*t),
            _ => None,
        })
        .expect("half-size target bound");
    assert!(device.commands().iter().any(|c| matches!(
        c,
        DeviceCommand::SetTexture { texture: Some(t), .. } if *t == half_target
    )));
}

#[test]
fn frames_are_stable_across_reuse() {
    let mut octree = scene_octree(8);
    let mut light = Light::new(LightType::Directional);
    light.set_direction(Vec3::new(0.0, -1.0, 0.0));
    light.cast_shadows = true;
    octree.insert(SceneNode::Light(Arc::new(light)));

    let mut device = NullDevice::new(1280, 720);
    let mut renderer = Renderer::new(RendererConfig::default());
    let mut view = View::new(Arc::new(WorkQueue::with_default_threads()));
    let viewport = viewport_for(FORWARD_PATH, octree);

    run_frame(&mut view, &viewport, &mut renderer, &mut device, 1);
    let first_frame_draws = device.draw_count();
    let first_frame_textures = device.live_texture_count();

    // Subsequent frames reuse pooled textures and produce the same work.
    for frame in 2..5u64 {
        device.clear_commands();
        run_frame(&mut view, &viewport, &mut renderer, &mut device, frame);
        assert_eq!(device.draw_count(), first_frame_draws);
        assert_eq!(device.live_texture_count(), first_frame_textures);
    }
}

#[test]
fn viewport_rect_is_clamped_to_target() {
    let mut device = NullDevice::new(1280, 720);
    let mut renderer = Renderer::new(RendererConfig::default());
    let mut view = View::new(Arc::new(WorkQueue::with_default_threads()));

    let mut viewport = viewport_for(FORWARD_PATH, scene_octree(1));
    viewport.rect = IntRect::new(-100, -100, 5000, 5000);

    assert!(view.define(None, &viewport, &renderer, &device));
    assert_eq!(view.view_rect(), IntRect::new(0, 0, 1280, 720));
}

#[test]
fn shadow_budget_exhaustion_degrades_gracefully() {
    let mut octree = scene_octree(4);
    // More shadowed point lights than the budget allows.
    for i in 0..4 {
        let mut light = Light::new(LightType::Point);
        light.position = Vec3::new(i as f32 * 4.0 - 8.0, 3.0, -20.0);
        light.range = 15.0;
        light.cast_shadows = true;
        octree.insert(SceneNode::Light(Arc::new(light)));
    }

    let mut device = NullDevice::new(1280, 720);
    let mut renderer = Renderer::new(RendererConfig {
        max_shadow_maps: 1,
        ..Default::default()
    });
    let mut view = View::new(Arc::new(WorkQueue::with_default_threads()));
    let viewport = viewport_for(FORWARD_PATH, octree);

    // Lights beyond the budget silently render unshadowed; the frame
    // completes.
    run_frame(&mut view, &viewport, &mut renderer, &mut device, 1);

    let shadowed = view
        .light_queues()
        .iter()
        .filter(|q| q.shadow_map.is_some())
        .count();
    assert!(shadowed <= 1);
    assert_eq!(view.light_queues().len(), 4);
}

#[test]
fn instance_write_failure_keeps_frame_valid() {
    let shared_geometry = Geometry::indexed(8, 36);
    let shared_material = default_material();
    let mut octree = Octree::with_size(500.0);
    for i in 0..8 {
        octree.insert(SceneNode::Geometry(Arc::new(
            StaticMesh::new(
                shared_geometry.clone(),
                BoundingBox::from_center_half_size(
                    Vec3::new(i as f32 * 3.0 - 12.0, 0.0, -20.0),
                    Vec3::new(1.0, 1.0, 1.0),
                ),
            )
            .with_material(shared_material.clone()),
        )));
    }

    let mut device = NullDevice::new(1280, 720);
    device.set_fail_instance_writes(true);
    let mut renderer = Renderer::new(RendererConfig::default());
    let mut view = View::new(Arc::new(WorkQueue::with_default_threads()));
    let viewport = viewport_for(FORWARD_PATH, octree);

    // The failed buffer map aborts the upload step only; the frame still
    // issues its draws.
    run_frame(&mut view, &viewport, &mut renderer, &mut device, 1);
    assert!(device.draw_count() >= 1);
}
