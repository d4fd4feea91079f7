//! Software occlusion buffer.
//!
//! Selected occluders rasterize their triangles into a small CPU depth
//! buffer; later queries test bounding boxes against it to reject hidden
//! objects before they reach batch building. Rasterization stops when the
//! triangle budget is exhausted. All writes happen on the main thread
//! before the parallel visibility phase reads the buffer.

use nightshade_core::bounds::BoundingBox;
use nightshade_core::math::{Mat4, Vec3, Vec4};

/// Fixed buffer width; height follows the camera aspect ratio.
pub const OCCLUSION_BUFFER_WIDTH: usize = 256;

/// Depth slack so objects touching an occluder surface stay visible.
const DEPTH_BIAS: f32 = 1e-5;

/// CPU depth raster for conservative occlusion tests.
pub struct OcclusionBuffer {
    width: usize,
    height: usize,
    /// Nearest rasterized depth per pixel, 1.0 = empty.
    depth: Vec<f32>,
    /// Half-resolution max-depth level for coarse octant tests.
    coarse: Vec<f32>,
    coarse_width: usize,
    coarse_height: usize,
    coarse_valid: bool,
    view_proj: Mat4,
    max_triangles: u32,
    triangles: u32,
}

impl OcclusionBuffer {
    /// Create for a camera with the given view-projection and aspect ratio.
    pub fn new(view_proj: Mat4, aspect: f32) -> Self {
        let width = OCCLUSION_BUFFER_WIDTH;
        let height = ((width as f32 / aspect.max(0.1)) as usize).clamp(16, 1024);
        let coarse_width = width / 2;
        let coarse_height = (height / 2).max(1);
        Self {
            width,
            height,
            depth: vec![1.0; width * height],
            coarse: vec![1.0; coarse_width * coarse_height],
            coarse_width,
            coarse_height,
            coarse_valid: false,
            view_proj,
            max_triangles: 0,
            triangles: 0,
        }
    }

    pub fn set_max_triangles(&mut self, max_triangles: u32) {
        self.max_triangles = max_triangles;
    }

    pub fn clear(&mut self) {
        self.depth.fill(1.0);
        self.coarse.fill(1.0);
        self.coarse_valid = false;
        self.triangles = 0;
    }

    pub fn triangles_used(&self) -> u32 {
        self.triangles
    }

    /// Rasterize one world-space triangle. Returns false when the triangle
    /// budget ran out and rendering should stop.
    pub fn draw_triangle(&mut self, v0: Vec3, v1: Vec3, v2: Vec3) -> bool {
        if self.triangles >= self.max_triangles {
            return false;
        }
        self.triangles += 1;
        self.coarse_valid = false;

        let p = [self.project(v0), self.project(v1), self.project(v2)];
        // Reject triangles crossing the near plane instead of clipping;
        // fewer occluders is conservative.
        if p.iter().any(|v| v.is_none()) {
            return true;
        }
        let p: Vec<Vec3> = p.into_iter().flatten().collect();

        let min_x = p.iter().map(|v| v.x).fold(f32::INFINITY, f32::min).floor() as i64;
        let max_x = p.iter().map(|v| v.x).fold(f32::NEG_INFINITY, f32::max).ceil() as i64;
        let min_y = p.iter().map(|v| v.y).fold(f32::INFINITY, f32::min).floor() as i64;
        let max_y = p.iter().map(|v| v.y).fold(f32::NEG_INFINITY, f32::max).ceil() as i64;

        let min_x = min_x.clamp(0, self.width as i64 - 1) as usize;
        let max_x = max_x.clamp(0, self.width as i64 - 1) as usize;
        let min_y = min_y.clamp(0, self.height as i64 - 1) as usize;
        let max_y = max_y.clamp(0, self.height as i64 - 1) as usize;

        let area = edge(p[0], p[1], p[2]);
        if area.abs() < 1e-9 {
            return true;
        }
        let inv_area = 1.0 / area;

        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let px = Vec3::new(x as f32 + 0.5, y as f32 + 0.5, 0.0);
                let w0 = edge(p[1], p[2], px) * inv_area;
                let w1 = edge(p[2], p[0], px) * inv_area;
                let w2 = edge(p[0], p[1], px) * inv_area;
                if w0 < 0.0 || w1 < 0.0 || w2 < 0.0 {
                    continue;
                }
                let z = w0 * p[0].z + w1 * p[1].z + w2 * p[2].z;
                let idx = y * self.width + x;
                if z < self.depth[idx] {
                    self.depth[idx] = z;
                }
            }
        }
        true
    }

    /// Rasterize all faces of a world-space box (12 triangles).
    pub fn draw_box(&mut self, box_: &BoundingBox) -> bool {
        let c = box_corners(box_);
        // Quads: -z, +z, -x, +x, -y, +y.
        const FACES: [[usize; 4]; 6] = [
            [0, 2, 3, 1],
            [4, 5, 7, 6],
            [0, 4, 6, 2],
            [1, 3, 7, 5],
            [0, 1, 5, 4],
            [2, 6, 7, 3],
        ];
        for face in FACES {
            if !self.draw_triangle(c[face[0]], c[face[1]], c[face[2]]) {
                return false;
            }
            if !self.draw_triangle(c[face[0]], c[face[2]], c[face[3]]) {
                return false;
            }
        }
        true
    }

    /// Build the reduced max-depth level after all occluders are drawn.
    pub fn build_depth_hierarchy(&mut self) {
        for cy in 0..self.coarse_height {
            for cx in 0..self.coarse_width {
                let mut max_depth: f32 = 0.0;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let x = (cx * 2 + dx).min(self.width - 1);
                        let y = (cy * 2 + dy).min(self.height - 1);
                        max_depth = max_depth.max(self.depth[y * self.width + x]);
                    }
                }
                self.coarse[cy * self.coarse_width + cx] = max_depth;
            }
        }
        self.coarse_valid = true;
    }

    /// Conservative visibility test: true unless the box is behind drawn
    /// occluders everywhere it appears on screen.
    pub fn is_visible(&self, box_: &BoundingBox) -> bool {
        if self.triangles == 0 {
            return true;
        }

        let mut min_x = f32::INFINITY;
        let mut max_x = f32::NEG_INFINITY;
        let mut min_y = f32::INFINITY;
        let mut max_y = f32::NEG_INFINITY;
        let mut min_z = f32::INFINITY;

        for corner in box_corners(box_) {
            match self.project(corner) {
                Some(p) => {
                    min_x = min_x.min(p.x);
                    max_x = max_x.max(p.x);
                    min_y = min_y.min(p.y);
                    max_y = max_y.max(p.y);
                    min_z = min_z.min(p.z);
                }
                // A corner crossing the near plane cannot be tested reliably.
                None => return true,
            }
        }

        if max_x < 0.0 || min_x >= self.width as f32 || max_y < 0.0 || min_y >= self.height as f32 {
            // Off-screen: the occlusion buffer has no say.
            return true;
        }

        let x0 = (min_x.floor().max(0.0)) as usize;
        let x1 = (max_x.ceil() as usize).min(self.width - 1);
        let y0 = (min_y.floor().max(0.0)) as usize;
        let y1 = (max_y.ceil() as usize).min(self.height - 1);
        let min_z = min_z - DEPTH_BIAS;

        // Coarse reject first when the hierarchy is built.
        if self.coarse_valid {
            let cx0 = x0 / 2;
            let cx1 = (x1 / 2).min(self.coarse_width - 1);
            let cy0 = y0 / 2;
            let cy1 = (y1 / 2).min(self.coarse_height - 1);
            let mut region_max: f32 = 0.0;
            for cy in cy0..=cy1 {
                for cx in cx0..=cx1 {
                    region_max = region_max.max(self.coarse[cy * self.coarse_width + cx]);
                }
            }
            if min_z > region_max {
                return false;
            }
        }

        for y in y0..=y1 {
            for x in x0..=x1 {
                if self.depth[y * self.width + x] > min_z {
                    return true;
                }
            }
        }
        false
    }

    /// Project to pixel coordinates + depth; `None` behind the near plane.
    fn project(&self, v: Vec3) -> Option<Vec3> {
        let clip = self.view_proj * Vec4::new(v.x, v.y, v.z, 1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let inv_w = 1.0 / clip.w;
        let ndc_x = clip.x * inv_w;
        let ndc_y = clip.y * inv_w;
        let z = clip.z * inv_w;
        Some(Vec3::new(
            (ndc_x * 0.5 + 0.5) * self.width as f32,
            (0.5 - ndc_y * 0.5) * self.height as f32,
            z,
        ))
    }
}

fn edge(a: Vec3, b: Vec3, p: Vec3) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

fn box_corners(box_: &BoundingBox) -> [Vec3; 8] {
    let (min, max) = (box_.min, box_.max);
    [
        Vec3::new(min.x, min.y, min.z),
        Vec3::new(max.x, min.y, min.z),
        Vec3::new(min.x, max.y, min.z),
        Vec3::new(max.x, max.y, min.z),
        Vec3::new(min.x, min.y, max.z),
        Vec3::new(max.x, min.y, max.z),
        Vec3::new(min.x, max.y, max.z),
        Vec3::new(max.x, max.y, max.z),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use nightshade_core::math::{look_at_rh, perspective_rh};

    fn forward_buffer() -> OcclusionBuffer {
        let view = look_at_rh(
            &Vec3::zeros(),
            &Vec3::new(0.0, 0.0, -1.0),
            &Vec3::new(0.0, 1.0, 0.0),
        );
        let proj = perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 1000.0);
        let mut buffer = OcclusionBuffer::new(proj * view, 1.0);
        buffer.set_max_triangles(1000);
        buffer
    }

    fn wall(z: f32, half: f32) -> BoundingBox {
        BoundingBox::new(
            Vec3::new(-half, -half, z - 0.1),
            Vec3::new(half, half, z + 0.1),
        )
    }

    #[test]
    fn empty_buffer_everything_visible() {
        let buffer = forward_buffer();
        assert!(buffer.is_visible(&wall(-50.0, 1.0)));
    }

    #[test]
    fn near_wall_occludes_far_box() {
        let mut buffer = forward_buffer();
        // A huge wall close to the camera hides a small box far behind it.
        assert!(buffer.draw_box(&wall(-5.0, 100.0)));
        buffer.build_depth_hierarchy();

        assert!(!buffer.is_visible(&wall(-500.0, 1.0)));
        // A box in front of the wall remains visible.
        assert!(buffer.is_visible(&wall(-2.0, 1.0)));
    }

    #[test]
    fn offscreen_box_is_visible() {
        let mut buffer = forward_buffer();
        assert!(buffer.draw_box(&wall(-5.0, 100.0)));
        buffer.build_depth_hierarchy();
        // Behind the camera; the buffer cannot claim it is hidden.
        assert!(buffer.is_visible(&wall(50.0, 1.0)));
    }

    #[test]
    fn triangle_budget_stops_rendering() {
        let mut buffer = forward_buffer();
        buffer.set_max_triangles(6);
        // A box needs 12 triangles; drawing must stop partway.
        assert!(!buffer.draw_box(&wall(-5.0, 100.0)));
        assert_eq!(buffer.triangles_used(), 6);
    }

    #[test]
    fn clear_resets_depth_and_budget() {
        let mut buffer = forward_buffer();
        assert!(buffer.draw_box(&wall(-5.0, 100.0)));
        buffer.build_depth_hierarchy();
        assert!(!buffer.is_visible(&wall(-500.0, 1.0)));

        buffer.clear();
        assert_eq!(buffer.triangles_used(), 0);
        assert!(buffer.is_visible(&wall(-500.0, 1.0)));
    }
}
