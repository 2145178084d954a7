//! End-to-end scenarios exercising the full pipeline: vertex shading,
//! binning, hierarchical rasterization and fragment shading, on small
//! framebuffers where expected coverage can be recomputed exactly with a
//! scalar reference.

use std::sync::atomic::{AtomicUsize, Ordering};

use glam::Vec4;
use tiler::{
    Framebuffer, FragmentOutput, IndexBufferView, InterpolatedAttributes, RasterizerConfig,
    RenderEngine, ShaderMetadata, VertexAttributes, VertexBufferView,
};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct TestVertex {
    pos: [f32; 4],
    color: [f32; 4],
}

const STRIDE: u32 = std::mem::size_of::<TestVertex>() as u32;

/// Clip-space position that lands on raster coordinates (x, y) for a
/// w x h target (w = 1, so device mapping reduces to the raster position
/// exactly for power-of-two targets).
fn clip_from_raster(x: f32, y: f32, z: f32, width: u32, height: u32) -> [f32; 4] {
    [
        2.0 * x / width as f32 - 1.0,
        2.0 * y / height as f32 - 1.0,
        z,
        1.0,
    ]
}

fn vertex(pos: [f32; 4], color: [f32; 4]) -> TestVertex {
    TestVertex { pos, color }
}

static VS_CALLS: AtomicUsize = AtomicUsize::new(0);

fn passthrough_vs(input: &[u8], out: &mut VertexAttributes, _constants: &[u8]) -> Vec4 {
    let v: &TestVertex = bytemuck::from_bytes(input);
    out.vec4[0] = Vec4::from_array(v.color);
    Vec4::from_array(v.pos)
}

fn counting_vs(input: &[u8], out: &mut VertexAttributes, constants: &[u8]) -> Vec4 {
    VS_CALLS.fetch_add(1, Ordering::Relaxed);
    passthrough_vs(input, out, constants)
}

fn constant_color_fs(_attrs: &InterpolatedAttributes, constants: &[u8], out: &mut FragmentOutput) {
    let rgba: [f32; 4] = bytemuck::pod_read_unaligned(constants);
    out.colors = [Vec4::from_array(rgba); 4];
}

fn attribute_color_fs(attrs: &InterpolatedAttributes, _constants: &[u8], out: &mut FragmentOutput) {
    let a = &attrs.vec4[0];
    for lane in 0..4 {
        out.colors[lane] = Vec4::new(a.x[lane], a.y[lane], a.z[lane], a.w[lane]);
    }
}

/// Owned color + depth storage behind the engine's raw-pointer targets.
struct Target {
    width: u32,
    height: u32,
    color: Vec<u8>,
    depth: Vec<f32>,
}

impl Target {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            color: vec![0; (width * height * 4) as usize],
            depth: vec![f32::INFINITY; (width * height) as usize],
        }
    }

    fn framebuffer(&mut self) -> Framebuffer {
        Framebuffer::from_slices(self.width, self.height, &mut self.color, &mut self.depth)
    }

    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [
            self.color[i],
            self.color[i + 1],
            self.color[i + 2],
            self.color[i + 3],
        ]
    }

    fn depth_at(&self, x: u32, y: u32) -> f32 {
        self.depth[(y * self.width + x) as usize]
    }

    fn covered(&self, x: u32, y: u32, clear: [u8; 4]) -> bool {
        self.pixel(x, y) != clear
    }
}

/// Scalar reference for expected coverage: adjoint edge functions over the
/// raster-space triangle (w = 1) with the same shared-edge tie-break the
/// rasterizer applies.
fn reference_coverage(verts: [[f32; 2]; 3], width: u32, height: u32) -> Vec<bool> {
    let [v0, v1, v2] = verts;
    let edges = [
        [v2[1] - v1[1], v1[0] - v2[0], v2[0] * v1[1] - v1[0] * v2[1]],
        [v0[1] - v2[1], v2[0] - v0[0], v0[0] * v2[1] - v2[0] * v0[1]],
        [v1[1] - v0[1], v0[0] - v1[0], v1[0] * v0[1] - v0[0] * v1[1]],
    ];

    let inside = |e: &[f32; 3], x: f32, y: f32| {
        let f = e[0] * x + e[1] * y + e[2];
        f > 0.0 || (!(f < 0.0) && (e[0] > 0.0 || (e[0] == 0.0 && e[1] >= 0.0)))
    };

    let mut mask = vec![false; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            let (cx, cy) = (x as f32 + 0.5, y as f32 + 0.5);
            mask[(y * width + x) as usize] = edges.iter().all(|e| inside(e, cx, cy));
        }
    }
    mask
}

fn small_config(num_workers: usize) -> RasterizerConfig {
    RasterizerConfig {
        tile_size: 8,
        num_workers,
        max_iteration_prims: 4,
        ..Default::default()
    }
}

struct Scene {
    engine: RenderEngine,
}

impl Scene {
    fn new(config: RasterizerConfig, target: &mut Target) -> Self {
        let mut engine = RenderEngine::new(config);
        engine.set_render_targets(target.framebuffer());
        engine.set_vertex_shader(passthrough_vs);
        engine.set_fragment_shader(constant_color_fs);
        engine.set_shader_metadata(ShaderMetadata::new(1, 0, 0));
        engine.set_vertex_input_stride(STRIDE);
        engine.clear_render_targets(true, Vec4::ZERO, true, 1.0);
        Self { engine }
    }
}

const CLEAR: [u8; 4] = [0, 0, 0, 0];
const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];
const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];

#[test]
fn single_triangle_matches_reference_coverage() {
    let (w, h) = (16u32, 16u32);
    let mut target = Target::new(w, h);
    let mut scene = Scene::new(small_config(2), &mut target);

    let raster = [[2.0f32, 2.0], [2.0, 14.0], [14.0, 2.0]];
    let vertices = [
        vertex(clip_from_raster(2.0, 2.0, 0.0, w, h), WHITE),
        vertex(clip_from_raster(2.0, 14.0, 0.0, w, h), WHITE),
        vertex(clip_from_raster(14.0, 2.0, 0.0, w, h), WHITE),
    ];
    let indices: [u16; 3] = [0, 1, 2];
    let constants = WHITE;

    scene
        .engine
        .set_vertex_buffer(VertexBufferView::from_slice(bytemuck::cast_slice(&vertices)));
    scene.engine.set_index_buffer(IndexBufferView::from_u16(&indices));
    scene
        .engine
        .set_constant_buffer(tiler::ConstantBufferView::from_slice(bytemuck::bytes_of(
            &constants,
        )));
    scene.engine.draw(1, 0, true);

    let expected = reference_coverage(raster, w, h);
    for y in 0..h {
        for x in 0..w {
            let covered = target.covered(x, y, CLEAR);
            assert_eq!(
                covered,
                expected[(y * w + x) as usize],
                "coverage mismatch at ({}, {})",
                x,
                y
            );
            if covered {
                assert_eq!(target.pixel(x, y), [255, 255, 255, 255]);
            }
        }
    }

    // The triangle's bbox touches all four 8x8 tiles.
    assert_eq!(scene.engine.queued_tile_count(), 4);
}

#[test]
fn offscreen_triangle_draws_nothing() {
    let (w, h) = (16u32, 16u32);
    let mut target = Target::new(w, h);
    let mut scene = Scene::new(small_config(2), &mut target);

    let vertices = [
        vertex(clip_from_raster(-40.0, -40.0, 0.0, w, h), WHITE),
        vertex(clip_from_raster(-30.0, -40.0, 0.0, w, h), WHITE),
        vertex(clip_from_raster(-40.0, -30.0, 0.0, w, h), WHITE),
    ];
    let indices: [u16; 3] = [0, 1, 2];
    let constants = WHITE;

    scene
        .engine
        .set_vertex_buffer(VertexBufferView::from_slice(bytemuck::cast_slice(&vertices)));
    scene.engine.set_index_buffer(IndexBufferView::from_u16(&indices));
    scene
        .engine
        .set_constant_buffer(tiler::ConstantBufferView::from_slice(bytemuck::bytes_of(
            &constants,
        )));
    scene.engine.draw(1, 0, true);

    assert!((0..h).all(|y| (0..w).all(|x| !target.covered(x, y, CLEAR))));
    assert_eq!(scene.engine.queued_tile_count(), 0);
}

#[test]
fn later_primitive_wins_at_equal_depth() {
    let (w, h) = (16u32, 16u32);
    let mut target = Target::new(w, h);
    let mut scene = Scene::new(small_config(2), &mut target);
    scene.engine.set_fragment_shader(attribute_color_fs);

    // Same geometry twice: A red then B blue, both at z = 0.5. The
    // LESS-OR-EQUAL depth test plus submission order must leave blue.
    let positions = [
        clip_from_raster(0.0, 0.0, 0.5, w, h),
        clip_from_raster(0.0, 20.0, 0.5, w, h),
        clip_from_raster(20.0, 0.0, 0.5, w, h),
    ];
    let vertices = [
        vertex(positions[0], RED),
        vertex(positions[1], RED),
        vertex(positions[2], RED),
        vertex(positions[0], BLUE),
        vertex(positions[1], BLUE),
        vertex(positions[2], BLUE),
    ];
    let indices: [u16; 6] = [0, 1, 2, 3, 4, 5];

    scene
        .engine
        .set_vertex_buffer(VertexBufferView::from_slice(bytemuck::cast_slice(&vertices)));
    scene.engine.set_index_buffer(IndexBufferView::from_u16(&indices));
    scene.engine.draw(2, 0, true);

    let expected = reference_coverage([[0.0, 0.0], [0.0, 20.0], [20.0, 0.0]], w, h);
    for y in 0..h {
        for x in 0..w {
            if expected[(y * w + x) as usize] {
                assert_eq!(
                    target.pixel(x, y),
                    [0, 0, 255, 255],
                    "expected blue at ({}, {})",
                    x,
                    y
                );
                assert_eq!(target.depth_at(x, y), 0.5);
            } else {
                assert!(!target.covered(x, y, CLEAR));
            }
        }
    }
}

#[test]
fn shared_edge_pair_partitions_viewport_exactly() {
    let (w, h) = (16u32, 16u32);

    // Two triangles tessellating the viewport along the main diagonal.
    let tri_a = [[0.0f32, 0.0], [0.0, 16.0], [16.0, 0.0]];
    let tri_b = [[16.0f32, 16.0], [16.0, 0.0], [0.0, 16.0]];

    let render_one = |tri: [[f32; 2]; 3]| -> Target {
        let mut target = Target::new(w, h);
        let mut scene = Scene::new(small_config(2), &mut target);
        let vertices: Vec<TestVertex> = tri
            .iter()
            .map(|&[x, y]| vertex(clip_from_raster(x, y, 0.0, w, h), WHITE))
            .collect();
        let indices: [u16; 3] = [0, 1, 2];
        let constants = WHITE;
        scene
            .engine
            .set_vertex_buffer(VertexBufferView::from_slice(bytemuck::cast_slice(&vertices)));
        scene.engine.set_index_buffer(IndexBufferView::from_u16(&indices));
        scene
            .engine
            .set_constant_buffer(tiler::ConstantBufferView::from_slice(bytemuck::bytes_of(
                &constants,
            )));
        scene.engine.draw(1, 0, true);
        target
    };

    let a = render_one(tri_a);
    let b = render_one(tri_b);

    let mut covered_total = 0u32;
    for y in 0..h {
        for x in 0..w {
            let in_a = a.covered(x, y, CLEAR);
            let in_b = b.covered(x, y, CLEAR);
            assert!(
                in_a != in_b,
                "pixel ({}, {}) covered by {} triangles",
                x,
                y,
                u32::from(in_a) + u32::from(in_b)
            );
            covered_total += u32::from(in_a) + u32::from(in_b);
        }
    }
    assert_eq!(covered_total, w * h, "partition must cover every pixel once");
}

#[test]
fn bbox_spanning_two_tiles_enqueues_both() {
    let (w, h) = (16u32, 16u32);
    let mut target = Target::new(w, h);
    let mut scene = Scene::new(small_config(2), &mut target);

    // Bbox x in [2, 13], y in [2, 6]: exactly tiles (0,0) and (1,0).
    let raster = [[2.0f32, 2.0], [2.0, 6.0], [13.0, 2.0]];
    let vertices: Vec<TestVertex> = raster
        .iter()
        .map(|&[x, y]| vertex(clip_from_raster(x, y, 0.0, w, h), WHITE))
        .collect();
    let indices: [u16; 3] = [0, 1, 2];
    let constants = WHITE;

    scene
        .engine
        .set_vertex_buffer(VertexBufferView::from_slice(bytemuck::cast_slice(&vertices)));
    scene.engine.set_index_buffer(IndexBufferView::from_u16(&indices));
    scene
        .engine
        .set_constant_buffer(tiler::ConstantBufferView::from_slice(bytemuck::bytes_of(
            &constants,
        )));
    scene.engine.draw(1, 0, true);

    assert_eq!(scene.engine.queued_tile_count(), 2);

    let expected = reference_coverage(raster, w, h);
    let mut covered_right_tile = false;
    for y in 0..h {
        for x in 0..w {
            assert_eq!(target.covered(x, y, CLEAR), expected[(y * w + x) as usize]);
            if x >= 8 && target.covered(x, y, CLEAR) {
                covered_right_tile = true;
            }
        }
    }
    assert!(covered_right_tile, "triangle must shade pixels in the second tile");
}

#[test]
fn vertex_cache_skips_repeated_indices() {
    let (w, h) = (16u32, 16u32);

    // Three triangles in strip order, each sharing two vertices with the
    // previous one: five unique vertices, nine index fetches.
    let vertices: Vec<TestVertex> = (0..5)
        .map(|i| {
            vertex(
                clip_from_raster(2.0 + 2.0 * i as f32, 2.0 + 10.0 * (i % 2) as f32, 0.0, w, h),
                WHITE,
            )
        })
        .collect();
    let indices: [u16; 9] = [0, 1, 2, 2, 1, 3, 2, 3, 4];

    let run = |cache: bool| -> usize {
        let mut target = Target::new(w, h);
        let config = RasterizerConfig {
            tile_size: 8,
            num_workers: 1,
            max_iteration_prims: 4,
            vertex_cache: cache,
            ..Default::default()
        };
        let mut scene = Scene::new(config, &mut target);
        scene.engine.set_vertex_shader(counting_vs);
        let constants = WHITE;
        scene
            .engine
            .set_vertex_buffer(VertexBufferView::from_slice(bytemuck::cast_slice(&vertices)));
        scene.engine.set_index_buffer(IndexBufferView::from_u16(&indices));
        scene
            .engine
            .set_constant_buffer(tiler::ConstantBufferView::from_slice(bytemuck::bytes_of(
                &constants,
            )));

        VS_CALLS.store(0, Ordering::Relaxed);
        scene.engine.draw(3, 0, true);
        VS_CALLS.load(Ordering::Relaxed)
    };

    assert_eq!(run(true), 5, "cached run shades each unique vertex once");
    assert_eq!(run(false), 9, "uncached run shades every corner");
}
