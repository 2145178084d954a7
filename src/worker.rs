//! Pipeline worker: one long-lived thread advancing a per-drawcall state
//! machine.
//!
//! Each draw iteration walks the same five phases on every worker:
//! geometry (vertex shade, trivial-reject clip, triangle setup, binning),
//! the post-binning barrier, rasterization, the post-raster barrier, and
//! fragment shading. The barriers are not condvars: a worker that reaches
//! a sync point spins advancing its peers' states via compare-and-swap,
//! so "waiting" is itself the forward progress that releases the barrier.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use glam::{Vec2, Vec3, Vec4};
use log::trace;

use crate::config::{
    EDGE_TESTS_PER_ROW, PIXEL_BLOCK_SIZE, SIMD_WIDTH, VERTEX_CACHE_CAPACITY,
};
use crate::coverage::{CoverageMask, CoverageMaskKind};
use crate::engine::EngineShared;
use crate::quad;
use crate::queue::INVALID_TILE;
use crate::setup::Rect2D;
use crate::shader::{InterpolatedAttributes, VertexAttributes};
use crate::sync::SharedCell;

/// Worker lifecycle states. The numeric order is load-bearing: the
/// barrier helpers treat `state >= target` as "already past the sync
/// point" when a compare-and-swap loses the race.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum WorkerState {
    Idle = 0,
    DrawcallTop = 1,
    Geometry = 2,
    Binning = 3,
    PostBinner = 4,
    Raster = 5,
    PostRaster = 6,
    Fragment = 7,
    Bottom = 8,
    Terminated = 9,
}

/// Primitive range assigned to a worker for one draw iteration.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DrawParams {
    /// First primitive index (inclusive, absolute within the drawcall).
    pub(crate) start: u32,
    /// One past the last primitive index.
    pub(crate) end: u32,
    /// First primitive index of the whole iteration; `prim - iter_base`
    /// is the primitive's slot id into the setup buffers.
    pub(crate) iter_base: u32,
    pub(crate) vertex_offset: u32,
    /// Set on the first iteration of a drawcall; vertex caches are
    /// invalidated per drawcall, not per iteration.
    pub(crate) reset_vertex_cache: bool,
}

/// Mailbox between the engine and one worker thread.
pub(crate) struct WorkerSlot {
    pub(crate) state: AtomicU32,
    /// Written by the main thread while the worker is `Idle`; published
    /// by the release store of `DrawcallTop`.
    pub(crate) params: SharedCell<DrawParams>,
}

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(WorkerState::Idle as u32),
            params: SharedCell::default(),
        }
    }
}

/// Direct-lookup cache of shaded vertices, keyed on the raw input index.
/// Linear search beats a hash map at this size.
struct VertexCache {
    indices: [u32; VERTEX_CACHE_CAPACITY],
    clip: [Vec4; VERTEX_CACHE_CAPACITY],
    attribs: [VertexAttributes; VERTEX_CACHE_CAPACITY],
    len: usize,
}

impl VertexCache {
    fn new() -> Self {
        Self {
            indices: [u32::MAX; VERTEX_CACHE_CAPACITY],
            clip: [Vec4::ZERO; VERTEX_CACHE_CAPACITY],
            attribs: [VertexAttributes::default(); VERTEX_CACHE_CAPACITY],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn lookup(&self, vertex_idx: u32) -> Option<usize> {
        self.indices[..self.len].iter().position(|&i| i == vertex_idx)
    }

    fn insert(&mut self, vertex_idx: u32, clip: Vec4, attribs: &VertexAttributes) {
        if self.len < VERTEX_CACHE_CAPACITY {
            self.indices[self.len] = vertex_idx;
            self.clip[self.len] = clip;
            self.attribs[self.len] = *attribs;
            self.len += 1;
        }
    }
}

/// Classification of a square region against the three edge functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Classify {
    TrivialReject,
    TrivialAccept,
    Overlap,
}

/// Hierarchical trivial-reject / trivial-accept tester for a grid of
/// square cells (tiles or 8x8 blocks), stepping the edge functions
/// incrementally from the first cell of the range.
struct HierarchyTester {
    edges: [Vec3; 3],
    /// Edge function at each edge's TR corner of the range's first cell.
    tr_base: [f32; 3],
    /// `E(TA corner) - E(TR corner)`, constant per edge for a fixed
    /// cell extent.
    ta_delta: [f32; 3],
    extent: f32,
}

impl HierarchyTester {
    fn new(edges: [Vec3; 3], origin_x: f32, origin_y: f32, extent: f32) -> Self {
        let mut tr_base = [0.0f32; 3];
        let mut ta_delta = [0.0f32; 3];

        for (k, e) in edges.iter().enumerate() {
            // The TR corner is the cell corner furthest along the edge
            // normal (a, b); TA is its diagonal partner.
            let tr = Self::tr_corner_offset(e.x, e.y, extent);
            let ta = Vec2::new(extent - tr.x, extent - tr.y);
            tr_base[k] = e.x * (origin_x + tr.x) + e.y * (origin_y + tr.y) + e.z;
            ta_delta[k] = e.x * (ta.x - tr.x) + e.y * (ta.y - tr.y);
        }

        Self {
            edges,
            tr_base,
            ta_delta,
            extent,
        }
    }

    #[inline]
    fn tr_corner_offset(a: f32, b: f32, extent: f32) -> Vec2 {
        match (a >= 0.0, b >= 0.0) {
            (true, true) => Vec2::new(extent, extent),
            (false, true) => Vec2::new(0.0, extent),
            (true, false) => Vec2::new(extent, 0.0),
            (false, false) => Vec2::new(0.0, 0.0),
        }
    }

    /// Classify the cell `(step_x, step_y)` cells away from the range
    /// origin.
    fn classify(&self, step_x: u32, step_y: u32) -> Classify {
        let dx = step_x as f32 * self.extent;
        let dy = step_y as f32 * self.extent;

        let mut accept = true;
        for k in 0..3 {
            let tr = self.tr_base[k] + self.edges[k].x * dx + self.edges[k].y * dy;
            if tr < 0.0 {
                // The whole cell lies outside this edge.
                return Classify::TrivialReject;
            }
            if tr + self.ta_delta[k] < 0.0 {
                accept = false;
            }
        }

        if accept {
            Classify::TrivialAccept
        } else {
            Classify::Overlap
        }
    }
}

/// Thread entry point.
pub(crate) fn run(shared: Arc<EngineShared>, worker_idx: usize) {
    let mut worker = PipelineWorker {
        shared,
        worker_idx,
        cache: VertexCache::new(),
        scratch_attribs: [VertexAttributes::default(); 3],
    };
    worker.run_loop();
}

struct PipelineWorker {
    shared: Arc<EngineShared>,
    worker_idx: usize,
    cache: VertexCache,
    /// Per-vertex attribute slots reused when the vertex cache is
    /// disabled or full.
    scratch_attribs: [VertexAttributes; 3],
}

impl PipelineWorker {
    fn store_state(&self, state: WorkerState, order: Ordering) {
        self.shared.workers[self.worker_idx]
            .state
            .store(state as u32, order);
    }

    fn load_state(&self) -> u32 {
        self.shared.workers[self.worker_idx]
            .state
            .load(Ordering::Acquire)
    }

    fn run_loop(&mut self) {
        loop {
            let state = self.load_state();
            if state == WorkerState::Terminated as u32 {
                break;
            }
            if state == WorkerState::DrawcallTop as u32 {
                self.process_drawcall();
            } else {
                thread::yield_now();
            }
        }
    }

    fn process_drawcall(&mut self) {
        let shared = Arc::clone(&self.shared);
        // Safety: published by the DrawcallTop release store we just
        // acquire-loaded; the main thread does not touch it again until
        // we report Bottom.
        let params = unsafe { shared.workers[self.worker_idx].params.read() };

        trace!("worker {} drawcall [{}, {})", self.worker_idx, params.start, params.end);

        if params.reset_vertex_cache {
            self.cache.clear();
        }

        self.store_state(WorkerState::Geometry, Ordering::Relaxed);
        self.geometry(&shared, &params);

        // All binning must land before any worker rasterizes, or tiles
        // would observe partially filled peer bins.
        trace!("worker {} post-binning sync", self.worker_idx);
        self.store_state(WorkerState::PostBinner, Ordering::Release);
        shared.wait_binning_complete();
        debug_assert_eq!(self.load_state(), WorkerState::Raster as u32);

        self.rasterize(&shared);

        // Same fence between rasterization and fragment shading: a worker
        // done with the tile queue must not start consuming coverage
        // masks that a slower peer is still emitting.
        trace!("worker {} post-raster sync", self.worker_idx);
        self.store_state(WorkerState::PostRaster, Ordering::Release);
        shared.wait_raster_complete();
        debug_assert_eq!(self.load_state(), WorkerState::Fragment as u32);

        self.fragment_shade(&shared);

        trace!("worker {} drawcall bottom", self.worker_idx);
        self.store_state(WorkerState::Bottom, Ordering::Release);
    }

    // ---- geometry: VS + clip + setup + bin -------------------------------

    fn geometry(&mut self, shared: &EngineShared, params: &DrawParams) {
        for prim in params.start..params.end {
            let slot = prim - params.iter_base;

            let (v0, v1, v2) = self.shade_primitive_vertices(shared, params, prim, slot);

            if Self::trivially_clipped(v0, v1, v2) {
                continue;
            }

            if !self.setup_and_cull(shared, slot, v0, v1, v2) {
                continue;
            }

            self.bin_primitive(shared, slot, v0, v1, v2);
        }
    }

    /// Run (or fetch from cache) the vertex shader for the primitive's
    /// three vertices, then store the attribute interpolation deltas for
    /// its slot.
    fn shade_primitive_vertices(
        &mut self,
        shared: &EngineShared,
        params: &DrawParams,
        prim: u32,
        slot: u32,
    ) -> (Vec4, Vec4, Vec4) {
        // Safety: geometry stage; bindings are frozen while any worker is
        // out of Idle.
        let state = unsafe { shared.state() };
        let index_buffer = state.index_buffer.as_ref().expect("index buffer bound");
        let constants = unsafe { state.constant_buffer.bytes() };
        let vs = state.vertex_shader.expect("vertex shader bound");
        let stride = state.vertex_stride as usize;
        let use_cache = shared.config.vertex_cache;

        let mut clip = [Vec4::ZERO; 3];

        for corner in 0..3 {
            let fetch = params.vertex_offset + 3 * prim + corner as u32;
            // Safety: caller-supplied index buffer view; bounds are the
            // caller's binding contract, checked in debug builds.
            let vertex_idx = unsafe { index_buffer.fetch(fetch as usize) };

            if use_cache {
                if let Some(entry) = self.cache.lookup(vertex_idx) {
                    clip[corner] = self.cache.clip[entry];
                    self.scratch_attribs[corner] = self.cache.attribs[entry];
                    continue;
                }
            }

            let attribs = &mut self.scratch_attribs[corner];
            *attribs = VertexAttributes::default();
            let vertex_in = unsafe { state.vertex_buffer.record(vertex_idx as usize * stride, stride) };
            clip[corner] = vs(vertex_in, attribs, constants);

            if use_cache {
                let attribs = self.scratch_attribs[corner];
                self.cache.insert(vertex_idx, clip[corner], &attribs);
            }
        }

        self.store_interpolation_deltas(shared, slot);

        (clip[0], clip[1], clip[2])
    }

    /// `f0 a0 + f1 a1 + f2 a2  ==  f0 (a0 - a2) + f1 (a1 - a2) + a2`:
    /// store the `(a0 - a2, a1 - a2, a2)` triple per active attribute
    /// component.
    fn store_interpolation_deltas(&self, shared: &EngineShared, slot: u32) {
        let state = unsafe { shared.state() };
        let meta = state.metadata;
        let slot = slot as usize;
        let [va0, va1, va2] = &self.scratch_attribs;

        let triple = |a0: f32, a1: f32, a2: f32| Vec3::new(a0 - a2, a1 - a2, a2);

        // Safety: this worker owns the slot during the geometry stage.
        unsafe {
            for i in 0..meta.num_vec4 {
                let (a0, a1, a2) = (va0.vec4[i], va1.vec4[i], va2.vec4[i]);
                state.setup.store_attr4_delta(i, slot, 0, triple(a0.x, a1.x, a2.x));
                state.setup.store_attr4_delta(i, slot, 1, triple(a0.y, a1.y, a2.y));
                state.setup.store_attr4_delta(i, slot, 2, triple(a0.z, a1.z, a2.z));
                state.setup.store_attr4_delta(i, slot, 3, triple(a0.w, a1.w, a2.w));
            }
            for i in 0..meta.num_vec3 {
                let (a0, a1, a2) = (va0.vec3[i], va1.vec3[i], va2.vec3[i]);
                state.setup.store_attr3_delta(i, slot, 0, triple(a0.x, a1.x, a2.x));
                state.setup.store_attr3_delta(i, slot, 1, triple(a0.y, a1.y, a2.y));
                state.setup.store_attr3_delta(i, slot, 2, triple(a0.z, a1.z, a2.z));
            }
            for i in 0..meta.num_vec2 {
                let (a0, a1, a2) = (va0.vec2[i], va1.vec2[i], va2.vec2[i]);
                state.setup.store_attr2_delta(i, slot, 0, triple(a0.x, a1.x, a2.x));
                state.setup.store_attr2_delta(i, slot, 1, triple(a0.y, a1.y, a2.y));
            }
        }
    }

    /// Reject a triangle only when all three vertices lie strictly
    /// outside the same clip plane. Triangles straddling a plane are
    /// forwarded unchanged; homogeneous rasterization needs no splitting.
    fn trivially_clipped(v0: Vec4, v1: Vec4, v2: Vec4) -> bool {
        let outside_left = v0.x < -v0.w && v1.x < -v1.w && v2.x < -v2.w;
        let outside_right = v0.x > v0.w && v1.x > v1.w && v2.x > v2.w;
        let outside_bottom = v0.y < -v0.w && v1.y < -v1.w && v2.y < -v2.w;
        let outside_top = v0.y > v0.w && v1.y > v1.w && v2.y > v2.w;
        let outside_near = v0.z < 0.0 && v1.z < 0.0 && v2.z < 0.0;
        let outside_far = v0.z > v0.w && v1.z > v1.w && v2.z > v2.w;

        outside_left
            || outside_right
            || outside_bottom
            || outside_top
            || outside_near
            || outside_far
    }

    /// Build edge coefficients from the adjoint of the device-space
    /// vertex matrix; reject degenerate and back-facing triangles.
    fn setup_and_cull(
        &self,
        shared: &EngineShared,
        slot: u32,
        v0: Vec4,
        v1: Vec4,
        v2: Vec4,
    ) -> bool {
        let state = unsafe { shared.state() };
        let width = state.framebuffer.width() as f32;
        let height = state.framebuffer.height() as f32;

        // Clip space [-w, w] to device-space 2D homogeneous coordinates
        // [0, width|height]. The w factor stays folded in; every edge and
        // basis evaluation downstream works in this homogeneous space.
        let to_homogen =
            |v: Vec4| Vec4::new(width * (v.x + v.w) * 0.5, height * (v.y + v.w) * 0.5, v.z, v.w);

        let h0 = to_homogen(v0);
        let h1 = to_homogen(v1);
        let h2 = to_homogen(v2);

        // adj(M) for M = [x0 x1 x2; y0 y1 y2; w0 w1 w2]; each row is one
        // edge's (a, b, c).
        let a0 = h2.y * h1.w - h1.y * h2.w;
        let a1 = h0.y * h2.w - h2.y * h0.w;
        let a2 = h1.y * h0.w - h0.y * h1.w;

        let b0 = h1.x * h2.w - h2.x * h1.w;
        let b1 = h2.x * h0.w - h0.x * h2.w;
        let b2 = h0.x * h1.w - h1.x * h0.w;

        let c0 = h2.x * h1.y - h1.x * h2.y;
        let c1 = h0.x * h2.y - h2.x * h0.y;
        let c2 = h1.x * h0.y - h0.x * h1.y;

        // det(M) == 0: degenerate; det(M) < 0: back-facing.
        let det = c0 * h0.w + c1 * h1.w + c2 * h2.w;
        if det <= 0.0 {
            return false;
        }

        // Safety: this worker owns the slot during the geometry stage.
        unsafe {
            state.setup.store_edges(
                slot as usize,
                [
                    Vec3::new(a0, b0, c0),
                    Vec3::new(a1, b1, c1),
                    Vec3::new(a2, b2, c2),
                ],
            );
            state
                .setup
                .store_z_deltas(slot as usize, Vec3::new(v0.z - v2.z, v1.z - v2.z, v2.z));
        }

        true
    }

    fn bin_primitive(&self, shared: &EngineShared, slot: u32, v0: Vec4, v1: Vec4, v2: Vec4) {
        self.store_state(WorkerState::Binning, Ordering::Relaxed);

        let state = unsafe { shared.state() };
        let width = state.framebuffer.width() as f32;
        let height = state.framebuffer.height() as f32;

        let mut bbox = Self::compute_bbox(v0, v1, v2, width, height);

        if bbox.min_x >= width || bbox.max_x < 0.0 || bbox.min_y >= height || bbox.max_y < 0.0 {
            // Entirely off-screen.
            return;
        }

        bbox.min_x = bbox.min_x.max(0.0);
        bbox.min_y = bbox.min_y.max(0.0);
        bbox.max_x = bbox.max_x.min(width);
        bbox.max_y = bbox.max_y.min(height);

        // Safety: this worker owns the slot during the geometry stage.
        unsafe { state.setup.store_bbox(slot as usize, bbox) };

        let ts = shared.config.tile_size as f32;
        let min_tx = (bbox.min_x / ts).floor() as u32;
        let max_tx = (bbox.max_x / ts).ceil() as u32;
        let min_ty = (bbox.min_y / ts).floor() as u32;
        let max_ty = (bbox.max_y / ts).ceil() as u32;

        debug_assert!(max_tx <= state.tiles_x && max_ty <= state.tiles_y);

        let edges = unsafe { state.setup.edges(slot as usize) };
        let origin = Vec2::new(min_tx as f32 * ts, min_ty as f32 * ts);
        let tester = HierarchyTester::new(edges, origin.x, origin.y, ts);

        for (tyy, ty) in (min_ty..max_ty).enumerate() {
            for (txx, tx) in (min_tx..max_tx).enumerate() {
                let tile_idx = shared.tile_index(tx, ty, state.tiles_x);

                match tester.classify(txx as u32, tyy as u32) {
                    Classify::TrivialReject => {}
                    Classify::TrivialAccept => {
                        trace!("worker {} tile {} trivial-accept", self.worker_idx, tile_idx);
                        // Whole tile covered: no per-pixel rasterization
                        // needed, emit a full-tile mask now.
                        shared.enqueue_tile(tile_idx);
                        shared.append_coverage(
                            self.worker_idx,
                            tile_idx,
                            CoverageMask {
                                x: (origin.x + txx as f32 * ts) as u32,
                                y: (origin.y + tyy as f32 * ts) as u32,
                                prim_slot: slot,
                                kind: CoverageMaskKind::Tile,
                                quad_mask: 0,
                            },
                        );
                    }
                    Classify::Overlap => {
                        trace!("worker {} tile {} binned", self.worker_idx, tile_idx);
                        shared.bin_primitive(self.worker_idx, tile_idx, slot);
                    }
                }
            }
        }
    }

    /// Screen bbox from the NDC-projected vertices.
    fn compute_bbox(v0: Vec4, v1: Vec4, v2: Vec4, width: f32, height: f32) -> Rect2D {
        let project = |v: Vec4| {
            let ndc = Vec2::new(v.x, v.y) / v.w;
            Vec2::new(width * (ndc.x + 1.0) * 0.5, height * (ndc.y + 1.0) * 0.5)
        };

        let r0 = project(v0);
        let r1 = project(v1);
        let r2 = project(v2);

        Rect2D {
            min_x: r0.x.min(r1.x).min(r2.x),
            min_y: r0.y.min(r1.y).min(r2.y),
            max_x: r0.x.max(r1.x).max(r2.x),
            max_y: r0.y.max(r1.y).max(r2.y),
        }
    }

    // ---- rasterization: tile -> 8x8 block -> quad ------------------------

    fn rasterize(&self, shared: &EngineShared) {
        let state = unsafe { shared.state() };
        let num_workers = shared.config.num_workers;

        loop {
            let tile_idx = state.queue.fetch_next();
            if tile_idx == INVALID_TILE {
                break;
            }
            trace!("worker {} rasterizing tile {}", self.worker_idx, tile_idx);

            debug_assert!(
                state.tiles[tile_idx as usize].queued.load(Ordering::Relaxed),
                "tile fetched from queue without being flagged"
            );

            // Replay peers' bins in ascending worker index, primitives in
            // insertion order; contiguous ascending slices make this the
            // submission order.
            for peer in 0..num_workers {
                // Safety: bins are frozen after the post-binning barrier.
                let bin =
                    unsafe { state.bins[tile_idx as usize * num_workers + peer].as_ref() };
                for &slot in bin.iter() {
                    self.rasterize_primitive(shared, tile_idx, slot);
                }
            }
        }
    }

    fn rasterize_primitive(&self, shared: &EngineShared, tile_idx: u32, slot: u32) {
        let state = unsafe { shared.state() };
        let tile = &state.tiles[tile_idx as usize];
        let ts = shared.config.tile_size as f32;

        let tile_rect = Rect2D {
            min_x: tile.x,
            min_y: tile.y,
            max_x: tile.x + ts,
            max_y: tile.y + ts,
        };

        // Safety: setup slots are read-only after the post-binning barrier.
        let bbox = unsafe { state.setup.bbox(slot as usize) }.intersect(&tile_rect);
        debug_assert!(bbox.min_x <= bbox.max_x && bbox.min_y <= bbox.max_y);

        let bs = PIXEL_BLOCK_SIZE as f32;
        let min_bx = ((bbox.min_x - tile.x) / bs).floor() as u32;
        let max_bx = ((bbox.max_x - tile.x) / bs).ceil() as u32;
        let min_by = ((bbox.min_y - tile.y) / bs).floor() as u32;
        let max_by = ((bbox.max_y - tile.y) / bs).ceil() as u32;

        let edges = unsafe { state.setup.edges(slot as usize) };
        let first_block = Vec2::new(tile.x + min_bx as f32 * bs, tile.y + min_by as f32 * bs);
        let tester = HierarchyTester::new(edges, first_block.x, first_block.y, bs);

        for byy in 0..(max_by - min_by) {
            for bxx in 0..(max_bx - min_bx) {
                let block_x = first_block.x + bxx as f32 * bs;
                let block_y = first_block.y + byy as f32 * bs;

                match tester.classify(bxx, byy) {
                    Classify::TrivialReject => {}
                    Classify::TrivialAccept => {
                        // Whole block inside: one mask covers 64 samples.
                        shared.append_coverage(
                            self.worker_idx,
                            tile_idx,
                            CoverageMask {
                                x: block_x as u32,
                                y: block_y as u32,
                                prim_slot: slot,
                                kind: CoverageMaskKind::Block,
                                quad_mask: 0,
                            },
                        );
                    }
                    Classify::Overlap => {
                        self.rasterize_block_quads(
                            shared, tile_idx, slot, &edges, block_x, block_y,
                        );
                    }
                }
            }
        }
    }

    /// Descend an overlapping block to quad granularity: a 4-wide edge
    /// test per row half, emitting a mask whenever any sample is inside.
    fn rasterize_block_quads(
        &self,
        shared: &EngineShared,
        tile_idx: u32,
        slot: u32,
        edges: &[Vec3; 3],
        block_x: f32,
        block_y: f32,
    ) {
        let tiebreak = shared.config.shared_edge_tiebreak;

        for py in 0..PIXEL_BLOCK_SIZE {
            let y = block_y + py as f32;
            for qx in 0..EDGE_TESTS_PER_ROW {
                let x = block_x + (qx * SIMD_WIDTH) as f32;
                let mask = quad::edge_quad_mask(edges, x, y, tiebreak);
                if mask != 0 {
                    shared.append_coverage(
                        self.worker_idx,
                        tile_idx,
                        CoverageMask {
                            x: x as u32,
                            y: y as u32,
                            prim_slot: slot,
                            kind: CoverageMaskKind::Quad,
                            quad_mask: mask,
                        },
                    );
                }
            }
        }
    }

    // ---- fragment shading ------------------------------------------------

    fn fragment_shade(&self, shared: &EngineShared) {
        let state = unsafe { shared.state() };
        let num_workers = shared.config.num_workers;

        loop {
            let tile_idx = state.queue.remove_next();
            if tile_idx == INVALID_TILE {
                break;
            }
            trace!("worker {} fragment-shading tile {}", self.worker_idx, tile_idx);

            for peer in 0..num_workers {
                // Safety: coverage logs are frozen after the post-raster
                // barrier.
                let masks =
                    unsafe { state.coverage[tile_idx as usize * num_workers + peer].as_ref() };
                for mask in masks.iter() {
                    match mask.kind {
                        CoverageMaskKind::Tile => self.shade_tile(shared, mask),
                        CoverageMaskKind::Block => {
                            self.shade_block(shared, mask.x, mask.y, mask.prim_slot)
                        }
                        CoverageMaskKind::Quad => self.shade_quad(
                            shared,
                            mask.x,
                            mask.y,
                            mask.prim_slot,
                            mask.quad_mask,
                        ),
                    }
                }
            }
        }
    }

    fn shade_tile(&self, shared: &EngineShared, mask: &CoverageMask) {
        let state = unsafe { shared.state() };
        let width = state.framebuffer.width();
        let height = state.framebuffer.height();
        let blocks = shared.config.blocks_per_tile_edge();

        for by in 0..blocks {
            let y = mask.y + by * PIXEL_BLOCK_SIZE;
            if y >= height {
                break;
            }
            for bx in 0..blocks {
                let x = mask.x + bx * PIXEL_BLOCK_SIZE;
                if x >= width {
                    break;
                }
                self.shade_block(shared, x, y, mask.prim_slot);
            }
        }
    }

    fn shade_block(&self, shared: &EngineShared, block_x: u32, block_y: u32, slot: u32) {
        for py in 0..PIXEL_BLOCK_SIZE {
            for qx in 0..EDGE_TESTS_PER_ROW {
                self.shade_quad(
                    shared,
                    block_x + qx * SIMD_WIDTH,
                    block_y + py,
                    slot,
                    0xF,
                );
            }
        }
    }

    /// Interpolate, depth-test and shade one quad, writing back under the
    /// combined depth & coverage mask.
    fn shade_quad(&self, shared: &EngineShared, x: u32, y: u32, slot: u32, coverage: u8) {
        let state = unsafe { shared.state() };
        let fb = &state.framebuffer;

        let edges = unsafe { state.setup.edges(slot as usize) };
        let (f0, f1) = quad::basis_functions(&edges, x as f32, y as f32);

        let z_deltas = unsafe { state.setup.z_deltas(slot as usize) };
        let z = quad::interpolate(z_deltas, &f0, &f1);

        // Safety: the quad lies inside this worker's tile; no other
        // worker owns these pixels during fragment shading.
        let depth_ptr = unsafe { fb.depth_quad_ptr(x, y) };
        let mut current = [0.0f32; 4];
        unsafe { std::ptr::copy_nonoverlapping(depth_ptr, current.as_mut_ptr(), 4) };

        let depth_mask = quad::depth_le_mask(&z, &current);
        if depth_mask == 0 {
            // Nothing survives the depth test, skip the shader entirely.
            return;
        }

        let attribs = self.interpolate_attributes(shared, slot, &f0, &f1);

        let fs = state.fragment_shader.expect("fragment shader bound");
        let constants = unsafe { state.constant_buffer.bytes() };
        let mut output = Default::default();
        fs(&attribs, constants, &mut output);

        let write_mask = depth_mask & coverage;

        let color_ptr = unsafe { fb.color_quad_ptr(x, y) };
        for lane in 0..4u32 {
            if write_mask & (1 << lane) != 0 {
                unsafe {
                    *depth_ptr.add(lane as usize) = z[lane as usize];
                    let rgba =
                        crate::framebuffer::pack_unorm8(output.colors[lane as usize]);
                    std::ptr::copy_nonoverlapping(
                        rgba.as_ptr(),
                        color_ptr.add(lane as usize * 4),
                        4,
                    );
                }
            }
        }
    }

    fn interpolate_attributes(
        &self,
        shared: &EngineShared,
        slot: u32,
        f0: &[f32; 4],
        f1: &[f32; 4],
    ) -> InterpolatedAttributes {
        let state = unsafe { shared.state() };
        let meta = state.metadata;
        let setup = &state.setup;
        let slot = slot as usize;

        let mut out = InterpolatedAttributes::default();

        // Safety: setup slots are read-only during fragment shading.
        unsafe {
            for i in 0..meta.num_vec4 {
                out.vec4[i].x = quad::interpolate(setup.attr4_delta(i, slot, 0), f0, f1);
                out.vec4[i].y = quad::interpolate(setup.attr4_delta(i, slot, 1), f0, f1);
                out.vec4[i].z = quad::interpolate(setup.attr4_delta(i, slot, 2), f0, f1);
                out.vec4[i].w = quad::interpolate(setup.attr4_delta(i, slot, 3), f0, f1);
            }
            for i in 0..meta.num_vec3 {
                out.vec3[i].x = quad::interpolate(setup.attr3_delta(i, slot, 0), f0, f1);
                out.vec3[i].y = quad::interpolate(setup.attr3_delta(i, slot, 1), f0, f1);
                out.vec3[i].z = quad::interpolate(setup.attr3_delta(i, slot, 2), f0, f1);
            }
            for i in 0..meta.num_vec2 {
                out.vec2[i].x = quad::interpolate(setup.attr2_delta(i, slot, 0), f0, f1);
                out.vec2[i].y = quad::interpolate(setup.attr2_delta(i, slot, 1), f0, f1);
            }
        }

        out
    }
}
