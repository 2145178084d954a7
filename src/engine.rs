//! Render engine: owner of the shared pipeline tables and driver of the
//! draw iteration protocol.
//!
//! The engine spawns one long-lived worker thread per configured worker
//! and coordinates them purely through per-worker state atomics. A draw
//! call is sliced into iterations of at most `max_iteration_prims`
//! primitives; within an iteration each worker owns a contiguous slice of
//! the primitive range, which is what makes the per-worker bin and
//! coverage columns replayable in submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use glam::Vec4;
use log::debug;

use crate::config::RasterizerConfig;
use crate::coverage::{CoverageMask, CoverageMaskBuffer};
use crate::framebuffer::Framebuffer;
use crate::queue::RasterizerQueue;
use crate::setup::SetupBuffers;
use crate::shader::{
    ConstantBufferView, FragmentShader, IndexBufferView, ShaderMetadata, VertexBufferView,
    VertexShader,
};
use crate::sync::SharedCell;
use crate::worker::{self, DrawParams, WorkerSlot, WorkerState};

/// One screen tile: origin plus the single-insertion flag for the
/// rasterizer queue.
pub(crate) struct Tile {
    pub(crate) x: f32,
    pub(crate) y: f32,
    pub(crate) queued: AtomicBool,
}

/// Bindings and tables shared with the worker threads.
///
/// Mutable access follows the pipeline protocol: the main thread mutates
/// only while every worker is `Idle`; during a draw the workers write
/// through the interior cells under the partitioning rules documented on
/// each table.
pub(crate) struct RenderState {
    pub(crate) framebuffer: Framebuffer,
    pub(crate) vertex_buffer: VertexBufferView,
    pub(crate) index_buffer: Option<IndexBufferView>,
    pub(crate) constant_buffer: ConstantBufferView,
    pub(crate) vertex_shader: Option<VertexShader>,
    pub(crate) fragment_shader: Option<FragmentShader>,
    pub(crate) metadata: ShaderMetadata,
    pub(crate) vertex_stride: u32,
    /// Tile grid; rebuilt when the render target dimensions change.
    pub(crate) tiles: Vec<Tile>,
    pub(crate) tiles_x: u32,
    pub(crate) tiles_y: u32,
    /// Per-(tile, worker) primitive bins, indexed `tile * workers + worker`.
    /// Each cell is written only by its worker during binning and read by
    /// all workers after the post-binning barrier.
    pub(crate) bins: Vec<SharedCell<Vec<u32>>>,
    /// Per-(tile, worker) coverage logs, same indexing and the analogous
    /// single-writer rule around the post-raster barrier.
    pub(crate) coverage: Vec<SharedCell<CoverageMaskBuffer>>,
    pub(crate) setup: SetupBuffers,
    pub(crate) queue: RasterizerQueue,
}

impl RenderState {
    fn new(config: &RasterizerConfig) -> Self {
        Self {
            framebuffer: Framebuffer::unbound(),
            vertex_buffer: VertexBufferView::empty(),
            index_buffer: None,
            constant_buffer: ConstantBufferView::empty(),
            vertex_shader: None,
            fragment_shader: None,
            metadata: ShaderMetadata::default(),
            vertex_stride: 0,
            tiles: Vec::new(),
            tiles_x: 0,
            tiles_y: 0,
            bins: Vec::new(),
            coverage: Vec::new(),
            setup: SetupBuffers::new(config.max_iteration_prims),
            queue: RasterizerQueue::with_capacity(config.num_workers),
        }
    }
}

pub(crate) struct EngineShared {
    pub(crate) config: RasterizerConfig,
    pub(crate) workers: Vec<WorkerSlot>,
    state: SharedCell<RenderState>,
}

// The raw-pointer views inside RenderState cross to the workers; their
// validity is the callers' contract and the tables' exclusion is the
// pipeline protocol.
unsafe impl Sync for EngineShared {}

impl EngineShared {
    /// Shared view of the bindings and tables.
    ///
    /// # Safety
    /// Callers must be on a path where no thread holds the exclusive view:
    /// any worker stage, or the main thread outside `state_mut` sections.
    #[inline]
    pub(crate) unsafe fn state(&self) -> &RenderState {
        self.state.as_ref()
    }

    /// Exclusive view for the main thread.
    ///
    /// # Safety
    /// Every worker must be `Idle` (quiescent between draw iterations).
    #[inline]
    unsafe fn state_mut(&self) -> &mut RenderState {
        debug_assert!(self.all_workers_idle());
        self.state.as_mut()
    }

    fn all_workers_idle(&self) -> bool {
        self.workers
            .iter()
            .all(|w| w.state.load(Ordering::Acquire) == WorkerState::Idle as u32)
    }

    #[inline]
    pub(crate) fn tile_index(&self, tx: u32, ty: u32, tiles_x: u32) -> u32 {
        ty * tiles_x + tx
    }

    /// Test-and-set the tile's queued flag; first caller appends the tile
    /// to the rasterizer queue. Guarantees at most one insertion per tile
    /// per iteration regardless of how many workers classify it.
    pub(crate) fn enqueue_tile(&self, tile_idx: u32) {
        let state = unsafe { self.state() };
        let tile = &state.tiles[tile_idx as usize];
        if !tile.queued.swap(true, Ordering::AcqRel) {
            state.queue.insert(tile_idx);
        }
    }

    /// Append `prim_slot` to the (tile, worker) bin. The first append for
    /// the cell also enqueues the tile, so a tile reached only through
    /// overlap classifications is still queued exactly once.
    pub(crate) fn bin_primitive(&self, worker_idx: usize, tile_idx: u32, prim_slot: u32) {
        let state = unsafe { self.state() };
        let cell = &state.bins[tile_idx as usize * self.config.num_workers + worker_idx];
        // Safety: cell (tile, worker_idx) is written only by worker_idx
        // during the binning stage.
        let bin = unsafe { cell.as_mut() };

        if bin.is_empty() {
            self.enqueue_tile(tile_idx);
        }

        let capacity = bin.capacity();
        bin.push(prim_slot);
        // Bin vectors must never reallocate mid-iteration: readers hold
        // references across threads.
        debug_assert_eq!(bin.capacity(), capacity, "bin vector grew during a draw iteration");
    }

    pub(crate) fn append_coverage(&self, worker_idx: usize, tile_idx: u32, mask: CoverageMask) {
        let state = unsafe { self.state() };
        let cell = &state.coverage[tile_idx as usize * self.config.num_workers + worker_idx];
        // Safety: cell (tile, worker_idx) is written only by worker_idx
        // during the current stage (binning emits trivial-accept tile
        // masks, rasterization emits block/quad masks).
        unsafe { cell.as_mut() }.append(mask);
    }

    /// Post-binning barrier. Called by each worker after it stores
    /// `PostBinner`: the wait itself advances peers via CAS, so progress
    /// is made by whichever thread observes the transition first.
    pub(crate) fn wait_binning_complete(&self) {
        self.advance_peers(WorkerState::PostBinner, WorkerState::Raster);
    }

    /// Post-raster barrier, `PostRaster -> Fragment`, same protocol.
    pub(crate) fn wait_raster_complete(&self) {
        self.advance_peers(WorkerState::PostRaster, WorkerState::Fragment);
    }

    fn advance_peers(&self, from: WorkerState, to: WorkerState) {
        loop {
            let mut complete = true;
            for slot in &self.workers {
                let advanced = match slot.state.compare_exchange(
                    from as u32,
                    to as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => true,
                    Err(observed) => observed >= to as u32,
                };
                complete &= advanced;
            }
            if complete {
                return;
            }
            thread::yield_now();
        }
    }
}

/// Tile-based parallel rasterizer.
///
/// Owns the worker threads and every shared table; callers bind buffers
/// and shaders, then issue indexed triangle-list draws.
pub struct RenderEngine {
    shared: Arc<EngineShared>,
    threads: Vec<JoinHandle<()>>,
}

impl RenderEngine {
    pub fn new(config: RasterizerConfig) -> Self {
        config.validate();

        let shared = Arc::new(EngineShared {
            workers: (0..config.num_workers).map(|_| WorkerSlot::new()).collect(),
            state: SharedCell::new(RenderState::new(&config)),
            config,
        });

        let threads = (0..config.num_workers)
            .map(|idx| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("raster-worker-{idx}"))
                    .spawn(move || worker::run(shared, idx))
                    .expect("failed to spawn pipeline worker")
            })
            .collect();

        Self { shared, threads }
    }

    /// Fill the bound render targets.
    pub fn clear_render_targets(
        &mut self,
        clear_color: bool,
        color: Vec4,
        clear_depth: bool,
        depth: f32,
    ) {
        let state = unsafe { self.shared.state_mut() };
        assert!(state.framebuffer.is_bound(), "no render targets bound");
        state.framebuffer.clear(clear_color, color, clear_depth, depth);
    }

    /// Bind render targets, rebuilding the tile grid, bins, coverage
    /// tables and rasterizer queue if the dimensions changed.
    pub fn set_render_targets(&mut self, framebuffer: Framebuffer) {
        // Fragment shading writes whole quads and blocks; block-aligned
        // targets keep every emitted sample inside the buffers.
        assert!(
            framebuffer.width() % crate::config::PIXEL_BLOCK_SIZE == 0
                && framebuffer.height() % crate::config::PIXEL_BLOCK_SIZE == 0,
            "render target dimensions must be multiples of {}",
            crate::config::PIXEL_BLOCK_SIZE
        );

        let config = self.shared.config;
        let state = unsafe { self.shared.state_mut() };

        let resized = framebuffer.width() != state.framebuffer.width()
            || framebuffer.height() != state.framebuffer.height();
        state.framebuffer = framebuffer;
        if !resized {
            return;
        }

        let ts = config.tile_size;
        let tiles_x = state.framebuffer.width().div_ceil(ts);
        let tiles_y = state.framebuffer.height().div_ceil(ts);
        let tile_count = (tiles_x * tiles_y) as usize;

        state.tiles_x = tiles_x;
        state.tiles_y = tiles_y;
        state.tiles = (0..tiles_y)
            .flat_map(|ty| {
                (0..tiles_x).map(move |tx| Tile {
                    x: (tx * ts) as f32,
                    y: (ty * ts) as f32,
                    queued: AtomicBool::new(false),
                })
            })
            .collect();

        // A worker's slice holds at most ceil(M / N) + (N - 1) primitives
        // (the last worker absorbs the iteration remainder), so this
        // reserve keeps bin pushes reallocation-free.
        let bin_capacity =
            config.max_iteration_prims / config.num_workers + config.num_workers;
        state.bins = (0..tile_count * config.num_workers)
            .map(|_| SharedCell::new(Vec::with_capacity(bin_capacity)))
            .collect();

        state.coverage = (0..tile_count * config.num_workers)
            .map(|_| SharedCell::new(CoverageMaskBuffer::new()))
            .collect();

        state.queue = RasterizerQueue::with_capacity(tile_count + config.num_workers);
    }

    pub fn set_vertex_buffer(&mut self, view: VertexBufferView) {
        unsafe { self.shared.state_mut() }.vertex_buffer = view;
    }

    pub fn set_index_buffer(&mut self, view: IndexBufferView) {
        unsafe { self.shared.state_mut() }.index_buffer = Some(view);
    }

    pub fn set_constant_buffer(&mut self, view: ConstantBufferView) {
        unsafe { self.shared.state_mut() }.constant_buffer = view;
    }

    pub fn set_vertex_shader(&mut self, shader: VertexShader) {
        unsafe { self.shared.state_mut() }.vertex_shader = Some(shader);
    }

    pub fn set_fragment_shader(&mut self, shader: FragmentShader) {
        unsafe { self.shared.state_mut() }.fragment_shader = Some(shader);
    }

    pub fn set_shader_metadata(&mut self, metadata: ShaderMetadata) {
        metadata.validate();
        unsafe { self.shared.state_mut() }.metadata = metadata;
    }

    pub fn set_vertex_input_stride(&mut self, bytes: u32) {
        assert!(bytes > 0, "vertex input stride must be nonzero");
        unsafe { self.shared.state_mut() }.vertex_stride = bytes;
    }

    /// Draw `prim_count` triangles from the bound index buffer, starting
    /// at `vertex_offset` indices in. Blocks until every pixel is written.
    pub fn draw(&mut self, prim_count: u32, vertex_offset: u32, indexed: bool) {
        assert!(indexed, "only indexed triangle lists are supported");

        {
            let state = unsafe { self.shared.state() };
            assert!(state.framebuffer.is_bound(), "no render targets bound");
            assert!(state.vertex_shader.is_some(), "no vertex shader bound");
            assert!(state.fragment_shader.is_some(), "no fragment shader bound");
            assert!(state.index_buffer.is_some(), "no index buffer bound");
            assert!(state.vertex_stride > 0, "vertex input stride not set");
        }

        if prim_count == 0 {
            return;
        }

        let num_workers = self.shared.config.num_workers as u32;
        let max_iter = self.shared.config.max_iteration_prims as u32;

        let mut remaining = prim_count;
        let mut cursor = 0u32;
        let mut iteration = 0u32;

        while remaining > 0 {
            self.prepare_iteration();

            let iter_size = remaining.min(max_iter);
            let per_worker = iter_size / num_workers;
            let remainder = iter_size % num_workers;

            let mut start = cursor;
            for (idx, slot) in self.shared.workers.iter().enumerate() {
                let count = if idx as u32 == num_workers - 1 {
                    per_worker + remainder
                } else {
                    per_worker
                };
                let end = start + count;
                debug_assert!(end <= prim_count);
                debug_assert_eq!(slot.state.load(Ordering::Acquire), WorkerState::Idle as u32);

                debug!(
                    "worker {} iteration {}: prims [{}, {})",
                    idx, iteration, start, end
                );

                // Safety: the worker is Idle; the release store below
                // publishes the params before it can read them.
                unsafe {
                    slot.params.write(DrawParams {
                        start,
                        end,
                        iter_base: cursor,
                        vertex_offset,
                        reset_vertex_cache: iteration == 0,
                    });
                }
                slot.state
                    .store(WorkerState::DrawcallTop as u32, Ordering::Release);

                start = end;
            }

            self.wait_drawcall_complete();

            cursor += iter_size;
            remaining -= iter_size;
            debug!("draw iteration {} complete", iteration);
            iteration += 1;
        }
    }

    /// Tiles appended to the rasterizer queue during the most recent draw
    /// iteration.
    pub fn queued_tile_count(&self) -> u32 {
        unsafe { self.shared.state() }.queue.inserted()
    }

    fn prepare_iteration(&mut self) {
        let state = unsafe { self.shared.state_mut() };

        for tile in &state.tiles {
            tile.queued.store(false, Ordering::Relaxed);
        }
        for cell in &state.bins {
            unsafe { cell.as_mut() }.clear();
        }
        for cell in &state.coverage {
            unsafe { cell.as_mut() }.reset();
        }
        state.queue.reset();
    }

    /// Spin-yield until every worker reaches the bottom of the draw
    /// iteration, then park them all back to `Idle`.
    fn wait_drawcall_complete(&self) {
        loop {
            let done = self
                .shared
                .workers
                .iter()
                .all(|w| w.state.load(Ordering::Acquire) == WorkerState::Bottom as u32);
            if done {
                break;
            }
            thread::yield_now();
        }

        for slot in &self.shared.workers {
            slot.state.store(WorkerState::Idle as u32, Ordering::Release);
        }
    }
}

impl Drop for RenderEngine {
    fn drop(&mut self) {
        for slot in &self.shared.workers {
            slot.state
                .store(WorkerState::Terminated as u32, Ordering::Release);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
