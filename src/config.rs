//! Rasterizer configuration.

/// Fixed 8x8 pixel block, the second level of the rasterization hierarchy.
pub const PIXEL_BLOCK_SIZE: u32 = 8;

/// Four horizontally adjacent pixels form one SIMD rasterization unit.
pub const SIMD_WIDTH: u32 = 4;

/// Edge-test batches per 8-pixel block row.
pub const EDGE_TESTS_PER_ROW: u32 = PIXEL_BLOCK_SIZE / SIMD_WIDTH;

/// Per-width-class cap on active vertex attributes (vec4 / vec3 / vec2).
pub const MAX_VERTEX_ATTRIBUTES: usize = 4;

/// Entries in the per-worker direct-lookup vertex cache.
pub const VERTEX_CACHE_CAPACITY: usize = 16;

/// Immutable engine configuration, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct RasterizerConfig {
    /// Screen tile edge length in pixels. Power of two, at least one
    /// 8x8 block.
    pub tile_size: u32,
    /// Number of pipeline worker threads.
    pub num_workers: usize,
    /// Upper bound on primitives processed per draw iteration. All
    /// slot-addressed scratch is preallocated to this size.
    pub max_iteration_prims: usize,
    /// Look up vertices in the per-worker cache before invoking the
    /// vertex shader.
    pub vertex_cache: bool,
    /// Apply the top-left fill rule on exact edge hits so triangles
    /// sharing an edge never double-shade a pixel.
    pub shared_edge_tiebreak: bool,
}

impl Default for RasterizerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            tile_size: 64,
            num_workers: workers,
            max_iteration_prims: 2048,
            vertex_cache: true,
            shared_edge_tiebreak: true,
        }
    }
}

impl RasterizerConfig {
    /// Panics on configurations the pipeline cannot run with.
    pub(crate) fn validate(&self) {
        assert!(
            self.tile_size.is_power_of_two() && self.tile_size >= PIXEL_BLOCK_SIZE,
            "tile size must be a power of two and hold at least one {}x{} block, got {}",
            PIXEL_BLOCK_SIZE,
            PIXEL_BLOCK_SIZE,
            self.tile_size
        );
        assert!(self.num_workers > 0, "at least one pipeline worker required");
        assert!(
            self.max_iteration_prims > 0,
            "draw iteration size must be nonzero"
        );
    }

    /// Blocks along one tile edge.
    #[inline]
    pub(crate) fn blocks_per_tile_edge(&self) -> u32 {
        self.tile_size / PIXEL_BLOCK_SIZE
    }
}
