//! Coverage masks and their per-(tile, worker) append logs.
//!
//! The rasterization hierarchy emits one record per covered unit: a whole
//! tile (trivial accept at binning time), a whole 8x8 block, or a 4-pixel
//! quad with its per-sample bitmask. Fragment shading replays the records
//! later, so the buffer is append-only within an iteration and its reset
//! keeps the chunk allocations alive for reuse by the next iteration.

/// Granularity of one coverage record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoverageMaskKind {
    /// Entire tile covered; origin is the tile origin.
    Tile,
    /// Entire 8x8 block covered; origin is the block origin.
    Block,
    /// One row of four pixels; `quad_mask` holds the per-sample bits.
    Quad,
}

/// One unit of coverage emitted by the rasterizer for one primitive.
#[derive(Clone, Copy, Debug)]
pub struct CoverageMask {
    pub x: u32,
    pub y: u32,
    /// Primitive slot id within the current draw iteration.
    pub prim_slot: u32,
    pub kind: CoverageMaskKind,
    /// Low four bits: sample x+0 .. x+3. Meaningful for `Quad` only.
    pub quad_mask: u8,
}

/// Records per allocation chunk. Chunks are recycled across iterations.
const CHUNK_CAPACITY: usize = 1024;

/// Chunked append log of coverage masks for one (tile, worker) cell.
#[derive(Default)]
pub(crate) struct CoverageMaskBuffer {
    chunks: Vec<Vec<CoverageMask>>,
    /// Chunk currently being appended to; chunks before it are full.
    cursor: usize,
}

impl CoverageMaskBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&mut self, mask: CoverageMask) {
        if self.cursor == self.chunks.len() {
            self.chunks.push(Vec::with_capacity(CHUNK_CAPACITY));
        }
        if self.chunks[self.cursor].len() == CHUNK_CAPACITY {
            self.cursor += 1;
            if self.cursor == self.chunks.len() {
                self.chunks.push(Vec::with_capacity(CHUNK_CAPACITY));
            }
        }
        self.chunks[self.cursor].push(mask);
    }

    /// Replay all records in insertion order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &CoverageMask> {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }

    /// Drop the contents but keep every chunk allocation.
    pub(crate) fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.clear();
        }
        self.cursor = 0;
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }
}
