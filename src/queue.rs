//! Single-producer-set, twice-consumed tile queue.
//!
//! Tiles are appended once during binning (producers are serialized by the
//! per-tile queued flag, the append itself is a fetch-add) and then drained
//! twice in insertion order: once by the rasterization stage and once by
//! the fragment-shading stage. Keeping two independent read cursors lets
//! both stages walk the same contents without rebuilding the queue.

use std::sync::atomic::{AtomicU32, Ordering};

/// Sentinel returned when a consumer runs past the produced range.
pub const INVALID_TILE: u32 = u32::MAX;

pub(crate) struct RasterizerQueue {
    slots: Vec<AtomicU32>,
    insert: AtomicU32,
    fetch: AtomicU32,
    remove: AtomicU32,
}

impl RasterizerQueue {
    /// `capacity` must include overrun space (tile count + worker count):
    /// every worker may advance a read cursor one slot past the produced
    /// range before it observes the sentinel and stops.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| AtomicU32::new(INVALID_TILE)).collect(),
            insert: AtomicU32::new(0),
            fetch: AtomicU32::new(0),
            remove: AtomicU32::new(0),
        }
    }

    /// Append a tile index. Callers guarantee single insertion per tile
    /// per iteration via the tile queued flag.
    pub(crate) fn insert(&self, tile_idx: u32) {
        let slot = self.insert.fetch_add(1, Ordering::AcqRel) as usize;
        debug_assert!(slot < self.slots.len(), "rasterizer queue overflow");
        self.slots[slot].store(tile_idx, Ordering::Release);
    }

    /// Pop for the rasterization stage; `INVALID_TILE` once drained.
    pub(crate) fn fetch_next(&self) -> u32 {
        self.consume(&self.fetch)
    }

    /// Pop for the fragment-shading stage; same order, same termination.
    pub(crate) fn remove_next(&self) -> u32 {
        self.consume(&self.remove)
    }

    #[inline]
    fn consume(&self, cursor: &AtomicU32) -> u32 {
        let idx = cursor.fetch_add(1, Ordering::AcqRel);
        if idx < self.insert.load(Ordering::Acquire) {
            self.slots[idx as usize].load(Ordering::Acquire)
        } else {
            INVALID_TILE
        }
    }

    /// Number of tiles appended since the last reset.
    pub(crate) fn inserted(&self) -> u32 {
        self.insert.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.insert.store(0, Ordering::Release);
        self.fetch.store(0, Ordering::Release);
        self.remove.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_twice_in_insertion_order() {
        let queue = RasterizerQueue::with_capacity(8 + 2);
        for tile in [3, 1, 4, 1, 5] {
            queue.insert(tile);
        }

        let fetched: Vec<u32> = std::iter::from_fn(|| match queue.fetch_next() {
            INVALID_TILE => None,
            t => Some(t),
        })
        .collect();
        assert_eq!(fetched, vec![3, 1, 4, 1, 5]);

        let removed: Vec<u32> = std::iter::from_fn(|| match queue.remove_next() {
            INVALID_TILE => None,
            t => Some(t),
        })
        .collect();
        assert_eq!(removed, fetched);
    }

    #[test]
    fn empty_queue_yields_sentinel() {
        let queue = RasterizerQueue::with_capacity(4);
        assert_eq!(queue.fetch_next(), INVALID_TILE);
        assert_eq!(queue.remove_next(), INVALID_TILE);
    }

    #[test]
    fn reset_restarts_all_cursors() {
        let queue = RasterizerQueue::with_capacity(6);
        queue.insert(9);
        assert_eq!(queue.fetch_next(), 9);
        assert_eq!(queue.inserted(), 1);

        queue.reset();
        assert_eq!(queue.inserted(), 0);
        assert_eq!(queue.fetch_next(), INVALID_TILE);

        queue.insert(2);
        assert_eq!(queue.fetch_next(), 2);
        assert_eq!(queue.remove_next(), 2);
    }

    #[test]
    fn overrun_attempts_keep_returning_sentinel() {
        let queue = RasterizerQueue::with_capacity(2 + 2);
        queue.insert(0);
        assert_eq!(queue.fetch_next(), 0);
        // Two racing workers can each overshoot once at the tail.
        assert_eq!(queue.fetch_next(), INVALID_TILE);
        assert_eq!(queue.fetch_next(), INVALID_TILE);
    }
}
