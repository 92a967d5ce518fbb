//! Fixed-capacity tile allocator.
//!
//! A stack of free tile indices. `allocate` pops, `free` pushes; both are O(1).
//! The stack starts with every tile free and is ordered so that tile 0 is
//! issued first. Running dry is not an error: callers spawn fewer particles.

/// Free-list allocator over the tiles of one atlas.
#[derive(Debug, Clone)]
pub struct TileAllocator {
    free_tiles: Vec<u32>,
    capacity: u32,
    limit: Option<u32>,
}

impl TileAllocator {
    /// Create an allocator with `capacity` tiles, all free.
    pub fn new(capacity: u32) -> Self {
        Self {
            free_tiles: (0..capacity).rev().collect(),
            capacity,
            limit: None,
        }
    }

    /// Total number of tiles managed.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tiles currently on the free stack.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.free_tiles.len() as u32
    }

    /// Tiles currently issued to callers.
    #[inline]
    pub fn allocated_count(&self) -> u32 {
        self.capacity - self.free_count()
    }

    /// Tiles that can still be issued under the current limit.
    pub fn available(&self) -> u32 {
        let cap = self.limit.map_or(self.capacity, |l| l.min(self.capacity));
        cap.saturating_sub(self.allocated_count()).min(self.free_count())
    }

    /// Cap the number of simultaneously issued tiles.
    ///
    /// Lowering the limit below the current allocation does not revoke tiles;
    /// it only stops new ones from being issued until enough are freed.
    pub fn set_tile_limit(&mut self, limit: Option<u32>) {
        self.limit = limit;
    }

    /// Current tile limit, if any.
    pub fn tile_limit(&self) -> Option<u32> {
        self.limit
    }

    /// Issue a free tile, or `None` when the atlas (or the limit) is exhausted.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.available() == 0 {
            return None;
        }
        self.free_tiles.pop()
    }

    /// Return a tile to the free stack.
    ///
    /// Freeing an out-of-range index, or freeing into a full stack (which can
    /// only happen on a double free), is a caller bug.
    pub fn free(&mut self, tile: u32) {
        debug_assert!(tile < self.capacity, "freeing tile {} outside atlas", tile);
        debug_assert!(
            self.free_tiles.len() < self.capacity as usize,
            "freeing tile {} into a full free list",
            tile
        );
        debug_assert!(!self.free_tiles.contains(&tile), "double free of tile {}", tile);
        if tile < self.capacity && self.free_tiles.len() < self.capacity as usize {
            self.free_tiles.push(tile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    #[test]
    fn test_issues_tile_zero_first() {
        let mut alloc = TileAllocator::new(8);
        assert_eq!(alloc.allocate(), Some(0));
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocated_count(), 2);
        assert_eq!(alloc.free_count(), 6);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut alloc = TileAllocator::new(3);
        for _ in 0..3 {
            assert!(alloc.allocate().is_some());
        }
        assert_eq!(alloc.allocate(), None);
        alloc.free(1);
        assert_eq!(alloc.allocate(), Some(1));
    }

    #[test]
    fn test_limit_caps_issue_without_revoking() {
        let mut alloc = TileAllocator::new(10);
        for _ in 0..4 {
            alloc.allocate();
        }
        alloc.set_tile_limit(Some(2));
        assert_eq!(alloc.allocated_count(), 4);
        assert_eq!(alloc.allocate(), None);

        alloc.free(0);
        alloc.free(1);
        alloc.free(2);
        assert_eq!(alloc.available(), 1);
        assert!(alloc.allocate().is_some());
        assert_eq!(alloc.allocate(), None);

        alloc.set_tile_limit(None);
        assert_eq!(alloc.available(), 8);
    }

    #[test]
    fn test_random_sequences_never_double_issue() {
        let mut rng = SmallRng::seed_from_u64(0x7115);
        for capacity in [1u32, 7, 64] {
            let mut alloc = TileAllocator::new(capacity);
            let mut held: Vec<u32> = Vec::new();
            let mut held_set = HashSet::new();

            for _ in 0..2000 {
                if rng.gen_bool(0.55) {
                    match alloc.allocate() {
                        Some(tile) => {
                            assert!(tile < capacity);
                            assert!(held_set.insert(tile), "tile {} issued while held", tile);
                            held.push(tile);
                        }
                        None => assert_eq!(held.len() as u32, capacity),
                    }
                } else if !held.is_empty() {
                    let idx = rng.gen_range(0..held.len());
                    let tile = held.swap_remove(idx);
                    held_set.remove(&tile);
                    alloc.free(tile);
                }
                assert_eq!(alloc.allocated_count() as usize, held.len());
            }
        }
    }
}
