//! Bump allocator for per-tile element payloads.
//!
//! Allocations are never freed individually, but shared-table construction is
//! speculative: the builder writes a candidate into the arena, hashes it, and
//! rolls the allocation back if the model already holds an identical table.
//! Only the most recent allocation can be rolled back or shrunk.

/// Identifies one allocation within an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocId {
    chunk: u32,
    ofs: u32,
}

#[derive(Debug, Clone, Copy)]
struct LastAlloc {
    id: AllocId,
    /// Chunk fill level before the allocation was made.
    prev_top: u32,
}

/// Chunked bump arena. Chunks grow by 50 % as the tile fills up; a request
/// larger than the next chunk gets a dedicated chunk.
pub struct Arena {
    chunks: Vec<Vec<u8>>,
    next_chunk_size: usize,
    last: Option<LastAlloc>,
}

const INITIAL_CHUNK_SIZE: usize = 64 * 1024;

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            next_chunk_size: INITIAL_CHUNK_SIZE,
            last: None,
        }
    }

    /// Allocates `size` zeroed bytes whose in-chunk offset is a multiple of
    /// `align` (1, 2, 4 or 8).
    pub fn alloc(&mut self, size: usize, align: usize) -> AllocId {
        debug_assert!(align.is_power_of_two() && align <= 8);
        let chunk_idx = match self.chunks.last() {
            Some(chunk) => {
                let top = (chunk.len() + align - 1) & !(align - 1);
                if top + size <= chunk.capacity() {
                    self.chunks.len() - 1
                } else {
                    self.new_chunk(size + align)
                }
            }
            None => self.new_chunk(size + align),
        };
        let chunk = &mut self.chunks[chunk_idx];
        let prev_top = chunk.len() as u32;
        let start = (chunk.len() + align - 1) & !(align - 1);
        chunk.resize(start + size, 0);
        let id = AllocId {
            chunk: chunk_idx as u32,
            ofs: start as u32,
        };
        self.last = Some(LastAlloc { id, prev_top });
        id
    }

    fn new_chunk(&mut self, min_size: usize) -> usize {
        let size = self.next_chunk_size.max(min_size);
        self.next_chunk_size += self.next_chunk_size / 2;
        self.chunks.push(Vec::with_capacity(size));
        self.chunks.len() - 1
    }

    pub fn bytes(&self, id: AllocId, len: usize) -> &[u8] {
        &self.chunks[id.chunk as usize][id.ofs as usize..id.ofs as usize + len]
    }

    pub fn bytes_mut(&mut self, id: AllocId, len: usize) -> &mut [u8] {
        &mut self.chunks[id.chunk as usize][id.ofs as usize..id.ofs as usize + len]
    }

    /// Rolls back the most recent allocation. `id` must be the id that
    /// allocation returned; anything older cannot be reclaimed.
    pub fn free_last(&mut self, id: AllocId) {
        let last = self
            .last
            .take()
            .filter(|l| l.id == id)
            .unwrap_or_else(|| unreachable!("free_last: not the most recent allocation"));
        self.chunks[last.id.chunk as usize].truncate(last.prev_top as usize);
    }

    /// Gives back the trailing `excess` bytes of the most recent allocation.
    pub fn shrink_last(&mut self, id: AllocId, excess: usize) {
        if excess == 0 {
            return;
        }
        let last = self
            .last
            .filter(|l| l.id == id)
            .unwrap_or_else(|| unreachable!("shrink_last: not the most recent allocation"));
        let chunk = &mut self.chunks[last.id.chunk as usize];
        debug_assert!(chunk.len() - excess >= last.id.ofs as usize);
        chunk.truncate(chunk.len() - excess);
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.next_chunk_size = INITIAL_CHUNK_SIZE;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed_and_aligned() {
        let mut arena = Arena::new();
        arena.alloc(3, 1);
        let id = arena.alloc(8, 4);
        assert_eq!(id.ofs % 4, 0);
        assert_eq!(arena.bytes(id, 8), &[0u8; 8]);
    }

    #[test]
    fn rollback_reclaims_space() {
        let mut arena = Arena::new();
        let a = arena.alloc(16, 4);
        arena.bytes_mut(a, 16).fill(0xAA);
        let b = arena.alloc(16, 4);
        arena.free_last(b);
        // The next allocation reuses the rolled-back space
        let c = arena.alloc(16, 4);
        assert_eq!(b, c);
        assert_eq!(arena.bytes(a, 16), &[0xAA; 16]);
    }

    #[test]
    fn shrink_trims_the_tail() {
        let mut arena = Arena::new();
        let a = arena.alloc(100, 2);
        arena.shrink_last(a, 60);
        // The freed tail is handed out again by the next allocation
        let b = arena.alloc(4, 2);
        assert_eq!(b.ofs, a.ofs + 40);
    }

    #[test]
    fn large_requests_get_their_own_chunk() {
        let mut arena = Arena::new();
        arena.alloc(8, 8);
        let big = arena.alloc(INITIAL_CHUNK_SIZE * 2, 8);
        assert_eq!(arena.bytes(big, INITIAL_CHUNK_SIZE * 2).len(), INITIAL_CHUNK_SIZE * 2);
    }
}
