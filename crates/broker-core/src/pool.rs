//! A pool of reusable payload buffers, so message payloads don't each allocate and free
//! independently as they move between connections and queues.

/// A single pooled payload buffer.
pub type Chunk = Vec<u8>;

pub struct ChunkPool {
    pool: Vec<Chunk>,
}

impl ChunkPool {
    pub fn new() -> ChunkPool {
        ChunkPool { pool: Vec::new() }
    }

    /// Takes a buffer out of the pool, or allocates a fresh empty one if the pool is dry.
    #[inline]
    pub fn alloc(&mut self) -> Chunk {
        self.pool.pop().unwrap_or_else(Vec::new)
    }

    /// Returns a buffer to the pool for reuse. The buffer is cleared (but its allocated
    /// capacity is kept) so the next `alloc` doesn't need to reallocate.
    #[inline]
    pub fn reclaim(&mut self, mut chunk: Chunk) {
        chunk.clear();
        self.pool.push(chunk);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pool.len()
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_on_empty_pool_yields_fresh_chunk() {
        let mut pool = ChunkPool::new();
        let chunk = pool.alloc();
        assert!(chunk.is_empty());
    }

    #[test]
    fn reclaimed_chunks_are_reused() {
        let mut pool = ChunkPool::new();
        let mut chunk = pool.alloc();
        chunk.extend_from_slice(b"hello");
        pool.reclaim(chunk);

        assert_eq!(pool.len(), 1);
        let reused = pool.alloc();
        assert!(reused.is_empty());
        assert_eq!(pool.len(), 0);
    }
}
