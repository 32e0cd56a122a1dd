//! Volatile page pools.
//!
//! One [`PagePool`] per NUMA node: a preallocated arena of page frames and
//! a free list of offsets. Offset 0 is reserved so that a zero
//! [`VolatilePagePointer`] word always means null. NUMA placement is
//! modeled as per-node pools; binding threads and memory to physical nodes
//! is the platform allocator's job, outside this crate.
//!
//! Frees are batched through [`PagePoolOffsetChunk`]s where the caller
//! drops many pages at once (the snapshot installer), so the free-list
//! lock is taken once per chunk rather than once per page.

use crate::error::{CodeResult, ErrorCode};
use crate::page::{Page, VolatilePagePointer};
use parking_lot::Mutex;
use std::sync::Arc;

/// Default capacity of a batched-free chunk.
pub const OFFSET_CHUNK_CAPACITY: usize = 1 << 10;

/// A batch of pool offsets on their way back to one node's free list.
#[derive(Debug)]
pub struct PagePoolOffsetChunk {
    node: u8,
    offsets: Vec<u32>,
    capacity: usize,
}

impl PagePoolOffsetChunk {
    /// Empty chunk for the given node.
    pub fn new(node: u8) -> PagePoolOffsetChunk {
        PagePoolOffsetChunk {
            node,
            offsets: Vec::with_capacity(OFFSET_CHUNK_CAPACITY),
            capacity: OFFSET_CHUNK_CAPACITY,
        }
    }

    /// Node whose pool these offsets belong to.
    pub fn node(&self) -> u8 {
        self.node
    }

    /// Add an offset; the caller flushes the chunk when this reports full.
    pub fn push(&mut self, offset: u32) -> bool {
        self.offsets.push(offset);
        self.offsets.len() >= self.capacity
    }

    /// Number of queued offsets.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Arena of volatile page frames for one node.
pub struct PagePool {
    node: u8,
    frames: Box<[Page]>,
    free: Mutex<Vec<u32>>,
}

impl PagePool {
    /// Allocate an arena of `pages` frames (frame 0 reserved).
    pub fn new(node: u8, pages: usize) -> PagePool {
        assert!(pages >= 2, "a pool needs at least one usable frame");
        let frames: Box<[Page]> = (0..pages).map(|_| Page::new()).collect();
        // Hand out low offsets first.
        let free: Vec<u32> = (1..pages as u32).rev().collect();
        PagePool {
            node,
            frames,
            free: Mutex::new(free),
        }
    }

    /// Node this pool serves.
    pub fn node(&self) -> u8 {
        self.node
    }

    /// Usable frame count.
    pub fn capacity(&self) -> usize {
        self.frames.len() - 1
    }

    /// Currently free frame count.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Percentage of the pool that is free, rounded down.
    pub fn free_percent(&self) -> u32 {
        (self.free_count() * 100 / self.capacity()) as u32
    }

    /// Grab a frame. The returned offset's frame content is stale; callers
    /// run [`Page::init`] before making the page reachable.
    pub fn allocate(&self) -> CodeResult<u32> {
        self.free.lock().pop().ok_or(ErrorCode::PoolExhausted)
    }

    /// Return one frame.
    pub fn release(&self, offset: u32) {
        debug_assert!(offset != 0 && (offset as usize) < self.frames.len());
        self.free.lock().push(offset);
    }

    /// Return a whole chunk under one lock acquisition.
    pub fn release_chunk(&self, chunk: &mut PagePoolOffsetChunk) {
        debug_assert_eq!(chunk.node, self.node);
        if chunk.offsets.is_empty() {
            return;
        }
        self.free.lock().append(&mut chunk.offsets);
    }

    /// Borrow the frame at `offset`.
    pub fn page(&self, offset: u32) -> &Page {
        &self.frames[offset as usize]
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("node", &self.node)
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .finish()
    }
}

/// All nodes' pools, indexed by node id. This is the only way a
/// [`VolatilePagePointer`] is turned into a page reference.
#[derive(Debug, Clone)]
pub struct PagePools {
    pools: Arc<Vec<PagePool>>,
}

impl PagePools {
    /// Build `node_count` pools of `pages_per_node` frames each.
    pub fn new(node_count: usize, pages_per_node: usize) -> PagePools {
        assert!(node_count >= 1 && node_count <= u8::MAX as usize);
        let pools = (0..node_count)
            .map(|node| PagePool::new(node as u8, pages_per_node))
            .collect();
        PagePools {
            pools: Arc::new(pools),
        }
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.pools.len()
    }

    /// The pool for one node.
    pub fn pool(&self, node: u8) -> &PagePool {
        &self.pools[node as usize]
    }

    /// Resolve a non-null volatile pointer to its frame.
    pub fn resolve(&self, pointer: VolatilePagePointer) -> &Page {
        debug_assert!(!pointer.is_null());
        self.pools[pointer.node() as usize].page(pointer.offset())
    }

    /// Allocate on a node, returning the typed pointer.
    pub fn allocate(&self, node: u8) -> CodeResult<VolatilePagePointer> {
        let offset = self.pool(node).allocate()?;
        Ok(VolatilePagePointer::new(node, offset))
    }

    /// Release through the typed pointer.
    pub fn release(&self, pointer: VolatilePagePointer) {
        self.pool(pointer.node()).release(pointer.offset());
    }

    /// Free-frame count summed over all nodes.
    pub fn total_free_count(&self) -> usize {
        self.pools.iter().map(|p| p.free_count()).sum()
    }

    /// Lowest free percentage across nodes; the snapshot trigger watches
    /// this.
    pub fn min_free_percent(&self) -> u32 {
        self.pools
            .iter()
            .map(|p| p.free_percent())
            .min()
            .unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release_round_trip() {
        let pool = PagePool::new(0, 8);
        assert_eq!(pool.capacity(), 7);
        assert_eq!(pool.free_count(), 7);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_eq!(pool.free_count(), 5);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.free_count(), 7);
    }

    #[test]
    fn exhaustion_is_reported_not_panicked() {
        let pool = PagePool::new(0, 3);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert_eq!(pool.allocate(), Err(ErrorCode::PoolExhausted));
    }

    #[test]
    fn chunked_release_returns_everything() {
        let pool = PagePool::new(1, 16);
        let mut chunk = PagePoolOffsetChunk::new(1);
        for _ in 0..10 {
            let offset = pool.allocate().unwrap();
            chunk.push(offset);
        }
        assert_eq!(pool.free_count(), 5);
        pool.release_chunk(&mut chunk);
        assert!(chunk.is_empty());
        assert_eq!(pool.free_count(), 15);
    }

    #[test]
    fn pools_resolve_typed_pointers() {
        let pools = PagePools::new(2, 4);
        let p = pools.allocate(1).unwrap();
        assert_eq!(p.node(), 1);
        pools.resolve(p).init(5, 0);
        assert_eq!(pools.resolve(p).storage_id(), 5);
        pools.release(p);
        assert_eq!(pools.pool(1).free_count(), 3);
    }
}
