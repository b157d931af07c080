/*!
 * Serial Allocator
 *
 * Linear allocator over a chain of equally-sized chunks drawn from the
 * sized buffer pool. Allocation bumps within the current chunk and chains a
 * fresh one on overflow; `free` is a no-op and `reset` rewinds to the head
 * chunk, returning the extensions to the buffer pool. Typical use is one
 * allocator per request.
 */

use std::sync::Arc;

use super::buffers::{BufferPools, PoolBuf};
use super::traits::{align_up, Arena, ArenaRef};
use crate::core::errors::MemError;
use crate::core::limits::SERIAL_CHUNK_SIZE;
use crate::core::types::MemResult;

pub struct SerialAllocator {
    pools: Arc<BufferPools>,
    chunk_size: usize,
    chunks: Vec<PoolBuf>,
    /// Bump offset within the last chunk.
    cur: usize,
}

impl SerialAllocator {
    pub fn new(pools: Arc<BufferPools>) -> MemResult<Self> {
        Self::with_chunk_size(pools, SERIAL_CHUNK_SIZE)
    }

    pub fn with_chunk_size(pools: Arc<BufferPools>, chunk_size: usize) -> MemResult<Self> {
        let mut head = pools.alloc(chunk_size)?;
        // The pool rounds up; use what it actually granted.
        let chunk_size = head.capacity();
        head.resize(chunk_size)?;
        Ok(Self {
            pools,
            chunk_size,
            chunks: vec![head],
            cur: 0,
        })
    }

    #[inline]
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Arena for SerialAllocator {
    fn alloc(&mut self, size: usize) -> MemResult<ArenaRef> {
        let aligned = align_up(size);
        if aligned > self.chunk_size {
            return Err(MemError::OversizeForChunk {
                requested: size,
                chunk: self.chunk_size,
            });
        }
        if self.cur + aligned > self.chunk_size {
            let fresh = self.pools.alloc(self.chunk_size)?;
            self.chunks.push(fresh);
            self.cur = 0;
        }
        let at = ArenaRef::new((self.chunks.len() - 1) as u32, self.cur as u32);
        self.cur += aligned;
        Ok(at)
    }

    fn bytes(&self, at: ArenaRef, len: usize) -> &[u8] {
        let off = at.offset as usize;
        &self.chunks[at.chunk as usize][off..off + len]
    }

    fn bytes_mut(&mut self, at: ArenaRef, len: usize) -> &mut [u8] {
        let off = at.offset as usize;
        &mut self.chunks[at.chunk as usize][off..off + len]
    }

    fn reset(&mut self) {
        self.chunks.truncate(1);
        self.cur = 0;
    }

    fn data_size(&self) -> usize {
        (self.chunks.len() - 1) * self.chunk_size + self.cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn arena() -> SerialAllocator {
        SerialAllocator::with_chunk_size(BufferPools::new(), 256).unwrap()
    }

    #[test]
    fn bumps_within_a_chunk() {
        let mut a = arena();
        let first = a.alloc(10).unwrap();
        let second = a.alloc(10).unwrap();
        assert_eq!(first, ArenaRef::new(0, 0));
        assert_eq!(second, ArenaRef::new(0, 16));
        assert_eq!(a.chunk_count(), 1);
    }

    #[test]
    fn chains_on_overflow() {
        let mut a = arena();
        a.alloc(200).unwrap();
        let spill = a.alloc(100).unwrap();
        assert_eq!(spill.chunk, 1);
        assert_eq!(a.chunk_count(), 2);
    }

    #[test]
    fn oversize_request_fails_outright() {
        let mut a = arena();
        assert!(matches!(
            a.alloc(10_000),
            Err(MemError::OversizeForChunk { .. })
        ));
    }

    #[test]
    fn reset_releases_extensions() {
        let mut a = arena();
        for _ in 0..10 {
            a.alloc(200).unwrap();
        }
        assert!(a.chunk_count() > 1);
        a.reset();
        assert_eq!(a.chunk_count(), 1);
        assert_eq!(a.data_size(), 0);
        a.alloc(8).unwrap();
    }

    #[test]
    fn roundtrip_bytes() {
        let mut a = arena();
        let at = a.alloc_bytes(b"hello world").unwrap();
        assert_eq!(a.bytes(at, 11), b"hello world");
    }

    #[test]
    fn free_is_a_noop() {
        let mut a = arena();
        let at = a.alloc(32).unwrap();
        assert!(!a.supports_free());
        a.free(at);
        assert_eq!(a.data_size(), 32);
    }
}
