/*!
 * Sized Buffer Pool
 *
 * Two bucket tables classify requests: `short` serves up to 1 KiB in
 * 64-byte steps, `long` serves up to 32 KiB in power-of-two classes.
 * Every returned region is preceded by a 16-byte header `{signature, id}`
 * so release routes to the owning bucket in O(1). Oversize requests fall
 * through to the OS heap; the header still tags them for symmetric release.
 */

use log::warn;
use std::alloc::{alloc, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use super::pool::PoolAllocator;
use crate::core::errors::MemError;
use crate::core::types::MemResult;

pub const BUF_SIGNATURE: u16 = 0xAA55;

/// Header prefixed to every pooled region, 16 bytes so payloads stay
/// 16-byte aligned.
pub(crate) const HEADER_SIZE: usize = 16;

#[repr(C)]
pub(crate) struct BlockHeader {
    pub sig: u16,
    _pad: [u8; 6],
    /// Rounded bucket size for buffers, class id for pooled objects,
    /// raw request size for heap fallthroughs.
    pub id: usize,
}

/// Rounded size of each backing pool, smallest first.
const POOL_SIZES: [usize; 10] = [64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768];

/// `(size - 1) >> 6` indexes the short table directly; `>> 5` again lands
/// in the long table.
const SHORT_POOL: [usize; 16] = [0, 1, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 4, 4, 4, 4];
const LONG_POOL: [usize; 16] = [5, 6, 7, 7, 8, 8, 8, 8, 9, 9, 9, 9, 9, 9, 9, 9];

/// Bucket lookup: pool index and rounded size, or `None` for oversize.
fn classify(size: usize) -> Option<usize> {
    let class = (size.max(1) - 1) >> 6;
    if class < 16 {
        Some(SHORT_POOL[class])
    } else if class < 512 {
        Some(LONG_POOL[class >> 5])
    } else {
        None
    }
}

pub struct BufferPools {
    pools: [PoolAllocator; 10],
}

impl BufferPools {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let pools = POOL_SIZES.map(|sz| PoolAllocator::new(sz + HEADER_SIZE));
        Arc::new(Self { pools })
    }

    /// Allocate at least `size` bytes. The returned buffer exposes the full
    /// rounded capacity so callers can opportunistically use the slack.
    pub fn alloc(self: &Arc<Self>, size: usize) -> MemResult<PoolBuf> {
        let (ptr, rounded) = match classify(size) {
            Some(p) => (self.pools[p].alloc()?, POOL_SIZES[p]),
            None => {
                // Oversize: straight to the OS, header included so release
                // stays symmetric.
                let layout = heap_layout(size);
                let raw = unsafe { alloc(layout) };
                let Some(nn) = NonNull::new(raw) else {
                    warn!("buffer pool: heap refused oversize request of {} bytes", size);
                    return Err(MemError::PoolExhausted(format!("{} bytes", size)));
                };
                (nn, size)
            }
        };

        unsafe {
            let hdr = ptr.as_ptr().cast::<BlockHeader>();
            (*hdr).sig = BUF_SIGNATURE;
            (*hdr).id = rounded;
        }
        let payload = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(HEADER_SIZE)) };
        Ok(PoolBuf {
            pools: Arc::clone(self),
            payload,
            capacity: rounded,
            len: size,
        })
    }

    /// Route a block back to its bucket by reading the header. O(1).
    fn release(&self, payload: NonNull<u8>) {
        let block = unsafe { payload.as_ptr().sub(HEADER_SIZE) };
        let hdr = block.cast::<BlockHeader>();
        let (sig, id) = unsafe { ((*hdr).sig, (*hdr).id) };
        if sig != BUF_SIGNATURE {
            warn!("buffer pool: release of a non-buffer block ({:#06x}), ignoring", sig);
            return;
        }
        match classify(id) {
            Some(p) if POOL_SIZES[p] == id => {
                // `id` is a rounded bucket size, so it classifies back to
                // its own pool.
                self.pools[p].free(unsafe { NonNull::new_unchecked(block) });
            }
            _ => unsafe { dealloc(block, heap_layout(id)) },
        }
    }

    /// Per-bucket `(rounded_size, allocations, free-list hits)` diagnostics.
    #[must_use]
    pub fn stats(&self) -> Vec<(usize, u64, u64)> {
        POOL_SIZES
            .iter()
            .zip(self.pools.iter())
            .map(|(sz, p)| (*sz, p.alloc_count(), p.hits_count()))
            .collect()
    }
}

fn heap_layout(payload: usize) -> Layout {
    Layout::from_size_align(payload + HEADER_SIZE, HEADER_SIZE)
        .expect("oversize buffer layout")
}

/// A pooled buffer. Dereferences to the requested length; the rounded
/// capacity is available through `capacity`/`grow_in_place`. Returns to its
/// bucket on drop.
pub struct PoolBuf {
    pools: Arc<BufferPools>,
    payload: NonNull<u8>,
    capacity: usize,
    len: usize,
}

impl PoolBuf {
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resize within the same size class without copying; reallocate and
    /// copy when the class changes.
    pub fn resize(&mut self, new_size: usize) -> MemResult<()> {
        if new_size <= self.capacity {
            self.len = new_size;
            return Ok(());
        }
        let mut bigger = self.pools.alloc(new_size)?;
        bigger[..self.len].copy_from_slice(&self[..]);
        std::mem::swap(self, &mut bigger);
        Ok(())
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload.as_ptr(), self.len) }
    }
}

impl DerefMut for PoolBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload.as_ptr(), self.len) }
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.pools.release(self.payload);
    }
}

// Payload bytes are exclusively owned by the PoolBuf.
unsafe impl Send for PoolBuf {}
unsafe impl Sync for PoolBuf {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::limits::MAX_POOLED_BUFFER;
    use pretty_assertions::assert_eq;

    #[test]
    fn rounds_to_the_documented_classes() {
        let pools = BufferPools::new();
        for (req, rounded) in [
            (1usize, 64usize),
            (64, 64),
            (65, 128),
            (200, 256),
            (257, 512),
            (1024, 1024),
            (1025, 2048),
            (5000, 8192),
            (32768, 32768),
        ] {
            let buf = pools.alloc(req).unwrap();
            assert_eq!(buf.capacity(), rounded, "request {}", req);
            assert_eq!(buf.len(), req);
        }
    }

    #[test]
    fn oversize_goes_to_the_heap() {
        let pools = BufferPools::new();
        let buf = pools.alloc(MAX_POOLED_BUFFER + 1).unwrap();
        assert_eq!(buf.capacity(), MAX_POOLED_BUFFER + 1);
    }

    #[test]
    fn release_reuses_the_bucket() {
        let pools = BufferPools::new();
        let buf = pools.alloc(100).unwrap();
        drop(buf);
        let _again = pools.alloc(100).unwrap();
        let (_, allocs, hits) = pools.stats()[2]; // 256-byte bucket
        assert_eq!(allocs, 2);
        assert_eq!(hits, 1);
    }

    #[test]
    fn resize_within_class_keeps_the_block() {
        let pools = BufferPools::new();
        let mut buf = pools.alloc(100).unwrap();
        buf[..3].copy_from_slice(b"abc");
        buf.resize(200).unwrap(); // still the 256 class
        assert_eq!(buf.capacity(), 256);
        assert_eq!(&buf[..3], b"abc");
        buf.resize(4000).unwrap(); // copies into the 4096 class
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn payloads_are_writable_to_capacity_boundary() {
        let pools = BufferPools::new();
        let mut buf = pools.alloc(64).unwrap();
        for b in buf.iter_mut() {
            *b = 0xFF;
        }
        assert!(buf.iter().all(|&b| b == 0xFF));
    }
}
