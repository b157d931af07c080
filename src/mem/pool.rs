/*!
 * Pool Allocator
 *
 * Fixed-size item pool: a free list of released items and an in-use set,
 * both under one mutex. Popping the free list is the hot path; a miss heap-
 * allocates a fresh item. `reset` invalidates every outstanding item — a
 * later `free` of a pre-reset pointer is detected through the in-use set and
 * goes straight back to the heap instead of poisoning the free list.
 */

use ahash::HashSet;
use log::debug;
use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::errors::MemError;
use crate::core::types::MemResult;

const ITEM_ALIGN: usize = 16;

struct Inner {
    free: Vec<usize>,
    in_use: HashSet<usize>,
}

pub struct PoolAllocator {
    item_size: usize,
    layout: Layout,
    inner: Mutex<Inner>,
    alloc_count: AtomicU64,
    hits_count: AtomicU64,
}

impl PoolAllocator {
    /// `item_size` is rounded up so the layout is always `ITEM_ALIGN`-aligned.
    #[must_use]
    pub fn new(item_size: usize) -> Self {
        let item_size = item_size.max(ITEM_ALIGN);
        // Only fails for absurd sizes; the buffer pool caps item sizes well
        // below that.
        let layout = Layout::from_size_align(item_size, ITEM_ALIGN)
            .unwrap_or_else(|_| Layout::new::<u128>());
        Self {
            item_size,
            layout,
            inner: Mutex::new(Inner {
                free: Vec::new(),
                in_use: HashSet::default(),
            }),
            alloc_count: AtomicU64::new(0),
            hits_count: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn alloc(&self) -> MemResult<NonNull<u8>> {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        if let Some(addr) = inner.free.pop() {
            self.hits_count.fetch_add(1, Ordering::Relaxed);
            inner.in_use.insert(addr);
            // Address came from a prior successful alloc of self.layout.
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }

        let ptr = unsafe { alloc(self.layout) };
        let Some(nn) = NonNull::new(ptr) else {
            return Err(MemError::PoolExhausted(format!(
                "heap refused {} bytes",
                self.item_size
            )));
        };
        inner.in_use.insert(nn.as_ptr() as usize);
        Ok(nn)
    }

    /// Return an item to the free list. Items that predate the last `reset`
    /// are released to the heap directly.
    pub fn free(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let mut inner = self.inner.lock();
        if inner.in_use.remove(&addr) {
            inner.free.push(addr);
        } else {
            debug!("pool({}): releasing stale item {:#x} to the heap", self.item_size, addr);
            drop(inner);
            unsafe { dealloc(ptr.as_ptr(), self.layout) };
        }
    }

    /// Release both lists. Every outstanding item is invalidated; callers
    /// must not touch items obtained before the reset.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for addr in inner.free.drain(..) {
            unsafe { dealloc(addr as *mut u8, self.layout) };
        }
        inner.in_use.clear();
    }

    /// Total allocation requests served.
    #[must_use]
    pub fn alloc_count(&self) -> u64 {
        self.alloc_count.load(Ordering::Relaxed)
    }

    /// Requests satisfied from the free list.
    #[must_use]
    pub fn hits_count(&self) -> u64 {
        self.hits_count.load(Ordering::Relaxed)
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for addr in inner.free.drain(..) {
            unsafe { dealloc(addr as *mut u8, self.layout) };
        }
        // Items still in use at teardown belong to objects that leaked;
        // release the backing memory with the pool.
        for addr in inner.in_use.drain() {
            unsafe { dealloc(addr as *mut u8, self.layout) };
        }
    }
}

// The pool only stores addresses; the pointed-to items are raw bytes whose
// ownership moves with the NonNull handed to the caller.
unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_list_is_reused() {
        let pool = PoolAllocator::new(128);
        let a = pool.alloc().unwrap();
        let addr = a.as_ptr() as usize;
        pool.free(a);
        let b = pool.alloc().unwrap();
        assert_eq!(b.as_ptr() as usize, addr);
        assert_eq!(pool.alloc_count(), 2);
        assert_eq!(pool.hits_count(), 1);
        pool.free(b);
    }

    #[test]
    fn stale_free_after_reset_goes_to_heap() {
        let pool = PoolAllocator::new(64);
        let a = pool.alloc().unwrap();
        pool.reset();
        pool.free(a); // must not enter the free list
        let b = pool.alloc().unwrap();
        assert_eq!(pool.hits_count(), 0);
        pool.free(b);
    }
}
