/*!
 * Object Pools
 *
 * Registry of fixed-size object classes indexed by integer id. Pooled
 * objects carry the same prefix header as sized buffers, with the class id
 * in place of the rounded size, so a release can always tell which pool a
 * region belongs to.
 */

use ahash::RandomState;
use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::buffers::{BlockHeader, HEADER_SIZE};
use super::pool::PoolAllocator;
use crate::core::errors::MemError;
use crate::core::types::MemResult;

pub const OBJ_SIGNATURE: u16 = 0x55AA;

pub struct ObjectPools {
    classes: DashMap<usize, Arc<PoolAllocator>, RandomState>,
    next_id: AtomicUsize,
}

impl ObjectPools {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: DashMap::with_hasher(RandomState::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    /// Register a size class and get its id back.
    pub fn register(&self, object_size: usize) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.classes
            .insert(id, Arc::new(PoolAllocator::new(object_size + HEADER_SIZE)));
        id
    }

    pub fn alloc(self: &Arc<Self>, class_id: usize) -> MemResult<PoolObject> {
        let pool = self
            .classes
            .get(&class_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(MemError::UnknownPool(class_id))?;
        let block = pool.alloc()?;
        unsafe {
            let hdr = block.as_ptr().cast::<BlockHeader>();
            (*hdr).sig = OBJ_SIGNATURE;
            (*hdr).id = class_id;
        }
        let payload = unsafe { NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)) };
        Ok(PoolObject {
            pools: Arc::clone(self),
            payload,
            size: pool.item_size() - HEADER_SIZE,
        })
    }

    fn release(&self, payload: NonNull<u8>) {
        let block = unsafe { payload.as_ptr().sub(HEADER_SIZE) };
        let hdr = block.cast::<BlockHeader>();
        let (sig, class_id) = unsafe { ((*hdr).sig, (*hdr).id) };
        debug_assert_eq!(sig, OBJ_SIGNATURE);
        if let Some(pool) = self.classes.get(&class_id) {
            pool.free(unsafe { NonNull::new_unchecked(block) });
        }
    }

    /// Drop the free lists of every class.
    pub fn reset(&self) {
        for entry in self.classes.iter() {
            entry.value().reset();
        }
    }
}

/// A pooled fixed-size object region; returns to its class pool on drop.
pub struct PoolObject {
    pools: Arc<ObjectPools>,
    payload: NonNull<u8>,
    size: usize,
}

impl PoolObject {
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Deref for PoolObject {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload.as_ptr(), self.size) }
    }
}

impl DerefMut for PoolObject {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload.as_ptr(), self.size) }
    }
}

impl Drop for PoolObject {
    fn drop(&mut self) {
        self.pools.release(self.payload);
    }
}

unsafe impl Send for PoolObject {}
unsafe impl Sync for PoolObject {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn classes_are_isolated() {
        let pools = ObjectPools::new();
        let small = pools.register(48);
        let big = pools.register(4096);
        let a = pools.alloc(small).unwrap();
        let b = pools.alloc(big).unwrap();
        assert_eq!(a.size(), 48);
        assert_eq!(b.size(), 4096);
    }

    #[test]
    fn unknown_class_is_an_error() {
        let pools = ObjectPools::new();
        assert!(matches!(pools.alloc(99), Err(MemError::UnknownPool(99))));
    }

    #[test]
    fn release_feeds_the_class_free_list() {
        let pools = ObjectPools::new();
        let class = pools.register(256);
        drop(pools.alloc(class).unwrap());
        drop(pools.alloc(class).unwrap());
        let pool = pools.classes.get(&class).unwrap();
        assert_eq!(pool.alloc_count(), 2);
        assert_eq!(pool.hits_count(), 1);
    }
}
