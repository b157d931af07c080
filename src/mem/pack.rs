/*!
 * Pack Allocator
 *
 * Dual-ended bump allocator over a single contiguous block. Aligned
 * allocations grow from the front and are carved from the rear; both ends
 * have unaligned variants for densely packed records and payloads, and
 * both can be rewound positionally so the last item of an array or vector
 * can be popped. Invariant: `cur <= end` at all times.
 */

use super::traits::{align_up, Arena, ArenaRef};
use crate::core::errors::MemError;
use crate::core::types::MemResult;

pub struct PackAllocator {
    buf: Box<[u8]>,
    cur: usize,
    end: usize,
    orig_end: usize,
}

impl PackAllocator {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let buf = vec![0u8; capacity].into_boxed_slice();
        let end = buf.len();
        Self {
            buf,
            cur: 0,
            end,
            orig_end: end,
        }
    }

    /// Re-open a block previously produced by `into_block`. Allocation state
    /// is not preserved; the block contents are.
    #[must_use]
    pub fn from_block(buf: Box<[u8]>) -> Self {
        let end = buf.len();
        Self {
            buf,
            cur: 0,
            end,
            orig_end: end,
        }
    }

    /// Surrender the backing block, e.g. to ship it whole to disk or into a
    /// shared-memory region.
    #[must_use]
    pub fn into_block(self) -> Box<[u8]> {
        self.buf
    }

    /// Aligned allocation from the front.
    pub fn alloc_front(&mut self, size: usize) -> MemResult<usize> {
        self.alloc_front_inner(align_up(size))
    }

    /// Unaligned allocation from the front. Used for densely packed item
    /// records where each record is itself a multiple of the record layout.
    pub fn alloc_front_unaligned(&mut self, size: usize) -> MemResult<usize> {
        self.alloc_front_inner(size)
    }

    fn alloc_front_inner(&mut self, size: usize) -> MemResult<usize> {
        if size > self.end - self.cur {
            return Err(MemError::OutOfSpace {
                requested: size,
                available: self.end - self.cur,
            });
        }
        let at = self.cur;
        self.cur += size;
        Ok(at)
    }

    /// Aligned allocation from the rear; returns the new `end`, i.e. the
    /// offset of the carved region.
    pub fn alloc_from_rear(&mut self, size: usize) -> MemResult<usize> {
        self.alloc_rear_inner(align_up(size))
    }

    /// Unaligned rear allocation, for densely packed payload bytes.
    pub fn alloc_from_rear_unaligned(&mut self, size: usize) -> MemResult<usize> {
        self.alloc_rear_inner(size)
    }

    fn alloc_rear_inner(&mut self, size: usize) -> MemResult<usize> {
        if size > self.end - self.cur {
            return Err(MemError::OutOfSpace {
                requested: size,
                available: self.end - self.cur,
            });
        }
        self.end -= size;
        Ok(self.end)
    }

    /// Rewind the front pointer. `pos` must not pass the rear pointer.
    pub fn set_start_pos(&mut self, pos: usize) -> MemResult<()> {
        if pos > self.end {
            return Err(MemError::InvalidPosition(pos));
        }
        self.cur = pos;
        Ok(())
    }

    /// Rewind the rear pointer; `None` restores the original end.
    pub fn set_end_pos(&mut self, pos: Option<usize>) -> MemResult<()> {
        let pos = pos.unwrap_or(self.orig_end);
        if pos > self.orig_end || pos < self.cur {
            return Err(MemError::InvalidPosition(pos));
        }
        self.end = pos;
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn start_pos(&self) -> usize {
        self.cur
    }

    #[inline]
    #[must_use]
    pub fn end_pos(&self) -> usize {
        self.end
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Free bytes between the two ends.
    #[inline]
    #[must_use]
    pub fn gap(&self) -> usize {
        self.end - self.cur
    }

    #[inline]
    #[must_use]
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..offset + len]
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) {
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl Arena for PackAllocator {
    fn alloc(&mut self, size: usize) -> MemResult<ArenaRef> {
        let off = self.alloc_front(size)?;
        Ok(ArenaRef::new(0, off as u32))
    }

    fn bytes(&self, at: ArenaRef, len: usize) -> &[u8] {
        self.read(at.offset as usize, len)
    }

    fn bytes_mut(&mut self, at: ArenaRef, len: usize) -> &mut [u8] {
        let off = at.offset as usize;
        &mut self.buf[off..off + len]
    }

    fn reset(&mut self) {
        self.cur = 0;
        self.end = self.orig_end;
    }

    fn data_size(&self) -> usize {
        self.cur + (self.orig_end - self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn front_and_rear_meet_in_the_middle() {
        let mut pack = PackAllocator::with_capacity(64);
        let a = pack.alloc_front(10).unwrap();
        assert_eq!(a, 0);
        let r = pack.alloc_from_rear(10).unwrap();
        assert_eq!(r, 48);
        assert_eq!(pack.data_size(), 16 + 16);
        assert!(pack.start_pos() <= pack.end_pos());
    }

    #[test]
    fn exhaustion_fails_cleanly() {
        let mut pack = PackAllocator::with_capacity(32);
        pack.alloc_front(16).unwrap();
        assert!(pack.alloc_from_rear(17).is_err());
        assert!(pack.alloc_from_rear(16).is_ok());
        assert_eq!(pack.gap(), 0);
        assert!(pack.alloc_front(1).is_err());
    }

    #[test]
    fn positional_rewind() {
        let mut pack = PackAllocator::with_capacity(128);
        let first = pack.alloc_front(8).unwrap();
        let second = pack.alloc_front(8).unwrap();
        let end_before_rear = pack.end_pos();
        pack.alloc_from_rear(20).unwrap();
        pack.set_start_pos(second).unwrap();
        pack.set_end_pos(Some(end_before_rear)).unwrap();
        assert_eq!(pack.data_size(), 16);
        let again = pack.alloc_front(8).unwrap();
        assert_eq!(again, second);
        let _ = first;
    }

    #[test]
    fn end_pos_none_restores_original() {
        let mut pack = PackAllocator::with_capacity(64);
        pack.alloc_from_rear(32).unwrap();
        pack.set_end_pos(None).unwrap();
        assert_eq!(pack.end_pos(), 64);
        assert_eq!(pack.data_size(), 0);
    }

    #[test]
    fn rewind_bounds_are_checked() {
        let mut pack = PackAllocator::with_capacity(64);
        pack.alloc_front(16).unwrap();
        assert!(pack.set_end_pos(Some(8)).is_err());
        assert!(pack.set_start_pos(65).is_err());
    }

    #[test]
    fn spec_pop_scenario() {
        // Three aligned 100-byte fronts and two 200-byte rears, then pop the
        // third front and the second rear.
        let mut pack = PackAllocator::with_capacity(4096);
        let mut fronts = Vec::new();
        for _ in 0..3 {
            fronts.push(pack.alloc_front(100).unwrap());
        }
        let mut rears = Vec::new();
        for _ in 0..2 {
            rears.push(pack.alloc_from_rear(200).unwrap());
        }
        assert_eq!(align_up(100), 112);
        assert_eq!(align_up(200), 208);
        assert_eq!(pack.data_size(), 3 * 112 + 2 * 208);

        pack.set_start_pos(fronts[2]).unwrap();
        pack.set_end_pos(Some(rears[0])).unwrap();
        assert_eq!(pack.data_size(), 2 * 112 + 208);

        let gap = pack.gap();
        pack.alloc_front_unaligned(gap).unwrap();
        assert!(pack.alloc_front_unaligned(1).is_err());
    }
}
