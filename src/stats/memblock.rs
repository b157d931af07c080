/*!
 * Statistics Memory Block
 *
 * A fixed-layout region of 64-bit counter slots behind a small header:
 *
 * ```text
 * [ u16 signature = 0xFAFA | u16 pad | i32 stats_count | u64 slots... ]
 * ```
 *
 * Each child writes only its own block; the monitor reads blocks and folds
 * exited children into the history block, so per-slot atomics are the only
 * synchronization needed. Snapshots are not cross-slot consistent.
 */

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use super::StatType;
use crate::core::errors::StatError;
use crate::core::types::StatResult;

pub const MEMBLOCK_SIG: u16 = 0xFAFA;

const HEADER_SIZE: usize = 8;

/// KB accumulator over one 64-bit slot: the slot accumulates raw bytes and
/// the read side splits them, so `kilobytes * 1024 + remainder` is exact no
/// matter how the feed was fragmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Kbs {
    bytes: u64,
}

impl Kbs {
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn update(&mut self, bytes: u64) {
        self.bytes += bytes;
    }

    #[inline]
    #[must_use]
    pub fn kilobytes(self) -> u64 {
        self.bytes >> 10
    }

    #[inline]
    #[must_use]
    pub fn remainder_bytes(self) -> u64 {
        self.bytes & 0x3FF
    }

    #[inline]
    #[must_use]
    pub fn total_bytes(self) -> u64 {
        self.bytes
    }
}

/// View over a statistics block living in shared (or plain) memory.
pub struct StatMemblock {
    base: NonNull<u8>,
    count: usize,
}

unsafe impl Send for StatMemblock {}
unsafe impl Sync for StatMemblock {}

impl StatMemblock {
    /// Bytes a block of `count` slots occupies.
    #[inline]
    #[must_use]
    pub fn size_for(count: usize) -> usize {
        HEADER_SIZE + count * std::mem::size_of::<u64>()
    }

    /// Initialize a fresh block in `space` bytes at `base`.
    ///
    /// # Safety
    /// `base` must point at `space` writable bytes, 8-byte aligned, that
    /// outlive the returned view and are not concurrently initialized.
    pub unsafe fn init(base: NonNull<u8>, space: usize, count: usize) -> StatResult<Self> {
        let need = Self::size_for(count);
        if space < need {
            return Err(StatError::BlockTooSmall { have: space, need });
        }
        std::ptr::write_bytes(base.as_ptr(), 0, need);
        base.as_ptr().cast::<u16>().write(MEMBLOCK_SIG);
        base.as_ptr().add(4).cast::<i32>().write(count as i32);
        Ok(Self { base, count })
    }

    /// Open an already-initialized block, verifying the signature.
    ///
    /// # Safety
    /// Same aliasing and lifetime requirements as `init`.
    pub unsafe fn attach(base: NonNull<u8>, space: usize) -> StatResult<Self> {
        if space < HEADER_SIZE {
            return Err(StatError::BlockTooSmall {
                have: space,
                need: HEADER_SIZE,
            });
        }
        let sig = base.as_ptr().cast::<u16>().read();
        if sig != MEMBLOCK_SIG {
            return Err(StatError::BadSignature(sig));
        }
        let count = base.as_ptr().add(4).cast::<i32>().read().max(0) as usize;
        let need = Self::size_for(count);
        if space < need {
            return Err(StatError::BlockTooSmall { have: space, need });
        }
        Ok(Self { base, count })
    }

    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    fn slot(&self, id: usize) -> Option<&AtomicU64> {
        if id >= self.count {
            return None;
        }
        // Slots start 8-byte aligned right after the header; AtomicU64 has
        // the same layout as u64.
        unsafe {
            let p = self.base.as_ptr().add(HEADER_SIZE).cast::<AtomicU64>();
            Some(&*p.add(id))
        }
    }

    pub fn inc(&self, id: usize, n: u64) {
        if let Some(slot) = self.slot(id) {
            slot.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn set(&self, id: usize, v: u64) {
        if let Some(slot) = self.slot(id) {
            slot.store(v, Ordering::Relaxed);
        }
    }

    /// Feed bytes into a KB-accumulator slot.
    pub fn kbs_inc(&self, id: usize, bytes: u64) {
        self.inc(id, bytes);
    }

    #[must_use]
    pub fn get(&self, id: usize) -> u64 {
        self.slot(id).map(|s| s.load(Ordering::Relaxed)).unwrap_or(0)
    }

    #[must_use]
    pub fn kbs_get(&self, id: usize) -> Kbs {
        Kbs::from_bytes(self.get(id))
    }

    pub fn reset(&self) {
        for id in 0..self.count {
            self.set(id, 0);
        }
    }

    /// Raw slot values, for snapshots.
    #[must_use]
    pub fn values(&self) -> Vec<u64> {
        (0..self.count).map(|id| self.get(id)).collect()
    }

    /// Fold `src` into `self` slot by slot. Counters and KB accumulators
    /// sum; time and mean slots take the running mean, where `instances` is
    /// the number of blocks already folded into `self`. Folding child K+1
    /// with `instances == K` keeps the global mean exact across every child
    /// that ever existed.
    pub fn merge(&self, src: &StatMemblock, types: &[StatType], instances: u64) {
        let n = self.count.min(src.count).min(types.len());
        for id in 0..n {
            let s = src.get(id);
            match types[id] {
                StatType::Counter | StatType::Kbs => self.inc(id, s),
                StatType::TimeUs | StatType::TimeMs | StatType::IntMean => {
                    let d = self.get(id);
                    self.set(id, (d * instances + s) / (instances + 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block(count: usize) -> (Vec<u64>, StatMemblock) {
        // Backing store as u64s for alignment; kept alive by the caller.
        let mut backing = vec![0u64; StatMemblock::size_for(count) / 8 + 1];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        let mb = unsafe { StatMemblock::init(base, backing.len() * 8, count) }.unwrap();
        (backing, mb)
    }

    #[test]
    fn init_writes_header() {
        let (backing, mb) = block(4);
        assert_eq!(mb.count(), 4);
        let base = NonNull::new(backing.as_ptr() as *mut u8).unwrap();
        let reopened = unsafe { StatMemblock::attach(base, backing.len() * 8) }.unwrap();
        assert_eq!(reopened.count(), 4);
    }

    #[test]
    fn attach_rejects_bad_signature() {
        let mut backing = vec![0u64; 8];
        let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
        assert!(matches!(
            unsafe { StatMemblock::attach(base, 64) },
            Err(StatError::BadSignature(0))
        ));
    }

    #[test]
    fn out_of_range_ids_are_ignored() {
        let (_backing, mb) = block(2);
        mb.inc(7, 1);
        assert_eq!(mb.get(7), 0);
    }

    #[test]
    fn kbs_accumulator_is_exact() {
        let (_backing, mb) = block(1);
        let mut total = 0u64;
        for chunk in [1u64, 1023, 1024, 1025, 3, 999_999] {
            mb.kbs_inc(0, chunk);
            total += chunk;
        }
        let kbs = mb.kbs_get(0);
        assert_eq!(kbs.kilobytes() * 1024 + kbs.remainder_bytes(), total);
    }

    #[test]
    fn merge_sums_counters_and_means_times() {
        let types = [StatType::Counter, StatType::TimeMs];
        let (_ba, a) = block(2);
        let (_bb, b) = block(2);
        let (_bc, c) = block(2);
        a.set(0, 10);
        a.set(1, 100);
        b.set(0, 20);
        b.set(1, 200);
        c.set(0, 30);
        c.set(1, 600);

        let (_bh, hist) = block(2);
        hist.merge(&a, &types, 0);
        hist.merge(&b, &types, 1);
        hist.merge(&c, &types, 2);

        assert_eq!(hist.get(0), 60);
        assert_eq!(hist.get(1), (100 + 200 + 600) / 3);
    }

    #[test]
    fn counter_merge_is_associative() {
        let types = [StatType::Counter, StatType::Kbs];
        let values = [[5u64, 1500], [7, 2000], [11, 4096]];

        let fold = |order: &[usize]| {
            let (_b, acc) = block(2);
            for (k, &i) in order.iter().enumerate() {
                let (_s, src) = block(2);
                src.set(0, values[i][0]);
                src.set(1, values[i][1]);
                acc.merge(&src, &types, k as u64);
            }
            (acc.get(0), acc.get(1))
        };

        assert_eq!(fold(&[0, 1, 2]), fold(&[2, 0, 1]));
    }
}
