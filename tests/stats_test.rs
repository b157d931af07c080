/*!
 * Statistics Tests
 * Memory blocks over a real shared-memory region, merge invariants and
 * accumulator exactness with randomized feeds
 */

use std::ptr::NonNull;

use icapd::stats::{StatMemblock, StatRegistry, StatType};
use icapd::{SharedMem, SharedMemScheme};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn region_block(shm: &SharedMem, offset: usize, count: usize) -> StatMemblock {
    let base = unsafe { NonNull::new_unchecked(shm.base().as_ptr().add(offset)) };
    unsafe { StatMemblock::init(base, StatMemblock::size_for(count), count) }.unwrap()
}

#[test]
fn memblocks_live_in_shared_memory() {
    let reg = StatRegistry::new();
    let requests = reg.register("requests", StatType::Counter, 0).unwrap();
    let bytes_in = reg.register("bytes in", StatType::Kbs, 0).unwrap();
    reg.freeze();

    let shm = SharedMem::create(SharedMemScheme::Mmap, "stats-test", 4096).unwrap();
    let child = region_block(&shm, 0, reg.count());
    let history = region_block(&shm, 1024, reg.count());

    child.inc(requests, 41);
    child.inc(requests, 1);
    child.kbs_inc(bytes_in, 2048 + 100);

    // Re-attach the same offsets, as a sibling process would.
    let base = shm.base();
    let view = unsafe { StatMemblock::attach(base, 1024) }.unwrap();
    assert_eq!(view.get(requests), 42);
    assert_eq!(view.kbs_get(bytes_in).kilobytes(), 2);
    assert_eq!(view.kbs_get(bytes_in).remainder_bytes(), 100);

    history.merge(&child, &reg.slot_types(), 0);
    assert_eq!(history.get(requests), 42);
    shm.destroy().unwrap();
}

#[test]
fn kb_accumulator_exact_over_random_feeds() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut backing = vec![0u64; 4];
    let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
    let mb = unsafe { StatMemblock::init(base, 32, 1) }.unwrap();

    let mut total = 0u64;
    for _ in 0..10_000 {
        let chunk = rng.gen_range(0..5000);
        mb.kbs_inc(0, chunk);
        total += chunk;
    }
    let kbs = mb.kbs_get(0);
    assert_eq!(kbs.kilobytes() * 1024 + kbs.remainder_bytes(), total);
    assert_eq!(kbs.total_bytes(), total);
}

#[test]
fn running_mean_matches_plain_mean() {
    let types = vec![StatType::TimeUs];
    let samples: Vec<u64> = vec![10, 200, 3000, 44, 190_000, 3, 77];

    let mut backing = vec![0u64; 4];
    let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
    let acc = unsafe { StatMemblock::init(base, 32, 1) }.unwrap();

    for (k, &sample) in samples.iter().enumerate() {
        let mut src_backing = vec![0u64; 4];
        let src_base = NonNull::new(src_backing.as_mut_ptr().cast::<u8>()).unwrap();
        let src = unsafe { StatMemblock::init(src_base, 32, 1) }.unwrap();
        src.set(0, sample);
        acc.merge(&src, &types, k as u64);
    }

    let plain = samples.iter().sum::<u64>() / samples.len() as u64;
    let diff = acc.get(0).abs_diff(plain);
    // Integer running mean accumulates at most one unit of rounding per
    // merge step.
    assert!(diff <= samples.len() as u64, "running {} vs plain {}", acc.get(0), plain);
}
