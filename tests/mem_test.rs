/*!
 * Allocator Tests
 * Cross-allocator scenarios: buffer pool reuse, serial chaining, object
 * pools under threads, pack allocator accounting
 */

use std::sync::Arc;
use std::thread;

use icapd::mem::{align_up, Arena, BufferPools, ObjectPools, PackAllocator, SerialAllocator};
use pretty_assertions::assert_eq;

#[test]
fn buffer_pool_sizes_cover_every_request() {
    let pools = BufferPools::new();
    for req in 1..=40_000usize {
        if req % 61 != 0 {
            continue; // sample the range instead of hammering every size
        }
        let buf = pools.alloc(req).unwrap();
        assert!(buf.capacity() >= req, "rounded {} < requested {}", buf.capacity(), req);
        assert_eq!(buf.len(), req);
    }
}

#[test]
fn buffer_pool_is_thread_safe() {
    let pools = BufferPools::new();
    let mut handles = Vec::new();
    for t in 0..8 {
        let pools = Arc::clone(&pools);
        handles.push(thread::spawn(move || {
            for i in 0..200 {
                let size = 1 + (t * 997 + i * 131) % 40_000;
                let mut buf = pools.alloc(size).unwrap();
                buf[0] = t as u8;
                assert_eq!(buf[0], t as u8);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn object_pool_recycles_across_threads() {
    let pools = ObjectPools::new();
    let class = pools.register(1024);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pools = Arc::clone(&pools);
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                let mut obj = pools.alloc(class).unwrap();
                obj[0] = 0xEE;
                assert_eq!(obj.size(), 1024);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn serial_allocator_survives_heavy_churn() {
    let pools = BufferPools::new();
    let mut arena = SerialAllocator::new(Arc::clone(&pools)).unwrap();
    for round in 0..50 {
        let mut refs = Vec::new();
        for i in 0..200 {
            let payload = vec![(round * 7 + i) as u8; 1 + i % 100];
            refs.push((arena.alloc_bytes(&payload).unwrap(), payload));
        }
        for (at, payload) in &refs {
            assert_eq!(arena.bytes(*at, payload.len()), &payload[..]);
        }
        arena.reset();
        assert_eq!(arena.data_size(), 0);
    }
}

#[test]
fn pack_data_size_matches_both_ends() {
    let mut pack = PackAllocator::with_capacity(8192);
    let mut expect = 0usize;
    for i in 1..20 {
        pack.alloc_front(i).unwrap();
        expect += align_up(i);
        pack.alloc_from_rear(i).unwrap();
        expect += align_up(i);
        assert_eq!(pack.data_size(), expect);
        assert!(pack.start_pos() <= pack.end_pos());
    }
}
