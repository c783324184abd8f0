//! Integration tests for the allocator crate.
//!
//! Everything here goes through the public facade only, the way an
//! embedding program would, and leans on the counter accessors plus
//! the diagnostic walk to observe the arena from outside.

use buddymalloc::{
    AllocCounters, BuddyMalloc, INIT_BLOCKS, MAX_BLOCK_SIZE, MAX_ORDER, MAX_USER_REQUEST,
    ORDER_0_SIZE,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

/// Usable bytes of a buddy block of the given order.
fn payload(allocator: &BuddyMalloc, order: usize) -> u64 {
    ((ORDER_0_SIZE << order) - allocator.header_size() as usize) as u64
}

/// Forces the lazy arena reservation with one alloc/free round trip
/// and returns the fresh-state counters.
fn warm_up(allocator: &BuddyMalloc) -> AllocCounters {
    let p = allocator.alloc(1);
    assert!(!p.is_null());
    unsafe { allocator.free(p) };

    allocator.counters()
}

#[test]
fn fresh_state_counters() {
    let allocator = BuddyMalloc::new();

    // Nothing exists until the first allocation reserves the arena.
    assert_eq!(allocator.counters(), AllocCounters::default());

    let counters = warm_up(&allocator);
    let blocks = INIT_BLOCKS as u64;

    assert_eq!(counters.allocated_blocks, blocks);
    assert_eq!(counters.free_blocks, blocks);
    assert_eq!(
        counters.allocated_bytes,
        blocks * payload(&allocator, MAX_ORDER)
    );
    assert_eq!(counters.free_bytes, counters.allocated_bytes);
    assert_eq!(counters.metadata_bytes, blocks * allocator.header_size());
    assert_eq!(counters, allocator.recount());
}

#[test]
fn split_cascade_and_round_trip() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);

    // A request that lands exactly in an order-0 block splits a
    // top-order donor all the way down: one new free block per order
    // below the donor, plus the block handed out.
    let p = allocator.alloc(payload(&allocator, 0) as usize);
    assert!(!p.is_null());

    let counters = allocator.counters();
    assert_eq!(
        counters.allocated_blocks,
        (INIT_BLOCKS + MAX_ORDER) as u64
    );
    assert_eq!(counters.free_blocks, counters.allocated_blocks - 1);

    let mut expected_bytes = (INIT_BLOCKS as u64 - 1) * payload(&allocator, MAX_ORDER);
    for order in 0..MAX_ORDER {
        expected_bytes += payload(&allocator, order);
    }
    expected_bytes += payload(&allocator, 0);

    assert_eq!(counters.allocated_bytes, expected_bytes);
    assert_eq!(
        counters.free_bytes,
        expected_bytes - payload(&allocator, 0)
    );
    assert_eq!(
        counters.metadata_bytes,
        counters.allocated_blocks * allocator.header_size()
    );
    assert_eq!(counters, allocator.recount());
    assert!(allocator.verify_integrity());

    // Freeing merges everything back together.
    unsafe { allocator.free(p) };
    assert_eq!(allocator.counters(), baseline);
    assert!(allocator.verify_integrity());
}

#[test]
fn large_requests_are_directly_mapped() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);
    let size = 200_000;

    let p = allocator.alloc(size);
    assert!(!p.is_null());

    let counters = allocator.counters();
    assert_eq!(counters.allocated_blocks, baseline.allocated_blocks + 1);
    assert_eq!(
        counters.allocated_bytes,
        baseline.allocated_bytes + size as u64
    );
    assert_eq!(
        counters.metadata_bytes,
        baseline.metadata_bytes + allocator.header_size()
    );
    // The arena itself is untouched.
    assert_eq!(counters.free_blocks, baseline.free_blocks);
    assert_eq!(counters.free_bytes, baseline.free_bytes);
    assert_eq!(counters, allocator.recount());

    unsafe { allocator.free(p) };
    assert_eq!(allocator.counters(), baseline);
}

#[test]
fn realloc_within_the_block_is_in_place() {
    let allocator = BuddyMalloc::new();
    warm_up(&allocator);

    let p = allocator.alloc(32);
    assert!(!p.is_null());

    unsafe {
        for i in 0..32 {
            p.add(i).write(i as u8);
        }

        let q = allocator.realloc(p, 40);
        assert_eq!(q, p);

        for i in 0..32 {
            assert_eq!(q.add(i).read(), i as u8);
        }

        allocator.free(q);
    }
}

#[test]
fn realloc_to_mapping_moves_the_payload() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);

    let p = allocator.alloc(64);
    assert!(!p.is_null());

    unsafe {
        for i in 0..64 {
            p.add(i).write(!(i as u8));
        }

        let q = allocator.realloc(p, 200_000);
        assert!(!q.is_null());
        assert_ne!(q, p);

        for i in 0..64 {
            assert_eq!(q.add(i).read(), !(i as u8));
        }

        // The old buddy block is gone; only the mapped block remains.
        let counters = allocator.counters();
        assert_eq!(counters.allocated_blocks, baseline.allocated_blocks + 1);
        assert_eq!(counters.free_blocks, baseline.free_blocks);
        assert_eq!(counters, allocator.recount());

        allocator.free(q);
    }

    assert_eq!(allocator.counters(), baseline);
}

#[test]
fn arena_exhaustion_and_recovery() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);
    let size = payload(&allocator, MAX_ORDER) as usize;

    let mut blocks = Vec::new();
    for _ in 0..INIT_BLOCKS {
        let p = allocator.alloc(size);
        assert!(!p.is_null());
        blocks.push(p);
    }

    // Arena is full: the next top-order request must fail...
    assert!(allocator.alloc(size).is_null());

    // ...and succeed again once one block is given back.
    unsafe { allocator.free(blocks.pop().unwrap()) };
    let again = allocator.alloc(size);
    assert!(!again.is_null());
    blocks.push(again);

    for p in blocks {
        unsafe { allocator.free(p) };
    }

    assert_eq!(allocator.counters(), baseline);
    assert!(allocator.verify_integrity());
}

#[test]
fn calloc_zeroes_the_payload() {
    let allocator = BuddyMalloc::new();
    warm_up(&allocator);

    // Dirty a block, free it, then calloc over the same memory.
    let dirty = allocator.alloc(256);
    assert!(!dirty.is_null());
    unsafe {
        dirty.write_bytes(0xff, 256);
        allocator.free(dirty);
    }

    let p = allocator.calloc(64, 4);
    assert!(!p.is_null());

    unsafe {
        for i in 0..256 {
            assert_eq!(p.add(i).read(), 0);
        }
        allocator.free(p);
    }
}

#[test]
fn calloc_rejects_overflow_and_zero() {
    let allocator = BuddyMalloc::new();

    assert!(allocator.calloc(usize::MAX, 2).is_null());
    assert!(allocator.calloc(0, 16).is_null());
    assert!(allocator.calloc(16, 0).is_null());
}

#[test]
fn invalid_requests_return_null() {
    let allocator = BuddyMalloc::new();

    assert!(allocator.alloc(0).is_null());
    assert!(allocator.alloc(MAX_USER_REQUEST + 1).is_null());
}

#[test]
fn bad_pointers_leave_the_counters_alone() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);

    unsafe {
        // Null pointer.
        allocator.free(std::ptr::null_mut());
        assert_eq!(allocator.counters(), baseline);

        // A pointer whose "header" carries no cookie.
        let mut buf = [0u64; 16];
        let foreign = buf
            .as_mut_ptr()
            .cast::<u8>()
            .add(allocator.header_size() as usize);
        allocator.free(foreign);
        assert_eq!(allocator.counters(), baseline);

        // Double free.
        let p = allocator.alloc(100);
        allocator.free(p);
        let after_free = allocator.counters();
        allocator.free(p);
        assert_eq!(allocator.counters(), after_free);
    }

    assert_eq!(allocator.counters(), baseline);
}

#[test]
fn realloc_edge_cases() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);

    unsafe {
        // realloc(null, n) behaves as alloc(n).
        let p = allocator.realloc(std::ptr::null_mut(), 128);
        assert!(!p.is_null());

        // realloc(p, 0) behaves as free(p) and returns null.
        let q = allocator.realloc(p, 0);
        assert!(q.is_null());
        assert_eq!(allocator.counters(), baseline);

        // realloc on a foreign pointer is refused.
        let mut buf = [0u64; 16];
        let foreign = buf
            .as_mut_ptr()
            .cast::<u8>()
            .add(allocator.header_size() as usize);
        assert!(allocator.realloc(foreign, 64).is_null());
        assert_eq!(allocator.counters(), baseline);
    }
}

#[test]
fn round_trip_restores_counters_for_every_order() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);
    let hs = allocator.header_size() as usize;

    let mut sizes = vec![1, 17, 100];
    for order in 0..=MAX_ORDER {
        sizes.push((ORDER_0_SIZE << order) - hs);
    }
    sizes.push(MAX_BLOCK_SIZE); // mapped
    sizes.push(1_000_000); // mapped

    for size in sizes {
        let p = allocator.alloc(size);
        assert!(!p.is_null(), "allocation of {size} bytes failed");
        unsafe { allocator.free(p) };

        assert_eq!(
            allocator.counters(),
            baseline,
            "counters did not return to baseline after {size} bytes"
        );
        assert_eq!(allocator.counters(), allocator.recount());
        assert!(allocator.verify_integrity());
    }
}

#[test]
fn header_size_is_constant() {
    let allocator = BuddyMalloc::new();
    let before = allocator.header_size();

    let p = allocator.alloc(1000);
    let q = allocator.alloc(500_000);

    assert_eq!(allocator.header_size(), before);

    unsafe {
        allocator.free(p);
        allocator.free(q);
    }

    assert_eq!(allocator.header_size(), before);
}

#[test]
fn random_operation_sequences_keep_the_books_exact() {
    let allocator = BuddyMalloc::new();
    let baseline = warm_up(&allocator);

    let mut rng = StdRng::seed_from_u64(0xb10c_b00c);
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    for step in 0..400 {
        match rng.gen_range(0..10) {
            // Small allocations dominate, spread over every order.
            0..=4 => {
                let size = rng.gen_range(1..=MAX_BLOCK_SIZE / 2);
                let p = allocator.alloc(size);
                if !p.is_null() {
                    unsafe { p.write_bytes(step as u8, size) };
                    live.push((p, size));
                }
            }
            // The occasional mapped block.
            5 => {
                let size = rng.gen_range(MAX_BLOCK_SIZE..MAX_BLOCK_SIZE * 4);
                let p = allocator.alloc(size);
                if !p.is_null() {
                    live.push((p, size));
                }
            }
            6 => {
                let size = rng.gen_range(1..128);
                let p = allocator.calloc(rng.gen_range(1..8), size);
                if !p.is_null() {
                    live.push((p, size));
                }
            }
            7..=8 => {
                if !live.is_empty() {
                    let (p, _) = live.swap_remove(rng.gen_range(0..live.len()));
                    unsafe { allocator.free(p) };
                }
            }
            _ => {
                if !live.is_empty() {
                    let index = rng.gen_range(0..live.len());
                    let (p, _) = live[index];
                    let new_size = rng.gen_range(1..=MAX_BLOCK_SIZE);
                    let q = unsafe { allocator.realloc(p, new_size) };
                    if !q.is_null() {
                        live[index] = (q, new_size);
                    }
                }
            }
        }

        assert_eq!(
            allocator.counters(),
            allocator.recount(),
            "stored counters drifted from the walk at step {step}"
        );
        assert!(
            allocator.verify_integrity(),
            "arena integrity broken at step {step}"
        );
    }

    for (p, _) in live {
        unsafe { allocator.free(p) };
    }

    // With nothing live the arena must be fully coalesced again.
    assert_eq!(allocator.counters(), baseline);
    assert!(allocator.verify_integrity());
}
