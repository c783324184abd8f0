//! Installs the allocator as the program's `GlobalAlloc` and watches
//! the buddy arena react: splits cascading down the orders for small
//! boxes, a direct mapping for an oversized buffer, and coalescing
//! once everything is dropped. See [`BuddyMalloc`] for the actual
//! trait implementation.

use buddymalloc::{BuddyMalloc, MAX_BLOCK_SIZE};

#[global_allocator]
static ALLOCATOR: BuddyMalloc = BuddyMalloc::new();

fn report(what: &str) {
    let counters = ALLOCATOR.counters();

    println!(
        "{what}: {} blocks ({} free), {} bytes allocated, walk agrees: {}",
        counters.allocated_blocks,
        counters.free_blocks,
        counters.allocated_bytes,
        counters == ALLOCATOR.recount(),
    );
}

fn main() {
    report("after startup");

    // A small box splits a top-order block all the way down: one new
    // free buddy appears at every order it passes through.
    let small = Box::new([0u8; 64]);
    report("one small box (split cascade)");

    // One byte past an order's payload and the allocation lands one
    // order higher.
    let payload_0 = 128 - ALLOCATOR.header_size() as usize;
    let at_boundary = vec![0u8; payload_0];
    let past_boundary = vec![0u8; payload_0 + 1];
    println!(
        "order boundary at {} bytes: {:p} vs {:p}",
        payload_0,
        at_boundary.as_ptr(),
        past_boundary.as_ptr(),
    );

    // Too big for any buddy block: this one bypasses the arena and
    // comes straight from an anonymous mapping.
    let before = ALLOCATOR.allocated_bytes();
    let mapped = vec![0u8; 2 * MAX_BLOCK_SIZE];
    println!(
        "direct mapping added {} bytes at {:p}",
        ALLOCATOR.allocated_bytes() - before,
        mapped.as_ptr(),
    );
    report("with the mapped buffer live");

    drop(mapped);
    drop(past_boundary);
    drop(at_boundary);
    drop(small);

    // Freed buddies merge back up; the mapping went back to the OS.
    report("after dropping everything (coalesced)");
}
