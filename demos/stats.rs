//! Prints the allocator's counters as blocks come and go, and checks
//! them against a full walk of the arena.

use buddymalloc::BuddyMalloc;

fn report(allocator: &BuddyMalloc, what: &str) {
    let counters = allocator.counters();

    println!("--- {what} ---");
    println!("  allocated blocks: {}", counters.allocated_blocks);
    println!("  allocated bytes:  {}", counters.allocated_bytes);
    println!("  free blocks:      {}", counters.free_blocks);
    println!("  free bytes:       {}", counters.free_bytes);
    println!("  metadata bytes:   {}", counters.metadata_bytes);
    println!("  walk agrees:      {}", counters == allocator.recount());
}

fn main() {
    let allocator = BuddyMalloc::new();

    report(&allocator, "before any allocation");

    let small = allocator.alloc(100);
    report(&allocator, "one small block (splits down the orders)");

    let large = allocator.alloc(200_000);
    report(&allocator, "one directly-mapped block on top");

    unsafe {
        allocator.free(small);
        allocator.free(large);
    }

    report(&allocator, "everything freed (fully coalesced again)");
}
