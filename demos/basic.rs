use buddymalloc::BuddyMalloc;

fn log_alloc(addr: *mut u8, size: usize) {
    println!("Requested {} bytes of memory", size);
    println!("Received this address: {addr:?}");
}

fn main() {
    let allocator = BuddyMalloc::new();

    let addr1 = allocator.alloc(8);
    log_alloc(addr1, 8);

    let addr2 = allocator.alloc(100);
    log_alloc(addr2, 100);

    // Above the buddy threshold: this one comes from a direct mapping.
    let addr3 = allocator.alloc(200_000);
    log_alloc(addr3, 200_000);

    let zeroed = allocator.calloc(16, 4);
    log_alloc(zeroed, 16 * 4);

    unsafe {
        let grown = allocator.realloc(addr2, 300);
        println!("Realloc moved {addr2:?} to {grown:?}");

        allocator.free(addr1);
        allocator.free(grown);
        allocator.free(addr3);
        allocator.free(zeroed);
    }
}
