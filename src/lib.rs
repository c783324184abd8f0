//! BuddyMalloc is a buddy-system memory allocator with a C-style
//! allocation surface (`alloc`, `calloc`, `free`, `realloc`).
//!
//! Small requests are served from a single 4 MiB arena reserved from
//! the program heap on first use, aligned to its own size and carved
//! into power-of-two blocks; large requests go straight to the OS as
//! anonymous private mappings:
//!
//! ```text
//!                     The arena, carved by order
//! +-------------------------------------------------------------+
//! |   order 10   |   order 10   | o.9 | o.9 |   order 10   | ...|
//! |    (free)    |   (in use)   |     |     |    (free)    |    |
//! +-------------------------------------------------------------+
//! ^ BASE (aligned to the arena size)
//!
//!   free lists, one per order          direct mappings
//!   [0] -> o.0 -> o.0                  mmap -> mmap
//!   [1] -> o.1                         (one per large request,
//!   ...                                 unmapped on free)
//!   [10] -> o.10 -> o.10
//! ```
//!
//! Every block starts with an inline header carrying its size, state
//! and intrusive list links. Splitting halves a free block into two
//! buddies; freeing re-merges buddies as long as both halves are free,
//! so the arena always converges back to the fully coalesced state.
//!
//! The allocator keeps per-order counters of blocks and bytes which
//! are exact at all times: recomputing them by walking the arena must
//! give back the stored values, and the test suite holds it to that.
//!
//! The main structure is [`BuddyMalloc`], you can follow the codebase
//! from there.

#[cfg(feature = "log")]
#[macro_use]
extern crate log;

// No-op stand-ins so the modules can log unconditionally.
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}

mod arena;
mod block;
mod buddy;
mod freelist;
mod kernel;
mod list;
mod memalloc;
mod stats;
mod utils;

pub use arena::{ARENA_SIZE, INIT_BLOCKS};
pub use block::{MAX_BLOCK_SIZE, MAX_ORDER, ORDER_0_SIZE};
pub use buddy::MAX_USER_REQUEST;
pub use memalloc::BuddyMalloc;
pub use stats::AllocCounters;
