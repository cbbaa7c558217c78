// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sharded resource managers for the kernel.
//!
//! Two managers live here, siblings with the same shape (a fixed pool,
//! partitioned locks, a stealing fallback) over different resources:
//!
//! - [`bcache::BufferCache`]: a block cache partitioned into hash buckets,
//!   handing out exclusively locked buffers backed by a block device.
//! - [`memory::PageAllocator`]: per-core pools of physical pages.
//!
//! Neither allocates metadata after construction and neither blocks,
//! except on the buffer exclusive lock, which is the one place a caller
//! can be suspended.
//!
//! On bare-metal targets the crate is `no_std`; hosted builds get std so
//! the test suite runs as a regular process.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod bcache;
pub mod blockdev;
pub mod environment;
mod error;
pub mod memory;
mod sleeplock;

pub use error::{KError, KResult};

use spin::Once;

use bcache::BufferCache;
use blockdev::BlockDevice;
use memory::PageAllocator;

/// The system-wide block cache.
///
/// Initialized once during boot, after the backing device driver is up;
/// never torn down.
pub static BLOCK_CACHE: Once<BufferCache<&'static dyn BlockDevice>> = Once::new();

/// The system-wide page allocator.
///
/// Initialized once during boot with the physical range left over after
/// the kernel image; never torn down.
pub static PAGE_ALLOCATOR: Once<PageAllocator> = Once::new();

#[cfg(test)]
mod test {
    use super::*;
    use crate::blockdev::MemDisk;
    use crate::memory::TestArena;

    /// The process-wide cells initialize once and stay usable.
    #[test]
    fn global_instances_initialize_once() {
        let disk: &'static dyn BlockDevice = Box::leak(Box::new(MemDisk::new(16)));
        let cache = BLOCK_CACHE.call_once(|| BufferCache::new(disk));
        drop(cache.read(0, 3));
        assert_eq!(BLOCK_CACHE.get().unwrap().in_use(), 0);

        let arena: &'static TestArena = Box::leak(Box::new(TestArena::new(4)));
        let alloc =
            PAGE_ALLOCATOR.call_once(|| unsafe { PageAllocator::new(arena.start(), arena.end(), true) });
        let page = alloc.allocate().expect("can allocate");
        alloc.free(page);
        assert_eq!(PAGE_ALLOCATOR.get().unwrap().free_pages(), 4);
    }
}
