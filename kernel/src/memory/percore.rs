// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-core physical page allocator.
//!
//! One free-list pool per core, each behind its own spin lock, so cores
//! allocate and free without contending in the common case. A core whose
//! pool runs dry probes the peer pools once, in circular order, and steals
//! a single page. Freed pages always go back to the freeing core's own
//! pool; balance across pools emerges only from that steal-then-free
//! cycle.
//!
//! All metadata is fixed at construction: the free lists live inside the
//! managed pages themselves and the page-state bitmap is sized once from
//! the range. Allocation never blocks; it either succeeds immediately or
//! reports `OutOfMemory`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use crossbeam_utils::CachePadded;
use log::{debug, trace};
use spin::Mutex;
use static_assertions as sa;

use super::freelist::FreeList;
use super::{Page, ALLOC_POISON, FREE_POISON, PAGE_SIZE};
use crate::environment::{self, MAX_CORES};
use crate::error::{KError, KResult};

sa::const_assert!(MAX_CORES > 0);

/// Default `pool` member, used for array initialization.
#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_POOL: CachePadded<Mutex<FreeList>> = CachePadded::new(Mutex::new(FreeList::new()));

/// Allocates whole pages of physical memory from per-core pools.
pub struct PageAllocator {
    /// One pool of free pages per core, each behind its own lock.
    pools: [CachePadded<Mutex<FreeList>>; MAX_CORES],

    /// First page-aligned address of the managed range.
    start: usize,

    /// One past the last managed byte (page-aligned).
    end: usize,

    /// One bit per managed page; set while the page is handed out. Catches
    /// frees of pages that are not currently allocated.
    page_states: Box<[AtomicU64]>,

    /// Whether to fill pages on free (`FREE_POISON`) and on allocation
    /// (`ALLOC_POISON`).
    poison: bool,
}

impl PageAllocator {
    /// Construct an allocator managing `[range_start, range_end)`.
    ///
    /// The range is shrunk inward to page boundaries. Every page starts out
    /// on core 0's pool, in ascending address order; the other pools fill
    /// lazily through stealing and subsequent local frees.
    ///
    /// # Safety
    /// The range must be valid, unused memory that the allocator owns
    /// exclusively for its whole lifetime.
    pub unsafe fn new(range_start: *mut u8, range_end: *mut u8, poison: bool) -> PageAllocator {
        let mut start = (range_start as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = (range_end as usize) & !(PAGE_SIZE - 1);
        if start > end {
            // The range doesn't cover a single whole page.
            start = end;
        }
        let pages = (end - start) / PAGE_SIZE;

        // All pages start out marked allocated; the population loop below
        // releases them through the regular free path.
        let words = (pages + 63) / 64;
        let page_states = (0..words)
            .map(|_| AtomicU64::new(u64::MAX))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let allocator = PageAllocator {
            pools: [EMPTY_POOL; MAX_CORES],
            start,
            end,
            page_states,
            poison,
        };

        let mut addr = allocator.start;
        while addr < allocator.end {
            allocator.release_page_into(0, addr);
            addr += PAGE_SIZE;
        }

        debug!(
            "page allocator: {} pages over {:#x}..{:#x}",
            pages, start, end
        );
        allocator
    }

    /// Allocate one page, preferring the calling core's pool.
    ///
    /// The page is filled with `ALLOC_POISON` (when poisoning is on) and
    /// otherwise uninitialized. Returns `OutOfMemory` once every pool is
    /// empty; the caller decides how to handle that.
    pub fn allocate(&self) -> KResult<Page> {
        self.allocate_on(environment::core_id())
    }

    /// Give `page` back, onto the calling core's own pool.
    ///
    /// Panics if `page` is not a page the allocator currently considers
    /// handed out; that is a caller bug, not a runtime condition.
    pub fn free(&self, page: Page) {
        self.free_on(environment::core_id(), page)
    }

    /// Total number of pages in the managed range.
    pub fn capacity(&self) -> usize {
        (self.end - self.start) / PAGE_SIZE
    }

    /// Number of pages currently on free lists, summed over all pools.
    pub fn free_pages(&self) -> usize {
        self.pools.iter().map(|pool| pool.lock().len()).sum()
    }

    /// Number of pages currently handed out.
    pub fn allocated(&self) -> usize {
        self.capacity() - self.free_pages()
    }

    /// Per-pool free-page counts, indexed by core.
    pub fn pool_free_pages(&self) -> ArrayVec<usize, MAX_CORES> {
        self.pools.iter().map(|pool| pool.lock().len()).collect()
    }

    pub(crate) fn allocate_on(&self, core: usize) -> KResult<Page> {
        assert!(core < MAX_CORES);

        let local = self.pools[core].lock().pop();
        if let Ok(page) = local {
            return Ok(self.finish_allocation(page));
        }

        // Local pool is dry; probe each peer exactly once, in circular
        // order starting past ourselves.
        for offset in 1..MAX_CORES {
            let victim = (core + offset) % MAX_CORES;
            let stolen = self.pools[victim].lock().pop();
            if let Ok(page) = stolen {
                trace!("core {}: stole a page from pool {}", core, victim);
                return Ok(self.finish_allocation(page));
            }
        }

        Err(KError::OutOfMemory)
    }

    pub(crate) fn free_on(&self, core: usize, page: Page) {
        assert!(core < MAX_CORES);

        let addr = page.addr();
        if addr % PAGE_SIZE != 0 || addr < self.start || addr >= self.end {
            panic!("free: bad page address {:#x}", addr);
        }

        self.release_page_into(core, addr);
    }

    fn finish_allocation(&self, page: NonNull<u8>) -> Page {
        let addr = page.as_ptr() as usize;
        self.mark_allocated(self.page_index(addr));

        if self.poison {
            // SAFETY: The page just came off a free list, so nobody else
            // references it.
            unsafe { core::ptr::write_bytes(page.as_ptr(), ALLOC_POISON, PAGE_SIZE) };
        }

        Page::new(page)
    }

    fn release_page_into(&self, pool: usize, addr: usize) {
        self.mark_free(self.page_index(addr));

        let ptr = addr as *mut u8;
        if self.poison {
            // SAFETY: The state bit above established that the page is
            // transitioning allocated -> free; it has no other owner.
            unsafe { core::ptr::write_bytes(ptr, FREE_POISON, PAGE_SIZE) };
        }

        // SAFETY: Same ownership argument; the link overlays the first word
        // after the poison fill.
        unsafe {
            self.pools[pool]
                .lock()
                .push(NonNull::new_unchecked(ptr));
        }
    }

    fn page_index(&self, addr: usize) -> usize {
        (addr - self.start) / PAGE_SIZE
    }

    fn mark_allocated(&self, index: usize) {
        let bit = 1u64 << (index % 64);
        let prev = self.page_states[index / 64].fetch_or(bit, Ordering::AcqRel);
        assert_eq!(prev & bit, 0, "page {} handed out twice", index);
    }

    fn mark_free(&self, index: usize) {
        let bit = 1u64 << (index % 64);
        let prev = self.page_states[index / 64].fetch_and(!bit, Ordering::AcqRel);
        if prev & bit == 0 {
            panic!("free: page {} is already free", index);
        }
    }
}

impl fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageAllocator {{ free: {} pages, allocated: {} pages, capacity: {} pages }}",
            self.free_pages(),
            self.allocated(),
            self.capacity()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::TestArena;

    fn allocator(arena: &TestArena, poison: bool) -> PageAllocator {
        unsafe { PageAllocator::new(arena.start(), arena.end(), poison) }
    }

    /// Initialization parks the whole range in pool 0.
    #[test]
    fn init_fills_pool_zero_only() {
        let arena = TestArena::new(6);
        let alloc = allocator(&arena, true);

        assert_eq!(alloc.capacity(), 6);
        assert_eq!(alloc.free_pages(), 6);
        assert_eq!(alloc.allocated(), 0);

        let per_pool = alloc.pool_free_pages();
        assert_eq!(per_pool[0], 6);
        for core in 1..MAX_CORES {
            assert_eq!(per_pool[core], 0);
        }
    }

    /// A sub-page range yields an empty but functional allocator.
    #[test]
    fn empty_range_is_exhausted() {
        let arena = TestArena::new(1);
        let alloc = unsafe {
            PageAllocator::new(arena.start().add(8), arena.start().add(16), true)
        };
        assert_eq!(alloc.capacity(), 0);
        assert!(matches!(alloc.allocate_on(0), Err(KError::OutOfMemory)));
    }

    /// Fresh pages carry the allocation pattern; freed pages the poison.
    #[test]
    fn pages_are_poisoned() {
        let arena = TestArena::new(2);
        let alloc = allocator(&arena, true);

        let mut page = alloc.allocate_on(0).expect("can allocate");
        assert!(page.as_mut_slice().iter().all(|b| *b == ALLOC_POISON));

        let addr = page.addr() as *const u8;
        alloc.free_on(0, page);
        // Skip the first word, it holds the free-list link.
        let poisoned = unsafe { core::slice::from_raw_parts(addr.add(8), PAGE_SIZE - 8) };
        assert!(poisoned.iter().all(|b| *b == FREE_POISON));
    }

    /// With poisoning off, a page keeps its contents across a free/allocate
    /// cycle (minus the link word).
    #[test]
    fn no_poison_preserves_contents() {
        let arena = TestArena::new(1);
        let alloc = allocator(&arena, false);

        let mut page = alloc.allocate_on(0).expect("can allocate");
        page.as_mut_slice().fill(0x7e);
        let addr = page.addr();
        alloc.free_on(0, page);

        let mut page = alloc.allocate_on(0).expect("can allocate");
        assert_eq!(page.addr(), addr);
        assert!(page.as_mut_slice()[8..].iter().all(|b| *b == 0x7e));
        alloc.free_on(0, page);
    }

    /// A core with an empty pool steals directly from a peer; the stolen
    /// page is not rerouted through the stealing core's pool.
    #[test]
    fn empty_pool_steals_from_peer() {
        let arena = TestArena::new(3);
        let alloc = allocator(&arena, true);

        let page = alloc.allocate_on(1).expect("steals from pool 0");

        let per_pool = alloc.pool_free_pages();
        assert_eq!(per_pool[0], 2);
        assert_eq!(per_pool[1], 0);

        // Freeing on core 1 now seeds pool 1.
        alloc.free_on(1, page);
        let per_pool = alloc.pool_free_pages();
        assert_eq!(per_pool[0], 2);
        assert_eq!(per_pool[1], 1);
    }

    /// Exhaustion is an error, not a panic.
    #[test]
    fn exhaustion_is_reported() {
        let arena = TestArena::new(2);
        let alloc = allocator(&arena, true);

        let a = alloc.allocate_on(0).expect("can allocate");
        let b = alloc.allocate_on(3).expect("can allocate");
        assert!(matches!(alloc.allocate_on(0), Err(KError::OutOfMemory)));

        alloc.free_on(0, a);
        alloc.free_on(3, b);
        assert_eq!(alloc.free_pages(), 2);
    }

    /// No page is handed out twice before being freed.
    #[test]
    fn no_double_allocation() {
        let arena = TestArena::new(8);
        let alloc = allocator(&arena, true);

        let mut held = Vec::new();
        while let Ok(page) = alloc.allocate_on(2) {
            held.push(page);
        }
        assert_eq!(held.len(), 8);

        let mut addrs: Vec<usize> = held.iter().map(|p| p.addr()).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 8);

        for page in held {
            alloc.free_on(2, page);
        }
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_free_panics() {
        let arena = TestArena::new(1);
        let alloc = allocator(&arena, true);

        let page = alloc.allocate_on(0).expect("can allocate");
        let addr = page.addr();
        alloc.free_on(0, page);

        let again = Page::new(NonNull::new(addr as *mut u8).unwrap());
        alloc.free_on(0, again);
    }

    #[test]
    #[should_panic(expected = "bad page address")]
    fn misaligned_free_panics() {
        let arena = TestArena::new(1);
        let alloc = allocator(&arena, true);

        let page = Page::new(NonNull::new(unsafe { arena.start().add(8) }).unwrap());
        alloc.free_on(0, page);
    }

    #[test]
    #[should_panic(expected = "bad page address")]
    fn out_of_range_free_panics() {
        let arena = TestArena::new(1);
        let other = TestArena::new(1);
        let alloc = allocator(&arena, true);

        let page = Page::new(NonNull::new(other.start()).unwrap());
        alloc.free_on(0, page);
    }

    /// Concurrent allocate/free traffic across cores conserves pages.
    #[test]
    fn concurrent_traffic_conserves_pages() {
        let _ = env_logger::builder().is_test(true).try_init();

        const PAGES: usize = 32;
        let arena = TestArena::new(PAGES);
        let alloc = allocator(&arena, true);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        let mut held = Vec::new();
                        for _ in 0..4 {
                            if let Ok(page) = alloc.allocate() {
                                held.push(page);
                            }
                        }
                        for page in held {
                            alloc.free(page);
                        }
                    }
                });
            }
        });

        assert_eq!(alloc.free_pages(), PAGES);
        assert_eq!(alloc.allocated(), 0);
    }

    proptest::proptest! {
        /// sum(free) + held == capacity at every quiescent point.
        #[test]
        fn page_conservation(ops in proptest::collection::vec(proptest::bool::ANY, 1..128)) {
            let arena = TestArena::new(16);
            let alloc = allocator(&arena, true);
            let mut held = Vec::new();

            for do_alloc in ops {
                if do_alloc {
                    if let Ok(page) = alloc.allocate_on(0) {
                        held.push(page);
                    }
                } else if let Some(page) = held.pop() {
                    alloc.free_on(0, page);
                }
                proptest::prop_assert_eq!(alloc.free_pages() + held.len(), alloc.capacity());
            }

            for page in held.drain(..) {
                alloc.free_on(0, page);
            }
            proptest::prop_assert_eq!(alloc.free_pages(), alloc.capacity());
        }
    }
}
