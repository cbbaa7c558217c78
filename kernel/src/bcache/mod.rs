// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The sharded block cache.
//!
//! A fixed pool of buffers holds cached copies of device blocks, giving
//! the layers above both fewer device reads and a synchronization point
//! for blocks shared between contexts. The pool is partitioned into hash
//! buckets keyed by block number; each bucket has its own spin lock and a
//! circular, intrusively linked list of the slots currently bound to it,
//! so lookups on different buckets never contend.
//!
//! It has the following properties:
//!
//! - All slots are created at construction and never destroyed; only their
//!   identity and payload are recycled.
//! - A `(device, block)` identity maps to at most one slot at any time.
//! - Slot bookkeeping is arena-plus-index: list links are slot indices
//!   into one fixed table, not pointers.
//! - The payload of a slot is gated by a sleep-capable exclusive lock --
//!   the only place in this module where a caller can be suspended.
//!
//! A bucket that runs out of idle slots steals one from a peer bucket; the
//! slot then migrates to the identity's home bucket. When no idle slot
//! exists anywhere the cache panics: callers assume success and have no
//! fallback path.

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;
use crossbeam_utils::CachePadded;
use log::{debug, trace};
use spin::Mutex;

use crate::blockdev::{BlockData, BlockDevice, BlockNo, DeviceId, BLOCK_SIZE};
use crate::sleeplock::SleepLock;

mod buf;

pub use buf::Buf;

/// Default number of buffer slots in the cache.
pub const NBUF: usize = 30;

/// Default number of hash buckets.
pub const NBUCKETS: usize = 13;

/// Position of a node in a bucket's circular list. Values are node
/// indices: `0..N` are slots, `N..N + B` the bucket sentinels.
#[derive(Clone, Copy)]
struct Links {
    prev: usize,
    next: usize,
}

/// Identity and bookkeeping of one buffer slot.
///
/// Only ever read or written under the lock of the bucket the slot
/// currently belongs to.
struct SlotMeta {
    dev: DeviceId,
    blockno: BlockNo,
    /// Active holders (one per outstanding `Buf`, plus one per pin). A
    /// slot with `refcnt == 0` is idle and may be rebound.
    refcnt: u32,
    links: Links,
}

/// The slot state that lives outside the bucket-lock domain.
struct BufInner {
    /// Whether the payload reflects device contents. Cleared under the
    /// bucket lock when the slot is rebound, set under the exclusive lock
    /// after a device read.
    valid: AtomicBool,

    /// The block payload, gated by the slot's exclusive lock.
    data: SleepLock<BlockData>,
}

/// A sharded cache of device blocks.
///
/// `N` is the number of buffer slots, `B` the number of hash buckets.
/// Lives for the whole process; see [`crate::BLOCK_CACHE`] for the
/// system-wide instance. Separate instances are fully independent, which
/// is what the tests rely on.
pub struct BufferCache<D, const N: usize = NBUF, const B: usize = NBUCKETS> {
    device: D,

    /// One lock per bucket, guarding the bucket's list along with the
    /// metadata of every slot on it.
    buckets: [CachePadded<Mutex<()>>; B],

    /// Sentinel links closing each bucket's circular list.
    heads: [UnsafeCell<Links>; B],

    /// Slot bookkeeping, indexed by slot.
    meta: [UnsafeCell<SlotMeta>; N],

    /// Slot payloads, indexed by slot.
    bufs: [BufInner; N],
}

// SAFETY: Slot metadata and list links are only accessed under the lock of
// the bucket that currently owns the slot; payloads are gated by their
// sleep lock; `valid` is atomic.
unsafe impl<D: Send + Sync, const N: usize, const B: usize> Sync for BufferCache<D, N, B> {}

impl<D, const N: usize, const B: usize> BufferCache<D, N, B> {
    /// Create a cache over `device` with all slots idle.
    pub fn new(device: D) -> BufferCache<D, N, B> {
        assert!(N > 0, "cache needs at least one slot");
        assert!(B > 0, "cache needs at least one bucket");

        let cache = BufferCache {
            device,
            buckets: core::array::from_fn(|_| CachePadded::new(Mutex::new(()))),
            heads: core::array::from_fn(|b| {
                UnsafeCell::new(Links {
                    prev: N + b,
                    next: N + b,
                })
            }),
            meta: core::array::from_fn(|_| {
                UnsafeCell::new(SlotMeta {
                    dev: 0,
                    blockno: 0,
                    refcnt: 0,
                    links: Links { prev: 0, next: 0 },
                })
            }),
            bufs: core::array::from_fn(|_| BufInner {
                valid: AtomicBool::new(false),
                data: SleepLock::new([0; BLOCK_SIZE]),
            }),
        };

        // Every slot starts out on bucket 0's list; slots migrate to their
        // identity's home bucket as they get rebound.
        for slot in 0..N {
            // SAFETY: No other reference to the cache exists yet.
            unsafe { cache.push_front(0, slot) };
        }

        debug!("block cache: {} buffers across {} buckets", N, B);
        cache
    }

    /// The bucket an identity with block number `blockno` hashes to.
    pub fn home_bucket(blockno: BlockNo) -> usize {
        blockno as usize % B
    }

    /// Return an exclusively locked buffer bound to `(dev, blockno)`.
    ///
    /// The payload is not necessarily valid; call [`Buf::fill`] before
    /// trusting it. The call may suspend waiting for the current holder of
    /// the same block. Panics when every slot in the cache is in use --
    /// callers assume success and have no fallback path.
    pub fn get(&self, dev: DeviceId, blockno: BlockNo) -> Buf<'_, D, N, B> {
        let home = Self::home_bucket(blockno);
        let home_guard = self.buckets[home].lock();

        // SAFETY: The home lock is held; it guards the home list and the
        // metadata of every slot on it.
        unsafe {
            // Already bound to a slot?
            let mut node = (*self.links_ptr(Self::sentinel(home))).next;
            while node != Self::sentinel(home) {
                let meta = self.meta[node].get();
                if (*meta).dev == dev && (*meta).blockno == blockno {
                    (*meta).refcnt += 1;
                    drop(home_guard);
                    return self.lock_slot(node, dev, blockno);
                }
                node = (*meta).links.next;
            }

            // Not bound; rebind an idle slot from the home bucket.
            let mut node = (*self.links_ptr(Self::sentinel(home))).next;
            while node != Self::sentinel(home) {
                let meta = self.meta[node].get();
                if (*meta).refcnt == 0 {
                    self.rebind(node, dev, blockno);
                    drop(home_guard);
                    return self.lock_slot(node, dev, blockno);
                }
                node = (*meta).links.next;
            }

            // Home has no idle slot; probe the peers for one to steal. The
            // home lock stays held across the whole probe so the identity
            // can never be found (or bound twice) while the slot is in
            // flight between lists. Peer order is relative to `home`:
            // there is no global bucket-lock order, and two gets with
            // swapped home/peer roles can in principle circular-wait here
            // (inherited behavior; see DESIGN.md).
            for offset in 1..B {
                let peer = (home + offset) % B;
                let peer_guard = self.buckets[peer].lock();

                let mut node = (*self.links_ptr(Self::sentinel(peer))).next;
                while node != Self::sentinel(peer) {
                    let meta = self.meta[node].get();
                    if (*meta).refcnt == 0 {
                        self.rebind(node, dev, blockno);
                        self.unlink(node);
                        drop(peer_guard);
                        self.push_front(home, node);
                        drop(home_guard);
                        trace!("bcache{}: stole slot {} from bcache{}", home, node, peer);
                        return self.lock_slot(node, dev, blockno);
                    }
                    node = (*meta).links.next;
                }

                drop(peer_guard);
            }
        }

        panic!("bcache: out of buffers");
    }

    /// Number of slots currently on each bucket's list.
    pub fn bucket_lens(&self) -> ArrayVec<usize, B> {
        let mut lens = ArrayVec::new();
        for bucket in 0..B {
            let _guard = self.buckets[bucket].lock();
            let mut len = 0;
            // SAFETY: `bucket`'s lock is held.
            unsafe {
                let mut node = (*self.links_ptr(Self::sentinel(bucket))).next;
                while node != Self::sentinel(bucket) {
                    len += 1;
                    node = (*self.meta[node].get()).links.next;
                }
            }
            lens.push(len);
        }
        lens
    }

    /// Number of slots that are currently held or pinned.
    pub fn in_use(&self) -> usize {
        let mut count = 0;
        for bucket in 0..B {
            let _guard = self.buckets[bucket].lock();
            // SAFETY: `bucket`'s lock is held.
            unsafe {
                let mut node = (*self.links_ptr(Self::sentinel(bucket))).next;
                while node != Self::sentinel(bucket) {
                    let meta = self.meta[node].get();
                    if (*meta).refcnt > 0 {
                        count += 1;
                    }
                    node = (*meta).links.next;
                }
            }
        }
        count
    }

    /// Drop one holder reference of `slot`.
    ///
    /// The slot's position on its bucket list is left untouched: eviction
    /// order is scan order, not recency.
    pub(crate) fn release_slot(&self, slot: usize, blockno: BlockNo) {
        let bucket = Self::home_bucket(blockno);
        let _guard = self.buckets[bucket].lock();
        // SAFETY: The identity is pinned while refcnt > 0, so `bucket` is
        // the slot's current bucket and its lock covers the metadata.
        unsafe {
            let meta = self.meta[slot].get();
            debug_assert!((*meta).refcnt > 0);
            (*meta).refcnt -= 1;
        }
    }

    /// Add a holder reference to keep `slot` resident.
    pub(crate) fn pin_slot(&self, slot: usize, blockno: BlockNo) {
        let bucket = Self::home_bucket(blockno);
        let _guard = self.buckets[bucket].lock();
        // SAFETY: As in `release_slot`.
        unsafe {
            let meta = self.meta[slot].get();
            debug_assert!((*meta).refcnt > 0);
            (*meta).refcnt += 1;
        }
    }

    /// Drop a pin reference taken with [`pin_slot`](Self::pin_slot).
    pub(crate) fn unpin_slot(&self, slot: usize, blockno: BlockNo) {
        let bucket = Self::home_bucket(blockno);
        let _guard = self.buckets[bucket].lock();
        // SAFETY: As in `release_slot`.
        unsafe {
            let meta = self.meta[slot].get();
            if (*meta).refcnt <= 1 {
                panic!("bcache: unpin without matching pin");
            }
            (*meta).refcnt -= 1;
        }
    }

    fn sentinel(bucket: usize) -> usize {
        N + bucket
    }

    fn links_ptr(&self, node: usize) -> *mut Links {
        if node < N {
            // SAFETY: Only computes the field address; the caller accesses
            // it under the owning bucket's lock.
            unsafe { core::ptr::addr_of_mut!((*self.meta[node].get()).links) }
        } else {
            self.heads[node - N].get()
        }
    }

    /// Hand `slot` over to a new identity.
    ///
    /// Caller holds the lock of the slot's current bucket; the slot must
    /// be idle.
    unsafe fn rebind(&self, slot: usize, dev: DeviceId, blockno: BlockNo) {
        let meta = self.meta[slot].get();
        debug_assert_eq!((*meta).refcnt, 0);
        (*meta).dev = dev;
        (*meta).blockno = blockno;
        (*meta).refcnt = 1;
        self.bufs[slot].valid.store(false, Ordering::Relaxed);
    }

    /// Remove `slot` from the list it is on. Caller holds the owning
    /// bucket's lock.
    unsafe fn unlink(&self, slot: usize) {
        let Links { prev, next } = *self.links_ptr(slot);
        (*self.links_ptr(prev)).next = next;
        (*self.links_ptr(next)).prev = prev;
    }

    /// Insert `slot` at the head of `bucket`'s list. Caller holds
    /// `bucket`'s lock.
    unsafe fn push_front(&self, bucket: usize, slot: usize) {
        let sentinel = Self::sentinel(bucket);
        let first = (*self.links_ptr(sentinel)).next;
        *self.links_ptr(slot) = Links {
            prev: sentinel,
            next: first,
        };
        (*self.links_ptr(first)).prev = slot;
        (*self.links_ptr(sentinel)).next = slot;
    }

    fn lock_slot(&self, slot: usize, dev: DeviceId, blockno: BlockNo) -> Buf<'_, D, N, B> {
        let data = self.bufs[slot].data.lock();
        Buf::new(self, slot, dev, blockno, data)
    }
}

impl<D: BlockDevice, const N: usize, const B: usize> BufferCache<D, N, B> {
    /// Return a locked buffer holding the current contents of
    /// `(dev, blockno)`.
    pub fn read(&self, dev: DeviceId, blockno: BlockNo) -> Buf<'_, D, N, B> {
        let mut buf = self.get(dev, blockno);
        buf.fill();
        buf
    }
}

impl<D, const N: usize, const B: usize> fmt::Debug for BufferCache<D, N, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("slots", &N)
            .field("buckets", &B)
            .field("in_use", &self.in_use())
            .finish()
    }
}
