// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The handle to an exclusively held cache buffer.

use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::Ordering;

use crate::blockdev::{BlockData, BlockDevice, BlockNo, DeviceId};
use crate::sleeplock::SleepLockGuard;

use super::BufferCache;

/// An exclusively locked buffer bound to one `(device, block)` identity.
///
/// Holding a `Buf` is what the exclusive lock protects: only the holder
/// may look at or change the payload. Dropping it releases the lock (one
/// waiter proceeds) and then gives up the holder reference; the identity
/// stays cached until the slot gets recycled.
pub struct Buf<'a, D, const N: usize, const B: usize> {
    cache: &'a BufferCache<D, N, B>,
    slot: usize,
    dev: DeviceId,
    blockno: BlockNo,
    /// `Some` until drop; taken there so the exclusive lock is released
    /// before the holder reference goes away.
    data: Option<SleepLockGuard<'a, BlockData>>,
}

impl<'a, D, const N: usize, const B: usize> Buf<'a, D, N, B> {
    pub(super) fn new(
        cache: &'a BufferCache<D, N, B>,
        slot: usize,
        dev: DeviceId,
        blockno: BlockNo,
        data: SleepLockGuard<'a, BlockData>,
    ) -> Buf<'a, D, N, B> {
        Buf {
            cache,
            slot,
            dev,
            blockno,
            data: Some(data),
        }
    }

    /// The device this buffer belongs to.
    pub fn device_id(&self) -> DeviceId {
        self.dev
    }

    /// The block number this buffer is bound to.
    pub fn blockno(&self) -> BlockNo {
        self.blockno
    }

    /// The slot backing this buffer.
    #[cfg(test)]
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// Keep the slot resident past the lifetime of this handle.
    ///
    /// The extra holder reference survives the drop of the `Buf`; it is
    /// given up again by re-acquiring the block and calling
    /// [`unpin`](Self::unpin).
    pub fn pin(&self) {
        self.cache.pin_slot(self.slot, self.blockno);
    }

    /// Drop a reference previously taken with [`pin`](Self::pin).
    ///
    /// Panics if the slot holds no pin reference.
    pub fn unpin(&self) {
        self.cache.unpin_slot(self.slot, self.blockno);
    }
}

impl<D: BlockDevice, const N: usize, const B: usize> Buf<'_, D, N, B> {
    /// Make sure the payload reflects device contents.
    ///
    /// Reads the block from the device once after the slot was (re)bound;
    /// later calls are free.
    pub fn fill(&mut self) {
        let inner = &self.cache.bufs[self.slot];
        if !inner.valid.load(Ordering::Relaxed) {
            let data = self.data.as_mut().expect("payload guard missing");
            self.cache.device.read_block(self.dev, self.blockno, data);
            inner.valid.store(true, Ordering::Relaxed);
        }
    }

    /// Write the payload back to the device.
    pub fn commit(&self) {
        let data = self.data.as_ref().expect("payload guard missing");
        self.cache.device.write_block(self.dev, self.blockno, data);
    }
}

impl<D, const N: usize, const B: usize> Deref for Buf<'_, D, N, B> {
    type Target = BlockData;

    fn deref(&self) -> &BlockData {
        self.data.as_ref().expect("payload guard missing")
    }
}

impl<D, const N: usize, const B: usize> DerefMut for Buf<'_, D, N, B> {
    fn deref_mut(&mut self) -> &mut BlockData {
        self.data.as_mut().expect("payload guard missing")
    }
}

impl<D, const N: usize, const B: usize> Drop for Buf<'_, D, N, B> {
    fn drop(&mut self) {
        // Unlock before dropping the holder reference: a slot must never
        // look idle while its payload is still locked.
        drop(self.data.take());
        self.cache.release_slot(self.slot, self.blockno);
    }
}

impl<D, const N: usize, const B: usize> fmt::Debug for Buf<'_, D, N, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("dev", &self.dev)
            .field("blockno", &self.blockno)
            .field("slot", &self.slot)
            .finish()
    }
}
