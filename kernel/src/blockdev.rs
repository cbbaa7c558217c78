// Copyright © 2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The block device seam the buffer cache sits on.
//!
//! The cache only ever issues whole-block, synchronous transfers; queueing,
//! retries and error recovery are the device driver's concern.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

/// Size of one device block (in bytes).
pub const BLOCK_SIZE: usize = 1024;

/// Identifies a block device instance.
pub type DeviceId = u32;

/// A block number on a device.
pub type BlockNo = u32;

/// The payload of one block.
pub type BlockData = [u8; BLOCK_SIZE];

/// A device that transfers whole blocks, synchronously.
///
/// Implementations may suspend internally; from the cache's perspective the
/// calls have completed when they return.
pub trait BlockDevice: Send + Sync {
    /// Read block `blockno` of device `dev` into `data`.
    fn read_block(&self, dev: DeviceId, blockno: BlockNo, data: &mut BlockData);

    /// Write `data` to block `blockno` of device `dev`.
    fn write_block(&self, dev: DeviceId, blockno: BlockNo, data: &BlockData);
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn read_block(&self, dev: DeviceId, blockno: BlockNo, data: &mut BlockData) {
        (**self).read_block(dev, blockno, data)
    }

    fn write_block(&self, dev: DeviceId, blockno: BlockNo, data: &BlockData) {
        (**self).write_block(dev, blockno, data)
    }
}

/// A RAM-backed block device.
///
/// Stands in for real storage on hosted builds; transfer counters make it
/// possible to observe how often the cache actually reaches the device.
pub struct MemDisk {
    blocks: Vec<Mutex<BlockData>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    /// Create a zero-filled disk with `nblocks` blocks.
    pub fn new(nblocks: usize) -> MemDisk {
        let mut blocks = Vec::with_capacity(nblocks);
        for _ in 0..nblocks {
            blocks.push(Mutex::new([0; BLOCK_SIZE]));
        }

        MemDisk {
            blocks,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// How many block reads the device has served.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// How many block writes the device has served.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, _dev: DeviceId, blockno: BlockNo, data: &mut BlockData) {
        let block = self.blocks[blockno as usize].lock();
        data.copy_from_slice(&*block);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_block(&self, _dev: DeviceId, blockno: BlockNo, data: &BlockData) {
        let mut block = self.blocks[blockno as usize].lock();
        block.copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let disk = MemDisk::new(4);

        let mut data = [0u8; BLOCK_SIZE];
        data[0] = 0xab;
        data[BLOCK_SIZE - 1] = 0xcd;
        disk.write_block(0, 2, &data);

        let mut readback = [0u8; BLOCK_SIZE];
        disk.read_block(0, 2, &mut readback);
        assert_eq!(readback[0], 0xab);
        assert_eq!(readback[BLOCK_SIZE - 1], 0xcd);

        assert_eq!(disk.reads(), 1);
        assert_eq!(disk.writes(), 1);
    }

    #[test]
    #[should_panic]
    fn out_of_range_block_panics() {
        let disk = MemDisk::new(1);
        let mut data = [0u8; BLOCK_SIZE];
        disk.read_block(0, 1, &mut data);
    }
}
