//! The hardware seam of the filesystem core: the block device it drives.
//!
//! The kernel's driver stack sits behind `BlockDevice`. `Partition` adds
//! the fixed partition offset an MBR-partitioned disk requires, and
//! `MemDisk` backs tests and image tooling with plain memory.

use std::sync::Arc;
use std::vec::Vec;

use crate::lock::SpinLock;
use crate::param::BSIZE;

/// A synchronous block device.
///
/// The device is assumed reliable: implementations panic on I/O failure
/// rather than surfacing errors, and the filesystem treats such a panic as
/// fatal.
pub trait BlockDevice: Send + Sync {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]);
    fn write(&self, block_no: u32, buf: &[u8; BSIZE]);
}

impl<D: BlockDevice + ?Sized> BlockDevice for Arc<D> {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
        (**self).read(block_no, buf)
    }

    fn write(&self, block_no: u32, buf: &[u8; BSIZE]) {
        (**self).write(block_no, buf)
    }
}

impl<'a, D: BlockDevice + ?Sized> BlockDevice for &'a D {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
        (**self).read(block_no, buf)
    }

    fn write(&self, block_no: u32, buf: &[u8; BSIZE]) {
        (**self).write(block_no, buf)
    }
}

/// Byte offset of the partition table inside the boot sector.
const MBR_PARTITION_TABLE: usize = 0x1be;
/// Size of one partition table entry.
const MBR_ENTRY_SIZE: usize = 16;
/// Byte offset of the start LBA inside a partition table entry.
const MBR_ENTRY_LBA: usize = 8;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xaa];

/// Adapter that adds a fixed logical offset (the partition's start LBA) to
/// every block number before the request reaches the underlying device.
pub struct Partition<D> {
    inner: D,
    start: u32,
}

impl<D: BlockDevice> Partition<D> {
    /// Opens the partition described by the second entry of the MBR
    /// partition table in block 0 of `inner`.
    pub fn open(inner: D) -> Self {
        let mut boot = [0u8; BSIZE];
        inner.read(0, &mut boot);
        assert_eq!(boot[510..512], MBR_SIGNATURE, "bad MBR signature");
        let entry = MBR_PARTITION_TABLE + MBR_ENTRY_SIZE;
        let lba = entry + MBR_ENTRY_LBA;
        let start = u32::from_le_bytes([
            boot[lba],
            boot[lba + 1],
            boot[lba + 2],
            boot[lba + 3],
        ]);
        log::debug!("partition starts at lba {}", start);
        Self { inner, start }
    }

    /// Wraps `inner` with a known partition offset.
    pub fn new(inner: D, start: u32) -> Self {
        Self { inner, start }
    }
}

impl<D: BlockDevice> BlockDevice for Partition<D> {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
        self.inner.read(block_no + self.start, buf)
    }

    fn write(&self, block_no: u32, buf: &[u8; BSIZE]) {
        self.inner.write(block_no + self.start, buf)
    }
}

/// An in-memory block device, for tests and image tooling.
pub struct MemDisk {
    blocks: SpinLock<Vec<[u8; BSIZE]>>,
}

impl MemDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: SpinLock::new("memdisk", vec![[0; BSIZE]; nblocks]),
        }
    }

    /// Snapshot of a single block, for assertions on raw device state.
    pub fn block(&self, block_no: u32) -> [u8; BSIZE] {
        self.blocks.lock()[block_no as usize]
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
        *buf = self.blocks.lock()[block_no as usize];
    }

    fn write(&self, block_no: u32, buf: &[u8; BSIZE]) {
        self.blocks.lock()[block_no as usize] = *buf;
    }
}
