use core::mem;
use core::ptr;

use static_assertions::const_assert;
use zerocopy::AsBytes;

use super::inode::Dinode;
use crate::bio::Buf;
use crate::param::BSIZE;

/// Disk layout:
/// [ boot block | super block | log header + log blocks |
///                            inode blocks | free bit map | data blocks ]
///
/// mkfs computes the super block and builds an initial file system. The
/// super block describes the disk layout:
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes)]
pub struct Superblock {
    /// Size of file system image (blocks)
    pub num_blocks: u32,

    /// Number of data blocks
    pub num_data_blocks: u32,

    /// Number of inodes
    pub num_inodes: u32,

    /// Number of log blocks, header included
    pub num_log_blocks: u32,

    /// Block number of the log header
    pub log_start: u32,

    /// Block number of the first inode block
    pub inode_start: u32,

    /// Block number of the free bitmap
    pub bitmap_start: u32,
}

/// Inodes per block.
pub const IPB: usize = BSIZE / mem::size_of::<Dinode>();

impl Superblock {
    /// Reads the super block out of `buf` (disk block 1). Fields are
    /// little-endian u32s read in place, as mkfs wrote them.
    pub fn new(buf: &Buf) -> Self {
        const_assert!(mem::size_of::<Superblock>() <= BSIZE);
        // SAFETY: Superblock contains only u32s and buf.data is aligned.
        let result = unsafe { ptr::read(buf.data().as_ptr() as *const Superblock) };
        assert!(
            result.log_start < result.inode_start
                && result.inode_start <= result.bitmap_start
                && result.bitmap_start < result.num_blocks,
            "corrupt super block"
        );
        result
    }

    /// Block containing inode `inum`.
    pub const fn iblock(self, inum: u32) -> u32 {
        inum / IPB as u32 + self.inode_start
    }
}
