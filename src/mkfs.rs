//! Formats a block device with an empty file system.
//!
//! Lays down the superblock, an empty log, the inode table with the root
//! directory (holding "." and ".."), and the free bitmap with every
//! metadata block marked used.

use core::mem;

use zerocopy::AsBytes;

use crate::fs::{Dinode, Dirent, FileName, Superblock, DINODE_DIR, DIRENT_SIZE, IPB, NDIRECT, ROOTINO};
use crate::hal::BlockDevice;
use crate::param::{BSIZE, LOGSIZE};

/// Formats `device` as an empty file system with `num_blocks` total blocks
/// and `num_inodes` inode slots. Returns the superblock it wrote.
///
/// Bit `b` of the (single) bitmap block covers disk block `b`, so the
/// whole image must fit in one bitmap block's worth of bits.
pub fn mkfs(device: &dyn BlockDevice, num_blocks: u32, num_inodes: u32) -> Superblock {
    assert!(
        num_blocks as usize <= BSIZE * 8,
        "mkfs: bitmap must fit in one block"
    );
    assert!(num_inodes >= 2, "mkfs: too few inodes");

    let num_log_blocks = LOGSIZE as u32 + 1;
    let log_start = 2;
    let inode_start = log_start + num_log_blocks;
    let num_inode_blocks = (num_inodes + IPB as u32 - 1) / IPB as u32;
    let bitmap_start = inode_start + num_inode_blocks;
    let data_start = bitmap_start + 1;
    assert!(data_start + 1 < num_blocks, "mkfs: disk too small");

    let sb = Superblock {
        num_blocks,
        num_data_blocks: num_blocks - data_start,
        num_inodes,
        num_log_blocks,
        log_start,
        inode_start,
        bitmap_start,
    };

    let zero = [0u8; BSIZE];
    for b in 0..num_blocks {
        device.write(b, &zero);
    }

    // Super block.
    let mut buf = [0u8; BSIZE];
    buf[..mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
    device.write(1, &buf);

    // Root directory inode.
    let root_block = data_start;
    let mut root = Dinode {
        typ: DINODE_DIR,
        major: 0,
        minor: 0,
        nlink: 1,
        size: (2 * DIRENT_SIZE) as u32,
        addr_direct: [0; NDIRECT],
        addr_indirect: 0,
    };
    root.addr_direct[0] = root_block;
    let mut buf = [0u8; BSIZE];
    let off = ROOTINO as usize % IPB * mem::size_of::<Dinode>();
    buf[off..off + mem::size_of::<Dinode>()].copy_from_slice(root.as_bytes());
    device.write(sb.iblock(ROOTINO), &buf);

    // Root directory content: "." and "..", both the root itself.
    // SAFETY: neither name contains NUL characters.
    let dot = Dirent::with_name(ROOTINO, unsafe { FileName::from_bytes(b".") });
    let dotdot = Dirent::with_name(ROOTINO, unsafe { FileName::from_bytes(b"..") });
    let mut buf = [0u8; BSIZE];
    buf[..DIRENT_SIZE].copy_from_slice(dot.as_bytes());
    buf[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(dotdot.as_bytes());
    device.write(root_block, &buf);

    // Free bitmap: every block up to and including the root's data block
    // is in use.
    let mut buf = [0u8; BSIZE];
    for b in 0..=root_block {
        buf[(b / 8) as usize] |= 1 << (b % 8);
    }
    device.write(bitmap_start, &buf);

    log::debug!(
        "mkfs: {} blocks ({} data), {} inodes, log at {}, inodes at {}, bitmap at {}",
        num_blocks,
        sb.num_data_blocks,
        num_inodes,
        log_start,
        inode_start,
        bitmap_start
    );
    sb
}
