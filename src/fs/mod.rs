//! File system implementation. Five layers:
//!   + Blocks: allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, reading, writing, metadata.
//!   + Directories: inode with special contents (list of other inodes!)
//!   + Names: paths like /usr/rtm/xv6/fs.c for convenient naming.
//!
//! This module contains the low-level file system manipulation routines.
//! The (higher-level) system call implementations are in sysfile.rs.
//!
//! Lock order, outermost first: the file table, the inode table, inode
//! sleep-locks, the free-bitmap lock, block sleep-locks, and the log lock
//! innermost. The allocator scans the bitmap from under an inode
//! sleep-lock, and `Tx::write` hands the log a still-locked buffer, which
//! is what pushes the bitmap and log locks to the inner ranks. The cache's
//! list lock, pipe locks and the wait channels' internals are leaves, held
//! across no other acquire; commit runs with the log lock released, so it
//! can sleep on buffer locks and device writes.

use core::cell::{Cell, UnsafeCell};
use std::sync::Arc;

use array_macro::array;
use spin::Once;

mod inode;
mod log;
mod path;
mod stat;
mod superblock;

pub use inode::{
    Dinode, Dirent, Inode, InodeGuard, InodeInner, InodeType, Itable, RcInode, DIRENT_SIZE, DIRSIZ,
    MAXFILE, NDIRECT, NINDIRECT, ROOTINO,
};
pub use path::{FileName, Path};
pub use stat::{Stat, T_DEVICE, T_DIR, T_FILE};
pub use superblock::{Superblock, IPB};

pub(crate) use inode::DINODE_DIR;

use self::log::Log;
use crate::bio::{Bcache, Buf};
use crate::console::CharDevice;
use crate::fcntl::FcntlFlags;
use crate::file::FileType;
use crate::hal::BlockDevice;
use crate::lock::{SleepableLock, SpinLock};
use crate::param::{MAXOPBLOCKS, NDEV};
use crate::proc::KernelCtx;

/// The filesystem: every layer of the stack over one block device.
pub struct FileSystem {
    bcache: Bcache,

    /// Initialized once at mount time; there would be one superblock per
    /// disk device, but we run with only one device.
    superblock: Once<Superblock>,
    log: Once<SleepableLock<Log>>,

    itable: Itable,
    ftable: crate::file::FTable,

    /// Map from major device number to the device behind it.
    devsw: SpinLock<[Option<Arc<dyn CharDevice>>; NDEV]>,

    /// Serializes free-bitmap scans.
    bitmap_lock: SpinLock<()>,
}

impl FileSystem {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            bcache: Bcache::new(device),
            superblock: Once::new(),
            log: Once::new(),
            itable: Itable::new(),
            ftable: crate::file::FTable::new(),
            devsw: SpinLock::new("devsw", array![_ => None; NDEV]),
            bitmap_lock: SpinLock::new("bitmap", ()),
        }
    }

    /// Mounts the filesystem: loads the superblock and replays any
    /// committed-but-uninstalled log. Runs once; later calls are no-ops.
    pub fn init(&self) {
        if !self.superblock.is_completed() {
            let buf = self.bcache.read(1);
            let superblock = self.superblock.call_once(|| Superblock::new(&buf));
            drop(buf);
            let _ = self.log.call_once(|| {
                SleepableLock::new(
                    "log",
                    Log::new(superblock.log_start, superblock.num_log_blocks, self),
                )
            });
        }
    }

    pub(crate) fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub(crate) fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("superblock")
    }

    pub(crate) fn log(&self) -> &SleepableLock<Log> {
        self.log.get().expect("log")
    }

    pub(crate) fn itable(&self) -> &Itable {
        &self.itable
    }

    pub(crate) fn ftable(&self) -> &crate::file::FTable {
        &self.ftable
    }

    /// Routes device inodes with major number `major` to `device`.
    pub fn register_device(&self, major: u16, device: Arc<dyn CharDevice>) {
        self.devsw.lock()[major as usize] = Some(device);
    }

    pub(crate) fn device(&self, major: u16) -> Option<Arc<dyn CharDevice>> {
        self.devsw.lock().get(major as usize)?.clone()
    }

    /// The root directory.
    pub fn root(&self) -> RcInode {
        self.itable.root()
    }

    /// Begins a filesystem transaction, blocking while the log is too full
    /// to admit another operation. The transaction commits (as part of its
    /// group) when the handle drops.
    pub fn begin_tx(&self) -> Tx<'_> {
        self.log().begin_op();
        Tx {
            fs: self,
            rm: Cell::new(MAXOPBLOCKS),
        }
    }
}

/// A running filesystem transaction. All journaled writes go through this
/// handle, which tracks the operation's remaining write budget.
pub struct Tx<'s> {
    fs: &'s FileSystem,

    /// Remaining write budget: how many more distinct blocks this
    /// operation may record.
    rm: Cell<usize>,
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        self.fs.log().end_op(self.fs);
    }
}

impl Tx<'_> {
    /// Caller has modified `b.data` and is done with the buffer: record it
    /// in the log. The write reaches its home location when the group
    /// commits. Repeated writes of one block consume budget only once.
    pub fn write(&self, b: Buf) {
        let fresh = self.fs.log().lock().write(b);
        if fresh {
            assert!(self.rm.get() > 0, "transaction write budget exhausted");
            self.rm.set(self.rm.get() - 1);
        }
    }

    /// Zero a block.
    fn bzero(&self, bno: u32) {
        let buf = self.fs.bcache().get_buf_and_clear(bno);
        self.write(buf);
    }

    /// Allocate a zeroed disk block.
    pub(crate) fn balloc(&self) -> u32 {
        let fs = self.fs;
        let _bitmap = fs.bitmap_lock.lock();
        let mut bp = fs.bcache().read(fs.superblock().bitmap_start);
        for b in 0..fs.superblock().num_blocks {
            let m = 1u8 << (b % 8);
            if bp.data()[(b / 8) as usize] & m == 0 {
                // The block is free.
                bp.data_mut()[(b / 8) as usize] |= m;
                self.write(bp);
                self.bzero(b);
                return b;
            }
        }
        panic!("balloc: out of blocks");
    }

    /// Free a disk block. The block's contents are left in place; balloc
    /// zeroes on allocation.
    pub(crate) fn bfree(&self, b: u32) {
        let fs = self.fs;
        let _bitmap = fs.bitmap_lock.lock();
        let mut bp = fs.bcache().read(fs.superblock().bitmap_start);
        let m = 1u8 << (b % 8);
        assert_ne!(bp.data()[(b / 8) as usize] & m, 0, "freeing free block");
        bp.data_mut()[(b / 8) as usize] &= !m;
        self.write(bp);
    }
}

impl FileSystem {
    /// Creates an inode at `path` with type `typ` and runs `f` on it while
    /// it is still locked. If the path already names an inode, it is
    /// returned instead, but only when a regular file was asked for and
    /// found (or a device node: opening an existing node is fine).
    /// New directories get their "." and ".." entries atomically.
    pub(crate) fn create<F, T>(
        &self,
        path: &Path,
        typ: InodeType,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
        f: F,
    ) -> Result<(RcInode, T), ()>
    where
        F: FnOnce(&mut InodeGuard<'_>) -> T,
    {
        let (ptr, name) = self.itable.nameiparent(path, tx, ctx)?;
        let ptr = scopeguard::guard(ptr, |ptr| ptr.put(tx, ctx));
        let mut dp = ptr.lock(ctx);

        if let Ok((ptr2, _)) = dp.dirlookup(name, ctx) {
            let ptr2 = scopeguard::guard(ptr2, |ptr| ptr.put(tx, ctx));
            drop(dp);
            if typ != InodeType::File {
                return Err(());
            }
            let mut ip = ptr2.lock(ctx);
            if let InodeType::None | InodeType::Dir = ip.deref_inner().typ {
                return Err(());
            }
            let ret = f(&mut ip);
            drop(ip);
            return Ok((scopeguard::ScopeGuard::into_inner(ptr2), ret));
        }

        let ptr2 = self.itable.alloc_inode(typ, tx, ctx);
        let mut ip = ptr2.lock(ctx);
        ip.deref_inner_mut().nlink = 1;
        ip.update(tx, ctx);

        // Create . and .. entries.
        if typ == InodeType::Dir {
            // for ".."
            dp.deref_inner_mut().nlink += 1;
            dp.update(tx, ctx);

            let inum = ip.inum;
            // No nlink++ for ".": avoid cyclic ref count.
            // SAFETY: b"." and b".." contain no NUL characters.
            ip.dirlink(unsafe { FileName::from_bytes(b".") }, inum, tx, ctx)
                .and_then(|_| ip.dirlink(unsafe { FileName::from_bytes(b"..") }, dp.inum, tx, ctx))
                .expect("create dots");
        }

        dp.dirlink(name, ip.inum, tx, ctx).expect("create: dirlink");
        let ret = f(&mut ip);
        drop(ip);
        drop(dp);
        Ok((ptr2, ret))
    }

    /// Opens `path` with the given mode, allocating an open file and a
    /// file descriptor for it. Returns the file descriptor.
    pub(crate) fn open(
        &self,
        path: &Path,
        omode: FcntlFlags,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize, ()> {
        let (ip, typ) = if omode.contains(FcntlFlags::O_CREATE) {
            self.create(path, InodeType::File, tx, ctx, |ip| ip.deref_inner().typ)?
        } else {
            let ptr = self.itable.namei(path, tx, ctx)?;
            let ptr = scopeguard::guard(ptr, |ptr| ptr.put(tx, ctx));
            let ip = ptr.lock(ctx);
            let typ = ip.deref_inner().typ;

            // Directories may only be opened read-only.
            if typ == InodeType::Dir && omode != FcntlFlags::O_RDONLY {
                return Err(());
            }
            drop(ip);
            (scopeguard::ScopeGuard::into_inner(ptr), typ)
        };

        let filetype = match typ {
            InodeType::Device { major, .. } => FileType::Device { ip, major },
            _ => FileType::Inode {
                ip,
                off: UnsafeCell::new(0),
            },
        };

        let f = self.ftable.alloc_file(
            filetype,
            !omode.intersects(FcntlFlags::O_WRONLY),
            omode.intersects(FcntlFlags::O_WRONLY | FcntlFlags::O_RDWR),
        )?;

        match ctx.fdalloc(f) {
            Ok(fd) => Ok(fd),
            Err(f) => {
                self.ftable.close(f, ctx);
                Err(())
            }
        }
    }

    /// Unlinks the file or (empty) directory at `path`.
    pub(crate) fn unlink(&self, path: &Path, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> Result<(), ()> {
        let (ptr, name) = self.itable.nameiparent(path, tx, ctx)?;
        let ptr = scopeguard::guard(ptr, |ptr| ptr.put(tx, ctx));
        let mut dp = ptr.lock(ctx);

        // Cannot unlink "." or "..".
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(());
        }

        let (ptr2, off) = dp.dirlookup(name, ctx)?;
        let ptr2 = scopeguard::guard(ptr2, |ptr| ptr.put(tx, ctx));
        let mut ip = ptr2.lock(ctx);
        assert!(ip.deref_inner().nlink >= 1, "unlink: nlink < 1");

        if ip.deref_inner().typ == InodeType::Dir && !ip.is_dir_empty(ctx) {
            return Err(());
        }

        dp.dirremove(off, tx, ctx);
        if ip.deref_inner().typ == InodeType::Dir {
            // The removed directory's ".." no longer references dp.
            dp.deref_inner_mut().nlink -= 1;
            dp.update(tx, ctx);
        }
        drop(dp);
        drop(ptr);

        ip.deref_inner_mut().nlink -= 1;
        ip.update(tx, ctx);
        Ok(())
    }

    /// Replaces the calling process's working directory with `inode`,
    /// which must be a directory.
    pub(crate) fn chdir(
        &self,
        inode: RcInode,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<(), ()> {
        let ip = inode.lock(ctx);
        let typ = ip.deref_inner().typ;
        drop(ip);
        if typ != InodeType::Dir {
            inode.put(tx, ctx);
            return Err(());
        }

        let old = ctx.proc().cwd().lock().replace(inode);
        if let Some(old) = old {
            old.put(tx, ctx);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::FileSystem;
    use crate::hal::MemDisk;
    use crate::mkfs::mkfs;
    use crate::proc::Proc;

    /// A formatted in-memory filesystem plus its raw device.
    pub(crate) fn test_fs(nblocks: usize) -> (Arc<MemDisk>, FileSystem) {
        let _ = env_logger::builder().is_test(true).try_init();
        let disk = Arc::new(MemDisk::new(nblocks));
        mkfs(&*disk, nblocks as u32, 64);
        let fs = FileSystem::new(disk.clone());
        fs.init();
        (disk, fs)
    }

    pub(crate) fn test_proc() -> Proc {
        Proc::new()
    }

    #[test]
    fn open_and_close_leave_the_file_table_unchanged() {
        use crate::fcntl::FcntlFlags;
        use crate::proc::KernelCtx;
        use crate::sysfile::AT_FDCWD;

        let (_, fs) = test_fs(512);
        let proc = test_proc();
        let ctx = KernelCtx::new(&fs, &proc);
        // SAFETY: the path contains no NUL bytes.
        let path = unsafe { super::Path::from_bytes(b"/t") };

        assert_eq!(fs.ftable().live_slots(), 0);
        let fd = ctx
            .sys_openat(AT_FDCWD, path, FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
            .unwrap();
        assert_eq!(fs.ftable().live_slots(), 1);
        ctx.sys_close(fd).unwrap();
        assert_eq!(fs.ftable().live_slots(), 0);
    }
}
