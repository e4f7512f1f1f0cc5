//! Inodes.
//!
//! An inode describes a single unnamed file. The inode disk structure
//! holds metadata: the file's type, its size, the number of links referring
//! to it, and the list of blocks holding the file's content.
//!
//! The inodes are laid out sequentially on disk at `superblock.inode_start`.
//! Each inode has a number, indicating its position on the disk.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple threads. The
//! in-memory inodes include book-keeping information that is not stored on
//! disk: the reference count and the `valid` flag.
//!
//! * Allocation: an inode is allocated if its type (on disk) is non-zero.
//!   `Itable::alloc_inode` allocates, and `RcInode::put` frees if the
//!   reference and link counts have fallen to zero.
//!
//! * Referencing in table: an entry in the inode table is shared by all
//!   holders of the same inode number; `Itable::get_inode` finds or creates
//!   the entry and increments its count, cloning an `RcInode` shares it,
//!   and `RcInode::put` (or a plain drop) releases it.
//!
//! * Valid: the information in an inode table entry is only correct when
//!   `valid` is true. `Inode::lock` reads the inode from disk and sets
//!   `valid`; content is loaded lazily, never at `get_inode` time.
//!
//! * Locked: filesystem code may only examine and modify the information in
//!   an inode and its content after locking it.
//!
//! Thus a typical sequence is:
//!   `let ip = itable.get_inode(inum);`
//!   `let guard = ip.lock(ctx);`
//!   ... examine and modify the inode ...
//!   `drop(guard);`
//!   `ip.put(&tx, ctx);`
//!
//! `lock` is separate from `get_inode` so that system calls can keep a
//! long-term reference to an inode (as for an open file) and only lock it
//! for short periods (e.g., in read). The separation also helps avoid
//! deadlock and races during pathname lookup.

use core::iter::StepBy;
use core::mem;
use core::ops::{Deref, Range};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::stat::{T_DEVICE, T_DIR, T_FILE};
use super::superblock::IPB;
use super::{FileName, Path, Stat, Tx};
use crate::bio::BufData;
use crate::lock::{SleepLock, SpinLock};
use crate::param::{BSIZE, NINODE};
use crate::proc::KernelCtx;

/// Directory name length.
pub const DIRSIZ: usize = 12;

/// Directory entry size.
pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

/// Root inode number.
pub const ROOTINO: u32 = 1;

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
/// Largest file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// On-disk inode type tags.
pub(crate) const DINODE_NONE: u16 = 0;
pub(crate) const DINODE_DIR: u16 = 1;
pub(crate) const DINODE_FILE: u16 = 2;
pub(crate) const DINODE_DEVICE: u16 = 3;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

/// On-disk inode structure.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct Dinode {
    /// File type tag (DINODE_*); DINODE_NONE marks a free slot.
    pub(crate) typ: u16,

    /// Major device number (DINODE_DEVICE only)
    pub(crate) major: u16,

    /// Minor device number (DINODE_DEVICE only)
    pub(crate) minor: u16,

    /// Number of links to inode in file system
    pub(crate) nlink: u16,

    /// Size of file (bytes)
    pub(crate) size: u32,

    /// Direct data block addresses
    pub(crate) addr_direct: [u32; NDIRECT],

    /// Indirect data block address
    pub(crate) addr_indirect: u32,
}

const_assert!(mem::size_of::<Dinode>() == 64);
const_assert!(BSIZE % mem::size_of::<Dinode>() == 0);

#[repr(C)]
#[derive(Default, AsBytes, FromBytes)]
pub struct Dirent {
    /// Referenced inode number; 0 marks an unused entry.
    pub inum: u32,
    name: [u8; DIRSIZ],
}

const_assert!(mem::size_of::<Dirent>() == 16);

impl Dirent {
    /// Builds an entry in place, for image tooling.
    pub(crate) fn with_name(inum: u32, name: &FileName) -> Dirent {
        let mut dirent = Dirent::default();
        dirent.inum = inum;
        dirent.set_name(name);
        dirent
    }

    fn new(ip: &mut InodeGuard<'_>, off: u32, ctx: &KernelCtx<'_>) -> Result<Dirent, ()> {
        let mut dirent = Dirent::default();
        ip.read_kernel(&mut dirent, off, ctx)?;
        Ok(dirent)
    }

    /// Fill in name. If name is shorter than DIRSIZ, NUL character is
    /// appended as terminator.
    ///
    /// `name` must not contain NUL characters, but this is not a safety
    /// invariant.
    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// Returns a slice which exactly contains `name`.
    ///
    /// It contains no NUL characters.
    fn get_name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        // SAFETY: self.name[..len] doesn't contain '\0', and len <= DIRSIZ.
        unsafe { FileName::from_bytes(&self.name[..len]) }
    }
}

/// In-memory copy of a disk inode, protected by the inode's sleep-lock.
pub struct InodeInner {
    /// inode has been read from disk?
    pub valid: bool,
    /// copy of disk inode
    pub typ: InodeType,
    pub nlink: u16,
    pub size: u32,
    pub addr_direct: [u32; NDIRECT],
    pub addr_indirect: u32,
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            addr_direct: [0; NDIRECT],
            addr_indirect: 0,
        }
    }
}

/// An in-memory inode: identity, reference count and the lock-protected
/// copy of its disk state.
pub struct Inode {
    pub inum: u32,

    /// Number of `RcInode` handles. Transitions from zero (resurrecting a
    /// cached entry) happen only under the itable lock.
    nref: AtomicUsize,

    pub(crate) inner: SleepLock<InodeInner>,
}

impl Inode {
    /// Locks the inode, reading its content from disk if it has not been
    /// loaded yet. Because the load happens under the inode's own lock,
    /// anyone who finds a fresh table entry simply blocks here until the
    /// initial load completes.
    pub fn lock<'a>(&'a self, ctx: &KernelCtx<'_>) -> InodeGuard<'a> {
        let fs = ctx.fs();
        let mut guard = self.inner.lock();
        if !guard.valid {
            let bp = fs.bcache().read(fs.superblock().iblock(self.inum));

            const_assert!(IPB <= mem::size_of::<BufData>() / mem::size_of::<Dinode>());
            const_assert!(mem::align_of::<BufData>() % mem::align_of::<Dinode>() == 0);
            // SAFETY: dip is aligned properly and lies inside bp.data, and
            // we hold the buffer lock.
            let dip =
                unsafe { &*(bp.data().as_ptr() as *const Dinode).add(self.inum as usize % IPB) };

            guard.typ = match dip.typ {
                DINODE_NONE => InodeType::None,
                DINODE_DIR => InodeType::Dir,
                DINODE_FILE => InodeType::File,
                DINODE_DEVICE => InodeType::Device {
                    major: dip.major,
                    minor: dip.minor,
                },
                t => panic!("Inode::lock: unknown type {}", t),
            };
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addr_direct.copy_from_slice(&dip.addr_direct);
            guard.addr_indirect = dip.addr_indirect;
            drop(bp);
            guard.valid = true;
            assert_ne!(guard.typ, InodeType::None, "Inode::lock: no type");
        }
        mem::forget(guard);
        InodeGuard { inode: self }
    }

    /// Copy stat information from inode.
    pub fn stat(&self, ctx: &KernelCtx<'_>) -> Stat {
        let ip = self.lock(ctx);
        let inner = ip.deref_inner();
        Stat {
            dev: 1,
            ino: ip.inum,
            typ: match inner.typ {
                InodeType::None => 0,
                InodeType::Dir => T_DIR,
                InodeType::File => T_FILE,
                InodeType::Device { .. } => T_DEVICE,
            },
            nlink: inner.nlink,
            size: inner.size as usize,
        }
    }
}

/// A shared reference to an in-memory inode. Cloning shares the handle.
///
/// `put` releases the handle inside a transaction, so that an unlinked
/// inode's disk space can be reclaimed when the last holder lets go. A
/// plain drop releases only the in-memory reference; every path that can
/// drop the last reference to an unlinked inode calls `put`.
pub struct RcInode(Arc<Inode>);

impl Clone for RcInode {
    fn clone(&self) -> Self {
        self.0.nref.fetch_add(1, Ordering::Relaxed);
        RcInode(self.0.clone())
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        self.0.nref.fetch_sub(1, Ordering::Release);
    }
}

impl Deref for RcInode {
    type Target = Inode;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl RcInode {
    /// Drop a reference to an in-memory inode. If that was the last
    /// reference and the inode has no links to it, free the inode (and its
    /// content) on disk. All calls to `put` must be inside a transaction in
    /// case the inode has to be freed.
    pub fn put(self, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        let itable = ctx.fs().itable();
        let list = itable.list.lock();

        if self.0.nref.load(Ordering::Acquire) == 1 {
            // No other holder exists, and the itable lock keeps new ones
            // out, so nobody can have the inode locked: reading the inner
            // data without its lock cannot race.
            let inner = unsafe { &mut *self.0.inner.get_mut_raw() };
            if inner.valid && inner.nlink == 0 {
                // The inode has no links and no other references: truncate
                // and free. Truncation sleeps, so release the itable lock
                // first; nlink == 0 means no directory entry leads here, so
                // a path lookup cannot resurrect the inode meanwhile.
                drop(list);

                let mut ip = self.lock(ctx);
                ip.trunc(tx, ctx);
                ip.deref_inner_mut().typ = InodeType::None;
                ip.update(tx, ctx);
                ip.deref_inner_mut().valid = false;
                drop(ip);

                let mut list = itable.list.lock();
                if let Some(pos) = list.iter().position(|entry| Arc::ptr_eq(entry, &self.0)) {
                    list.remove(pos);
                }
                return;
            }
        }
    }
}

/// A locked inode. The cached disk fields are read and written through
/// `deref_inner`/`deref_inner_mut`; the lock is released on drop.
pub struct InodeGuard<'a> {
    pub inode: &'a Inode,
}

impl Deref for InodeGuard<'_> {
    type Target = Inode;

    fn deref(&self) -> &Self::Target {
        self.inode
    }
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: an InodeGuard exists only while its inode's lock is held.
        unsafe { self.inode.inner.unlock() }
    }
}

impl InodeGuard<'_> {
    pub fn deref_inner(&self) -> &InodeInner {
        // SAFETY: we hold the inode's sleep-lock.
        unsafe { &*self.inode.inner.get_mut_raw() }
    }

    pub fn deref_inner_mut(&mut self) -> &mut InodeInner {
        // SAFETY: we hold the inode's sleep-lock and `&mut self` is unique.
        unsafe { &mut *self.inode.inner.get_mut_raw() }
    }

    /// Copy a modified in-memory inode to disk. Must be called inside a
    /// transaction after every change to an inode field that lives on disk.
    pub fn update(&self, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        let fs = ctx.fs();
        let mut bp = fs.bcache().read(fs.superblock().iblock(self.inum));

        // SAFETY: dip is aligned properly, lies inside bp.data, and we hold
        // the buffer lock.
        let dip = unsafe {
            &mut *(bp.data_mut().as_mut_ptr() as *mut Dinode).add(self.inum as usize % IPB)
        };

        let inner = self.deref_inner();
        match inner.typ {
            InodeType::None => {
                dip.typ = DINODE_NONE;
                dip.major = 0;
                dip.minor = 0;
            }
            InodeType::Dir => {
                dip.typ = DINODE_DIR;
                dip.major = 0;
                dip.minor = 0;
            }
            InodeType::File => {
                dip.typ = DINODE_FILE;
                dip.major = 0;
                dip.minor = 0;
            }
            InodeType::Device { major, minor } => {
                dip.typ = DINODE_DEVICE;
                dip.major = major;
                dip.minor = minor;
            }
        }
        dip.nlink = inner.nlink;
        dip.size = inner.size;
        dip.addr_direct.copy_from_slice(&inner.addr_direct);
        dip.addr_indirect = inner.addr_indirect;
        tx.write(bp);
    }

    /// Truncate inode (discard contents). Called with the inode's lock held.
    pub fn trunc(&mut self, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        for addr in &mut self.deref_inner_mut().addr_direct {
            if *addr != 0 {
                tx.bfree(*addr);
                *addr = 0;
            }
        }

        if self.deref_inner().addr_indirect != 0 {
            let bp = ctx.fs().bcache().read(self.deref_inner().addr_indirect);
            // SAFETY: u32 does not have internal structure.
            let (prefix, addrs, _) = unsafe { bp.data().align_to::<u32>() };
            debug_assert_eq!(prefix.len(), 0, "trunc: Buf data unaligned");
            for addr in addrs {
                if *addr != 0 {
                    tx.bfree(*addr);
                }
            }
            drop(bp);
            tx.bfree(self.deref_inner().addr_indirect);
            self.deref_inner_mut().addr_indirect = 0;
        }

        self.deref_inner_mut().size = 0;
        self.update(tx, ctx);
    }

    /// Copy data into `dst` from the content of the inode at offset `off`.
    /// Only succeeds if exactly `size_of::<T>()` bytes could be read.
    pub fn read_kernel<T: AsBytes + FromBytes>(
        &mut self,
        dst: &mut T,
        off: u32,
        ctx: &KernelCtx<'_>,
    ) -> Result<(), ()> {
        let bytes = self.read_bytes(dst.as_bytes_mut(), off, ctx);
        if bytes == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Read data from the inode's content into `dst`, starting at byte
    /// offset `off`. Reads past the end of the file are clamped. Returns
    /// the number of bytes read.
    pub fn read_bytes(&mut self, dst: &mut [u8], off: u32, ctx: &KernelCtx<'_>) -> usize {
        let inner = self.deref_inner();
        let mut n = dst.len() as u32;
        if off > inner.size || off.wrapping_add(n) < off {
            return 0;
        }
        if off + n > inner.size {
            n = inner.size - off;
        }

        let mut tot: u32 = 0;
        let mut off = off;
        while tot < n {
            let bp = ctx.fs().bcache().read(self.bmap(off as usize / BSIZE, ctx));
            let m = core::cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            let begin = (off % BSIZE as u32) as usize;
            let end = begin + m as usize;
            dst[tot as usize..(tot + m) as usize].copy_from_slice(&bp.data()[begin..end]);
            drop(bp);
            tot += m;
            off += m;
        }
        tot as usize
    }

    /// Copy data from `src` into the inode at offset `off`. Only succeeds
    /// if the whole record could be written.
    pub fn write_kernel<T: AsBytes>(
        &mut self,
        src: &T,
        off: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<(), ()> {
        let bytes = self.write_bytes(src.as_bytes(), off, tx, ctx)?;
        if bytes == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Write `src` to the inode's content at byte offset `off`, allocating
    /// blocks on demand and growing the file if needed. Requires
    /// `off <= size` and the end of the write to stay within the largest
    /// representable file.
    pub fn write_bytes(
        &mut self,
        src: &[u8],
        off: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<usize, ()> {
        if off > self.deref_inner().size {
            return Err(());
        }
        let n = src.len() as u32;
        if off.checked_add(n).ok_or(())? as usize > MAXFILE * BSIZE {
            return Err(());
        }

        let mut tot: u32 = 0;
        let mut off_cur = off;
        while tot < n {
            let mut bp = ctx
                .fs()
                .bcache()
                .read(self.bmap_or_alloc(off_cur as usize / BSIZE, tx, ctx));
            let m = core::cmp::min(n - tot, BSIZE as u32 - off_cur % BSIZE as u32);
            let begin = (off_cur % BSIZE as u32) as usize;
            let end = begin + m as usize;
            bp.data_mut()[begin..end].copy_from_slice(&src[tot as usize..(tot + m) as usize]);
            tx.write(bp);
            tot += m;
            off_cur += m;
        }

        if off_cur > self.deref_inner().size {
            self.deref_inner_mut().size = off_cur;
        }

        // Write the inode back to disk even if the size didn't change,
        // because bmap_or_alloc may have added a new block to addr_direct.
        self.update(tx, ctx);
        Ok(tot as usize)
    }

    /// Inode content.
    ///
    /// The content (data) associated with each inode is stored in blocks on
    /// the disk. The first NDIRECT block numbers are listed in addr_direct;
    /// the next NINDIRECT blocks in the block addr_indirect points to.
    /// Returns the disk block number of the `bn`th content block, allocating
    /// it (and the indirect block) on demand.
    pub fn bmap_or_alloc(&mut self, bn: usize, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> u32 {
        self.bmap_internal(bn, Some(tx), ctx)
    }

    pub fn bmap(&mut self, bn: usize, ctx: &KernelCtx<'_>) -> u32 {
        self.bmap_internal(bn, None, ctx)
    }

    fn bmap_internal(&mut self, bn: usize, tx_opt: Option<&Tx<'_>>, ctx: &KernelCtx<'_>) -> u32 {
        if bn < NDIRECT {
            let mut addr = self.deref_inner().addr_direct[bn];
            if addr == 0 {
                addr = tx_opt.expect("bmap: out of range").balloc();
                self.deref_inner_mut().addr_direct[bn] = addr;
            }
            addr
        } else {
            let bn = bn - NDIRECT;
            assert!(bn < NINDIRECT, "bmap: out of range");

            let mut indirect = self.deref_inner().addr_indirect;
            if indirect == 0 {
                indirect = tx_opt.expect("bmap: out of range").balloc();
                self.deref_inner_mut().addr_indirect = indirect;
            }

            let mut bp = ctx.fs().bcache().read(indirect);
            // SAFETY: u32 does not have internal structure.
            let (prefix, addrs, _) = unsafe { bp.data_mut().align_to_mut::<u32>() };
            debug_assert_eq!(prefix.len(), 0, "bmap: Buf data unaligned");
            let mut addr = addrs[bn];
            if addr == 0 {
                let tx = tx_opt.expect("bmap: out of range");
                addr = tx.balloc();
                addrs[bn] = addr;
                tx.write(bp);
            }
            addr
        }
    }

    /// Is the directory empty except for "." and ".." ?
    pub fn is_dir_empty(&mut self, ctx: &KernelCtx<'_>) -> bool {
        let mut de: Dirent = Default::default();
        for off in (2 * DIRENT_SIZE as u32..self.deref_inner().size).step_by(DIRENT_SIZE) {
            self.read_kernel(&mut de, off, ctx)
                .expect("is_dir_empty: read_kernel");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

struct DirentIter<'s, 't, 'k> {
    guard: &'s mut InodeGuard<'t>,
    iter: StepBy<Range<u32>>,
    ctx: &'s KernelCtx<'k>,
}

impl Iterator for DirentIter<'_, '_, '_> {
    type Item = (Dirent, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let off = self.iter.next()?;
        let dirent = Dirent::new(self.guard, off, self.ctx).expect("DirentIter");
        Some((dirent, off))
    }
}

impl<'t> InodeGuard<'t> {
    fn iter_dirents<'s, 'k>(&'s mut self, ctx: &'s KernelCtx<'k>) -> DirentIter<'s, 't, 'k> {
        let iter = (0..self.deref_inner().size).step_by(DIRENT_SIZE);
        DirentIter {
            guard: self,
            iter,
            ctx,
        }
    }
}

// Directories
impl InodeGuard<'_> {
    /// Look for a directory entry by name. If found, return the entry's
    /// inode and the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &FileName, ctx: &KernelCtx<'_>) -> Result<(RcInode, u32), ()> {
        assert_eq!(self.deref_inner().typ, InodeType::Dir, "dirlookup not DIR");

        self.iter_dirents(ctx)
            .find(|(de, _)| de.inum != 0 && de.get_name() == name)
            .map(|(de, off)| (ctx.fs().itable().get_inode(de.inum), off))
            .ok_or(())
    }

    /// Write a new directory entry (name, inum) into the directory,
    /// reusing an unused slot if one exists and appending otherwise.
    /// Returns the byte offset of the new entry; fails if `name` is
    /// already present.
    pub fn dirlink(
        &mut self,
        name: &FileName,
        inum: u32,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<u32, ()> {
        // Check that name is not present.
        if let Ok((ip, _)) = self.dirlookup(name, ctx) {
            ip.put(tx, ctx);
            return Err(());
        }

        // Look for an empty dirent.
        let (mut de, off) = self
            .iter_dirents(ctx)
            .find(|(de, _)| de.inum == 0)
            .unwrap_or((Default::default(), self.deref_inner().size));
        de.inum = inum;
        de.set_name(name);
        self.write_kernel(&de, off, tx, ctx).expect("dirlink");
        Ok(off)
    }

    /// Remove the directory entry at byte offset `off`, compacting the
    /// directory: the final entry moves into the hole and the directory
    /// shrinks by one entry. The shrunk inode is written back within `tx`.
    pub fn dirremove(&mut self, off: u32, tx: &Tx<'_>, ctx: &KernelCtx<'_>) {
        assert_eq!(self.deref_inner().typ, InodeType::Dir, "dirremove not DIR");
        let size = self.deref_inner().size;
        assert!(
            off % DIRENT_SIZE as u32 == 0 && off + DIRENT_SIZE as u32 <= size,
            "dirremove: bad offset"
        );

        let last = size - DIRENT_SIZE as u32;
        if off != last {
            let mut de = Dirent::default();
            self.read_kernel(&mut de, last, ctx).expect("dirremove: read");
            self.write_kernel(&de, off, tx, ctx).expect("dirremove: write");
        }
        self.deref_inner_mut().size = last;
        self.update(tx, ctx);
    }
}

/// The in-memory inode table: at most one entry per inode number, shared
/// by every holder of that inode.
pub struct Itable {
    /// Guards identity lookups and reference-count transitions from zero.
    pub(super) list: SpinLock<Vec<Arc<Inode>>>,
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            list: SpinLock::new("itable", Vec::new()),
        }
    }

    /// Find the inode with number `inum` and return its shared in-memory
    /// handle. Does not lock the inode and does not read it from disk.
    ///
    /// NINODE bounds the number of simultaneously referenced inodes, not
    /// the number ever touched: a full table recycles an entry nobody
    /// holds. Exhaustion is fatal only when every entry is still in use.
    pub fn get_inode(&self, inum: u32) -> RcInode {
        let mut list = self.list.lock();
        if let Some(entry) = list.iter().find(|entry| entry.inum == inum) {
            entry.nref.fetch_add(1, Ordering::Relaxed);
            return RcInode(entry.clone());
        }

        if list.len() >= NINODE {
            // With no handles outstanding the entry cannot be locked, and
            // the table lock keeps anyone from finding it; dropping it
            // merely discards a cached copy of an on-disk inode.
            let pos = list
                .iter()
                .position(|entry| entry.nref.load(Ordering::Acquire) == 0)
                .expect("get_inode: no inodes");
            list.remove(pos);
        }

        let entry = Arc::new(Inode {
            inum,
            nref: AtomicUsize::new(1),
            inner: SleepLock::new("inode", InodeInner::new()),
        });
        list.push(entry.clone());
        RcInode(entry)
    }

    /// Allocate a fresh inode on disk, marked with the given type.
    /// Returns an unlocked but referenced handle to it.
    pub fn alloc_inode(&self, typ: InodeType, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> RcInode {
        assert_ne!(typ, InodeType::None, "alloc_inode: invalid type");
        let fs = ctx.fs();
        for inum in 1..fs.superblock().num_inodes {
            let mut bp = fs.bcache().read(fs.superblock().iblock(inum));

            // SAFETY: dip is aligned properly, lies inside bp.data, and we
            // hold the buffer lock.
            let dip = unsafe {
                &mut *(bp.data_mut().as_mut_ptr() as *mut Dinode).add(inum as usize % IPB)
            };

            if dip.typ == DINODE_NONE {
                // A free inode: claim and zero it.
                *dip = Dinode {
                    typ: match typ {
                        InodeType::Dir => DINODE_DIR,
                        InodeType::File => DINODE_FILE,
                        InodeType::Device { .. } => DINODE_DEVICE,
                        InodeType::None => unreachable!(),
                    },
                    major: match typ {
                        InodeType::Device { major, .. } => major,
                        _ => 0,
                    },
                    minor: match typ {
                        InodeType::Device { minor, .. } => minor,
                        _ => 0,
                    },
                    nlink: 0,
                    size: 0,
                    addr_direct: [0; NDIRECT],
                    addr_indirect: 0,
                };

                // Mark it allocated on the disk.
                tx.write(bp);
                return self.get_inode(inum);
            }
        }
        panic!("alloc_inode: no inodes");
    }

    pub fn root(&self) -> RcInode {
        self.get_inode(ROOTINO)
    }

    /// Look up and return the inode for `path`.
    pub fn namei(&self, path: &Path, tx: &Tx<'_>, ctx: &KernelCtx<'_>) -> Result<RcInode, ()> {
        Ok(self.namex(path, false, tx, ctx)?.0)
    }

    /// Like `namei`, but return the inode for the parent directory and the
    /// final path element.
    pub fn nameiparent<'s>(
        &self,
        path: &'s Path,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<(RcInode, &'s FileName), ()> {
        let (ip, name_in_path) = self.namex(path, true, tx, ctx)?;
        let name_in_path = name_in_path.ok_or(())?;
        Ok((ip, name_in_path))
    }

    fn namex<'s>(
        &self,
        mut path: &'s Path,
        parent: bool,
        tx: &Tx<'_>,
        ctx: &KernelCtx<'_>,
    ) -> Result<(RcInode, Option<&'s FileName>), ()> {
        let mut ptr = if path.is_absolute() {
            self.root()
        } else {
            let cwd = ctx.proc().cwd().lock();
            match &*cwd {
                Some(cwd) => cwd.clone(),
                None => self.root(),
            }
        };

        while let Some((new_path, name)) = path.skipelem() {
            path = new_path;

            let mut ip = ptr.lock(ctx);
            if ip.deref_inner().typ != InodeType::Dir {
                drop(ip);
                ptr.put(tx, ctx);
                return Err(());
            }
            if parent && path.is_empty_string() {
                // Stop one level early.
                drop(ip);
                return Ok((ptr, Some(name)));
            }
            let next = ip.dirlookup(name, ctx);
            drop(ip);
            ptr.put(tx, ctx);
            ptr = next?.0;
        }
        if parent {
            ptr.put(tx, ctx);
            return Err(());
        }
        Ok((ptr, None))
    }
}
