//! Support functions for system calls that involve file descriptors.

use core::cell::UnsafeCell;
use core::cmp;
use core::ops::Deref;
use std::sync::Arc;

use array_macro::array;

use crate::fs::{RcInode, Stat};
use crate::lock::SpinLock;
use crate::param::{BSIZE, MAXOPBLOCKS, NFILE};
use crate::pipe::Pipe;
use crate::proc::KernelCtx;

pub enum FileType {
    None,
    Pipe { pipe: Arc<Pipe> },
    Inode { ip: RcInode, off: UnsafeCell<u32> },
    Device { ip: RcInode, major: u16 },
}

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

// SAFETY: the offset cell is read and written only while the inode's
// sleep-lock is held; every other field is immutable or itself
// synchronized.
unsafe impl Send for File {}
unsafe impl Sync for File {}

impl File {
    const fn new(typ: FileType, readable: bool, writable: bool) -> Self {
        Self {
            typ,
            readable,
            writable,
        }
    }

    /// Get metadata about file self.
    pub fn stat(&self, ctx: &KernelCtx<'_>) -> Result<Stat, ()> {
        match &self.typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => Ok(ip.stat(ctx)),
            _ => Err(()),
        }
    }

    /// Read from file self into `dst`, advancing the shared offset by the
    /// number of bytes read.
    pub fn read(&self, dst: &mut [u8], ctx: &KernelCtx<'_>) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.read(dst, ctx),
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock(ctx);
                // SAFETY: off is accessed only with the inode lock held.
                let curr = unsafe { *off.get() };
                let n = guard.read_bytes(dst, curr, ctx);
                // SAFETY: as above.
                unsafe { *off.get() = curr.wrapping_add(n as u32) };
                drop(guard);
                Ok(n)
            }
            FileType::Device { major, .. } => {
                let device = ctx.fs().device(*major).ok_or(())?;
                device.read(dst, ctx)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write `src` to file self.
    pub fn write(&self, src: &[u8], ctx: &KernelCtx<'_>) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }

        match &self.typ {
            FileType::Pipe { pipe } => pipe.write(src, ctx),
            FileType::Device { major, .. } => {
                let device = ctx.fs().device(*major).ok_or(())?;
                device.write(src, ctx)
            }
            FileType::Inode { ip, off } => {
                // Write a few blocks at a time to avoid exceeding the
                // maximum log transaction size, including inode, indirect
                // block, allocation bitmap, and 2 blocks of slop for
                // non-aligned writes.
                let max = (MAXOPBLOCKS - 1 - 1 - 2) / 2 * BSIZE;
                let mut written = 0;
                while written < src.len() {
                    let tx = ctx.fs().begin_tx();
                    let mut guard = ip.lock(ctx);
                    // SAFETY: off is accessed only with the inode lock held.
                    let curr = unsafe { *off.get() };

                    // Clamp to what still fits in the file at this offset.
                    let capacity = crate::fs::MAXFILE * BSIZE - curr as usize;
                    let n = cmp::min(cmp::min(src.len() - written, max), capacity);
                    if n == 0 {
                        drop(guard);
                        break;
                    }

                    let r = match guard.write_bytes(&src[written..written + n], curr, &tx, ctx) {
                        Ok(r) => r,
                        Err(()) => {
                            drop(guard);
                            if written > 0 {
                                return Ok(written);
                            }
                            return Err(());
                        }
                    };
                    // SAFETY: as above.
                    unsafe { *off.get() = curr.wrapping_add(r as u32) };
                    drop(guard);
                    drop(tx);

                    written += r;
                    if r < n {
                        break;
                    }
                }
                Ok(written)
            }
            FileType::None => panic!("File::write"),
        }
    }
}

struct FTableSlot {
    /// Open-file reference count, guarded by the table lock.
    nref: usize,
    file: Option<Arc<File>>,
}

impl FTableSlot {
    const fn new() -> Self {
        Self {
            nref: 0,
            file: None,
        }
    }
}

/// The global open-file table.
pub struct FTable {
    slots: SpinLock<[FTableSlot; NFILE]>,
}

/// A counted handle to an open-file-table slot. `dup` (or clone through
/// it) bumps the slot's count; `close` drops it and disposes of the file
/// when the count reaches zero.
pub struct RcFile {
    idx: usize,
    file: Arc<File>,
}

impl Deref for RcFile {
    type Target = File;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl FTable {
    pub fn new() -> Self {
        Self {
            slots: SpinLock::new("ftable", array![_ => FTableSlot::new(); NFILE]),
        }
    }

    /// Allocate a file structure in the first free slot.
    pub fn alloc_file(
        &self,
        typ: FileType,
        readable: bool,
        writable: bool,
    ) -> Result<RcFile, ()> {
        let mut slots = self.slots.lock();
        let idx = slots.iter().position(|slot| slot.nref == 0).ok_or(())?;
        let file = Arc::new(File::new(typ, readable, writable));
        slots[idx] = FTableSlot {
            nref: 1,
            file: Some(file.clone()),
        };
        Ok(RcFile { idx, file })
    }

    /// Increment the ref count of `f`'s slot and return a second handle.
    pub fn dup(&self, f: &RcFile) -> RcFile {
        let mut slots = self.slots.lock();
        slots[f.idx].nref += 1;
        RcFile {
            idx: f.idx,
            file: f.file.clone(),
        }
    }

    /// Close `f`: decrement its slot's ref count and, when it reaches
    /// zero, release the underlying pipe or inode (the latter inside a
    /// fresh transaction).
    pub fn close(&self, f: RcFile, ctx: &KernelCtx<'_>) {
        let mut slots = self.slots.lock();
        slots[f.idx].nref -= 1;
        if slots[f.idx].nref > 0 {
            return;
        }
        let file = slots[f.idx].file.take();
        drop(slots);

        // Dispose outside the table lock; releasing an inode may sleep.
        let RcFile { file: handle, .. } = f;
        drop(handle);
        if let Some(file) = file {
            let file = Arc::try_unwrap(file)
                .unwrap_or_else(|_| panic!("FTable::close: outstanding handle"));
            let File { typ, writable, .. } = file;
            match typ {
                FileType::Pipe { pipe } => pipe.close(writable),
                FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                    let tx = ctx.fs().begin_tx();
                    ip.put(&tx, ctx);
                }
                FileType::None => {}
            }
        }
    }

    /// Number of slots currently in use.
    #[cfg(test)]
    pub(crate) fn live_slots(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| slot.nref > 0)
            .count()
    }
}
