//! The thread-side collaborators of the filesystem core: wait channels,
//! per-process bookkeeping, and the kernel context handed to every
//! filesystem entry point.
//!
//! The scheduler itself is outside this crate. A `WaitChannel` parks and
//! unparks host threads, which stand in for kernel threads; `Proc` carries
//! the pieces of the process the filesystem needs (the `killed` flag, the
//! current working directory and the open-file table); `KernelCtx` bundles
//! a `Proc` with the `FileSystem` it acts on.

use core::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::vec::Vec;

use array_macro::array;

use crate::file::RcFile;
use crate::fs::{FileSystem, RcInode};
use crate::lock::{Guard, RawLock, SpinLock};
use crate::param::NOFILE;

pub struct WaitChannel {
    /// Threads parked on this channel.
    waiters: SpinLock<Vec<Thread>>,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new("waitchannel", Vec::new()),
        }
    }

    /// Atomically releases `guard`'s lock and sleeps on this channel.
    /// Reacquires the lock when awakened.
    ///
    /// Wakeups may be spurious: callers must re-check their condition in a
    /// loop. Losing a wakeup is impossible as long as every `wakeup` for a
    /// condition happens while holding the lock `guard` protects it with:
    /// the waiter registers itself before releasing that lock, and an
    /// unpark that races with the park below is remembered by the thread's
    /// park token.
    pub fn sleep<R: RawLock, T>(&self, guard: &mut Guard<'_, R, T>) {
        self.waiters.lock().push(thread::current());
        guard.reacquire_after(|| thread::park());
    }

    /// Wakes up all threads sleeping on this channel.
    pub fn wakeup(&self) {
        for waiter in self.waiters.lock().drain(..) {
            waiter.unpark();
        }
    }
}

/// Per-process open-file table: file descriptor -> open file.
pub struct OpenFileTable {
    pub(crate) files: [Option<RcFile>; NOFILE],
}

impl OpenFileTable {
    fn new() -> Self {
        Self {
            files: array![_ => None; NOFILE],
        }
    }
}

/// The slice of a process that the filesystem reads and writes.
pub struct Proc {
    killed: AtomicBool,
    /// Current working directory. `None` means the root directory.
    cwd: SpinLock<Option<RcInode>>,
    oftable: SpinLock<OpenFileTable>,
}

impl Proc {
    pub fn new() -> Self {
        Self {
            killed: AtomicBool::new(false),
            cwd: SpinLock::new("cwd", None),
            oftable: SpinLock::new("oftable", OpenFileTable::new()),
        }
    }

    /// Marks the process killed. Alertable waits observe the flag and
    /// return an error on their next wakeup or poll.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub(crate) fn cwd(&self) -> &SpinLock<Option<RcInode>> {
        &self.cwd
    }

    pub(crate) fn oftable(&self) -> &SpinLock<OpenFileTable> {
        &self.oftable
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a filesystem entry point needs: the filesystem itself and
/// the calling process.
#[derive(Clone, Copy)]
pub struct KernelCtx<'s> {
    fs: &'s FileSystem,
    proc: &'s Proc,
}

impl<'s> KernelCtx<'s> {
    pub fn new(fs: &'s FileSystem, proc: &'s Proc) -> Self {
        Self { fs, proc }
    }

    pub fn fs(&self) -> &'s FileSystem {
        self.fs
    }

    pub fn proc(&self) -> &'s Proc {
        self.proc
    }
}
