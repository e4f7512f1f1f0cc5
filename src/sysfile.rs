//! File-system system calls.
//!
//! Mostly argument checking, since we don't trust user code, and calls into
//! the file and fs layers. Copying between user and kernel memory happens
//! in the trap layer before these entry points run, so buffers arrive here
//! as plain slices and paths as NUL-free byte strings.

use crate::fcntl::FcntlFlags;
use crate::file::RcFile;
use crate::fs::{InodeType, Path, Stat};
use crate::param::{MAXPATH, NOFILE};
use crate::pipe::Pipe;
use crate::proc::KernelCtx;

/// The only supported dirfd: paths are resolved against the process's
/// working directory.
pub const AT_FDCWD: i32 = -100;

/// Get-window-size request, answered with a stub.
pub const TIOCGWINSZ: u64 = 0x5413;

impl KernelCtx<'_> {
    /// Allocate the lowest free file descriptor for `f`. Takes over the
    /// file reference from the caller on success; hands it back otherwise.
    pub(crate) fn fdalloc(&self, f: RcFile) -> Result<usize, RcFile> {
        let mut oftable = self.proc().oftable().lock();
        match oftable.files.iter().position(|slot| slot.is_none()) {
            Some(fd) => {
                oftable.files[fd] = Some(f);
                Ok(fd)
            }
            None => Err(f),
        }
    }

    /// Get the open file behind `fd`, bumping its slot's count. The caller
    /// returns the handle through `FTable::close` when done.
    fn fd2file(&self, fd: usize) -> Result<RcFile, ()> {
        let oftable = self.proc().oftable().lock();
        match oftable.files.get(fd) {
            Some(Some(f)) => Ok(self.fs().ftable().dup(f)),
            _ => Err(()),
        }
    }

    fn check_path(path: &Path) -> Result<(), ()> {
        if path.as_bytes().is_empty() || path.as_bytes().len() > MAXPATH {
            Err(())
        } else {
            Ok(())
        }
    }

    /// Opens (and with `O_CREATE`, creates) the file at `path`.
    /// Returns the new file descriptor.
    pub fn sys_openat(&self, dirfd: i32, path: &Path, omode: FcntlFlags) -> Result<usize, ()> {
        if dirfd != AT_FDCWD {
            return Err(());
        }
        Self::check_path(path)?;
        let tx = self.fs().begin_tx();
        self.fs().open(path, omode, &tx, self)
    }

    /// Closes `fd`.
    pub fn sys_close(&self, fd: usize) -> Result<(), ()> {
        let f = {
            let mut oftable = self.proc().oftable().lock();
            oftable.files.get_mut(fd).ok_or(())?.take().ok_or(())?
        };
        self.fs().ftable().close(f, self);
        Ok(())
    }

    /// Reads from `fd` into `buf`, returning the byte count.
    pub fn sys_read(&self, fd: usize, buf: &mut [u8]) -> Result<usize, ()> {
        let f = self.fd2file(fd)?;
        let result = f.read(buf, self);
        self.fs().ftable().close(f, self);
        result
    }

    /// Writes `buf` to `fd`, returning the byte count.
    pub fn sys_write(&self, fd: usize, buf: &[u8]) -> Result<usize, ()> {
        let f = self.fd2file(fd)?;
        let result = f.write(buf, self);
        self.fs().ftable().close(f, self);
        result
    }

    /// Writes each buffer of `iovs` to `fd` in order, returning the total
    /// byte count.
    pub fn sys_writev(&self, fd: usize, iovs: &[&[u8]]) -> Result<usize, ()> {
        if iovs.is_empty() {
            return Err(());
        }
        let f = self.fd2file(fd)?;
        let mut tot = 0;
        for iov in iovs {
            match f.write(iov, self) {
                Ok(n) => tot += n,
                Err(()) => {
                    self.fs().ftable().close(f, self);
                    return Err(());
                }
            }
        }
        self.fs().ftable().close(f, self);
        Ok(tot)
    }

    /// Duplicates `fd` into the lowest free descriptor. Both descriptors
    /// share one open file, and therefore one offset.
    pub fn sys_dup(&self, fd: usize) -> Result<usize, ()> {
        let f = self.fd2file(fd)?;
        match self.fdalloc(f) {
            Ok(newfd) => Ok(newfd),
            Err(f) => {
                self.fs().ftable().close(f, self);
                Err(())
            }
        }
    }

    /// Returns metadata of the open file `fd`.
    pub fn sys_fstat(&self, fd: usize) -> Result<Stat, ()> {
        let f = self.fd2file(fd)?;
        let result = f.stat(self);
        self.fs().ftable().close(f, self);
        result
    }

    /// Returns metadata of the file at `path`.
    pub fn sys_fstatat(&self, dirfd: i32, path: &Path, flags: i32) -> Result<Stat, ()> {
        if dirfd != AT_FDCWD || flags != 0 {
            return Err(());
        }
        Self::check_path(path)?;
        let tx = self.fs().begin_tx();
        let ip = self.fs().itable().namei(path, &tx, self)?;
        let st = ip.stat(self);
        ip.put(&tx, self);
        Ok(st)
    }

    /// Removes `path`'s directory entry. Directories must be empty.
    pub fn sys_unlinkat(&self, dirfd: i32, path: &Path, flags: i32) -> Result<(), ()> {
        if dirfd != AT_FDCWD || flags != 0 {
            return Err(());
        }
        Self::check_path(path)?;
        let tx = self.fs().begin_tx();
        self.fs().unlink(path, &tx, self)
    }

    /// Creates a directory at `path`.
    pub fn sys_mkdirat(&self, dirfd: i32, path: &Path, mode: usize) -> Result<(), ()> {
        if dirfd != AT_FDCWD || mode != 0 {
            return Err(());
        }
        Self::check_path(path)?;
        let tx = self.fs().begin_tx();
        let (ip, _) = self.fs().create(path, InodeType::Dir, &tx, self, |_| ())?;
        ip.put(&tx, self);
        Ok(())
    }

    /// Creates a device node at `path` with the given major and minor
    /// numbers.
    pub fn sys_mknodat(&self, dirfd: i32, path: &Path, major: u16, minor: u16) -> Result<(), ()> {
        if dirfd != AT_FDCWD {
            return Err(());
        }
        Self::check_path(path)?;
        let tx = self.fs().begin_tx();
        let (ip, _) = self
            .fs()
            .create(path, InodeType::Device { major, minor }, &tx, self, |_| ())?;
        ip.put(&tx, self);
        Ok(())
    }

    /// Changes the process's working directory to `path`.
    pub fn sys_chdir(&self, path: &Path) -> Result<(), ()> {
        Self::check_path(path)?;
        let tx = self.fs().begin_tx();
        let ip = self.fs().itable().namei(path, &tx, self)?;
        self.fs().chdir(ip, &tx, self)
    }

    /// Creates a pipe and returns (read fd, write fd).
    pub fn sys_pipe2(&self, _flags: i32) -> Result<(usize, usize), ()> {
        let (f0, f1) = Pipe::alloc(self)?;
        let fd0 = match self.fdalloc(f0) {
            Ok(fd) => fd,
            Err(f0) => {
                self.fs().ftable().close(f0, self);
                self.fs().ftable().close(f1, self);
                return Err(());
            }
        };
        let fd1 = match self.fdalloc(f1) {
            Ok(fd) => fd,
            Err(f1) => {
                let _ = self.sys_close(fd0);
                self.fs().ftable().close(f1, self);
                return Err(());
            }
        };
        Ok((fd0, fd1))
    }

    /// Terminal control. Only the get-window-size request is recognized,
    /// and it is answered with a stub.
    pub fn sys_ioctl(&self, fd: usize, request: u64) -> Result<usize, ()> {
        {
            let oftable = self.proc().oftable().lock();
            match oftable.files.get(fd) {
                Some(Some(_)) => {}
                _ => return Err(()),
            }
        }
        if request == TIOCGWINSZ {
            Ok(0)
        } else {
            Err(())
        }
    }

    /// The process-exit path of the file layer: closes every open
    /// descriptor and releases the working directory.
    pub fn teardown(&self) {
        for fd in 0..NOFILE {
            let _ = self.sys_close(fd);
        }
        let cwd = self.proc().cwd().lock().take();
        if let Some(cwd) = cwd {
            let tx = self.fs().begin_tx();
            cwd.put(&tx, self);
        }
    }
}
