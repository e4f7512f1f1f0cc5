//! Bounded single-reader single-writer byte pipes.

use std::sync::Arc;

use crate::file::{FileType, RcFile};
use crate::lock::SpinLock;
use crate::param::PIPESIZE;
use crate::proc::{KernelCtx, WaitChannel};

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read. Monotone; the byte at logical index `i` lives
    /// at `data[i % PIPESIZE]`.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read fd is still open.
    readopen: bool,

    /// Write fd is still open.
    writeopen: bool,
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,

    /// WaitChannel saying there are unread bytes in data.
    read_waitchannel: WaitChannel,

    /// WaitChannel saying all bytes in data have been read.
    write_waitchannel: WaitChannel,
}

enum PipeError {
    WaitForIo,
    InvalidStatus,
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "pipe",
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
            ),
            read_waitchannel: WaitChannel::new(),
            write_waitchannel: WaitChannel::new(),
        }
    }

    /// Creates a pipe and returns its (read end, write end) open files.
    pub(crate) fn alloc(ctx: &KernelCtx<'_>) -> Result<(RcFile, RcFile), ()> {
        let pipe = Arc::new(Pipe::new());
        let f0 = ctx.fs().ftable().alloc_file(
            FileType::Pipe { pipe: pipe.clone() },
            true,
            false,
        )?;
        let f1 = match ctx
            .fs()
            .ftable()
            .alloc_file(FileType::Pipe { pipe }, false, true)
        {
            Ok(f1) => f1,
            Err(()) => {
                ctx.fs().ftable().close(f0, ctx);
                return Err(());
            }
        };
        Ok((f0, f1))
    }

    /// Reads up to `dst.len()` bytes. An empty pipe with the write side
    /// still open blocks (alertably: a killed thread gets `Err`); an empty
    /// pipe whose write side is closed reads 0 bytes.
    pub fn read(&self, dst: &mut [u8], ctx: &KernelCtx<'_>) -> Result<usize, ()> {
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(dst, ctx) {
                Ok(r) => {
                    self.write_waitchannel.wakeup();
                    return Ok(r);
                }
                Err(PipeError::WaitForIo) => self.read_waitchannel.sleep(&mut inner),
                Err(_) => return Err(()),
            }
        }
    }

    /// Writes all of `src`, sleeping whenever the ring fills. Fails once
    /// the read side closes or the thread is killed.
    pub fn write(&self, src: &[u8], ctx: &KernelCtx<'_>) -> Result<usize, ()> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        loop {
            match inner.try_write(&src[written..], ctx) {
                Ok(r) => {
                    written += r;
                    self.read_waitchannel.wakeup();
                    if written < src.len() {
                        self.write_waitchannel.sleep(&mut inner);
                    } else {
                        return Ok(written);
                    }
                }
                Err(_) => return Err(()),
            }
        }
    }

    /// Closes one side of the pipe, waking the other. The ring itself is
    /// freed when the last handle drops.
    pub(crate) fn close(&self, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            self.read_waitchannel.wakeup();
        } else {
            inner.readopen = false;
            self.write_waitchannel.wakeup();
        }
    }
}

impl PipeInner {
    /// Tries to write up to `src.len()` bytes. Returns how many fit; fails
    /// if the read side is closed or the thread was killed.
    fn try_write(&mut self, src: &[u8], ctx: &KernelCtx<'_>) -> Result<usize, PipeError> {
        if !self.readopen || ctx.proc().killed() {
            return Err(PipeError::InvalidStatus);
        }
        for (i, c) in src.iter().enumerate() {
            if self.nwrite == self.nread.wrapping_add(PIPESIZE as u32) {
                // Ring is full.
                return Ok(i);
            }
            self.data[self.nwrite as usize % PIPESIZE] = *c;
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(src.len())
    }

    /// Tries to read up to `dst.len()` bytes. An empty ring asks the
    /// caller to wait only while the write side is open.
    fn try_read(&mut self, dst: &mut [u8], ctx: &KernelCtx<'_>) -> Result<usize, PipeError> {
        if self.nread == self.nwrite && self.writeopen {
            if ctx.proc().killed() {
                return Err(PipeError::InvalidStatus);
            }
            return Err(PipeError::WaitForIo);
        }

        for i in 0..dst.len() {
            if self.nread == self.nwrite {
                return Ok(i);
            }
            dst[i] = self.data[self.nread as usize % PIPESIZE];
            self.nread = self.nread.wrapping_add(1);
        }
        Ok(dst.len())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::fs::tests::{test_fs, test_proc};

    #[test]
    fn transfers_bytes_across_threads() {
        let (_, fs) = test_fs(256);
        let pipe = Arc::new(Pipe::new());

        let payload: Vec<u8> = (0..4 * PIPESIZE).map(|i| i as u8).collect();
        thread::scope(|s| {
            let writer = {
                let pipe = pipe.clone();
                let payload = payload.clone();
                let fs = &fs;
                s.spawn(move || {
                    let proc = test_proc();
                    let ctx = KernelCtx::new(fs, &proc);
                    assert_eq!(pipe.write(&payload, &ctx), Ok(payload.len()));
                    pipe.close(true);
                })
            };

            let proc = test_proc();
            let ctx = KernelCtx::new(&fs, &proc);
            let mut received = Vec::new();
            let mut buf = [0u8; 100];
            loop {
                let n = pipe.read(&mut buf, &ctx).unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            writer.join().unwrap();
            assert_eq!(received, payload);
        });
    }

    #[test]
    fn read_from_closed_empty_pipe_is_eof() {
        let (_, fs) = test_fs(256);
        let proc = test_proc();
        let ctx = KernelCtx::new(&fs, &proc);

        let pipe = Pipe::new();
        pipe.close(true);
        let mut buf = [0u8; 10];
        assert_eq!(pipe.read(&mut buf, &ctx), Ok(0));
    }

    #[test]
    fn killed_thread_cannot_block_on_a_pipe() {
        let (_, fs) = test_fs(256);
        let proc = test_proc();
        proc.kill();
        let ctx = KernelCtx::new(&fs, &proc);

        let pipe = Pipe::new();
        let mut buf = [0u8; 10];
        assert_eq!(pipe.read(&mut buf, &ctx), Err(()));
        assert_eq!(pipe.write(&[1, 2, 3], &ctx), Err(()));
    }

    #[test]
    fn write_fails_after_reader_closes() {
        let (_, fs) = test_fs(256);
        let proc = test_proc();
        let ctx = KernelCtx::new(&fs, &proc);

        let pipe = Pipe::new();
        pipe.close(false);
        assert_eq!(pipe.write(b"x", &ctx), Err(()));
    }
}
