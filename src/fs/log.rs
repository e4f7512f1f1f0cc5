//! Logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls. The
//! logging system only commits when there are no FS system calls active.
//! Thus there is never any reasoning required about whether a commit might
//! write an uncommitted system call's updates to disk.
//!
//! A system call scopes itself with `begin_op`/`end_op` (through the `Tx`
//! handle). Usually `begin_op` just increments the count of in-progress FS
//! system calls and returns. But if it thinks the log is close to running
//! out, it sleeps until the last outstanding `end_op` commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;

use super::FileSystem;
use crate::bio::{Buf, BufData, BufUnlocked};
use crate::lock::SleepableLock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

pub struct Log {
    /// Block number of the log header.
    start: u32,

    /// Number of log blocks, header included.
    size: u32,

    /// How many FS sys calls are executing?
    outstanding: i32,

    /// In commit(), please wait.
    committing: bool,

    /// Cache handles of the blocks recorded by the running transactions, in
    /// header order. Holding them keeps the blocks resident until install.
    bufs: ArrayVec<BufUnlocked, LOGSIZE>,
}

/// Contents of the on-disk log header block.
#[repr(C)]
struct LogHeader {
    num_blocks: u32,
    block_no: [u32; LOGSIZE],
}

impl Log {
    /// Creates the log state for the region starting at `start`, replaying
    /// any committed-but-uninstalled transaction left by a crash.
    pub fn new(start: u32, size: u32, fs: &FileSystem) -> Self {
        let mut log = Self {
            start,
            size,
            outstanding: 0,
            committing: false,
            bufs: ArrayVec::new(),
        };
        log.recover(fs);
        log
    }

    /// Copy committed blocks from the log to their home locations.
    fn install_trans(&mut self, fs: &FileSystem) {
        let start = self.start;
        for (tail, dbuf) in self.bufs.drain(..).enumerate() {
            // Read the log block, then overwrite and persist the destination.
            let lbuf = fs.bcache().read(start + tail as u32 + 1);
            let mut dbuf = dbuf.lock();
            dbuf.data_mut().copy_from(lbuf.data());
            fs.bcache().write(&dbuf);
        }
    }

    /// Read the log header from disk, re-acquiring a handle for every block
    /// it lists so that `install_trans` can replay them.
    fn read_head(&mut self, fs: &FileSystem) {
        let buf = fs.bcache().read(self.start);

        const_assert!(mem::size_of::<LogHeader>() <= BSIZE);
        const_assert!(mem::align_of::<BufData>() % mem::align_of::<LogHeader>() == 0);
        // SAFETY: LogHeader contains only u32s, buf.data is aligned and
        // large enough, and we hold the buffer lock.
        let lh = unsafe { &*(buf.data().as_ptr() as *const LogHeader) };
        let n = lh.num_blocks as usize;
        assert!(n <= LOGSIZE, "corrupt log header");
        let blocks: ArrayVec<u32, LOGSIZE> = lh.block_no[..n].iter().copied().collect();
        drop(buf);

        for blockno in blocks {
            self.bufs.push(fs.bcache().get_buf(blockno));
        }
    }

    /// Write the in-memory log header to disk. This is the true point at
    /// which the current transaction commits.
    fn write_head(&mut self, fs: &FileSystem) {
        let mut buf = fs.bcache().read(self.start);
        {
            // SAFETY: as in read_head, plus exclusive access via the lock.
            let lh = unsafe { &mut *(buf.data_mut().as_mut_ptr() as *mut LogHeader) };
            lh.num_blocks = self.bufs.len() as u32;
            for (slot, recorded) in izip!(&mut lh.block_no, &self.bufs) {
                *slot = recorded.blockno;
            }
        }
        fs.bcache().write(&buf);
    }

    fn recover(&mut self, fs: &FileSystem) {
        self.read_head(fs);
        let n = self.bufs.len();

        // If committed, copy from log to disk.
        self.install_trans(fs);

        // Clear the log.
        self.write_head(fs);

        if n > 0 {
            ::log::info!("log: recovered {} blocks", n);
        }
    }

    /// Copy the recorded blocks' cached contents into the log area.
    fn write_log(&mut self, fs: &FileSystem) {
        for (tail, from) in self.bufs.iter().enumerate() {
            let mut to = fs.bcache().read(self.start + tail as u32 + 1);
            let from = from.clone().lock();
            to.data_mut().copy_from(from.data());
            fs.bcache().write(&to);
        }
    }

    fn commit(&mut self, fs: &FileSystem) {
        if !self.bufs.is_empty() {
            // Write modified blocks from cache to the log.
            self.write_log(fs);

            // Write header to disk -- the real commit.
            self.write_head(fs);

            // Now install writes to home locations.
            self.install_trans(fs);

            // Erase the transaction from the log.
            self.write_head(fs);
        }
    }

    /// Caller has modified `b.data` and is done with the buffer. Record its
    /// block number in the log and keep it resident until the group commits;
    /// the actual disk write happens in `commit`.
    ///
    /// Returns true iff the block was not already recorded: repeated writes
    /// of one block within a transaction coalesce into a single log slot.
    pub fn write(&mut self, b: Buf) -> bool {
        assert!(
            self.bufs.len() < LOGSIZE && (self.bufs.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "log write outside of transaction");

        if self.bufs.iter().all(|buf| buf.blockno != b.blockno()) {
            self.bufs.push(b.unlock());
            true
        } else {
            false
        }
    }
}

impl SleepableLock<Log> {
    /// Called at the start of each FS system call.
    pub fn begin_op(&self) {
        let mut guard = self.lock();
        loop {
            if guard.committing
                // This op might exhaust log space; wait for commit.
                || guard.bufs.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                guard.sleep();
            } else {
                guard.outstanding += 1;
                break;
            }
        }
    }

    /// Called at the end of each FS system call.
    /// Commits if this was the last outstanding operation.
    pub fn end_op(&self, fs: &FileSystem) {
        let mut guard = self.lock();
        guard.outstanding -= 1;
        assert!(!guard.committing, "end_op while committing");

        if guard.outstanding == 0 {
            // No ongoing transaction exists, and the lock is still held, so
            // new transactions cannot start.
            guard.committing = true;

            // Commit without holding the lock, since committing sleeps on
            // buffer locks and device writes.
            guard.reacquire_after(||
                // SAFETY: committing is true, so no other thread reads or
                // writes the log state.
                unsafe { &mut *self.get_mut_raw() }.commit(fs));

            guard.committing = false;
        }

        // begin_op may be waiting for log space, and decrementing
        // outstanding has decreased the amount of reserved space.
        guard.wakeup();
    }
}
