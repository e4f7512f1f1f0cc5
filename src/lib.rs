//! opalfs: the on-disk filesystem core of the opal teaching kernel.
//!
//! A layered stack that turns a raw block device into a POSIX-style
//! hierarchical filesystem with crash-consistent writes:
//!
//!   + `bio`: a buffer cache with LRU eviction over the block device.
//!   + `fs::log`: a write-ahead log giving atomic multi-block transactions
//!     with group commit across concurrent operations.
//!   + `fs::inode`: on-disk inodes (direct + single indirect blocks),
//!     shared in-memory inode handles, directories.
//!   + `fs::path`: namei-style path resolution.
//!   + `file`, `pipe`, `console`: the open-file table, pipes, and the
//!     console device inode.
//!   + `sysfile`: the system-call surface, as methods on `KernelCtx`.
//!
//! The rest of the kernel appears only as collaborators: a block device
//! (`hal::BlockDevice`), and the calling thread's process state
//! (`proc::Proc`), which makes the whole stack runnable under host tests
//! against an in-memory device (`hal::MemDisk`).

pub mod bio;
pub mod console;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod hal;
pub mod lock;
pub mod mkfs;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod sysfile;

pub use console::{CharDevice, Console, Uart, CONSOLE_MAJOR};
pub use fcntl::FcntlFlags;
pub use fs::{FileSystem, Path, Stat};
pub use hal::{BlockDevice, MemDisk, Partition};
pub use mkfs::mkfs;
pub use proc::{KernelCtx, Proc};
pub use sysfile::{AT_FDCWD, TIOCGWINSZ};
