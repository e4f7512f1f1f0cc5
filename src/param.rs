/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of in-memory inodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Block size.
pub const BSIZE: usize = 512;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in the on-disk log (the header block lists this many).
pub const LOGSIZE: usize = 63;

/// Soft bound on the number of cached blocks; the cache evicts cold
/// entries once it grows past this.
pub const EVICTION_THRESHOLD: usize = MAXOPBLOCKS * 3;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Pipe ring capacity in bytes.
pub const PIPESIZE: usize = 512;
