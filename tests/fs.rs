//! End-to-end tests of the system-call surface over an in-memory disk.

use std::sync::Arc;
use std::thread;

use rand::Rng;

use opalfs::fcntl::FcntlFlags;
use opalfs::fs::{FileSystem, Path, NDIRECT, T_DIR, T_FILE};
use opalfs::hal::MemDisk;
use opalfs::mkfs::mkfs;
use opalfs::param::{BSIZE, PIPESIZE};
use opalfs::proc::{KernelCtx, Proc};
use opalfs::sysfile::{AT_FDCWD, TIOCGWINSZ};
use opalfs::{Console, Uart, CONSOLE_MAJOR};

fn setup(nblocks: usize) -> (Arc<MemDisk>, FileSystem) {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = Arc::new(MemDisk::new(nblocks));
    mkfs(&*disk, nblocks as u32, 128);
    let fs = FileSystem::new(disk.clone());
    fs.init();
    (disk, fs)
}

fn p(s: &str) -> &Path {
    // SAFETY: test paths contain no NUL bytes.
    unsafe { Path::from_bytes(s.as_bytes()) }
}

#[test]
fn single_block_write_and_read_back() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let fd = ctx
        .sys_openat(AT_FDCWD, p("/a"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
        .unwrap();
    assert_eq!(ctx.sys_write(fd, b"hello"), Ok(5));
    ctx.sys_close(fd).unwrap();

    let fd = ctx.sys_openat(AT_FDCWD, p("/a"), FcntlFlags::O_RDONLY).unwrap();
    let mut buf = [0u8; 512];
    assert_eq!(ctx.sys_read(fd, &mut buf), Ok(5));
    assert_eq!(&buf[..5], b"hello");

    let st = ctx.sys_fstat(fd).unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.typ, T_FILE);
    ctx.sys_close(fd).unwrap();

    let st = ctx.sys_fstatat(AT_FDCWD, p("/a"), 0).unwrap();
    assert_eq!(st.size, 5);
    ctx.teardown();
}

#[test]
fn contents_survive_a_remount() {
    let (disk, fs) = setup(2048);
    {
        let proc = Proc::new();
        let ctx = KernelCtx::new(&fs, &proc);
        let fd = ctx
            .sys_openat(AT_FDCWD, p("/keep"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
            .unwrap();
        assert_eq!(ctx.sys_write(fd, b"durable data"), Ok(12));
        ctx.sys_close(fd).unwrap();
    }

    let fs2 = FileSystem::new(disk.clone());
    fs2.init();
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs2, &proc);
    let fd = ctx.sys_openat(AT_FDCWD, p("/keep"), FcntlFlags::O_RDONLY).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(ctx.sys_read(fd, &mut buf), Ok(12));
    assert_eq!(&buf[..12], b"durable data");
    ctx.sys_close(fd).unwrap();
}

#[test]
fn descriptors_are_lowest_free_and_slots_recycle() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let fd0 = ctx
        .sys_openat(AT_FDCWD, p("/f"), FcntlFlags::O_CREATE | FcntlFlags::O_RDWR)
        .unwrap();
    let fd1 = ctx.sys_openat(AT_FDCWD, p("/f"), FcntlFlags::O_RDONLY).unwrap();
    assert_eq!((fd0, fd1), (0, 1));

    ctx.sys_close(fd0).unwrap();
    let fd2 = ctx.sys_openat(AT_FDCWD, p("/f"), FcntlFlags::O_RDONLY).unwrap();
    assert_eq!(fd2, 0);

    ctx.sys_close(fd1).unwrap();
    ctx.sys_close(fd2).unwrap();

    assert!(ctx.sys_close(17).is_err());
    assert!(ctx.sys_close(fd2).is_err());

    let mut buf = [0u8; 4];
    assert!(ctx.sys_read(3, &mut buf).is_err());
}

#[test]
fn mkdir_and_unlink_restore_parent_links() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let before = ctx.sys_fstatat(AT_FDCWD, p("/"), 0).unwrap();
    assert_eq!(before.typ, T_DIR);

    ctx.sys_mkdirat(AT_FDCWD, p("/sub"), 0).unwrap();
    let during = ctx.sys_fstatat(AT_FDCWD, p("/"), 0).unwrap();
    assert_eq!(during.nlink, before.nlink + 1);

    ctx.sys_unlinkat(AT_FDCWD, p("/sub"), 0).unwrap();
    let after = ctx.sys_fstatat(AT_FDCWD, p("/"), 0).unwrap();
    assert_eq!(after.nlink, before.nlink);
    assert!(ctx.sys_fstatat(AT_FDCWD, p("/sub"), 0).is_err());
}

#[test]
fn unlinking_a_non_empty_directory_fails() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    ctx.sys_mkdirat(AT_FDCWD, p("/d"), 0).unwrap();
    ctx.sys_mknodat(AT_FDCWD, p("/d/x"), 1, 1).unwrap();

    assert!(ctx.sys_unlinkat(AT_FDCWD, p("/d"), 0).is_err());

    ctx.sys_unlinkat(AT_FDCWD, p("/d/x"), 0).unwrap();
    ctx.sys_unlinkat(AT_FDCWD, p("/d"), 0).unwrap();
    assert!(ctx.sys_fstatat(AT_FDCWD, p("/d"), 0).is_err());
}

#[test]
fn unlinking_dot_entries_fails() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    ctx.sys_mkdirat(AT_FDCWD, p("/d"), 0).unwrap();
    assert!(ctx.sys_unlinkat(AT_FDCWD, p("/d/."), 0).is_err());
    assert!(ctx.sys_unlinkat(AT_FDCWD, p("/d/.."), 0).is_err());
}

#[test]
fn dup_shares_one_offset() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let fd = ctx
        .sys_openat(AT_FDCWD, p("/a"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
        .unwrap();
    assert_eq!(ctx.sys_write(fd, b"hello world"), Ok(11));
    ctx.sys_close(fd).unwrap();

    let fd = ctx.sys_openat(AT_FDCWD, p("/a"), FcntlFlags::O_RDONLY).unwrap();
    let fd2 = ctx.sys_dup(fd).unwrap();

    let mut buf = [0u8; 6];
    assert_eq!(ctx.sys_read(fd, &mut buf[..6]), Ok(6));
    assert_eq!(&buf[..6], b"hello ");

    // The duplicate continues where the original stopped.
    let mut rest = [0u8; 16];
    assert_eq!(ctx.sys_read(fd2, &mut rest), Ok(5));
    assert_eq!(&rest[..5], b"world");

    ctx.sys_close(fd).unwrap();
    // The slot stays alive until the last descriptor closes.
    assert_eq!(ctx.sys_read(fd2, &mut rest), Ok(0));
    ctx.sys_close(fd2).unwrap();
}

#[test]
fn write_only_descriptors_cannot_read_and_vice_versa() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let fd = ctx
        .sys_openat(AT_FDCWD, p("/a"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
        .unwrap();
    let mut buf = [0u8; 4];
    assert!(ctx.sys_read(fd, &mut buf).is_err());
    ctx.sys_close(fd).unwrap();

    let fd = ctx.sys_openat(AT_FDCWD, p("/a"), FcntlFlags::O_RDONLY).unwrap();
    assert!(ctx.sys_write(fd, b"nope").is_err());
    ctx.sys_close(fd).unwrap();

    // Directories may only be opened read-only.
    assert!(ctx.sys_openat(AT_FDCWD, p("/"), FcntlFlags::O_WRONLY).is_err());
    assert!(ctx.sys_openat(AT_FDCWD, p("/"), FcntlFlags::O_RDONLY).is_ok());
}

#[test]
fn files_larger_than_the_direct_blocks_use_the_indirect_block() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let len = (NDIRECT + 1) * BSIZE;
    let payload: Vec<u8> = (0..len).map(|i| (i / BSIZE) as u8).collect();

    let fd = ctx
        .sys_openat(AT_FDCWD, p("/big"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
        .unwrap();
    assert_eq!(ctx.sys_write(fd, &payload), Ok(len));
    ctx.sys_close(fd).unwrap();

    let st = ctx.sys_fstatat(AT_FDCWD, p("/big"), 0).unwrap();
    assert_eq!(st.size, len);

    let fd = ctx.sys_openat(AT_FDCWD, p("/big"), FcntlFlags::O_RDONLY).unwrap();
    let mut back = vec![0u8; len];
    let mut got = 0;
    while got < len {
        let n = ctx.sys_read(fd, &mut back[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(back, payload);
    ctx.sys_close(fd).unwrap();

    // Unlinking it returns every block to the allocator.
    ctx.sys_unlinkat(AT_FDCWD, p("/big"), 0).unwrap();
}

#[test]
fn writev_concatenates_buffers() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let fd = ctx
        .sys_openat(AT_FDCWD, p("/v"), FcntlFlags::O_CREATE | FcntlFlags::O_RDWR)
        .unwrap();
    assert_eq!(ctx.sys_writev(fd, &[&b"abc"[..], b"", b"defg"]), Ok(7));
    ctx.sys_close(fd).unwrap();

    let fd = ctx.sys_openat(AT_FDCWD, p("/v"), FcntlFlags::O_RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(ctx.sys_read(fd, &mut buf), Ok(7));
    assert_eq!(&buf[..7], b"abcdefg");
    ctx.sys_close(fd).unwrap();
}

#[test]
fn chdir_makes_relative_paths_work() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    ctx.sys_mkdirat(AT_FDCWD, p("/dir"), 0).unwrap();
    ctx.sys_chdir(p("/dir")).unwrap();

    let fd = ctx
        .sys_openat(AT_FDCWD, p("rel"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
        .unwrap();
    assert_eq!(ctx.sys_write(fd, b"xyz"), Ok(3));
    ctx.sys_close(fd).unwrap();

    assert!(ctx.sys_fstatat(AT_FDCWD, p("/dir/rel"), 0).is_ok());
    assert!(ctx.sys_fstatat(AT_FDCWD, p("rel"), 0).is_ok());

    // Dot components resolve through the tree.
    assert!(ctx.sys_fstatat(AT_FDCWD, p("./rel"), 0).is_ok());
    assert!(ctx.sys_fstatat(AT_FDCWD, p("../dir/rel"), 0).is_ok());

    // chdir to a non-directory fails.
    assert!(ctx.sys_chdir(p("/dir/rel")).is_err());
    ctx.teardown();
}

#[test]
fn pipe_reads_see_eof_after_writer_closes() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let (rfd, wfd) = ctx.sys_pipe2(0).unwrap();
    assert_eq!(ctx.sys_write(wfd, b"ping"), Ok(4));
    ctx.sys_close(wfd).unwrap();

    let mut buf = [0u8; 10];
    assert_eq!(ctx.sys_read(rfd, &mut buf), Ok(4));
    assert_eq!(&buf[..4], b"ping");
    // Empty pipe with no writer: end of file.
    assert_eq!(ctx.sys_read(rfd, &mut buf), Ok(0));
    ctx.sys_close(rfd).unwrap();

    // Read and write ends enforce their directions.
    let (rfd, wfd) = ctx.sys_pipe2(0).unwrap();
    assert!(ctx.sys_write(rfd, b"x").is_err());
    assert!(ctx.sys_read(wfd, &mut buf).is_err());
    ctx.sys_close(rfd).unwrap();
    ctx.sys_close(wfd).unwrap();
}

#[test]
fn pipe_transfers_more_than_its_capacity_across_threads() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();

    let payload: Vec<u8> = (0..PIPESIZE * 3 + 17).map(|i| i as u8).collect();
    let (rfd, wfd) = KernelCtx::new(&fs, &proc).sys_pipe2(0).unwrap();

    thread::scope(|s| {
        let writer = {
            let fs = &fs;
            let proc = &proc;
            let payload = payload.clone();
            s.spawn(move || {
                let ctx = KernelCtx::new(fs, proc);
                assert_eq!(ctx.sys_write(wfd, &payload), Ok(payload.len()));
                ctx.sys_close(wfd).unwrap();
            })
        };

        let ctx = KernelCtx::new(&fs, &proc);
        let mut received = Vec::new();
        let mut buf = [0u8; 200];
        loop {
            let n = ctx.sys_read(rfd, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();
        assert_eq!(received, payload);
        ctx.sys_close(rfd).unwrap();
    });
}

struct TestUart(opalfs::lock::SpinLock<Vec<u8>>);

impl Uart for TestUart {
    fn putc(&self, c: u8) {
        self.0.lock().push(c);
    }
}

#[test]
fn console_device_round_trips_through_the_inode_layer() {
    let (_, fs) = setup(2048);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);

    let uart = Arc::new(TestUart(opalfs::lock::SpinLock::new("uart", Vec::new())));
    struct Fwd(Arc<TestUart>);
    impl Uart for Fwd {
        fn putc(&self, c: u8) {
            self.0.putc(c)
        }
    }
    let console = Arc::new(Console::new(Box::new(Fwd(uart.clone()))));
    fs.register_device(CONSOLE_MAJOR, console.clone());

    ctx.sys_mknodat(AT_FDCWD, p("/console"), CONSOLE_MAJOR, 0).unwrap();
    let fd = ctx.sys_openat(AT_FDCWD, p("/console"), FcntlFlags::O_RDWR).unwrap();

    assert_eq!(ctx.sys_write(fd, b"boot: ok\n"), Ok(9));
    assert_eq!(&*uart.0.lock(), b"boot: ok\n");

    for c in b"input line\n" {
        console.intr(*c);
    }
    let mut buf = [0u8; 64];
    let n = ctx.sys_read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"input line\n");

    assert_eq!(ctx.sys_ioctl(fd, TIOCGWINSZ), Ok(0));
    assert!(ctx.sys_ioctl(fd, 0x1234).is_err());
    assert!(ctx.sys_ioctl(42, TIOCGWINSZ).is_err());
    ctx.sys_close(fd).unwrap();
}

#[test]
fn concurrent_writers_do_not_corrupt_each_other() {
    let (_, fs) = setup(4096);

    thread::scope(|s| {
        for t in 0..4usize {
            let fs = &fs;
            s.spawn(move || {
                let proc = Proc::new();
                let ctx = KernelCtx::new(fs, &proc);
                let name = format!("/file{}", t);
                let payload: Vec<u8> = (0..3 * BSIZE).map(|i| (i + t) as u8).collect();

                let fd = ctx
                    .sys_openat(
                        AT_FDCWD,
                        p(&name),
                        FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY,
                    )
                    .unwrap();
                assert_eq!(ctx.sys_write(fd, &payload), Ok(payload.len()));
                ctx.sys_close(fd).unwrap();

                let fd = ctx.sys_openat(AT_FDCWD, p(&name), FcntlFlags::O_RDONLY).unwrap();
                let mut back = vec![0u8; payload.len()];
                let mut got = 0;
                while got < back.len() {
                    let n = ctx.sys_read(fd, &mut back[got..]).unwrap();
                    assert!(n > 0);
                    got += n;
                }
                assert_eq!(back, payload);
                ctx.sys_close(fd).unwrap();
            });
        }
    });
}

#[test]
fn random_length_appends_match_a_shadow_file() {
    let (_, fs) = setup(4096);
    let proc = Proc::new();
    let ctx = KernelCtx::new(&fs, &proc);
    let mut rng = rand::thread_rng();

    let fd = ctx
        .sys_openat(AT_FDCWD, p("/r"), FcntlFlags::O_CREATE | FcntlFlags::O_WRONLY)
        .unwrap();
    let mut shadow = Vec::new();
    for _ in 0..40 {
        let len = rng.gen_range(1..1500);
        let chunk: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        assert_eq!(ctx.sys_write(fd, &chunk), Ok(chunk.len()));
        shadow.extend_from_slice(&chunk);
    }
    ctx.sys_close(fd).unwrap();

    let fd = ctx.sys_openat(AT_FDCWD, p("/r"), FcntlFlags::O_RDONLY).unwrap();
    let mut back = vec![0u8; shadow.len()];
    let mut got = 0;
    while got < back.len() {
        let n = ctx.sys_read(fd, &mut back[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(back, shadow);
    ctx.sys_close(fd).unwrap();
}
