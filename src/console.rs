//! Console input and output. Reads are line at a time.
//!
//! Implements special input characters:
//! * newline -- end of line
//! * control-h -- backspace
//! * control-u -- kill line
//! * control-d -- end of file

use crate::lock::SleepableLock;
use crate::proc::KernelCtx;

/// Size of console input buffer.
const INPUT_BUF: usize = 128;

/// Major device number of the console.
pub const CONSOLE_MAJOR: u16 = 1;

/// The character sink the console echoes and writes to (the UART driver,
/// in the kernel).
pub trait Uart: Send + Sync {
    fn putc(&self, c: u8);
}

/// Character devices reachable through device inodes.
pub trait CharDevice: Send + Sync {
    fn read(&self, dst: &mut [u8], ctx: &KernelCtx<'_>) -> Result<usize, ()>;
    fn write(&self, src: &[u8], ctx: &KernelCtx<'_>) -> Result<usize, ()>;
}

struct InputBuffer {
    buf: [u8; INPUT_BUF],

    /// Read index.
    r: usize,

    /// Write index: end of the last completed line.
    w: usize,

    /// Edit index: end of the line being typed.
    e: usize,
}

impl InputBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; INPUT_BUF],
            r: 0,
            w: 0,
            e: 0,
        }
    }
}

pub struct Console {
    uart: Box<dyn Uart>,
    input: SleepableLock<InputBuffer>,
}

/// Control-x
const fn ctrl(x: char) -> u8 {
    x as u8 - b'@'
}

impl Console {
    pub fn new(uart: Box<dyn Uart>) -> Self {
        Self {
            uart,
            input: SleepableLock::new("console_input", InputBuffer::new()),
        }
    }

    fn put_backspace(&self) {
        // Overwrite the echoed character with a space.
        self.uart.putc(8);
        self.uart.putc(b' ');
        self.uart.putc(8);
    }

    /// Handle one incoming character: do erase/kill processing, append to
    /// the input buffer, and wake up readers when a whole line (or
    /// end-of-file) has arrived. Called by the UART interrupt handler.
    pub fn intr(&self, c: u8) {
        let mut guard = self.input.lock();
        match c {
            // Kill line.
            m if m == ctrl('U') => {
                while guard.e != guard.w
                    && guard.buf[guard.e.wrapping_sub(1) % INPUT_BUF] != b'\n'
                {
                    guard.e = guard.e.wrapping_sub(1);
                    self.put_backspace();
                }
            }

            // Backspace.
            m if m == ctrl('H') || m == 0x7f => {
                if guard.e != guard.w {
                    guard.e = guard.e.wrapping_sub(1);
                    self.put_backspace();
                }
            }

            _ => {
                if c != 0 && guard.e.wrapping_sub(guard.r) < INPUT_BUF {
                    let c = if c == b'\r' { b'\n' } else { c };

                    // Echo back to the user.
                    self.uart.putc(c);

                    // Store for consumption by read().
                    let ind = guard.e % INPUT_BUF;
                    guard.buf[ind] = c;
                    guard.e = guard.e.wrapping_add(1);
                    if c == b'\n'
                        || c == ctrl('D')
                        || guard.e == guard.r.wrapping_add(INPUT_BUF)
                    {
                        // A whole line (or end-of-file) has arrived.
                        guard.w = guard.e;
                        guard.wakeup();
                    }
                }
            }
        }
    }
}

impl CharDevice for Console {
    /// Copy up to a whole input line to `dst`, blocking until one arrives.
    /// The wait is alertable: a killed thread gets `Err`.
    fn read(&self, dst: &mut [u8], ctx: &KernelCtx<'_>) -> Result<usize, ()> {
        let mut guard = self.input.lock();
        let target = dst.len();
        let mut i = 0;
        while i < target {
            // Wait until the interrupt handler has put some input into the
            // buffer.
            while guard.r == guard.w {
                if ctx.proc().killed() {
                    return Err(());
                }
                guard.sleep();
            }
            let cin = guard.buf[guard.r % INPUT_BUF];
            guard.r = guard.r.wrapping_add(1);

            if cin == ctrl('D') {
                // end-of-file
                if i > 0 {
                    // Save ^D for next time, to make sure the caller gets a
                    // 0-byte result.
                    guard.r = guard.r.wrapping_sub(1);
                }
                break;
            }

            dst[i] = cin;
            i += 1;
            if cin == b'\n' {
                // A whole line has arrived; return to the user-level read.
                break;
            }
        }
        Ok(i)
    }

    fn write(&self, src: &[u8], _ctx: &KernelCtx<'_>) -> Result<usize, ()> {
        for c in src {
            self.uart.putc(*c);
        }
        Ok(src.len())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::fs::tests::{test_fs, test_proc};
    use crate::lock::SpinLock;
    use crate::proc::KernelCtx;

    struct TestUart(SpinLock<Vec<u8>>);

    impl Uart for TestUart {
        fn putc(&self, c: u8) {
            self.0.lock().push(c);
        }
    }

    fn console() -> (Arc<TestUart>, Console) {
        let uart = Arc::new(TestUart(SpinLock::new("test_uart", Vec::new())));
        struct Fwd(Arc<TestUart>);
        impl Uart for Fwd {
            fn putc(&self, c: u8) {
                self.0.putc(c)
            }
        }
        let console = Console::new(Box::new(Fwd(uart.clone())));
        (uart, console)
    }

    #[test]
    fn reads_return_one_line() {
        let (_, console) = console();
        let (_, fs) = test_fs(256);
        let proc = test_proc();
        let ctx = KernelCtx::new(&fs, &proc);

        for c in b"ls -l\nnext" {
            console.intr(*c);
        }
        let mut buf = [0u8; 64];
        let n = console.read(&mut buf, &ctx).unwrap();
        assert_eq!(&buf[..n], b"ls -l\n");
    }

    #[test]
    fn backspace_and_kill_line_edit_the_pending_line() {
        let (uart, console) = console();
        let (_, fs) = test_fs(256);
        let proc = test_proc();
        let ctx = KernelCtx::new(&fs, &proc);

        for c in b"cat" {
            console.intr(*c);
        }
        console.intr(ctrl('H'));
        for c in b"r x\n" {
            console.intr(*c);
        }
        let mut buf = [0u8; 64];
        let n = console.read(&mut buf, &ctx).unwrap();
        assert_eq!(&buf[..n], b"car x\n");

        // Echoes include the backspace sequence.
        assert!(uart.0.lock().windows(3).any(|w| w == [8, b' ', 8]));

        for c in b"zap" {
            console.intr(*c);
        }
        console.intr(ctrl('U'));
        for c in b"ok\n" {
            console.intr(*c);
        }
        let n = console.read(&mut buf, &ctx).unwrap();
        assert_eq!(&buf[..n], b"ok\n");
    }

    #[test]
    fn ctrl_d_terminates_and_preserves_eof() {
        let (_, console) = console();
        let (_, fs) = test_fs(256);
        let proc = test_proc();
        let ctx = KernelCtx::new(&fs, &proc);

        for c in b"hi" {
            console.intr(*c);
        }
        console.intr(ctrl('D'));

        let mut buf = [0u8; 64];
        // First read returns the partial line, pushing ^D back...
        let n = console.read(&mut buf, &ctx).unwrap();
        assert_eq!(&buf[..n], b"hi");
        // ...so the next read reports end-of-file.
        let n = console.read(&mut buf, &ctx).unwrap();
        assert_eq!(n, 0);
    }
}
