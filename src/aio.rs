//! Asynchronous disk I/O on top of io_uring.
//!
//! One submit-and-wait operation at a time, with a hard timeout. The
//! cancellation semantics of in-flight operations are unreliable, so a
//! timed-out context is torn down and recreated (`reset`) instead of
//! cancelled in place.

use std::io;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};

const QUEUE_DEPTH: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl IoOp {
    pub fn name(self) -> &'static str {
        match self {
            IoOp::Read => "read",
            IoOp::Write => "write",
        }
    }
}

/// Completion of one async operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// All requested bytes were transferred.
    Done,
    /// The operation did not complete within the timeout. The context has
    /// been reset; the caller should skip this block and move on.
    TimedOut,
    /// The kernel reported an error (negative errno).
    Failed(i32),
    /// Fewer bytes than requested were transferred.
    Short(usize),
}

pub struct AsyncIoContext {
    ring: IoUring,
}

impl AsyncIoContext {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(QUEUE_DEPTH)?,
        })
    }

    /// Tear the ring down and build a fresh one, abandoning anything that
    /// may still be in flight.
    pub fn reset(&mut self) -> io::Result<()> {
        self.ring = IoUring::new(QUEUE_DEPTH)?;
        Ok(())
    }

    /// Submit one operation and wait for its completion or the timeout.
    ///
    /// # Safety
    /// `buf` must be valid for `len` bytes until the call returns, and for
    /// reads must remain valid until after a subsequent [`Self::reset`]
    /// when the call timed out.
    pub unsafe fn run(
        &mut self,
        op: IoOp,
        fd: i32,
        buf: *mut u8,
        len: usize,
        offset: u64,
        timeout: Duration,
    ) -> io::Result<IoOutcome> {
        let entry = match op {
            IoOp::Read => opcode::Read::new(types::Fd(fd), buf, len as u32)
                .offset(offset as _)
                .build(),
            IoOp::Write => opcode::Write::new(types::Fd(fd), buf as *const u8, len as u32)
                .offset(offset as _)
                .build(),
        };

        self.ring
            .submission()
            .push(&entry)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))?;

        let ts = types::Timespec::new()
            .sec(timeout.as_secs())
            .nsec(timeout.subsec_nanos());
        let args = types::SubmitArgs::new().timespec(&ts);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => {
                self.reset()?;
                return Ok(IoOutcome::TimedOut);
            }
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                // A ctrl-c interrupts the wait; not an error on its own.
                self.reset()?;
                return Ok(IoOutcome::TimedOut);
            }
            Err(e) => return Err(e),
        }

        let Some(cqe) = self.ring.completion().next() else {
            self.reset()?;
            return Ok(IoOutcome::TimedOut);
        };
        let result = cqe.result();
        if result < 0 {
            return Ok(IoOutcome::Failed(result));
        }
        if result as usize != len {
            return Ok(IoOutcome::Short(result as usize));
        }
        Ok(IoOutcome::Done)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    #[test]
    fn write_then_read_roundtrip() {
        let Ok(mut ctx) = AsyncIoContext::new() else {
            // io_uring may be unavailable in sandboxes; nothing to test.
            return;
        };
        let mut file = tempfile();
        file.write_all(&[0u8; 4096]).unwrap();
        let fd = file.as_raw_fd();

        let mut data = vec![0xa5u8; 4096];
        let out = unsafe {
            ctx.run(
                IoOp::Write,
                fd,
                data.as_mut_ptr(),
                data.len(),
                0,
                Duration::from_secs(5),
            )
        }
        .unwrap();
        assert_eq!(out, IoOutcome::Done);

        let mut back = vec![0u8; 4096];
        let out = unsafe {
            ctx.run(
                IoOp::Read,
                fd,
                back.as_mut_ptr(),
                back.len(),
                0,
                Duration::from_secs(5),
            )
        }
        .unwrap();
        assert_eq!(out, IoOutcome::Done);
        assert_eq!(back, data);
    }

    #[test]
    fn reset_recreates_the_ring() {
        let Ok(mut ctx) = AsyncIoContext::new() else {
            return;
        };
        ctx.reset().unwrap();
    }

    fn tempfile() -> std::fs::File {
        let path = std::env::temp_dir().join(format!("hwstress-aio-{}", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
