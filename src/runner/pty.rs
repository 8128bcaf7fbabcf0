//! Pseudo-terminal plumbing
//!
//! The master side is non-blocking and registered with the tokio reactor. The
//! slave side is handed to the child as stdin, stdout and stderr.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, OutputFlags, SetArg};
use tokio::io::unix::AsyncFd;

pub(super) struct PtyMaster {
    inner: AsyncFd<File>,
}

/// Open a terminal pair without echo and without `\n` to `\r\n` translation
pub(super) fn open() -> io::Result<(PtyMaster, OwnedFd)> {
    let pty = openpty(None, None)?;

    let mut termios = tcgetattr(&pty.slave)?;
    termios.local_flags.remove(LocalFlags::ECHO);
    termios.output_flags.remove(OutputFlags::ONLCR);
    tcsetattr(&pty.slave, SetArg::TCSANOW, &termios)?;

    let fd = pty.master.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

    let inner = AsyncFd::new(File::from(pty.master))?;
    Ok((PtyMaster { inner }, pty.slave))
}

/// The slave side is gone, i.e. every process using the terminal has exited
pub(super) fn is_hangup(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == Errno::EIO as i32 || code == Errno::EPIPE as i32)
}

impl PtyMaster {
    /// Read available output. `Ok(0)` means end of output.
    pub(super) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(Err(e)) if is_hangup(&e) => return Ok(0),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub(super) async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().write(data)) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}
