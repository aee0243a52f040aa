use std::io;
use std::os::unix::io::RawFd;

use super::abi::WriteStream;
use super::ConsoleBinding;
use crate::pty_session::{write_all, PtyStream};

/// Where PTY output ends up, whichever console path was negotiated.
pub trait ConsoleSink {
    /// Write every byte of `bytes` to the console stream matching `stream`.
    fn write_stream(&mut self, stream: PtyStream, bytes: &[u8]) -> io::Result<()>;

    /// User-facing diagnostic on the error stream. Failures are ignored.
    fn report(&mut self, message: &str) {
        let line = format!("\r\nptybridge[{}]: {message}\r\n", std::process::id());
        let _ = self.write_stream(PtyStream::Error, line.as_bytes());
    }
}

/// The bridge's own stdout/stderr.
#[derive(Debug, Clone, Copy)]
pub struct DirectConsole {
    out_fd: RawFd,
    err_fd: RawFd,
}

impl DirectConsole {
    pub fn new() -> Self {
        Self::with_fds(libc::STDOUT_FILENO, libc::STDERR_FILENO)
    }

    pub fn with_fds(out_fd: RawFd, err_fd: RawFd) -> Self {
        Self { out_fd, err_fd }
    }
}

impl Default for DirectConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleSink for DirectConsole {
    fn write_stream(&mut self, stream: PtyStream, bytes: &[u8]) -> io::Result<()> {
        let fd = match stream {
            PtyStream::Output => self.out_fd,
            PtyStream::Error => self.err_fd,
        };
        write_all(fd, bytes)
    }
}

/// Output routed through the extension's write-text capability.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionConsole {
    binding: ConsoleBinding,
}

impl ExtensionConsole {
    pub fn new(binding: ConsoleBinding) -> Self {
        Self { binding }
    }
}

impl ConsoleSink for ExtensionConsole {
    fn write_stream(&mut self, stream: PtyStream, mut bytes: &[u8]) -> io::Result<()> {
        let target = match stream {
            PtyStream::Output => WriteStream::Output,
            PtyStream::Error => WriteStream::Error,
        };
        while !bytes.is_empty() {
            let written = self.binding.write_text(bytes, target)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "console extension accepted no bytes",
                ));
            }
            bytes = bytes.get(written..).unwrap_or(&[]);
        }
        Ok(())
    }
}
