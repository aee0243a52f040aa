//! `--environ`, `--isatty` and `--keys` helpers for checking the host terminal.

use std::ffi::CStr;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};

use crate::terminal_restore::TerminalRestoreGuard;

const CTRL_C: u8 = 0x03;

/// Print every inherited environment variable as `KEY=VALUE`.
pub fn write_environ(out: &mut impl Write) -> io::Result<()> {
    let mut vars: Vec<_> = std::env::vars_os().collect();
    vars.sort();
    for (key, value) in vars {
        writeln!(out, "{}={}", key.to_string_lossy(), value.to_string_lossy())?;
    }
    out.flush()
}

/// Terminal facts about one descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyReport {
    pub fd: RawFd,
    pub is_tty: bool,
    pub pgrp: i32,
    pub name: Option<String>,
}

impl TtyReport {
    pub fn probe(fd: RawFd) -> Self {
        // SAFETY: isatty/tcgetpgrp only inspect the descriptor.
        let is_tty = unsafe { libc::isatty(fd) } == 1;
        let pgrp = unsafe { libc::tcgetpgrp(fd) };
        Self {
            fd,
            is_tty,
            pgrp,
            name: tty_name(fd),
        }
    }

    pub fn line(&self) -> String {
        format!(
            "{}: isatty={} pgrp={} ttyname={}",
            self.fd,
            u8::from(self.is_tty),
            self.pgrp,
            self.name.as_deref().unwrap_or("<none>")
        )
    }
}

/// Name of the terminal behind `fd`, if it is one.
pub fn tty_name(fd: RawFd) -> Option<String> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: buf is a valid writable buffer of the given length.
    if unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) } != 0 {
        return None;
    }
    // SAFETY: ttyname_r NUL-terminates on success.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

/// Report on stdin, stdout and stderr. Returns whether all three are terminals.
pub fn write_isatty(out: &mut impl Write) -> io::Result<bool> {
    let mut all_tty = true;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        let report = TtyReport::probe(fd);
        all_tty &= report.is_tty;
        writeln!(out, "{}", report.line())?;
    }
    out.flush()?;
    Ok(all_tty)
}

/// Printable form of one raw input byte.
pub fn describe_key_byte(byte: u8) -> String {
    match byte {
        b'\r' | b'\n' => "<ENTER>".to_string(),
        0x20..=0x7e => format!("<x{byte:02X}:{}>", byte as char),
        _ => format!("<x{byte:02X}>"),
    }
}

/// Echo raw key codes from stdin until Ctrl+C or EOF.
pub fn run_key_dump(guard: &TerminalRestoreGuard) -> Result<()> {
    guard
        .enable_raw_mode()
        .context("failed to enable raw mode for key dump")?;
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "Press keys to see their codes, Ctrl+C to exit\r")?;
    stdout.flush()?;
    let mut buf = [0u8; 64];
    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("reading keys"),
        };
        for &byte in &buf[..n] {
            if byte == CTRL_C {
                write!(stdout, "\r\n")?;
                stdout.flush()?;
                guard.restore();
                return Ok(());
            }
            let text = describe_key_byte(byte);
            if text == "<ENTER>" {
                write!(stdout, "{text}\r\n")?;
            } else {
                write!(stdout, "{text}")?;
            }
        }
        stdout.flush()?;
    }
    guard.restore();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_bytes_are_described() {
        assert_eq!(describe_key_byte(b'a'), "<x61:a>");
        assert_eq!(describe_key_byte(b'\r'), "<ENTER>");
        assert_eq!(describe_key_byte(0x1b), "<x1B>");
        assert_eq!(describe_key_byte(0x7f), "<x7F>");
    }

    #[test]
    fn pipe_is_not_a_tty() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let report = TtyReport::probe(fds[0]);
        assert!(!report.is_tty);
        assert!(report.name.is_none());
        assert!(report.line().ends_with("isatty=0 pgrp=-1 ttyname=<none>"));
        for fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn environ_lists_variables() {
        let mut out = Vec::new();
        write_environ(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        for (key, _) in std::env::vars_os() {
            let key = key.to_string_lossy();
            assert!(text.contains(&format!("{key}=")), "missing {key}");
        }
    }
}
