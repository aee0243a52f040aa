//! The live PTY session: descriptors, child pid, and the monotonic state tag.

use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::io::{close_fd, read_chunk, write_all, ReadOutcome};
use super::spawn::Handshake;
use super::winsize::WindowSize;
use crate::error::BridgeError;

/// Byte the terminal line discipline turns into SIGINT.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// Lifecycle of a session. Transitions only move forward; see [`Session::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    ChildExited,
    PtyClosed,
    Terminated,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::Running => 1,
            SessionState::ChildExited | SessionState::PtyClosed => 2,
            SessionState::Terminated => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the state machine monotonic.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        next.rank() > self.rank()
    }
}

/// Which PTY master a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyStream {
    Output,
    Error,
}

/// Write side of the PTY as seen by the input path.
pub trait PtyInput {
    fn write_input(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn set_window_size(&mut self, size: WindowSize) -> io::Result<()>;
}

/// A spawned child attached to one (or, in duplex mode, two) PTY masters.
#[derive(Debug)]
pub struct Session {
    master_fd: RawFd,
    error_fd: RawFd,
    child_pid: libc::pid_t,
    exit_status: Option<ExitStatus>,
    state: SessionState,
    handshake: Option<Handshake>,
    exec_error: Option<i32>,
    pty_name: Option<String>,
}

impl Session {
    pub(super) fn new(
        master_fd: RawFd,
        error_fd: RawFd,
        child_pid: libc::pid_t,
        handshake: Handshake,
        pty_name: Option<String>,
    ) -> Self {
        Self {
            master_fd,
            error_fd,
            child_pid,
            exit_status: None,
            state: SessionState::Created,
            handshake: Some(handshake),
            exec_error: None,
            pty_name,
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.child_pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pty_name(&self) -> Option<&str> {
        self.pty_name.as_deref()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Errno reported by the child when `exec` failed.
    pub fn exec_error(&self) -> Option<i32> {
        self.exec_error
    }

    pub fn is_duplex(&self) -> bool {
        self.error_fd >= 0
    }

    pub fn has_open_pty(&self) -> bool {
        self.master_fd >= 0 || self.error_fd >= 0
    }

    pub fn child_alive(&self) -> bool {
        self.child_pid > 0
    }

    /// Move to `next` if that keeps the state machine monotonic.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        debug!(from = ?self.state, to = ?next, "session state change");
        self.state = next;
        true
    }

    /// Let the child proceed past its startup barrier and learn how `exec` went.
    ///
    /// An exec failure is not an error here: the child already printed the
    /// reason into the PTY and exits with the errno, which the event loop reaps.
    pub fn release(&mut self) -> Result<(), BridgeError> {
        let Some(handshake) = self.handshake.take() else {
            return Ok(());
        };
        self.exec_error = handshake.release()?;
        if let Some(errno) = self.exec_error {
            warn!(
                pid = self.child_pid,
                errno,
                "child failed to exec: {}",
                io::Error::from_raw_os_error(errno)
            );
        }
        self.transition(SessionState::Running);
        Ok(())
    }

    /// Open masters in poll order: output first, then the error stream.
    pub fn open_streams(&self) -> Vec<(PtyStream, RawFd)> {
        let mut streams = Vec::with_capacity(2);
        if self.master_fd >= 0 {
            streams.push((PtyStream::Output, self.master_fd));
            if self.error_fd >= 0 {
                streams.push((PtyStream::Error, self.error_fd));
            }
        }
        streams
    }

    pub(crate) fn read_stream(
        &mut self,
        stream: PtyStream,
        buf: &mut [u8],
        preferred: usize,
    ) -> ReadOutcome {
        let fd = self.stream_fd(stream);
        if fd < 0 {
            return ReadOutcome::Closed(None);
        }
        read_chunk(fd, buf, preferred)
    }

    fn stream_fd(&self, stream: PtyStream) -> RawFd {
        match stream {
            PtyStream::Output => self.master_fd,
            PtyStream::Error => self.error_fd,
        }
    }

    /// Close one master after EOF or a read error.
    pub fn close_stream(&mut self, stream: PtyStream) {
        let slot = match stream {
            PtyStream::Output => &mut self.master_fd,
            PtyStream::Error => &mut self.error_fd,
        };
        close_fd(*slot);
        *slot = -1;
        debug!(?stream, "pty master closed");
        if self.master_fd < 0 {
            // Without the primary master the error stream is no longer polled.
            close_fd(self.error_fd);
            self.error_fd = -1;
            self.transition(SessionState::PtyClosed);
        }
    }

    /// Non-blocking check for child exit; reaps the child on completion.
    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.child_pid <= 0 {
            return self.exit_status;
        }
        let mut status = 0;
        // SAFETY: child_pid is owned by this session; WNOHANG only inspects state.
        let ret = unsafe { libc::waitpid(self.child_pid, &mut status, libc::WNOHANG) };
        if ret == 0 {
            return None;
        }
        if ret < 0 {
            warn!(
                pid = self.child_pid,
                "waitpid failed: {}",
                io::Error::last_os_error()
            );
            self.child_pid = -1;
        } else {
            let exit = ExitStatus::from_raw(status);
            info!(pid = self.child_pid, status = %exit, "child exited");
            self.exit_status = Some(exit);
            self.child_pid = -1;
        }
        self.transition(SessionState::ChildExited);
        self.exit_status
    }

    /// Send SIGHUP to the child's whole process group.
    pub fn hangup(&self) {
        if self.child_pid <= 0 {
            return;
        }
        // SAFETY: the child called setsid(), so its pid is also its process group id.
        if unsafe { libc::kill(-self.child_pid, libc::SIGHUP) } != 0 {
            debug!(
                pid = self.child_pid,
                "SIGHUP to child group failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Forward a single interrupt byte to the foreground program.
    pub fn send_interrupt(&mut self) -> io::Result<()> {
        self.write_input(&[INTERRUPT_BYTE])
    }

    pub fn mark_terminated(&mut self) {
        self.transition(SessionState::Terminated);
    }

    pub fn window_size(&self) -> Option<WindowSize> {
        if self.master_fd < 0 {
            return None;
        }
        let mut ws = WindowSize::default().to_winsize();
        // SAFETY: ws is initialized; ioctl fills it from an open master.
        let rc = unsafe { libc::ioctl(self.master_fd, libc::TIOCGWINSZ, &mut ws) };
        (rc == 0).then(|| WindowSize::from_winsize(&ws))
    }
}

impl PtyInput for Session {
    fn write_input(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.master_fd < 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty master closed"));
        }
        write_all(self.master_fd, bytes)
    }

    fn set_window_size(&mut self, size: WindowSize) -> io::Result<()> {
        let ws = size.to_winsize();
        let mut result = Ok(());
        for fd in [self.master_fd, self.error_fd] {
            if fd < 0 {
                continue;
            }
            // SAFETY: ws is initialized; the kernel forwards SIGWINCH to the foreground group.
            if unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) } != 0 {
                result = Err(io::Error::last_os_error());
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        drop(self.handshake.take());
        close_fd(self.master_fd);
        close_fd(self.error_fd);
        self.master_fd = -1;
        self.error_fd = -1;
        if self.child_pid <= 0 {
            return;
        }
        self.hangup();
        if wait_for_exit(self.child_pid, Duration::from_millis(500)) {
            return;
        }
        // SAFETY: best-effort kill of the child group we created.
        if unsafe { libc::kill(-self.child_pid, libc::SIGKILL) } != 0 {
            debug!(
                "SIGKILL to child group failed: {}",
                io::Error::last_os_error()
            );
        }
        let mut status = 0;
        // SAFETY: blocking reap of our own child after SIGKILL.
        if unsafe { libc::waitpid(self.child_pid, &mut status, 0) } < 0 {
            debug!("waitpid after SIGKILL failed: {}", io::Error::last_os_error());
        }
    }
}

/// Wait for the child process to terminate, but bail out after `timeout`.
pub(super) fn wait_for_exit(child_pid: libc::pid_t, timeout: Duration) -> bool {
    if timeout.is_zero() {
        return false;
    }
    let start = Instant::now();
    let mut status = 0;
    while start.elapsed() < timeout {
        // SAFETY: child_pid is owned by the session; WNOHANG only inspects state.
        let result = unsafe { libc::waitpid(child_pid, &mut status, libc::WNOHANG) };
        if result != 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[cfg(test)]
impl Session {
    /// Wrap existing descriptors without a spawn handshake.
    pub(crate) fn from_parts(master_fd: RawFd, error_fd: RawFd, child_pid: libc::pid_t) -> Self {
        Self {
            master_fd,
            error_fd,
            child_pid,
            exit_status: None,
            state: SessionState::Running,
            handshake: None,
            exec_error: None,
            pty_name: None,
        }
    }
}
