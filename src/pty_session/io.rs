use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Give up on a descriptor that accepts no bytes for this long.
const WRITE_STALL_LIMIT: Duration = Duration::from_secs(2);

/// Result of one read pass over a PTY master.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// `n` bytes are available at the front of the buffer.
    Data(usize),
    /// Spurious wakeup; the descriptor stays open.
    Retry,
    /// EOF or a hard error. The descriptor must not be polled again.
    Closed(Option<io::Error>),
}

pub(crate) fn should_retry_read_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Interrupted || err.kind() == ErrorKind::WouldBlock
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> isize {
    // SAFETY: buf is a valid writable slice for buf.len() bytes.
    unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) }
}

/// Read what is immediately available, then keep issuing non-blocking reads
/// until roughly `preferred` bytes are assembled or the descriptor runs dry.
pub(crate) fn read_chunk(fd: RawFd, buf: &mut [u8], preferred: usize) -> ReadOutcome {
    let n = raw_read(fd, buf);
    if n == 0 {
        return ReadOutcome::Closed(None);
    }
    if n < 0 {
        let err = io::Error::last_os_error();
        if should_retry_read_error(&err) {
            return ReadOutcome::Retry;
        }
        return ReadOutcome::Closed(Some(err));
    }
    let mut len = n as usize;
    while len + 4 < preferred && len < buf.len() {
        let more = raw_read(fd, &mut buf[len..]);
        if more <= 0 {
            break;
        }
        len += more as usize;
    }
    ReadOutcome::Data(len)
}

/// Write the entire buffer, retrying short writes and transient errors.
pub(crate) fn write_all(fd: RawFd, mut data: &[u8]) -> io::Result<()> {
    let mut last_progress = Instant::now();
    while !data.is_empty() {
        // SAFETY: data is a valid readable slice for data.len() bytes.
        let written = unsafe { libc::write(fd, data.as_ptr().cast::<libc::c_void>(), data.len()) };
        if written < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            if err.kind() == ErrorKind::WouldBlock {
                if last_progress.elapsed() >= WRITE_STALL_LIMIT {
                    return Err(io::Error::new(
                        ErrorKind::TimedOut,
                        "descriptor accepted no data",
                    ));
                }
                wait_writable(fd, Duration::from_millis(10));
                continue;
            }
            return Err(err);
        }
        if written == 0 {
            return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0"));
        }
        last_progress = Instant::now();
        data = data.get(written as usize..).unwrap_or(&[]);
    }
    Ok(())
}

fn wait_writable(fd: RawFd, timeout: Duration) {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: pfd is a single valid pollfd.
    let _ = unsafe { libc::poll(&mut pfd, 1, timeout_ms(timeout)) };
}

pub(crate) fn timeout_ms(timeout: Duration) -> libc::c_int {
    libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX)
}

/// Wait until any of `fds` is readable. Returns one flag per descriptor.
pub(crate) fn wait_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    if pfds.is_empty() {
        std::thread::sleep(timeout);
        return Ok(Vec::new());
    }
    // SAFETY: pfds is a valid array of pollfd structures of the given length.
    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms(timeout)) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }
    Ok(pfds
        .iter()
        .map(|pfd| pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}

/// Configure a descriptor for non-blocking I/O.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl only inspects and updates flags of the given descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl only inspects and updates flags of the given descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a pipe whose both ends are close-on-exec.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn cloexec_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [-1; 2];
    // SAFETY: fds is a valid two-element array for pipe2() to fill.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

/// Create a pipe whose both ends are close-on-exec.
///
/// Without `pipe2` the flag is set in a second step; `PtySpawner` serializes
/// its forks so no sibling child inherits the window.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn cloexec_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [-1; 2];
    // SAFETY: fds is a valid two-element array for pipe() to fill.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    for fd in fds {
        if let Err(err) = set_cloexec(fd) {
            close_fd(fds[0]);
            close_fd(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Close a file descriptor while ignoring errors. Negative values are ignored.
pub(crate) fn close_fd(fd: RawFd) {
    if fd >= 0 {
        // SAFETY: the caller owns fd and does not use it afterwards.
        let _ = unsafe { libc::close(fd) };
    }
}
