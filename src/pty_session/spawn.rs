//! PTY allocation, fork, and the parent/child startup barrier.

use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::io::{close_fd, cloexec_pipe, set_nonblocking, timeout_ms};
use super::session::Session;
use super::winsize::WindowSize;
use crate::error::{BridgeError, EXIT_EXEC_FAILED};

/// How long the child waits for the parent before giving up and continuing.
const RELEASE_WAIT: Duration = Duration::from_secs(5);
/// How long the parent waits for the child to report its exec outcome.
const EXEC_REPORT_WAIT: Duration = Duration::from_secs(5);

const RELEASE_BYTE: u8 = b'G';
const READY_MARKER: u8 = b'R';
const FAILURE_MARKER: u8 = b'E';

/// Held from PTY allocation until the parent has closed the child's ends, so a
/// concurrent fork never inherits another session's slave or status pipe.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Environment marker telling login shells to stay in the invoking directory.
pub const DIRECTORY_INVOKING_VAR: &str = "CHERE_INVOKING";

/// What to run inside the PTY.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub term: String,
    pub force_shlvl: bool,
}

impl ChildCommand {
    pub fn new(argv: Vec<String>, term: impl Into<String>) -> Self {
        Self {
            argv,
            working_dir: None,
            term: term.into(),
            force_shlvl: false,
        }
    }
}

/// Interactive login shell used when no command is given.
pub fn default_shell_argv() -> Vec<String> {
    let shell = env::var("SHELL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string());
    vec![shell, "-l".to_string(), "-i".to_string()]
}

/// Creates sessions for one configured command.
#[derive(Debug, Clone)]
pub struct PtySpawner {
    command: ChildCommand,
}

impl PtySpawner {
    pub fn new(command: ChildCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &ChildCommand {
        &self.command
    }

    /// Allocate the PTY pair(s) and fork the child.
    ///
    /// The child is parked behind a barrier until [`Session::release`] is called,
    /// so nothing it prints can race ahead of the parent's own setup.
    pub fn create_session(
        &self,
        window: WindowSize,
        want_error_stream: bool,
    ) -> Result<Session, BridgeError> {
        let prepared = PreparedExec::new(&self.command)?;

        let spawn_guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let primary = open_pty_pair(window)?;
        let error_pair = if want_error_stream {
            match open_pty_pair(window) {
                Ok(pair) => Some(pair),
                Err(err) => {
                    primary.close();
                    return Err(err);
                }
            }
        } else {
            None
        };

        let pipes = match HandshakePipes::new() {
            Ok(pipes) => pipes,
            Err(err) => {
                primary.close();
                if let Some(pair) = error_pair {
                    pair.close();
                }
                return Err(BridgeError::Spawn {
                    context: "pipe",
                    source: err,
                });
            }
        };

        let pty_name = primary.slave_name();
        let child = ChildSetup {
            slave_std: primary.slave,
            slave_err: error_pair.as_ref().map_or(-1, |pair| pair.slave),
            masters: [primary.master, error_pair.as_ref().map_or(-1, |pair| pair.master)],
            release_rd: pipes.release_rd,
            release_wr: pipes.release_wr,
            status_rd: pipes.status_rd,
            status_wr: pipes.status_wr,
        };

        debug!(argv = ?self.command.argv, duplex = want_error_stream, "forking child");
        // SAFETY: everything the child touches was prepared above; after fork the child
        // only issues async-signal-safe syscalls before execve or _exit.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            let err = BridgeError::spawn_errno("fork");
            primary.close();
            if let Some(pair) = error_pair {
                pair.close();
            }
            pipes.close();
            return Err(err);
        }
        if pid == 0 {
            // SAFETY: we are in the freshly forked child.
            unsafe { child_exec(&child, &prepared) };
        }

        close_fd(child.slave_std);
        close_fd(child.slave_err);
        close_fd(child.release_rd);
        close_fd(child.status_wr);
        drop(spawn_guard);

        let error_master = error_pair.as_ref().map_or(-1, |pair| pair.master);
        for fd in [primary.master, error_master] {
            if fd >= 0 {
                if let Err(err) = set_nonblocking(fd) {
                    warn!(fd, "failed to make pty master non-blocking: {err}");
                }
            }
        }

        info!(
            pid,
            pty = pty_name.as_deref().unwrap_or("<unknown>"),
            "child created"
        );
        let handshake = Handshake {
            release_fd: child.release_wr,
            status_fd: child.status_rd,
        };
        Ok(Session::new(
            primary.master,
            error_master,
            pid,
            handshake,
            pty_name,
        ))
    }
}

/// Parent-side ends of the startup barrier.
#[derive(Debug)]
pub(crate) struct Handshake {
    release_fd: RawFd,
    status_fd: RawFd,
}

impl Handshake {
    /// Unblock the child and collect its exec report.
    ///
    /// Returns the child's errno when `exec` (or its setup) failed.
    pub(super) fn release(mut self) -> Result<Option<i32>, BridgeError> {
        let byte = [RELEASE_BYTE];
        // SAFETY: release_fd is the write end we own; byte is a valid 1-byte buffer.
        let written = unsafe { libc::write(self.release_fd, byte.as_ptr().cast(), 1) };
        if written != 1 {
            return Err(BridgeError::Handshake(format!(
                "could not release child: {}",
                io::Error::last_os_error()
            )));
        }
        close_fd(self.release_fd);
        self.release_fd = -1;

        let report = read_until_eof(self.status_fd, EXEC_REPORT_WAIT);
        Ok(parse_exec_report(&report))
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        close_fd(self.release_fd);
        close_fd(self.status_fd);
    }
}

fn read_until_eof(fd: RawFd, limit: Duration) -> Vec<u8> {
    let start = Instant::now();
    let mut report = Vec::new();
    let mut buf = [0u8; 16];
    loop {
        let remaining = limit.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            warn!("child did not finish its exec report in time");
            break;
        }
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a single valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms(remaining)) };
        if rc < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
        if rc == 0 {
            continue;
        }
        // SAFETY: buf is a valid writable buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n > 0 {
            report.extend_from_slice(&buf[..n as usize]);
            continue;
        }
        if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        break;
    }
    report
}

/// Decode the bytes the child wrote to the status pipe before `exec` closed it.
pub(crate) fn parse_exec_report(report: &[u8]) -> Option<i32> {
    let pos = report.iter().position(|&b| b == FAILURE_MARKER)?;
    let raw = report.get(pos + 1..pos + 5)?;
    let errno = i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]);
    Some(errno)
}

struct PtyPair {
    master: RawFd,
    slave: RawFd,
}

impl PtyPair {
    fn slave_name(&self) -> Option<String> {
        let mut buf = [0 as libc::c_char; 128];
        // SAFETY: buf is a valid writable buffer of the given length.
        let rc = unsafe { libc::ttyname_r(self.slave, buf.as_mut_ptr(), buf.len()) };
        if rc != 0 {
            return None;
        }
        // SAFETY: ttyname_r NUL-terminates on success.
        let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }

    fn close(&self) {
        close_fd(self.master);
        close_fd(self.slave);
    }
}

fn open_pty_pair(window: WindowSize) -> Result<PtyPair, BridgeError> {
    let mut master: RawFd = -1;
    let mut slave: RawFd = -1;
    let mut ws = window.to_winsize();
    #[allow(clippy::unnecessary_mut_passed)]
    // SAFETY: openpty expects valid pointers for master/slave/winsize; we pass stack locals.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut ws,
        )
    };
    if rc != 0 {
        return Err(BridgeError::spawn_errno("openpty"));
    }
    for fd in [master, slave] {
        if let Err(err) = super::io::set_cloexec(fd) {
            debug!(fd, "failed to mark pty descriptor close-on-exec: {err}");
        }
    }
    Ok(PtyPair { master, slave })
}

struct HandshakePipes {
    release_rd: RawFd,
    release_wr: RawFd,
    status_rd: RawFd,
    status_wr: RawFd,
}

impl HandshakePipes {
    fn new() -> io::Result<Self> {
        let (release_rd, release_wr) = cloexec_pipe()?;
        let (status_rd, status_wr) = match cloexec_pipe() {
            Ok(pair) => pair,
            Err(err) => {
                close_fd(release_rd);
                close_fd(release_wr);
                return Err(err);
            }
        };
        Ok(Self {
            release_rd,
            release_wr,
            status_rd,
            status_wr,
        })
    }

    fn close(&self) {
        for fd in [self.release_rd, self.release_wr, self.status_rd, self.status_wr] {
            close_fd(fd);
        }
    }
}

/// Descriptors the child needs after fork.
struct ChildSetup {
    slave_std: RawFd,
    slave_err: RawFd,
    masters: [RawFd; 2],
    release_rd: RawFd,
    release_wr: RawFd,
    status_rd: RawFd,
    status_wr: RawFd,
}

/// Everything `execve` needs, built before fork so the child never allocates.
struct PreparedExec {
    program: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const libc::c_char>,
    working_dir: Option<CString>,
    exec_failure: Vec<u8>,
    chdir_failure: Vec<u8>,
}

impl PreparedExec {
    fn new(command: &ChildCommand) -> Result<Self, BridgeError> {
        let invalid = |what: &str| BridgeError::Config(format!("{what} contains a NUL byte"));
        let Some(first) = command.argv.first() else {
            return Err(BridgeError::Config("empty child command".to_string()));
        };

        let argv: Vec<CString> = command
            .argv
            .iter()
            .map(|arg| CString::new(arg.as_str()).map_err(|_| invalid("command argument")))
            .collect::<Result<_, _>>()?;
        let program = CString::new(resolve_program(first).into_vec())
            .map_err(|_| invalid("command path"))?;

        let envp = build_child_env(command)
            .into_iter()
            .filter_map(|entry| CString::new(entry.into_vec()).ok())
            .collect::<Vec<_>>();

        let working_dir = command
            .working_dir
            .as_ref()
            .map(|dir| CString::new(dir.as_os_str().as_bytes()).map_err(|_| invalid("working directory")))
            .transpose()?;

        let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|s| s.as_ptr()).collect();
        argv_ptrs.push(ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|s| s.as_ptr()).collect();
        envp_ptrs.push(ptr::null());

        let shown = shell_words::join(&command.argv);
        let exec_failure = format!("\r\nptybridge: failed to run `{shown}`, errno ").into_bytes();
        let chdir_failure = match &command.working_dir {
            Some(dir) => format!("\r\nptybridge: chdir `{}` failed, errno ", dir.display()).into_bytes(),
            None => Vec::new(),
        };

        Ok(Self {
            program,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            working_dir,
            exec_failure,
            chdir_failure,
        })
    }
}

/// Search `$PATH` the way `execvp` would, but in the parent.
fn resolve_program(program: &str) -> OsString {
    if program.contains('/') {
        return OsString::from(program);
    }
    let Some(paths) = env::var_os("PATH") else {
        return OsString::from(program);
    };
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .map_or_else(|| OsString::from(program), PathBuf::into_os_string)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Inherited environment plus the variables the bridge forces on the child.
pub(crate) fn build_child_env(command: &ChildCommand) -> Vec<OsString> {
    let mut overrides: Vec<(&str, &str)> = vec![("TERM", command.term.as_str())];
    if command.force_shlvl {
        overrides.push(("SHLVL", "1"));
    }
    if command.working_dir.is_some() {
        overrides.push((DIRECTORY_INVOKING_VAR, "1"));
    }

    let mut entries: Vec<OsString> = env::vars_os()
        .filter(|(key, _)| !overrides.iter().any(|(name, _)| key == OsStr::new(name)))
        .map(|(key, value)| {
            let mut entry = key;
            entry.push("=");
            entry.push(value);
            entry
        })
        .collect();
    for (key, value) in overrides {
        entries.push(OsString::from(format!("{key}={value}")));
    }
    entries
}

/// Child process setup after fork: waits for release, logs into the PTY, execs.
///
/// # Safety
///
/// Must only be called in the child process after `fork()`. Never returns.
unsafe fn child_exec(setup: &ChildSetup, exec: &PreparedExec) -> ! {
    for fd in setup.masters {
        close_fd(fd);
    }
    close_fd(setup.release_wr);
    close_fd(setup.status_rd);

    wait_for_release(setup.release_rd);
    close_fd(setup.release_rd);

    if libc::setsid() == -1 {
        fail_before_exec(setup.status_wr);
    }
    if libc::ioctl(setup.slave_std, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
        fail_before_exec(setup.status_wr);
    }
    let slave_err = if setup.slave_err >= 0 {
        setup.slave_err
    } else {
        setup.slave_std
    };
    if libc::dup2(setup.slave_std, libc::STDIN_FILENO) < 0
        || libc::dup2(setup.slave_std, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_err, libc::STDERR_FILENO) < 0
    {
        fail_before_exec(setup.status_wr);
    }
    if setup.slave_std > libc::STDERR_FILENO {
        close_fd(setup.slave_std);
    }
    if setup.slave_err > libc::STDERR_FILENO {
        close_fd(setup.slave_err);
    }

    reset_signal_dispositions();
    apply_terminal_defaults(libc::STDIN_FILENO);

    if let Some(dir) = &exec.working_dir {
        if libc::chdir(dir.as_ptr()) != 0 {
            write_errno_message(libc::STDERR_FILENO, &exec.chdir_failure, last_errno());
        }
    }

    let ready = [READY_MARKER];
    let _ = libc::write(setup.status_wr, ready.as_ptr().cast(), 1);

    libc::execve(exec.program.as_ptr(), exec.argv_ptrs.as_ptr(), exec.envp_ptrs.as_ptr());

    let errno = last_errno();
    write_errno_message(libc::STDERR_FILENO, &exec.exec_failure, errno);
    report_failure(setup.status_wr, errno);
    libc::_exit(if errno != 0 { errno } else { EXIT_EXEC_FAILED });
}

unsafe fn wait_for_release(fd: RawFd) {
    let start = Instant::now();
    while start.elapsed() < RELEASE_WAIT {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let remaining = RELEASE_WAIT.saturating_sub(start.elapsed());
        let rc = libc::poll(&mut pfd, 1, timeout_ms(remaining));
        if rc < 0 && last_errno() == libc::EINTR {
            continue;
        }
        if rc > 0 {
            let mut byte = [0u8; 1];
            let _ = libc::read(fd, byte.as_mut_ptr().cast(), 1);
        }
        return;
    }
}

unsafe fn fail_before_exec(status_fd: RawFd) -> ! {
    let errno = last_errno();
    report_failure(status_fd, errno);
    libc::_exit(if errno != 0 { errno } else { EXIT_EXEC_FAILED });
}

unsafe fn report_failure(status_fd: RawFd, errno: i32) {
    let mut payload = [0u8; 5];
    payload[0] = FAILURE_MARKER;
    payload[1..].copy_from_slice(&errno.to_ne_bytes());
    let _ = libc::write(status_fd, payload.as_ptr().cast(), payload.len());
}

/// Default dispositions everywhere, except job-control signals which a login
/// shell expects to start ignored.
unsafe fn reset_signal_dispositions() {
    for sig in [
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGTERM,
        libc::SIGCHLD,
        libc::SIGPIPE,
        libc::SIGALRM,
        libc::SIGWINCH,
        libc::SIGUSR1,
        libc::SIGUSR2,
    ] {
        libc::signal(sig, libc::SIG_DFL);
    }
    for sig in [libc::SIGTSTP, libc::SIGTTIN, libc::SIGTTOU] {
        libc::signal(sig, libc::SIG_IGN);
    }
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::sigprocmask(libc::SIG_SETMASK, &mask, ptr::null_mut());
}

/// DEL as erase character plus echo flags a login terminal normally has.
unsafe fn apply_terminal_defaults(fd: RawFd) {
    let mut attr: libc::termios = std::mem::zeroed();
    if libc::tcgetattr(fd, &mut attr) != 0 {
        return;
    }
    attr.c_cc[libc::VERASE] = 0x7f;
    attr.c_iflag |= libc::IXANY | libc::IMAXBEL;
    attr.c_lflag |= libc::ECHOE | libc::ECHOK | libc::ECHOCTL | libc::ECHOKE;
    libc::tcsetattr(fd, libc::TCSANOW, &attr);
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// `prefix` followed by the decimal errno and CRLF, without allocating.
unsafe fn write_errno_message(fd: RawFd, prefix: &[u8], errno: i32) {
    let _ = libc::write(fd, prefix.as_ptr().cast(), prefix.len());
    let mut digits = [0u8; 16];
    let len = format_decimal(errno, &mut digits);
    let _ = libc::write(fd, digits.as_ptr().cast(), len);
    let tail = b"\r\n";
    let _ = libc::write(fd, tail.as_ptr().cast(), tail.len());
}

pub(crate) fn format_decimal(value: i32, out: &mut [u8; 16]) -> usize {
    let mut n = value.unsigned_abs();
    let mut tmp = [0u8; 16];
    let mut len = 0;
    loop {
        tmp[len] = b'0' + (n % 10) as u8;
        len += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    let mut pos = 0;
    if value < 0 {
        out[0] = b'-';
        pos = 1;
    }
    for i in (0..len).rev() {
        out[pos] = tmp[i];
        pos += 1;
    }
    pos
}
