use super::io::*;
use super::session::*;
use super::spawn::*;
use super::winsize::WindowSize;
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::thread;
use std::time::{Duration, Instant};

fn pipe_pair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let result = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(
        result,
        0,
        "pipe() failed with errno {}",
        io::Error::last_os_error()
    );
    (fds[0], fds[1])
}

fn sh(script: &str) -> ChildCommand {
    ChildCommand::new(
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        "xterm-256color",
    )
}

fn spawn(command: ChildCommand, duplex: bool) -> Session {
    let spawner = PtySpawner::new(command);
    let mut session = spawner
        .create_session(WindowSize::from_cells(100, 30), duplex)
        .expect("create session");
    assert_eq!(session.state(), SessionState::Created);
    session.release().expect("release child");
    assert_eq!(session.state(), SessionState::Running);
    session
}

/// Pump both masters until the primary one closes, returning (output, error) bytes.
fn drain(session: &mut Session) -> (Vec<u8>, Vec<u8>) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.has_open_pty() && Instant::now() < deadline {
        let streams = session.open_streams();
        let fds: Vec<RawFd> = streams.iter().map(|(_, fd)| *fd).collect();
        let ready = wait_readable(&fds, Duration::from_millis(50)).expect("poll masters");
        for ((stream, _), is_ready) in streams.into_iter().zip(ready) {
            if !is_ready {
                continue;
            }
            match session.read_stream(stream, &mut buf, 280) {
                ReadOutcome::Data(n) => match stream {
                    PtyStream::Output => out.extend_from_slice(&buf[..n]),
                    PtyStream::Error => err.extend_from_slice(&buf[..n]),
                },
                ReadOutcome::Retry => {}
                ReadOutcome::Closed(_) => session.close_stream(stream),
            }
        }
    }
    (out, err)
}

fn reap(session: &mut Session) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(status) = session.try_wait() {
            return status;
        }
        assert!(Instant::now() < deadline, "child did not exit in time");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn child_output_and_exit_code_reach_parent() {
    let mut session = spawn(sh("printf ready; exit 3"), false);
    assert!(session.pty_name().is_some());
    let (out, _) = drain(&mut session);
    assert_eq!(String::from_utf8_lossy(&out), "ready");
    let status = reap(&mut session);
    assert_eq!(status.code(), Some(3));
    assert!(!session.child_alive());
}

#[test]
fn exec_failure_reports_errno_and_exits_with_it() {
    let command = ChildCommand::new(
        vec!["/nonexistent/ptybridge-no-such-program".to_string()],
        "xterm",
    );
    let mut session = spawn(command, false);
    assert_eq!(session.exec_error(), Some(libc::ENOENT));
    let (out, _) = drain(&mut session);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("failed to run"), "missing diagnostic: {text:?}");
    let status = reap(&mut session);
    assert_eq!(status.code(), Some(libc::ENOENT));
}

#[test]
fn duplex_mode_separates_error_stream() {
    let mut session = spawn(sh("printf out; printf err >&2"), true);
    assert!(session.is_duplex());
    let (out, err) = drain(&mut session);
    assert_eq!(String::from_utf8_lossy(&out), "out");
    assert_eq!(String::from_utf8_lossy(&err), "err");
    reap(&mut session);
}

#[test]
fn child_sees_forced_environment() {
    let mut command = sh("printf '%s|%s' \"$TERM\" \"$SHLVL\"");
    command.term = "vt220".to_string();
    command.force_shlvl = true;
    let mut session = spawn(command, false);
    let (out, _) = drain(&mut session);
    assert_eq!(String::from_utf8_lossy(&out), "vt220|1");
    reap(&mut session);
}

#[test]
fn working_directory_is_applied_before_exec() {
    let dir = tempfile::tempdir().expect("tempdir");
    let canonical = dir.path().canonicalize().expect("canonical path");
    let mut command = sh("pwd -P; printf \"$CHERE_INVOKING\"");
    command.working_dir = Some(dir.path().to_path_buf());
    let mut session = spawn(command, false);
    let (out, _) = drain(&mut session);
    let text = String::from_utf8_lossy(&out);
    assert!(
        text.contains(canonical.to_string_lossy().as_ref()),
        "unexpected pwd: {text:?}"
    );
    assert!(text.trim_end().ends_with('1'));
    reap(&mut session);
}

#[test]
fn resize_updates_every_master() {
    let mut session = spawn(sh("sleep 2"), true);
    assert_eq!(session.window_size(), Some(WindowSize::from_cells(100, 30)));
    let size = WindowSize::from_cells(132, 43);
    session.set_window_size(size).expect("resize");
    assert_eq!(session.window_size(), Some(size));
    session.hangup();
    let status = reap(&mut session);
    assert_eq!(status.signal(), Some(libc::SIGHUP));
}

#[test]
fn input_written_to_master_reaches_child() {
    let mut session = spawn(sh("read line; printf \"got:%s\" \"$line\""), false);
    session.write_input(b"hello\r").expect("write input");
    let (out, _) = drain(&mut session);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("got:hello"), "unexpected output: {text:?}");
    reap(&mut session);
}

#[test]
fn state_transitions_never_move_backwards() {
    let (read_fd, write_fd) = pipe_pair();
    let mut session = Session::from_parts(read_fd, -1, -1);
    assert_eq!(session.state(), SessionState::Running);
    assert!(!session.transition(SessionState::Created));
    assert!(session.transition(SessionState::ChildExited));
    assert!(!session.transition(SessionState::PtyClosed));
    assert!(!session.transition(SessionState::Running));
    assert!(session.transition(SessionState::Terminated));
    assert!(!session.transition(SessionState::ChildExited));
    assert_eq!(session.state(), SessionState::Terminated);
    close_fd(write_fd);
}

#[test]
fn closing_output_stream_closes_pty() {
    let (read_fd, write_fd) = pipe_pair();
    let (err_read, err_write) = pipe_pair();
    let mut session = Session::from_parts(read_fd, err_read, -1);
    assert_eq!(session.open_streams().len(), 2);
    session.close_stream(PtyStream::Output);
    assert!(!session.has_open_pty());
    assert!(session.open_streams().is_empty());
    assert_eq!(session.state(), SessionState::PtyClosed);
    close_fd(write_fd);
    close_fd(err_write);
}

#[test]
fn read_chunk_reports_eof_as_closed() {
    let (read_fd, write_fd) = pipe_pair();
    close_fd(write_fd);
    let mut buf = [0u8; 16];
    assert!(matches!(read_chunk(read_fd, &mut buf, 280), ReadOutcome::Closed(None)));
    close_fd(read_fd);
}

#[test]
fn read_chunk_retries_when_nothing_is_buffered() {
    let (read_fd, write_fd) = pipe_pair();
    set_nonblocking(read_fd).expect("nonblocking");
    let mut buf = [0u8; 16];
    assert!(matches!(read_chunk(read_fd, &mut buf, 280), ReadOutcome::Retry));
    close_fd(read_fd);
    close_fd(write_fd);
}

#[test]
fn should_retry_read_error_matches_transient_kinds() {
    assert!(should_retry_read_error(&io::Error::from(ErrorKind::Interrupted)));
    assert!(should_retry_read_error(&io::Error::from(ErrorKind::WouldBlock)));
    assert!(!should_retry_read_error(&io::Error::from_raw_os_error(libc::EIO)));
}

#[test]
fn write_all_delivers_payload_larger_than_pipe_buffer() {
    let (read_fd, write_fd) = pipe_pair();
    set_nonblocking(write_fd).expect("nonblocking");
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let reader = thread::spawn(move || {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        close_fd(read_fd);
        out
    });
    write_all(write_fd, &payload).expect("write_all");
    close_fd(write_fd);
    let received = reader.join().expect("reader thread");
    assert_eq!(received, expected);
}

#[test]
fn write_all_surfaces_broken_pipe() {
    let (read_fd, write_fd) = pipe_pair();
    close_fd(read_fd);
    let err = write_all(write_fd, b"data").expect_err("reader is gone");
    assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    close_fd(write_fd);
}

#[test]
fn wait_readable_flags_only_ready_descriptors() {
    let (idle_read, idle_write) = pipe_pair();
    let (busy_read, busy_write) = pipe_pair();
    write_all(busy_write, b"x").expect("write");
    let ready = wait_readable(&[idle_read, busy_read], Duration::from_millis(100)).expect("poll");
    assert_eq!(ready, vec![false, true]);
    for fd in [idle_read, idle_write, busy_read, busy_write] {
        close_fd(fd);
    }
}

#[test]
fn exec_report_parsing() {
    assert_eq!(parse_exec_report(b""), None);
    assert_eq!(parse_exec_report(b"R"), None);
    let mut report = vec![b'R', b'E'];
    report.extend_from_slice(&libc::EACCES.to_ne_bytes());
    assert_eq!(parse_exec_report(&report), Some(libc::EACCES));
    assert_eq!(parse_exec_report(b"RE\x01"), None);
}

#[test]
fn format_decimal_handles_sign_and_zero() {
    let mut buf = [0u8; 16];
    let len = format_decimal(0, &mut buf);
    assert_eq!(&buf[..len], b"0");
    let len = format_decimal(-13, &mut buf);
    assert_eq!(&buf[..len], b"-13");
    let len = format_decimal(i32::MIN, &mut buf);
    assert_eq!(&buf[..len], b"-2147483648");
}

#[test]
fn child_env_overrides_replace_inherited_values() {
    let mut command = sh("true");
    command.term = "screen".to_string();
    command.force_shlvl = true;
    command.working_dir = Some(std::env::temp_dir());
    let env = build_child_env(&command);
    let entries: Vec<String> = env
        .iter()
        .map(|entry| entry.to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries.iter().filter(|e| e.starts_with("TERM=")).count(), 1);
    assert!(entries.contains(&"TERM=screen".to_string()));
    assert!(entries.contains(&"SHLVL=1".to_string()));
    assert!(entries.contains(&format!("{DIRECTORY_INVOKING_VAR}=1")));
}

#[test]
fn default_shell_is_interactive_login() {
    let argv = default_shell_argv();
    assert_eq!(argv.len(), 3);
    assert_eq!(&argv[1..], ["-l", "-i"]);
}

#[test]
fn cloexec_pipe_marks_both_ends() {
    let (read_fd, write_fd) = cloexec_pipe().expect("cloexec pipe");
    for fd in [read_fd, write_fd] {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert!(flags >= 0);
        assert_ne!(flags & libc::FD_CLOEXEC, 0, "fd {fd} lacks FD_CLOEXEC");
    }
    close_fd(read_fd);
    close_fd(write_fd);
}

#[test]
fn concurrent_spawns_report_exec_outcome_promptly() {
    let workers: Vec<_> = (0..6)
        .map(|_| {
            thread::spawn(|| {
                let started = Instant::now();
                let mut session = spawn(sh("exit 0"), false);
                let released_after = started.elapsed();
                let status = reap(&mut session);
                (released_after, status.code())
            })
        })
        .collect();
    for worker in workers {
        let (released_after, code) = worker.join().expect("spawn worker");
        assert_eq!(code, Some(0));
        // A leaked status pipe would hold the exec report open for seconds.
        assert!(
            released_after < Duration::from_secs(2),
            "release took {released_after:?}"
        );
    }
}
