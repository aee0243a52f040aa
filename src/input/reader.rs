//! Fallback input source: a background thread reading the host terminal.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TryRecvError};
use tracing::{debug, warn};

use super::{ConsoleEvent, InputPoll, InputSource};
use crate::pty_session::{cloexec_pipe, close_fd, should_retry_read_error, wait_readable};

const EVENT_QUEUE_DEPTH: usize = 256;
/// Upper bound on events handed out per poll so output is not starved.
const EVENTS_PER_POLL: usize = 64;
const READER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// How long `stop` waits for the thread before detaching it.
const STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum ReaderMessage {
    Event(ConsoleEvent),
    /// The terminal itself is gone (EOF or EIO on a tty).
    Closed,
    /// A redirected stdin ran dry.
    Ended,
}

/// Reads raw bytes on a dedicated thread and queues them as byte events.
///
/// The thread never touches the PTY; the reactor drains the queue.
#[derive(Debug)]
pub struct ThreadInputSource {
    rx: Receiver<ReaderMessage>,
    done_rx: Receiver<()>,
    stop_flag: Arc<AtomicBool>,
    wake_fd: RawFd,
    handle: Option<JoinHandle<()>>,
    finished: Option<InputPoll>,
    finish_pending: Option<InputPoll>,
}

impl ThreadInputSource {
    /// Read from the bridge's own stdin.
    pub fn spawn() -> io::Result<Self> {
        Self::spawn_for_fd(libc::STDIN_FILENO)
    }

    pub fn spawn_for_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: isatty only inspects the descriptor.
        let is_terminal = unsafe { libc::isatty(fd) } == 1;
        let (wake_rd, wake_wr) = cloexec_pipe()?;
        let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
        let (done_tx, done_rx) = bounded(1);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop_flag);
        let spawned = thread::Builder::new()
            .name("ptybridge-input".to_string())
            .spawn(move || {
                reader_loop(fd, wake_rd, is_terminal, &tx, &thread_stop);
                close_fd(wake_rd);
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                close_fd(wake_rd);
                close_fd(wake_wr);
                return Err(err);
            }
        };
        debug!(fd, is_terminal, "input reader thread started");
        Ok(Self {
            rx,
            done_rx,
            stop_flag,
            wake_fd: wake_wr,
            handle: Some(handle),
            finished: None,
            finish_pending: None,
        })
    }
}

impl InputSource for ThreadInputSource {
    fn poll_events(&mut self, out: &mut Vec<ConsoleEvent>) -> InputPoll {
        if let Some(finished) = self.finished {
            return finished;
        }
        if let Some(pending) = self.finish_pending.take() {
            self.finished = Some(pending);
            return pending;
        }
        let mut delivered = 0;
        while delivered < EVENTS_PER_POLL {
            match self.rx.try_recv() {
                Ok(ReaderMessage::Event(event)) => {
                    out.push(event);
                    delivered += 1;
                }
                Ok(ReaderMessage::Closed) => {
                    self.finish_pending = Some(InputPoll::Closed);
                    break;
                }
                Ok(ReaderMessage::Ended) => {
                    self.finish_pending = Some(InputPoll::Ended);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.stop_flag.load(Ordering::SeqCst) {
                        self.finish_pending = Some(InputPoll::Ended);
                    }
                    break;
                }
            }
        }
        if delivered == 0 {
            if let Some(pending) = self.finish_pending.take() {
                self.finished = Some(pending);
                return pending;
            }
            return InputPoll::Idle;
        }
        if delivered == EVENTS_PER_POLL && !self.rx.is_empty() {
            InputPoll::ReadyMore
        } else {
            InputPoll::Ready
        }
    }

    /// Signal the thread, wake it, and wait a bounded time before detaching.
    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop_flag.store(true, Ordering::SeqCst);
        let byte = [1u8];
        // SAFETY: wake_fd is the write end of our wake pipe.
        let _ = unsafe { libc::write(self.wake_fd, byte.as_ptr().cast(), 1) };
        match self.done_rx.recv_timeout(STOP_WAIT) {
            Ok(()) => {
                if handle.join().is_err() {
                    warn!("input reader thread panicked");
                }
                debug!("input reader thread joined");
            }
            Err(_) => warn!("input reader thread did not stop in time, detaching"),
        }
        close_fd(self.wake_fd);
        self.wake_fd = -1;
    }
}

impl Drop for ThreadInputSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    fd: RawFd,
    wake_fd: RawFd,
    is_terminal: bool,
    tx: &Sender<ReaderMessage>,
    stop: &AtomicBool,
) {
    // Only a terminal can be "lost"; a pipe or file simply runs out.
    let finish = if is_terminal {
        ReaderMessage::Closed
    } else {
        ReaderMessage::Ended
    };
    let mut buf = [0u8; 1024];
    while !stop.load(Ordering::SeqCst) {
        let ready = match wait_readable(&[fd, wake_fd], READER_POLL_INTERVAL) {
            Ok(ready) => ready,
            Err(err) => {
                warn!("input poll failed: {err}");
                send(tx, finish, stop);
                return;
            }
        };
        if ready.get(1).copied().unwrap_or(false) {
            return;
        }
        if !ready.first().copied().unwrap_or(false) {
            continue;
        }
        // SAFETY: buf is a valid writable buffer.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n == 0 {
            debug!(is_terminal, "host input reached EOF");
            send(tx, finish, stop);
            return;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if should_retry_read_error(&err) {
                continue;
            }
            warn!(is_terminal, "host input read failed: {err}");
            send(tx, finish, stop);
            return;
        }
        let event = ConsoleEvent::Bytes(buf[..n as usize].to_vec());
        if !send(tx, ReaderMessage::Event(event), stop) {
            return;
        }
    }
}

/// Bounded send that gives up once the stop flag is raised.
fn send(tx: &Sender<ReaderMessage>, mut message: ReaderMessage, stop: &AtomicBool) -> bool {
    loop {
        match tx.send_timeout(message, SEND_RETRY_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if stop.load(Ordering::SeqCst) {
                    return false;
                }
                message = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::time::Instant;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn write_bytes(fd: RawFd, payload: &[u8]) {
        assert_eq!(
            unsafe { libc::write(fd, payload.as_ptr().cast(), payload.len()) },
            payload.len() as isize
        );
    }

    fn poll_until(source: &mut ThreadInputSource, want: InputPoll) -> Vec<ConsoleEvent> {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            if source.poll_events(&mut events) == want {
                return events;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("source never reported {want:?}; events so far: {events:?}");
    }

    fn collect_bytes(source: &mut ThreadInputSource, count: usize) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut events = Vec::new();
        let mut bytes = Vec::new();
        while bytes.len() < count && Instant::now() < deadline {
            if source.poll_events(&mut events) == InputPoll::Idle {
                thread::sleep(Duration::from_millis(10));
            }
            for event in events.drain(..) {
                match event {
                    ConsoleEvent::Bytes(chunk) => bytes.extend(chunk),
                    other => panic!("unexpected event {other:?}"),
                }
            }
        }
        bytes
    }

    #[test]
    fn bytes_pass_through_without_decoding() {
        let (read_fd, write_fd) = pipe_pair();
        let mut source = ThreadInputSource::spawn_for_fd(read_fd).unwrap();
        // A lone Latin-1 byte must not be held back or replaced.
        write_bytes(write_fd, b"\xe9");
        assert_eq!(collect_bytes(&mut source, 1), vec![0xe9]);
        write_bytes(write_fd, b"a\xff\x1b[A");
        assert_eq!(collect_bytes(&mut source, 5), b"a\xff\x1b[A".to_vec());
        source.stop();
        close_fd(write_fd);
        close_fd(read_fd);
    }

    #[test]
    fn pipe_eof_ends_input_without_closing_the_console() {
        let (read_fd, write_fd) = pipe_pair();
        let mut source = ThreadInputSource::spawn_for_fd(read_fd).unwrap();
        write_bytes(write_fd, b"abc\n");
        assert_eq!(collect_bytes(&mut source, 4), b"abc\n".to_vec());

        close_fd(write_fd);
        poll_until(&mut source, InputPoll::Ended);
        let mut events = Vec::new();
        assert_eq!(source.poll_events(&mut events), InputPoll::Ended);
        source.stop();
        close_fd(read_fd);
    }

    #[test]
    fn lost_terminal_closes_the_console() {
        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        assert_eq!(rc, 0);
        let mut source = ThreadInputSource::spawn_for_fd(slave).unwrap();
        close_fd(master);
        poll_until(&mut source, InputPoll::Closed);
        source.stop();
        close_fd(slave);
    }

    #[test]
    fn stop_wakes_an_idle_reader_promptly() {
        let (read_fd, write_fd) = pipe_pair();
        let mut source = ThreadInputSource::spawn_for_fd(read_fd).unwrap();
        let started = Instant::now();
        source.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        let mut events = Vec::new();
        assert_eq!(source.poll_events(&mut events), InputPoll::Idle);
        source.stop();
        close_fd(write_fd);
        close_fd(read_fd);
    }
}
