//! The single-threaded reactor pumping bytes between the PTY and the console.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connector::ConsoleSink;
use crate::error::BridgeError;
use crate::input::{
    AppliedResize, ConsoleEvent, InputBatcher, InputPoll, InputSource, ResizePropagator, Viewport,
};
use crate::lifecycle::{PendingSignal, SignalQueue};
use crate::pty_session::{wait_readable, PtyStream, ReadOutcome, Session};
use crate::transcript::Transcript;

/// Largest single read from a PTY master.
pub const OUTPUT_BUFFER_SIZE: usize = 4096;
/// Reads keep going until roughly this many bytes are assembled.
pub const PREFERRED_CHUNK: usize = 280;
/// Readiness wait per iteration; bounds how stale the child liveness check gets.
pub const READINESS_TIMEOUT: Duration = Duration::from_millis(10);
/// Budget for draining queued console input per iteration.
pub const INPUT_SLICE: Duration = Duration::from_millis(10);

/// Why [`EventLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The PTY drained and the child was reaped.
    Finished(Option<ExitStatus>),
    /// A terminate/quit signal arrived.
    Terminated(i32),
    /// The host console went away.
    ConsoleClosed,
}

pub struct EventLoop<'a> {
    console: &'a mut dyn ConsoleSink,
    input: &'a mut dyn InputSource,
    signals: &'a dyn SignalQueue,
    resize: ResizePropagator<Box<dyn Viewport>>,
    batcher: InputBatcher,
    transcript: Option<Transcript>,
    verbose: bool,
    input_ended: bool,
}

impl<'a> EventLoop<'a> {
    pub fn new(
        console: &'a mut dyn ConsoleSink,
        input: &'a mut dyn InputSource,
        signals: &'a dyn SignalQueue,
        viewport: Box<dyn Viewport>,
    ) -> Self {
        Self {
            console,
            input,
            signals,
            resize: ResizePropagator::new(viewport),
            batcher: InputBatcher::new(),
            transcript: None,
            verbose: false,
            input_ended: false,
        }
    }

    pub fn with_transcript(mut self, transcript: Option<Transcript>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Pump until the PTY and the child are both gone, a terminate signal
    /// arrives, or the console disappears.
    ///
    /// Only a failing console sink is an error; PTY trouble just closes the
    /// affected master.
    pub fn run(&mut self, session: &mut Session) -> Result<LoopExit, BridgeError> {
        let mut buf = vec![0u8; OUTPUT_BUFFER_SIZE];
        let mut events = Vec::new();
        let mut pending = Vec::new();
        info!(pid = session.pid(), duplex = session.is_duplex(), "event loop started");

        loop {
            self.signals.take_pending(&mut pending);
            for signal in pending.drain(..) {
                match signal {
                    PendingSignal::Interrupt => self.forward_interrupt(session),
                    PendingSignal::WindowChange => self.apply_resize(session, (0, 0)),
                    PendingSignal::Terminate(sig) => {
                        info!(sig, "terminate signal received");
                        return Ok(LoopExit::Terminated(sig));
                    }
                }
            }

            if !session.has_open_pty() && (!session.child_alive() || session.try_wait().is_some()) {
                let status = session.exit_status();
                info!(?status, "pty drained and child gone");
                return Ok(LoopExit::Finished(status));
            }

            let streams = session.open_streams();
            let fds: Vec<_> = streams.iter().map(|(_, fd)| *fd).collect();
            let ready = wait_readable(&fds, READINESS_TIMEOUT).unwrap_or_else(|err| {
                warn!("readiness wait failed: {err}");
                vec![false; fds.len()]
            });
            for ((stream, _), is_ready) in streams.into_iter().zip(ready) {
                if is_ready {
                    self.pump_output(session, stream, &mut buf)?;
                }
            }

            if self.input_ended {
                continue;
            }
            match self.drain_input(session, &mut events) {
                InputPoll::Closed => {
                    info!("host console closed");
                    return Ok(LoopExit::ConsoleClosed);
                }
                InputPoll::Ended => {
                    info!("host input ended, draining child output");
                    self.input.stop();
                    self.input_ended = true;
                }
                _ => {}
            }
        }
    }

    fn pump_output(
        &mut self,
        session: &mut Session,
        stream: PtyStream,
        buf: &mut [u8],
    ) -> Result<(), BridgeError> {
        match session.read_stream(stream, buf, PREFERRED_CHUNK) {
            ReadOutcome::Data(n) => {
                let chunk = &buf[..n];
                if let Some(transcript) = self.transcript.as_mut() {
                    transcript.record_output(chunk);
                }
                self.console
                    .write_stream(stream, chunk)
                    .map_err(BridgeError::ConsoleIo)
            }
            ReadOutcome::Retry => Ok(()),
            ReadOutcome::Closed(err) => {
                match err {
                    Some(err) => debug!(?stream, "pty read ended: {err}"),
                    None => debug!(?stream, "pty reached EOF"),
                }
                session.close_stream(stream);
                Ok(())
            }
        }
    }

    /// Dispatch queued console events for at most [`INPUT_SLICE`], then flush once.
    fn drain_input(&mut self, session: &mut Session, events: &mut Vec<ConsoleEvent>) -> InputPoll {
        let start = Instant::now();
        let mut last = InputPoll::Idle;
        loop {
            events.clear();
            let poll = self.input.poll_events(events);
            for event in events.drain(..) {
                self.dispatch(session, event);
            }
            if poll != InputPoll::Idle {
                last = poll;
            }
            if poll != InputPoll::ReadyMore || start.elapsed() >= INPUT_SLICE {
                break;
            }
        }
        self.flush_input(session);
        last
    }

    fn dispatch(&mut self, session: &mut Session, event: ConsoleEvent) {
        match event {
            ConsoleEvent::Key { is_down: false, .. } => {}
            ConsoleEvent::Key { ch, is_down: true } => {
                let mut utf8 = [0u8; 4];
                self.forward_keys(session, ch.encode_utf8(&mut utf8).as_bytes());
            }
            ConsoleEvent::Bytes(bytes) => self.forward_keys(session, &bytes),
            ConsoleEvent::Resize { columns, rows } => self.apply_resize(session, (columns, rows)),
        }
    }

    fn forward_keys(&mut self, session: &mut Session, bytes: &[u8]) {
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.record_input(bytes);
        }
        if let Err(err) = self.batcher.append(session, bytes) {
            warn!("keystroke dropped: {err}");
        }
    }

    fn flush_input(&mut self, session: &mut Session) {
        let result = self.batcher.flush(session);
        if let Some(transcript) = self.transcript.as_mut() {
            if !matches!(result, Ok(0)) {
                transcript.record_flush(&result);
            }
        }
        if let Err(err) = result {
            warn!("input write to pty failed: {err}");
        }
    }

    fn apply_resize(&mut self, session: &mut Session, reported: (u16, u16)) {
        let outcome = self
            .resize
            .on_viewport_changed(reported, &mut self.batcher, session);
        if let (Some(transcript), Some(outcome)) = (self.transcript.as_mut(), outcome) {
            transcript.record_resize(outcome.size, outcome.applied);
        }
        if self.verbose {
            match outcome {
                Some(AppliedResize { size, applied: true }) => self
                    .console
                    .report(&format!("pty resized to ({},{})", size.columns, size.rows)),
                Some(AppliedResize { size, applied: false }) => self.console.report(&format!(
                    "pty resize to ({},{}) failed",
                    size.columns, size.rows
                )),
                None => self.console.report("viewport size unavailable"),
            }
        }
    }

    /// Flush typed input, then write a single interrupt byte.
    fn forward_interrupt(&mut self, session: &mut Session) {
        self.flush_input(session);
        match session.send_interrupt() {
            Ok(()) => debug!("interrupt forwarded to child"),
            Err(err) => warn!("failed to forward interrupt: {err}"),
        }
    }
}
