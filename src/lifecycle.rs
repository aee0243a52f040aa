//! Signal handling and orderly teardown.
//!
//! Handlers only record what arrived in atomics; the reactor picks the flags up
//! through [`SignalQueue`] and does the actual work on the main thread.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::connector::ConsoleConnector;
use crate::input::InputSource;
use crate::pty_session::Session;
use crate::terminal_restore::restore_terminal;

static PENDING_INTERRUPTS: AtomicUsize = AtomicUsize::new(0);
static PENDING_TERMINATE: AtomicI32 = AtomicI32::new(0);
static WINDOW_CHANGED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_interrupt(_: libc::c_int) {
    PENDING_INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn handle_terminate(sig: libc::c_int) {
    PENDING_TERMINATE.store(sig, Ordering::SeqCst);
}

extern "C" fn handle_window_change(_: libc::c_int) {
    WINDOW_CHANGED.store(true, Ordering::SeqCst);
}

/// A signal observation waiting for the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSignal {
    /// Forward one interrupt byte to the child.
    Interrupt,
    /// The host terminal changed size.
    WindowChange,
    /// Tear down and re-raise this signal.
    Terminate(i32),
}

/// Source of signal observations for the event loop.
pub trait SignalQueue {
    /// Move every pending observation into `out`, interrupts first.
    fn take_pending(&self, out: &mut Vec<PendingSignal>);
}

/// The process-wide flags written by the installed handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSignals;

impl SignalQueue for ProcessSignals {
    fn take_pending(&self, out: &mut Vec<PendingSignal>) {
        let interrupts = PENDING_INTERRUPTS.swap(0, Ordering::SeqCst);
        out.extend(std::iter::repeat(PendingSignal::Interrupt).take(interrupts));
        if WINDOW_CHANGED.swap(false, Ordering::SeqCst) {
            out.push(PendingSignal::WindowChange);
        }
        let sig = PENDING_TERMINATE.swap(0, Ordering::SeqCst);
        if sig != 0 {
            out.push(PendingSignal::Terminate(sig));
        }
    }
}

fn install(sig: libc::c_int, handler: libc::sighandler_t, name: &str) -> Result<()> {
    // SAFETY: handlers only touch atomics, which is async-signal-safe.
    if unsafe { libc::signal(sig, handler) } == libc::SIG_ERR {
        return Err(anyhow!("failed to install {name} handler"));
    }
    Ok(())
}

/// Install the bridge's handlers.
///
/// SIGINT is forwarded to the child instead of killing the bridge, SIGHUP is
/// ignored so losing our own terminal does not tear us down mid-cleanup, and
/// SIGTERM/SIGQUIT request an orderly terminate.
pub fn install_handlers() -> Result<()> {
    install(
        libc::SIGINT,
        handle_interrupt as *const () as libc::sighandler_t,
        "SIGINT",
    )?;
    install(
        libc::SIGTERM,
        handle_terminate as *const () as libc::sighandler_t,
        "SIGTERM",
    )?;
    install(
        libc::SIGQUIT,
        handle_terminate as *const () as libc::sighandler_t,
        "SIGQUIT",
    )?;
    install(
        libc::SIGWINCH,
        handle_window_change as *const () as libc::sighandler_t,
        "SIGWINCH",
    )?;
    install(libc::SIGHUP, libc::SIG_IGN, "SIGHUP")?;
    debug!("signal handlers installed");
    Ok(())
}

/// Put `sig` back to its default action.
pub fn restore_default_disposition(sig: i32) {
    // SAFETY: resetting a disposition to SIG_DFL is always valid.
    if unsafe { libc::signal(sig, libc::SIG_DFL) } == libc::SIG_ERR {
        warn!(sig, "failed to restore default disposition");
    }
}

/// Deliver `sig` to ourselves with its default action in place.
///
/// Falls back to exiting with `128 + sig` if the signal does not terminate us.
pub fn reraise(sig: i32) -> ! {
    restore_terminal();
    restore_default_disposition(sig);
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: mask is a valid sigset_t; unblocking `sig` lets raise() take effect.
    unsafe {
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, sig);
        libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut());
        libc::raise(sig);
    }
    thread::sleep(Duration::from_millis(100));
    std::process::exit(128 + sig);
}

/// Drives shutdown once the reactor has stopped.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    shut_down: bool,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Stop the input source, then the connector. Idempotent.
    ///
    /// Input goes first so no reader is still using the binding when the
    /// extension is told to stop.
    pub fn shutdown(&mut self, input: &mut dyn InputSource, connector: &mut ConsoleConnector) {
        if self.shut_down {
            return;
        }
        input.stop();
        connector.stop();
        self.shut_down = true;
        info!("bridge shut down");
    }

    /// Normal end of a session: the child is reaped and the PTY drained.
    /// Shuts down and moves the session to its final state.
    pub fn finish(
        &mut self,
        session: &mut Session,
        input: &mut dyn InputSource,
        connector: &mut ConsoleConnector,
    ) {
        self.shutdown(input, connector);
        session.mark_terminated();
        debug!(pid = session.pid(), "session finished");
    }

    /// Hang up the child's process group, shut down, and restore `sig` to its
    /// default action. The caller re-raises with [`reraise`].
    pub fn terminate(
        &mut self,
        sig: i32,
        session: &mut Session,
        input: &mut dyn InputSource,
        connector: &mut ConsoleConnector,
    ) {
        info!(sig, pid = session.pid(), "terminating session");
        session.hangup();
        self.shutdown(input, connector);
        session.mark_terminated();
        restore_default_disposition(sig);
    }
}
