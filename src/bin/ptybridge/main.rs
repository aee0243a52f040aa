//! ptybridge entrypoint: negotiate the console, spawn the child on a PTY, pump
//! until it is gone, and exit with its status.
//!
//! # Startup order
//!
//! - Signal handlers, so nothing arriving during setup is lost
//! - Console extension negotiation (falls back to this process's own terminal)
//! - PTY + child creation; the child waits until we release it
//! - Event loop, then shutdown or terminate + re-raise

use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{self, ExitStatus};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ptybridge::config::parse_error_exit_code;
use ptybridge::connector::{ConsoleConnector, ConsoleSink, DirectConsole, ExtensionConsole};
use ptybridge::diagnostics::{run_key_dump, tty_name, write_environ, write_isatty};
use ptybridge::error::{BridgeError, EXIT_INVALID_CONFIG};
use ptybridge::input::{
    ExtensionInputSource, HostViewport, InputSource, ReportedViewport, ResizePropagator,
    ThreadInputSource, Viewport,
};
use ptybridge::lifecycle::{install_handlers, reraise, LifecycleManager, ProcessSignals};
use ptybridge::terminal_restore::TerminalRestoreGuard;
use ptybridge::transcript::Transcript;
use ptybridge::{init_tracing, BridgeConfig, EventLoop, LoopExit, PtySpawner};

/// Exit code when a non-bridge failure (I/O on our own stdout, etc.) aborts startup.
const EXIT_GENERIC_FAILURE: i32 = 1;

fn main() {
    let mut config = match BridgeConfig::try_parse() {
        Ok(config) => config,
        Err(err) => {
            let _ = err.print();
            process::exit(parse_error_exit_code(err.kind()));
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("ptybridge: {err:#}");
        process::exit(EXIT_INVALID_CONFIG);
    }
    init_tracing(&config);

    let code = match run(&config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ptybridge: {err:#}");
            err.downcast_ref::<BridgeError>()
                .map_or(EXIT_GENERIC_FAILURE, BridgeError::exit_code)
        }
    };
    process::exit(code);
}

fn run(config: &BridgeConfig) -> Result<i32> {
    if config.isatty {
        let all_tty = write_isatty(&mut io::stdout().lock())?;
        return Ok(if all_tty { 0 } else { 1 });
    }

    let guard = TerminalRestoreGuard::new();
    if config.keys {
        run_key_dump(&guard)?;
        return Ok(0);
    }

    install_handlers()?;
    if config.environ {
        write_environ(&mut io::stdout().lock())?;
    }

    let mut connector = ConsoleConnector::default();
    let binding = connector.negotiate(&config.connector_options(tty_name(libc::STDOUT_FILENO)))?;
    let mut console: Box<dyn ConsoleSink> = match binding {
        Some(binding) => Box::new(ExtensionConsole::new(binding)),
        None => Box::new(DirectConsole::new()),
    };
    if config.verbose {
        if let Some(reason) = connector.last_error() {
            console.report(&format!("console extension unavailable: {reason}"));
        }
    }

    let viewport: Box<dyn Viewport> = match binding {
        Some(_) => Box::new(ReportedViewport),
        None => Box::new(HostViewport),
    };
    let window = ResizePropagator::new(HostViewport)
        .current((0, 0))
        .unwrap_or_default();

    let spawner = PtySpawner::new(config.child_command());
    let mut session = spawner.create_session(window, config.split_stderr)?;

    let mut input: Box<dyn InputSource> = match binding {
        Some(binding) => Box::new(ExtensionInputSource::new(binding)),
        None => {
            // SAFETY: isatty only inspects the descriptor.
            if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
                if let Err(err) = guard.enable_raw_mode() {
                    warn!("raw mode unavailable: {err}");
                }
            }
            Box::new(ThreadInputSource::spawn().context("failed to start input reader")?)
        }
    };

    let transcript = match &config.log_dir {
        Some(dir) => match Transcript::create(dir, &config.command_line()) {
            Ok(transcript) => Some(transcript),
            Err(err) => {
                warn!("transcripts disabled: {err}");
                None
            }
        },
        None => None,
    };

    session.release()?;
    if config.verbose {
        console.report(&format!(
            "executing `{}` (pid={}, pty={})",
            config.command_line(),
            session.pid(),
            session.pty_name().unwrap_or("?")
        ));
    }

    let outcome = EventLoop::new(console.as_mut(), input.as_mut(), &ProcessSignals, viewport)
        .with_transcript(transcript)
        .verbose(config.verbose)
        .run(&mut session);

    let mut lifecycle = LifecycleManager::new();
    match outcome {
        Ok(LoopExit::Finished(status)) => {
            lifecycle.finish(&mut session, input.as_mut(), &mut connector);
            let code = child_exit_code(status);
            if config.verbose {
                console.report(&format!("child finished, exit code {code}"));
            }
            info!(code, "bridge exiting");
            Ok(code)
        }
        Ok(LoopExit::Terminated(sig)) => {
            lifecycle.terminate(sig, &mut session, input.as_mut(), &mut connector);
            drop(session);
            guard.restore();
            reraise(sig)
        }
        Ok(LoopExit::ConsoleClosed) => {
            lifecycle.terminate(libc::SIGHUP, &mut session, input.as_mut(), &mut connector);
            drop(session);
            guard.restore();
            reraise(libc::SIGHUP)
        }
        Err(err) => {
            session.hangup();
            lifecycle.shutdown(input.as_mut(), &mut connector);
            guard.restore();
            let _ = io::stderr().flush();
            Err(err.into())
        }
    }
}

/// The child's exit code, or `128 + signal` when it was killed.
fn child_exit_code(status: Option<ExitStatus>) -> i32 {
    match status {
        Some(status) => status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(0),
        None => 0,
    }
}
