//! Pseudo-terminal session bridge: spawns a command on a PTY and pumps bytes
//! between it and the host console, optionally through a negotiated console
//! extension.

pub mod config;
pub mod connector;
pub mod diagnostics;
pub mod error;
pub mod event_loop;
pub mod input;
pub mod lifecycle;
pub mod pty_session;
pub mod terminal_restore;
mod telemetry;
pub mod transcript;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use event_loop::{EventLoop, LoopExit};
pub use lifecycle::LifecycleManager;
pub use pty_session::{PtySpawner, Session, SessionState, WindowSize};
pub use telemetry::init_tracing;
