//! Failure classes surfaced by the bridge and the process exit codes they map to.

use std::io;
use thiserror::Error;

/// Extension negotiation failed and no fallback console was allowed.
pub const EXIT_NEGOTIATION_FAILED: i32 = 254;
/// PTY allocation, fork, or the spawn handshake failed.
pub const EXIT_SPAWN_FAILED: i32 = 253;
/// Unknown command-line switch.
pub const EXIT_UNKNOWN_SWITCH: i32 = 255;
/// The child could not exec and had no errno to report.
pub const EXIT_EXEC_FAILED: i32 = 252;
/// The console sink stopped accepting output.
pub const EXIT_CONSOLE_LOST: i32 = 251;
/// A recognised option carried an unusable value.
pub const EXIT_INVALID_CONFIG: i32 = 250;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("console connector negotiation failed: {0}")]
    Negotiation(String),

    #[error("{context} failed: {source}")]
    Spawn {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("spawn handshake failed: {0}")]
    Handshake(String),

    #[error("console output failed: {0}")]
    ConsoleIo(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Build a spawn error from the current `errno`.
    pub fn spawn_errno(context: &'static str) -> Self {
        BridgeError::Spawn {
            context,
            source: io::Error::last_os_error(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Negotiation(_) => EXIT_NEGOTIATION_FAILED,
            BridgeError::Spawn { .. } | BridgeError::Handshake(_) => EXIT_SPAWN_FAILED,
            BridgeError::ConsoleIo(_) => EXIT_CONSOLE_LOST,
            BridgeError::Config(_) => EXIT_INVALID_CONFIG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let negotiation = BridgeError::Negotiation("module missing".into());
        let spawn = BridgeError::Spawn {
            context: "openpty",
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        let console = BridgeError::ConsoleIo(io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(negotiation.exit_code(), EXIT_NEGOTIATION_FAILED);
        assert_eq!(spawn.exit_code(), EXIT_SPAWN_FAILED);
        assert_eq!(console.exit_code(), EXIT_CONSOLE_LOST);
        assert_ne!(spawn.exit_code(), negotiation.exit_code());
        let config = BridgeError::Config("empty child command".into());
        assert_eq!(config.exit_code(), EXIT_INVALID_CONFIG);
        assert_ne!(config.exit_code(), EXIT_UNKNOWN_SWITCH);
    }

    #[test]
    fn spawn_error_mentions_context() {
        let err = BridgeError::Spawn {
            context: "fork",
            source: io::Error::from_raw_os_error(libc::EAGAIN),
        };
        assert!(err.to_string().starts_with("fork failed"));
    }
}
