//! Command-line parsing and validation helpers.

mod defaults;
mod validation;

use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;

use crate::connector::ConnectorOptions;
use crate::error::{EXIT_INVALID_CONFIG, EXIT_UNKNOWN_SWITCH};
use crate::pty_session::{default_shell_argv, ChildCommand};
use defaults::{default_term, DEFAULT_SHELL_MARKER};

/// CLI options for the bridge. Validated values are safe to hand to the child.
#[derive(Debug, Parser, Clone)]
#[command(
    name = "ptybridge",
    about = "Run a shell inside a pseudo-terminal and bridge it to this console",
    author,
    version
)]
pub struct BridgeConfig {
    /// TERM value exported to the child
    #[arg(short = 't', long = "term", value_name = "TERM", default_value_t = default_term())]
    pub term: String,

    /// Start the child in DIR (sets CHERE_INVOKING=1)
    #[arg(short = 'd', long = "dir", value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Write transcripts and the trace log into DIR (default: current directory)
    #[arg(
        short = 'l',
        long = "log",
        value_name = "DIR",
        num_args = 0..=1,
        default_missing_value = "."
    )]
    pub log_dir: Option<PathBuf>,

    /// Force SHLVL=1 in the child environment
    #[arg(long = "shlvl", default_value_t = false)]
    pub shlvl: bool,

    /// Report bridge activity on the console error stream
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    pub verbose: bool,

    /// Give the child's stderr its own pseudo-terminal
    #[arg(long = "split-stderr", default_value_t = false)]
    pub split_stderr: bool,

    /// Directory searched for the console extension before the default paths
    #[arg(long = "connector-dir", env = "PTYBRIDGE_CONNECTOR_DIR", value_name = "DIR")]
    pub connector_dir: Option<PathBuf>,

    /// Fail instead of falling back when the console extension is unavailable
    #[arg(long = "require-connector", default_value_t = false)]
    pub require_connector: bool,

    /// Mount-prefix hint forwarded to the console extension
    #[arg(long = "mount-prefix", value_name = "PREFIX")]
    pub mount_prefix: Option<String>,

    /// Print the environment before launching the child
    #[arg(long = "environ", default_value_t = false)]
    pub environ: bool,

    /// Print terminal diagnostics for stdin/stdout/stderr and exit
    #[arg(long = "isatty", default_value_t = false, conflicts_with = "keys")]
    pub isatty: bool,

    /// Dump raw key codes until Ctrl+C and exit
    #[arg(long = "keys", default_value_t = false)]
    pub keys: bool,

    /// Command to run instead of the login shell ("-" selects the login shell)
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl BridgeConfig {
    /// Argument vector for the child; the login shell unless a command was given.
    pub fn child_argv(&self) -> Vec<String> {
        match self.command.first() {
            None => default_shell_argv(),
            Some(first) if first == DEFAULT_SHELL_MARKER => default_shell_argv(),
            Some(_) => self.command.clone(),
        }
    }

    pub fn child_command(&self) -> ChildCommand {
        ChildCommand {
            argv: self.child_argv(),
            working_dir: self.dir.clone(),
            term: self.term.clone(),
            force_shlvl: self.shlvl,
        }
    }

    /// Shell-quoted child command line, as written to transcripts and logs.
    pub fn command_line(&self) -> String {
        shell_words::join(self.child_argv())
    }

    pub fn connector_options(&self, tty_name: Option<String>) -> ConnectorOptions {
        ConnectorOptions {
            base_dir: self.connector_dir.clone(),
            verbose: self.verbose,
            tty_name,
            term: self.term.clone(),
            mount_prefix: self.mount_prefix.clone(),
            required: self.require_connector,
        }
    }
}

/// Process exit code for a command line clap refused to parse.
///
/// Help and version output are successes; an unrecognised switch keeps its
/// own code; every other usage problem counts as invalid configuration.
pub fn parse_error_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        ErrorKind::UnknownArgument => EXIT_UNKNOWN_SWITCH,
        _ => EXIT_INVALID_CONFIG,
    }
}
