//! PTY session management: allocate the pseudo-terminal(s), fork the child behind
//! a startup barrier, and expose the masters to the event loop.

mod io;
mod session;
mod spawn;
mod winsize;

#[cfg(test)]
mod tests;

pub(crate) use io::{should_retry_read_error, wait_readable, write_all, ReadOutcome};
pub use session::{PtyInput, PtyStream, Session, SessionState, INTERRUPT_BYTE};
pub use spawn::{default_shell_argv, ChildCommand, PtySpawner, DIRECTORY_INVOKING_VAR};
pub use winsize::{WindowSize, DEFAULT_COLUMNS, DEFAULT_ROWS};

pub(crate) use io::{cloexec_pipe, close_fd};
#[cfg(test)]
pub(crate) use io::set_nonblocking;
