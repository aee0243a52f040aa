//! Console input: event model, the two input sources, batching toward the PTY,
//! and resize propagation.

mod batcher;
mod extension;
mod reader;
mod resize;

pub use batcher::{InputBatcher, BATCH_CAPACITY, ESCAPE_BYTE};
pub use extension::{translate_record, ExtensionInputSource};
pub use reader::ThreadInputSource;
pub use resize::{AppliedResize, HostViewport, ReportedViewport, ResizePropagator, Viewport};

/// One host console event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// A Unicode scalar from an extension input record.
    Key { ch: char, is_down: bool },
    /// Raw bytes read from the host terminal, forwarded to the PTY unchanged.
    Bytes(Vec<u8>),
    Resize { columns: u16, rows: u16 },
}

/// Outcome of one [`InputSource::poll_events`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPoll {
    /// Nothing pending.
    Idle,
    /// Events were delivered and the queue is drained.
    Ready,
    /// Events were delivered and more are queued.
    ReadyMore,
    /// The host console went away; the session should be hung up.
    Closed,
    /// Input reached end-of-file but the console is still there (redirected
    /// stdin). Nothing more will arrive; output keeps flowing.
    Ended,
}

/// Where console events come from: the negotiated extension or a reader thread.
pub trait InputSource {
    /// Append pending events to `out` without blocking.
    fn poll_events(&mut self, out: &mut Vec<ConsoleEvent>) -> InputPoll;

    /// Stop producing events. Safe to call more than once.
    fn stop(&mut self);
}
