use std::io;

use tracing::debug;

use crate::pty_session::PtyInput;

/// Bytes coalesced before a write to the PTY master.
pub const BATCH_CAPACITY: usize = 16;
/// Escape introducer; always begins a fresh write.
pub const ESCAPE_BYTE: u8 = 0x1b;

/// Coalesces keystrokes into fewer PTY writes without splitting escape sequences
/// from the bytes that follow them.
#[derive(Debug, Default)]
pub struct InputBatcher {
    buf: [u8; BATCH_CAPACITY],
    used: usize,
}

impl InputBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Append `bytes`, flushing before an escape byte and whenever the batch fills.
    ///
    /// A failed flush drops that batch; the remaining bytes are still appended and
    /// the first error is returned.
    pub fn append(&mut self, target: &mut dyn PtyInput, bytes: &[u8]) -> io::Result<()> {
        let mut result = Ok(());
        for &byte in bytes {
            if byte == ESCAPE_BYTE && self.used > 0 {
                keep_first_error(&mut result, self.flush(target));
            }
            self.buf[self.used] = byte;
            self.used += 1;
            if self.used == BATCH_CAPACITY {
                keep_first_error(&mut result, self.flush(target));
            }
        }
        result
    }

    /// Write the pending bytes in a single call. Returns how many were written.
    pub fn flush(&mut self, target: &mut dyn PtyInput) -> io::Result<usize> {
        if self.used == 0 {
            return Ok(0);
        }
        let len = self.used;
        self.used = 0;
        match target.write_input(&self.buf[..len]) {
            Ok(()) => Ok(len),
            Err(err) => {
                debug!(len, "dropping input batch: {err}");
                Err(err)
            }
        }
    }
}

fn keep_first_error(result: &mut io::Result<()>, flushed: io::Result<usize>) {
    if let Err(err) = flushed {
        if result.is_ok() {
            *result = Err(err);
        }
    }
}
