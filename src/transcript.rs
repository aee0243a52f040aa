//! Optional input/output transcripts written next to the trace log.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::pty_session::WindowSize;

/// Minimum spacing between timestamp markers in the output log.
const STAMP_INTERVAL: Duration = Duration::from_millis(500);
const HEADER_RULE: &str = "----------";

/// Paths used for one process's transcripts.
pub fn transcript_paths(dir: &Path, pid: u32) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("ptybridge-{pid}-in.log")),
        dir.join(format!("ptybridge-{pid}-out.log")),
    )
}

#[derive(Debug)]
pub struct Transcript {
    input: File,
    output: File,
    last_stamp: Option<Instant>,
    failed: bool,
}

impl Transcript {
    /// Create both logs for this process and write the command-line header.
    pub fn create(dir: &Path, command_line: &str) -> io::Result<Self> {
        Self::create_for_pid(dir, std::process::id(), command_line)
    }

    pub fn create_for_pid(dir: &Path, pid: u32, command_line: &str) -> io::Result<Self> {
        let (input_path, output_path) = transcript_paths(dir, pid);
        let mut transcript = Self {
            input: open_log(&input_path)?,
            output: open_log(&output_path)?,
            last_stamp: None,
            failed: false,
        };
        let header = format!("{command_line}\n{HEADER_RULE}\n");
        transcript.input.write_all(header.as_bytes())?;
        transcript.output.write_all(header.as_bytes())?;
        debug!(input = %input_path.display(), output = %output_path.display(), "transcripts opened");
        Ok(transcript)
    }

    /// Keystroke bytes as they are appended to the input batch.
    pub fn record_input(&mut self, bytes: &[u8]) {
        let line = format!("input: `{}` ", bytes.escape_ascii());
        self.write_input(line.as_bytes());
    }

    /// Result of one batch flush.
    pub fn record_flush(&mut self, result: &io::Result<usize>) {
        let line = match result {
            Ok(written) => format!(" written {written} bytes\n"),
            Err(err) => format!(" write failed: {err}\n"),
        };
        self.write_input(line.as_bytes());
    }

    /// Output chunk, preceded by a timestamp marker when the last one is stale.
    pub fn record_output(&mut self, bytes: &[u8]) {
        self.stamp(false);
        self.write_output(bytes);
    }

    pub fn record_resize(&mut self, size: WindowSize, applied: bool) {
        let outcome = if applied { "succeeded" } else { "failed" };
        let line = format!("input: WindowBufferSize ({},{})\n", size.columns, size.rows);
        self.write_input(line.as_bytes());
        self.stamp(true);
        let marker = format!(
            "\x1b]9;11;\"TIOCSWINSZ({},{}) {outcome}\"\x07\n",
            size.columns, size.rows
        );
        self.write_output(marker.as_bytes());
    }

    fn stamp(&mut self, force: bool) {
        let now = Instant::now();
        let fresh = self
            .last_stamp
            .is_some_and(|last| now.duration_since(last) < STAMP_INTERVAL);
        if fresh && !force {
            return;
        }
        self.last_stamp = Some(now);
        let marker = format!("\x1b]9;11;\"{}\"\x07", clock_stamp(SystemTime::now()));
        self.write_output(marker.as_bytes());
    }

    fn write_input(&mut self, bytes: &[u8]) {
        let result = self.input.write_all(bytes);
        self.note_failure(result);
    }

    fn write_output(&mut self, bytes: &[u8]) {
        let result = self.output.write_all(bytes);
        self.note_failure(result);
    }

    fn note_failure(&mut self, result: io::Result<()>) {
        if let Err(err) = result {
            if !self.failed {
                warn!("transcript write failed: {err}");
                self.failed = true;
            }
        }
    }
}

fn open_log(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

/// `HH:MM:SS.mmm` in UTC.
pub(crate) fn clock_stamp(at: SystemTime) -> String {
    let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    let day_secs = since_epoch.as_secs() % 86_400;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        day_secs / 3600,
        (day_secs / 60) % 60,
        day_secs % 60,
        since_epoch.subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn count_stamps(text: &str) -> usize {
        text.matches("\x1b]9;11;\"").count()
    }

    #[test]
    fn clock_stamp_formats_utc_time_of_day() {
        let at = UNIX_EPOCH + Duration::from_millis(((13 * 3600 + 5 * 60 + 9) * 1000) + 42);
        assert_eq!(clock_stamp(at), "13:05:09.042");
    }

    #[test]
    fn logs_start_with_command_header_and_are_private() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = Transcript::create_for_pid(dir.path(), 77, "bash -l -i").unwrap();
        drop(transcript);
        let (input, output) = transcript_paths(dir.path(), 77);
        let text = fs::read_to_string(&input).unwrap();
        assert_eq!(text, "bash -l -i\n----------\n");
        let mode = fs::metadata(&output).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn output_stamps_are_rate_limited_but_forced_on_resize() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = Transcript::create_for_pid(dir.path(), 78, "sh").unwrap();
        transcript.record_output(b"one");
        transcript.record_output(b"two");
        transcript.record_resize(WindowSize::from_cells(100, 30), true);
        drop(transcript);
        let (_, output) = transcript_paths(dir.path(), 78);
        let text = fs::read_to_string(output).unwrap();
        assert!(text.contains("one") && text.contains("two"));
        assert!(text.contains("TIOCSWINSZ(100,30) succeeded"));
        // First chunk, the forced resize stamp, and the resize marker itself.
        assert_eq!(count_stamps(&text), 3);
    }

    #[test]
    fn input_log_shows_keys_and_flush_results() {
        let dir = tempfile::tempdir().unwrap();
        let mut transcript = Transcript::create_for_pid(dir.path(), 79, "sh").unwrap();
        transcript.record_input(b"\x1b[A");
        transcript.record_flush(&Ok(3));
        drop(transcript);
        let (input, _) = transcript_paths(dir.path(), 79);
        let text = fs::read_to_string(input).unwrap();
        assert!(text.contains("input: `\\x1b[A`  written 3 bytes"), "{text:?}");
    }
}
