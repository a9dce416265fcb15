//! Transcript capture and tailing.
//!
//! One background thread copies the console character device into an
//! append-only transcript file. That thread is the file's only writer;
//! any number of `TranscriptTail` readers follow it concurrently. Lines
//! are never removed or reordered once appended, which is what makes the
//! START/END bracketing protocol deterministic.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::error::ConsoleError;

/// How often tailing readers poll for new bytes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Background copier from the console device into the transcript file.
pub struct TranscriptWriter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TranscriptWriter {
    /// Start copying `device` into `transcript`. The transcript is created
    /// (truncated) so a stale file from a previous session never pollutes
    /// marker matching.
    pub fn spawn(device: &Path, transcript: &Path) -> Result<Self> {
        let mut source = File::open(device)
            .with_context(|| format!("opening console device {}", device.display()))?;
        let mut sink = File::create(transcript)
            .with_context(|| format!("creating transcript {}", transcript.display()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while !stop_flag.load(Ordering::Relaxed) {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if sink.write_all(&buf[..n]).and_then(|_| sink.flush()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the copier to stop. The thread also exits on device EOF/error,
    /// so this is best-effort; join happens on drop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for TranscriptWriter {
    fn drop(&mut self) {
        self.stop();
        // The copier may be parked in a blocking device read; don't join it,
        // it exits when the device hangs up at teardown.
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

/// Read-only incremental reader over the transcript file.
///
/// Tracks a byte offset and hands back complete lines as they appear.
/// A trailing partial line stays buffered until its newline arrives.
pub struct TranscriptTail {
    path: PathBuf,
    offset: u64,
    partial: String,
}

impl TranscriptTail {
    /// Tail starting at the current end of the transcript. Lines already
    /// present are skipped - this is how a bridge consumer anchors itself
    /// at "now" before injecting a command.
    pub fn from_end(path: &Path) -> Result<Self, ConsoleError> {
        let offset = std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| ConsoleError::TranscriptUnavailable {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            offset,
            partial: String::new(),
        })
    }

    /// Tail starting at the beginning of the transcript.
    pub fn from_start(path: &Path) -> Self {
        Self::from_offset(path, 0)
    }

    /// Tail starting at a known byte offset (e.g. a snapshot's length).
    pub fn from_offset(path: &Path, offset: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            offset,
            partial: String::new(),
        }
    }

    fn unavailable(&self, e: std::io::Error) -> ConsoleError {
        ConsoleError::TranscriptUnavailable {
            path: self.path.clone(),
            source: e,
        }
    }

    /// Pull all bytes appended since the last call, as lossily decoded text.
    /// Unlike [`read_new_lines`](Self::read_new_lines) this includes a
    /// trailing partial line - prompts sit at EOF without a newline.
    pub fn read_new_text(&mut self) -> Result<String, ConsoleError> {
        let mut file = File::open(&self.path).map_err(|e| self.unavailable(e))?;
        let len = file.metadata().map_err(|e| self.unavailable(e))?.len();
        if len <= self.offset {
            return Ok(String::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| self.unavailable(e))?;
        let mut chunk = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset)
            .read_to_end(&mut chunk)
            .map_err(|e| self.unavailable(e))?;
        self.offset = len;
        Ok(String::from_utf8_lossy(&chunk).into_owned())
    }

    /// Pull any complete lines appended since the last call.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>, ConsoleError> {
        let mut file = File::open(&self.path).map_err(|e| self.unavailable(e))?;
        let len = file.metadata().map_err(|e| self.unavailable(e))?.len();
        if len <= self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| self.unavailable(e))?;
        let mut chunk = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset)
            .read_to_end(&mut chunk)
            .map_err(|e| self.unavailable(e))?;
        self.offset = len;

        self.partial.push_str(&String::from_utf8_lossy(&chunk));

        let mut lines = Vec::new();
        while let Some(nl) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=nl).collect();
            line.truncate(line.trim_end_matches(['\n', '\r']).len());
            lines.push(line);
        }
        Ok(lines)
    }

}

/// Read the whole transcript as it exists right now. Returns the text
/// (lossily decoded; serial streams are not guaranteed UTF-8) and the exact
/// byte length read, usable as a tail anchor.
pub fn snapshot(path: &Path) -> Result<(String, u64), ConsoleError> {
    let bytes = std::fs::read(path).map_err(|e| ConsoleError::TranscriptUnavailable {
        path: path.to_path_buf(),
        source: e,
    })?;
    let len = bytes.len() as u64;
    Ok((String::from_utf8_lossy(&bytes).into_owned(), len))
}

/// Last `n` lines of the transcript, for stall diagnostics.
pub fn last_lines(path: &Path, n: usize) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}

/// Writer side of the console device, shared by the bridge, the interrupt
/// path, and the headless channel. Every write is a full line or a raw
/// byte sequence; the mutex keeps concurrent writers from interleaving
/// partial lines.
#[derive(Clone)]
pub struct ConsoleWriter {
    path: PathBuf,
    file: Arc<std::sync::Mutex<File>>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl ConsoleWriter {
    pub fn open(device: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(device)
            .with_context(|| format!("opening console device {} for writing", device.display()))?;
        Ok(Self {
            path: device.to_path_buf(),
            file: Arc::new(std::sync::Mutex::new(file)),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
        })
    }

    pub fn device_path(&self) -> &Path {
        &self.path
    }

    /// Write one command line (newline appended) with bounded retries.
    pub fn write_line(&self, line: &str) -> Result<(), ConsoleError> {
        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');
        self.write_raw(payload.as_bytes())
    }

    /// Write raw bytes (interrupt byte, bare carriage return) with the same
    /// retry policy as command lines.
    pub fn write_raw(&self, bytes: &[u8]) -> Result<(), ConsoleError> {
        let mut last_err = None;
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                std::thread::sleep(self.retry_backoff);
            }
            let mut file = self.file.lock().expect("console writer poisoned");
            match file.write_all(bytes).and_then(|_| file.flush()) {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(ConsoleError::WriteFailure {
            attempts: self.retry_attempts,
            source: last_err.unwrap_or_else(|| std::io::Error::other("no write attempted")),
        })
    }

    /// Forward an interrupt to the guest, out-of-band from any command.
    pub fn send_interrupt(&self) -> Result<(), ConsoleError> {
        self.write_raw(&[0x03])
    }

    /// Bare carriage return - the readiness detector's prompt nudge.
    pub fn send_return(&self) -> Result<(), ConsoleError> {
        self.write_raw(b"\r")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_only_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut tail = TranscriptTail::from_end(&path).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "first\nsecond\npart").unwrap();

        let lines = tail.read_new_lines().unwrap();
        assert_eq!(lines, vec!["first".to_string(), "second".to_string()]);

        // Partial line held back until its newline lands.
        assert!(tail.read_new_lines().unwrap().is_empty());
        writeln!(f, "ial").unwrap();
        assert_eq!(tail.read_new_lines().unwrap(), vec!["partial".to_string()]);
    }

    #[test]
    fn tail_from_end_skips_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        std::fs::write(&path, "history\nmore history\n").unwrap();

        let mut tail = TranscriptTail::from_end(&path).unwrap();
        assert!(tail.read_new_lines().unwrap().is_empty());
    }

    #[test]
    fn crlf_line_endings_are_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        std::fs::write(&path, "").unwrap();

        let mut tail = TranscriptTail::from_start(&path);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "serial line\r\n").unwrap();

        assert_eq!(tail.read_new_lines().unwrap(), vec!["serial line".to_string()]);
    }

    #[test]
    fn raw_text_includes_unterminated_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        std::fs::write(&path, "").unwrap();

        let mut tail = TranscriptTail::from_start(&path);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "guest login: ").unwrap();

        assert_eq!(tail.read_new_text().unwrap(), "guest login: ");
        // Nothing new since.
        assert_eq!(tail.read_new_text().unwrap(), "");
    }

    #[test]
    fn writer_appends_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device");
        std::fs::write(&path, "").unwrap();

        let writer = ConsoleWriter::open(&path).unwrap();
        writer.write_line("echo hi").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "echo hi\n");
    }
}
