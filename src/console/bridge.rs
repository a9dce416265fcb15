//! Command/response bridge - the marker protocol core.
//!
//! A serial console is a marker-less byte stream with no request/response
//! boundaries. The bridge turns it into one by bracketing each injected
//! command between uniquely tagged START/END lines:
//!
//! ```text
//! { echo __HOST_START__<id>__; sh -c '<cmd>'; __rc=$?; \
//!   echo "__HOST_END__<id>__ EXIT=$__rc"; } 2>&1
//! ```
//!
//! The consumer anchors at the transcript's current tail *before* the write,
//! then runs a two-state machine: drop lines until START appears, capture
//! until END appears, and parse the exit status off the END line. Marker ids
//! mix a microsecond timestamp with a random suffix so neither concurrent
//! invocations nor historical transcript content can collide with them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::ansi::strip_ansi;
use super::error::ConsoleError;
use super::transcript::{ConsoleWriter, TranscriptTail, POLL_INTERVAL};

/// Reported when the END line carries no parseable exit status.
pub const UNKNOWN_EXIT: i32 = -1;

const START_PREFIX: &str = "__HOST_START__";
const END_PREFIX: &str = "__HOST_END__";

/// Microsecond timestamp for marker ids. Falls back to 0 if the clock is
/// unavailable; the random suffix still keeps ids unique.
fn timestamp_micros() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

/// The marker pair bracketing one command invocation.
#[derive(Debug, Clone)]
pub struct CommandMarkers {
    pub id: String,
    pub start: String,
    pub end: String,
}

impl CommandMarkers {
    pub fn generate() -> Self {
        let id = format!("{}_{:04x}", timestamp_micros(), rand::random::<u16>());
        Self {
            start: format!("{START_PREFIX}{id}__"),
            end: format!("{END_PREFIX}{id}__"),
            id,
        }
    }
}

/// Cancellation token threaded into the bridge's blocking wait. Satisfied
/// either by the guest producing END or by the interrupt path flipping it.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the token for the next invocation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Captured result of one bridge invocation.
#[derive(Debug)]
pub struct CommandOutput {
    /// Guest stdout+stderr interleaving between START and END, verbatim.
    pub lines: Vec<String>,
    /// Exit status parsed from the END line, or [`UNKNOWN_EXIT`].
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Single-quote a payload for the guest shell. The user command may itself
/// contain quotes, comments, or the marker alphabet; running it through
/// `sh -c '<quoted>'` keeps the compound line intact regardless.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Build the single compound line injected into the guest shell. The whole
/// group is redirected `2>&1` so markers and output interleave on one
/// stream even if the payload redirects its own stderr.
pub fn compound_command(command: &str, markers: &CommandMarkers) -> String {
    format!(
        "{{ echo {start}; sh -c {payload}; __rc=$?; echo \"{end} EXIT=$__rc\"; }} 2>&1",
        start = markers.start,
        payload = shell_quote(command),
        end = markers.end,
    )
}

enum Consume {
    Seeking,
    Capturing,
}

/// The bridge over one session's console device and transcript.
pub struct Bridge {
    writer: ConsoleWriter,
    transcript: std::path::PathBuf,
    /// The guest shell is a single serial interpreter; overlapping compound
    /// commands would interleave unpredictably inside it. One invocation in
    /// flight per session.
    exec_lock: std::sync::Mutex<()>,
}

impl Bridge {
    pub fn new(writer: ConsoleWriter, transcript: &std::path::Path) -> Self {
        Self {
            writer,
            transcript: transcript.to_path_buf(),
            exec_lock: std::sync::Mutex::new(()),
        }
    }

    pub fn writer(&self) -> &ConsoleWriter {
        &self.writer
    }

    /// Run one command in the guest shell and capture its bracketed output.
    ///
    /// Blocks until END is observed or `cancel` fires; there is no intrinsic
    /// timeout at this layer - callers needing one wrap the call and cancel.
    pub fn run(&self, command: &str, cancel: &CancelToken) -> Result<CommandOutput, ConsoleError> {
        let _in_flight = self.exec_lock.lock().expect("bridge lock poisoned");
        let markers = CommandMarkers::generate();

        // Anchor before writing so the START line cannot slip past us.
        let mut tail = TranscriptTail::from_end(&self.transcript)?;

        self.writer.write_line(&compound_command(command, &markers))?;
        self.consume(&mut tail, &markers, cancel)
    }

    fn consume(
        &self,
        tail: &mut TranscriptTail,
        markers: &CommandMarkers,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ConsoleError> {
        let mut state = Consume::Seeking;
        let mut lines = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(ConsoleError::Cancelled);
            }

            let new_lines = tail.read_new_lines()?;
            if new_lines.is_empty() {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            for line in new_lines {
                let clean = strip_ansi(&line);
                match state {
                    Consume::Seeking => {
                        // Substring containment, not equality: the terminal
                        // may prefix control sequences or echo residue.
                        if clean.contains(&markers.start) {
                            state = Consume::Capturing;
                        }
                    }
                    Consume::Capturing => {
                        if clean.contains(&markers.end) {
                            match parse_exit(&clean) {
                                EndLine::Exit(code) => {
                                    return Ok(CommandOutput { lines, exit_code: code })
                                }
                                // The terminal echo of the typed compound
                                // carries the END text with an unexpanded
                                // $__rc; a wrapped echo fragment is not the
                                // real END line.
                                EndLine::EchoResidue => continue,
                                EndLine::Malformed => {
                                    eprintln!(
                                        "  WARN: END marker without parseable exit code: {}",
                                        clean.trim()
                                    );
                                    return Ok(CommandOutput {
                                        lines,
                                        exit_code: UNKNOWN_EXIT,
                                    });
                                }
                            }
                        }
                        // Late echo of the START marker is protocol residue,
                        // not command output.
                        if clean.contains(&markers.start) {
                            continue;
                        }
                        lines.push(line);
                    }
                }
            }
        }
    }
}

enum EndLine {
    Exit(i32),
    EchoResidue,
    Malformed,
}

/// Parse the `EXIT=<digits>` field off a line containing the END marker.
fn parse_exit(clean: &str) -> EndLine {
    if let Some(pos) = clean.find("EXIT=") {
        let rest = &clean[pos + "EXIT=".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            if let Ok(code) = digits.parse() {
                return EndLine::Exit(code);
            }
        }
        // `EXIT=$__rc` is the echoed command text, not a result.
        if rest.starts_with('$') {
            return EndLine::EchoResidue;
        }
    }
    EndLine::Malformed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_are_unique_across_invocations() {
        let a = CommandMarkers::generate();
        let b = CommandMarkers::generate();
        assert_ne!(a.id, b.id);
        assert_ne!(a.start, b.start);
        assert_ne!(a.end, b.end);
    }

    #[test]
    fn marker_shape() {
        let m = CommandMarkers::generate();
        assert!(m.start.starts_with("__HOST_START__"));
        assert!(m.end.starts_with("__HOST_END__"));
        assert!(m.start.ends_with("__"));
        assert!(m.end.ends_with("__"));
        assert!(m.start.contains(&m.id));
    }

    #[test]
    fn plain_start_end_words_do_not_collide() {
        // Arbitrary guest output containing the bare words must never match
        // a generated marker.
        let m = CommandMarkers::generate();
        let noise = "some START of something, the END of it";
        assert!(!noise.contains(&m.start));
        assert!(!noise.contains(&m.end));
    }

    #[test]
    fn quoting_survives_embedded_single_quotes() {
        assert_eq!(shell_quote("echo 'hi'"), r"'echo '\''hi'\'''");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn compound_is_one_line_and_merges_stderr() {
        let m = CommandMarkers::generate();
        let cmd = compound_command("ls /tmp # inspect", &m);
        assert!(!cmd.contains('\n'));
        assert!(cmd.ends_with("2>&1"));
        assert!(cmd.contains(&m.start));
        assert!(cmd.contains(&m.end));
        // The comment is confined inside the quoted payload.
        assert!(cmd.contains("'ls /tmp # inspect'"));
    }

    #[test]
    fn parse_exit_reads_digits() {
        assert!(matches!(
            parse_exit("__HOST_END__1_ab__ EXIT=42"),
            EndLine::Exit(42)
        ));
        assert!(matches!(
            parse_exit("__HOST_END__1_ab__ EXIT=0"),
            EndLine::Exit(0)
        ));
    }

    #[test]
    fn parse_exit_skips_echo_residue() {
        assert!(matches!(
            parse_exit(r#"echo "__HOST_END__1_ab__ EXIT=$__rc"; } 2>&1"#),
            EndLine::EchoResidue
        ));
    }

    #[test]
    fn parse_exit_flags_malformed_lines() {
        assert!(matches!(parse_exit("__HOST_END__1_ab__"), EndLine::Malformed));
        assert!(matches!(
            parse_exit("__HOST_END__1_ab__ EXIT="),
            EndLine::Malformed
        ));
    }
}
