//! Error taxonomy for the console bridge.
//!
//! Startup-critical failures (discovery) abort session setup; mid-session
//! failures degrade and continue. Readiness timeouts are deliberately NOT
//! errors - they come back as a soft `WaitOutcome::TimedOut` so a long-lived
//! session never dies from a single slow boot stage.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
    /// The engine never announced a usable console device path.
    #[error("no console device announced in {log} after {retries} scans")]
    DiscoveryTimeout { log: PathBuf, retries: u32 },

    /// Writing a command line to the console device kept failing.
    #[error("console write failed after {attempts} attempts")]
    WriteFailure {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The transcript file disappeared or could not be read while tailing.
    #[error("transcript unavailable at {path}")]
    TranscriptUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bridge invocation was cancelled before its END marker appeared.
    #[error("command cancelled before completion")]
    Cancelled,
}

/// Soft result of a bounded wait. Callers log and degrade on timeout
/// rather than propagating an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
}

impl WaitOutcome {
    pub fn is_ready(self) -> bool {
        matches!(self, WaitOutcome::Ready)
    }
}
