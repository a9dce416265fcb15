//! Serial console plumbing: transcript capture, device discovery, boot
//! readiness detection, and the marker-based command/response bridge.

pub mod ansi;
pub mod bridge;
pub mod discovery;
pub mod error;
pub mod readiness;
pub mod transcript;

pub use bridge::{Bridge, CancelToken, CommandMarkers, CommandOutput, UNKNOWN_EXIT};
pub use discovery::discover_console;
pub use error::{ConsoleError, WaitOutcome};
pub use readiness::{BootState, ReadinessDetector, ReadinessPatterns, ReadinessTimeouts};
pub use transcript::{ConsoleWriter, TranscriptTail, TranscriptWriter};
