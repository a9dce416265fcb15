//! Serial console command bridge for QEMU guests.
//!
//! Boots a VM, finds its dynamically allocated serial pty, copies the
//! console into a durable transcript, waits for the guest shell to become
//! responsive, and then correlates injected shell commands with their
//! output and exit codes through unique START/END markers. The guest needs
//! nothing beyond a POSIX shell on its serial port.

pub mod channel;
pub mod config;
pub mod console;
pub mod interactive;
pub mod qemu;
pub mod session;

// Re-export commonly used items
pub use channel::{send_line, CommandChannel};
pub use config::Config;
pub use console::{
    discover_console, BootState, Bridge, CancelToken, CommandMarkers, CommandOutput, ConsoleError,
    ConsoleWriter, ReadinessDetector, ReadinessPatterns, ReadinessTimeouts, TranscriptTail,
    TranscriptWriter, WaitOutcome, UNKNOWN_EXIT,
};
pub use qemu::{Monitor, QemuBuilder};
pub use session::{AttachError, Attached, Session, SessionPaths, SessionState};
