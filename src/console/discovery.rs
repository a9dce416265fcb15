//! Console device discovery.
//!
//! QEMU allocates the serial pty dynamically and announces it in its own
//! startup output ("char device redirected to /dev/pts/N (label serial0)").
//! The path is only knowable after the engine starts, so discovery polls the
//! redirected startup log instead of assuming a fixed device.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConsoleError;

/// Announcement pattern in the engine's startup log.
const ANNOUNCEMENT: &str = r"char device redirected to (\S+) \(label";

/// Scan `startup_log` until it names a console device that exists on disk.
///
/// The last announcement wins: on engine restarts the log can carry stale
/// paths from earlier runs, and only the newest one is live. Each scan also
/// checks the filesystem, since the pts node can lag the log line briefly.
pub fn discover_console(
    startup_log: &Path,
    retries: u32,
    interval: Duration,
) -> Result<PathBuf, ConsoleError> {
    let pattern = Regex::new(ANNOUNCEMENT).expect("announcement pattern is valid");

    for attempt in 0..retries {
        if attempt > 0 {
            std::thread::sleep(interval);
        }
        if let Some(path) = scan_log(startup_log, &pattern) {
            if path.exists() {
                return Ok(path);
            }
        }
    }

    Err(ConsoleError::DiscoveryTimeout {
        log: startup_log.to_path_buf(),
        retries,
    })
}

fn scan_log(startup_log: &Path, pattern: &Regex) -> Option<PathBuf> {
    let contents = std::fs::read_to_string(startup_log).ok()?;
    pattern
        .captures_iter(&contents)
        .last()
        .map(|c| PathBuf::from(&c[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_announced_device() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("pts3");
        std::fs::write(&device, "").unwrap();

        let log = dir.path().join("qemu.log");
        std::fs::write(
            &log,
            format!(
                "qemu-system-x86_64: warning: something\n\
                 char device redirected to {} (label serial0)\n",
                device.display()
            ),
        )
        .unwrap();

        let found = discover_console(&log, 3, Duration::from_millis(10)).unwrap();
        assert_eq!(found, device);
    }

    #[test]
    fn last_announcement_wins() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("pts1");
        let live = dir.path().join("pts9");
        std::fs::write(&stale, "").unwrap();
        std::fs::write(&live, "").unwrap();

        let log = dir.path().join("qemu.log");
        std::fs::write(
            &log,
            format!(
                "char device redirected to {} (label serial0)\n\
                 char device redirected to {} (label serial0)\n",
                stale.display(),
                live.display()
            ),
        )
        .unwrap();

        let found = discover_console(&log, 1, Duration::from_millis(1)).unwrap();
        assert_eq!(found, live);
    }

    #[test]
    fn announced_but_missing_device_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("qemu.log");
        std::fs::write(
            &log,
            "char device redirected to /nonexistent/pts99 (label serial0)\n",
        )
        .unwrap();

        let err = discover_console(&log, 2, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, ConsoleError::DiscoveryTimeout { retries: 2, .. }));
    }

    #[test]
    fn empty_log_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("qemu.log");
        std::fs::write(&log, "").unwrap();

        let err = discover_console(&log, 2, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, ConsoleError::DiscoveryTimeout { .. }));
    }
}
