//! Session lifecycle.
//!
//! A `Session` exclusively owns one spawned guest: the QEMU child process,
//! the transcript copier thread, and every per-session path (console device,
//! transcript, startup log, monitor socket, command FIFO). The session
//! description is persisted as JSON in the runtime directory so other
//! processes (`shell`, `exec`, `send`) can attach to a running guest.

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::Config;
use crate::console::{
    discover_console, Bridge, ConsoleWriter, ReadinessDetector, TranscriptWriter,
};
use crate::qemu::QemuBuilder;

/// Grace interval between SIGTERM and SIGKILL at teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Persisted description of a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub pid: u32,
    pub console_device: PathBuf,
    pub transcript: PathBuf,
    pub startup_log: PathBuf,
    pub monitor_socket: PathBuf,
    pub command_fifo: PathBuf,
}

/// Per-session file locations under the runtime directory.
pub struct SessionPaths {
    pub state_file: PathBuf,
    pub transcript: PathBuf,
    pub startup_log: PathBuf,
    pub monitor_socket: PathBuf,
    pub command_fifo: PathBuf,
}

impl SessionPaths {
    pub fn new(runtime_dir: &Path, name: &str) -> Self {
        Self {
            state_file: runtime_dir.join(format!("{name}.json")),
            transcript: runtime_dir.join(format!("{name}.transcript.log")),
            startup_log: runtime_dir.join(format!("{name}.startup.log")),
            monitor_socket: runtime_dir.join(format!("{name}.monitor.sock")),
            command_fifo: runtime_dir.join(format!("{name}.cmd.fifo")),
        }
    }
}

/// A live session: exclusive owner of the guest process and its copier.
pub struct Session {
    child: Child,
    state: SessionState,
    state_file: PathBuf,
    transcript_writer: TranscriptWriter,
    bridge: Bridge,
    torn_down: bool,
}

impl Session {
    /// Spawn the guest, discover its console, start the transcript copier,
    /// create the command FIFO, and persist the session state.
    pub fn launch(config: &Config) -> Result<Self> {
        let runtime_dir = &config.session.runtime_dir;
        std::fs::create_dir_all(runtime_dir)
            .with_context(|| format!("creating runtime dir {}", runtime_dir.display()))?;
        let paths = SessionPaths::new(runtime_dir, &config.session.name);

        // Stale sockets/FIFOs from a crashed session would break re-launch.
        let _ = std::fs::remove_file(&paths.monitor_socket);
        let _ = std::fs::remove_file(&paths.command_fifo);

        let mut builder = QemuBuilder::new()
            .binary(&config.vm.qemu_binary)
            .memory(&config.vm.memory)
            .cpus(config.vm.cpus)
            .serial_pty()
            .monitor_socket(paths.monitor_socket.clone())
            .no_reboot();
        if let Some(disk) = &config.vm.disk {
            builder = builder.disk(disk.clone());
        }
        if let Some(cdrom) = &config.vm.cdrom {
            builder = builder.cdrom(cdrom.clone());
        }
        if let Some(kernel) = &config.vm.kernel {
            builder = builder.kernel(kernel.clone());
        }
        if let Some(initrd) = &config.vm.initrd {
            builder = builder.initrd(initrd.clone());
        }
        if let Some(append) = &config.vm.append {
            builder = builder.append(append);
        }
        for arg in &config.vm.extra_args {
            builder = builder.extra_arg(arg);
        }

        let mut child = builder.spawn(&paths.startup_log)?;

        let console_device = match discover_console(
            &paths.startup_log,
            config.session.discovery_retries,
            config.discovery_interval(),
        ) {
            Ok(path) => path,
            Err(e) => {
                // Startup-critical: no console means no session.
                let _ = child.kill();
                let _ = child.wait();
                return Err(e).context("console discovery failed");
            }
        };

        let transcript_writer = TranscriptWriter::spawn(&console_device, &paths.transcript)?;
        let writer = ConsoleWriter::open(&console_device)?;

        nix::unistd::mkfifo(&paths.command_fifo, Mode::S_IRWXU)
            .with_context(|| format!("creating command fifo {}", paths.command_fifo.display()))?;

        let state = SessionState {
            pid: child.id(),
            console_device,
            transcript: paths.transcript.clone(),
            startup_log: paths.startup_log.clone(),
            monitor_socket: paths.monitor_socket.clone(),
            command_fifo: paths.command_fifo.clone(),
        };
        let json = serde_json::to_string_pretty(&state)?;
        std::fs::write(&paths.state_file, json)
            .with_context(|| format!("writing session state {}", paths.state_file.display()))?;

        let bridge = Bridge::new(writer, &state.transcript);

        Ok(Self {
            child,
            state,
            state_file: paths.state_file,
            transcript_writer,
            bridge,
            torn_down: false,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn writer(&self) -> &ConsoleWriter {
        self.bridge.writer()
    }

    /// Build the readiness detector for this session.
    pub fn detector(&self, config: &Config) -> Result<ReadinessDetector> {
        Ok(ReadinessDetector::new(
            &self.state.transcript,
            self.writer().clone(),
            Some(self.state.monitor_socket.clone()),
            config.readiness_patterns()?,
            config.readiness_timeouts(),
        ))
    }

    /// Whether the guest process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the guest and its copier: SIGTERM, a short grace interval,
    /// then SIGKILL. Idempotent - a process that is already gone is fine.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let pid = Pid::from_raw(self.child.id() as i32);
        let _ = kill(pid, Signal::SIGTERM);

        let deadline = Instant::now() + TEARDOWN_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(_) => break,
            }
        }

        self.transcript_writer.stop();
        let _ = std::fs::remove_file(&self.state_file);
        let _ = std::fs::remove_file(&self.state.command_fifo);
        let _ = std::fs::remove_file(&self.state.monitor_socket);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Why attaching to an existing session failed. These are the interactive
/// front-end's precondition failures (process exit code 1).
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("no session state at {0} - is the target running?")]
    NoSession(PathBuf),

    #[error("session state at {path} is unreadable: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("target process {pid} is not running")]
    TargetNotRunning { pid: u32 },

    #[error("transcript missing at {0}")]
    TranscriptMissing(PathBuf),

    #[error("console device {0} is gone")]
    ConsoleGone(PathBuf),
}

/// A handle onto a session owned by another process. Shares the console
/// write path and transcript, but never the child process.
pub struct Attached {
    state: SessionState,
    bridge: Bridge,
}

impl Attached {
    /// Load the persisted session state and verify its preconditions.
    pub fn attach(config: &Config) -> Result<Self, AttachError> {
        let paths = SessionPaths::new(&config.session.runtime_dir, &config.session.name);
        let state = Self::load_state(&paths.state_file)?;

        if kill(Pid::from_raw(state.pid as i32), None).is_err() {
            return Err(AttachError::TargetNotRunning { pid: state.pid });
        }
        if !state.transcript.exists() {
            return Err(AttachError::TranscriptMissing(state.transcript.clone()));
        }

        let writer = ConsoleWriter::open(&state.console_device)
            .map_err(|_| AttachError::ConsoleGone(state.console_device.clone()))?;
        let bridge = Bridge::new(writer, &state.transcript);

        Ok(Self { state, bridge })
    }

    fn load_state(path: &Path) -> Result<SessionState, AttachError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|_| AttachError::NoSession(path.to_path_buf()))?;
        serde_json::from_str(&contents).map_err(|e| AttachError::CorruptState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn writer(&self) -> &ConsoleWriter {
        self.bridge.writer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.session.runtime_dir = dir.to_path_buf();
        config.session.name = "test".into();
        config
    }

    #[test]
    fn attach_without_state_file_reports_no_session() {
        let dir = tempfile::tempdir().unwrap();
        // .err() rather than .unwrap_err(): Attached has no Debug impl.
        let err = Attached::attach(&config_in(dir.path())).err().unwrap();
        assert!(matches!(err, AttachError::NoSession(_)));
    }

    #[test]
    fn attach_to_dead_pid_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let paths = SessionPaths::new(&config.session.runtime_dir, &config.session.name);

        // A pid far above pid_max that cannot be alive.
        let state = SessionState {
            pid: 999_999_999,
            console_device: dir.path().join("dev"),
            transcript: dir.path().join("t.log"),
            startup_log: dir.path().join("s.log"),
            monitor_socket: dir.path().join("m.sock"),
            command_fifo: dir.path().join("c.fifo"),
        };
        std::fs::write(&paths.state_file, serde_json::to_string(&state).unwrap()).unwrap();

        let err = Attached::attach(&config).err().unwrap();
        assert!(matches!(err, AttachError::TargetNotRunning { pid: 999_999_999 }));
    }

    #[test]
    fn attach_with_missing_transcript_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let paths = SessionPaths::new(&config.session.runtime_dir, &config.session.name);

        let state = SessionState {
            pid: std::process::id(),
            console_device: dir.path().join("dev"),
            transcript: dir.path().join("missing.log"),
            startup_log: dir.path().join("s.log"),
            monitor_socket: dir.path().join("m.sock"),
            command_fifo: dir.path().join("c.fifo"),
        };
        std::fs::write(&paths.state_file, serde_json::to_string(&state).unwrap()).unwrap();

        let err = Attached::attach(&config).err().unwrap();
        assert!(matches!(err, AttachError::TranscriptMissing(_)));
    }

    #[test]
    fn attach_succeeds_against_live_pid_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let paths = SessionPaths::new(&config.session.runtime_dir, &config.session.name);

        let device = dir.path().join("dev");
        let transcript = dir.path().join("t.log");
        std::fs::write(&device, "").unwrap();
        std::fs::write(&transcript, "").unwrap();

        let state = SessionState {
            pid: std::process::id(),
            console_device: device,
            transcript,
            startup_log: dir.path().join("s.log"),
            monitor_socket: dir.path().join("m.sock"),
            command_fifo: dir.path().join("c.fifo"),
        };
        std::fs::write(&paths.state_file, serde_json::to_string(&state).unwrap()).unwrap();

        let attached = Attached::attach(&config).unwrap();
        assert_eq!(attached.state().pid, std::process::id());
    }
}
