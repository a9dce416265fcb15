//! Configuration.
//!
//! A TOML file describes how to launch the guest and where session state
//! lives. Everything has a default so `serial-bridge run --disk x.qcow2`
//! works with no config file at all. Paths resolved here are carried by the
//! session handle; nothing else in the crate reads ambient globals.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::console::{ReadinessPatterns, ReadinessTimeouts};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vm: VmConfig,
    pub session: SessionConfig,
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub qemu_binary: String,
    pub memory: String,
    pub cpus: u32,
    pub disk: Option<PathBuf>,
    pub cdrom: Option<PathBuf>,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub append: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            qemu_binary: "qemu-system-x86_64".into(),
            memory: "2G".into(),
            cpus: 2,
            disk: None,
            cdrom: None,
            kernel: None,
            initrd: None,
            append: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where per-session files live (state, transcript, fifo, sockets).
    pub runtime_dir: PathBuf,
    /// Session name; all files are namespaced under it.
    pub name: String,
    pub discovery_retries: u32,
    pub discovery_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir().join("serial-bridge"),
            name: "default".into(),
            discovery_retries: 50,
            discovery_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub os_ready_pattern: String,
    pub shell_ready_pattern: String,
    pub os_boot_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        let defaults = ReadinessPatterns::default();
        let timeouts = ReadinessTimeouts::default();
        Self {
            os_ready_pattern: defaults.os_ready.as_str().to_string(),
            shell_ready_pattern: defaults.shell_ready.as_str().to_string(),
            os_boot_timeout_secs: timeouts.os_boot.as_secs(),
            login_timeout_secs: timeouts.login.as_secs(),
            probe_timeout_secs: timeouts.probe.as_secs(),
        }
    }
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load `path` if given, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn readiness_patterns(&self) -> Result<ReadinessPatterns> {
        Ok(ReadinessPatterns {
            os_ready: Regex::new(&self.readiness.os_ready_pattern)
                .context("invalid os_ready_pattern")?,
            shell_ready: Regex::new(&self.readiness.shell_ready_pattern)
                .context("invalid shell_ready_pattern")?,
        })
    }

    pub fn readiness_timeouts(&self) -> ReadinessTimeouts {
        ReadinessTimeouts {
            os_boot: Duration::from_secs(self.readiness.os_boot_timeout_secs),
            login: Duration::from_secs(self.readiness.login_timeout_secs),
            probe: Duration::from_secs(self.readiness.probe_timeout_secs),
        }
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.session.discovery_interval_ms)
    }
}
