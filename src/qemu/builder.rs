//! QEMU command builder.
//!
//! Assembles the argv for a guest whose serial port is exposed as a host
//! pty and whose own diagnostics (including the pty announcement) are
//! redirected to a startup log.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Builder for the virtualization engine's command line.
#[derive(Default)]
pub struct QemuBuilder {
    binary: Option<String>,
    memory: Option<String>,
    cpus: Option<u32>,
    disk: Option<PathBuf>,
    cdrom: Option<PathBuf>,
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    append: Option<String>,
    monitor_socket: Option<PathBuf>,
    serial_pty: bool,
    no_reboot: bool,
    extra_args: Vec<String>,
}

impl QemuBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// QEMU binary (default: qemu-system-x86_64).
    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = Some(binary.to_string());
        self
    }

    /// Memory size, e.g. "512M", "2G".
    pub fn memory(mut self, mem: &str) -> Self {
        self.memory = Some(mem.to_string());
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = Some(cpus);
        self
    }

    /// Primary disk image (virtio).
    pub fn disk(mut self, path: PathBuf) -> Self {
        self.disk = Some(path);
        self
    }

    /// ISO attached as CD-ROM.
    pub fn cdrom(mut self, path: PathBuf) -> Self {
        self.cdrom = Some(path);
        self
    }

    /// Kernel for direct boot.
    pub fn kernel(mut self, path: PathBuf) -> Self {
        self.kernel = Some(path);
        self
    }

    /// Initrd for direct boot.
    pub fn initrd(mut self, path: PathBuf) -> Self {
        self.initrd = Some(path);
        self
    }

    /// Kernel command line.
    pub fn append(mut self, args: &str) -> Self {
        self.append = Some(args.to_string());
        self
    }

    /// Expose the guest serial port as a dynamically allocated host pty.
    /// QEMU announces the allocated path on its own stderr.
    pub fn serial_pty(mut self) -> Self {
        self.serial_pty = true;
        self
    }

    /// QMP control socket (server mode, no wait).
    pub fn monitor_socket(mut self, path: PathBuf) -> Self {
        self.monitor_socket = Some(path);
        self
    }

    pub fn no_reboot(mut self) -> Self {
        self.no_reboot = true;
        self
    }

    pub fn extra_arg(mut self, arg: &str) -> Self {
        self.extra_args.push(arg.to_string());
        self
    }

    /// Full argv, without spawning. Exposed for inspection and tests.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-m".into());
        args.push(self.memory.clone().unwrap_or_else(|| "2G".into()));
        args.push("-smp".into());
        args.push(self.cpus.unwrap_or(2).to_string());
        args.push("-display".into());
        args.push("none".into());

        if self.serial_pty {
            args.push("-serial".into());
            args.push("pty".into());
        }
        if let Some(socket) = &self.monitor_socket {
            args.push("-qmp".into());
            args.push(format!("unix:{},server,nowait", socket.display()));
        }
        if let Some(disk) = &self.disk {
            args.push("-drive".into());
            args.push(format!("file={},if=virtio", disk.display()));
        }
        if let Some(cdrom) = &self.cdrom {
            args.push("-cdrom".into());
            args.push(cdrom.display().to_string());
        }
        if let Some(kernel) = &self.kernel {
            args.push("-kernel".into());
            args.push(kernel.display().to_string());
        }
        if let Some(initrd) = &self.initrd {
            args.push("-initrd".into());
            args.push(initrd.display().to_string());
        }
        if let Some(append) = &self.append {
            args.push("-append".into());
            args.push(append.clone());
        }
        if self.no_reboot {
            args.push("-no-reboot".into());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Spawn the engine with stdout+stderr redirected into `startup_log`,
    /// where console discovery will look for the pty announcement.
    pub fn spawn(&self, startup_log: &Path) -> Result<Child> {
        let log = File::create(startup_log)
            .with_context(|| format!("creating startup log {}", startup_log.display()))?;
        let log_err = log
            .try_clone()
            .context("cloning startup log handle for stderr")?;

        let binary = self.binary.as_deref().unwrap_or("qemu-system-x86_64");
        Command::new(binary)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .with_context(|| format!("spawning {binary}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_pty_and_monitor_args() {
        let args = QemuBuilder::new()
            .serial_pty()
            .monitor_socket(PathBuf::from("/tmp/mon.sock"))
            .args();
        let joined = args.join(" ");
        assert!(joined.contains("-serial pty"));
        assert!(joined.contains("-qmp unix:/tmp/mon.sock,server,nowait"));
        assert!(joined.contains("-display none"));
    }

    #[test]
    fn disk_uses_virtio() {
        let args = QemuBuilder::new().disk(PathBuf::from("/img/guest.qcow2")).args();
        assert!(args.join(" ").contains("file=/img/guest.qcow2,if=virtio"));
    }

    #[test]
    fn defaults_are_sane() {
        let args = QemuBuilder::new().args();
        let joined = args.join(" ");
        assert!(joined.contains("-m 2G"));
        assert!(joined.contains("-smp 2"));
    }
}
