//! QMP monitor channel.
//!
//! Line-oriented JSON control protocol over QEMU's Unix monitor socket.
//! Used here for exactly one thing: typing a synthetic Return keypress as a
//! readiness-detector fallback nudge when the serial pty seems wedged.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// QMP client over a Unix socket.
pub struct Monitor {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Greeting {
    #[serde(rename = "QMP")]
    qmp: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "return")]
    return_value: Option<Value>,
    error: Option<MonitorError>,
}

#[derive(Debug, Deserialize)]
struct MonitorError {
    class: String,
    desc: String,
}

#[derive(Debug, Serialize)]
struct Command {
    execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

impl Monitor {
    /// Connect and negotiate capabilities. QMP starts in a handshake mode
    /// where only `qmp_capabilities` is accepted.
    pub fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .with_context(|| format!("connecting to monitor socket {}", socket.display()))?;
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .context("setting monitor read timeout")?;
        let reader = BufReader::new(stream.try_clone().context("cloning monitor stream")?);

        let mut monitor = Self { stream, reader };

        let greeting = monitor.read_line()?;
        serde_json::from_str::<Greeting>(&greeting).context("parsing QMP greeting")?;

        monitor.execute("qmp_capabilities", None)?;
        Ok(monitor)
    }

    /// Send a synthetic keypress through the monitor.
    pub fn send_key(&mut self, qcode: &str) -> Result<()> {
        self.execute(
            "send-key",
            Some(json!({ "keys": [{ "type": "qcode", "data": qcode }] })),
        )?;
        Ok(())
    }

    fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let cmd = Command {
            execute: command.to_string(),
            arguments,
        };
        let mut line = serde_json::to_string(&cmd)?;
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .with_context(|| format!("sending QMP command {command}"))?;

        // Events can interleave with the response; skip anything without a
        // return/error field.
        loop {
            let raw = self.read_line()?;
            let response: Response = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(_) => continue,
            };
            if let Some(err) = response.error {
                bail!("QMP {command} failed: {} ({})", err.desc, err.class);
            }
            if let Some(value) = response.return_value {
                return Ok(value);
            }
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .context("reading from monitor socket")?;
        if n == 0 {
            bail!("monitor socket closed");
        }
        Ok(line)
    }
}

/// One-shot Return keypress, the readiness nudge.
pub fn press_return(socket: &Path) -> Result<()> {
    Monitor::connect(socket)?.send_key("ret")
}
