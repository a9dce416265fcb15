//! Headless command channel.
//!
//! A long-lived reader drains the session's FIFO line by line and forwards
//! each line verbatim onto the console write path. This lets out-of-process
//! automation inject commands while nothing interactive is attached. No
//! markers are added here - callers wanting exit-code correlation go
//! through the bridge instead.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::console::ConsoleWriter;

pub struct CommandChannel {
    fifo: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CommandChannel {
    /// Start draining `fifo` into the console writer.
    pub fn spawn(fifo: &Path, writer: ConsoleWriter) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let fifo_path = fifo.to_path_buf();

        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                // Opening the read side blocks until a writer appears; each
                // writer hangup delivers EOF and we reopen for the next one.
                let file = match File::open(&fifo_path) {
                    Ok(f) => f,
                    Err(_) => break,
                };
                for line in BufReader::new(file).lines() {
                    let Ok(line) = line else { break };
                    if stop_flag.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Err(e) = writer.write_line(&line) {
                        eprintln!("  WARN: dropping channel command: {e}");
                    }
                }
            }
        });

        Self {
            fifo: fifo.to_path_buf(),
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the drain thread. Connecting a throwaway writer unblocks a
    /// reader parked in open() or read(). Idempotent: once the thread is
    /// joined there is no reader left, and a second write-open of the FIFO
    /// would block forever waiting for one.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Relaxed);
        let _ = OpenOptions::new().write(true).open(&self.fifo);
        let _ = handle.join();
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Writer side: push one line into a session's FIFO (fire-and-forget).
pub fn send_line(fifo: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(fifo)
        .with_context(|| format!("opening command fifo {}", fifo.display()))?;
    writeln!(file, "{line}").with_context(|| format!("writing to {}", fifo.display()))?;
    Ok(())
}
