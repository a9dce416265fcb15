//! Interactive session loop.
//!
//! A read-eval loop over the command/response bridge. SIGINT is handled as
//! an explicit cancellation: while a command is streaming, an interrupt
//! forwards a raw 0x03 byte to the guest out-of-band and cancels the
//! in-flight consumer; between commands it simply returns control to the
//! prompt. Typing the literal `ctrl-c` token sends the interrupt byte
//! without any bridge call at all - the tool for unsticking a hung guest
//! shell.

use anyhow::{Context, Result};
use colored::Colorize;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::console::{Bridge, CancelToken, CommandOutput, ConsoleError, UNKNOWN_EXIT};

/// Typed at the prompt to forward a raw interrupt byte to the guest.
pub const INTERRUPT_TOKEN: &str = "ctrl-c";

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: i32) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route SIGINT into the cancellation flag instead of killing the process.
pub fn install_interrupt_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.context("installing SIGINT handler")?;
    Ok(())
}

/// One line of user input, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Input<'a> {
    Empty,
    Exit,
    Clear,
    Interrupt,
    Command(&'a str),
}

pub fn classify(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    match trimmed {
        "" => Input::Empty,
        "exit" | "quit" => Input::Exit,
        "clear" => Input::Clear,
        INTERRUPT_TOKEN => Input::Interrupt,
        _ => Input::Command(trimmed),
    }
}

/// Run `command` through the bridge while watching for a host interrupt.
///
/// Returns `Ok(None)` if the invocation was interrupted: the 0x03 byte has
/// already been forwarded to the guest and the consumer cancelled.
pub fn run_with_interrupt(bridge: &Bridge, command: &str) -> Result<Option<CommandOutput>> {
    let cancel = CancelToken::new();
    let done = Arc::new(AtomicBool::new(false));

    // The bridge blocks this thread; a watcher relays the interrupt flag
    // into the guest and the cancellation token.
    let watcher = {
        let cancel = cancel.clone();
        let done = Arc::clone(&done);
        let writer = bridge.writer().clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                if INTERRUPTED.swap(false, Ordering::SeqCst) {
                    let _ = writer.send_interrupt();
                    cancel.cancel();
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        })
    };

    let result = bridge.run(command, &cancel);
    done.store(true, Ordering::SeqCst);
    watcher.join().ok();
    // An interrupt that landed after END belongs to nobody.
    INTERRUPTED.store(false, Ordering::SeqCst);

    match result {
        Ok(output) => Ok(Some(output)),
        Err(ConsoleError::Cancelled) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The interactive read-eval loop. Returns on the exit keyword or EOF.
pub fn run_loop(bridge: &Bridge) -> Result<()> {
    install_interrupt_handler()?;

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    println!(
        "  type commands for the guest shell; {} to quit, {} to interrupt the guest",
        "exit".bold(),
        INTERRUPT_TOKEN.bold()
    );

    loop {
        // An interrupt issued between commands stays with the loop.
        INTERRUPTED.store(false, Ordering::SeqCst);

        print!("{} ", "guest>".cyan().bold());
        std::io::stdout().flush().ok();

        let Some(line) = lines.next() else {
            break; // EOF
        };
        let line = line.context("reading interactive input")?;

        match classify(&line) {
            Input::Empty => continue,
            Input::Exit => break,
            Input::Clear => {
                // Clear the local display only; the guest sees nothing.
                print!("\x1b[2J\x1b[H");
                std::io::stdout().flush().ok();
            }
            Input::Interrupt => {
                if let Err(e) = bridge.writer().send_interrupt() {
                    eprintln!("  {} {e}", "WARN:".yellow());
                }
            }
            Input::Command(command) => match run_with_interrupt(bridge, command)? {
                Some(output) => print_output(&output),
                None => println!("{}", "^C (command interrupted)".yellow()),
            },
        }
    }

    Ok(())
}

fn print_output(output: &CommandOutput) {
    for line in &output.lines {
        println!("{line}");
    }
    if output.exit_code == UNKNOWN_EXIT {
        println!("{}", "[exit unknown]".yellow());
    } else {
        let trailer = format!("[exit {}]", output.exit_code);
        if output.exit_code == 0 {
            println!("{}", trailer.green());
        } else {
            println!("{}", trailer.red());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_lines_are_empty() {
        assert_eq!(classify(""), Input::Empty);
        assert_eq!(classify("   "), Input::Empty);
    }

    #[test]
    fn exit_keywords() {
        assert_eq!(classify("exit"), Input::Exit);
        assert_eq!(classify("quit"), Input::Exit);
        assert_eq!(classify(" exit "), Input::Exit);
    }

    #[test]
    fn clear_and_interrupt_tokens() {
        assert_eq!(classify("clear"), Input::Clear);
        assert_eq!(classify("ctrl-c"), Input::Interrupt);
    }

    #[test]
    fn everything_else_is_a_command() {
        assert_eq!(classify("ls -la /"), Input::Command("ls -la /"));
        // Keywords embedded in a longer line are commands, not controls.
        assert_eq!(classify("echo exit"), Input::Command("echo exit"));
    }
}
