//! serial-bridge CLI.
//!
//! `run` owns the whole lifecycle: boot the guest, wait for readiness, and
//! drop into the interactive loop. `shell`, `exec`, and `send` attach to a
//! session started elsewhere; their preconditions (target running,
//! transcript present) exit with status 1 when unmet.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use serial_bridge::config::Config;
use serial_bridge::session::{Attached, Session};
use serial_bridge::{channel, interactive, CommandChannel, UNKNOWN_EXIT};

#[derive(Parser)]
#[command(name = "serial-bridge")]
#[command(about = "Marker-based serial console command bridge for QEMU guests")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Session name (overrides config)
    #[arg(long, global = true)]
    name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot a guest and run the interactive session loop
    Run {
        /// Disk image to boot
        #[arg(long)]
        disk: Option<PathBuf>,

        /// ISO to attach as CD-ROM
        #[arg(long)]
        cdrom: Option<PathBuf>,

        /// Memory size (e.g. 512M, 2G)
        #[arg(long)]
        memory: Option<String>,

        /// Run a single command instead of the interactive loop
        #[arg(long, short = 'c')]
        command: Option<String>,
    },

    /// Attach an interactive shell to a running session
    Shell,

    /// Run one command in a running session and propagate its exit code
    Exec {
        /// The guest shell command
        command: Vec<String>,
    },

    /// Push a line into a running session's command FIFO (fire-and-forget)
    Send {
        /// The line to forward verbatim to the console
        line: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    if let Some(name) = &cli.name {
        config.session.name = name.clone();
    }

    match cli.command {
        Commands::Run {
            disk,
            cdrom,
            memory,
            command,
        } => {
            if let Some(disk) = disk {
                config.vm.disk = Some(disk);
            }
            if let Some(cdrom) = cdrom {
                config.vm.cdrom = Some(cdrom);
            }
            if let Some(memory) = memory {
                config.vm.memory = memory;
            }
            run(&config, command.as_deref())
        }
        Commands::Shell => shell(&config),
        Commands::Exec { command } => exec(&config, &command.join(" ")),
        Commands::Send { line } => send(&config, &line.join(" ")),
    }
}

fn run(config: &Config, one_shot: Option<&str>) -> Result<()> {
    println!("{} launching guest...", ">>>".cyan().bold());
    let mut session = Session::launch(config)?;
    println!(
        "  console at {}",
        session.state().console_device.display()
    );

    println!("{} waiting for guest shell...", ">>>".cyan().bold());
    let mut detector = session.detector(config)?;
    detector.wait_until_responsive()?;
    if detector.is_degraded() {
        println!("  {}", "guest assumed ready (degraded)".yellow());
    } else {
        println!("  {}", "guest shell responsive".green().bold());
    }

    let mut channel = CommandChannel::spawn(
        &session.state().command_fifo,
        session.writer().clone(),
    );
    println!(
        "  command fifo at {}",
        session.state().command_fifo.display()
    );

    let result = match one_shot {
        Some(command) => {
            interactive::install_interrupt_handler()?;
            match interactive::run_with_interrupt(session.bridge(), command)? {
                Some(output) => {
                    for line in &output.lines {
                        println!("{line}");
                    }
                    println!("[exit {}]", output.exit_code);
                    Ok(())
                }
                None => Ok(()),
            }
        }
        None => interactive::run_loop(session.bridge()),
    };

    channel.stop();
    session.teardown();
    result
}

fn shell(config: &Config) -> Result<()> {
    let attached = match Attached::attach(config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };
    interactive::run_loop(attached.bridge())
}

fn exec(config: &Config, command: &str) -> Result<()> {
    if command.trim().is_empty() {
        eprintln!("{} empty command", "error:".red().bold());
        std::process::exit(1);
    }
    let attached = match Attached::attach(config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };

    interactive::install_interrupt_handler()?;
    match interactive::run_with_interrupt(attached.bridge(), command)? {
        Some(output) => {
            for line in &output.lines {
                println!("{line}");
            }
            let code = if output.exit_code == UNKNOWN_EXIT {
                1
            } else {
                output.exit_code & 0xff
            };
            std::process::exit(code);
        }
        None => {
            eprintln!("{}", "command interrupted".yellow());
            std::process::exit(130);
        }
    }
}

fn send(config: &Config, line: &str) -> Result<()> {
    let attached = match Attached::attach(config) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };
    channel::send_line(&attached.state().command_fifo, line)
}
