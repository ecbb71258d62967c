//! One-shot command mode: push raw commands through the acknowledgement
//! gate and print what the vehicle answered.

use std::{
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use clap::Args;
use drone_link::{COMMAND_PORT, CommandChannel, LinkConfig, QueuePolicy};
use tracing::warn;

const POLL: Duration = Duration::from_millis(20);

/// CLI arguments accepted by the `send` subcommand.
#[derive(Debug, Args)]
pub struct SendArgs {
    /// Commands to send in order, e.g. `command takeoff "up 50" land`.
    #[arg(value_name = "COMMAND", required = true)]
    pub commands: Vec<String>,
    /// Vehicle command address.
    #[arg(long = "drone", value_name = "ADDR", default_value_t = SocketAddr::from(([192, 168, 10, 1], COMMAND_PORT)))]
    pub drone_addr: SocketAddr,
    /// Local address for the command socket.
    #[arg(long = "command-bind", value_name = "ADDR", default_value_t = SocketAddr::from(([0, 0, 0, 0], COMMAND_PORT)))]
    pub command_bind: SocketAddr,
    /// Seconds to wait for each acknowledgement.
    #[arg(long = "timeout-secs", value_name = "SECS", default_value_t = 10)]
    pub timeout_secs: u64,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

pub fn run(args: SendArgs) -> Result<()> {
    if args.timeout_secs == 0 {
        bail!("--timeout-secs must be at least 1");
    }
    let timeout = Duration::from_secs(args.timeout_secs);
    let config = LinkConfig {
        drone_addr: args.drone_addr,
        command_bind: args.command_bind,
        policy: QueuePolicy {
            // Give up on a silent vehicle instead of blocking the queue forever.
            ack_timeout: Some(timeout),
            ..QueuePolicy::default()
        },
        verbose: args.verbose,
        ..LinkConfig::default()
    };
    let mut channel = CommandChannel::connect(&config)
        .with_context(|| format!("failed to open command link to {}", args.drone_addr))?;

    let mut unanswered = 0usize;
    for command in &args.commands {
        let before = channel.responses_received();
        channel.enqueue(command.as_str());
        if !wait_until_idle(&channel, timeout + POLL * 5) {
            warn!("{command}: no acknowledgement within {}s", args.timeout_secs);
            unanswered += 1;
            continue;
        }
        match channel.last_response() {
            Some(response) if channel.responses_received() > before => {
                println!("{command} -> {response}");
            }
            _ => {
                println!("{command} -> (no response)");
                unanswered += 1;
            }
        }
    }

    channel.shutdown();
    if unanswered > 0 {
        bail!("{unanswered} of {} commands went unanswered", args.commands.len());
    }
    Ok(())
}

fn wait_until_idle(channel: &CommandChannel, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if channel.is_idle() {
            return true;
        }
        thread::sleep(POLL);
    }
    false
}
