use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::{
    follow::{self, FollowArgs, FollowConfig},
    send::{self, SendArgs},
};

#[derive(Debug, Parser)]
#[command(name = "follow-me")]
#[command(about = "Follow-me flight control for Tello-class drones", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the full follow loop: command link, telemetry, video, pose and side channel.
    Follow(FollowArgs),
    /// Send raw commands one at a time, waiting for each acknowledgement.
    Send(SendArgs),
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Follow(args) => {
            follow::telemetry::init_tracing(args.verbose);
            let config = FollowConfig::try_from(args)?;
            follow::run(config)
        }
        Commands::Send(args) => {
            follow::telemetry::init_tracing(args.verbose);
            send::run(args)
        }
    }
}
