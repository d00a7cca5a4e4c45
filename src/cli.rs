// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(name = "nimbusd", about = "Local agent daemon", version)]
pub struct Cli {
    /// Explicit config file. Takes precedence over every discovered layer.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon: lane queue, heartbeat, scheduler, and the
    /// WebSocket gateway.
    Serve {
        /// Override the port from the loaded config.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the fully merged configuration as YAML and exit.
    ShowConfig,
    /// Print shell completions for the given shell to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
