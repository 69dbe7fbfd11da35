use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Local orchestrator that multiplexes AI coding-agent subprocesses onto
/// browser and native clients.
#[derive(Parser, Debug)]
#[command(name = "mitto", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Explicit config file, merged on top of the usual search path.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity; repeatable (-v, -vv).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon: session manager plus the HTTP/WebSocket gateway.
    Serve {
        /// Override the configured bind address (host:port).
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the fully merged configuration as YAML and exit.
    ShowConfig,
    /// List known sessions, optionally filtered to one workspace.
    ListSessions {
        #[arg(long)]
        workspace: Option<String>,
        /// Print as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Manage the gateway's bearer token.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommand,
    },
    /// Print shell completions for the given shell.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum GatewayCommand {
    /// Print the token clients must send as `Authorization: Bearer <token>`,
    /// generating one on first use.
    Token {
        /// Discard any existing token and generate a new one.
        #[arg(long)]
        regenerate: bool,
    },
}
