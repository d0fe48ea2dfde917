mod config;
mod dbus;
mod error;
mod incus;
mod operation;
mod ptyxis;
mod service;
mod shared;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kapsule")]
#[command(about = "Incus-backed desktop containers with D-Bus integration", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the D-Bus daemon
    Daemon {
        /// Connect to the session bus instead of the system bus
        #[arg(long)]
        session: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    shared::logging::init_logging();

    let cli = Cli::parse();

    // The daemon is the default when no subcommand is given.
    let command = cli.command.unwrap_or(Commands::Daemon { session: false });

    match command {
        Commands::Daemon { session } => dbus::run(session).await,
    }
}
