use clap::{Parser, Subcommand};

use nixos_operator::commands;

#[derive(Parser)]
#[command(
    name = "nixos-operator",
    version,
    about = "Kubernetes operator managing NixOS machines over SSH"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the operator
    Run,

    /// Print the CustomResourceDefinitions for installation
    Crd,

    /// Inspect or edit the pinned host-key store
    KnownHosts {
        #[command(subcommand)]
        command: KnownHostsCommands,
    },
}

#[derive(Subcommand)]
enum KnownHostsCommands {
    /// List pinned host keys
    List,

    /// Remove the pinned keys for a host (after verifying the key change)
    Clear {
        #[arg(long)]
        host: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => commands::run::run(),
        Commands::Crd => commands::crd::run(),
        Commands::KnownHosts { command } => match command {
            KnownHostsCommands::List => commands::known_hosts::list(),
            KnownHostsCommands::Clear { host } => commands::known_hosts::clear(&host),
        },
    }
}
