mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, lines::LinesSubcommand, locks::LocksSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pricesync",
    about = "Catalog pricing sync: webhook server, manual runs, and lock maintenance",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: pricesync.yaml found upward from the current dir)
    #[arg(long, global = true, env = "PRICESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook and admin HTTP server with the stale-lock reclaimer
    Serve {
        /// Port to listen on (default: server.port from config)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run one pricing sync for a supplier line in the foreground
    Sync {
        /// Supplier line id
        line: i64,
        /// Currency applied when a payload names none
        #[arg(long)]
        currency: Option<String>,
    },

    /// Inspect and repair sync locks
    Locks {
        #[command(subcommand)]
        subcommand: LocksSubcommand,
    },

    /// Manage supplier line reference data
    Lines {
        #[command(subcommand)]
        subcommand: LinesSubcommand,
    },

    /// Show or validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } | Commands::Sync { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = root::resolve_config(cli.config.as_deref());

    let result = match cli.command {
        Commands::Serve { port } => cmd::serve::run(&config_path, port),
        Commands::Sync { line, currency } => {
            cmd::sync::run(&config_path, line, currency.as_deref(), cli.json)
        }
        Commands::Locks { subcommand } => cmd::locks::run(&config_path, subcommand, cli.json),
        Commands::Lines { subcommand } => cmd::lines::run(&config_path, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&config_path, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
