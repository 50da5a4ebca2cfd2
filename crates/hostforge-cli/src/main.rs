mod cmd;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, vpn::VpnSubcommand};
use hostforge_core::config::DEFAULT_CONFIG_FILE;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hostforge",
    about = "Provision a Debian/Ubuntu VPS: hardening, Docker, WireGuard, monitoring and alerting",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file (KEY=VALUE)
    #[arg(long, global = true, env = "HOSTFORGE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Append logs to this file instead of LOG_FILE from the configuration
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all five stages in order, stopping at the first failure
    Run,

    /// Run a single stage (hardening, docker, wireguard, monitoring, alerting)
    Stage {
        /// Stage name or ordinal
        name: String,
    },

    /// List stages and their dependencies
    Stages,

    /// Create, inspect and validate the configuration file
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// WireGuard client helpers
    Vpn {
        #[command(subcommand)]
        subcommand: VpnSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let provisioning = matches!(cli.command, Commands::Run | Commands::Stage { .. });
    let log_file = if provisioning {
        cli.log_file
            .clone()
            .or_else(|| cmd::configured_log_file(&cli.config))
    } else {
        cli.log_file.clone()
    };
    let default_level = if provisioning {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    logging::init(default_level, log_file.as_deref());

    let result = match cli.command {
        Commands::Run => cmd::run::run(&cli.config, None, cli.json),
        Commands::Stage { name } => cmd::run::run_stage(&cli.config, &name, cli.json),
        Commands::Stages => cmd::stages::run(cli.json),
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
        Commands::Vpn { subcommand } => cmd::vpn::run(&cli.config, subcommand),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
