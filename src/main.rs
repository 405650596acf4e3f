use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logmerge")]
#[command(about = "Chronological log merge pipeline", long_about = None)]
struct Cli {
    /// Path to the config file. Defaults to ~/.config/logmerge/config.yml,
    /// then /etc/logmerge/config.yml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one merge to completion (the default if no subcommand is given).
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config file.
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logmerge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = logmerge::config::resolve_config_path(cli.config.as_deref());

    let result = match cli.command {
        Some(Commands::Run) | None => logmerge::cli::run::run(config_path).map_err(logmerge::LogmergeError::from),
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => logmerge::cli::config::init(stdout).map_err(logmerge::LogmergeError::from),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("logmerge: {err}");
            ExitCode::FAILURE
        }
    }
}
