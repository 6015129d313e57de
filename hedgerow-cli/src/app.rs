//! Command-line interface definition and exit-code mapping.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hedgerow_config::{load_config, ConfigError};
use rust_decimal::Decimal;
use tracing::error;

use crate::live;
use crate::telemetry::init_tracing;

/// Exit codes promised to operators: 0 clean shutdown, 2 configuration
/// invalid, 3 database unreachable, 4 no accounts loaded, 5 no enabled
/// pairs.
const EXIT_CONFIG: u8 = 2;
const EXIT_DATABASE: u8 = 3;
const EXIT_NO_ACCOUNTS: u8 = 4;
const EXIT_NO_PAIRS: u8 = 5;

#[derive(Parser)]
#[command(name = "hedgerow", about = "Cross-venue market-hedging engine")]
pub struct Cli {
    /// Directory containing default.toml / {env}.toml / local.toml.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    /// Optional environment overlay name.
    #[arg(long)]
    env: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the live hedging engine until interrupted.
    Run,
    /// Fetch both books for every enabled pair and report OK/FAIL.
    Health,
    /// Build and persist an order plan for a pair without placing anything.
    Simulate {
        pair: String,
        #[arg(long)]
        size: Option<Decimal>,
    },
}

pub async fn run(cli: Cli) -> ExitCode {
    let cfg = match load_config(&cli.config_dir, cli.env.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(err) = init_tracing(&cfg.log_level, cfg.log_path.as_deref()) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let pairs = match cfg.resolve_pairs() {
        Ok(pairs) => pairs,
        Err(ConfigError::NoAccounts) => {
            error!("no accounts loaded");
            return ExitCode::from(EXIT_NO_ACCOUNTS);
        }
        Err(ConfigError::NoEnabledPairs) => {
            error!("no enabled market pairs");
            return ExitCode::from(EXIT_NO_PAIRS);
        }
        Err(err) => {
            error!(error = %err, "invalid pair configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store = match live::open_store(&cfg.database.dsn) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, dsn = %cfg.database.dsn, "database unreachable");
            return ExitCode::from(EXIT_DATABASE);
        }
    };

    let result = match cli.command {
        Command::Run => live::run_live(cfg, pairs, store).await,
        Command::Health => live::run_health(cfg, pairs, store).await,
        Command::Simulate { ref pair, size } => {
            live::run_simulate(cfg, pairs, store, pair, size).await
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = ?err, "command failed");
            ExitCode::FAILURE
        }
    }
}
