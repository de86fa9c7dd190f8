//! VPP trading core - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Replay a strategy against historical tick data
//! - settle: Run a period settlement against the SQLite store

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "vpp-trading")]
#[command(about = "VPP energy trading: strategy backtesting and settlement", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a strategy backtest over historical ticks
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// Market to replay
        #[arg(short, long, default_value = "GRID-NORTH")]
        market: String,

        /// Tick CSV file (defaults to {data_dir}/{market}.csv)
        #[arg(short, long)]
        ticks: Option<String>,

        /// Initial capital (overrides config)
        #[arg(long)]
        capital: Option<f64>,
    },

    /// Settle one VPP for a closed period
    Settle {
        /// SQLite database path
        #[arg(long, default_value = "vpp.db")]
        db: String,

        /// VPP identifier
        #[arg(long)]
        vpp_id: String,

        /// Period label: YYYY-MM-DD (day) or YYYY-MM (month)
        #[arg(long)]
        period: String,

        /// Distribution policy (CAPACITY_WEIGHTED, CONTRIBUTION_WEIGHTED, EQUAL_SHARE)
        #[arg(long)]
        policy: Option<String>,

        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Backtest {
            config,
            market,
            ticks,
            capital,
        } => commands::backtest::run(config, market, ticks, capital),

        Commands::Settle {
            db,
            vpp_id,
            period,
            policy,
            config,
        } => commands::settle::run(db, vpp_id, period, policy, config),
    }
}
