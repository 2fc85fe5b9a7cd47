//! Headless trading engine.
//!
//! The default mode runs the scheduled trading loop until Ctrl+C. The
//! `backtest` subcommand replays one market through a strategy (or the
//! combined vote) and prints the report as JSON, without touching the
//! scheduler.

use anyhow::{Context, Result};
use autocoin::application::backtest::{BacktestRequest, CandleSource, StrategySelection};
use autocoin::application::engine::Engine;
use autocoin::config::Config;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "autocoin", version, about = "Automated KRW-market trading engine")]
struct Args {
    /// Alternative .env file to load before reading configuration.
    #[arg(long)]
    env_file: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// One-shot backtest; prints the report as JSON and exits.
    Backtest {
        /// Market to replay, e.g. KRW-BTC.
        market: String,
        /// Strategy name, or COMBINED for majority voting.
        #[arg(long, default_value = "COMBINED")]
        strategy: String,
        /// Initial KRW balance.
        #[arg(long, default_value_t = 1_000_000)]
        balance: i64,
        /// Candle granularity in minutes.
        #[arg(long, default_value_t = 1)]
        unit: u32,
        /// Candle count (exchange source caps at 200).
        #[arg(long, default_value_t = 200)]
        count: usize,
        /// Read candles from the local store instead of the exchange.
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("autocoin {} starting", env!("CARGO_PKG_VERSION"));
    let config = Config::from_env().context("configuration failed")?;

    let engine = Engine::build(&config).await?;

    if let Some(Command::Backtest {
        market,
        strategy,
        balance,
        unit,
        count,
        local,
    }) = args.command
    {
        let selection = if strategy.eq_ignore_ascii_case("COMBINED") {
            StrategySelection::Combined
        } else {
            StrategySelection::Single(strategy)
        };
        let request = BacktestRequest {
            market,
            selection,
            initial_balance: Decimal::from(balance),
            unit,
            count,
            source: if local {
                CandleSource::LocalStore
            } else {
                CandleSource::Exchange
            },
            from: None,
            to: None,
            user_id: None,
        };
        let report = engine.backtest.run(&request).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let handle = engine.start();
    info!("engine running; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received; draining");
    engine.shutdown();
    handle.await.ok();
    info!("stopped");
    Ok(())
}
