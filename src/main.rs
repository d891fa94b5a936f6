//! Trailbot - main entry point
//!
//! Subcommands:
//! - run: start the trading engine (evaluation + monitor loops)
//! - positions: list recorded positions from the state database

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trailbot::{BinanceClient, Config, Engine, Notifier, PositionStore};

#[derive(Parser, Debug)]
#[command(name = "trailbot")]
#[command(about = "Automated spot trading bot with trailing stop-loss management", long_about = None)]
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
    /// Run the trading engine (CAUTION - places real orders)
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// State database path
        #[arg(long, default_value = "positions.db")]
        state_db: String,

        /// Skip the startup countdown
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List recorded positions
    Positions {
        /// State database path
        #[arg(long, default_value = "positions.db")]
        state_db: String,

        /// Include closed positions
        #[arg(short, long)]
        all: bool,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Positions { .. } => "positions",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            config,
            state_db,
            yes,
        } => run(config, state_db, yes).await,
        Commands::Positions { state_db, all } => list_positions(state_db, all),
    }
}

async fn run(config_path: String, state_db: String, skip_countdown: bool) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    info!("╔══════════════════════════════════════════════════╗");
    info!("║                    TRAILBOT                      ║");
    info!("╠══════════════════════════════════════════════════╣");
    info!("║ Symbols: {:<40}║", config.trading.symbols.join(", "));
    info!("║ Candle interval: {:<32}║", config.trading.candle_interval);
    info!(
        "║ Evaluate every {}s, monitor every {}s{:<12}║",
        config.trading.evaluate_interval_secs, config.trading.monitor_interval_secs, ""
    );
    info!("╚══════════════════════════════════════════════════╝");

    if config.exchange.api_key.is_none() || config.exchange.api_secret.is_none() {
        anyhow::bail!(
            "Missing API credentials: set BINANCE_API_KEY and BINANCE_API_SECRET \
             or provide them in the config file"
        );
    }

    if !trailbot::binance::types::is_valid_interval(&config.trading.candle_interval) {
        anyhow::bail!("Invalid candle interval: {}", config.trading.candle_interval);
    }

    if !skip_countdown {
        warn!("⚠️  LIVE TRADING - REAL MONEY AT RISK!");
        warn!("⚠️  Press Ctrl+C within 10 seconds to abort...");
        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let exchange = Arc::new(BinanceClient::from_config(&config.exchange));
    let store = Arc::new(PositionStore::open(&state_db)?);
    let notifier = Notifier::new(config.telegram.as_ref());

    let open = store.open_positions()?;
    if !open.is_empty() {
        info!("Recovered {} open position(s) from {}", open.len(), state_db);
        for position in &open {
            info!(
                "  #{} {} qty={:.8} entry={:.8} stop={:.8} protective={}",
                position.id,
                position.symbol,
                position.quantity,
                position.entry_price,
                position.stop_price,
                position.protective_order_id.as_deref().unwrap_or("<none>")
            );
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Error setting up signal handler: {}", e),
        }
    });

    let engine = Engine::new(config, exchange, store, notifier, shutdown_rx);
    engine.run().await?;

    info!("Trading session ended.");
    Ok(())
}

fn list_positions(state_db: String, all: bool) -> Result<()> {
    let store = PositionStore::open(&state_db)?;
    let positions = if all {
        store.all_positions()?
    } else {
        store.open_positions()?
    };

    if positions.is_empty() {
        println!("No positions recorded.");
        return Ok(());
    }

    println!(
        "{:>5}  {:<12} {:>14} {:>14} {:>14}  {:<8} {:>12} {:>8}",
        "id", "symbol", "quantity", "entry", "stop", "status", "pnl", "pnl %"
    );
    for p in positions {
        println!(
            "{:>5}  {:<12} {:>14.8} {:>14.8} {:>14.8}  {:<8} {:>12} {:>8}",
            p.id,
            p.symbol,
            p.quantity,
            p.entry_price,
            p.stop_price,
            p.status.as_str(),
            p.realized_pnl
                .map(|v| format!("{:+.4}", v))
                .unwrap_or_else(|| "-".to_string()),
            p.realized_pnl_pct
                .map(|v| format!("{:+.2}", v))
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    Ok(())
}
