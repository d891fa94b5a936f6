//! Trailbot
//!
//! An automated spot trading bot. Entries come from a MACD-crossover buy
//! signal confirmed by an RSI band; every filled entry is immediately covered
//! by a protective stop-loss order that a concurrent monitor loop ratchets
//! upward as price rises, until the stop fills and the position closes.
//!
//! Positions survive restarts: they live in a SQLite store and the monitor
//! picks up whatever is open when the process comes back.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use trailbot::{BinanceClient, Config, Engine, Notifier, PositionStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.json")?;
//!     let exchange = Arc::new(BinanceClient::from_config(&config.exchange));
//!     let store = Arc::new(PositionStore::open("positions.db")?);
//!     let notifier = Notifier::new(config.telegram.as_ref());
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     Engine::new(config, exchange, store, notifier, shutdown_rx)
//!         .run()
//!         .await
//! }
//! ```

pub mod binance;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod executor;
pub mod filters;
pub mod monitor;
pub mod notify;
pub mod signal;
pub mod store;
pub mod types;

pub use binance::BinanceClient;
pub use config::Config;
pub use engine::Engine;
pub use exchange::{Exchange, ExchangeError};
pub use executor::OrderExecutor;
pub use filters::ConstraintResolver;
pub use monitor::Monitor;
pub use notify::Notifier;
pub use signal::SignalGenerator;
pub use store::{Position, PositionStatus, PositionStore};
pub use types::{Candle, Side, Symbol};
