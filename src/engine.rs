//! Loop drivers
//!
//! Two independent control loops share the position store: the evaluation
//! loop opens positions on a coarse interval, the monitor loop manages open
//! positions on a fine one. Both are driven by `tokio::time::interval`
//! tickers racing a shutdown watch channel, so a ctrl-c stops them between
//! actions: in-flight exchange calls finish, no new submissions start.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::exchange::Exchange;
use crate::executor::{ExecutorError, OrderExecutor};
use crate::filters::ConstraintResolver;
use crate::monitor::Monitor;
use crate::notify::Notifier;
use crate::signal::SignalGenerator;
use crate::store::PositionStore;
use crate::types::Symbol;

/// Wires the components together and drives the two loops
pub struct Engine {
    config: Arc<Config>,
    exchange: Arc<dyn Exchange>,
    store: Arc<PositionStore>,
    signal: SignalGenerator,
    executor: OrderExecutor,
    monitor: Monitor,
    notifier: Notifier,
    shutdown: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(
        config: Config,
        exchange: Arc<dyn Exchange>,
        store: Arc<PositionStore>,
        notifier: Notifier,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let config = Arc::new(config);
        let resolver = Arc::new(ConstraintResolver::new(exchange.clone()));

        let executor = OrderExecutor::new(
            exchange.clone(),
            resolver.clone(),
            store.clone(),
            notifier.clone(),
            config.clone(),
        );
        let monitor = Monitor::new(
            exchange.clone(),
            resolver,
            store.clone(),
            notifier.clone(),
            config.clone(),
        );
        let signal = SignalGenerator::new(config.signal.clone());

        Engine {
            config,
            exchange,
            store,
            signal,
            executor,
            monitor,
            notifier,
            shutdown,
        }
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    /// Run both loops until the shutdown channel flips
    pub async fn run(&self) -> Result<()> {
        let trading = &self.config.trading;
        info!(
            "Engine starting: {} symbols, evaluate every {}s, monitor every {}s",
            trading.symbols.len(),
            trading.evaluate_interval_secs,
            trading.monitor_interval_secs
        );
        self.notifier.notify(format!(
            "Trailbot started: watching {}",
            trading.symbols.join(", ")
        ));

        tokio::join!(self.evaluation_loop(), self.monitor_loop());

        self.notifier.notify("Trailbot stopped");
        info!("Engine stopped");
        Ok(())
    }

    async fn evaluation_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(Duration::from_secs(
            self.config.trading.evaluate_interval_secs,
        ));
        let mut cycles: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }

                    self.evaluation_cycle().await;

                    cycles += 1;
                    let heartbeat = self.config.trading.heartbeat_cycles;
                    if heartbeat > 0 && cycles % heartbeat == 0 {
                        self.notifier.notify("Heartbeat - bot is alive");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!("Evaluation loop exited");
    }

    async fn monitor_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = interval(Duration::from_secs(
            self.config.trading.monitor_interval_secs,
        ));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.monitor.sweep().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        debug!("Monitor loop exited");
    }

    /// One pass over the configured symbols. A failure on one symbol never
    /// halts the batch.
    pub async fn evaluation_cycle(&self) {
        for symbol in self.config.trading.symbols() {
            if *self.shutdown.borrow() {
                debug!("Shutdown requested, not evaluating remaining symbols");
                break;
            }

            match self.evaluate_symbol(&symbol).await {
                Ok(true) => {}
                Ok(false) => debug!("No entry for {}", symbol),
                Err(ExecutorError::BelowMinNotional {
                    available,
                    required,
                }) => {
                    info!(
                        "Skipping {}: notional {:.2} below minimum {:.2}",
                        symbol, available, required
                    );
                }
                Err(e) if e.is_transient() => {
                    warn!("Transient error evaluating {}, retrying next cycle: {}", symbol, e);
                }
                Err(e) => {
                    error!("Error evaluating {}: {}", symbol, e);
                }
            }
        }
    }

    /// Evaluate the entry signal for one symbol, opening a position when it
    /// fires. Returns whether a position was opened.
    pub async fn evaluate_symbol(&self, symbol: &Symbol) -> Result<bool, ExecutorError> {
        if self.store.open_position_for(symbol)?.is_some() {
            debug!("{} already has an open position", symbol);
            return Ok(false);
        }

        let trading = &self.config.trading;
        let candles = self
            .exchange
            .get_candles(symbol, &trading.candle_interval, trading.history_limit)
            .await?;

        if !self.signal.evaluate(&candles) {
            return Ok(false);
        }

        let reference_price = candles
            .last()
            .map(|c| c.close)
            .expect("signal cannot fire on an empty series");

        info!("🚀 Buy signal for {} @ {:.8}", symbol, reference_price);
        self.executor.open_position(symbol, reference_price).await?;
        Ok(true)
    }
}
