//! Trailing-stop monitor
//!
//! The fine-interval control loop over open positions. Each sweep spawns one
//! task per position so a stalled exchange call on one symbol cannot hold up
//! the rest. Per position and per tick:
//!
//! 1. No protective order recorded: place one at the stored stop and stop
//!    there for this tick. "No protective order" is a recoverable state, not
//!    an error.
//! 2. Protective order filled: finalize the position with realized PnL.
//! 3. Otherwise, for trailing policies, ratchet: when the latest price puts
//!    the ideal trigger strictly above the stored stop, cancel the resting
//!    order, place the replacement, and record both through a conditional
//!    store update keyed on the order id this tick observed. The
//!    cancel/replace pair is not atomic at the exchange; a failure between
//!    the two legs leaves the position unprotected and step 1 repairs it on
//!    the next sweep.
//!
//! Every store write is conditional on what this tick observed, so two
//! overlapping evaluations of the same position resolve to exactly one
//! winner; the loser cancels whatever order it placed.
//!
//! A failure while checking one position never aborts the sweep.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exchange::{Exchange, ExchangeError, OrderState, OrderStatus};
use crate::filters::{clamp_price, round_quantity, ConstraintError, ConstraintResolver};
use crate::notify::Notifier;
use crate::store::{Position, PositionStore, StoreError};
use crate::types::{Side, Symbol};

/// Interval used for the latest-price read
const PRICE_INTERVAL: &str = "1m";

#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TickError {
    pub fn is_transient(&self) -> bool {
        match self {
            TickError::Exchange(e) => e.is_transient(),
            TickError::Constraint(c) => c.is_transient(),
            TickError::Store(_) => false,
        }
    }
}

/// The per-position lifecycle monitor
#[derive(Clone)]
pub struct Monitor {
    exchange: Arc<dyn Exchange>,
    resolver: Arc<ConstraintResolver>,
    store: Arc<PositionStore>,
    notifier: Notifier,
    config: Arc<Config>,
}

impl Monitor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        resolver: Arc<ConstraintResolver>,
        store: Arc<PositionStore>,
        notifier: Notifier,
        config: Arc<Config>,
    ) -> Self {
        Monitor {
            exchange,
            resolver,
            store,
            notifier,
            config,
        }
    }

    /// One pass over every open position. Individual failures are reported
    /// and isolated; the sweep always completes.
    pub async fn sweep(&self) {
        let positions = match self.store.open_positions() {
            Ok(positions) => positions,
            Err(e) => {
                error!("Failed to load open positions: {}", e);
                self.notifier
                    .notify_urgent(format!("Monitor cannot read the position store: {}", e));
                return;
            }
        };

        if positions.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for position in positions {
            let monitor = self.clone();
            tasks.spawn(async move {
                let symbol = position.symbol();
                let id = position.id;
                if let Err(e) = monitor.check_position(position).await {
                    monitor.report_tick_error(&symbol, id, e);
                }
            });
        }

        while tasks.join_next().await.is_some() {}
    }

    fn report_tick_error(&self, symbol: &Symbol, position_id: i64, e: TickError) {
        match &e {
            TickError::Store(store_err) => {
                error!(
                    "Persistence failure on {} position #{}: {}",
                    symbol, position_id, store_err
                );
                self.notifier.notify_urgent(format!(
                    "Persistence failure on {} position #{}: {}",
                    symbol, position_id, store_err
                ));
            }
            _ if e.is_transient() => {
                warn!(
                    "Transient error on {} position #{}, retrying next tick: {}",
                    symbol, position_id, e
                );
            }
            _ => {
                error!("Error on {} position #{}: {}", symbol, position_id, e);
                self.notifier.notify(format!(
                    "⚠️ Monitor error on {} position #{}: {}",
                    symbol, position_id, e
                ));
            }
        }
    }

    /// Evaluate a single open position for this tick
    pub async fn check_position(&self, position: Position) -> Result<(), TickError> {
        let symbol = position.symbol();

        let Some(order_id) = position.protective_order_id.clone() else {
            return self.restore_protection(&position).await;
        };

        let status = match self.exchange.get_order(&symbol, &order_id).await {
            Ok(status) => status,
            Err(ExchangeError::OrderNotFound(_)) => {
                warn!(
                    "Protective order {} for {} not found at exchange; re-placing",
                    order_id, symbol
                );
                if self.store.clear_protective_order(position.id, &order_id)? {
                    return self.restore_protection(&position).await;
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if status.state == OrderState::Filled {
            return self.finalize(&position, &status);
        }

        if !status.state.is_live() {
            warn!(
                "Protective order {} for {} is {:?}; re-placing",
                order_id, symbol, status.state
            );
            if self.store.clear_protective_order(position.id, &order_id)? {
                return self.restore_protection(&position).await;
            }
            return Ok(());
        }

        let policy = self.config.trading.symbol_config(&symbol).protection;
        if !policy.is_trailing() {
            return Ok(());
        }

        self.ratchet(&position, &order_id, policy.fraction()).await
    }

    /// Trailing evaluation: cancel-then-replace when the candidate trigger
    /// strictly exceeds the stored stop
    async fn ratchet(
        &self,
        position: &Position,
        live_order_id: &str,
        fraction: f64,
    ) -> Result<(), TickError> {
        let symbol = position.symbol();

        let price = self.latest_price(&symbol).await?;
        let constraints = self.resolver.resolve(&symbol).await?;
        let candidate = clamp_price(price * (1.0 - fraction), &constraints);

        if candidate <= position.stop_price {
            return Ok(());
        }

        self.exchange.cancel_order(&symbol, live_order_id).await?;

        let quantity = round_quantity(position.quantity, &constraints)?;
        let replacement = match self
            .exchange
            .submit_stop_order(&symbol, Side::Sell, quantity, candidate)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.store
                    .clear_protective_order(position.id, live_order_id)?;
                self.notifier.notify(format!(
                    "⚠️ {} stop replacement failed, position #{} temporarily unprotected: {}",
                    symbol, position.id, e
                ));
                return Err(e.into());
            }
        };

        let applied = self.store.ratchet_stop(
            position.id,
            candidate,
            live_order_id,
            &replacement.order_id,
        )?;

        if applied {
            info!(
                "📈 Trailing stop for {} ratcheted {:.8} -> {:.8}",
                symbol, position.stop_price, candidate
            );
        } else {
            warn!(
                "Ratchet on {} position #{} lost to a concurrent update; cancelling order {}",
                symbol, position.id, replacement.order_id
            );
            if let Err(e) = self
                .exchange
                .cancel_order(&symbol, &replacement.order_id)
                .await
            {
                warn!(
                    "Could not cancel superseded order {}: {}",
                    replacement.order_id, e
                );
            }
        }

        Ok(())
    }

    /// Place a protective stop for a position that has none recorded
    async fn restore_protection(&self, position: &Position) -> Result<(), TickError> {
        let symbol = position.symbol();
        let constraints = self.resolver.resolve(&symbol).await?;

        let trigger = clamp_price(position.stop_price, &constraints);
        let quantity = round_quantity(position.quantity, &constraints)?;

        let order = self
            .exchange
            .submit_stop_order(&symbol, Side::Sell, quantity, trigger)
            .await?;

        if !self
            .store
            .attach_protective_order(position.id, &order.order_id)?
        {
            warn!(
                "Protection for {} position #{} was restored elsewhere; cancelling order {}",
                symbol, position.id, order.order_id
            );
            if let Err(e) = self.exchange.cancel_order(&symbol, &order.order_id).await {
                warn!("Could not cancel redundant order {}: {}", order.order_id, e);
            }
            return Ok(());
        }

        info!(
            "🛡️ Protective stop restored for {} position #{} @ {:.8}",
            symbol, position.id, trigger
        );
        self.notifier.notify(format!(
            "Protective stop restored for {} @ {:.8}",
            symbol, trigger
        ));

        Ok(())
    }

    /// Close out a position whose protective order filled
    fn finalize(&self, position: &Position, status: &OrderStatus) -> Result<(), TickError> {
        let fill_price = status.fill_price().unwrap_or(position.stop_price);
        let realized_pnl = (fill_price - position.entry_price) * position.quantity;
        let realized_pnl_pct = if position.entry_price > 0.0 {
            (fill_price - position.entry_price) / position.entry_price * 100.0
        } else {
            0.0
        };

        let closed = self
            .store
            .close(position.id, realized_pnl, realized_pnl_pct)?;

        if closed {
            let symbol = position.symbol();
            let emoji = if realized_pnl > 0.0 { "✅" } else { "❌" };
            info!(
                "{} CLOSE {} qty={:.8} entry={:.8} exit={:.8} | PnL={:+.8} ({:+.2}%)",
                emoji,
                symbol,
                position.quantity,
                position.entry_price,
                fill_price,
                realized_pnl,
                realized_pnl_pct
            );
            self.notifier.notify(format!(
                "Closed {} qty {:.8}: entry {:.8} exit {:.8}, PnL {:+.8} ({:+.2}%)",
                symbol,
                position.quantity,
                position.entry_price,
                fill_price,
                realized_pnl,
                realized_pnl_pct
            ));
        }

        Ok(())
    }

    async fn latest_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        let candles = self.exchange.get_candles(symbol, PRICE_INTERVAL, 2).await?;
        candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| ExchangeError::Parse(format!("no candles returned for {}", symbol)))
    }
}
