//! Order execution
//!
//! Opens positions: sizes the entry from the free quote balance, rounds it
//! through the exchange constraints, submits the market buy, then attaches
//! the initial protective stop. The entry fill and the protective placement
//! are separate exchange calls with no atomicity between them; when the
//! protective leg fails the position is still recorded (unprotected) so the
//! monitor can repair it. A filled entry is never left untracked.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exchange::{Exchange, ExchangeError};
use crate::filters::{clamp_price, round_quantity, ConstraintError, ConstraintResolver};
use crate::notify::Notifier;
use crate::store::{NewPosition, Position, PositionStore, StoreError};
use crate::types::{Side, Symbol};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("available notional {available:.2} below minimum {required:.2}")]
    BelowMinNotional { available: f64, required: f64 },

    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Exchange(e) => e.is_transient(),
            ExecutorError::Constraint(c) => c.is_transient(),
            _ => false,
        }
    }
}

/// Opens positions and records them in the store
pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    resolver: Arc<ConstraintResolver>,
    store: Arc<PositionStore>,
    notifier: Notifier,
    config: Arc<Config>,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        resolver: Arc<ConstraintResolver>,
        store: Arc<PositionStore>,
        notifier: Notifier,
        config: Arc<Config>,
    ) -> Self {
        OrderExecutor {
            exchange,
            resolver,
            store,
            notifier,
            config,
        }
    }

    /// Open a long position on `symbol` around the given reference price.
    ///
    /// On success the returned position is persisted; it may be unprotected
    /// (no protective order id) when the stop placement leg failed, in which
    /// case an urgent notification has already been emitted and the monitor
    /// takes over the repair.
    pub async fn open_position(
        &self,
        symbol: &Symbol,
        reference_price: f64,
    ) -> Result<Position, ExecutorError> {
        let trading = &self.config.trading;
        let symbol_cfg = trading.symbol_config(symbol);

        let free = self
            .exchange
            .get_balance(&trading.quote_asset)
            .await?;
        let notional = symbol_cfg.sizing.notional(free).min(free);

        if notional < trading.min_notional {
            return Err(ExecutorError::BelowMinNotional {
                available: notional,
                required: trading.min_notional,
            });
        }

        let constraints = self.resolver.resolve(symbol).await?;
        let quantity = round_quantity(notional / reference_price, &constraints)?;

        let entry = match self
            .exchange
            .submit_market_order(symbol, Side::Buy, quantity)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                if e.is_transient() {
                    warn!("Entry order for {} failed transiently: {}", symbol, e);
                } else {
                    error!("Entry order for {} rejected: {}", symbol, e);
                    self.notifier
                        .notify(format!("⚠️ Entry order failed for {}: {}", symbol, e));
                }
                return Err(e.into());
            }
        };

        let filled_qty = if entry.executed_qty > 0.0 {
            entry.executed_qty
        } else {
            quantity
        };
        let entry_price = entry.weighted_fill_price().unwrap_or(reference_price);

        let fraction = symbol_cfg.protection.fraction();
        let stop_price = clamp_price(entry_price * (1.0 - fraction), &constraints);

        let protective_order_id = match self
            .place_protective(symbol, filled_qty, stop_price, &constraints)
            .await
        {
            Ok(order_id) => Some(order_id),
            Err(e) => {
                self.notifier.notify_urgent(format!(
                    "{} entry filled ({:.8} @ {:.8}) but protective stop placement failed: {}. \
                     Position recorded unprotected; monitor will retry.",
                    symbol, filled_qty, entry_price, e
                ));
                None
            }
        };

        let new_position = NewPosition {
            symbol: symbol.as_str().to_string(),
            quantity: filled_qty,
            entry_price,
            stop_price,
            protective_order_id: protective_order_id.clone(),
        };

        let position = match self.store.insert(&new_position) {
            Ok(p) => p,
            Err(e) => {
                self.notifier.notify_urgent(format!(
                    "{} entry filled ({:.8} @ {:.8}) but the position could not be persisted: {}",
                    symbol, filled_qty, entry_price, e
                ));
                return Err(e.into());
            }
        };

        info!(
            "📈 LONG {} qty={:.8} @ {:.8} | stop={:.8} order={}",
            symbol,
            filled_qty,
            entry_price,
            stop_price,
            protective_order_id.as_deref().unwrap_or("<none>")
        );
        self.notifier.notify(format!(
            "Opened {} qty {:.8} @ {:.8}, stop {:.8}",
            symbol, filled_qty, entry_price, stop_price
        ));

        Ok(position)
    }

    async fn place_protective(
        &self,
        symbol: &Symbol,
        quantity: f64,
        trigger_price: f64,
        constraints: &crate::filters::Constraints,
    ) -> Result<String, ExecutorError> {
        let quantity = round_quantity(quantity, constraints)?;
        let order = self
            .exchange
            .submit_stop_order(symbol, Side::Sell, quantity, trigger_price)
            .await?;
        Ok(order.order_id)
    }
}
