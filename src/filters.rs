//! Exchange constraint resolution
//!
//! Every order parameter goes through the exchange's per-symbol granularity
//! rules before submission: quantities snap down to the LOT_SIZE step,
//! prices clamp into the PRICE_FILTER band and snap down to the tick grid.
//! A sell-stop trigger is never rounded up, so snapping cannot move a stop
//! closer to the market than requested.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::exchange::{Exchange, ExchangeError};
use crate::types::Symbol;

/// Validated per-symbol order granularity rules
#[derive(Debug, Clone, Copy)]
pub struct Constraints {
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub tick_size: f64,
}

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("symbol metadata for {symbol} is missing the {filter} filter")]
    ConstraintUnavailable { symbol: String, filter: &'static str },

    #[error("quantity {quantity} outside allowed range [{min}, {max}] after step rounding")]
    QuantityOutOfRange { quantity: f64, min: f64, max: f64 },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl ConstraintError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConstraintError::Exchange(e) if e.is_transient())
    }
}

/// Round a quantity down to the symbol's step grid.
///
/// Fails rather than clamps when the rounded quantity falls outside
/// `[min_qty, max_qty]` or rounds away entirely. Idempotent: feeding the
/// result back in returns it unchanged.
pub fn round_quantity(amount: f64, constraints: &Constraints) -> Result<f64, ConstraintError> {
    let stepped = floor_to_increment(amount, constraints.step_size);

    if stepped <= 0.0 || stepped < constraints.min_qty || stepped > constraints.max_qty {
        return Err(ConstraintError::QuantityOutOfRange {
            quantity: stepped,
            min: constraints.min_qty,
            max: constraints.max_qty,
        });
    }

    Ok(stepped)
}

/// Clamp a price into the symbol's allowed band and round down to the tick
/// grid. Rounding is always toward zero so a sell-stop trigger can only end
/// up at or below the requested level.
pub fn clamp_price(price: f64, constraints: &Constraints) -> f64 {
    let clamped = price.clamp(constraints.min_price, constraints.max_price);
    floor_to_increment(clamped, constraints.tick_size)
}

/// Largest multiple of `increment` not exceeding `value`.
///
/// The ratio is nudged by one part in 1e9 before flooring; without it a value
/// already sitting on the grid ("0.299" with step "0.001") floors one step
/// low from binary representation error, which would break idempotence.
fn floor_to_increment(value: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return value;
    }

    let ratio = value / increment;
    let steps = (ratio + ratio.abs() * 1e-9 + 1e-9).floor();
    round_to_decimals(steps * increment, increment_decimals(increment))
}

/// Number of significant decimal places in an increment like 0.00100000
fn increment_decimals(increment: f64) -> u32 {
    let formatted = format!("{:.8}", increment);
    match formatted.split_once('.') {
        Some((_, frac)) => frac.trim_end_matches('0').len() as u32,
        None => 0,
    }
}

fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Lazily fetches and caches per-symbol constraints for the run
pub struct ConstraintResolver {
    exchange: Arc<dyn Exchange>,
    cache: RwLock<HashMap<Symbol, Constraints>>,
}

impl ConstraintResolver {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        ConstraintResolver {
            exchange,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve constraints for a symbol, fetching metadata on first use
    pub async fn resolve(&self, symbol: &Symbol) -> Result<Constraints, ConstraintError> {
        if let Some(constraints) = self.cache.read().await.get(symbol) {
            return Ok(*constraints);
        }

        let filters = self.exchange.get_symbol_filters(symbol).await?;

        let lot = filters
            .lot_size
            .ok_or_else(|| ConstraintError::ConstraintUnavailable {
                symbol: symbol.to_string(),
                filter: "LOT_SIZE",
            })?;
        let band = filters
            .price_filter
            .ok_or_else(|| ConstraintError::ConstraintUnavailable {
                symbol: symbol.to_string(),
                filter: "PRICE_FILTER",
            })?;

        let constraints = Constraints {
            min_qty: lot.min_qty,
            max_qty: lot.max_qty,
            step_size: lot.step_size,
            min_price: band.min_price,
            max_price: band.max_price,
            tick_size: band.tick_size,
        };

        debug!(
            "Resolved constraints for {}: step={} tick={}",
            symbol, constraints.step_size, constraints.tick_size
        );

        self.cache.write().await.insert(symbol.clone(), constraints);
        Ok(constraints)
    }
}
