//! Exchange client seam
//!
//! Everything the bot needs from the remote exchange sits behind the
//! [`Exchange`] trait so the engine can run against the real REST client or
//! a scripted test double. Errors carry a transient/terminal distinction:
//! transient failures are retried on the next scheduled tick, terminal ones
//! abandon the current action without touching recorded state.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Candle, Side, Symbol};

/// Exchange API failure taxonomy
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("malformed response: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Transient errors are worth retrying on the next tick; terminal errors
    /// abandon the current action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited(_) | ExchangeError::Network(_) | ExchangeError::Timeout(_)
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

/// Exchange-reported order state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderState {
    /// Still resting on the book, may fill later
    pub fn is_live(&self) -> bool {
        matches!(self, OrderState::New | OrderState::PartiallyFilled)
    }
}

/// A single fill reported with an order response
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub price: f64,
    pub quantity: f64,
}

/// Result of submitting an order
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub order_id: String,
    pub state: OrderState,
    pub executed_qty: f64,
    pub fills: Vec<OrderFill>,
}

impl OrderResult {
    /// Quantity-weighted average price across fills
    pub fn weighted_fill_price(&self) -> Option<f64> {
        let total_qty: f64 = self.fills.iter().map(|f| f.quantity).sum();
        if total_qty <= 0.0 {
            return None;
        }
        let total_value: f64 = self.fills.iter().map(|f| f.price * f.quantity).sum();
        Some(total_value / total_qty)
    }
}

/// Status snapshot of a resting order
#[derive(Debug, Clone)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    pub executed_qty: f64,
    pub cumulative_quote_qty: f64,
}

impl OrderStatus {
    /// Average fill price, when anything has executed
    pub fn fill_price(&self) -> Option<f64> {
        if self.executed_qty > 0.0 && self.cumulative_quote_qty > 0.0 {
            Some(self.cumulative_quote_qty / self.executed_qty)
        } else {
            None
        }
    }
}

/// Quantity granularity rules for a symbol (LOT_SIZE filter)
#[derive(Debug, Clone, Copy)]
pub struct LotSize {
    pub min_qty: f64,
    pub max_qty: f64,
    pub step_size: f64,
}

/// Price granularity rules for a symbol (PRICE_FILTER)
#[derive(Debug, Clone, Copy)]
pub struct PriceBand {
    pub min_price: f64,
    pub max_price: f64,
    pub tick_size: f64,
}

/// Raw per-symbol filter metadata as reported by the exchange; either
/// category may be absent from the listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolFilters {
    pub lot_size: Option<LotSize>,
    pub price_filter: Option<PriceBand>,
}

/// Interface to the remote exchange
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Fetch recent candles, oldest first
    async fn get_candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Fetch quantity/price granularity metadata for a symbol
    async fn get_symbol_filters(&self, symbol: &Symbol) -> Result<SymbolFilters, ExchangeError>;

    /// Submit a market order for `quantity` of the base asset
    async fn submit_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError>;

    /// Submit a stop-loss-limit order triggering at `trigger_price`
    async fn submit_stop_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderResult, ExchangeError>;

    /// Cancel a resting order
    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError>;

    /// Query the status of an order
    async fn get_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<OrderStatus, ExchangeError>;

    /// Free balance of an asset
    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ExchangeError::RateLimited("429".into()).is_transient());
        assert!(ExchangeError::Network("reset".into()).is_transient());
        assert!(ExchangeError::Timeout("30s".into()).is_transient());
        assert!(!ExchangeError::InvalidRequest("bad qty".into()).is_transient());
        assert!(!ExchangeError::InsufficientBalance("USDT".into()).is_transient());
        assert!(!ExchangeError::UnknownSymbol("NOPEUSDT".into()).is_transient());
    }

    #[test]
    fn test_weighted_fill_price() {
        let result = OrderResult {
            order_id: "1".into(),
            state: OrderState::Filled,
            executed_qty: 3.0,
            fills: vec![
                OrderFill {
                    price: 100.0,
                    quantity: 1.0,
                },
                OrderFill {
                    price: 103.0,
                    quantity: 2.0,
                },
            ],
        };
        assert_eq!(result.weighted_fill_price(), Some(102.0));
    }

    #[test]
    fn test_weighted_fill_price_empty() {
        let result = OrderResult {
            order_id: "1".into(),
            state: OrderState::New,
            executed_qty: 0.0,
            fills: vec![],
        };
        assert_eq!(result.weighted_fill_price(), None);
    }

    #[test]
    fn test_order_status_fill_price() {
        let status = OrderStatus {
            order_id: "7".into(),
            state: OrderState::Filled,
            executed_qty: 2.0,
            cumulative_quote_qty: 209.0,
        };
        assert_eq!(status.fill_price(), Some(104.5));

        let unfilled = OrderStatus {
            order_id: "8".into(),
            state: OrderState::New,
            executed_qty: 0.0,
            cumulative_quote_qty: 0.0,
        };
        assert_eq!(unfilled.fill_price(), None);
    }
}
