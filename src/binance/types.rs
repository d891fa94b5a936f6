//! Binance API wire types
//!
//! Klines arrive as positional JSON arrays, symbol filters as a typed list
//! under `exchangeInfo`, and order endpoints as flat JSON objects with
//! string-encoded decimals.

use serde::Deserialize;

use crate::exchange::{
    ExchangeError, LotSize, OrderFill, OrderResult, OrderState, OrderStatus, PriceBand,
    SymbolFilters,
};

/// Binance kline/candlestick data
/// API returns an array: [open_time, open, high, low, close, volume, close_time,
///                        quote_volume, trades, taker_buy_base, taker_buy_quote, ignore]
#[derive(Debug, Clone)]
pub struct BinanceKline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl BinanceKline {
    /// Parse from raw JSON array returned by Binance API
    pub fn from_raw(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 7 {
            return None;
        }

        Some(BinanceKline {
            open_time: raw[0].as_i64()?,
            open: raw[1].as_str()?.parse().ok()?,
            high: raw[2].as_str()?.parse().ok()?,
            low: raw[3].as_str()?.parse().ok()?,
            close: raw[4].as_str()?.parse().ok()?,
            volume: raw[5].as_str()?.parse().ok()?,
            close_time: raw[6].as_i64()?,
        })
    }
}

/// Error payload returned by Binance on non-2xx responses
#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: i64,
    pub msg: String,
}

impl ApiError {
    /// Map a Binance error code to the client error taxonomy
    pub fn into_exchange_error(self, http_status: u16) -> ExchangeError {
        match (http_status, self.code) {
            (429, _) | (418, _) | (_, -1003) => ExchangeError::RateLimited(self.msg),
            (_, -2010) | (_, -2019) => ExchangeError::InsufficientBalance(self.msg),
            (_, -1121) => ExchangeError::UnknownSymbol(self.msg),
            (_, -2013) => ExchangeError::OrderNotFound(self.msg),
            (s, _) if s >= 500 => ExchangeError::Network(format!("HTTP {}: {}", s, self.msg)),
            _ => ExchangeError::InvalidRequest(format!("code {}: {}", self.code, self.msg)),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub filters: Vec<RawFilter>,
}

/// One entry of the per-symbol `filters` array; only the categories the bot
/// needs are modeled, the rest deserialize into `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum RawFilter {
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "minQty")]
        min_qty: String,
        #[serde(rename = "maxQty")]
        max_qty: String,
        #[serde(rename = "stepSize")]
        step_size: String,
    },
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter {
        #[serde(rename = "minPrice")]
        min_price: String,
        #[serde(rename = "maxPrice")]
        max_price: String,
        #[serde(rename = "tickSize")]
        tick_size: String,
    },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    pub fn into_filters(self) -> SymbolFilters {
        let mut result = SymbolFilters::default();

        for filter in self.filters {
            match filter {
                RawFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size,
                } => {
                    if let (Ok(min), Ok(max), Ok(step)) =
                        (min_qty.parse(), max_qty.parse(), step_size.parse())
                    {
                        result.lot_size = Some(LotSize {
                            min_qty: min,
                            max_qty: max,
                            step_size: step,
                        });
                    }
                }
                RawFilter::PriceFilter {
                    min_price,
                    max_price,
                    tick_size,
                } => {
                    if let (Ok(min), Ok(max), Ok(tick)) =
                        (min_price.parse(), max_price.parse(), tick_size.parse())
                    {
                        result.price_filter = Some(PriceBand {
                            min_price: min,
                            max_price: max,
                            tick_size: tick,
                        });
                    }
                }
                RawFilter::Other => {}
            }
        }

        result
    }
}

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "orderId")]
    pub order_id: i64,
    pub status: String,
    #[serde(rename = "executedQty", default)]
    pub executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty", default)]
    pub cumulative_quote_qty: String,
    #[serde(default)]
    pub fills: Vec<FillResponse>,
}

#[derive(Debug, Deserialize)]
pub struct FillResponse {
    pub price: String,
    pub qty: String,
}

pub fn parse_order_state(status: &str) -> Result<OrderState, ExchangeError> {
    match status {
        "NEW" => Ok(OrderState::New),
        "PARTIALLY_FILLED" => Ok(OrderState::PartiallyFilled),
        "FILLED" => Ok(OrderState::Filled),
        "CANCELED" | "PENDING_CANCEL" => Ok(OrderState::Canceled),
        "REJECTED" => Ok(OrderState::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderState::Expired),
        other => Err(ExchangeError::Parse(format!("unknown order status {other}"))),
    }
}

impl OrderResponse {
    pub fn into_order_result(self) -> Result<OrderResult, ExchangeError> {
        let state = parse_order_state(&self.status)?;
        let executed_qty = self.executed_qty.parse().unwrap_or(0.0);

        let fills = self
            .fills
            .iter()
            .filter_map(|f| {
                Some(OrderFill {
                    price: f.price.parse().ok()?,
                    quantity: f.qty.parse().ok()?,
                })
            })
            .collect();

        Ok(OrderResult {
            order_id: self.order_id.to_string(),
            state,
            executed_qty,
            fills,
        })
    }

    pub fn into_order_status(self) -> Result<OrderStatus, ExchangeError> {
        let state = parse_order_state(&self.status)?;
        Ok(OrderStatus {
            order_id: self.order_id.to_string(),
            state,
            executed_qty: self.executed_qty.parse().unwrap_or(0.0),
            cumulative_quote_qty: self.cumulative_quote_qty.parse().unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AccountResponse {
    pub balances: Vec<BalanceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub free: String,
}

/// Valid Binance intervals
pub const BINANCE_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

/// Check if interval is valid for Binance
pub fn is_valid_interval(interval: &str) -> bool {
    BINANCE_INTERVALS.contains(&interval)
}
