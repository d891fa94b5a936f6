//! Binance REST client
//!
//! Public market-data endpoints need no credentials; order and account
//! endpoints are signed with HMAC-SHA256 over the query string. Idempotent
//! reads retry with exponential backoff on transient failures; order
//! submissions are sent exactly once and leave retrying to the caller's
//! next tick, so an ambiguous timeout can never double an entry.

use std::time::Duration as StdDuration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::types::{
    AccountResponse, ApiError, BinanceKline, ExchangeInfoResponse, OrderResponse,
};
use crate::config::ExchangeConfig;
use crate::exchange::{
    Exchange, ExchangeError, OrderResult, OrderStatus, SymbolFilters,
};
use crate::types::{Candle, Side, Symbol};

/// Base URL for the Binance REST API
pub const API_BASE_URL: &str = "https://api.binance.com";

type HmacSha256 = Hmac<Sha256>;

/// Binance exchange client
#[derive(Debug, Clone)]
pub struct BinanceClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    max_retries: u32,
}

impl BinanceClient {
    /// Create a client with API credentials and default settings
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_options(api_key, api_secret, API_BASE_URL, StdDuration::from_secs(30), 3)
    }

    /// Create a client from configuration
    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self::with_options(
            config.api_key.clone().unwrap_or_default(),
            config.api_secret.clone().unwrap_or_default(),
            config.base_url.as_deref().unwrap_or(API_BASE_URL),
            StdDuration::from_secs(config.timeout_secs),
            config.max_retries,
        )
    }

    fn with_options(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        base_url: &str,
        timeout: StdDuration,
        max_retries: u32,
    ) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");

        BinanceClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            max_retries,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<ApiError>(&body) {
                Ok(api_err) => api_err.into_exchange_error(status.as_u16()),
                Err(_) if status == StatusCode::TOO_MANY_REQUESTS => {
                    ExchangeError::RateLimited(body)
                }
                Err(_) if status.is_server_error() => {
                    ExchangeError::Network(format!("HTTP {}: {}", status, body))
                }
                Err(_) => ExchangeError::InvalidRequest(format!("HTTP {}: {}", status, body)),
            });
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    /// Public (unsigned) GET with retry on transient failures
    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, Self::encode_query(params));
        self.get_with_retry(&url, false).await
    }

    /// Signed GET with retry on transient failures
    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        self.get_with_retry(&url, true).await
    }

    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        url: &str,
        signed: bool,
    ) -> Result<T, ExchangeError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = StdDuration::from_secs(2u64.pow(attempt - 1));
                debug!("Retrying request after {}ms", delay.as_millis());
                sleep(delay).await;
            }

            let mut request = self.http.get(url);
            if signed {
                request = request.header("X-MBX-APIKEY", &self.api_key);
            }

            let result = match request.send().await {
                Ok(response) => Self::parse_response(response).await,
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    warn!(
                        "Request failed (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ExchangeError::Network("request failed".into())))
    }

    /// Signed mutating request (POST/DELETE), sent exactly once
    async fn signed_send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = Self::encode_query(&all);
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }
}

#[async_trait::async_trait]
impl Exchange for BinanceClient {
    async fn get_candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];

        let raw: Vec<Vec<serde_json::Value>> = self.public_get("/api/v3/klines", &params).await?;

        let candles = raw
            .iter()
            .filter_map(|row| {
                let k = BinanceKline::from_raw(row)?;
                let datetime = chrono::DateTime::from_timestamp_millis(k.open_time)?;
                Some(Candle::new(datetime, k.open, k.high, k.low, k.close, k.volume))
            })
            .collect();

        Ok(candles)
    }

    async fn get_symbol_filters(&self, symbol: &Symbol) -> Result<SymbolFilters, ExchangeError> {
        let params = [("symbol", symbol.as_str().to_string())];
        let info: ExchangeInfoResponse = self.public_get("/api/v3/exchangeInfo", &params).await?;

        info.symbols
            .into_iter()
            .find(|s| s.symbol == symbol.as_str())
            .map(|s| s.into_filters())
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn submit_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];

        let response: OrderResponse = self
            .signed_send(Method::POST, "/api/v3/order", &params)
            .await?;
        response.into_order_result()
    }

    async fn submit_stop_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<OrderResult, ExchangeError> {
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("side", side.as_str().to_string()),
            ("type", "STOP_LOSS_LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", quantity.to_string()),
            ("price", trigger_price.to_string()),
            ("stopPrice", trigger_price.to_string()),
        ];

        let response: OrderResponse = self
            .signed_send(Method::POST, "/api/v3/order", &params)
            .await?;
        response.into_order_result()
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> Result<(), ExchangeError> {
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("orderId", order_id.to_string()),
        ];

        let _: serde_json::Value = self
            .signed_send(Method::DELETE, "/api/v3/order", &params)
            .await?;
        Ok(())
    }

    async fn get_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
    ) -> Result<OrderStatus, ExchangeError> {
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("orderId", order_id.to_string()),
        ];

        let response: OrderResponse = self.signed_get("/api/v3/order", &params).await?;
        response.into_order_status()
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        let account: AccountResponse = self.signed_get("/api/v3/account", &[]).await?;

        let free = account
            .balances
            .iter()
            .find(|b| b.asset == asset)
            .and_then(|b| b.free.parse().ok())
            .unwrap_or(0.0);

        Ok(free)
    }
}
