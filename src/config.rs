//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials. Every component receives its
//! configuration explicitly at construction; there is no global state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
}

impl Config {
    /// Load configuration from JSON file
    ///
    /// API credentials are taken from `BINANCE_API_KEY` / `BINANCE_API_SECRET`
    /// when present, overriding whatever the file contains.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(api_key) = std::env::var("BINANCE_API_KEY") {
            config.exchange.api_key = Some(api_key);
        }
        if let Ok(api_secret) = std::env::var("BINANCE_API_SECRET") {
            config.exchange.api_secret = Some(api_secret);
        }
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
            config.telegram = Some(TelegramConfig { token, chat_id });
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            exchange: ExchangeConfig::default(),
            trading: TradingConfig::default(),
            signal: SignalConfig::default(),
            telegram: None,
        }
    }
}

/// Exchange connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    /// Override for the REST base URL (testnet, mocks)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            base_url: None,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

/// Trading behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Symbols evaluated for entries
    pub symbols: Vec<String>,
    /// Quote asset every pair trades against
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Minimum quote notional worth opening a position for
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,
    /// Candle interval used for signal evaluation
    #[serde(default = "default_candle_interval")]
    pub candle_interval: String,
    /// Candles fetched per signal evaluation
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
    /// Seconds between signal evaluation cycles
    #[serde(default = "default_evaluate_interval")]
    pub evaluate_interval_secs: u64,
    /// Seconds between monitor sweeps over open positions
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    /// Evaluation cycles between heartbeat notifications
    #[serde(default = "default_heartbeat_cycles")]
    pub heartbeat_cycles: u32,
    /// Defaults applied to every symbol
    #[serde(default)]
    pub defaults: SymbolConfig,
    /// Per-symbol overrides
    #[serde(default)]
    pub overrides: HashMap<String, SymbolConfig>,
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_min_notional() -> f64 {
    10.0
}

fn default_candle_interval() -> String {
    "1h".to_string()
}

fn default_history_limit() -> u32 {
    210
}

fn default_evaluate_interval() -> u64 {
    3600
}

fn default_monitor_interval() -> u64 {
    60
}

fn default_heartbeat_cycles() -> u32 {
    24
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            quote_asset: default_quote_asset(),
            min_notional: default_min_notional(),
            candle_interval: default_candle_interval(),
            history_limit: default_history_limit(),
            evaluate_interval_secs: default_evaluate_interval(),
            monitor_interval_secs: default_monitor_interval(),
            heartbeat_cycles: default_heartbeat_cycles(),
            defaults: SymbolConfig::default(),
            overrides: HashMap::new(),
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(|s| Symbol::new(s.clone())).collect()
    }

    /// Effective configuration for a symbol (override or defaults)
    pub fn symbol_config(&self, symbol: &Symbol) -> &SymbolConfig {
        self.overrides.get(symbol.as_str()).unwrap_or(&self.defaults)
    }
}

/// Per-symbol protection and sizing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    #[serde(default)]
    pub protection: ProtectionPolicy,
    #[serde(default)]
    pub sizing: Sizing,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        SymbolConfig {
            protection: ProtectionPolicy::default(),
            sizing: Sizing::default(),
        }
    }
}

/// How the protective sell order trails (or does not trail) price
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProtectionPolicy {
    /// Stop trigger ratchets up to `fraction` below the latest price
    Trailing { fraction: f64 },
    /// Stop trigger stays `fraction` below the entry price
    Fixed { fraction: f64 },
}

impl ProtectionPolicy {
    pub fn fraction(&self) -> f64 {
        match self {
            ProtectionPolicy::Trailing { fraction } => *fraction,
            ProtectionPolicy::Fixed { fraction } => *fraction,
        }
    }

    pub fn is_trailing(&self) -> bool {
        matches!(self, ProtectionPolicy::Trailing { .. })
    }
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        ProtectionPolicy::Trailing { fraction: 0.05 }
    }
}

/// Position sizing policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Sizing {
    /// Fixed quote-asset amount per entry
    Notional { amount: f64 },
    /// Percentage of the free quote balance per entry
    BalancePct { pct: f64 },
}

impl Sizing {
    /// Quote notional to invest given the current free balance
    pub fn notional(&self, free_balance: f64) -> f64 {
        match self {
            Sizing::Notional { amount } => *amount,
            Sizing::BalancePct { pct } => free_balance * pct,
        }
    }
}

impl Default for Sizing {
    fn default() -> Self {
        Sizing::BalancePct { pct: 0.15 }
    }
}

/// Signal (indicator) parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_rsi_entry_min")]
    pub rsi_entry_min: f64,
    #[serde(default = "default_rsi_entry_max")]
    pub rsi_entry_max: f64,
}

fn default_macd_fast() -> usize {
    12
}

fn default_macd_slow() -> usize {
    26
}

fn default_macd_signal() -> usize {
    9
}

fn default_rsi_period() -> usize {
    14
}

fn default_rsi_entry_min() -> f64 {
    50.0
}

fn default_rsi_entry_max() -> f64 {
    70.0
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            rsi_period: default_rsi_period(),
            rsi_entry_min: default_rsi_entry_min(),
            rsi_entry_max: default_rsi_entry_max(),
        }
    }
}

/// Telegram notification credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
}
