//! Buy-signal evaluation
//!
//! A buy requires the MACD line crossing above its signal line on the latest
//! closed candle (at-or-below on the previous one) with RSI strictly inside
//! the configured entry band. Indicator math comes from the `ta` crate; rows
//! inside the warmup window carry `None` and fail the evaluation closed.

use ta::indicators::{MovingAverageConvergenceDivergence, RelativeStrengthIndex};
use ta::Next;

use crate::config::SignalConfig;
use crate::types::Candle;

/// Crossover-based buy signal generator
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    config: SignalConfig,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig) -> Self {
        SignalGenerator { config }
    }

    /// Candles required before any evaluation can produce a buy
    pub fn warmup(&self) -> usize {
        let macd_warmup = self.config.macd_slow + self.config.macd_signal;
        macd_warmup.max(self.config.rsi_period) + 1
    }

    /// Evaluate the buy signal over a time-ordered candle series.
    ///
    /// Pure function of the series: identical input always yields the same
    /// answer. Insufficient history yields `false`, never an error.
    pub fn evaluate(&self, candles: &[Candle]) -> bool {
        if candles.len() < self.warmup() {
            return false;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let (macd_line, signal_line) = macd_series(
            &closes,
            self.config.macd_fast,
            self.config.macd_slow,
            self.config.macd_signal,
        );
        let rsi_line = rsi_series(&closes, self.config.rsi_period);

        let last = closes.len() - 1;
        let prev = last - 1;

        let (Some(macd_last), Some(sig_last), Some(macd_prev), Some(sig_prev), Some(rsi_last)) = (
            value_at(&macd_line, last),
            value_at(&signal_line, last),
            value_at(&macd_line, prev),
            value_at(&signal_line, prev),
            value_at(&rsi_line, last),
        ) else {
            return false;
        };

        let crossed_up = macd_last > sig_last && macd_prev <= sig_prev;
        let rsi_in_band =
            rsi_last > self.config.rsi_entry_min && rsi_last < self.config.rsi_entry_max;

        crossed_up && rsi_in_band
    }
}

fn value_at(series: &[Option<f64>], index: usize) -> Option<f64> {
    series.get(index).copied().flatten()
}

/// MACD line and signal line over a close series; rows before the combined
/// slow + signal warmup are `None`
fn macd_series(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let mut indicator = match MovingAverageConvergenceDivergence::new(fast, slow, signal) {
        Ok(i) => i,
        Err(_) => {
            return (vec![None; closes.len()], vec![None; closes.len()]);
        }
    };

    let warmup = slow + signal;
    let mut macd_line = Vec::with_capacity(closes.len());
    let mut signal_line = Vec::with_capacity(closes.len());

    for (i, &close) in closes.iter().enumerate() {
        let out = indicator.next(close);
        if i + 1 >= warmup {
            macd_line.push(Some(out.macd));
            signal_line.push(Some(out.signal));
        } else {
            macd_line.push(None);
            signal_line.push(None);
        }
    }

    (macd_line, signal_line)
}

/// RSI over a close series; rows before the period warmup are `None`
fn rsi_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; closes.len()],
    };

    let mut result = Vec::with_capacity(closes.len());

    for (i, &close) in closes.iter().enumerate() {
        let value = indicator.next(close);
        if i + 1 >= period {
            result.push(Some(value));
        } else {
            result.push(None);
        }
    }

    result
}
