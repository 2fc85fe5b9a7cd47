//! Pure indicator math over candle windows.
//!
//! Convention: index 0 is the most recent candle; increasing index is older.
//! All functions are stateless and deterministic. Money enters as `Decimal`
//! on the candle and is converted to f64 here; indicator output never flows
//! back into money fields without passing the execution boundary.

use crate::domain::types::Candle;
use rust_decimal::prelude::ToPrimitive;
use thiserror::Error;

/// Added before dividing by a standard deviation or a range.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("insufficient data: need {required} candles, got {got}")]
    InsufficientData { required: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochRsi {
    pub k: f64,
    pub d: f64,
}

fn require(candles: &[Candle], required: usize) -> Result<(), IndicatorError> {
    if candles.len() < required {
        return Err(IndicatorError::InsufficientData {
            required,
            got: candles.len(),
        });
    }
    Ok(())
}

fn close(candle: &Candle) -> f64 {
    candle.close.to_f64().unwrap_or(0.0)
}

/// Arithmetic mean of the first `period` closes.
pub fn sma(candles: &[Candle], period: usize) -> Result<f64, IndicatorError> {
    require(candles, period)?;
    let sum: f64 = candles[..period].iter().map(close).sum();
    Ok(sum / period as f64)
}

/// EMA over a newest-first value series: seeded with the SMA of the oldest
/// `period` values, then iterated forward to index 0.
fn ema_series(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period || period == 0 {
        return None;
    }
    let n = values.len();
    let seed_start = n - period;
    let mut ema: f64 = values[seed_start..].iter().sum::<f64>() / period as f64;
    let multiplier = 2.0 / (period as f64 + 1.0);
    for i in (0..seed_start).rev() {
        ema = (values[i] - ema) * multiplier + ema;
    }
    Some(ema)
}

pub fn ema(candles: &[Candle], period: usize) -> Result<f64, IndicatorError> {
    require(candles, period)?;
    let closes: Vec<f64> = candles.iter().map(close).collect();
    ema_series(&closes, period).ok_or(IndicatorError::InsufficientData {
        required: period,
        got: candles.len(),
    })
}

/// Wilder-style RSI over the first `period` close-to-close differences.
/// Returns 100 when the average loss is zero.
pub fn rsi(candles: &[Candle], period: usize) -> Result<f64, IndicatorError> {
    require(candles, period + 1)?;
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 0..period {
        let diff = close(&candles[i]) - close(&candles[i + 1]);
        if diff > 0.0 {
            gains += diff;
        } else {
            losses += -diff;
        }
    }
    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    if avg_loss == 0.0 {
        return Ok(100.0);
    }
    let rs = avg_gain / avg_loss;
    Ok(100.0 - 100.0 / (1.0 + rs))
}

/// Middle = SMA, bands at k population standard deviations.
pub fn bollinger(candles: &[Candle], period: usize, k: f64) -> Result<BollingerBands, IndicatorError> {
    let middle = sma(candles, period)?;
    let variance: f64 = candles[..period]
        .iter()
        .map(|c| {
            let d = close(c) - middle;
            d * d
        })
        .sum::<f64>()
        / period as f64;
    let sigma = variance.sqrt();
    Ok(BollingerBands {
        middle,
        upper: middle + k * sigma,
        lower: middle - k * sigma,
    })
}

/// Mean true range over the first `period` ranges.
pub fn atr(candles: &[Candle], period: usize) -> Result<f64, IndicatorError> {
    require(candles, period + 1)?;
    let mut sum = 0.0;
    for i in 0..period {
        let high = candles[i].high.to_f64().unwrap_or(0.0);
        let low = candles[i].low.to_f64().unwrap_or(0.0);
        let prev_close = close(&candles[i + 1]);
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        sum += tr;
    }
    Ok(sum / period as f64)
}

/// MACD line, signal line, and histogram. The signal line is an EMA over the
/// MACD history computed at successive as-of offsets.
pub fn macd(
    candles: &[Candle],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<Macd, IndicatorError> {
    // 2*signal history points keep the signal line a real EMA rather than a
    // degenerate SMA over exactly `signal` values.
    let history = signal * 2;
    let required = slow + history - 1;
    require(candles, required)?;

    let closes: Vec<f64> = candles.iter().map(close).collect();
    let mut macd_history = Vec::with_capacity(history);
    for offset in 0..history {
        let window = &closes[offset..];
        let fast_ema = ema_series(window, fast).ok_or(IndicatorError::InsufficientData {
            required,
            got: candles.len(),
        })?;
        let slow_ema = ema_series(window, slow).ok_or(IndicatorError::InsufficientData {
            required,
            got: candles.len(),
        })?;
        macd_history.push(fast_ema - slow_ema);
    }

    let macd_value = macd_history[0];
    let signal_value =
        ema_series(&macd_history, signal).ok_or(IndicatorError::InsufficientData {
            required,
            got: candles.len(),
        })?;
    Ok(Macd {
        macd: macd_value,
        signal: signal_value,
        histogram: macd_value - signal_value,
    })
}

/// Stochastic oscillator applied to the RSI series. K is range-normalized with
/// an epsilon so a flat RSI yields 0 rather than a division error; D is the
/// SMA(3) of K (fewer values while the window is short).
pub fn stoch_rsi(
    candles: &[Candle],
    rsi_period: usize,
    stoch_period: usize,
) -> Result<StochRsi, IndicatorError> {
    let required = rsi_period + stoch_period;
    require(candles, required)?;

    let k_at = |offset: usize| -> Option<f64> {
        if candles.len() < offset + required {
            return None;
        }
        let mut series = Vec::with_capacity(stoch_period);
        for j in offset..offset + stoch_period {
            series.push(rsi(&candles[j..], rsi_period).ok()?);
        }
        let current = series[0];
        let min = series.iter().cloned().fold(f64::MAX, f64::min);
        let max = series.iter().cloned().fold(f64::MIN, f64::max);
        Some((current - min) / (max - min + EPSILON) * 100.0)
    };

    let k = k_at(0).ok_or(IndicatorError::InsufficientData {
        required,
        got: candles.len(),
    })?;
    let mut k_values = vec![k];
    for offset in 1..3 {
        if let Some(value) = k_at(offset) {
            k_values.push(value);
        }
    }
    let d = k_values.iter().sum::<f64>() / k_values.len() as f64;
    Ok(StochRsi { k, d })
}
