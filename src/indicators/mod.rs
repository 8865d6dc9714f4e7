use rust_decimal::{Decimal, prelude::ToPrimitive};

use crate::{market::Candle, shared::Millis};

pub mod error;

use error::{IndicatorError, Result};

/// One evaluated Stochastic RSI point. `stoch_rsi` is the smoothed %K in
/// `[0, 100]`; `signal` is its moving average. Values are `None` until the
/// warmup windows are filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochRsiValue {
    pub timestamp: Millis,
    pub stoch_rsi: Option<f64>,
    pub signal: Option<f64>,
}

/// A Williams fractal pivot. `bear` carries the pivot high of an up
/// fractal, `bull` the pivot low of a down fractal. Edge candles (within
/// the span) never carry a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FractalPoint {
    pub timestamp: Millis,
    pub bear: Option<Decimal>,
    pub bull: Option<Decimal>,
}

fn sma_window(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Wilder-smoothed RSI over closing prices. Output is aligned with the
/// input; entries before `period` lookback are `None`.
fn wilder_rsi(closes: &[f64], period: usize) -> Result<Vec<Option<f64>>> {
    if period == 0 {
        return Err(IndicatorError::InvalidPeriod);
    }
    if closes.len() <= period {
        return Err(IndicatorError::InsufficientData {
            required: period + 1,
            available: closes.len(),
        });
    }

    let mut rsi = vec![None; closes.len()];

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let change = closes[i] - closes[i - 1];
        if change >= 0.0 {
            avg_gain += change;
        } else {
            avg_loss += -change;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    let rsi_at = |gain: f64, loss: f64| {
        if loss == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        }
    };

    rsi[period] = Some(rsi_at(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let change = closes[i] - closes[i - 1];
        let (gain, loss) = if change >= 0.0 {
            (change, 0.0)
        } else {
            (0.0, -change)
        };
        avg_gain = (avg_gain * (period - 1) as f64 + gain) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss) / period as f64;
        rsi[i] = Some(rsi_at(avg_gain, avg_loss));
    }

    Ok(rsi)
}

/// Stochastic RSI: RSI (Wilder) -> stochastic of the RSI over
/// `stoch_period` -> SMA smoothing (`smooth_period`) for the oscillator and
/// `signal_period` for the signal line.
pub fn stoch_rsi(
    candles: &[Candle],
    rsi_period: usize,
    stoch_period: usize,
    signal_period: usize,
    smooth_period: usize,
) -> Result<Vec<StochRsiValue>> {
    if candles.is_empty() {
        return Err(IndicatorError::EmptyInput);
    }
    if stoch_period == 0 || signal_period == 0 || smooth_period == 0 {
        return Err(IndicatorError::InvalidPeriod);
    }

    let closes: Vec<f64> = candles
        .iter()
        .map(|c| c.close.to_f64().unwrap_or(0.0))
        .collect();

    let rsi = wilder_rsi(&closes, rsi_period)?;

    // Raw stochastic of the RSI.
    let mut raw = vec![None; candles.len()];
    for i in 0..candles.len() {
        let Some(current) = rsi[i] else {
            continue;
        };
        if i + 1 < rsi_period + stoch_period {
            continue;
        }
        let window: Vec<f64> = rsi[i + 1 - stoch_period..=i]
            .iter()
            .filter_map(|v| *v)
            .collect();
        if window.len() < stoch_period {
            continue;
        }
        let min = window.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let value = if max - min == 0.0 {
            0.0
        } else {
            (current - min) / (max - min) * 100.0
        };
        raw[i] = Some(value);
    }

    let smooth = |source: &[Option<f64>], period: usize| -> Vec<Option<f64>> {
        let mut out = vec![None; source.len()];
        for i in 0..source.len() {
            if i + 1 < period {
                continue;
            }
            let window: Vec<f64> = source[i + 1 - period..=i].iter().filter_map(|v| *v).collect();
            if window.len() == period {
                out[i] = Some(sma_window(&window));
            }
        }
        out
    };

    let k = smooth(&raw, smooth_period);
    let signal = smooth(&k, signal_period);

    Ok(candles
        .iter()
        .enumerate()
        .map(|(i, c)| StochRsiValue {
            timestamp: c.timestamp,
            stoch_rsi: k[i],
            signal: signal[i],
        })
        .collect())
}

/// Williams fractals with symmetric spans. A candle is a bear (up) fractal
/// when its high exceeds the highs of `left_span` candles before and
/// `right_span` candles after it; bull (down) fractals mirror on lows.
pub fn fractals(candles: &[Candle], left_span: usize, right_span: usize) -> Result<Vec<FractalPoint>> {
    if candles.is_empty() {
        return Err(IndicatorError::EmptyInput);
    }
    if left_span == 0 || right_span == 0 {
        return Err(IndicatorError::InvalidPeriod);
    }

    let mut points: Vec<FractalPoint> = candles
        .iter()
        .map(|c| FractalPoint {
            timestamp: c.timestamp,
            bear: None,
            bull: None,
        })
        .collect();

    if candles.len() < left_span + right_span + 1 {
        return Ok(points);
    }

    for i in left_span..candles.len() - right_span {
        let candle = &candles[i];

        let is_bear = (i - left_span..i + right_span + 1)
            .filter(|j| *j != i)
            .all(|j| candles[j].high < candle.high);
        if is_bear {
            points[i].bear = Some(candle.high);
        }

        let is_bull = (i - left_span..i + right_span + 1)
            .filter(|j| *j != i)
            .all(|j| candles[j].low > candle.low);
        if is_bull {
            points[i].bull = Some(candle.low);
        }
    }

    Ok(points)
}
