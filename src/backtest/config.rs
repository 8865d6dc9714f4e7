use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::{Millis, RsiLimits, Timeframe, TimeframeSet};

use super::error::{BacktestError, Result};

/// Validated configuration of a single backtest pass. Immutable after
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub run_id: String,
    pub symbol: String,
    pub start_time: Millis,
    pub end_time: Option<Millis>,
    pub initial_balance: Decimal,
    pub leverage: Decimal,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub max_notional: Decimal,
    pub strategy_name: String,
    pub stop_on_loss: bool,
    /// Fraction of the initial balance, e.g. 0.5 = 50%.
    pub max_loss_percentage: f64,
    pub track_cycles: bool,
    pub timeframes: TimeframeSet,
    pub rsi_limits: RsiLimits,
}

impl BacktestConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        start_time: Millis,
        end_time: Option<Millis>,
        initial_balance: Decimal,
        leverage: Decimal,
        maker_fee: Decimal,
        taker_fee: Decimal,
        max_notional: Decimal,
        strategy_name: impl Into<String>,
        stop_on_loss: bool,
        max_loss_percentage: f64,
        track_cycles: bool,
        timeframes: Vec<Timeframe>,
        rsi_limits: Option<RsiLimits>,
    ) -> Result<Self> {
        if let Some(end_time) = end_time
            && end_time <= start_time
        {
            return Err(BacktestError::InvalidTimeRange {
                start_time,
                end_time,
            });
        }

        if initial_balance <= Decimal::ZERO {
            return Err(BacktestError::NonPositiveBalance {
                balance: initial_balance,
            });
        }

        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            start_time,
            end_time,
            initial_balance,
            leverage,
            maker_fee,
            taker_fee,
            max_notional,
            strategy_name: strategy_name.into(),
            stop_on_loss,
            max_loss_percentage,
            track_cycles,
            timeframes: TimeframeSet::try_from(timeframes)?,
            rsi_limits: rsi_limits.unwrap_or_default(),
        })
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.timeframes.base()
    }
}
