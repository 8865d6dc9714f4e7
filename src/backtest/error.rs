use std::result;

use thiserror::Error;

use crate::{
    shared::error::{RsiLimitsValidationError, TimeframeSetValidationError},
    simulator::error::SimulatorError,
    strategy::error::StrategyError,
};

#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Invalid timeframes: {0}")]
    InvalidTimeframes(#[from] TimeframeSetValidationError),

    #[error("Invalid RSI limits: {0}")]
    InvalidRsiLimits(#[from] RsiLimitsValidationError),

    #[error(
        "Start time must be before the end time. Start: {start_time}, end: {end_time}"
    )]
    InvalidTimeRange { start_time: i64, end_time: i64 },

    #[error("Initial balance must be positive. Value: {balance}")]
    NonPositiveBalance { balance: rust_decimal::Decimal },

    #[error("[Simulator] {0}")]
    Simulator(#[from] SimulatorError),

    #[error("[Strategy] {0}")]
    Strategy(#[from] StrategyError),

    #[error("[Market] {0}")]
    Market(#[from] crate::market::error::MarketError),
}

pub(crate) type Result<T> = result::Result<T, BacktestError>;
