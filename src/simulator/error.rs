use std::result;

use thiserror::Error;

use crate::{market::error::MarketError, shared::error::TimeframeSetValidationError};

#[derive(Error, Debug)]
pub enum SimulatorError {
    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    InvalidTimeframes(#[from] TimeframeSetValidationError),

    #[error("No timeframes supplied for symbol {symbol}")]
    EmptyTimeframes { symbol: String },
}

pub(crate) type Result<T> = result::Result<T, SimulatorError>;
