use std::result;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndicatorError {
    #[error("Indicator input is empty")]
    EmptyInput,

    #[error("Insufficient candles: {required} required, {available} available")]
    InsufficientData { required: usize, available: usize },

    #[error("Indicator period must be at least 1")]
    InvalidPeriod,
}

pub(crate) type Result<T> = result::Result<T, IndicatorError>;
