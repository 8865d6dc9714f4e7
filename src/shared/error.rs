use thiserror::Error;

use super::TimeframeSet;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeframeSetValidationError {
    #[error(
        "Invalid timeframes, at least {} distinct entries required. Count: {count}",
        TimeframeSet::MIN_LEN
    )]
    TooFew { count: usize },

    #[error(
        "Invalid timeframes, at most {} distinct entries allowed. Count: {count}",
        TimeframeSet::MAX_LEN
    )]
    TooMany { count: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RsiLimitsValidationError {
    #[error("Invalid RSI limits, exactly 3 values required. Count: {count}")]
    WrongLength { count: usize },

    #[error("Invalid RSI limit, values must be in [0, 100]. Value: {value}")]
    OutOfRange { value: i64 },

    #[error("Invalid RSI limits, values must be strictly ascending. Values: {values:?}")]
    NotAscending { values: [i64; 3] },
}
