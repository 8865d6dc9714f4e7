use std::result;

use thiserror::Error;

use crate::{
    exchange::error::ExchangeError, indicators::error::IndicatorError, market::error::MarketError,
};

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Unknown strategy: {name}")]
    UnknownStrategy { name: String },

    #[error("[Exchange] {0}")]
    Exchange(#[from] ExchangeError),

    #[error("[Feed] {0}")]
    Feed(#[from] MarketError),

    #[error("[Indicator] {0}")]
    Indicator(#[from] IndicatorError),
}

pub(crate) type Result<T> = result::Result<T, StrategyError>;
