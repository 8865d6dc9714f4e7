use std::result;

use thiserror::Error;

use super::MAX_KLINES_LIMIT;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(
        "Kline fetch limit must be at most {}. Value: {limit}",
        MAX_KLINES_LIMIT
    )]
    LimitTooLarge { limit: usize },

    #[error("Symbol not found in exchange info: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("Missing filter '{filter}' for symbol {symbol}")]
    MissingFilter {
        symbol: String,
        filter: &'static str,
    },

    #[error("Unexpected payload from market data source: {0}")]
    InvalidPayload(String),

    #[error("Candle store error: {0}")]
    Store(#[from] crate::db::error::DbError),

    #[error("No candles available for {symbol} at {timestamp}")]
    NoCandlesAvailable { symbol: String, timestamp: i64 },

    #[error("Simulator has not been configured with a time range")]
    NotConfigured,
}

pub(crate) type Result<T> = result::Result<T, MarketError>;
