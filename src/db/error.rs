use std::result;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection error: {0}")]
    Connection(sqlx::Error),

    #[error("Query error: {0}")]
    Query(sqlx::Error),

    #[error("Transaction begin error: {0}")]
    TransactionBegin(sqlx::Error),

    #[error("Transaction commit error: {0}")]
    TransactionCommit(sqlx::Error),

    #[error("Invalid symbol for table naming: {symbol}")]
    InvalidSymbol { symbol: String },

    #[error("Stored candle column '{column}' is not a valid decimal: {value}")]
    InvalidStoredDecimal { column: &'static str, value: String },

    #[error("New candles must share a single symbol. Found: {first} and {second}")]
    MixedSymbols { first: String, second: String },
}

pub(crate) type Result<T> = result::Result<T, DbError>;
