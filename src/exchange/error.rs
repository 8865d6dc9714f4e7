use std::result;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::market::error::MarketError;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Market orders must not specify a price")]
    MarketOrderWithPrice,

    #[error("Limit orders must specify a price")]
    LimitOrderWithoutPrice,

    #[error("Order quantity must be positive. Value: {quantity}")]
    NonPositiveQuantity { quantity: Decimal },

    #[error("Order price must be positive. Value: {price}")]
    NonPositivePrice { price: Decimal },

    #[error(
        "Insufficient balance: margin {required_margin} exceeds balance {balance}"
    )]
    InsufficientBalance {
        required_margin: Decimal,
        balance: Decimal,
    },

    #[error("Max notional exceeded: {requested} > {max_notional}")]
    MaxNotionalExceeded {
        requested: Decimal,
        max_notional: Decimal,
    },

    #[error("No candles available for {symbol}")]
    NoCandles { symbol: String },

    #[error("Order not found: {order_id}")]
    OrderNotFound { order_id: String },

    #[error("[Feed] {0}")]
    Feed(#[from] MarketError),
}

pub(crate) type Result<T> = result::Result<T, ExchangeError>;
