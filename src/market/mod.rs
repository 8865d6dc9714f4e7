use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::shared::{Millis, Timeframe};

pub mod error;

mod binance;

pub use binance::BinanceFuturesSource;

use error::Result;

/// A single OHLCV candle. Immutable once produced by the source or store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Open time, aligned to the timeframe boundary.
    pub timestamp: Millis,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Exchange filters for a symbol, reduced to the four numbers the pipeline
/// needs. Fetched once per symbol and cached by the source adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub min_qty: Decimal,
    pub min_step: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

/// Maximum candles a single source fetch may request.
pub const MAX_KLINES_LIMIT: usize = 1000;

/// External market data source. Failures are retryable from the caller's
/// point of view; the core never retries internally.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetches up to `limit` (<= 1000) candles for `(symbol, timeframe)`
    /// starting at `start_time`, ordered by timestamp ascending.
    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        start_time: Option<Millis>,
        end_time: Option<Millis>,
    ) -> Result<Vec<Candle>>;

    /// Returns the cached `SymbolInfo` for `symbol`, fetching exchange
    /// metadata on first use.
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;
}

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

pub type ListenerResult = std::result::Result<(), ListenerError>;

/// Receiver of completed candles. A listener that fails is logged and
/// skipped; siblings still run.
#[async_trait]
pub trait CandleListener: Send + Sync {
    async fn on_candle(&self, candle: &Candle) -> ListenerResult;
}

/// Opaque handle identifying a registered listener, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// The market view shared by the exchange and the strategies: historical
/// candles, symbol metadata, and completed-candle subscriptions.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Returns up to `limit` most recent completed candles for
    /// `(symbol, timeframe)` relative to the feed's time cursor, ordered by
    /// timestamp ascending.
    async fn candles(&self, symbol: &str, timeframe: Timeframe, limit: usize)
    -> Result<Vec<Candle>>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn subscribe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        listener: Arc<dyn CandleListener>,
    ) -> Result<ListenerId>;

    async fn unsubscribe(&self, symbol: &str, timeframe: Timeframe, id: ListenerId);
}
