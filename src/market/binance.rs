use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::shared::{Millis, Timeframe};

use super::{
    Candle, MAX_KLINES_LIMIT, MarketDataSource, SymbolInfo,
    error::{MarketError, Result},
};

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

/// REST adapter for the USD-M futures kline API. Only public endpoints are
/// used; no credentials required.
pub struct BinanceFuturesSource {
    http: reqwest::Client,
    base_url: String,
    symbol_info_cache: Mutex<HashMap<String, SymbolInfo>>,
}

impl BinanceFuturesSource {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            symbol_info_cache: Mutex::new(HashMap::new()),
        }
    }

    fn decimal_field(value: &Value, key: &str) -> Result<Decimal> {
        value
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| MarketError::InvalidPayload(format!("missing decimal field '{key}'")))
    }

    fn parse_kline(symbol: &str, timeframe: Timeframe, row: &Value) -> Result<Candle> {
        let fields = row
            .as_array()
            .filter(|f| f.len() >= 6)
            .ok_or_else(|| MarketError::InvalidPayload("kline row is not an array".into()))?;

        let timestamp = fields[0]
            .as_i64()
            .ok_or_else(|| MarketError::InvalidPayload("kline open time is not an int".into()))?;

        let price = |i: usize, name: &str| -> Result<Decimal> {
            fields[i]
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| MarketError::InvalidPayload(format!("kline {name} is not decimal")))
        };

        Ok(Candle {
            symbol: symbol.to_string(),
            timeframe,
            timestamp,
            open: price(1, "open")?,
            high: price(2, "high")?,
            low: price(3, "low")?,
            close: price(4, "close")?,
            volume: price(5, "volume")?,
        })
    }

    /// Extracts `(tick_size, min_qty, step_size, notional)` from a symbol's
    /// filter list.
    fn extract_symbol_info(entry: &Value) -> Result<SymbolInfo> {
        let symbol = entry
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or_else(|| MarketError::InvalidPayload("symbol entry without name".into()))?
            .to_string();

        let mut tick_size = None;
        let mut min_qty = None;
        let mut min_step = None;
        let mut min_notional = None;

        let filters = entry
            .get("filters")
            .and_then(Value::as_array)
            .ok_or_else(|| MarketError::MissingFilter {
                symbol: symbol.clone(),
                filter: "filters",
            })?;

        for filter in filters {
            match filter.get("filterType").and_then(Value::as_str) {
                Some("PRICE_FILTER") => {
                    tick_size = Some(Self::decimal_field(filter, "tickSize")?);
                }
                Some("LOT_SIZE") => {
                    min_qty = Some(Self::decimal_field(filter, "minQty")?);
                    min_step = Some(Self::decimal_field(filter, "stepSize")?);
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = Some(Self::decimal_field(filter, "notional")?);
                }
                _ => {}
            }
        }

        let missing = |filter| MarketError::MissingFilter {
            symbol: symbol.clone(),
            filter,
        };

        let min_qty = min_qty.ok_or_else(|| missing("LOT_SIZE"))?;
        let min_step = min_step.ok_or_else(|| missing("LOT_SIZE"))?;
        let tick_size = tick_size.ok_or_else(|| missing("PRICE_FILTER"))?;
        let min_notional = min_notional.ok_or_else(|| missing("MIN_NOTIONAL"))?;

        Ok(SymbolInfo {
            symbol,
            min_qty,
            min_step,
            tick_size,
            min_notional,
        })
    }

    async fn build_symbol_cache(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let payload: Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let symbols = payload
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| MarketError::InvalidPayload("exchangeInfo without symbols".into()))?;

        let mut cache = self.symbol_info_cache.lock().await;
        let mut skipped = 0usize;
        for entry in symbols {
            match Self::extract_symbol_info(entry) {
                Ok(info) => {
                    cache.insert(info.symbol.clone(), info);
                }
                Err(_) => skipped += 1,
            }
        }
        debug!(cached = cache.len(), skipped, "symbol info cache built");

        Ok(())
    }
}

impl Default for BinanceFuturesSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataSource for BinanceFuturesSource {
    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        start_time: Option<Millis>,
        end_time: Option<Millis>,
    ) -> Result<Vec<Candle>> {
        if limit > MAX_KLINES_LIMIT {
            return Err(MarketError::LimitTooLarge { limit });
        }

        let url = format!("{}/fapi/v1/klines", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_uppercase()),
            ("interval", timeframe.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = start_time {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_time {
            query.push(("endTime", end.to_string()));
        }

        let rows: Value = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let rows = rows
            .as_array()
            .ok_or_else(|| MarketError::InvalidPayload("klines payload is not an array".into()))?;

        rows.iter()
            .map(|row| Self::parse_kline(symbol, timeframe, row))
            .collect()
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let symbol = symbol.to_uppercase();

        {
            let cache = self.symbol_info_cache.lock().await;
            if let Some(info) = cache.get(&symbol) {
                return Ok(info.clone());
            }
            if !cache.is_empty() {
                return Err(MarketError::SymbolNotFound { symbol });
            }
        }

        self.build_symbol_cache().await?;

        let cache = self.symbol_info_cache.lock().await;
        cache
            .get(&symbol)
            .cloned()
            .ok_or(MarketError::SymbolNotFound { symbol })
    }
}
