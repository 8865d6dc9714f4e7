use std::{collections::HashSet, path::Path, str::FromStr};

use rust_decimal::Decimal;
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    market::Candle,
    shared::{Millis, Timeframe},
};

pub mod error;

use error::{DbError, Result};

/// Durability profile of the candle store.
///
/// Backtests trade durability for throughput; production keeps a write-ahead
/// log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Backtest,
    Production,
}

impl StoreMode {
    fn pragmas(self) -> &'static [(&'static str, &'static str)] {
        match self {
            StoreMode::Backtest => &[
                ("synchronous", "OFF"),
                ("journal_mode", "MEMORY"),
                ("temp_store", "MEMORY"),
                ("cache_size", "50000"),
            ],
            StoreMode::Production => &[
                ("journal_mode", "WAL"),
                ("synchronous", "NORMAL"),
                ("cache_size", "10000"),
            ],
        }
    }
}

/// Append-only per-symbol OHLCV store.
///
/// Each symbol owns a `{symbol}_kline` table with primary key
/// `(timestamp, timeframe)` and secondary indexes on
/// `(timeframe, timestamp)` and `(timestamp)`. Inserts are idempotent
/// upserts and every batch runs in a single transaction. The pool holds a
/// single connection, which also serializes the writer.
pub struct CandleStore {
    pool: SqlitePool,
    known_tables: Mutex<HashSet<String>>,
}

impl CandleStore {
    pub async fn connect(path: impl AsRef<Path>, mode: StoreMode) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options, mode).await
    }

    /// In-memory store, used by tests and throwaway backtests.
    pub async fn in_memory(mode: StoreMode) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(DbError::Connection)?;
        Self::connect_with(options, mode).await
    }

    async fn connect_with(mut options: SqliteConnectOptions, mode: StoreMode) -> Result<Self> {
        for (key, value) in mode.pragmas() {
            options = options.pragma(*key, *value);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(DbError::Connection)?;

        Ok(Self {
            pool,
            known_tables: Mutex::new(HashSet::new()),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn table_name(symbol: &str) -> Result<String> {
        let lowered = symbol.to_lowercase();
        if lowered.is_empty() || !lowered.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DbError::InvalidSymbol {
                symbol: symbol.to_string(),
            });
        }
        Ok(format!("{lowered}_kline"))
    }

    async fn ensure_table(&self, symbol: &str) -> Result<String> {
        let table = Self::table_name(symbol)?;

        let mut known = self.known_tables.lock().await;
        if known.contains(&table) {
            return Ok(table);
        }

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                PRIMARY KEY (timestamp, timeframe)
            )"
        );
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;

        for (suffix, columns) in [
            ("timeframe_timestamp", "(timeframe, timestamp)"),
            ("timestamp", "(timestamp)"),
        ] {
            let index = format!("CREATE INDEX IF NOT EXISTS idx_{table}_{suffix} ON {table} {columns}");
            sqlx::query(&index)
                .execute(&self.pool)
                .await
                .map_err(DbError::Query)?;
        }

        known.insert(table.clone());
        Ok(table)
    }

    /// Upserts a batch of candles for a single symbol inside one
    /// transaction.
    pub async fn add_candles(&self, candles: &[Candle]) -> Result<()> {
        let Some(first) = candles.first() else {
            return Ok(());
        };

        if let Some(other) = candles.iter().find(|c| c.symbol != first.symbol) {
            return Err(DbError::MixedSymbols {
                first: first.symbol.clone(),
                second: other.symbol.clone(),
            });
        }

        let table = self.ensure_table(&first.symbol).await?;

        let mut tx = self.pool.begin().await.map_err(DbError::TransactionBegin)?;

        let insert = format!(
            "INSERT OR REPLACE INTO {table}
                (timeframe, timestamp, open, high, low, close, volume)
             VALUES (?, ?, ?, ?, ?, ?, ?)"
        );

        for candle in candles {
            sqlx::query(&insert)
                .bind(candle.timeframe.to_string())
                .bind(candle.timestamp)
                .bind(candle.open.to_string())
                .bind(candle.high.to_string())
                .bind(candle.low.to_string())
                .bind(candle.close.to_string())
                .bind(candle.volume.to_string())
                .execute(&mut *tx)
                .await
                .map_err(DbError::Query)?;
        }

        tx.commit().await.map_err(DbError::TransactionCommit)?;

        debug!(
            symbol = %first.symbol,
            count = candles.len(),
            "candles persisted"
        );

        Ok(())
    }

    /// Returns the first candle strictly after `timestamp` for
    /// `(symbol, timeframe)`, or `None` when the store has nothing there.
    pub async fn get_next_candle(
        &self,
        symbol: &str,
        timestamp: Millis,
        timeframe: Timeframe,
    ) -> Result<Option<Candle>> {
        let table = Self::table_name(symbol)?;
        if !self.table_exists(&table).await? {
            return Ok(None);
        }

        let query = format!(
            "SELECT timeframe, timestamp, open, high, low, close, volume
             FROM {table}
             WHERE timestamp > ? AND timeframe = ?
             ORDER BY timestamp ASC
             LIMIT 1"
        );

        let row = sqlx::query(&query)
            .bind(timestamp)
            .bind(timeframe.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;

        row.map(|r| Self::row_to_candle(symbol, &r)).transpose()
    }

    /// Returns up to `limit` candles with `timestamp >= from`, ascending.
    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        from: Millis,
    ) -> Result<Vec<Candle>> {
        let table = Self::table_name(symbol)?;
        if !self.table_exists(&table).await? {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT timeframe, timestamp, open, high, low, close, volume
             FROM {table}
             WHERE timeframe = ? AND timestamp >= ?
             ORDER BY timestamp ASC
             LIMIT ?"
        );

        let rows = sqlx::query(&query)
            .bind(timeframe.to_string())
            .bind(from)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;

        rows.iter()
            .map(|row| Self::row_to_candle(symbol, row))
            .collect()
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        {
            let known = self.known_tables.lock().await;
            if known.contains(table) {
                return Ok(true);
            }
        }

        let row =
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::Query)?;

        let exists = row.is_some();
        if exists {
            self.known_tables.lock().await.insert(table.to_string());
        }

        Ok(exists)
    }

    fn row_to_candle(symbol: &str, row: &SqliteRow) -> Result<Candle> {
        let decimal = |column: &'static str| -> Result<Decimal> {
            let value: String = row.get(column);
            value
                .parse()
                .map_err(|_| DbError::InvalidStoredDecimal { column, value })
        };

        let timeframe: String = row.get("timeframe");
        let timeframe = timeframe
            .parse()
            .map_err(|_| DbError::InvalidStoredDecimal {
                column: "timeframe",
                value: timeframe.clone(),
            })?;

        Ok(Candle {
            symbol: symbol.to_string(),
            timeframe,
            timestamp: row.get::<i64, _>("timestamp"),
            open: decimal("open")?,
            high: decimal("high")?,
            low: decimal("low")?,
            close: decimal("close")?,
            volume: decimal("volume")?,
        })
    }
}
