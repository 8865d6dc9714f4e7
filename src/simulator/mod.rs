use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    db::CandleStore,
    market::{
        Candle, CandleListener, ListenerId, MAX_KLINES_LIMIT, MarketDataSource, MarketFeed,
        SymbolInfo,
        error::{MarketError, Result as MarketResult},
    },
    shared::{Millis, ONE_MINUTE_MS, Timeframe},
    util::now_millis,
};

pub mod error;

mod dispatcher;

pub use dispatcher::CandleDispatcher;

use error::{Result, SimulatorError};

struct SimulatorState {
    configured: bool,
    start_time: Millis,
    end_time: Millis,
    min_candles: usize,
    /// Timestamp of the last emitted base candle; one millisecond before
    /// `start_time` until the first emission.
    cursor: Millis,
    symbols: HashMap<String, Vec<Timeframe>>,
    endeds: HashMap<String, bool>,
    last_emitted: HashMap<(String, Timeframe), Millis>,
}

impl SimulatorState {
    fn new() -> Self {
        Self {
            configured: false,
            start_time: 0,
            end_time: 0,
            min_candles: 0,
            cursor: 0,
            symbols: HashMap::new(),
            endeds: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }
}

/// Deterministic replay of historical candles for the subscribed
/// `(symbol, timeframe)` pairs.
///
/// Each `next_candle` call advances the cursor by one base-timeframe
/// candle per symbol, dispatching the base candle first and then any
/// higher-timeframe candle whose boundary was crossed, at most once per
/// boundary. Candles come from the local store; misses are backfilled
/// from the external source in batches of up to 1000.
pub struct MarketDataSimulator {
    store: CandleStore,
    source: Arc<dyn MarketDataSource>,
    dispatcher: CandleDispatcher,
    state: Mutex<SimulatorState>,
}

impl MarketDataSimulator {
    pub fn new(store: CandleStore, source: Arc<dyn MarketDataSource>) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            dispatcher: CandleDispatcher::new(),
            state: Mutex::new(SimulatorState::new()),
        })
    }

    pub fn store(&self) -> &CandleStore {
        &self.store
    }

    /// Configures the replay window. `end` defaults to one minute before
    /// now; a caller-supplied end at or past now is clamped with a warning.
    /// `min_candles` is the minimum backfill depth per subscribed
    /// timeframe before emission begins.
    pub async fn set_times(&self, start: Millis, end: Option<Millis>, min_candles: usize) {
        let now = now_millis();
        let end = match end {
            Some(end) if end >= now => {
                let clamped = now - ONE_MINUTE_MS;
                warn!(requested = end, clamped, "end time is in the future, clamping");
                clamped
            }
            Some(end) => end,
            None => now - ONE_MINUTE_MS,
        };

        let mut state = self.state.lock().await;
        state.configured = true;
        state.start_time = start;
        state.end_time = end;
        state.min_candles = min_candles;
        state.cursor = start - 1;

        // Reconfiguring restarts the replay: prior subscriptions, symbol
        // registrations, and boundary bookkeeping no longer apply.
        state.symbols.clear();
        state.endeds.clear();
        state.last_emitted.clear();
        self.dispatcher.clear();

        info!(
            start,
            end,
            duration_ms = end - start,
            "simulator time range configured"
        );
    }

    /// Registers a symbol with its replay timeframes. For every timeframe
    /// the cursor is rewound so that at least `min_candles x
    /// timeframe_ms` of history is fed before the effective start time.
    pub async fn add_symbol(&self, symbol: &str, timeframes: Vec<Timeframe>) -> Result<()> {
        if timeframes.is_empty() {
            return Err(SimulatorError::EmptyTimeframes {
                symbol: symbol.to_string(),
            });
        }

        let mut state = self.state.lock().await;
        if !state.configured {
            return Err(MarketError::NotConfigured.into());
        }

        let mut timeframes = timeframes;
        timeframes.sort();
        timeframes.dedup();

        for timeframe in &timeframes {
            let rewound = state.start_time - timeframe.duration_ms() * state.min_candles as i64;
            if rewound < state.cursor {
                state.cursor = rewound;
            }
        }

        debug!(symbol, ?timeframes, cursor = state.cursor, "symbol registered");
        state.symbols.insert(symbol.to_string(), timeframes);
        state.endeds.insert(symbol.to_string(), false);

        Ok(())
    }

    /// Effective `(start_time, end_time)` of the replay window, after any
    /// end-time clamping.
    pub async fn time_range(&self) -> (Millis, Millis) {
        let state = self.state.lock().await;
        (state.start_time, state.end_time)
    }

    pub async fn ended(&self, symbol: &str) -> bool {
        self.state
            .lock()
            .await
            .endeds
            .get(symbol)
            .copied()
            .unwrap_or(false)
    }

    async fn mark_ended(&self, symbol: &str) {
        self.state
            .lock()
            .await
            .endeds
            .insert(symbol.to_string(), true);
    }

    /// Advances the cursor by one base candle for every registered symbol.
    pub async fn next_candle(&self) -> Result<()> {
        let symbols: Vec<(String, Vec<Timeframe>)> = {
            let state = self.state.lock().await;
            state
                .symbols
                .iter()
                .map(|(s, tfs)| (s.clone(), tfs.clone()))
                .collect()
        };

        for (symbol, timeframes) in symbols {
            if self.ended(&symbol).await {
                continue;
            }
            self.advance_symbol(&symbol, &timeframes).await?;
        }

        Ok(())
    }

    async fn advance_symbol(&self, symbol: &str, timeframes: &[Timeframe]) -> Result<()> {
        let base = Timeframe::base_of(timeframes);
        let base_ms = base.duration_ms();

        let (mut cursor, start_time, end_time) = {
            let state = self.state.lock().await;
            (state.cursor, state.start_time, state.end_time)
        };

        // The next candle would start at or past the end of the window.
        if cursor >= start_time && cursor + base_ms >= end_time {
            info!(symbol, cursor, end_time, "replay window exhausted");
            self.mark_ended(symbol).await;
            return Ok(());
        }

        // Warmup: feed history up to the effective start without
        // dispatching, so indicator lookbacks find their candles.
        let candle = loop {
            let candle = self.next_base_candle(symbol, cursor, base).await?;
            cursor = candle.timestamp;
            if candle.timestamp >= start_time {
                break candle;
            }
        };

        {
            let mut state = self.state.lock().await;
            state.cursor = cursor;
        }

        if candle.timestamp >= end_time {
            info!(symbol, timestamp = candle.timestamp, "reached end of window");
            self.mark_ended(symbol).await;
            return Ok(());
        }

        self.dispatcher.dispatch(&candle).await;

        for timeframe in timeframes {
            if *timeframe == base {
                continue;
            }
            self.emit_completed(symbol, *timeframe, cursor).await?;
        }

        let ended = {
            let state = self.state.lock().await;
            state.cursor >= state.end_time
        };
        if ended {
            warn!(symbol, cursor, "cursor reached end time, ending replay");
            self.mark_ended(symbol).await;
        }

        Ok(())
    }

    /// Next base candle strictly after `cursor`, backfilling from the
    /// source on a store miss or when the store jumps past an expected
    /// gap.
    async fn next_base_candle(
        &self,
        symbol: &str,
        cursor: Millis,
        base: Timeframe,
    ) -> Result<Candle> {
        let mut candle = self
            .store
            .get_next_candle(symbol, cursor, base)
            .await
            .map_err(MarketError::Store)?;

        let needs_fetch = match &candle {
            None => true,
            Some(c) => c.timestamp > cursor + base.duration_ms(),
        };

        if needs_fetch {
            let fetched = self
                .source
                .klines(symbol, base, MAX_KLINES_LIMIT, Some(cursor), None)
                .await?;
            info!(symbol, count = fetched.len(), "backfilled candles from source");
            self.store
                .add_candles(&fetched)
                .await
                .map_err(MarketError::Store)?;
            candle = self
                .store
                .get_next_candle(symbol, cursor, base)
                .await
                .map_err(MarketError::Store)?;
        }

        candle.ok_or_else(|| {
            MarketError::NoCandlesAvailable {
                symbol: symbol.to_string(),
                timestamp: cursor,
            }
            .into()
        })
    }

    /// Emits the just-completed candle of a higher timeframe, at most once
    /// per boundary.
    async fn emit_completed(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        cursor: Millis,
    ) -> Result<()> {
        let window = self.window_candles(symbol, timeframe, 1, cursor).await?;
        let Some(candle) = window.first() else {
            return Ok(());
        };

        let key = (symbol.to_string(), timeframe);
        let fresh = {
            let mut state = self.state.lock().await;
            let last = state.last_emitted.get(&key).copied();
            if last.is_none_or(|last| candle.timestamp > last) {
                state.last_emitted.insert(key, candle.timestamp);
                true
            } else {
                false
            }
        };

        if fresh {
            self.dispatcher.dispatch(candle).await;
        }

        Ok(())
    }

    /// Completed-candle window ending one `timeframe` behind the cursor:
    /// store first, then a <=1000-candle source backfill when the store is
    /// short or stale.
    async fn window_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        cursor: Millis,
    ) -> MarketResult<Vec<Candle>> {
        let tf_ms = timeframe.duration_ms();

        let start_time = {
            let state = self.state.lock().await;
            state.start_time
        };
        let reference = if cursor < start_time { start_time } else { cursor };
        let end_time = reference - tf_ms;
        let from = end_time - tf_ms * limit as i64;

        let mut candles = self.store.get_candles(symbol, timeframe, limit, from).await?;

        if candles.len() < limit {
            let fetched = self
                .source
                .klines(symbol, timeframe, MAX_KLINES_LIMIT, Some(from), None)
                .await?;
            self.store.add_candles(&fetched).await?;
            candles = self.store.get_candles(symbol, timeframe, limit, from).await?;
        }

        if let Some(last) = candles.last()
            && last.timestamp > end_time + ONE_MINUTE_MS
        {
            let fetched = self
                .source
                .klines(symbol, timeframe, MAX_KLINES_LIMIT, Some(from), None)
                .await?;
            self.store.add_candles(&fetched).await?;
            candles = self.store.get_candles(symbol, timeframe, limit, from).await?;
        }

        candles.truncate(limit);
        Ok(candles)
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[async_trait]
impl MarketFeed for MarketDataSimulator {
    async fn candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> MarketResult<Vec<Candle>> {
        let cursor = {
            let state = self.state.lock().await;
            state.cursor
        };
        self.window_candles(symbol, timeframe, limit, cursor).await
    }

    async fn symbol_info(&self, symbol: &str) -> MarketResult<SymbolInfo> {
        self.source.symbol_info(symbol).await
    }

    async fn subscribe(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        listener: Arc<dyn CandleListener>,
    ) -> MarketResult<ListenerId> {
        {
            let state = self.state.lock().await;
            if !state.configured {
                return Err(MarketError::NotConfigured);
            }
        }
        Ok(self.dispatcher.add(symbol, timeframe, listener))
    }

    async fn unsubscribe(&self, symbol: &str, timeframe: Timeframe, id: ListenerId) {
        self.dispatcher.remove(symbol, timeframe, id);
    }
}
