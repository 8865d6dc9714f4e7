use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use std::sync::Arc;

use tracing::warn;

use crate::{
    market::{Candle, CandleListener, ListenerId},
    shared::Timeframe,
};

/// Fan-out of completed candles to `(symbol, timeframe)` subscribers.
///
/// A handler that fails is logged and skipped without affecting siblings.
/// The registration map is guarded by a plain mutex that is never held
/// across a handler call.
#[derive(Default)]
pub struct CandleDispatcher {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<(String, Timeframe), Vec<(ListenerId, Arc<dyn CandleListener>)>>>,
}

impl CandleDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        listener: Arc<dyn CandleListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .entry((symbol.to_string(), timeframe))
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove(&self, symbol: &str, timeframe: Timeframe, id: ListenerId) {
        let mut listeners = self
            .listeners
            .lock()
            .expect("dispatcher mutex can't be poisoned");
        if let Some(entries) = listeners.get_mut(&(symbol.to_string(), timeframe)) {
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                listeners.remove(&(symbol.to_string(), timeframe));
            }
        }
    }

    /// Drops every registered listener. Used when the replay window is
    /// reconfigured and a fresh set of subscribers will be wired.
    pub fn clear(&self) {
        self.listeners
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .clear();
    }

    pub async fn dispatch(&self, candle: &Candle) {
        let entries = {
            let listeners = self
                .listeners
                .lock()
                .expect("dispatcher mutex can't be poisoned");
            listeners
                .get(&(candle.symbol.clone(), candle.timeframe))
                .cloned()
                .unwrap_or_default()
        };

        for (_, listener) in entries {
            if let Err(error) = listener.on_candle(candle).await {
                warn!(
                    symbol = %candle.symbol,
                    timeframe = %candle.timeframe,
                    %error,
                    "candle listener failed"
                );
            }
        }
    }
}
