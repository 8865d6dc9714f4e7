use std::{collections::HashMap, sync::Arc, sync::Mutex as StdMutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{
    exchange::{Exchange, Trade},
    market::{Candle, ListenerResult, MarketFeed},
    shared::{Millis, RsiLimits, TimeframeSet},
};

pub mod error;

mod carga_descarga;

pub use carga_descarga::{CargaDescarga, CargaDescargaFactory, OperationsStatus};

use error::{Result, StrategyError};

/// A completed trading cycle: the interval between one moment where both
/// positions are flat and the next, enclosing at least one opening trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub cycle_id: String,
    pub symbol: String,
    pub strategy_name: String,
    pub start_timestamp: Millis,
    pub end_timestamp: Millis,
    pub total_pnl: Decimal,
    pub long_trades_count: u32,
    pub short_trades_count: u32,
    pub long_max_loads: u32,
    pub short_max_loads: u32,
}

impl Cycle {
    pub fn new(
        symbol: impl Into<String>,
        strategy_name: impl Into<String>,
        start_timestamp: Millis,
        end_timestamp: Millis,
        total_pnl: Decimal,
    ) -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            strategy_name: strategy_name.into(),
            start_timestamp,
            end_timestamp,
            total_pnl,
            long_trades_count: 0,
            short_trades_count: 0,
            long_max_loads: 0,
            short_max_loads: 0,
        }
    }

    pub fn duration_minutes(&self) -> f64 {
        (self.end_timestamp - self.start_timestamp) as f64 / 60_000.0
    }
}

#[async_trait]
pub trait CycleListener: Send + Sync {
    async fn on_cycle(&self, cycle: &Cycle) -> ListenerResult;
}

/// Fan-out of completed cycles. Failing listeners are logged and skipped.
#[derive(Default)]
pub struct CycleDispatcher {
    listeners: StdMutex<Vec<Arc<dyn CycleListener>>>,
}

impl CycleDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn CycleListener>) {
        self.listeners
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .push(listener);
    }

    pub async fn dispatch(&self, cycle: &Cycle) {
        let listeners = self
            .listeners
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .clone();
        for listener in listeners {
            if let Err(error) = listener.on_cycle(cycle).await {
                warn!(cycle_id = %cycle.cycle_id, %error, "cycle listener failed");
            }
        }
    }
}

/// The strategy capability set: candle and trade callbacks plus identity.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn symbol(&self) -> &str;

    async fn on_candle(&self, candle: &Candle) -> Result<()>;

    async fn on_trade(&self, trade: &Trade) -> Result<()>;
}

/// Everything a factory needs to build and wire one strategy instance for
/// one backtest.
pub struct StrategyContext {
    pub symbol: String,
    pub strategy_name: String,
    pub timeframes: TimeframeSet,
    pub rsi_limits: RsiLimits,
    pub exchange: Arc<Exchange>,
    pub feed: Arc<dyn MarketFeed>,
    pub cycle_dispatcher: Option<Arc<CycleDispatcher>>,
}

/// Builds a [`Strategy`] and registers its candle/trade subscriptions.
#[async_trait]
pub trait StrategyFactory: Send + Sync {
    async fn build(&self, ctx: StrategyContext) -> Result<Arc<dyn Strategy>>;
}

/// Name-keyed factory registry.
pub struct StrategyRegistry {
    factories: HashMap<String, Arc<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in strategies: `carga_descarga`, also
    /// reachable as `default`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let factory: Arc<dyn StrategyFactory> = Arc::new(CargaDescargaFactory);
        registry.register("carga_descarga", factory.clone());
        registry.register("default", factory);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn StrategyFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StrategyFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| StrategyError::UnknownStrategy {
                name: name.to_string(),
            })
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
