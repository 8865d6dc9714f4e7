#![doc = include_str!("../README.md")]

/// Exports the agent fabric: [`SchedulerAgent`], [`OrchestratorAgent`], and
/// the message types they exchange.
///
/// [`SchedulerAgent`]: crate::agents::SchedulerAgent
/// [`OrchestratorAgent`]: crate::agents::OrchestratorAgent
pub mod agents;
/// Exports [`BacktestRunner`] and other types related to backtest
/// execution.
///
/// [`BacktestRunner`]: crate::backtest::BacktestRunner
pub mod backtest;
/// Exports [`CandleStore`], the per-symbol OHLCV store.
///
/// [`CandleStore`]: crate::db::CandleStore
pub mod db;
/// Metric helpers: Sharpe/Calmar ratios and metric-map extraction.
pub mod evaluation;
/// Exports [`Exchange`] and the order/trade/position model.
///
/// [`Exchange`]: crate::exchange::Exchange
pub mod exchange;
/// Stochastic RSI and Williams fractal evaluation.
pub mod indicators;
/// Exports [`LlmClient`] and the Groq-compatible REST client.
///
/// [`LlmClient`]: crate::llm::LlmClient
pub mod llm;
/// Market-data contracts: candles, symbol metadata, the external source,
/// and the feed the exchange and strategies consume.
pub mod market;
/// Exports [`ResultsRepository`], the durable JSON results store.
///
/// [`ResultsRepository`]: crate::registry::ResultsRepository
pub mod registry;
/// Exports [`MarketDataSimulator`], the deterministic candle replay.
///
/// [`MarketDataSimulator`]: crate::simulator::MarketDataSimulator
pub mod simulator;
/// Exports the [`Strategy`] contract, the factory registry, and the
/// built-in `carga_descarga` strategy.
///
/// [`Strategy`]: crate::strategy::Strategy
pub mod strategy;

mod shared;
mod util;

pub use shared::{Millis, ONE_MINUTE_MS, RsiLimits, Timeframe, TimeframeSet};

/// Error types returned by `stratagem`.
pub mod error {
    pub use super::agents::error::{AgentError, ErrorCode};
    pub use super::backtest::error::BacktestError;
    pub use super::db::error::DbError;
    pub use super::exchange::error::ExchangeError;
    pub use super::indicators::error::IndicatorError;
    pub use super::llm::error::LlmError;
    pub use super::market::error::MarketError;
    pub use super::registry::error::RegistryError;
    pub use super::shared::error::{RsiLimitsValidationError, TimeframeSetValidationError};
    pub use super::simulator::error::SimulatorError;
    pub use super::strategy::error::StrategyError;
}

/// Frequently used model types, re-exported for convenience.
pub mod models {
    pub use super::agents::{
        AgentMessage, BacktestResultsResponse, BacktestStatus, ErrorResponse, EvaluationRequest,
        EvaluationResponse, OptimizationRequest, OptimizationResult, Payload, Recommendation,
        StartBacktestRequest,
    };
    pub use super::backtest::{BacktestConfig, BacktestResults};
    pub use super::exchange::{
        Order, OrderSide, OrderStatus, OrderType, Position, PositionSide, Trade,
    };
    pub use super::market::{Candle, SymbolInfo};
    pub use super::strategy::Cycle;
}
