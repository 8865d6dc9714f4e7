use std::result;

use strum::Display;
use thiserror::Error;

use crate::{
    backtest::error::BacktestError,
    exchange::error::ExchangeError,
    llm::error::LlmError,
    market::error::MarketError,
    registry::error::RegistryError,
    shared::error::{RsiLimitsValidationError, TimeframeSetValidationError},
    simulator::error::SimulatorError,
    strategy::error::StrategyError,
};

/// Wire-level error codes carried by `ErrorResponse.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownMessageType,
    InvalidTimeframes,
    InvalidRsiLimits,
    InvalidRequest,
    MaxConcurrentBacktests,
    MaxLossPercentageExceeded,
    InsufficientBalance,
    MaxNotionalExceeded,
    NoCandlesAvailable,
    InvalidResponse,
    HandlerError,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid timeframes: {0}")]
    InvalidTimeframes(#[from] TimeframeSetValidationError),

    #[error("Invalid RSI limits: {0}")]
    InvalidRsiLimits(#[from] RsiLimitsValidationError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown message type: {payload_kind}")]
    UnknownMessageType { payload_kind: String },

    #[error("Max concurrent backtests limit reached: {active}")]
    MaxConcurrentBacktests { active: usize },

    #[error("Max loss percentage exceeds policy: {value} > {max}")]
    MaxLossPercentageExceeded { value: f64, max: f64 },

    #[error("Policy violation for '{policy}': {value}")]
    PolicyViolation { policy: &'static str, value: f64 },

    #[error("[Backtest] {0}")]
    Backtest(#[from] BacktestError),

    #[error("[Simulator] {0}")]
    Simulator(#[from] SimulatorError),

    #[error("[Strategy] {0}")]
    Strategy(#[from] StrategyError),

    #[error("[Registry] {0}")]
    Registry(#[from] RegistryError),

    #[error("[Llm] {0}")]
    Llm(#[from] LlmError),
}

impl AgentError {
    /// Maps the error onto its wire code, digging through nested component
    /// errors where a specific code exists.
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::InvalidTimeframes(_) => ErrorCode::InvalidTimeframes,
            AgentError::InvalidRsiLimits(_) => ErrorCode::InvalidRsiLimits,
            AgentError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            AgentError::UnknownMessageType { .. } => ErrorCode::UnknownMessageType,
            AgentError::MaxConcurrentBacktests { .. } => ErrorCode::MaxConcurrentBacktests,
            AgentError::MaxLossPercentageExceeded { .. } => {
                ErrorCode::MaxLossPercentageExceeded
            }
            AgentError::PolicyViolation { .. } => ErrorCode::InvalidRequest,
            AgentError::Backtest(BacktestError::InvalidTimeframes(_)) => {
                ErrorCode::InvalidTimeframes
            }
            AgentError::Backtest(BacktestError::InvalidRsiLimits(_)) => {
                ErrorCode::InvalidRsiLimits
            }
            AgentError::Backtest(BacktestError::Simulator(simulator)) => {
                Self::simulator_code(simulator)
            }
            AgentError::Simulator(simulator) => Self::simulator_code(simulator),
            AgentError::Strategy(StrategyError::Exchange(exchange)) => match exchange {
                ExchangeError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
                ExchangeError::MaxNotionalExceeded { .. } => ErrorCode::MaxNotionalExceeded,
                _ => ErrorCode::HandlerError,
            },
            AgentError::Llm(LlmError::InvalidResponse { .. }) => ErrorCode::InvalidResponse,
            _ => ErrorCode::HandlerError,
        }
    }

    fn simulator_code(error: &SimulatorError) -> ErrorCode {
        match error {
            SimulatorError::Market(MarketError::NoCandlesAvailable { .. }) => {
                ErrorCode::NoCandlesAvailable
            }
            SimulatorError::InvalidTimeframes(_) | SimulatorError::EmptyTimeframes { .. } => {
                ErrorCode::InvalidTimeframes
            }
            _ => ErrorCode::HandlerError,
        }
    }
}

pub(crate) type Result<T> = result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_render_as_screaming_snake() {
        assert_eq!(
            ErrorCode::UnknownMessageType.to_string(),
            "UNKNOWN_MESSAGE_TYPE"
        );
        assert_eq!(ErrorCode::InvalidRsiLimits.to_string(), "INVALID_RSI_LIMITS");
        assert_eq!(
            ErrorCode::MaxConcurrentBacktests.to_string(),
            "MAX_CONCURRENT_BACKTESTS"
        );
        assert_eq!(
            ErrorCode::NoCandlesAvailable.to_string(),
            "NO_CANDLES_AVAILABLE"
        );
    }
}
