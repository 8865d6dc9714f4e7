use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use uuid::Uuid;

use crate::{
    backtest::BacktestResults,
    shared::{Millis, RsiLimits, Timeframe, TimeframeSet},
};

use super::error::{AgentError, Result};

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_initial_balance() -> Decimal {
    Decimal::from(2500)
}

fn default_leverage() -> Decimal {
    Decimal::from(100)
}

fn default_maker_fee() -> Decimal {
    Decimal::new(2, 4) // 0.0002
}

fn default_taker_fee() -> Decimal {
    Decimal::new(5, 4) // 0.0005
}

fn default_max_notional() -> Decimal {
    Decimal::from(50_000)
}

fn default_strategy_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_loss() -> f64 {
    0.5
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::M1, Timeframe::M15, Timeframe::H1]
}

fn default_objective() -> String {
    "sharpe_ratio".to_string()
}

fn default_limit() -> usize {
    100
}

/// Request to start a backtest. Unspecified fields take the documented
/// defaults; `validate` enforces the timeframe-count and RSI-triple rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartBacktestRequest {
    #[serde(default = "new_run_id")]
    pub run_id: String,
    pub symbol: String,
    pub start_time: Millis,
    #[serde(default)]
    pub end_time: Option<Millis>,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: Decimal,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
    #[serde(default = "default_max_notional")]
    pub max_notional: Decimal,
    #[serde(default = "default_strategy_name")]
    pub strategy_name: String,
    #[serde(default = "default_true")]
    pub stop_on_loss: bool,
    #[serde(default = "default_max_loss")]
    pub max_loss_percentage: f64,
    #[serde(default = "default_true")]
    pub track_cycles: bool,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,
    #[serde(default)]
    pub rsi_limits: Option<Vec<i64>>,
}

impl StartBacktestRequest {
    pub fn new(symbol: impl Into<String>, start_time: Millis) -> Self {
        Self {
            run_id: new_run_id(),
            symbol: symbol.into(),
            start_time,
            end_time: None,
            initial_balance: default_initial_balance(),
            leverage: default_leverage(),
            maker_fee: default_maker_fee(),
            taker_fee: default_taker_fee(),
            max_notional: default_max_notional(),
            strategy_name: default_strategy_name(),
            stop_on_loss: true,
            max_loss_percentage: default_max_loss(),
            track_cycles: true,
            timeframes: default_timeframes(),
            rsi_limits: None,
        }
    }

    /// Validates the timeframe set (2–4 entries) and the optional RSI
    /// triple (ascending, in `[0, 100]`).
    pub fn validate(&self) -> Result<(TimeframeSet, Option<RsiLimits>)> {
        let timeframes = TimeframeSet::try_from(self.timeframes.clone())
            .map_err(AgentError::InvalidTimeframes)?;

        let rsi_limits = self
            .rsi_limits
            .clone()
            .map(RsiLimits::try_from)
            .transpose()
            .map_err(AgentError::InvalidRsiLimits)?;

        Ok((timeframes, rsi_limits))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BacktestStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestStatusUpdate {
    pub run_id: String,
    pub status: BacktestStatus,
    pub candles_processed: u64,
    pub current_balance: Decimal,
    pub execution_time_seconds: f64,
    pub candles_per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResultsResponse {
    pub run_id: String,
    pub status: BacktestStatus,
    pub results: BacktestResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub run_id: String,
    #[serde(default)]
    pub metrics: Option<Vec<String>>,
    #[serde(default)]
    pub kpis: Option<BTreeMap<String, f64>>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Recommendation {
    Promote,
    Reject,
    Optimize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResponse {
    pub run_id: String,
    pub passed: bool,
    pub metrics: BTreeMap<String, f64>,
    pub kpi_compliance: BTreeMap<String, bool>,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRequest {
    #[serde(default = "new_run_id")]
    pub run_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub parameter_space: BTreeMap<String, Value>,
    #[serde(default = "default_objective")]
    pub objective: String,
    #[serde(default)]
    pub base_config: Option<StartBacktestRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub run_id: String,
    pub strategy_name: String,
    pub parameters: BTreeMap<String, Value>,
    pub reasoning: String,
    pub confidence: f64,
    pub expected_improvement: BTreeMap<String, f64>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResultsRequest {
    pub run_id: String,
    pub strategy_name: String,
    pub symbol: String,
    #[serde(default)]
    pub backtest_results: Option<BacktestResultsResponse>,
    #[serde(default)]
    pub evaluation_results: Option<EvaluationResponse>,
    #[serde(default)]
    pub optimization_results: Option<OptimizationResult>,
    /// Extra key/value pairs merged into every stored payload.
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreResultsResponse {
    pub run_id: String,
    pub storage_id: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResultsRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub strategy_name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResultsResponse {
    pub results: Vec<Value>,
    pub total_count: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub error_message: String,
    #[serde(default)]
    pub error_details: Option<Value>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl ErrorResponse {
    pub fn from_error(error: &AgentError, run_id: Option<String>) -> Self {
        Self {
            error_code: error.code().to_string(),
            error_message: error.to_string(),
            error_details: None,
            run_id,
        }
    }
}

/// Message payload: one of the request/response variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    StartBacktestRequest(StartBacktestRequest),
    BacktestStatusUpdate(BacktestStatusUpdate),
    BacktestResultsResponse(BacktestResultsResponse),
    EvaluationRequest(EvaluationRequest),
    EvaluationResponse(EvaluationResponse),
    OptimizationRequest(OptimizationRequest),
    OptimizationResult(OptimizationResult),
    StoreResultsRequest(StoreResultsRequest),
    StoreResultsResponse(StoreResultsResponse),
    RetrieveResultsRequest(RetrieveResultsRequest),
    RetrieveResultsResponse(RetrieveResultsResponse),
    Error(ErrorResponse),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::StartBacktestRequest(_) => "start_backtest_request",
            Payload::BacktestStatusUpdate(_) => "backtest_status_update",
            Payload::BacktestResultsResponse(_) => "backtest_results_response",
            Payload::EvaluationRequest(_) => "evaluation_request",
            Payload::EvaluationResponse(_) => "evaluation_response",
            Payload::OptimizationRequest(_) => "optimization_request",
            Payload::OptimizationResult(_) => "optimization_result",
            Payload::StoreResultsRequest(_) => "store_results_request",
            Payload::StoreResultsResponse(_) => "store_results_response",
            Payload::RetrieveResultsRequest(_) => "retrieve_results_request",
            Payload::RetrieveResultsResponse(_) => "retrieve_results_response",
            Payload::Error(_) => "error",
        }
    }
}

/// Envelope for agent-to-agent messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub flow_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl AgentMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        flow_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            from: from.into(),
            to: to.into(),
            flow_id: flow_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_match_the_documented_values() {
        let request = StartBacktestRequest::new("BTCUSDT", 1_744_023_500_000);
        assert_eq!(request.initial_balance, Decimal::from(2500));
        assert_eq!(request.leverage, Decimal::from(100));
        assert_eq!(request.maker_fee, Decimal::new(2, 4));
        assert_eq!(request.taker_fee, Decimal::new(5, 4));
        assert_eq!(request.max_notional, Decimal::from(50_000));
        assert_eq!(request.strategy_name, "default");
        assert!(request.stop_on_loss);
        assert!(request.track_cycles);
        assert_eq!(
            request.timeframes,
            vec![Timeframe::M1, Timeframe::M15, Timeframe::H1]
        );
        assert!(request.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_rsi_limits() {
        let mut request = StartBacktestRequest::new("BTCUSDT", 0);

        request.rsi_limits = Some(vec![15, 50]);
        assert!(matches!(
            request.validate(),
            Err(AgentError::InvalidRsiLimits(_))
        ));

        request.rsi_limits = Some(vec![15, 50, 101]);
        assert!(matches!(
            request.validate(),
            Err(AgentError::InvalidRsiLimits(_))
        ));

        request.rsi_limits = Some(vec![85, 50, 15]);
        assert!(matches!(
            request.validate(),
            Err(AgentError::InvalidRsiLimits(_))
        ));

        request.rsi_limits = Some(vec![15, 50, 85]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_timeframe_counts() {
        let mut request = StartBacktestRequest::new("BTCUSDT", 0);

        request.timeframes = vec![Timeframe::M1];
        assert!(matches!(
            request.validate(),
            Err(AgentError::InvalidTimeframes(_))
        ));

        request.timeframes = vec![
            Timeframe::M1,
            Timeframe::M3,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
        ];
        assert!(matches!(
            request.validate(),
            Err(AgentError::InvalidTimeframes(_))
        ));
    }

    #[test]
    fn payload_serializes_with_a_type_tag() {
        let payload = Payload::EvaluationRequest(EvaluationRequest {
            run_id: "r".to_string(),
            metrics: None,
            kpis: None,
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "evaluation_request");
        assert_eq!(value["run_id"], "r");

        let back: Payload = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), "evaluation_request");
    }

    #[test]
    fn request_deserializes_with_defaults_applied() {
        let raw = r#"{"symbol": "BTCUSDT", "start_time": 1744023500000}"#;
        let request: StartBacktestRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.strategy_name, "default");
        assert_eq!(request.max_loss_percentage, 0.5);
        assert!(!request.run_id.is_empty());
    }
}
