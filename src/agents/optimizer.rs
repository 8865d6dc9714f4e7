use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{Instrument, info, warn};

use crate::{
    evaluation,
    llm::{ChatMessage, LlmClient},
    shared::{RsiLimits, Timeframe},
};

use super::{
    Agent, AgentCore, AgentMessage, BacktestResultsResponse, OptimizationRequest,
    OptimizationResult, Policy, PolicyMap,
    error::Result,
};

const LLM_TEMPERATURE: f64 = 0.3;
const LLM_MAX_TOKENS: u32 = 2048;
const CONTEXT_RESULTS: usize = 5;
const FALLBACK_CONFIDENCE: f64 = 0.4;

/// Proposes new strategy parameters from prior results, via the configured
/// LLM or a deterministic heuristic fallback.
pub struct OptimizerAgent {
    core: AgentCore,
    llm: Option<Arc<dyn LlmClient>>,
}

impl OptimizerAgent {
    pub fn new(run_id: Option<String>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        let policies: PolicyMap = [
            ("max_optimization_iterations", Policy::max(5.0)),
            ("min_confidence_threshold", Policy::min(0.5)),
        ]
        .into_iter()
        .collect();

        Self {
            core: AgentCore::new("optimizer", run_id, policies),
            llm,
        }
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn optimize(
        &self,
        request: &OptimizationRequest,
        previous_results: &[BacktestResultsResponse],
    ) -> Result<OptimizationResult> {
        let ctx = self.core.context("optimize");
        async {
            let Some(llm) = &self.llm else {
                return Ok(self.fallback_optimize(request, previous_results));
            };

            info!(strategy = %request.strategy_name, "calling LLM for optimization");
            match self.optimize_with_llm(llm.as_ref(), request, previous_results).await {
                Ok(result) => Ok(result),
                Err(error) => {
                    warn!(%error, "LLM optimization failed, using deterministic fallback");
                    Ok(self.fallback_optimize(request, previous_results))
                }
            }
        }
        .instrument(ctx.span())
        .await
    }

    async fn optimize_with_llm(
        &self,
        llm: &dyn LlmClient,
        request: &OptimizationRequest,
        previous_results: &[BacktestResultsResponse],
    ) -> Result<OptimizationResult> {
        let prompt = Self::build_prompt(request, previous_results);

        let messages = [
            ChatMessage::system(
                "You are an expert quantitative trading strategy optimizer. Analyze backtest \
                 results and suggest parameter improvements based on patterns.",
            ),
            ChatMessage::user(prompt),
        ];

        let (parsed, response) = llm
            .chat_json(&messages, LLM_TEMPERATURE, LLM_MAX_TOKENS)
            .await?;

        let suggested = parsed
            .get("optimized_parameters")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let reasoning = parsed
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or("No reasoning provided")
            .to_string();
        let confidence = parsed
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let expected_improvement = parsed
            .get("expected_improvement")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let parameters = Self::validate_parameters(&suggested, &request.parameter_space);

        Ok(OptimizationResult {
            run_id: request.run_id.clone(),
            strategy_name: request.strategy_name.clone(),
            parameters,
            reasoning,
            confidence,
            expected_improvement,
            metadata: json!({
                "model": response.model,
                "usage": response.usage,
                "finish_reason": response.finish_reason,
            }),
        })
    }

    fn build_prompt(
        request: &OptimizationRequest,
        previous_results: &[BacktestResultsResponse],
    ) -> String {
        let mut current_params = serde_json::Map::new();
        if let Some(base) = &request.base_config {
            if let Some(rsi_limits) = &base.rsi_limits {
                current_params.insert("rsi_limits".to_string(), json!(rsi_limits));
            }
            current_params.insert(
                "timeframes".to_string(),
                json!(
                    base.timeframes
                        .iter()
                        .map(Timeframe::to_string)
                        .collect::<Vec<_>>()
                ),
            );
        }

        let context: Vec<Value> = previous_results
            .iter()
            .rev()
            .take(CONTEXT_RESULTS)
            .rev()
            .enumerate()
            .map(|(i, result)| {
                let metrics = evaluation::extract_metrics(&result.results, true);
                json!({
                    "run": i + 1,
                    "metrics": {
                        "sharpe_ratio": metrics.get("sharpe_ratio"),
                        "max_drawdown": result.results.max_drawdown,
                        "profit_factor": result.results.profit_factor,
                        "win_rate": result.results.win_rate,
                        "return_percentage": result.results.return_percentage,
                    },
                    "parameters": Value::Object(current_params.clone()),
                })
            })
            .collect();

        let history = if context.is_empty() {
            "No previous results available".to_string()
        } else {
            serde_json::to_string_pretty(&context).unwrap_or_default()
        };

        format!(
            r#"You are optimizing a trading strategy called "{strategy}" for symbol {symbol}.

OBJECTIVE: Maximize {objective}

CURRENT PARAMETERS:
{current}

PARAMETER SPACE (valid ranges):
{space}

HISTORICAL RESULTS:
{history}

STRATEGY CONTEXT:
- This is a load/unload strategy gated by Stochastic RSI levels
- RSI limits: [low, medium, high] where low < medium < high, all in range 0-100
- Timeframes: list of timeframe strings like ["1m", "15m", "1h"]
- Lower RSI thresholds = more aggressive entries (more trades, higher risk)
- Higher RSI thresholds = more conservative entries (fewer trades, lower risk)

TASK:
1. Analyze the historical results and identify patterns
2. Suggest optimized parameter values within the parameter space
3. Explain your reasoning based on the metrics
4. Estimate expected improvements for key metrics
5. Provide confidence level (0.0-1.0) for your suggestions

RESPONSE FORMAT (JSON only):
{{
  "optimized_parameters": {{
    "rsi_limits": [low, medium, high] or null,
    "timeframes": ["1m", "15m", "1h"] or null
  }},
  "reasoning": "Detailed explanation of why these parameters should improve performance",
  "confidence": 0.75,
  "expected_improvement": {{
    "sharpe_ratio": 0.3,
    "profit_factor": 0.2,
    "max_drawdown": -0.05
  }}
}}

IMPORTANT:
- Only suggest parameters that are in the parameter_space
- For rsi_limits: must be exactly 3 values, ascending order, all 0-100
- For timeframes: must be valid timeframe strings
- If a parameter shouldn't change, set it to null
- Be specific and data-driven in your reasoning"#,
            strategy = request.strategy_name,
            symbol = request.symbol,
            objective = request.objective,
            current = serde_json::to_string_pretty(&Value::Object(current_params))
                .unwrap_or_default(),
            space = serde_json::to_string_pretty(&request.parameter_space).unwrap_or_default(),
            history = history,
        )
    }

    /// Validates suggested parameters against the declared space. Unknown
    /// keys are dropped; invalid values drop the whole key with a warning,
    /// never a failure.
    fn validate_parameters(
        suggested: &Value,
        parameter_space: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, Value> {
        let mut validated = BTreeMap::new();

        let Some(suggested) = suggested.as_object() else {
            warn!("suggested parameters are not an object, ignoring");
            return validated;
        };

        if let Some(rsi_value) = suggested.get("rsi_limits").filter(|v| !v.is_null()) {
            match Self::parse_rsi_limits(rsi_value) {
                Some(limits) => {
                    validated.insert("rsi_limits".to_string(), json!(Vec::<i64>::from(limits)));
                }
                None => warn!(value = %rsi_value, "invalid rsi_limits from LLM, ignoring"),
            }
        }

        if let Some(tf_value) = suggested.get("timeframes").filter(|v| !v.is_null()) {
            match Self::parse_timeframes(tf_value) {
                Some(timeframes) => {
                    validated.insert("timeframes".to_string(), json!(timeframes));
                }
                None => warn!(value = %tf_value, "invalid timeframes from LLM, ignoring"),
            }
        }

        // Remaining keys must both exist in the space and suggest values
        // drawn from it.
        for (name, allowed) in parameter_space {
            if validated.contains_key(name) || name == "rsi_limits" || name == "timeframes" {
                continue;
            }
            let Some(value) = suggested.get(name).filter(|v| !v.is_null()) else {
                continue;
            };
            let Some(allowed) = allowed.as_array() else {
                continue;
            };

            let acceptable = match value {
                Value::Array(values) => values.iter().all(|v| allowed.contains(v)),
                scalar => allowed.contains(scalar),
            };
            if acceptable {
                validated.insert(name.clone(), value.clone());
            } else {
                warn!(parameter = %name, "suggested value outside parameter space, ignoring");
            }
        }

        if validated.is_empty() {
            warn!("no valid parameters from LLM");
        }

        validated
    }

    fn parse_rsi_limits(value: &Value) -> Option<RsiLimits> {
        let values = value.as_array()?;
        let ints: Vec<i64> = values
            .iter()
            .map(|v| {
                v.as_i64()
                    .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            })
            .collect::<Option<Vec<i64>>>()?;
        RsiLimits::try_from(ints).ok()
    }

    fn parse_timeframes(value: &Value) -> Option<Vec<String>> {
        let values = value.as_array()?;
        let timeframes: Vec<Timeframe> = values
            .iter()
            .map(|v| v.as_str().and_then(|s| s.parse().ok()))
            .collect::<Option<Vec<Timeframe>>>()?;
        Some(timeframes.iter().map(Timeframe::to_string).collect())
    }

    /// Deterministic heuristic when no LLM is configured or it fails:
    /// widen the outer RSI bounds for a weak profit factor, tighten them
    /// toward center for an excessive drawdown.
    fn fallback_optimize(
        &self,
        request: &OptimizationRequest,
        previous_results: &[BacktestResultsResponse],
    ) -> OptimizationResult {
        info!("using fallback deterministic optimization");

        let current = request
            .base_config
            .as_ref()
            .and_then(|c| c.rsi_limits.clone())
            .and_then(|v| <[i64; 3]>::try_from(v).ok())
            .unwrap_or([15, 50, 85]);

        let mut parameters = BTreeMap::new();

        if let Some(latest) = previous_results.last() {
            let adjusts_rsi = request.parameter_space.contains_key("rsi_limits");

            if latest.results.profit_factor < 1.5 && adjusts_rsi {
                parameters.insert(
                    "rsi_limits".to_string(),
                    json!([
                        (current[0] - 5).max(5),
                        current[1],
                        (current[2] + 5).min(95),
                    ]),
                );
            } else if latest.results.max_drawdown > 10.0 && adjusts_rsi {
                parameters.insert(
                    "rsi_limits".to_string(),
                    json!([
                        (current[0] + 5).min(30),
                        current[1],
                        (current[2] - 5).max(70),
                    ]),
                );
            }
        }

        OptimizationResult {
            run_id: request.run_id.clone(),
            strategy_name: request.strategy_name.clone(),
            parameters,
            reasoning: "Fallback optimization: adjusted RSI thresholds from profit_factor and \
                        max_drawdown of the most recent result."
                .to_string(),
            confidence: FALLBACK_CONFIDENCE,
            expected_improvement: BTreeMap::new(),
            metadata: json!({"method": "fallback_deterministic"}),
        }
    }
}

#[async_trait]
impl Agent for OptimizerAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.mark_initialized() {
            let ctx = self.core.context("init");
            let _guard = ctx.span().entered();
            if self.llm.is_some() {
                info!("OptimizerAgent initialized with LLM client");
            } else {
                warn!("LLM client not available, OptimizerAgent will use fallback optimization");
            }
        }
        Ok(())
    }

    async fn handle_message(&self, message: AgentMessage) -> AgentMessage {
        let ctx = self.core.context(&message.flow_id);
        async { self.core.unknown_message_reply(&message) }
            .instrument(ctx.span())
            .await
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            let ctx = self.core.context("cleanup");
            let _guard = ctx.span().entered();
            info!("OptimizerAgent closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rust_decimal_macros::dec;

    use crate::{
        agents::BacktestStatus,
        backtest::BacktestResults,
        llm::{ChatResponse, Usage, error::Result as LlmResult},
    };

    struct CannedLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _temperature: f64,
            _max_tokens: u32,
        ) -> LlmResult<ChatResponse> {
            Ok(ChatResponse {
                content: self.reply.clone(),
                model: "canned".to_string(),
                usage: Usage::default(),
                finish_reason: "stop".to_string(),
            })
        }
    }

    fn results_with(profit_factor: f64, max_drawdown: f64) -> BacktestResultsResponse {
        BacktestResultsResponse {
            run_id: "run-1".to_string(),
            status: BacktestStatus::Completed,
            results: BacktestResults {
                run_id: "run-1".to_string(),
                symbol: "BTCUSDT".to_string(),
                strategy_name: "carga_descarga".to_string(),
                start_time: 0,
                end_time: 86_400_000,
                duration_seconds: 86_400.0,
                total_candles_processed: 1440,
                final_balance: dec!(2600),
                total_return: dec!(100),
                return_percentage: 4.0,
                max_drawdown,
                total_trades: 10,
                win_rate: 60.0,
                profit_factor,
                total_closed_positions: 5,
                winning_positions: 3,
                losing_positions: 2,
                average_trade_size: dec!(500),
                total_commission: dec!(2),
                commission_percentage: 2.0,
                total_closing_trades: 5,
                partial_closing_trades: 0,
                full_closing_trades: 5,
                winning_closing_trades: 3,
                losing_closing_trades: 2,
                partial_winning_trades: 0,
                partial_losing_trades: 0,
                full_winning_trades: 3,
                full_losing_trades: 2,
                total_cycles: 0,
                avg_cycle_duration: 0.0,
                avg_cycle_pnl: 0.0,
                winning_cycles: 0,
                losing_cycles: 0,
                cycle_win_rate: 0.0,
            },
        }
    }

    fn request() -> OptimizationRequest {
        OptimizationRequest {
            run_id: "opt-1".to_string(),
            strategy_name: "carga_descarga".to_string(),
            symbol: "BTCUSDT".to_string(),
            parameter_space: [
                ("rsi_limits".to_string(), json!([0, 100])),
                ("timeframes".to_string(), json!(["1m", "15m", "1h", "4h"])),
            ]
            .into_iter()
            .collect(),
            objective: "sharpe_ratio".to_string(),
            base_config: None,
        }
    }

    #[tokio::test]
    async fn llm_suggestion_is_validated_and_clamped() {
        let reply = r#"```json
{
  "optimized_parameters": {
    "rsi_limits": [10, 50, 90],
    "timeframes": ["1m", "1h"],
    "mystery_knob": 42
  },
  "reasoning": "wider bands",
  "confidence": 1.7,
  "expected_improvement": {"sharpe_ratio": 0.3}
}
```"#;
        let agent = OptimizerAgent::new(
            None,
            Some(Arc::new(CannedLlm {
                reply: reply.to_string(),
            })),
        );

        let result = agent.optimize(&request(), &[]).await.unwrap();
        assert_eq!(result.parameters["rsi_limits"], json!([10, 50, 90]));
        assert_eq!(result.parameters["timeframes"], json!(["1m", "1h"]));
        assert!(!result.parameters.contains_key("mystery_knob"));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.expected_improvement["sharpe_ratio"], 0.3);
        assert_eq!(result.metadata["model"], "canned");
    }

    #[tokio::test]
    async fn invalid_rsi_suggestions_are_dropped_not_fatal() {
        for bad in [
            r#"{"optimized_parameters": {"rsi_limits": [90, 50, 10]}, "confidence": 0.6}"#,
            r#"{"optimized_parameters": {"rsi_limits": [10, 50]}, "confidence": 0.6}"#,
            r#"{"optimized_parameters": {"rsi_limits": [10, 50, 120]}, "confidence": 0.6}"#,
            r#"{"optimized_parameters": {"rsi_limits": [10.5, 50, 90]}, "confidence": 0.6}"#,
        ] {
            let agent = OptimizerAgent::new(
                None,
                Some(Arc::new(CannedLlm {
                    reply: bad.to_string(),
                })),
            );
            let result = agent.optimize(&request(), &[]).await.unwrap();
            assert!(
                !result.parameters.contains_key("rsi_limits"),
                "should drop: {bad}"
            );
        }
    }

    #[tokio::test]
    async fn unparseable_reply_falls_back_to_heuristic() {
        let agent = OptimizerAgent::new(
            None,
            Some(Arc::new(CannedLlm {
                reply: "I think you should buy low and sell high".to_string(),
            })),
        );

        let previous = [results_with(1.2, 5.0)];
        let result = agent.optimize(&request(), &previous).await.unwrap();
        assert_eq!(result.confidence, 0.4);
        assert_eq!(result.metadata["method"], "fallback_deterministic");
        // Weak profit factor widens the outer bounds.
        assert_eq!(result.parameters["rsi_limits"], json!([10, 50, 90]));
    }

    #[tokio::test]
    async fn fallback_tightens_bounds_on_heavy_drawdown() {
        let agent = OptimizerAgent::new(None, None);

        let previous = [results_with(1.8, 15.0)];
        let result = agent.optimize(&request(), &previous).await.unwrap();
        assert_eq!(result.parameters["rsi_limits"], json!([20, 50, 80]));
        assert_eq!(result.confidence, 0.4);
    }

    #[tokio::test]
    async fn fallback_without_history_suggests_nothing() {
        let agent = OptimizerAgent::new(None, None);
        let result = agent.optimize(&request(), &[]).await.unwrap();
        assert!(result.parameters.is_empty());
        assert_eq!(result.metadata["method"], "fallback_deterministic");
    }
}
