use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{Instrument, info, warn};

use crate::evaluation;

use super::{
    Agent, AgentCore, AgentMessage, BacktestResultsResponse, EvaluationRequest,
    EvaluationResponse, Payload, PolicyMap, Recommendation,
    error::Result,
};

/// Default KPI thresholds, overridable per request.
pub const DEFAULT_KPIS: [(&str, f64); 3] = [
    ("sharpe_ratio", 2.0),
    ("max_drawdown", 10.0),
    ("profit_factor", 1.5),
];

/// Turns a backtest result into KPI compliance, a pass flag, and a
/// promote/reject/optimize recommendation.
pub struct EvaluatorAgent {
    core: AgentCore,
}

impl EvaluatorAgent {
    pub fn new(run_id: Option<String>) -> Self {
        Self {
            core: AgentCore::new("evaluator", run_id, PolicyMap::new()),
        }
    }

    pub fn default_kpis() -> BTreeMap<String, f64> {
        DEFAULT_KPIS
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
        backtest_results: &BacktestResultsResponse,
    ) -> EvaluationResponse {
        let ctx = self.core.context("evaluate");
        async {
            let calculate_advanced = request
                .metrics
                .as_ref()
                .is_none_or(|m| m.iter().any(|name| name == "sharpe_ratio"));

            let all_metrics =
                evaluation::extract_metrics(&backtest_results.results, calculate_advanced);

            let metrics: BTreeMap<String, f64> = match &request.metrics {
                Some(requested) => all_metrics
                    .into_iter()
                    .filter(|(name, _)| requested.iter().any(|r| r == name))
                    .collect(),
                None => all_metrics,
            };

            let kpis = request.kpis.clone().unwrap_or_else(Self::default_kpis);

            let mut kpi_compliance = BTreeMap::new();
            for (kpi_name, threshold) in &kpis {
                let Some(metric_value) = metrics.get(kpi_name) else {
                    warn!(kpi = %kpi_name, "metric not found in results, failing KPI check");
                    kpi_compliance.insert(kpi_name.clone(), false);
                    continue;
                };

                // Drawdown: lower is better. Everything else: higher is
                // better.
                let compliant = if kpi_name == "max_drawdown" {
                    metric_value.abs() <= threshold.abs()
                } else {
                    metric_value >= threshold
                };
                kpi_compliance.insert(kpi_name.clone(), compliant);
            }

            let passed = !kpi_compliance.is_empty() && kpi_compliance.values().all(|v| *v);
            let recommendation =
                Self::generate_recommendation(passed, &kpi_compliance, &metrics, &kpis);

            info!(
                run_id = %request.run_id,
                passed,
                %recommendation,
                "evaluation completed"
            );

            EvaluationResponse {
                run_id: request.run_id.clone(),
                passed,
                metrics,
                kpi_compliance,
                recommendation,
            }
        }
        .instrument(ctx.span())
        .await
    }

    /// Promotion when every KPI holds; rejection on critical failures
    /// (drawdown beyond twice its limit, losing profit factor, negative
    /// Sharpe); optimization when every failing metric sits within 20% of
    /// its threshold.
    fn generate_recommendation(
        passed: bool,
        kpi_compliance: &BTreeMap<String, bool>,
        metrics: &BTreeMap<String, f64>,
        kpis: &BTreeMap<String, f64>,
    ) -> Recommendation {
        if passed {
            return Recommendation::Promote;
        }

        let mut critical_failure = false;
        let mut all_close_to_threshold = true;
        let mut any_failure = false;

        for (kpi_name, compliant) in kpi_compliance {
            if *compliant {
                continue;
            }
            any_failure = true;

            let threshold = kpis.get(kpi_name).copied().unwrap_or(0.0);
            let metric_value = metrics.get(kpi_name).copied().unwrap_or(0.0);

            match kpi_name.as_str() {
                "max_drawdown" => {
                    if metric_value.abs() > threshold.abs() * 2.0 {
                        critical_failure = true;
                    }
                    if metric_value.abs() > threshold.abs() * 1.2 {
                        all_close_to_threshold = false;
                    }
                }
                "profit_factor" => {
                    if metric_value < 1.0 {
                        critical_failure = true;
                    }
                    if metric_value < threshold * 0.8 {
                        all_close_to_threshold = false;
                    }
                }
                "sharpe_ratio" => {
                    if metric_value < 0.0 {
                        critical_failure = true;
                    }
                    if metric_value < threshold * 0.8 {
                        all_close_to_threshold = false;
                    }
                }
                _ => {
                    if metric_value < threshold * 0.8 {
                        all_close_to_threshold = false;
                    }
                }
            }
        }

        if critical_failure {
            return Recommendation::Reject;
        }
        if any_failure && all_close_to_threshold {
            return Recommendation::Optimize;
        }
        Recommendation::Reject
    }
}

#[async_trait]
impl Agent for EvaluatorAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.mark_initialized() {
            let ctx = self.core.context("init");
            let _guard = ctx.span().entered();
            info!("EvaluatorAgent initialized");
        }
        Ok(())
    }

    async fn handle_message(&self, message: AgentMessage) -> AgentMessage {
        let ctx = self.core.context(&message.flow_id);
        async {
            match &message.payload {
                // An evaluation request alone lacks the results payload;
                // evaluation is driven through `evaluate`.
                Payload::EvaluationRequest(_) => {
                    let error = super::error::AgentError::InvalidRequest {
                        message:
                            "EvaluationRequest requires backtest results; use evaluate() directly"
                                .to_string(),
                    };
                    self.core.handler_error_reply(&message, &error)
                }
                _ => self.core.unknown_message_reply(&message),
            }
        }
        .instrument(ctx.span())
        .await
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            let ctx = self.core.context("cleanup");
            let _guard = ctx.span().entered();
            info!("EvaluatorAgent closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rust_decimal_macros::dec;

    use crate::{
        backtest::BacktestResults,
        agents::BacktestStatus,
    };

    fn results_with(
        return_percentage: f64,
        max_drawdown: f64,
        profit_factor: f64,
    ) -> BacktestResultsResponse {
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
                return_percentage,
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
                total_cycles: 2,
                avg_cycle_duration: 100.0,
                avg_cycle_pnl: 50.0,
                winning_cycles: 1,
                losing_cycles: 1,
                cycle_win_rate: 50.0,
            },
        }
    }

    fn evaluate_metrics(
        sharpe: f64,
        max_drawdown: f64,
        profit_factor: f64,
    ) -> EvaluationResponse {
        // Bypass metric extraction: feed the KPI values directly through
        // the recommendation rules by overriding the request metrics.
        let kpis = EvaluatorAgent::default_kpis();
        let metrics: BTreeMap<String, f64> = [
            ("sharpe_ratio".to_string(), sharpe),
            ("max_drawdown".to_string(), max_drawdown),
            ("profit_factor".to_string(), profit_factor),
        ]
        .into_iter()
        .collect();

        let mut kpi_compliance = BTreeMap::new();
        for (kpi_name, threshold) in &kpis {
            let value = metrics[kpi_name];
            let compliant = if kpi_name == "max_drawdown" {
                value.abs() <= threshold.abs()
            } else {
                value >= *threshold
            };
            kpi_compliance.insert(kpi_name.clone(), compliant);
        }
        let passed = kpi_compliance.values().all(|v| *v);
        let recommendation = EvaluatorAgent::generate_recommendation(
            passed,
            &kpi_compliance,
            &metrics,
            &kpis,
        );

        EvaluationResponse {
            run_id: "run-1".to_string(),
            passed,
            metrics,
            kpi_compliance,
            recommendation,
        }
    }

    #[test]
    fn all_kpis_met_promotes() {
        let evaluation = evaluate_metrics(2.5, 5.0, 1.8);
        assert!(evaluation.passed);
        assert!(evaluation.kpi_compliance.values().all(|v| *v));
        assert_eq!(evaluation.recommendation, Recommendation::Promote);
    }

    #[test]
    fn near_miss_metrics_suggest_optimization() {
        // Sharpe 85% of threshold, drawdown compliant, profit factor 93%:
        // no critical failure and every miss within 20%.
        let evaluation = evaluate_metrics(1.7, 9.0, 1.4);
        assert!(!evaluation.passed);
        assert_eq!(evaluation.recommendation, Recommendation::Optimize);
    }

    #[test]
    fn critical_failures_reject() {
        // Drawdown beyond twice its limit.
        let evaluation = evaluate_metrics(2.5, 25.0, 1.8);
        assert_eq!(evaluation.recommendation, Recommendation::Reject);

        // Losing profit factor.
        let evaluation = evaluate_metrics(2.5, 5.0, 0.9);
        assert_eq!(evaluation.recommendation, Recommendation::Reject);

        // Negative Sharpe.
        let evaluation = evaluate_metrics(-0.5, 5.0, 1.8);
        assert_eq!(evaluation.recommendation, Recommendation::Reject);
    }

    #[test]
    fn far_misses_reject_without_optimization() {
        // Sharpe at half its threshold is outside the 20% band but not
        // critical.
        let evaluation = evaluate_metrics(1.0, 5.0, 1.8);
        assert!(!evaluation.passed);
        assert_eq!(evaluation.recommendation, Recommendation::Reject);
    }

    #[tokio::test]
    async fn evaluate_end_to_end_uses_extracted_metrics() {
        let agent = EvaluatorAgent::new(None);
        let results = results_with(4.0, 5.0, 1.8);

        let request = EvaluationRequest {
            run_id: "run-1".to_string(),
            metrics: None,
            kpis: None,
        };

        let evaluation = agent.evaluate(&request, &results).await;
        assert_eq!(evaluation.run_id, "run-1");
        assert!(evaluation.metrics.contains_key("sharpe_ratio"));
        assert!(evaluation.metrics.contains_key("calmar_ratio"));
        assert_eq!(
            evaluation.passed,
            evaluation.kpi_compliance.values().all(|v| *v)
        );
    }

    #[tokio::test]
    async fn custom_kpis_override_defaults() {
        let agent = EvaluatorAgent::new(None);
        let results = results_with(4.0, 5.0, 1.8);

        let request = EvaluationRequest {
            run_id: "run-1".to_string(),
            metrics: None,
            kpis: Some([("win_rate".to_string(), 50.0)].into_iter().collect()),
        };

        let evaluation = agent.evaluate(&request, &results).await;
        assert_eq!(evaluation.kpi_compliance.len(), 1);
        assert!(evaluation.kpi_compliance["win_rate"]);
        assert!(evaluation.passed);
        assert_eq!(evaluation.recommendation, Recommendation::Promote);
    }
}
