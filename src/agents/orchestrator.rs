use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{Instrument, error, info, warn};

use crate::{
    db::CandleStore,
    llm::LlmClient,
    market::MarketDataSource,
    registry::ResultsRepository,
    shared::Timeframe,
    strategy::StrategyRegistry,
};

use super::{
    Agent, AgentCore, AgentMessage, BacktestResultsResponse, BacktestAgent, EvaluationRequest,
    EvaluationResponse, EvaluatorAgent, OptimizationRequest, OptimizationResult, OptimizerAgent,
    Payload, Policy, PolicyMap, RegistryAgent, SimulatorAgent, StartBacktestRequest,
    StoreResultsRequest,
    error::{AgentError, Result},
};

const MAX_CONCURRENT_BACKTESTS: usize = 1;

/// Composes simulator, backtest, evaluator, optimizer, and (optionally)
/// registry for a single qualifying flow. Every incoming request is
/// re-keyed to the orchestrator's run id so all logs of a flow share one
/// identifier.
pub struct OrchestratorAgent {
    core: AgentCore,
    simulator_agent: Arc<SimulatorAgent>,
    backtest_agent: Arc<BacktestAgent>,
    evaluator_agent: Arc<EvaluatorAgent>,
    optimizer_agent: Arc<OptimizerAgent>,
    registry_agent: Option<Arc<RegistryAgent>>,
    active_backtests: Mutex<Vec<String>>,
    completed_backtests: Mutex<Vec<BacktestResultsResponse>>,
    optimization_history: Mutex<Vec<OptimizationResult>>,
}

impl OrchestratorAgent {
    pub fn new(
        run_id: Option<String>,
        store: CandleStore,
        source: Arc<dyn MarketDataSource>,
        strategies: Arc<StrategyRegistry>,
        llm: Option<Arc<dyn LlmClient>>,
        results_path: Option<PathBuf>,
    ) -> Result<Self> {
        let core = AgentCore::new(
            "orchestrator",
            run_id,
            PolicyMap::from([(
                "max_concurrent_backtests",
                Policy::max(MAX_CONCURRENT_BACKTESTS as f64),
            )]),
        );
        let run_id = Some(core.run_id().to_string());

        let simulator_agent = Arc::new(SimulatorAgent::new(run_id.clone(), store, source));
        let backtest_agent = Arc::new(BacktestAgent::new(run_id.clone(), strategies));
        let evaluator_agent = Arc::new(EvaluatorAgent::new(run_id.clone()));
        let optimizer_agent = Arc::new(OptimizerAgent::new(run_id.clone(), llm));
        let registry_agent = results_path
            .map(|path| {
                ResultsRepository::new(path)
                    .map(|repository| Arc::new(RegistryAgent::new(run_id.clone(), repository)))
            })
            .transpose()?;

        Ok(Self {
            core,
            simulator_agent,
            backtest_agent,
            evaluator_agent,
            optimizer_agent,
            registry_agent,
            active_backtests: Mutex::new(Vec::new()),
            completed_backtests: Mutex::new(Vec::new()),
            optimization_history: Mutex::new(Vec::new()),
        })
    }

    pub fn simulator_agent(&self) -> &Arc<SimulatorAgent> {
        &self.simulator_agent
    }

    pub async fn completed_backtests(&self) -> Vec<BacktestResultsResponse> {
        self.completed_backtests.lock().await.clone()
    }

    pub async fn optimization_history(&self) -> Vec<OptimizationResult> {
        self.optimization_history.lock().await.clone()
    }

    /// Runs one backtest end to end: policy gate, simulator setup, runner
    /// execution, result caching, and registry persistence.
    pub async fn run_backtest(
        &self,
        mut request: StartBacktestRequest,
    ) -> Result<BacktestResultsResponse> {
        let ctx = self.core.context("run_backtest");
        async {
            {
                let mut active = self.active_backtests.lock().await;
                if active.len() >= MAX_CONCURRENT_BACKTESTS {
                    return Err(AgentError::MaxConcurrentBacktests {
                        active: active.len(),
                    });
                }
                active.push(request.run_id.clone());
            }

            // All logs of this flow share the orchestrator's run id.
            if request.run_id != self.core.run_id() {
                request.run_id = self.core.run_id().to_string();
            }

            let outcome = self.run_backtest_inner(&request).await;

            {
                let mut active = self.active_backtests.lock().await;
                active.pop();
            }

            match outcome {
                Ok(response) => {
                    {
                        let mut completed = self.completed_backtests.lock().await;
                        completed.retain(|r| r.run_id != response.run_id);
                        completed.push(response.clone());
                    }

                    self.store_results(StoreResultsRequest {
                        run_id: response.run_id.clone(),
                        strategy_name: response.results.strategy_name.clone(),
                        symbol: response.results.symbol.clone(),
                        backtest_results: Some(response.clone()),
                        evaluation_results: None,
                        optimization_results: None,
                        metadata: serde_json::Value::Null,
                    })
                    .await;

                    info!(
                        run_id = %response.run_id,
                        total_return = %response.results.total_return,
                        win_rate = response.results.win_rate,
                        "backtest completed"
                    );
                    Ok(response)
                }
                Err(e) => {
                    error!(error = %e, "error orchestrating backtest");
                    Err(e)
                }
            }
        }
        .instrument(ctx.span())
        .await
    }

    async fn run_backtest_inner(
        &self,
        request: &StartBacktestRequest,
    ) -> Result<BacktestResultsResponse> {
        self.simulator_agent
            .set_times(request.start_time, request.end_time, 10)
            .await?;
        self.simulator_agent
            .add_symbol(&request.symbol, request.timeframes.clone())
            .await?;

        self.backtest_agent
            .execute_backtest(request, self.simulator_agent.simulator(), None)
            .await
    }

    pub async fn evaluate_backtest(
        &self,
        backtest_results: &BacktestResultsResponse,
        kpis: Option<BTreeMap<String, f64>>,
    ) -> EvaluationResponse {
        let request = EvaluationRequest {
            run_id: backtest_results.run_id.clone(),
            metrics: None,
            kpis,
        };

        let evaluation = self
            .evaluator_agent
            .evaluate(&request, backtest_results)
            .await;

        self.store_results(StoreResultsRequest {
            run_id: evaluation.run_id.clone(),
            strategy_name: backtest_results.results.strategy_name.clone(),
            symbol: backtest_results.results.symbol.clone(),
            backtest_results: None,
            evaluation_results: Some(evaluation.clone()),
            optimization_results: None,
            metadata: serde_json::Value::Null,
        })
        .await;

        evaluation
    }

    /// Requests a parameter proposal from the optimizer, feeding it the
    /// most recent completed results.
    pub async fn optimize_strategy(
        &self,
        strategy_name: &str,
        symbol: &str,
        objective: &str,
        base_config: Option<StartBacktestRequest>,
    ) -> Result<OptimizationResult> {
        let ctx = self.core.context("optimize_strategy");
        async {
            let previous = self.completed_backtests.lock().await.clone();

            let request = OptimizationRequest {
                run_id: self.core.run_id().to_string(),
                strategy_name: strategy_name.to_string(),
                symbol: symbol.to_string(),
                parameter_space: Self::default_parameter_space(),
                objective: objective.to_string(),
                base_config,
            };

            let result = self.optimizer_agent.optimize(&request, &previous).await?;

            self.optimization_history.lock().await.push(result.clone());

            self.store_results(StoreResultsRequest {
                run_id: result.run_id.clone(),
                strategy_name: strategy_name.to_string(),
                symbol: symbol.to_string(),
                backtest_results: None,
                evaluation_results: None,
                optimization_results: Some(result.clone()),
                metadata: serde_json::Value::Null,
            })
            .await;

            info!(confidence = result.confidence, "optimization completed");
            Ok(result)
        }
        .instrument(ctx.span())
        .await
    }

    fn default_parameter_space() -> BTreeMap<String, serde_json::Value> {
        [
            ("rsi_limits".to_string(), json!((0..=100).collect::<Vec<i64>>())),
            (
                "timeframes".to_string(),
                json!(
                    Timeframe::all()
                        .iter()
                        .map(Timeframe::to_string)
                        .collect::<Vec<_>>()
                ),
            ),
        ]
        .into_iter()
        .collect()
    }

    async fn store_results(&self, request: StoreResultsRequest) {
        if let Some(registry) = &self.registry_agent {
            let response = registry.store_results(&request).await;
            if !response.success {
                warn!(run_id = %request.run_id, "failed to persist results to registry");
            }
        }
    }
}

#[async_trait]
impl Agent for OrchestratorAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.mark_initialized() {
            let ctx = self.core.context("init");
            async {
                self.simulator_agent.initialize().await?;
                self.backtest_agent.initialize().await?;
                self.evaluator_agent.initialize().await?;
                self.optimizer_agent.initialize().await?;
                if let Some(registry) = &self.registry_agent {
                    registry.initialize().await?;
                }
                info!("OrchestratorAgent initialized");
                Ok(())
            }
            .instrument(ctx.span())
            .await
        } else {
            Ok(())
        }
    }

    async fn handle_message(&self, message: AgentMessage) -> AgentMessage {
        let ctx = self.core.context(&message.flow_id);
        async {
            match message.payload.clone() {
                Payload::StartBacktestRequest(request) => match self.run_backtest(request).await {
                    Ok(response) => self.core.message(
                        message.from.clone(),
                        message.flow_id.clone(),
                        Payload::BacktestResultsResponse(response),
                    ),
                    Err(error) => self.core.handler_error_reply(&message, &error),
                },
                _ => self.core.unknown_message_reply(&message),
            }
        }
        .instrument(ctx.span())
        .await
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            let ctx = self.core.context("cleanup");
            async {
                // Reverse creation order.
                if let Some(registry) = &self.registry_agent {
                    registry.close().await;
                }
                self.optimizer_agent.close().await;
                self.evaluator_agent.close().await;
                self.backtest_agent.close().await;
                self.simulator_agent.close().await;
                info!("OrchestratorAgent closed");
            }
            .instrument(ctx.span())
            .await;
        }
    }
}
