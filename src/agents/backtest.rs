use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, info};

use crate::{
    backtest::{BacktestConfig, BacktestRunner, ProgressCallback},
    simulator::MarketDataSimulator,
    strategy::StrategyRegistry,
};

use super::{
    Agent, AgentCore, AgentMessage, BacktestResultsResponse, BacktestStatus, Policy, PolicyMap,
    StartBacktestRequest,
    error::{AgentError, Result},
};

const MAX_LOSS_PERCENTAGE_POLICY: f64 = 0.5;

/// Converts a `StartBacktestRequest` into a runner pass and wraps the
/// result for the fabric.
pub struct BacktestAgent {
    core: AgentCore,
    registry: Arc<StrategyRegistry>,
}

impl BacktestAgent {
    pub fn new(run_id: Option<String>, registry: Arc<StrategyRegistry>) -> Self {
        let policies: PolicyMap = [
            ("max_concurrent_backtests", Policy::max(1.0)),
            (
                "max_loss_percentage",
                Policy::max(MAX_LOSS_PERCENTAGE_POLICY),
            ),
        ]
        .into_iter()
        .collect();

        Self {
            core: AgentCore::new("backtest", run_id, policies),
            registry,
        }
    }

    /// Runs one backtest against the supplied simulator. The loss-limit
    /// policy is enforced before anything is scheduled.
    pub async fn execute_backtest(
        &self,
        request: &StartBacktestRequest,
        simulator: Arc<MarketDataSimulator>,
        progress: Option<ProgressCallback>,
    ) -> Result<BacktestResultsResponse> {
        let ctx = self.core.context("execute_backtest");
        async {
            if !self
                .core
                .validate_policy("max_loss_percentage", request.max_loss_percentage)
            {
                return Err(AgentError::MaxLossPercentageExceeded {
                    value: request.max_loss_percentage,
                    max: MAX_LOSS_PERCENTAGE_POLICY,
                });
            }

            let (_, rsi_limits) = request.validate()?;

            let mut config = BacktestConfig::new(
                request.symbol.clone(),
                request.start_time,
                request.end_time,
                request.initial_balance,
                request.leverage,
                request.maker_fee,
                request.taker_fee,
                request.max_notional,
                request.strategy_name.clone(),
                request.stop_on_loss,
                request.max_loss_percentage,
                request.track_cycles,
                request.timeframes.clone(),
                rsi_limits,
            )
            .map_err(AgentError::Backtest)?;
            config.run_id = request.run_id.clone();

            info!(
                run_id = %config.run_id,
                symbol = %config.symbol,
                strategy = %config.strategy_name,
                "backtest requested"
            );

            let runner =
                BacktestRunner::setup(config, simulator, &self.registry, progress).await?;
            let results = runner.run().await?;

            info!(
                run_id = %results.run_id,
                total_return = %results.total_return,
                "backtest agent finished"
            );

            Ok(BacktestResultsResponse {
                run_id: request.run_id.clone(),
                status: BacktestStatus::Completed,
                results,
            })
        }
        .instrument(ctx.span())
        .await
    }
}

#[async_trait]
impl Agent for BacktestAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.mark_initialized() {
            let ctx = self.core.context("init");
            let _guard = ctx.span().entered();
            info!("BacktestAgent initialized");
        }
        Ok(())
    }

    async fn handle_message(&self, message: AgentMessage) -> AgentMessage {
        // Execution needs the orchestrator-owned simulator; direct messages
        // cannot be served here.
        let ctx = self.core.context(&message.flow_id);
        async { self.core.unknown_message_reply(&message) }
            .instrument(ctx.span())
            .await
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            let ctx = self.core.context("cleanup");
            let _guard = ctx.span().entered();
            info!("BacktestAgent closed");
        }
    }
}
