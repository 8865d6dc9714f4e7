use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, info};

use crate::{
    db::CandleStore,
    market::MarketDataSource,
    shared::{Millis, Timeframe, TimeframeSet},
    simulator::MarketDataSimulator,
};

use super::{
    Agent, AgentCore, AgentMessage, Policy, PolicyMap,
    error::{AgentError, Result},
};

const MIN_TIME_RANGE_MS: f64 = 60_000.0;
const MAX_SYMBOLS: f64 = 10.0;

/// Wraps the market-data simulator for the fabric: policy checks on the
/// time range and symbol count, timeframe-count validation at the agent
/// boundary.
pub struct SimulatorAgent {
    core: AgentCore,
    simulator: Arc<MarketDataSimulator>,
}

impl SimulatorAgent {
    pub fn new(
        run_id: Option<String>,
        store: CandleStore,
        source: Arc<dyn MarketDataSource>,
    ) -> Self {
        let policies: PolicyMap = [
            ("max_symbols", Policy::max(MAX_SYMBOLS)),
            ("min_time_range", Policy::min(MIN_TIME_RANGE_MS)),
        ]
        .into_iter()
        .collect();

        Self {
            core: AgentCore::new("simulator", run_id, policies),
            simulator: MarketDataSimulator::new(store, source),
        }
    }

    pub fn simulator(&self) -> Arc<MarketDataSimulator> {
        self.simulator.clone()
    }

    pub async fn set_times(
        &self,
        start_time: Millis,
        end_time: Option<Millis>,
        min_candles: usize,
    ) -> Result<()> {
        if let Some(end_time) = end_time
            && !self
                .core
                .validate_policy("min_time_range", (end_time - start_time) as f64)
        {
            return Err(AgentError::PolicyViolation {
                policy: "min_time_range",
                value: (end_time - start_time) as f64,
            });
        }

        let ctx = self.core.context("configure");
        async {
            self.simulator.set_times(start_time, end_time, min_candles).await;
            info!(start_time, ?end_time, "simulation times set");
            Ok(())
        }
        .instrument(ctx.span())
        .await
    }

    /// Registers a symbol; the timeframe count is validated here (2–4
    /// entries) before it reaches the simulator.
    pub async fn add_symbol(&self, symbol: &str, timeframes: Vec<Timeframe>) -> Result<()> {
        let validated = TimeframeSet::try_from(timeframes).map_err(AgentError::InvalidTimeframes)?;

        let ctx = self.core.context("configure");
        async {
            self.simulator
                .add_symbol(symbol, validated.as_slice().to_vec())
                .await?;
            info!(symbol, timeframes = ?validated.as_slice(), "symbol added");
            Ok(())
        }
        .instrument(ctx.span())
        .await
    }
}

#[async_trait]
impl Agent for SimulatorAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.mark_initialized() {
            let ctx = self.core.context("init");
            let _guard = ctx.span().entered();
            info!("SimulatorAgent initialized");
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
            async {
                self.simulator.close().await;
                info!("SimulatorAgent closed");
            }
            .instrument(ctx.span())
            .await;
        }
    }
}
