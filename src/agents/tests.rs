use super::*;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

use crate::{
    db::{CandleStore, StoreMode},
    exchange::Trade,
    market::{Candle, MarketDataSource, SymbolInfo, error::Result as MarketResult},
    shared::{Millis, Timeframe},
    strategy::{
        Strategy, StrategyContext, StrategyFactory, StrategyRegistry,
        error::Result as StrategyResult,
    },
    util::now_millis,
};

use super::error::AgentError;

#[derive(Default)]
struct EmptySource;

#[async_trait]
impl MarketDataSource for EmptySource {
    async fn klines(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _limit: usize,
        _start_time: Option<Millis>,
        _end_time: Option<Millis>,
    ) -> MarketResult<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn symbol_info(&self, symbol: &str) -> MarketResult<SymbolInfo> {
        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            min_qty: dec!(0.001),
            min_step: dec!(0.001),
            tick_size: dec!(0.1),
            min_notional: dec!(100),
        })
    }
}

struct IdleStrategy {
    symbol: String,
}

#[async_trait]
impl Strategy for IdleStrategy {
    fn name(&self) -> &str {
        "idle"
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn on_candle(&self, _candle: &Candle) -> StrategyResult<()> {
        Ok(())
    }

    async fn on_trade(&self, _trade: &Trade) -> StrategyResult<()> {
        Ok(())
    }
}

struct IdleFactory;

#[async_trait]
impl StrategyFactory for IdleFactory {
    async fn build(&self, ctx: StrategyContext) -> StrategyResult<Arc<dyn Strategy>> {
        Ok(Arc::new(IdleStrategy { symbol: ctx.symbol }))
    }
}

/// Two days of 1-minute candles ending at the current wall clock, so
/// scheduler-computed windows land on data.
async fn recent_candle_store() -> CandleStore {
    let store = CandleStore::in_memory(StoreMode::Backtest).await.unwrap();
    let now = now_millis();
    let start = now - 2 * 86_400_000;

    let mut candles = Vec::new();
    let mut ts = start;
    let mut i = 0i64;
    while ts <= now {
        let close = dec!(50_000) + Decimal::from(i % 500);
        candles.push(Candle {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M1,
            timestamp: ts,
            open: close,
            high: close + dec!(5),
            low: close - dec!(5),
            close,
            volume: Decimal::ONE,
        });
        ts += 60_000;
        i += 1;
    }
    store.add_candles(&candles).await.unwrap();
    store
}

async fn orchestrator_with_registry(results_dir: &TempDir) -> Arc<OrchestratorAgent> {
    let store = recent_candle_store().await;
    let mut strategies = StrategyRegistry::new();
    strategies.register("idle", Arc::new(IdleFactory));

    Arc::new(
        OrchestratorAgent::new(
            None,
            store,
            Arc::new(EmptySource),
            Arc::new(strategies),
            None,
            Some(results_dir.path().to_path_buf()),
        )
        .unwrap(),
    )
}

fn scheduler_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::new("BTCUSDT", "idle");
    config.incremental_periods = vec![1];
    config.backtests_per_period = 3;
    config.min_passed_backtests_per_period = 3;
    config.timeframes = vec![Timeframe::M1, Timeframe::M15];
    config
}

#[tokio::test]
async fn orchestrator_runs_a_backtest_and_rewrites_the_run_id() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_with_registry(&dir).await;
    orchestrator.initialize().await.unwrap();

    let now = now_millis();
    let mut request = StartBacktestRequest::new("BTCUSDT", now - 3_600_000 - 60_000);
    request.end_time = Some(now - 60_000);
    request.strategy_name = "idle".to_string();
    request.timeframes = vec![Timeframe::M1, Timeframe::M15];

    let response = orchestrator.run_backtest(request).await.unwrap();

    // The orchestrator re-keys the flow to its own run id.
    assert_eq!(response.run_id, orchestrator.core().run_id());
    assert_eq!(response.status, BacktestStatus::Completed);
    assert_eq!(response.results.total_trades, 0);
    assert_eq!(response.results.final_balance, dec!(2500));

    // The completed cache holds the latest result per run id.
    let completed = orchestrator.completed_backtests().await;
    assert_eq!(completed.len(), 1);

    // The registry persisted the backtest payload under the rewritten id.
    let path = dir
        .path()
        .join("backtests")
        .join(format!("{}.json", response.run_id));
    assert!(path.exists());

    orchestrator.close().await;
    // close() is idempotent.
    orchestrator.close().await;
}

#[tokio::test]
async fn scheduler_cycle_records_window_and_counts() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_with_registry(&dir).await;

    let scheduler = SchedulerAgent::new(None, scheduler_config(), orchestrator).unwrap();
    scheduler.initialize().await.unwrap();

    scheduler.run_cycle().await.unwrap();

    let (period_index, count, passed, cycles) = scheduler.state_snapshot().await;
    assert_eq!(period_index, 0);
    assert_eq!(count, 1);
    // An idle strategy scores zero on every KPI and cannot pass.
    assert_eq!(passed, 0);
    assert_eq!(cycles, 1);

    scheduler.close().await;
}

#[tokio::test]
async fn scheduler_rolls_windows_backward_across_cycles() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_with_registry(&dir).await;

    let scheduler =
        SchedulerAgent::new(None, scheduler_config(), orchestrator.clone()).unwrap();
    scheduler.initialize().await.unwrap();

    scheduler.run_cycle().await.unwrap();
    scheduler.run_cycle().await.unwrap();

    let key = SchedulerState::parameter_key(
        "idle",
        None,
        &[Timeframe::M1, Timeframe::M15],
    );
    let ranges = scheduler.recorded_ranges(0, &key).await;
    assert_eq!(ranges.len(), 2);

    // The second window ends 20% of a day past the first window's start
    // and the two overlap by no more than the configured percentage.
    assert!(ranges[1].end <= ranges[0].start + 86_400_000 / 5 + 60_000);
    assert!(SchedulerState::overlap_ratio(&ranges[1], &ranges[0]) <= 20.0 + 1.0);

    scheduler.close().await;
}

#[tokio::test]
async fn unknown_payloads_return_a_typed_error() {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_with_registry(&dir).await;

    let message = AgentMessage::new(
        "tester",
        "orchestrator",
        "flow-1",
        Payload::StoreResultsResponse(StoreResultsResponse {
            run_id: "r".to_string(),
            storage_id: "s".to_string(),
            success: true,
        }),
    );

    let reply = orchestrator.handle_message(message).await;
    match reply.payload {
        Payload::Error(error) => {
            assert_eq!(error.error_code, "UNKNOWN_MESSAGE_TYPE");
            assert!(error.run_id.is_some());
        }
        other => panic!("expected error payload, got {}", other.kind()),
    }
    assert_eq!(reply.from, "orchestrator");
    assert_eq!(reply.to, "tester");
    assert_eq!(reply.flow_id, "flow-1");
}

#[tokio::test]
async fn simulator_agent_enforces_policies() {
    let store = CandleStore::in_memory(StoreMode::Backtest).await.unwrap();
    let agent = SimulatorAgent::new(None, store, Arc::new(EmptySource));
    agent.initialize().await.unwrap();

    // Sub-minute ranges violate the min_time_range policy.
    let err = agent.set_times(1_000, Some(31_000), 10).await.unwrap_err();
    assert!(matches!(err, AgentError::PolicyViolation { .. }));

    agent.set_times(0, Some(86_400_000), 10).await.unwrap();

    // The agent boundary enforces the 2–4 timeframe rule.
    let err = agent
        .add_symbol("BTCUSDT", vec![Timeframe::M1])
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::InvalidTimeframes(_)));

    agent
        .add_symbol("BTCUSDT", vec![Timeframe::M1, Timeframe::M15])
        .await
        .unwrap();

    agent.close().await;
    agent.close().await;
}

#[tokio::test]
async fn backtest_agent_rejects_excessive_loss_limits() {
    let store = CandleStore::in_memory(StoreMode::Backtest).await.unwrap();
    let simulator_agent = SimulatorAgent::new(None, store, Arc::new(EmptySource));
    simulator_agent
        .set_times(0, Some(86_400_000), 10)
        .await
        .unwrap();

    let mut strategies = StrategyRegistry::new();
    strategies.register("idle", Arc::new(IdleFactory));
    let agent = BacktestAgent::new(None, Arc::new(strategies));

    let mut request = StartBacktestRequest::new("BTCUSDT", 0);
    request.max_loss_percentage = 0.9;
    request.strategy_name = "idle".to_string();

    let err = agent
        .execute_backtest(&request, simulator_agent.simulator(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::MaxLossPercentageExceeded { .. }));
}

#[test]
fn policy_bounds_validate_values() {
    let policy = Policy::range(60.0, 86_400.0);
    assert!(policy.validate(60.0));
    assert!(policy.validate(86_400.0));
    assert!(!policy.validate(59.9));
    assert!(!policy.validate(86_400.1));

    let unbounded = Policy::default();
    assert!(unbounded.validate(f64::MAX));

    let core = AgentCore::new("test", None, PolicyMap::new());
    // Absent policies always allow.
    assert!(core.validate_policy("anything", 1e9));
}
