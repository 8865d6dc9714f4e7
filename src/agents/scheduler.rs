use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, broadcast};
use tracing::{Instrument, error, info, warn};

use crate::{
    shared::{Millis, ONE_MINUTE_MS, Timeframe},
    util::now_millis,
};

use super::{
    Agent, AgentCore, AgentMessage, EvaluatorAgent, OrchestratorAgent, Policy, PolicyMap,
    Recommendation, StartBacktestRequest,
    error::{AgentError, Result},
};

const DAY_MS: Millis = 86_400_000;

/// Scheduler configuration. Defaults follow the qualification ladder
/// 1 -> 7 -> 30 -> 90 days with 10-of-10 passing backtests per period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub symbol: String,
    pub strategy_name: String,
    pub schedule_interval_seconds: u64,
    pub incremental_periods: Vec<u32>,
    pub backtests_per_period: u32,
    pub min_passed_backtests_per_period: u32,
    pub max_overlap_percentage: f64,
    pub max_iterations_per_cycle: u64,
    pub kpis: std::collections::BTreeMap<String, f64>,
    pub auto_reset_memory: bool,
    pub initial_balance: Decimal,
    pub leverage: Decimal,
    pub timeframes: Vec<Timeframe>,
    pub rsi_limits: Option<Vec<i64>>,
}

impl SchedulerConfig {
    pub const MIN_INTERVAL_SECONDS: u64 = 60;

    pub const MAX_INTERVAL_SECONDS: u64 = 86_400;

    pub fn new(symbol: impl Into<String>, strategy_name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            strategy_name: strategy_name.into(),
            schedule_interval_seconds: 3600,
            incremental_periods: vec![1, 7, 30, 90],
            backtests_per_period: 10,
            min_passed_backtests_per_period: 10,
            max_overlap_percentage: 20.0,
            max_iterations_per_cycle: 5,
            kpis: EvaluatorAgent::default_kpis(),
            auto_reset_memory: true,
            initial_balance: Decimal::from(2500),
            leverage: Decimal::from(100),
            timeframes: vec![Timeframe::M1, Timeframe::M15, Timeframe::H1],
            rsi_limits: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(Self::MIN_INTERVAL_SECONDS..=Self::MAX_INTERVAL_SECONDS)
            .contains(&self.schedule_interval_seconds)
        {
            return Err(AgentError::InvalidRequest {
                message: format!(
                    "schedule_interval_seconds must be in [{}, {}], got {}",
                    Self::MIN_INTERVAL_SECONDS,
                    Self::MAX_INTERVAL_SECONDS,
                    self.schedule_interval_seconds
                ),
            });
        }
        if self.incremental_periods.is_empty() {
            return Err(AgentError::InvalidRequest {
                message: "incremental_periods must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// One recorded backtest window for a parameter key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Millis,
    pub end: Millis,
    pub run_id: String,
}

/// Outcome of accounting one evaluated backtest into the period state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Stay in the current period.
    Continue,
    /// Enough passes: moved on to the period with this index.
    AdvancedPeriod(usize),
    /// Not enough passes: back to the first period.
    ResetToFirstPeriod,
    /// Final period cleared: the strategy qualifies.
    PromoteToProduction,
}

/// The incremental-qualification state: period progression counters and
/// the per-period, per-parameter-key history of backtest windows. All
/// transitions are pure so the invariants are testable without I/O.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub current_period_index: usize,
    pub backtest_count_in_period: u32,
    pub passed_backtests_in_period: u32,
    pub period_parameter_combinations: HashMap<usize, HashMap<String, Vec<TimeRange>>>,
    pub last_reset_day: Option<NaiveDate>,
    pub cycle_count: u64,
}

impl SchedulerState {
    /// Canonical key of a parameter family: strategy name, sorted RSI
    /// triple, sorted timeframes.
    pub fn parameter_key(
        strategy_name: &str,
        rsi_limits: Option<&[i64]>,
        timeframes: &[Timeframe],
    ) -> String {
        let rsi = match rsi_limits {
            Some(limits) => {
                let mut sorted = limits.to_vec();
                sorted.sort_unstable();
                format!("{sorted:?}")
            }
            None => "default".to_string(),
        };

        let mut timeframes: Vec<String> = timeframes.iter().map(Timeframe::to_string).collect();
        timeframes.sort();

        format!("{strategy_name}_rsi_{rsi}_tf_{}", timeframes.join(","))
    }

    pub fn ranges(&self, period_index: usize, key: &str) -> Vec<TimeRange> {
        self.period_parameter_combinations
            .get(&period_index)
            .and_then(|by_key| by_key.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Next backtest window for a parameter key: the first run ends one
    /// minute before now; subsequent runs roll backward so that
    /// consecutive windows overlap by exactly `max_overlap_percentage` of
    /// their duration, clamped to `now - 1 minute`.
    pub fn compute_time_range(
        previous_ranges: &[TimeRange],
        period_days: u32,
        max_overlap_percentage: f64,
        now: Millis,
    ) -> (Millis, Millis) {
        let duration_ms = period_days as Millis * DAY_MS;

        let end = match previous_ranges.iter().max_by_key(|r| r.end) {
            None => now - ONE_MINUTE_MS,
            Some(most_recent) => {
                let target_overlap_ms =
                    (duration_ms as f64 * max_overlap_percentage / 100.0) as Millis;
                let end = most_recent.start + target_overlap_ms;
                if end >= now {
                    warn!(
                        calculated_end = end,
                        now, "calculated end time reaches now, clamping"
                    );
                    now - ONE_MINUTE_MS
                } else {
                    end
                }
            }
        };

        (end - duration_ms, end)
    }

    /// Overlap of `probe` against `reference` as a percentage of the
    /// probe's duration.
    pub fn overlap_ratio(probe: &TimeRange, reference: &TimeRange) -> f64 {
        let overlap_start = probe.start.max(reference.start);
        let overlap_end = probe.end.min(reference.end);
        if overlap_start >= overlap_end {
            return 0.0;
        }

        let duration = probe.end - probe.start;
        if duration == 0 {
            return 0.0;
        }
        (overlap_end - overlap_start) as f64 / duration as f64 * 100.0
    }

    pub fn record_range(&mut self, period_index: usize, key: &str, range: TimeRange) {
        self.period_parameter_combinations
            .entry(period_index)
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(range);
    }

    /// Accounts one evaluated backtest and advances the period machine.
    pub fn on_backtest_evaluated(
        &mut self,
        passed: bool,
        backtests_per_period: u32,
        min_passed_per_period: u32,
        period_count: usize,
    ) -> CycleOutcome {
        if passed {
            self.passed_backtests_in_period += 1;
        }
        self.backtest_count_in_period += 1;

        if self.backtest_count_in_period < backtests_per_period {
            return CycleOutcome::Continue;
        }

        if self.passed_backtests_in_period >= min_passed_per_period {
            if self.current_period_index + 1 < period_count {
                let previous = self.current_period_index;
                self.current_period_index += 1;
                self.backtest_count_in_period = 0;
                self.passed_backtests_in_period = 0;
                self.period_parameter_combinations.remove(&previous);
                CycleOutcome::AdvancedPeriod(self.current_period_index)
            } else {
                CycleOutcome::PromoteToProduction
            }
        } else {
            self.reset_to_first_period();
            CycleOutcome::ResetToFirstPeriod
        }
    }

    pub fn reset_to_first_period(&mut self) {
        self.current_period_index = 0;
        self.backtest_count_in_period = 0;
        self.passed_backtests_in_period = 0;
        self.period_parameter_combinations.clear();
    }

    pub fn should_reset_daily(&self, today: NaiveDate) -> bool {
        match self.last_reset_day {
            None => true,
            Some(last) => today > last,
        }
    }

    /// Daily memory reset: clears counters and range maps, keeps nothing
    /// but the reset day. The configuration snapshot lives outside this
    /// state and is untouched.
    pub fn reset_daily(&mut self, today: NaiveDate) {
        self.period_parameter_combinations.clear();
        self.backtest_count_in_period = 0;
        self.passed_backtests_in_period = 0;
        self.last_reset_day = Some(today);
    }
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    CycleCompleted {
        cycle: u64,
        period_index: usize,
        passed: bool,
        recommendation: Recommendation,
    },
    PromotedToProduction {
        strategy_name: String,
        symbol: String,
        total_cycles: u64,
    },
    Stopped,
}

/// Top-level qualification loop: runs backtests through the orchestrator
/// on a fixed interval, evaluates them, resets on optimization, and
/// promotes to production once the final period clears.
pub struct SchedulerAgent {
    core: AgentCore,
    config: SchedulerConfig,
    orchestrator: Arc<OrchestratorAgent>,
    state: Mutex<SchedulerState>,
    running: AtomicBool,
    stop_notify: Notify,
    events_tx: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerAgent {
    pub fn new(
        run_id: Option<String>,
        config: SchedulerConfig,
        orchestrator: Arc<OrchestratorAgent>,
    ) -> Result<Self> {
        config.validate()?;

        let policies: PolicyMap = [
            (
                "schedule_interval_seconds",
                Policy::range(
                    SchedulerConfig::MIN_INTERVAL_SECONDS as f64,
                    SchedulerConfig::MAX_INTERVAL_SECONDS as f64,
                ),
            ),
            ("max_runs_per_day", Policy::max(100.0)),
        ]
        .into_iter()
        .collect();

        let (events_tx, _) = broadcast::channel(64);

        Ok(Self {
            core: AgentCore::new("scheduler", run_id, policies),
            config,
            orchestrator,
            state: Mutex::new(SchedulerState::default()),
            running: AtomicBool::new(false),
            stop_notify: Notify::new(),
            events_tx,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests a cooperative stop: the current cycle completes, the
    /// inter-cycle sleep is interrupted.
    pub fn stop(&self) {
        let ctx = self.core.context("stop");
        let _guard = ctx.span().entered();
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
        info!("scheduler stop requested");
        let _ = self.events_tx.send(SchedulerEvent::Stopped);
    }

    /// The continuous loop. Cycle errors are logged and swallowed so the
    /// loop stays alive; only an external stop or a promotion ends it.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            let ctx = self.core.context("start");
            let _guard = ctx.span().entered();
            warn!("scheduler already running");
            return Ok(());
        }

        self.orchestrator.initialize().await?;

        {
            let ctx = self.core.context("start");
            let _guard = ctx.span().entered();
            info!(
                symbol = %self.config.symbol,
                strategy = %self.config.strategy_name,
                interval_s = self.config.schedule_interval_seconds,
                periods = ?self.config.incremental_periods,
                "scheduler started, entering continuous loop"
            );
        }

        while self.running.load(Ordering::SeqCst) {
            if self.config.auto_reset_memory {
                let today = Utc::now().date_naive();
                let mut state = self.state.lock().await;
                if state.should_reset_daily(today) {
                    let ctx = self.core.context("reset_daily_memory");
                    let _guard = ctx.span().entered();
                    state.reset_daily(today);
                    info!(%today, "daily memory reset completed");
                }
            }

            if let Err(e) = self.run_cycle().await {
                let ctx = self.core.context("start");
                let _guard = ctx.span().entered();
                error!(error = %e, "error in cycle execution");
            }

            if self.running.load(Ordering::SeqCst) {
                let interval = Duration::from_secs(self.config.schedule_interval_seconds);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = self.stop_notify.notified() => {}
                }
            }
        }

        let ctx = self.core.context("start");
        let _guard = ctx.span().entered();
        info!("scheduler stopped");
        Ok(())
    }

    /// One qualification cycle: window computation -> backtest -> evaluation
    /// -> optional optimization reset -> period accounting.
    pub async fn run_cycle(&self) -> Result<()> {
        let ctx = self.core.context("run_cycle");
        async {
            let (cycle, period_index, period_days, key, previous_ranges) = {
                let mut state = self.state.lock().await;
                state.cycle_count += 1;

                let period_index = state.current_period_index;
                let period_days = self.config.incremental_periods[period_index];
                let key = SchedulerState::parameter_key(
                    &self.config.strategy_name,
                    self.config.rsi_limits.as_deref(),
                    &self.config.timeframes,
                );
                let previous_ranges = state.ranges(period_index, &key);
                (state.cycle_count, period_index, period_days, key, previous_ranges)
            };

            info!(
                cycle,
                period_index,
                period_days,
                backtest_in_period = %format!(
                    "{}/{}",
                    self.backtest_count().await + 1,
                    self.config.backtests_per_period
                ),
                "starting cycle"
            );

            let now = now_millis();
            let (start_time, end_time) = SchedulerState::compute_time_range(
                &previous_ranges,
                period_days,
                self.config.max_overlap_percentage,
                now,
            );

            let cycle_run_id = format!("{}_cycle_{}_{}", self.core.run_id(), cycle, now / 1000);

            let mut request = StartBacktestRequest::new(&self.config.symbol, start_time);
            request.run_id = cycle_run_id.clone();
            request.end_time = Some(end_time);
            request.strategy_name = self.config.strategy_name.clone();
            request.initial_balance = self.config.initial_balance;
            request.leverage = self.config.leverage;
            request.timeframes = self.config.timeframes.clone();
            request.rsi_limits = self.config.rsi_limits.clone();

            let backtest_results = self.orchestrator.run_backtest(request).await?;

            // Record the window the backtest actually covered, which may
            // differ from the request after end-time clamping.
            {
                let mut state = self.state.lock().await;
                state.record_range(
                    period_index,
                    &key,
                    TimeRange {
                        start: backtest_results.results.start_time,
                        end: backtest_results.results.end_time,
                        run_id: cycle_run_id.clone(),
                    },
                );
            }

            let evaluation = self
                .orchestrator
                .evaluate_backtest(&backtest_results, Some(self.config.kpis.clone()))
                .await;

            if evaluation.recommendation == Recommendation::Optimize {
                info!("optimization recommended, resetting to first period");
                self.state.lock().await.reset_to_first_period();

                if cycle <= self.config.max_iterations_per_cycle {
                    match self
                        .orchestrator
                        .optimize_strategy(
                            &self.config.strategy_name,
                            &self.config.symbol,
                            "sharpe_ratio",
                            None,
                        )
                        .await
                    {
                        Ok(result) => {
                            info!(confidence = result.confidence, "optimization completed")
                        }
                        Err(e) => warn!(error = %e, "optimization failed"),
                    }
                }
            }

            let outcome = {
                let mut state = self.state.lock().await;
                state.on_backtest_evaluated(
                    evaluation.passed,
                    self.config.backtests_per_period,
                    self.config.min_passed_backtests_per_period,
                    self.config.incremental_periods.len(),
                )
            };

            match outcome {
                CycleOutcome::Continue => {}
                CycleOutcome::AdvancedPeriod(next) => {
                    info!(
                        period_index = next,
                        period_days = self.config.incremental_periods[next],
                        "period completed successfully, advancing"
                    );
                }
                CycleOutcome::ResetToFirstPeriod => {
                    warn!("period failed KPI quota, resetting to first period");
                }
                CycleOutcome::PromoteToProduction => {
                    self.promote_to_production(cycle).await;
                }
            }

            let _ = self.events_tx.send(SchedulerEvent::CycleCompleted {
                cycle,
                period_index,
                passed: evaluation.passed,
                recommendation: evaluation.recommendation,
            });

            info!(
                cycle,
                recommendation = %evaluation.recommendation,
                passed = evaluation.passed,
                run_id = %cycle_run_id,
                "cycle completed"
            );

            Ok(())
        }
        .instrument(ctx.span())
        .await
    }

    async fn promote_to_production(&self, total_cycles: u64) {
        let ctx = self.core.context("promote_to_production");
        let _guard = ctx.span().entered();

        info!(
            strategy = %self.config.strategy_name,
            symbol = %self.config.symbol,
            total_cycles,
            "all periods completed successfully, promoting to production"
        );

        let _ = self.events_tx.send(SchedulerEvent::PromotedToProduction {
            strategy_name: self.config.strategy_name.clone(),
            symbol: self.config.symbol.clone(),
            total_cycles,
        });

        self.stop();
    }

    async fn backtest_count(&self) -> u32 {
        self.state.lock().await.backtest_count_in_period
    }

    pub async fn recorded_ranges(&self, period_index: usize, key: &str) -> Vec<TimeRange> {
        self.state.lock().await.ranges(period_index, key)
    }

    pub async fn state_snapshot(&self) -> (usize, u32, u32, u64) {
        let state = self.state.lock().await;
        (
            state.current_period_index,
            state.backtest_count_in_period,
            state.passed_backtests_in_period,
            state.cycle_count,
        )
    }
}

#[async_trait]
impl Agent for SchedulerAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.mark_initialized() {
            let ctx = self.core.context("init");
            async {
                self.orchestrator.initialize().await?;
                info!(
                    symbol = %self.config.symbol,
                    strategy = %self.config.strategy_name,
                    "SchedulerAgent initialized"
                );
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
        async { self.core.unknown_message_reply(&message) }
            .instrument(ctx.span())
            .await
    }

    async fn close(&self) {
        if self.core.mark_closed() {
            self.stop();
            self.orchestrator.close().await;
            let ctx = self.core.context("cleanup");
            let _guard = ctx.span().entered();
            info!("SchedulerAgent closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Millis = 1_790_000_000_000;

    #[test]
    fn parameter_key_sorts_its_dimensions() {
        let key = SchedulerState::parameter_key(
            "carga_descarga",
            Some(&[85, 15, 50]),
            &[Timeframe::H1, Timeframe::M1, Timeframe::M15],
        );
        assert_eq!(key, "carga_descarga_rsi_[15, 50, 85]_tf_15m,1h,1m");

        let default_key = SchedulerState::parameter_key("s", None, &[Timeframe::M1]);
        assert_eq!(default_key, "s_rsi_default_tf_1m");

        // Order of inputs never changes the key.
        let same = SchedulerState::parameter_key(
            "carga_descarga",
            Some(&[15, 50, 85]),
            &[Timeframe::M1, Timeframe::M15, Timeframe::H1],
        );
        assert_eq!(key, same);
    }

    #[test]
    fn first_range_ends_one_minute_before_now() {
        let (start, end) = SchedulerState::compute_time_range(&[], 1, 20.0, T);
        assert_eq!(end, T - ONE_MINUTE_MS);
        assert_eq!(start, end - DAY_MS);
    }

    #[test]
    fn consecutive_ranges_overlap_by_the_configured_percentage() {
        let mut state = SchedulerState::default();
        let key = "k";
        let period_days = 1;

        let mut ranges = Vec::new();
        for i in 0..3 {
            let previous = state.ranges(0, key);
            let (start, end) =
                SchedulerState::compute_time_range(&previous, period_days, 20.0, T);
            let range = TimeRange {
                start,
                end,
                run_id: format!("run-{i}"),
            };
            state.record_range(0, key, range.clone());
            ranges.push(range);
        }

        // Scenario: R1 ends at T - 1 min, each window spans one day, and
        // each next window ends 20% of a day past the previous start.
        assert_eq!(ranges[0].end, T - ONE_MINUTE_MS);
        for range in &ranges {
            assert_eq!(range.end - range.start, DAY_MS);
        }
        assert_eq!(ranges[1].end, ranges[0].start + DAY_MS / 5);
        assert_eq!(ranges[2].end, ranges[1].start + DAY_MS / 5);

        // The invariant: no two stored ranges overlap beyond the limit.
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(SchedulerState::overlap_ratio(b, a) <= 20.0 + 1e-9);
            }
        }
        assert_eq!(SchedulerState::overlap_ratio(&ranges[1], &ranges[0]), 20.0);
    }

    #[test]
    fn clamped_end_still_respects_the_overlap_limit_approximately() {
        // A previous range starting just shy of now forces the clamp.
        let previous = vec![TimeRange {
            start: T - 2 * ONE_MINUTE_MS,
            end: T - ONE_MINUTE_MS,
            run_id: "r".to_string(),
        }];
        let (start, end) = SchedulerState::compute_time_range(&previous, 1, 20.0, T);
        assert_eq!(end, T - ONE_MINUTE_MS);
        assert_eq!(start, end - DAY_MS);
    }

    #[test]
    fn period_machine_advances_resets_and_promotes() {
        let mut state = SchedulerState::default();

        // 3-of-3 on a two-period ladder advances, then promotes.
        for _ in 0..3 {
            let outcome = state.on_backtest_evaluated(true, 3, 3, 2);
            if state.current_period_index == 1 {
                assert_eq!(outcome, CycleOutcome::AdvancedPeriod(1));
            }
        }
        assert_eq!(state.current_period_index, 1);
        assert_eq!(state.backtest_count_in_period, 0);

        for i in 0..3 {
            let outcome = state.on_backtest_evaluated(true, 3, 3, 2);
            if i < 2 {
                assert_eq!(outcome, CycleOutcome::Continue);
            } else {
                assert_eq!(outcome, CycleOutcome::PromoteToProduction);
            }
        }
    }

    #[test]
    fn failed_quota_resets_to_first_period() {
        let mut state = SchedulerState::default();
        state.current_period_index = 1;
        state.record_range(
            1,
            "k",
            TimeRange {
                start: 0,
                end: 1,
                run_id: "r".to_string(),
            },
        );

        state.on_backtest_evaluated(false, 2, 2, 3);
        let outcome = state.on_backtest_evaluated(true, 2, 2, 3);
        assert_eq!(outcome, CycleOutcome::ResetToFirstPeriod);
        assert_eq!(state.current_period_index, 0);
        assert_eq!(state.backtest_count_in_period, 0);
        assert_eq!(state.passed_backtests_in_period, 0);
        assert!(state.period_parameter_combinations.is_empty());
    }

    #[test]
    fn advancing_drops_the_previous_period_ranges() {
        let mut state = SchedulerState::default();
        state.record_range(
            0,
            "k",
            TimeRange {
                start: 0,
                end: 1,
                run_id: "r".to_string(),
            },
        );

        let outcome = state.on_backtest_evaluated(true, 1, 1, 2);
        assert_eq!(outcome, CycleOutcome::AdvancedPeriod(1));
        assert!(!state.period_parameter_combinations.contains_key(&0));
    }

    #[test]
    fn daily_reset_clears_counters_and_ranges_only() {
        let mut state = SchedulerState {
            current_period_index: 2,
            backtest_count_in_period: 4,
            passed_backtests_in_period: 3,
            cycle_count: 17,
            ..SchedulerState::default()
        };
        state.record_range(
            2,
            "k",
            TimeRange {
                start: 0,
                end: 1,
                run_id: "r".to_string(),
            },
        );

        let today = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert!(state.should_reset_daily(today));
        state.reset_daily(today);

        assert!(state.period_parameter_combinations.is_empty());
        assert_eq!(state.backtest_count_in_period, 0);
        assert_eq!(state.passed_backtests_in_period, 0);
        // The period ladder position and lifetime counters survive.
        assert_eq!(state.current_period_index, 2);
        assert_eq!(state.cycle_count, 17);

        assert!(!state.should_reset_daily(today));
        assert!(state.should_reset_daily(today.succ_opt().unwrap()));
    }

    #[test]
    fn interval_bounds_are_enforced() {
        let mut config = SchedulerConfig::new("BTCUSDT", "carga_descarga");
        assert!(config.validate().is_ok());

        config.schedule_interval_seconds = 59;
        assert!(config.validate().is_err());

        config.schedule_interval_seconds = 86_401;
        assert!(config.validate().is_err());

        config.schedule_interval_seconds = 60;
        assert!(config.validate().is_ok());
    }
}
