use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};

use async_trait::async_trait;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    exchange::Exchange,
    market::{Candle, CandleListener, ListenerResult, MarketFeed},
    simulator::MarketDataSimulator,
    strategy::{
        Cycle, CycleDispatcher, CycleListener, Strategy, StrategyContext, StrategyRegistry,
    },
};

use super::{config::BacktestConfig, error::Result, results::BacktestResults};

/// Periodic progress snapshot, reported roughly once per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestProgress {
    pub candles_processed: u64,
    pub current_balance: Decimal,
    pub execution_time_seconds: f64,
    pub candles_per_second: f64,
}

pub type ProgressCallback = Arc<dyn Fn(BacktestProgress) + Send + Sync>;

/// Snapshot of the most recent base-timeframe candle, used for
/// unrealized-P&L drawdown accounting.
#[derive(Default)]
struct LastBaseCandle {
    candle: StdMutex<Option<Candle>>,
}

impl LastBaseCandle {
    fn get(&self) -> Option<Candle> {
        self.candle
            .lock()
            .expect("candle mutex can't be poisoned")
            .clone()
    }
}

#[async_trait]
impl CandleListener for LastBaseCandle {
    async fn on_candle(&self, candle: &Candle) -> ListenerResult {
        *self.candle.lock().expect("candle mutex can't be poisoned") = Some(candle.clone());
        Ok(())
    }
}

/// Collects completed cycles for the final statistics.
#[derive(Default)]
struct CycleSink {
    cycles: StdMutex<Vec<Cycle>>,
}

impl CycleSink {
    fn snapshot(&self) -> Vec<Cycle> {
        self.cycles
            .lock()
            .expect("cycle mutex can't be poisoned")
            .clone()
    }
}

#[async_trait]
impl CycleListener for CycleSink {
    async fn on_cycle(&self, cycle: &Cycle) -> ListenerResult {
        self.cycles
            .lock()
            .expect("cycle mutex can't be poisoned")
            .push(cycle.clone());
        Ok(())
    }
}

/// Drives one deterministic backtest pass: owns the exchange and strategy
/// lifetimes, advances the simulator candle by candle, tracks drawdown and
/// the stop-loss guard, and computes the final metric set.
pub struct BacktestRunner {
    config: BacktestConfig,
    simulator: Arc<MarketDataSimulator>,
    exchange: Arc<Exchange>,
    #[allow(dead_code)]
    strategy: Arc<dyn Strategy>,
    cycles: Arc<CycleSink>,
    last_base_candle: Arc<LastBaseCandle>,
    progress: Option<ProgressCallback>,
}

impl BacktestRunner {
    /// Wires the simulator, a fresh exchange, and a fresh strategy instance
    /// for the configured symbol.
    pub async fn setup(
        config: BacktestConfig,
        simulator: Arc<MarketDataSimulator>,
        registry: &StrategyRegistry,
        progress: Option<ProgressCallback>,
    ) -> Result<Self> {
        simulator
            .set_times(config.start_time, config.end_time, 10)
            .await;
        simulator
            .add_symbol(&config.symbol, config.timeframes.as_slice().to_vec())
            .await?;

        let feed: Arc<dyn MarketFeed> = simulator.clone();
        let exchange = Exchange::new(feed.clone());
        exchange.set_balance(config.initial_balance).await;
        exchange.set_leverage(&config.symbol, config.leverage).await;
        exchange.set_fees(config.maker_fee, config.taker_fee).await;
        exchange.set_max_notional(config.max_notional).await;
        exchange.set_base_timeframe(config.base_timeframe()).await;

        let cycles = Arc::new(CycleSink::default());
        let cycle_dispatcher = if config.track_cycles {
            let dispatcher = Arc::new(CycleDispatcher::new());
            dispatcher.add(cycles.clone());
            Some(dispatcher)
        } else {
            None
        };

        let factory = registry.get(&config.strategy_name)?;
        let strategy = factory
            .build(StrategyContext {
                symbol: config.symbol.clone(),
                strategy_name: config.strategy_name.clone(),
                timeframes: config.timeframes.clone(),
                rsi_limits: config.rsi_limits,
                exchange: exchange.clone(),
                feed: feed.clone(),
                cycle_dispatcher,
            })
            .await?;

        let last_base_candle = Arc::new(LastBaseCandle::default());
        simulator
            .subscribe(
                &config.symbol,
                config.base_timeframe(),
                last_base_candle.clone(),
            )
            .await?;

        Ok(Self {
            config,
            simulator,
            exchange,
            strategy,
            cycles,
            last_base_candle,
            progress,
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<BacktestResults> {
        info!(
            run_id = %self.config.run_id,
            symbol = %self.config.symbol,
            strategy = %self.config.strategy_name,
            start_time = self.config.start_time,
            end_time = ?self.config.end_time,
            initial_balance = %self.config.initial_balance,
            leverage = %self.config.leverage,
            "backtest started"
        );

        let started = Instant::now();
        let mut last_progress = Instant::now();
        let mut candles_processed: u64 = 0;
        let mut max_unrealized_pnl_loss = Decimal::ZERO;

        while !self.simulator.ended(&self.config.symbol).await {
            self.simulator.next_candle().await?;
            candles_processed += 1;

            self.update_drawdown(&mut max_unrealized_pnl_loss).await;

            if self.should_stop().await {
                info!("stop-on-loss threshold reached, stopping early");
                break;
            }

            if let Some(progress) = &self.progress
                && last_progress.elapsed().as_secs_f64() >= 1.0
            {
                let elapsed = started.elapsed().as_secs_f64();
                (progress.as_ref())(BacktestProgress {
                    candles_processed,
                    current_balance: self.exchange.get_balance().await,
                    execution_time_seconds: elapsed,
                    candles_per_second: candles_processed as f64 / elapsed.max(f64::EPSILON),
                });
                last_progress = Instant::now();
            }
        }

        self.update_drawdown(&mut max_unrealized_pnl_loss).await;

        let final_balance = self.exchange.get_balance().await;
        let trades = self.exchange.get_trades(&self.config.symbol).await;
        let cycles = self.cycles.snapshot();
        let (_, effective_end) = self.simulator.time_range().await;

        let results = BacktestResults::compute(
            &self.config,
            effective_end,
            started.elapsed().as_secs_f64(),
            candles_processed,
            final_balance,
            &trades,
            &cycles,
            max_unrealized_pnl_loss,
        );

        for warning in results.audit(&self.config, &trades) {
            warn!(run_id = %self.config.run_id, warning, "consistency warning");
        }

        info!(
            run_id = %self.config.run_id,
            final_balance = %results.final_balance,
            return_percentage = results.return_percentage,
            total_trades = results.total_trades,
            max_drawdown = results.max_drawdown,
            win_rate = results.win_rate,
            "backtest completed"
        );

        Ok(results)
    }

    async fn update_drawdown(&self, max_loss: &mut Decimal) {
        let Some(candle) = self.last_base_candle.get() else {
            return;
        };

        let balance = self.exchange.get_balance().await;
        let real_balance = self.exchange.real_balance(&self.config.symbol, &candle).await;
        let unrealized = real_balance - balance;

        if unrealized < Decimal::ZERO && unrealized < *max_loss {
            *max_loss = unrealized;
        }
    }

    async fn should_stop(&self) -> bool {
        if !self.config.stop_on_loss {
            return false;
        }

        let balance = self.exchange.get_balance().await;
        let loss = ((self.config.initial_balance - balance) / self.config.initial_balance)
            .to_f64()
            .unwrap_or(0.0);

        if loss >= self.config.max_loss_percentage {
            warn!(
                loss_percentage = loss,
                limit = self.config.max_loss_percentage,
                "maximum loss reached"
            );
            return true;
        }

        false
    }
}
