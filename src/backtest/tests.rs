use super::*;

use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::{
    db::{CandleStore, StoreMode},
    exchange::{OrderSide, OrderType, PositionSide, Trade},
    market::{Candle, CandleListener, MarketDataSource, SymbolInfo, error::Result as MarketResult},
    shared::{Millis, Timeframe},
    simulator::MarketDataSimulator,
    strategy::{Strategy, StrategyContext, StrategyFactory, StrategyRegistry, error::Result as StrategyResult},
};

const T0: Millis = 1_744_023_600_000;

fn candle(timestamp: Millis, close: Decimal) -> Candle {
    Candle {
        symbol: "BTCUSDT".to_string(),
        timeframe: Timeframe::M1,
        timestamp,
        open: close,
        high: close + dec!(5),
        low: close - dec!(5),
        close,
        volume: Decimal::ONE,
    }
}

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

/// Scripted strategy: one market buy on the first candle at or past
/// `buy_at`, one market sell at or past `sell_at`.
struct ScriptedStrategy {
    ctx: StrategyContext,
    buy_at: Millis,
    sell_at: Millis,
    bought: AtomicBool,
    sold: AtomicBool,
}

#[async_trait]
impl Strategy for ScriptedStrategy {
    fn name(&self) -> &str {
        &self.ctx.strategy_name
    }

    fn symbol(&self) -> &str {
        &self.ctx.symbol
    }

    async fn on_candle(&self, candle: &Candle) -> StrategyResult<()> {
        if candle.timestamp >= self.buy_at && !self.bought.swap(true, Ordering::SeqCst) {
            self.ctx
                .exchange
                .new_order(
                    &self.ctx.symbol,
                    PositionSide::Long,
                    OrderSide::Buy,
                    OrderType::Market,
                    dec!(0.01),
                    None,
                )
                .await?;
        }

        if candle.timestamp >= self.sell_at && !self.sold.swap(true, Ordering::SeqCst) {
            self.ctx
                .exchange
                .new_order(
                    &self.ctx.symbol,
                    PositionSide::Long,
                    OrderSide::Sell,
                    OrderType::Market,
                    dec!(0.01),
                    None,
                )
                .await?;
        }

        Ok(())
    }

    async fn on_trade(&self, _trade: &Trade) -> StrategyResult<()> {
        Ok(())
    }
}

struct ListenerAdapter(Arc<ScriptedStrategy>);

#[async_trait]
impl CandleListener for ListenerAdapter {
    async fn on_candle(&self, candle: &Candle) -> crate::market::ListenerResult {
        Strategy::on_candle(self.0.as_ref(), candle)
            .await
            .map_err(Into::into)
    }
}

struct ScriptedFactory {
    buy_at: Millis,
    sell_at: Millis,
}

#[async_trait]
impl StrategyFactory for ScriptedFactory {
    async fn build(&self, ctx: StrategyContext) -> StrategyResult<Arc<dyn Strategy>> {
        let symbol = ctx.symbol.clone();
        let base = ctx.timeframes.base();
        let feed = ctx.feed.clone();

        let strategy = Arc::new(ScriptedStrategy {
            ctx,
            buy_at: self.buy_at,
            sell_at: self.sell_at,
            bought: AtomicBool::new(false),
            sold: AtomicBool::new(false),
        });

        feed.subscribe(&symbol, base, Arc::new(ListenerAdapter(strategy.clone())))
            .await?;

        Ok(strategy)
    }
}

/// Strategy that never trades.
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

/// Prices rise by 1 every minute from 50_000 starting 200 minutes before
/// T0, so warmup candles exist for any min-candle rewind.
async fn simulator_with_trend(minutes: i64) -> Arc<MarketDataSimulator> {
    let store = CandleStore::in_memory(StoreMode::Backtest).await.unwrap();
    let candles: Vec<Candle> = (-200..minutes)
        .map(|i| candle(T0 + i * 60_000, dec!(50_000) + Decimal::from(i)))
        .collect();
    store.add_candles(&candles).await.unwrap();
    MarketDataSimulator::new(store, Arc::new(EmptySource))
}

fn registry_with(name: &str, factory: Arc<dyn StrategyFactory>) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(name, factory);
    registry
}

fn config_for(strategy_name: &str, minutes: i64, max_loss: f64) -> BacktestConfig {
    BacktestConfig::new(
        "BTCUSDT",
        T0,
        Some(T0 + minutes * 60_000),
        dec!(2500),
        dec!(100),
        dec!(0),
        dec!(0),
        dec!(50_000),
        strategy_name,
        true,
        max_loss,
        true,
        vec![Timeframe::M1, Timeframe::M15],
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn idle_strategy_preserves_balance() {
    let simulator = simulator_with_trend(60).await;
    let registry = registry_with("idle", Arc::new(IdleFactory));
    let config = config_for("idle", 60, 0.5);

    let runner = BacktestRunner::setup(config, simulator, &registry, None)
        .await
        .unwrap();
    let results = runner.run().await.unwrap();

    assert_eq!(results.final_balance, dec!(2500));
    assert_eq!(results.total_return, dec!(0));
    assert_eq!(results.total_trades, 0);
    assert_eq!(results.win_rate, 0.0);
    assert!(results.total_candles_processed > 0);
    assert_eq!(results.max_drawdown, 0.0);
}

#[tokio::test]
async fn scripted_round_trip_produces_consistent_metrics() {
    let simulator = simulator_with_trend(60).await;
    let factory = Arc::new(ScriptedFactory {
        buy_at: T0 + 5 * 60_000,
        sell_at: T0 + 40 * 60_000,
    });
    let registry = registry_with("scripted", factory);
    let config = config_for("scripted", 60, 0.9);
    let initial_balance = config.initial_balance;

    let runner = BacktestRunner::setup(config.clone(), simulator, &registry, None)
        .await
        .unwrap();
    let results = runner.run().await.unwrap();

    assert_eq!(results.total_trades, 2);
    assert_eq!(results.total_closed_positions, 1);
    assert_eq!(results.winning_positions, 1);
    assert_eq!(results.win_rate, 100.0);
    assert!(results.profit_factor.is_infinite());

    // Bought at 50_005, sold at 50_040: +35 x 0.01 = 0.35 with zero fees.
    assert_eq!(results.total_return, dec!(0.35));
    assert_eq!(results.final_balance, initial_balance + dec!(0.35));

    // The balance identity holds.
    assert!((results.final_balance - results.total_return - initial_balance).abs() <= dec!(0.01));
}

#[tokio::test]
async fn stop_on_loss_halts_the_run_early() {
    let simulator = simulator_with_trend(120).await;
    let factory = Arc::new(ScriptedFactory {
        buy_at: T0,
        sell_at: T0 + 1_000 * 60_000, // never reached
    });
    let registry = registry_with("scripted", factory);

    // A 20% taker fee burns ~100 of the 2_500 balance on the opening fill
    // (0.01 x ~50_000 x 0.2), roughly 4%, so a low loss limit trips the
    // guard immediately.
    let mut config = config_for("scripted", 120, 0.03);
    config.taker_fee = dec!(0.2);

    let runner = BacktestRunner::setup(config, simulator, &registry, None)
        .await
        .unwrap();
    let results = runner.run().await.unwrap();

    // Stopped well before the 120-minute window was exhausted.
    assert!(results.total_candles_processed < 100);
    assert_eq!(results.total_trades, 1);
    assert!(results.final_balance < dec!(2500));
}

#[tokio::test]
async fn progress_callback_reports_processing() {
    let simulator = simulator_with_trend(30).await;
    let registry = registry_with("idle", Arc::new(IdleFactory));
    let config = config_for("idle", 30, 0.5);

    let seen = Arc::new(StdMutex::new(Vec::<BacktestProgress>::new()));
    let sink = seen.clone();
    let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));

    let runner = BacktestRunner::setup(config, simulator, &registry, Some(callback))
        .await
        .unwrap();
    runner.run().await.unwrap();

    // A fast in-memory run may finish inside the 1-second reporting
    // window; the callback machinery itself must not disturb results.
    let seen = seen.lock().unwrap();
    for progress in seen.iter() {
        assert!(progress.candles_processed > 0);
    }
}
