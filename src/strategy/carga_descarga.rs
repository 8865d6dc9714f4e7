use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::{
    exchange::{
        Exchange, Order, OrderSide, OrderType, PositionSide, Trade, TradeListener, opens_position,
    },
    indicators::{self, FractalPoint},
    market::{Candle, CandleListener, ListenerResult, MarketFeed, SymbolInfo},
    shared::{Millis, RsiLimits, Timeframe, TimeframeSet},
};

use super::{
    Cycle, CycleDispatcher, Strategy, StrategyContext, StrategyFactory, error::Result,
};

const RSI_LOOKBACK: usize = 100;
const STOCH_RSI_PARAMS: (usize, usize, usize, usize) = (14, 14, 3, 3);
const FRACTAL_SPAN: usize = 2;

/// Per-(position_side, side) fill bookkeeping. A flag set on a fill
/// suppresses new orders for that pair until the mid-RSI crossing re-arms
/// it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationsStatus {
    pub long_buy: bool,
    pub long_sell: bool,
    pub short_buy: bool,
    pub short_sell: bool,
}

impl OperationsStatus {
    pub fn get(&self, position_side: PositionSide, side: OrderSide) -> bool {
        match (position_side, side) {
            (PositionSide::Long, OrderSide::Buy) => self.long_buy,
            (PositionSide::Long, OrderSide::Sell) => self.long_sell,
            (PositionSide::Short, OrderSide::Buy) => self.short_buy,
            (PositionSide::Short, OrderSide::Sell) => self.short_sell,
        }
    }

    pub fn set(&mut self, position_side: PositionSide, side: OrderSide, value: bool) {
        match (position_side, side) {
            (PositionSide::Long, OrderSide::Buy) => self.long_buy = value,
            (PositionSide::Long, OrderSide::Sell) => self.long_sell = value,
            (PositionSide::Short, OrderSide::Buy) => self.short_buy = value,
            (PositionSide::Short, OrderSide::Sell) => self.short_sell = value,
        }
    }
}

#[derive(Default)]
struct IndicatorCache {
    last_timestamp: Option<Millis>,
    rsi: HashMap<Timeframe, f64>,
    fractals: HashMap<Timeframe, Vec<FractalPoint>>,
}

#[derive(Default)]
struct CycleTracker {
    current_start: Option<Millis>,
    long_trades: u32,
    short_trades: u32,
    long_max_loads: u32,
    short_max_loads: u32,
}

impl CycleTracker {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The load/unload (carga/descarga) martingale-style strategy.
///
/// Per base candle it derives load counts from position history, gates
/// increase/decrease decisions on multi-timeframe Stochastic RSI and
/// break-even constraints, and maintains at most one resting order per
/// (position_side, side), built from fractal-derived price ladders.
pub struct CargaDescarga {
    symbol: String,
    strategy_name: String,
    timeframes: TimeframeSet,
    rsi_limits: RsiLimits,
    exchange: Arc<Exchange>,
    feed: Arc<dyn MarketFeed>,
    cycle_dispatcher: Option<Arc<CycleDispatcher>>,
    ops_status: StdMutex<OperationsStatus>,
    indicator_cache: Mutex<IndicatorCache>,
    symbol_info: OnceCell<SymbolInfo>,
    cycle: StdMutex<CycleTracker>,
}

impl CargaDescarga {
    pub fn new(ctx: StrategyContext) -> Arc<Self> {
        Arc::new(Self {
            symbol: ctx.symbol,
            strategy_name: ctx.strategy_name,
            timeframes: ctx.timeframes,
            rsi_limits: ctx.rsi_limits,
            exchange: ctx.exchange,
            feed: ctx.feed,
            cycle_dispatcher: ctx.cycle_dispatcher,
            ops_status: StdMutex::new(OperationsStatus::default()),
            indicator_cache: Mutex::new(IndicatorCache::default()),
            symbol_info: OnceCell::new(),
            cycle: StdMutex::new(CycleTracker::default()),
        })
    }

    pub fn operations_status(&self) -> OperationsStatus {
        *self
            .ops_status
            .lock()
            .expect("ops status mutex can't be poisoned")
    }

    fn ops_get(&self, position_side: PositionSide, side: OrderSide) -> bool {
        self.ops_status
            .lock()
            .expect("ops status mutex can't be poisoned")
            .get(position_side, side)
    }

    fn ops_set(&self, position_side: PositionSide, side: OrderSide, value: bool) {
        self.ops_status
            .lock()
            .expect("ops status mutex can't be poisoned")
            .set(position_side, side, value);
    }

    async fn symbol_info(&self) -> Result<&SymbolInfo> {
        Ok(self
            .symbol_info
            .get_or_try_init(|| self.feed.symbol_info(&self.symbol))
            .await?)
    }

    fn decimals_of(step: Decimal) -> u32 {
        step.normalize().scale()
    }

    fn round_up(value: Decimal, decimals: u32) -> Decimal {
        value.round_dp_with_strategy(decimals, RoundingStrategy::AwayFromZero)
    }

    fn round_down(value: Decimal, decimals: u32) -> Decimal {
        value.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
    }

    async fn rsi(&self, timeframe: Timeframe) -> Result<f64> {
        {
            let cache = self.indicator_cache.lock().await;
            if let Some(value) = cache.rsi.get(&timeframe) {
                return Ok(*value);
            }
        }

        let candles = self
            .feed
            .candles(&self.symbol, timeframe, RSI_LOOKBACK)
            .await?;
        let (rsi_p, stoch_p, signal_p, smooth_p) = STOCH_RSI_PARAMS;
        let values = indicators::stoch_rsi(&candles, rsi_p, stoch_p, signal_p, smooth_p)?;
        let value = values
            .last()
            .and_then(|v| v.stoch_rsi)
            .unwrap_or(self.rsi_limits.mid() as f64);

        self.indicator_cache
            .lock()
            .await
            .rsi
            .insert(timeframe, value);
        Ok(value)
    }

    async fn fractals(&self, timeframe: Timeframe) -> Result<Vec<FractalPoint>> {
        {
            let cache = self.indicator_cache.lock().await;
            if let Some(points) = cache.fractals.get(&timeframe) {
                return Ok(points.clone());
            }
        }

        let candles = self
            .feed
            .candles(&self.symbol, timeframe, RSI_LOOKBACK)
            .await?;
        let points = indicators::fractals(&candles, FRACTAL_SPAN, FRACTAL_SPAN)?;

        self.indicator_cache
            .lock()
            .await
            .fractals
            .insert(timeframe, points.clone());
        Ok(points)
    }

    /// Candidate limit prices above and below `price`, derived from fractal
    /// midpoints across the subscribed timeframes; ±2% rungs are
    /// synthesized when fractals are unavailable.
    async fn possible_prices(&self, price: Decimal) -> Result<(Vec<Decimal>, Vec<Decimal>)> {
        let up_step = Decimal::new(102, 2);
        let down_step = Decimal::new(98, 2);

        let mut up: Vec<Decimal> = Vec::new();
        let mut down: Vec<Decimal> = Vec::new();
        let mut last_up = price;
        let mut last_down = price;

        'outer: for timeframe in self.timeframes.as_slice() {
            let points = self.fractals(*timeframe).await?;
            for point in points.iter().rev() {
                if let Some(bear) = point.bear
                    && up.len() < 4
                {
                    if bear > last_up {
                        up.push((bear - last_up) / Decimal::TWO + last_up);
                        last_up = bear;
                    }
                } else if let Some(bull) = point.bull
                    && down.len() < 4
                {
                    if bull < last_down {
                        down.push((last_down - bull) / Decimal::TWO + bull);
                        last_down = bull;
                    }
                }
                if up.len() == 4 && down.len() == 4 {
                    break 'outer;
                }
            }
        }

        if up.is_empty() {
            up.push(price * up_step);
        }
        if down.is_empty() {
            down.push(price * down_step);
        }
        while up.len() < 4 {
            let last = *up.last().expect("not empty");
            up.push(last * up_step);
        }
        while down.len() < 4 {
            let last = *down.last().expect("not empty");
            down.push(last * down_step);
        }

        Ok((up, down))
    }

    async fn cancel_orders(&self, position_side: PositionSide, side: OrderSide) {
        let orders = self.exchange.get_orders(&self.symbol).await;
        for order in orders {
            if order.position_side == position_side && order.side == side {
                match self.exchange.cancel_order(&order.order_id).await {
                    Ok(true) => info!(
                        order_id = %order.order_id,
                        %position_side,
                        %side,
                        "canceled order"
                    ),
                    Ok(false) => {}
                    Err(error) => warn!(order_id = %order.order_id, %error, "cancel failed"),
                }
            }
        }
    }

    async fn place_order(
        &self,
        position_side: PositionSide,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) {
        match self
            .exchange
            .new_order(&self.symbol, position_side, side, order_type, quantity, price)
            .await
        {
            Ok(_) => info!(
                %position_side,
                %side,
                %order_type,
                %quantity,
                price = ?price,
                "new order"
            ),
            Err(error) => warn!(%position_side, %side, %error, "error creating order"),
        }
    }

    async fn modify_order(&self, order: Order) {
        match self.exchange.modify_order(order).await {
            Ok(Some(order)) => info!(
                order_id = %order.order_id,
                price = ?order.price,
                quantity = %order.quantity,
                "modified order"
            ),
            Ok(None) => {}
            Err(error) => warn!(%error, "error modifying order"),
        }
    }

    /// Creates the resting order for `(position_side, side)` or aligns the
    /// existing one with the wanted price/quantity.
    async fn upsert_resting_order(
        &self,
        orders: &[Order],
        position_side: PositionSide,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) {
        let existing = orders
            .iter()
            .find(|o| o.position_side == position_side && o.side == side);

        match existing {
            Some(order) => {
                if order.price != Some(price) || order.quantity != quantity {
                    let mut updated = order.clone();
                    updated.price = Some(price);
                    updated.quantity = quantity;
                    updated.order_type = OrderType::Limit;
                    self.modify_order(updated).await;
                }
            }
            None => {
                self.place_order(position_side, side, OrderType::Limit, quantity, Some(price))
                    .await;
            }
        }
    }

    async fn handle_candle(&self, candle: &Candle) -> Result<()> {
        let base = self.timeframes.base();
        if candle.timeframe != base {
            return Ok(());
        }

        {
            let mut cache = self.indicator_cache.lock().await;
            if cache.last_timestamp != Some(candle.timestamp) {
                cache.rsi.clear();
                cache.fractals.clear();
                cache.last_timestamp = Some(candle.timestamp);
            }
        }

        let long = self.exchange.get_position(&self.symbol, PositionSide::Long).await;
        let short = self.exchange.get_position(&self.symbol, PositionSide::Short).await;

        let info = self.symbol_info().await?.clone();
        let qty_decimals = Self::decimals_of(info.min_step);
        let price_decimals = Self::decimals_of(info.tick_size);
        let min_amount = Self::round_up(info.min_notional / candle.close, qty_decimals);

        let long_loads = long.load_count(None) as usize;
        let short_loads = short.load_count(Some(min_amount)) as usize;

        let tf_count = self.timeframes.len();
        let loads_per_tf = (9 / tf_count).max(1);
        let long_tf = (long_loads / loads_per_tf).min(tf_count - 1);
        let short_tf = (short_loads / loads_per_tf).min(tf_count - 1);
        let is_long_last_tf_load = long_loads > 0 && long_loads % loads_per_tf == 0;
        let is_short_last_tf_load = short_loads > 0 && short_loads % loads_per_tf == 0;
        let r = long_tf.max(short_tf);

        let mut increase_long = true;
        let mut decrease_long = true;
        let mut increase_short = true;
        let mut decrease_short = true;

        debug!(
            long_loads,
            short_loads, long_tf, short_tf, r, "load state evaluated"
        );

        let long_commission = long.commission;
        let short_commission = short.commission;
        let two = Decimal::TWO;

        // Break-even constraints: never rest a closing order below the
        // commission-adjusted entry.
        if long.amount > Decimal::ZERO
            && candle.close < long.entry_price + (long_commission * two)
        {
            decrease_long = false;
            self.cancel_orders(PositionSide::Long, OrderSide::Sell).await;
        }
        if short.amount.abs() > Decimal::ZERO
            && candle.close > short.entry_price - (short_commission * two)
        {
            decrease_short = false;
            self.cancel_orders(PositionSide::Short, OrderSide::Buy).await;
        }

        if long_loads >= loads_per_tf
            && candle.close > long.entry_price - (long_commission * two)
        {
            increase_long = false;
            self.cancel_orders(PositionSide::Long, OrderSide::Buy).await;
        }
        if short_loads >= loads_per_tf
            && candle.close < short.entry_price + (short_commission * two)
        {
            increase_short = false;
            self.cancel_orders(PositionSide::Short, OrderSide::Sell).await;
        }

        let rsi_low = self.rsi_limits.low() as f64;
        let rsi_mid = self.rsi_limits.mid() as f64;
        let rsi_high = self.rsi_limits.high() as f64;

        // Higher-timeframe RSI gating, highest active timeframe first.
        for i in (0..=r).rev() {
            let Some(timeframe) = self.timeframes.get(i) else {
                continue;
            };
            let rsi = self.rsi(timeframe).await?;

            if i > 0 {
                if rsi > rsi_low {
                    if i <= long_tf {
                        increase_long = false;
                        self.cancel_orders(PositionSide::Long, OrderSide::Buy).await;
                    }
                    if (is_short_last_tf_load && i < short_tf)
                        || (!is_short_last_tf_load && i <= short_tf)
                    {
                        decrease_short = false;
                        self.cancel_orders(PositionSide::Short, OrderSide::Buy).await;
                    }
                }
                if rsi < rsi_high {
                    if (is_long_last_tf_load && i < long_tf)
                        || (!is_long_last_tf_load && i <= long_tf)
                    {
                        decrease_long = false;
                        self.cancel_orders(PositionSide::Long, OrderSide::Sell).await;
                    }
                    if i <= short_tf {
                        increase_short = false;
                        self.cancel_orders(PositionSide::Short, OrderSide::Sell).await;
                    }
                }
            }

            // Mid crossings re-arm the fill bookkeeping.
            if rsi > rsi_mid {
                if i == long_tf && self.ops_get(PositionSide::Long, OrderSide::Buy) {
                    self.ops_set(PositionSide::Long, OrderSide::Buy, false);
                }
                if (i == short_tf || (is_short_last_tf_load && i + 1 == short_tf))
                    && self.ops_get(PositionSide::Short, OrderSide::Buy)
                {
                    self.ops_set(PositionSide::Short, OrderSide::Buy, false);
                }
            }
            if rsi < rsi_mid {
                if (i == long_tf || (is_long_last_tf_load && i + 1 == long_tf))
                    && self.ops_get(PositionSide::Long, OrderSide::Sell)
                {
                    self.ops_set(PositionSide::Long, OrderSide::Sell, false);
                }
                if i == short_tf && self.ops_get(PositionSide::Short, OrderSide::Sell) {
                    self.ops_set(PositionSide::Short, OrderSide::Sell, false);
                }
            }
        }

        if long.is_flat() {
            decrease_long = false;
        }
        if short.is_flat() {
            decrease_short = false;
        }

        if !(increase_long || decrease_long || increase_short || decrease_short) {
            return Ok(());
        }

        let orders = self.exchange.get_orders(&self.symbol).await;

        let (up, down) = self.possible_prices(candle.close).await?;
        let base_rsi = self.rsi(base).await?;
        let (sell_price, buy_price) = if base_rsi < rsi_low {
            (up[3], down[0])
        } else if base_rsi > rsi_high {
            (up[0], down[3])
        } else if base_rsi < rsi_mid {
            (up[2], down[1])
        } else {
            (up[1], down[2])
        };
        let sell_price = Self::round_up(sell_price, price_decimals);
        let buy_price = Self::round_down(buy_price, price_decimals);

        let long_value = long.amount * (candle.close - long.entry_price);
        let short_value = short.amount * (candle.close - short.entry_price);
        let positions_value = long_value + short_value;

        // Deep on both sides with a net gain: flatten the lesser-loaded
        // side pair with symmetric market exits.
        if long_loads >= 4 && short_loads >= 4 {
            if increase_long
                && decrease_short
                && positions_value > Decimal::ZERO
                && long_loads <= short_loads
            {
                increase_long = false;
                self.cancel_orders(PositionSide::Long, OrderSide::Buy).await;
                self.place_order(
                    PositionSide::Long,
                    OrderSide::Sell,
                    OrderType::Market,
                    long.amount.abs(),
                    None,
                )
                .await;
                decrease_short = false;
                self.cancel_orders(PositionSide::Short, OrderSide::Buy).await;
                self.place_order(
                    PositionSide::Short,
                    OrderSide::Buy,
                    OrderType::Market,
                    short.amount.abs(),
                    None,
                )
                .await;
            }

            if increase_short
                && decrease_long
                && positions_value > Decimal::ZERO
                && short_loads <= long_loads
            {
                increase_short = false;
                self.cancel_orders(PositionSide::Short, OrderSide::Sell).await;
                self.place_order(
                    PositionSide::Short,
                    OrderSide::Buy,
                    OrderType::Market,
                    short.amount.abs(),
                    None,
                )
                .await;
                decrease_long = false;
                self.cancel_orders(PositionSide::Long, OrderSide::Sell).await;
                self.place_order(
                    PositionSide::Long,
                    OrderSide::Sell,
                    OrderType::Market,
                    long.amount.abs(),
                    None,
                )
                .await;
            }
        }

        if increase_long && !self.ops_get(PositionSide::Long, OrderSide::Buy) {
            let qty = if long.amount > Decimal::ZERO {
                long.amount
            } else {
                min_amount
            };
            self.upsert_resting_order(&orders, PositionSide::Long, OrderSide::Buy, qty, buy_price)
                .await;
        }

        if decrease_long
            && !self.ops_get(PositionSide::Long, OrderSide::Sell)
            && sell_price > long.entry_price + (long_commission * two)
        {
            let mut qty = Self::round_up(long.amount / two, qty_decimals);
            if qty < min_amount {
                qty = long.amount;
            }
            self.upsert_resting_order(&orders, PositionSide::Long, OrderSide::Sell, qty, sell_price)
                .await;
        }

        if increase_short && !self.ops_get(PositionSide::Short, OrderSide::Sell) {
            let qty = if short.amount < Decimal::ZERO {
                short.amount.abs()
            } else {
                min_amount
            };
            self.upsert_resting_order(&orders, PositionSide::Short, OrderSide::Sell, qty, sell_price)
                .await;
        }

        if decrease_short
            && !self.ops_get(PositionSide::Short, OrderSide::Buy)
            && buy_price < short.entry_price - (short_commission * two)
        {
            let mut qty = Self::round_up(short.amount / two, qty_decimals).abs();
            if qty < min_amount {
                qty = short.amount.abs();
            }
            self.upsert_resting_order(&orders, PositionSide::Short, OrderSide::Buy, qty, buy_price)
                .await;
        }

        Ok(())
    }

    async fn handle_trade(&self, trade: &Trade) -> Result<()> {
        info!(
            symbol = %trade.symbol,
            position_side = %trade.position_side,
            side = %trade.side,
            quantity = %trade.quantity,
            price = %trade.price,
            "trade filled"
        );

        if !trade.realized_pnl.is_zero() {
            let close_type = if trade.closes_completely {
                "complete"
            } else {
                "partial"
            };
            info!(
                close_type,
                realized_pnl = %trade.realized_pnl,
                "position close"
            );
        }

        self.ops_set(trade.position_side, trade.side, true);

        self.track_cycle(trade).await?;

        // A fill invalidates the current order plan; rebuild it on the next
        // candle.
        let orders = self.exchange.get_orders(&self.symbol).await;
        for order in orders {
            self.exchange.cancel_order(&order.order_id).await?;
            info!(order_id = %order.order_id, "canceled order after fill");
        }

        Ok(())
    }

    async fn track_cycle(&self, trade: &Trade) -> Result<()> {
        let long = self.exchange.get_position(&self.symbol, PositionSide::Long).await;
        let short = self.exchange.get_position(&self.symbol, PositionSide::Short).await;
        let both_flat = long.is_flat() && short.is_flat();

        enum Action {
            None,
            Complete { start: Millis, cycle: Cycle },
        }

        let action = {
            let mut tracker = self.cycle.lock().expect("cycle mutex can't be poisoned");

            match tracker.current_start {
                None => {
                    if !both_flat && opens_position(trade.position_side, trade.side) {
                        tracker.current_start = Some(trade.timestamp);
                        info!(timestamp = trade.timestamp, "new cycle started");
                    }
                    if tracker.current_start.is_some() {
                        Self::count_trade(&mut tracker, trade, &long, &short);
                    }
                    Action::None
                }
                Some(start) => {
                    Self::count_trade(&mut tracker, trade, &long, &short);

                    if both_flat {
                        let mut cycle = Cycle::new(
                            &self.symbol,
                            &self.strategy_name,
                            start,
                            trade.timestamp,
                            Decimal::ZERO,
                        );
                        cycle.long_trades_count = tracker.long_trades;
                        cycle.short_trades_count = tracker.short_trades;
                        cycle.long_max_loads = tracker.long_max_loads;
                        cycle.short_max_loads = tracker.short_max_loads;
                        tracker.reset();
                        Action::Complete { start, cycle }
                    } else {
                        Action::None
                    }
                }
            }
        };

        if let Action::Complete { start, mut cycle } = action {
            let trades = self.exchange.get_trades(&self.symbol).await;
            cycle.total_pnl = trades
                .iter()
                .filter(|t| t.timestamp >= start && t.timestamp <= trade.timestamp)
                .map(|t| t.realized_pnl)
                .sum();

            info!(
                cycle_id = %cycle.cycle_id,
                total_pnl = %cycle.total_pnl,
                duration_minutes = cycle.duration_minutes(),
                "cycle completed"
            );

            if let Some(dispatcher) = &self.cycle_dispatcher {
                dispatcher.dispatch(&cycle).await;
            }
        }

        Ok(())
    }

    fn count_trade(
        tracker: &mut CycleTracker,
        trade: &Trade,
        long: &crate::exchange::Position,
        short: &crate::exchange::Position,
    ) {
        match trade.position_side {
            PositionSide::Long => tracker.long_trades += 1,
            PositionSide::Short => tracker.short_trades += 1,
        }

        if long.amount > Decimal::ZERO {
            tracker.long_max_loads = tracker.long_max_loads.max(long.load_count(None));
        }
        if short.amount < Decimal::ZERO {
            tracker.short_max_loads = tracker.short_max_loads.max(short.load_count(None));
        }
    }
}

#[async_trait]
impl Strategy for CargaDescarga {
    fn name(&self) -> &str {
        &self.strategy_name
    }

    fn symbol(&self) -> &str {
        &self.symbol
    }

    async fn on_candle(&self, candle: &Candle) -> Result<()> {
        self.handle_candle(candle).await
    }

    async fn on_trade(&self, trade: &Trade) -> Result<()> {
        self.handle_trade(trade).await
    }
}

#[async_trait]
impl CandleListener for CargaDescarga {
    async fn on_candle(&self, candle: &Candle) -> ListenerResult {
        self.handle_candle(candle).await.map_err(Into::into)
    }
}

#[async_trait]
impl TradeListener for CargaDescarga {
    async fn on_trade(&self, trade: &Trade) -> ListenerResult {
        self.handle_trade(trade).await.map_err(Into::into)
    }
}

/// Builds a [`CargaDescarga`] wired to its candle and trade streams.
pub struct CargaDescargaFactory;

#[async_trait]
impl StrategyFactory for CargaDescargaFactory {
    async fn build(&self, ctx: StrategyContext) -> Result<Arc<dyn Strategy>> {
        let symbol = ctx.symbol.clone();
        let timeframes = ctx.timeframes.clone();
        let feed = ctx.feed.clone();
        let exchange = ctx.exchange.clone();

        let strategy = CargaDescarga::new(ctx);

        for timeframe in timeframes.as_slice() {
            let listener: Arc<dyn CandleListener> = strategy.clone();
            feed.subscribe(&symbol, *timeframe, listener).await?;
        }
        exchange.add_trade_listener(strategy.clone());

        Ok(strategy)
    }
}
