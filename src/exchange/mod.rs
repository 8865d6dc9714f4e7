use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    market::{Candle, CandleListener, ListenerId, ListenerResult, MarketFeed},
    shared::{Millis, Timeframe},
};

pub mod error;

mod dispatcher;
mod models;

pub use dispatcher::{EventDispatcher, OrderListener, PositionListener, TradeListener};
pub use models::{
    Order, OrderSide, OrderStatus, OrderType, Position, PositionSide, Trade, opens_position,
};

use error::{ExchangeError, Result};

/// One exchange event, emitted in the fixed order
/// order -> trade -> position for a given fill.
enum Event {
    Order(Order),
    Trade(Trade),
    Position(Position),
}

struct ExchangeState {
    balance: Decimal,
    leverage: HashMap<String, Decimal>,
    maker_fee: Decimal,
    taker_fee: Decimal,
    max_notional: Decimal,
    base_timeframe: Timeframe,
    orders: Vec<Order>,
    positions: HashMap<(String, PositionSide), Position>,
    trades: HashMap<String, Vec<Trade>>,
    feed_subscriptions: HashMap<String, ListenerId>,
}

impl ExchangeState {
    fn new() -> Self {
        Self {
            balance: Decimal::ZERO,
            leverage: HashMap::new(),
            maker_fee: Decimal::ZERO,
            taker_fee: Decimal::ZERO,
            max_notional: Decimal::ZERO,
            base_timeframe: Timeframe::M1,
            orders: Vec::new(),
            positions: HashMap::new(),
            trades: HashMap::new(),
            feed_subscriptions: HashMap::new(),
        }
    }

    fn leverage_for(&self, symbol: &str) -> Decimal {
        self.leverage
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    fn position(&self, symbol: &str, side: PositionSide) -> Position {
        self.positions
            .get(&(symbol.to_string(), side))
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol, side))
    }

    fn set_position(&mut self, position: Position) {
        self.positions
            .insert((position.symbol.clone(), position.side), position);
    }

    fn symbol_order_count(&self, symbol: &str) -> usize {
        self.orders.iter().filter(|o| o.symbol == symbol).count()
    }

    fn remove_order(&mut self, order_id: &str) -> Option<Order> {
        let index = self.orders.iter().position(|o| o.order_id == order_id)?;
        Some(self.orders.remove(index))
    }
}

/// Simulated leveraged perpetual-futures exchange with two independent
/// positions (long and short) per symbol.
///
/// Matching runs against the base-timeframe candle stream: the exchange
/// registers itself as a candle listener while at least one resting limit
/// order exists for a symbol, and releases the subscription when the last
/// order fills or is canceled. The state mutex is never held across a
/// listener dispatch or a feed call.
pub struct Exchange {
    weak: Weak<Exchange>,
    feed: Arc<dyn MarketFeed>,
    dispatcher: EventDispatcher,
    state: Mutex<ExchangeState>,
}

impl Exchange {
    pub fn new(feed: Arc<dyn MarketFeed>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            feed,
            dispatcher: EventDispatcher::new(),
            state: Mutex::new(ExchangeState::new()),
        })
    }

    fn self_arc(&self) -> Arc<Self> {
        self.weak
            .upgrade()
            .expect("`Exchange` is alive while its methods run")
    }

    pub async fn set_balance(&self, balance: Decimal) {
        self.state.lock().await.balance = balance;
    }

    pub async fn get_balance(&self) -> Decimal {
        self.state.lock().await.balance
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: Decimal) {
        self.state
            .lock()
            .await
            .leverage
            .insert(symbol.to_string(), leverage);
    }

    pub async fn get_leverage(&self, symbol: &str) -> Decimal {
        self.state.lock().await.leverage_for(symbol)
    }

    pub async fn set_fees(&self, maker: Decimal, taker: Decimal) {
        let mut state = self.state.lock().await;
        state.maker_fee = maker;
        state.taker_fee = taker;
    }

    pub async fn set_max_notional(&self, max_notional: Decimal) {
        self.state.lock().await.max_notional = max_notional;
    }

    pub async fn set_base_timeframe(&self, timeframe: Timeframe) {
        self.state.lock().await.base_timeframe = timeframe;
    }

    pub async fn base_timeframe(&self) -> Timeframe {
        self.state.lock().await.base_timeframe
    }

    pub async fn get_orders(&self, symbol: &str) -> Vec<Order> {
        self.state
            .lock()
            .await
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub async fn get_trades(&self, symbol: &str) -> Vec<Trade> {
        self.state
            .lock()
            .await
            .trades
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_position(&self, symbol: &str, side: PositionSide) -> Position {
        self.state.lock().await.position(symbol, side)
    }

    /// Balance plus worst-case unrealized P&L against the given candle
    /// (`low` for longs, `high` for shorts).
    pub async fn real_balance(&self, symbol: &str, candle: &Candle) -> Decimal {
        let state = self.state.lock().await;
        state.balance + Self::worst_case_unrealized(&state, symbol, candle)
    }

    pub fn add_order_listener(&self, listener: Arc<dyn OrderListener>) {
        self.dispatcher.add_order_listener(listener);
    }

    pub fn add_trade_listener(&self, listener: Arc<dyn TradeListener>) {
        self.dispatcher.add_trade_listener(listener);
    }

    pub fn add_position_listener(&self, listener: Arc<dyn PositionListener>) {
        self.dispatcher.add_position_listener(listener);
    }

    pub async fn new_order(
        &self,
        symbol: &str,
        position_side: PositionSide,
        side: OrderSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<Order> {
        match order_type {
            OrderType::Market if price.is_some() => return Err(ExchangeError::MarketOrderWithPrice),
            OrderType::Limit if price.is_none() => {
                return Err(ExchangeError::LimitOrderWithoutPrice);
            }
            _ => {}
        }

        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::NonPositiveQuantity { quantity });
        }
        if let Some(price) = price
            && price <= Decimal::ZERO
        {
            return Err(ExchangeError::NonPositivePrice { price });
        }

        let candle = self.latest_base_candle(symbol).await?;

        let mut state = self.state.lock().await;

        if opens_position(position_side, side) {
            Self::validate_open(&state, symbol, quantity, candle.close)?;
        }

        let order = Order {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            position_side,
            side,
            order_type,
            price,
            quantity,
            status: OrderStatus::New,
        };

        match order_type {
            OrderType::Market => {
                let mut filled = order;
                filled.price = Some(candle.close);
                let (filled, events) =
                    Self::complete_order(&mut state, filled, candle.close, candle.timestamp);
                drop(state);

                self.dispatch_events(events).await;
                Ok(filled)
            }
            OrderType::Limit => {
                let first_for_symbol = state.symbol_order_count(symbol) == 0;
                let base_timeframe = state.base_timeframe;
                state.orders.push(order.clone());
                drop(state);

                if first_for_symbol {
                    self.subscribe_matching(symbol, base_timeframe).await;
                }

                self.dispatcher.dispatch_order(&order).await;
                Ok(order)
            }
        }
    }

    /// Replaces the price/quantity of a resting order, re-validating the
    /// notional constraints for opening orders. A market modification
    /// executes at the latest close and then deletes the original order.
    pub async fn modify_order(&self, order: Order) -> Result<Option<Order>> {
        if opens_position(order.position_side, order.side) {
            let Some(candle) = self.try_latest_base_candle(&order.symbol).await? else {
                return Ok(None);
            };

            let state = self.state.lock().await;
            Self::validate_open(&state, &order.symbol, order.quantity, candle.close)?;
        }

        if order.order_type == OrderType::Market {
            if let Some(candle) = self.try_latest_base_candle(&order.symbol).await? {
                let mut state = self.state.lock().await;
                let _ = state.remove_order(&order.order_id);

                let mut filled = order.clone();
                filled.price = Some(candle.close);
                let (_, events) =
                    Self::complete_order(&mut state, filled, candle.close, candle.timestamp);

                let released = state.symbol_order_count(&order.symbol) == 0;
                drop(state);

                self.dispatch_events(events).await;
                if released {
                    self.release_matching(&order.symbol).await;
                }
            }
            return Ok(None);
        }

        let mut state = self.state.lock().await;
        let Some(stored) = state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order.order_id)
        else {
            return Ok(None);
        };

        stored.price = order.price;
        stored.quantity = order.quantity;
        let modified = stored.clone();
        drop(state);

        self.dispatcher.dispatch_order(&modified).await;
        Ok(Some(modified))
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(mut order) = state.remove_order(order_id) else {
            return Ok(false);
        };

        order.status = OrderStatus::Canceled;
        let released = state.symbol_order_count(&order.symbol) == 0;
        drop(state);

        self.dispatcher.dispatch_order(&order).await;
        if released {
            self.release_matching(&order.symbol).await;
        }

        Ok(true)
    }

    async fn latest_base_candle(&self, symbol: &str) -> Result<Candle> {
        self.try_latest_base_candle(symbol)
            .await?
            .ok_or_else(|| ExchangeError::NoCandles {
                symbol: symbol.to_string(),
            })
    }

    async fn try_latest_base_candle(&self, symbol: &str) -> Result<Option<Candle>> {
        let base_timeframe = self.base_timeframe().await;
        let candles = self.feed.candles(symbol, base_timeframe, 10).await?;
        Ok(candles.last().cloned())
    }

    fn validate_open(
        state: &ExchangeState,
        symbol: &str,
        quantity: Decimal,
        close: Decimal,
    ) -> Result<()> {
        let long = state.position(symbol, PositionSide::Long);
        let short = state.position(symbol, PositionSide::Short);
        let positions_notional = (long.amount.abs() + short.amount.abs()) * close;
        let order_notional = quantity.abs() * close;

        let required_margin = order_notional / state.leverage_for(symbol);
        if required_margin > state.balance {
            return Err(ExchangeError::InsufficientBalance {
                required_margin,
                balance: state.balance,
            });
        }

        if positions_notional + order_notional > state.max_notional {
            return Err(ExchangeError::MaxNotionalExceeded {
                requested: positions_notional + order_notional,
                max_notional: state.max_notional,
            });
        }

        Ok(())
    }

    /// Executes a fill: realizes P&L, updates the balance and position,
    /// records the trade, and returns the events to dispatch once the state
    /// lock is released.
    fn complete_order(
        state: &mut ExchangeState,
        mut order: Order,
        price: Decimal,
        timestamp: Millis,
    ) -> (Order, Vec<Event>) {
        let fee_rate = match order.order_type {
            OrderType::Limit => state.maker_fee,
            OrderType::Market => state.taker_fee,
        };

        let signed_quantity = match order.side {
            OrderSide::Buy => order.quantity,
            OrderSide::Sell => -order.quantity,
        };
        let trade_size = signed_quantity * price;
        let commission = (order.quantity * price * fee_rate).abs();

        let mut position = state.position(&order.symbol, order.position_side);
        let value = order.quantity * (price - position.entry_price);

        let realized_pnl = match (order.position_side, order.side) {
            (PositionSide::Long, OrderSide::Sell) => value - commission,
            (PositionSide::Short, OrderSide::Buy) => -value - commission,
            _ => Decimal::ZERO,
        };

        // Closing trades settle P&L net of commission; opening trades only
        // pay the commission.
        if opens_position(order.position_side, order.side) {
            state.balance -= commission;
        } else {
            state.balance += realized_pnl;
        }

        let new_amount = position.amount + signed_quantity;
        let closes_completely = new_amount.is_zero();

        let trade = Trade {
            order_id: order.order_id.clone(),
            timestamp,
            symbol: order.symbol.clone(),
            position_side: order.position_side,
            side: order.side,
            price,
            quantity: order.quantity,
            commission,
            realized_pnl,
            closes_completely,
        };

        state
            .trades
            .entry(order.symbol.clone())
            .or_default()
            .push(trade.clone());

        if closes_completely {
            position = Position::flat(&order.symbol, order.position_side);
        } else {
            let trade_size_abs = trade_size.abs();
            let old_amount_abs = position.amount.abs();
            let new_amount_abs = new_amount.abs();

            if opens_position(order.position_side, order.side) {
                position.break_even = ((position.break_even * old_amount_abs)
                    + trade_size_abs
                    + (commission * Decimal::TWO))
                    / new_amount_abs;
                position.entry_price =
                    ((position.entry_price * old_amount_abs) + trade_size_abs) / new_amount_abs;
            } else {
                position.break_even =
                    ((position.break_even * old_amount_abs) + trade_size_abs) / new_amount_abs;
            }

            position.add_trade(trade.clone());
            position.amount = new_amount;
        }

        state.set_position(position.clone());

        order.status = OrderStatus::Filled;
        order.price = Some(price);

        let events = vec![
            Event::Order(order.clone()),
            Event::Trade(trade),
            Event::Position(position),
        ];

        (order, events)
    }

    fn worst_case_unrealized(state: &ExchangeState, symbol: &str, candle: &Candle) -> Decimal {
        let long = state.position(symbol, PositionSide::Long);
        let short = state.position(symbol, PositionSide::Short);

        let mut unrealized = Decimal::ZERO;
        if long.amount > Decimal::ZERO {
            unrealized += long.amount * (candle.low - long.entry_price);
        }
        if short.amount < Decimal::ZERO {
            unrealized += short.amount.abs() * (short.entry_price - candle.high);
        }
        unrealized
    }

    /// Per-candle processing: liquidation first, then matching of every
    /// resting order against the candle. Fill events for each order are
    /// dispatched before the next order is examined, so listeners may
    /// cancel or modify the remaining orders mid-candle.
    async fn handle_candle(&self, candle: &Candle) -> Result<()> {
        let symbol = candle.symbol.clone();

        // Liquidation: worst-case unrealized P&L wipes the balance.
        let liquidation_events = {
            let mut state = self.state.lock().await;
            let unrealized = Self::worst_case_unrealized(&state, &symbol, candle);
            let long = state.position(&symbol, PositionSide::Long);
            let short = state.position(&symbol, PositionSide::Short);
            let any_open = !long.is_flat() || !short.is_flat();

            if any_open && state.balance + unrealized <= Decimal::ZERO {
                warn!(
                    symbol = %symbol,
                    balance = %state.balance,
                    %unrealized,
                    "liquidation triggered"
                );
                state.balance = Decimal::ZERO;
                let long = Position::flat(&symbol, PositionSide::Long);
                let short = Position::flat(&symbol, PositionSide::Short);
                state.set_position(long.clone());
                state.set_position(short.clone());
                vec![Event::Position(long), Event::Position(short)]
            } else {
                Vec::new()
            }
        };
        self.dispatch_events(liquidation_events).await;

        let order_ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .orders
                .iter()
                .filter(|o| o.symbol == symbol)
                .map(|o| o.order_id.clone())
                .collect()
        };

        for order_id in order_ids {
            let (events, released) = {
                let mut state = self.state.lock().await;

                // A listener of an earlier fill may have canceled this one.
                let Some(index) = state.orders.iter().position(|o| o.order_id == order_id)
                else {
                    continue;
                };

                let order = &state.orders[index];
                let Some(price) = order.price else {
                    continue;
                };

                let fills = match order.side {
                    OrderSide::Buy => price >= candle.close || price >= candle.low,
                    OrderSide::Sell => price <= candle.close || price <= candle.high,
                };
                if !fills {
                    continue;
                }

                let order = state.orders.remove(index);
                let (_, events) =
                    Self::complete_order(&mut state, order, price, candle.timestamp);
                let released = state.symbol_order_count(&symbol) == 0;
                (events, released)
            };

            self.dispatch_events(events).await;
            if released {
                self.release_matching(&symbol).await;
            }
        }

        Ok(())
    }

    async fn subscribe_matching(&self, symbol: &str, base_timeframe: Timeframe) {
        let listener: Arc<dyn CandleListener> = self.self_arc();
        match self.feed.subscribe(symbol, base_timeframe, listener).await {
            Ok(id) => {
                self.state
                    .lock()
                    .await
                    .feed_subscriptions
                    .insert(symbol.to_string(), id);
                debug!(symbol, %base_timeframe, "matching subscription acquired");
            }
            Err(error) => warn!(symbol, %error, "failed to subscribe exchange matching"),
        }
    }

    async fn release_matching(&self, symbol: &str) {
        let entry = {
            let mut state = self.state.lock().await;
            let base_timeframe = state.base_timeframe;
            state
                .feed_subscriptions
                .remove(symbol)
                .map(|id| (base_timeframe, id))
        };

        if let Some((base_timeframe, id)) = entry {
            self.feed.unsubscribe(symbol, base_timeframe, id).await;
            debug!(symbol, "matching subscription released");
        }
    }

    async fn dispatch_events(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Order(order) => self.dispatcher.dispatch_order(&order).await,
                Event::Trade(trade) => self.dispatcher.dispatch_trade(&trade).await,
                Event::Position(position) => self.dispatcher.dispatch_position(&position).await,
            }
        }
    }
}

#[async_trait]
impl CandleListener for Exchange {
    async fn on_candle(&self, candle: &Candle) -> ListenerResult {
        self.handle_candle(candle).await.map_err(Into::into)
    }
}
