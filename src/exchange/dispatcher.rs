use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::warn;

use crate::market::ListenerResult;

use super::models::{Order, Position, Trade};

#[async_trait]
pub trait OrderListener: Send + Sync {
    async fn on_order(&self, order: &Order) -> ListenerResult;
}

#[async_trait]
pub trait TradeListener: Send + Sync {
    async fn on_trade(&self, trade: &Trade) -> ListenerResult;
}

#[async_trait]
pub trait PositionListener: Send + Sync {
    async fn on_position(&self, position: &Position) -> ListenerResult;
}

/// Fan-out of exchange events to registered listeners. A listener that
/// fails is logged and skipped so its siblings still run. Registration
/// lists are guarded by a plain mutex that is never held across a
/// listener call.
#[derive(Default)]
pub struct EventDispatcher {
    orders: Mutex<Vec<Arc<dyn OrderListener>>>,
    trades: Mutex<Vec<Arc<dyn TradeListener>>>,
    positions: Mutex<Vec<Arc<dyn PositionListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_order_listener(&self, listener: Arc<dyn OrderListener>) {
        self.orders
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .push(listener);
    }

    pub fn remove_order_listener(&self, listener: &Arc<dyn OrderListener>) {
        self.orders
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_trade_listener(&self, listener: Arc<dyn TradeListener>) {
        self.trades
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .push(listener);
    }

    pub fn remove_trade_listener(&self, listener: &Arc<dyn TradeListener>) {
        self.trades
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn add_position_listener(&self, listener: Arc<dyn PositionListener>) {
        self.positions
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .push(listener);
    }

    pub fn remove_position_listener(&self, listener: &Arc<dyn PositionListener>) {
        self.positions
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub async fn dispatch_order(&self, order: &Order) {
        let listeners = self
            .orders
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .clone();
        for listener in listeners {
            if let Err(error) = listener.on_order(order).await {
                warn!(order_id = %order.order_id, %error, "order listener failed");
            }
        }
    }

    pub async fn dispatch_trade(&self, trade: &Trade) {
        let listeners = self
            .trades
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .clone();
        for listener in listeners {
            if let Err(error) = listener.on_trade(trade).await {
                warn!(order_id = %trade.order_id, %error, "trade listener failed");
            }
        }
    }

    pub async fn dispatch_position(&self, position: &Position) {
        let listeners = self
            .positions
            .lock()
            .expect("dispatcher mutex can't be poisoned")
            .clone();
        for listener in listeners {
            if let Err(error) = listener.on_position(position).await {
                warn!(symbol = %position.symbol, %error, "position listener failed");
            }
        }
    }
}
