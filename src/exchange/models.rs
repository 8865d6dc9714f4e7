use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::shared::Millis;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OrderStatus {
    New,
    Filled,
    Canceled,
}

/// Whether a `(position_side, side)` pair opens the position (adds
/// exposure) rather than reducing it.
pub fn opens_position(position_side: PositionSide, side: OrderSide) -> bool {
    matches!(
        (position_side, side),
        (PositionSide::Long, OrderSide::Buy) | (PositionSide::Short, OrderSide::Sell)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub position_side: PositionSide,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Preset for limit orders; populated at execution time for market
    /// orders.
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub order_id: String,
    pub timestamp: Millis,
    pub symbol: String,
    pub position_side: PositionSide,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub realized_pnl: Decimal,
    pub closes_completely: bool,
}

/// One side of the hedged position pair. `amount` is signed: long >= 0,
/// short <= 0. When flat, entry price and break-even are zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub break_even: Decimal,
    pub commission: Decimal,
    pub trades: Vec<Trade>,
}

impl Position {
    pub fn flat(symbol: impl Into<String>, side: PositionSide) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            amount: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            break_even: Decimal::ZERO,
            commission: Decimal::ZERO,
            trades: Vec::new(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.amount.is_zero()
    }

    /// Appends a trade, accumulating commissions with the opening direction
    /// positive and the closing direction negative.
    pub fn add_trade(&mut self, trade: Trade) {
        let commission = trade.commission.abs();
        if opens_position(self.side, trade.side) {
            self.commission += commission;
        } else {
            self.commission -= commission;
        }
        self.trades.push(trade);
        self.trades.sort_by_key(|t| t.timestamp);
    }

    /// Structural sizing depth: how many halvings of `|amount|` stay at or
    /// above the smallest per-trade quantity seen in the position (or the
    /// supplied floor).
    pub fn load_count(&self, min_load_amount: Option<Decimal>) -> u32 {
        if self.trades.is_empty() {
            return 0;
        }

        let min_load = min_load_amount.unwrap_or_else(|| {
            self.trades
                .iter()
                .map(|t| t.quantity.abs())
                .min()
                .unwrap_or(Decimal::ZERO)
        });

        if min_load <= Decimal::ZERO {
            return 0;
        }

        let mut count = 0;
        let mut amount = self.amount.abs();
        while amount >= min_load {
            count += 1;
            amount /= Decimal::TWO;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rust_decimal_macros::dec;

    fn trade(quantity: Decimal, side: OrderSide) -> Trade {
        Trade {
            order_id: "o".to_string(),
            timestamp: 0,
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            side,
            price: dec!(100),
            quantity,
            commission: dec!(0.1),
            realized_pnl: Decimal::ZERO,
            closes_completely: false,
        }
    }

    #[test]
    fn load_count_halves_down_to_min_quantity() {
        let mut position = Position::flat("BTCUSDT", PositionSide::Long);
        position.add_trade(trade(dec!(0.1), OrderSide::Buy));
        position.amount = dec!(0.1);
        assert_eq!(position.load_count(None), 1);

        // Doubling the amount adds one load per halving step.
        position.amount = dec!(0.4);
        assert_eq!(position.load_count(None), 3);

        // Explicit floor takes precedence over the observed minimum.
        assert_eq!(position.load_count(Some(dec!(0.4))), 1);
        assert_eq!(position.load_count(Some(dec!(0.8))), 0);
    }

    #[test]
    fn load_count_is_zero_without_trades() {
        let position = Position::flat("BTCUSDT", PositionSide::Long);
        assert_eq!(position.load_count(None), 0);
    }

    #[test]
    fn commission_accumulates_by_direction() {
        let mut position = Position::flat("BTCUSDT", PositionSide::Long);
        position.add_trade(trade(dec!(0.1), OrderSide::Buy));
        assert_eq!(position.commission, dec!(0.1));
        position.add_trade(trade(dec!(0.05), OrderSide::Sell));
        assert_eq!(position.commission, dec!(0.0));
    }
}
