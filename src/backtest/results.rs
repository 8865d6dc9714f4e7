use rust_decimal::{Decimal, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};

use crate::{exchange::Trade, shared::Millis, strategy::Cycle};

use super::config::BacktestConfig;

/// Final metric set of one backtest pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResults {
    pub run_id: String,
    pub symbol: String,
    pub strategy_name: String,
    pub start_time: Millis,
    pub end_time: Millis,
    pub duration_seconds: f64,
    pub total_candles_processed: u64,

    pub final_balance: Decimal,
    pub total_return: Decimal,
    pub return_percentage: f64,
    pub max_drawdown: f64,

    pub total_trades: u64,
    pub win_rate: f64,
    pub profit_factor: f64,

    pub total_closed_positions: u64,
    pub winning_positions: u64,
    pub losing_positions: u64,

    pub average_trade_size: Decimal,
    pub total_commission: Decimal,
    pub commission_percentage: f64,

    pub total_closing_trades: u64,
    pub partial_closing_trades: u64,
    pub full_closing_trades: u64,
    pub winning_closing_trades: u64,
    pub losing_closing_trades: u64,
    pub partial_winning_trades: u64,
    pub partial_losing_trades: u64,
    pub full_winning_trades: u64,
    pub full_losing_trades: u64,

    pub total_cycles: u64,
    pub avg_cycle_duration: f64,
    pub avg_cycle_pnl: f64,
    pub winning_cycles: u64,
    pub losing_cycles: u64,
    pub cycle_win_rate: f64,
}

impl BacktestResults {
    /// Derives the full metric set from the recorded trades and cycles.
    ///
    /// A position close is a trade with non-zero realized P&L; win rate
    /// counts fully-closing trades only. `max_unrealized_pnl_loss` is the
    /// most negative unrealized P&L observed during the run.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        config: &BacktestConfig,
        end_time: Millis,
        duration_seconds: f64,
        total_candles_processed: u64,
        final_balance: Decimal,
        trades: &[Trade],
        cycles: &[Cycle],
        max_unrealized_pnl_loss: Decimal,
    ) -> Self {
        let initial_balance = config.initial_balance;
        let total_return = final_balance - initial_balance;
        let return_percentage = (total_return / initial_balance)
            .to_f64()
            .unwrap_or(0.0)
            * 100.0;

        let closing: Vec<&Trade> = trades
            .iter()
            .filter(|t| !t.realized_pnl.is_zero())
            .collect();
        let full_closes: Vec<&Trade> = closing
            .iter()
            .copied()
            .filter(|t| t.closes_completely)
            .collect();
        let partial_closes: Vec<&Trade> = closing
            .iter()
            .copied()
            .filter(|t| !t.closes_completely)
            .collect();

        let winning: Vec<&Trade> = full_closes
            .iter()
            .copied()
            .filter(|t| t.realized_pnl > Decimal::ZERO)
            .collect();
        let losing: Vec<&Trade> = full_closes
            .iter()
            .copied()
            .filter(|t| t.realized_pnl < Decimal::ZERO)
            .collect();

        let total_closed = full_closes.len() as u64;
        let win_rate = if total_closed > 0 {
            winning.len() as f64 / total_closed as f64 * 100.0
        } else {
            0.0
        };

        let gross_profit: Decimal = winning.iter().map(|t| t.realized_pnl).sum();
        let gross_loss: Decimal = losing
            .iter()
            .map(|t| t.realized_pnl)
            .sum::<Decimal>()
            .abs();
        let profit_factor = if gross_loss > Decimal::ZERO {
            (gross_profit / gross_loss).to_f64().unwrap_or(0.0)
        } else if gross_profit > Decimal::ZERO {
            f64::INFINITY
        } else {
            0.0
        };

        let max_drawdown = if max_unrealized_pnl_loss < Decimal::ZERO
            && final_balance > Decimal::ZERO
        {
            (max_unrealized_pnl_loss.abs() / final_balance)
                .to_f64()
                .unwrap_or(0.0)
                * 100.0
        } else {
            0.0
        };

        let total_trade_value: Decimal =
            trades.iter().map(|t| (t.quantity * t.price).abs()).sum();
        let average_trade_size = if trades.is_empty() {
            Decimal::ZERO
        } else {
            total_trade_value / Decimal::from(trades.len())
        };

        let total_commission: Decimal = trades.iter().map(|t| t.commission.abs()).sum();
        let commission_percentage = if total_return.is_zero() {
            0.0
        } else {
            (total_commission / total_return.abs())
                .to_f64()
                .unwrap_or(0.0)
                * 100.0
        };

        let total_cycles = cycles.len() as u64;
        let winning_cycles = cycles
            .iter()
            .filter(|c| c.total_pnl > Decimal::ZERO)
            .count() as u64;
        let (avg_cycle_duration, avg_cycle_pnl, cycle_win_rate) = if total_cycles > 0 {
            let avg_duration = cycles.iter().map(Cycle::duration_minutes).sum::<f64>()
                / total_cycles as f64;
            let avg_pnl = cycles
                .iter()
                .map(|c| c.total_pnl.to_f64().unwrap_or(0.0))
                .sum::<f64>()
                / total_cycles as f64;
            let win_rate = winning_cycles as f64 / total_cycles as f64 * 100.0;
            (avg_duration, avg_pnl, win_rate)
        } else {
            (0.0, 0.0, 0.0)
        };

        let count_partial = |winner: bool| {
            partial_closes
                .iter()
                .filter(|t| (t.realized_pnl > Decimal::ZERO) == winner)
                .count() as u64
        };
        let count_full = |winner: bool| {
            full_closes
                .iter()
                .filter(|t| (t.realized_pnl > Decimal::ZERO) == winner)
                .count() as u64
        };

        Self {
            run_id: config.run_id.clone(),
            symbol: config.symbol.clone(),
            strategy_name: config.strategy_name.clone(),
            start_time: config.start_time,
            end_time,
            duration_seconds,
            total_candles_processed,
            final_balance,
            total_return,
            return_percentage,
            max_drawdown,
            total_trades: trades.len() as u64,
            win_rate,
            profit_factor,
            total_closed_positions: total_closed,
            winning_positions: winning.len() as u64,
            losing_positions: losing.len() as u64,
            average_trade_size,
            total_commission,
            commission_percentage,
            total_closing_trades: closing.len() as u64,
            partial_closing_trades: partial_closes.len() as u64,
            full_closing_trades: full_closes.len() as u64,
            winning_closing_trades: winning.len() as u64,
            losing_closing_trades: losing.len() as u64,
            partial_winning_trades: count_partial(true),
            partial_losing_trades: count_partial(false),
            full_winning_trades: count_full(true),
            full_losing_trades: count_full(false),
            total_cycles,
            avg_cycle_duration,
            avg_cycle_pnl,
            winning_cycles,
            losing_cycles: total_cycles - winning_cycles,
            cycle_win_rate,
        }
    }

    /// Post-hoc consistency audit. Returns human-readable warnings; never
    /// fails the backtest.
    pub fn audit(&self, config: &BacktestConfig, trades: &[Trade]) -> Vec<String> {
        let mut warnings = Vec::new();
        let tolerance = Decimal::new(1, 2); // 0.01

        let implied_initial = self.final_balance - self.total_return;
        if (implied_initial - config.initial_balance).abs() > tolerance {
            warnings.push(format!(
                "Balance inconsistency: implied initial {implied_initial} != configured {}",
                config.initial_balance
            ));
        }

        // Opening commissions hit the balance but are not part of any
        // realized P&L, so the realized sum runs ahead of the return by
        // exactly that amount.
        let sum_realized: Decimal = trades.iter().map(|t| t.realized_pnl).sum();
        let opening_commissions: Decimal = trades
            .iter()
            .filter(|t| t.realized_pnl.is_zero())
            .map(|t| t.commission.abs())
            .sum();
        let expected = self.total_return + opening_commissions;
        if (sum_realized - expected).abs() > tolerance {
            warnings.push(format!(
                "P&L inconsistency: sum of realized_pnl {sum_realized} != \
                 total_return {} + opening_commissions {opening_commissions}",
                self.total_return
            ));
        }

        let expected_win_rate = if self.total_closed_positions > 0 {
            self.winning_positions as f64 / self.total_closed_positions as f64 * 100.0
        } else {
            0.0
        };
        if (expected_win_rate - self.win_rate).abs() > 0.01 {
            warnings.push(format!(
                "Win rate inconsistency: {expected_win_rate}% != {}%",
                self.win_rate
            ));
        }

        if self.profit_factor > 1.0 && self.total_return <= Decimal::ZERO {
            warnings.push("Profit factor > 1 but return is negative".to_string());
        }
        if self.profit_factor < 1.0 && self.total_return > Decimal::ZERO {
            warnings.push("Profit factor < 1 but return is positive".to_string());
        }

        warnings
    }
}
