use std::collections::BTreeMap;

use crate::backtest::BacktestResults;

/// Metric key flagging which Sharpe estimator produced `sharpe_ratio`:
/// 1.0 = simplified surrogate, 0.0 = balance-trajectory based.
pub const SHARPE_SIMPLIFIED_FLAG: &str = "sharpe_estimator_simplified";

const TRADING_PERIODS_PER_YEAR: f64 = 252.0;

/// Annualized Sharpe ratio with a zero risk-free rate.
///
/// With a balance trajectory, computes mean/std over period returns and
/// annualizes at 252 periods per year. Without one, falls back to a
/// deterministic surrogate: annualize the total return to 365 days and
/// assume volatility at 25% of the return magnitude (40% for losses) with
/// a floor of 1.0. The surrogate exists only to give KPI gating a stable,
/// monotone input.
pub fn sharpe_ratio(
    return_percentage: f64,
    duration_seconds: f64,
    balance_history: Option<&[(i64, f64)]>,
) -> f64 {
    if duration_seconds <= 0.0 {
        return 0.0;
    }

    let duration_days = duration_seconds / 86_400.0;

    let Some(history) = balance_history.filter(|h| h.len() > 1) else {
        return simplified_sharpe(return_percentage, duration_days);
    };

    let mut returns = Vec::with_capacity(history.len() - 1);
    for window in history.windows(2) {
        let prev = window[0].1;
        let curr = window[1].1;
        if prev > 0.0 {
            returns.push((curr - prev) / prev);
        }
    }

    if returns.len() < 2 {
        return simplified_sharpe(return_percentage, duration_days);
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return 0.0;
    }

    let periods_per_day = returns.len() as f64 / duration_days;
    let scale = TRADING_PERIODS_PER_YEAR / periods_per_day;
    let annualized_mean = mean * scale;
    let annualized_std = std_dev * scale.sqrt();

    round2(annualized_mean / annualized_std)
}

fn simplified_sharpe(return_percentage: f64, duration_days: f64) -> f64 {
    if duration_days <= 0.0 || return_percentage == 0.0 {
        return 0.0;
    }

    let annualized_return = if duration_days >= 365.0 {
        return_percentage
    } else {
        return_percentage * (365.0 / duration_days)
    };

    let volatility_fraction = if return_percentage > 0.0 { 0.25 } else { 0.4 };
    let estimated_volatility = (annualized_return.abs() * volatility_fraction).max(1.0);

    round2(annualized_return / estimated_volatility)
}

/// Calmar ratio: `|return| / |max_drawdown|`, zero when drawdown is zero.
pub fn calmar_ratio(return_percentage: f64, max_drawdown: f64) -> f64 {
    if max_drawdown == 0.0 {
        return 0.0;
    }
    round2(return_percentage.abs() / max_drawdown.abs())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Flattens a result set into the metric map consumed by the evaluator and
/// the optimizer prompt.
pub fn extract_metrics(results: &BacktestResults, calculate_advanced: bool) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    metrics.insert(
        "return_percentage".to_string(),
        results.return_percentage,
    );
    metrics.insert("max_drawdown".to_string(), results.max_drawdown);
    metrics.insert("profit_factor".to_string(), results.profit_factor);
    metrics.insert("win_rate".to_string(), results.win_rate);
    metrics.insert("total_trades".to_string(), results.total_trades as f64);
    metrics.insert("cycle_win_rate".to_string(), results.cycle_win_rate);

    if calculate_advanced {
        // No balance trajectory survives into the result set, so this is
        // always the simplified estimator for now.
        let sharpe = sharpe_ratio(results.return_percentage, results.duration_seconds, None);
        metrics.insert("sharpe_ratio".to_string(), sharpe);
        metrics.insert(SHARPE_SIMPLIFIED_FLAG.to_string(), 1.0);

        metrics.insert(
            "calmar_ratio".to_string(),
            calmar_ratio(results.return_percentage, results.max_drawdown),
        );
    }

    metrics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplified_sharpe_is_monotone_and_bounded() {
        // A positive return annualizes against 25% of its own magnitude,
        // capping the surrogate at 4.0 for large returns.
        let one_month = 30.0 * 86_400.0;
        let strong = sharpe_ratio(20.0, one_month, None);
        let weak = sharpe_ratio(0.5, one_month, None);
        assert!(strong >= weak);
        assert!(strong <= 4.0);

        // Losses use the wider 40% proxy and stay negative.
        let losing = sharpe_ratio(-10.0, one_month, None);
        assert!(losing < 0.0);

        assert_eq!(sharpe_ratio(0.0, one_month, None), 0.0);
        assert_eq!(sharpe_ratio(10.0, 0.0, None), 0.0);
    }

    #[test]
    fn trajectory_sharpe_prefers_steady_growth() {
        let days = 10usize;
        let duration = days as f64 * 86_400.0;

        let mut steady = vec![(0i64, 1000.0f64)];
        let mut choppy = vec![(0i64, 1000.0f64)];
        for i in 1..=days {
            let steady_growth = if i % 2 == 0 { 1.009 } else { 1.011 };
            let choppy_growth = if i % 2 == 0 { 0.95 } else { 1.07 };
            steady.push((i as i64, steady.last().unwrap().1 * steady_growth));
            choppy.push((i as i64, choppy.last().unwrap().1 * choppy_growth));
        }

        let steady_sharpe = sharpe_ratio(10.0, duration, Some(&steady));
        let choppy_sharpe = sharpe_ratio(10.0, duration, Some(&choppy));
        assert!(steady_sharpe > choppy_sharpe);
    }

    #[test]
    fn calmar_ratio_handles_zero_drawdown() {
        assert_eq!(calmar_ratio(10.0, 0.0), 0.0);
        assert_eq!(calmar_ratio(10.0, 5.0), 2.0);
        assert_eq!(calmar_ratio(-10.0, 5.0), 2.0);
    }
}
