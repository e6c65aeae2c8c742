//! Trade-sequence resampling. Each iteration reshuffles the trade list with
//! its own seeded PRNG, so results are bitwise reproducible for a given base
//! seed no matter how the iterations are scheduled across threads.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use statrs::statistics::Statistics;
use thiserror::Error;

use crate::domain::metrics::level_key;
use crate::domain::{MonteCarloResult, TradeMetrics};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonteCarloError {
    #[error("no trades provided for simulation")]
    NoTrades,
    #[error("iteration count must be positive")]
    NoIterations,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconstructionError {
    #[error("no trades in summary")]
    NoTrades,
    /// `|gross_loss| = profit / (pf - 1)` is undefined at pf == 1.
    #[error("profit factor of exactly 1.0 cannot be decomposed into win/loss sizes")]
    DegenerateProfitFactor,
    #[error("summary metrics insufficient to reconstruct trades")]
    Unsolvable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonteCarloParams {
    pub iterations: usize,
    pub initial_balance: f64,
    /// Drawdown fraction of peak that counts as ruin.
    pub ruin_threshold: f64,
    pub confidence_levels: Vec<f64>,
    pub seed: u64,
}

impl Default for MonteCarloParams {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            initial_balance: 10_000.0,
            ruin_threshold: 0.5,
            confidence_levels: vec![0.05, 0.10, 0.25, 0.50, 0.75, 0.90, 0.95],
            seed: 0,
        }
    }
}

struct IterationOutcome {
    final_profit: f64,
    max_drawdown_pct: f64,
    ruined: bool,
}

/// One shuffled walk. Ruin flags the session but never stops the walk, so the
/// final profit always reflects the whole sequence.
fn simulate_once(trades: &[f64], params: &MonteCarloParams, iteration: u64) -> IterationOutcome {
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed.wrapping_add(iteration));
    let mut shuffled = trades.to_vec();
    shuffled.shuffle(&mut rng);

    let mut balance = params.initial_balance;
    let mut peak = params.initial_balance;
    let mut max_dd = 0.0_f64;
    let mut ruined = false;

    for trade in shuffled {
        balance += trade;
        if balance > peak {
            peak = balance;
        }
        let dd = if peak > 0.0 { (peak - balance) / peak } else { 0.0 };
        if dd > max_dd {
            max_dd = dd;
        }
        if dd >= params.ruin_threshold {
            ruined = true;
        }
    }

    IterationOutcome {
        final_profit: balance - params.initial_balance,
        max_drawdown_pct: max_dd * 100.0,
        ruined,
    }
}

/// Empirical percentile over an ascending-sorted sample: index = floor(level*n),
/// clamped into range.
fn percentile(sorted: &[f64], level: f64) -> f64 {
    let n = sorted.len();
    let idx = ((level * n as f64) as usize).min(n - 1);
    sorted[idx]
}

pub fn run_monte_carlo(
    trades: &[f64],
    params: &MonteCarloParams,
) -> Result<MonteCarloResult, MonteCarloError> {
    if trades.is_empty() {
        return Err(MonteCarloError::NoTrades);
    }
    if params.iterations == 0 {
        return Err(MonteCarloError::NoIterations);
    }

    let outcomes: Vec<IterationOutcome> = (0..params.iterations as u64)
        .into_par_iter()
        .map(|i| simulate_once(trades, params, i))
        .collect();

    let mut final_profits: Vec<f64> = outcomes.iter().map(|o| o.final_profit).collect();
    let mut max_drawdowns: Vec<f64> = outcomes.iter().map(|o| o.max_drawdown_pct).collect();
    let ruin_count = outcomes.iter().filter(|o| o.ruined).count();
    let profitable_count = final_profits.iter().filter(|p| **p > 0.0).count();

    // Deterministic post-sort; percentiles are index-based on these
    final_profits.sort_by(f64::total_cmp);
    max_drawdowns.sort_by(f64::total_cmp);

    let n = final_profits.len();
    let iterations = params.iterations;

    let mut percentiles = BTreeMap::new();
    let mut dd_percentiles = BTreeMap::new();
    for level in &params.confidence_levels {
        percentiles.insert(level_key(*level), round2(percentile(&final_profits, *level)));
        dd_percentiles.insert(level_key(*level), round2(percentile(&max_drawdowns, *level)));
    }

    let expected_profit = final_profits.iter().sum::<f64>() / n as f64;

    Ok(MonteCarloResult {
        iterations,
        confidence_pct: round2(profitable_count as f64 / iterations as f64 * 100.0),
        ruin_probability_pct: round2(ruin_count as f64 / iterations as f64 * 100.0),
        expected_profit: round2(expected_profit),
        median_profit: round2(final_profits[n / 2]),
        worst_case_p5: round2(percentile(&final_profits, 0.05)),
        best_case_p95: round2(percentile(&final_profits, 0.95)),
        max_drawdown_median: round2(max_drawdowns[n / 2]),
        max_drawdown_worst_p95: round2(percentile(&max_drawdowns, 0.95)),
        percentiles,
        dd_percentiles,
    })
}

/// Rebuild an approximate per-trade profit list from summary metrics, for
/// reports where the deal table is unavailable.
///
/// Prefers explicit gross figures. Otherwise solves
/// `|gross_loss| = profit / (pf - 1)` for `pf > 1, profit > 0`; a profit
/// factor of exactly 1.0 is refused rather than guessed around.
pub fn reconstruct_trades(metrics: &TradeMetrics) -> Result<Vec<f64>, ReconstructionError> {
    if metrics.total_trades == 0 {
        return Err(ReconstructionError::NoTrades);
    }

    let total = metrics.total_trades;
    let win_rate = (metrics.win_rate / 100.0).clamp(0.0, 1.0);
    let winning = ((total as f64) * win_rate).round() as u64;
    let losing = total - winning.min(total);

    let (gross_profit, gross_loss) = if metrics.gross_profit != 0.0 || metrics.gross_loss != 0.0 {
        (metrics.gross_profit, metrics.gross_loss.abs())
    } else {
        let pf = metrics.profit_factor;
        if (pf - 1.0).abs() < 1e-9 {
            return Err(ReconstructionError::DegenerateProfitFactor);
        }
        if pf > 1.0 && metrics.profit > 0.0 {
            let gross_loss = metrics.profit / (pf - 1.0);
            (metrics.profit + gross_loss, gross_loss)
        } else {
            return Err(ReconstructionError::Unsolvable);
        }
    };

    let avg_win = if winning > 0 { gross_profit / winning as f64 } else { 0.0 };
    let avg_loss = if losing > 0 { -(gross_loss / losing as f64) } else { 0.0 };

    let mut trades = Vec::with_capacity(total as usize);
    trades.extend(std::iter::repeat(avg_win).take(winning.min(total) as usize));
    trades.extend(std::iter::repeat(avg_loss).take(losing as usize));
    Ok(trades)
}

/// Risk-adjusted metrics computed from a trade list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskMetrics {
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    /// `net_profit / max_drawdown_absolute`.
    pub recovery_factor: f64,
    pub total_return_pct: f64,
    pub annual_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub volatility_pct: f64,
}

/// Sharpe/Sortino/Calmar/recovery from per-trade profits, annualized assuming
/// one trade per period with `periods_per_year` periods.
pub fn risk_metrics(
    trades: &[f64],
    initial_balance: f64,
    risk_free_rate: f64,
    periods_per_year: u32,
) -> Option<RiskMetrics> {
    if trades.is_empty() || initial_balance <= 0.0 {
        return None;
    }

    let mut equity = Vec::with_capacity(trades.len() + 1);
    equity.push(initial_balance);
    for trade in trades {
        equity.push(equity.last().copied().unwrap_or(initial_balance) + trade);
    }

    let mut returns = Vec::with_capacity(trades.len());
    for pair in equity.windows(2) {
        if pair[0] != 0.0 {
            returns.push((pair[1] - pair[0]) / pair[0]);
        }
    }
    if returns.is_empty() {
        return None;
    }

    let annualization = f64::from(periods_per_year).sqrt();
    let mean_return = returns.as_slice().mean();
    let std_return = returns.as_slice().std_dev();
    let annual_return = mean_return * f64::from(periods_per_year);
    let annual_std = std_return * annualization;

    // Downside deviation over all periods, not just the losing ones
    let n = returns.len() as f64;
    let downside_var = returns.iter().filter(|r| **r < 0.0).map(|r| r * r).sum::<f64>() / n;
    let annual_downside_std = downside_var.sqrt() * annualization;

    let mut peak = equity[0];
    let mut max_dd = 0.0_f64;
    let mut max_dd_abs = 0.0_f64;
    for value in &equity {
        if *value > peak {
            peak = *value;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
        let dd_abs = peak - value;
        if dd_abs > max_dd_abs {
            max_dd_abs = dd_abs;
        }
    }

    let net_profit = equity.last().copied().unwrap_or(initial_balance) - initial_balance;
    let total_return = net_profit / initial_balance;

    let sharpe = if annual_std > 0.0 {
        (annual_return - risk_free_rate) / annual_std
    } else {
        0.0
    };
    let sortino = if annual_downside_std > 0.0 {
        (annual_return - risk_free_rate) / annual_downside_std
    } else {
        0.0
    };
    let calmar = if max_dd > 0.0 { annual_return / max_dd } else { 0.0 };
    let recovery_factor = if max_dd_abs > 0.0 { net_profit / max_dd_abs } else { 0.0 };

    Some(RiskMetrics {
        sharpe: round3(sharpe),
        sortino: round3(sortino),
        calmar: round3(calmar),
        recovery_factor: round3(recovery_factor),
        total_return_pct: round2(total_return * 100.0),
        annual_return_pct: round2(annual_return * 100.0),
        max_drawdown_pct: round2(max_dd * 100.0),
        volatility_pct: round2(annual_std * 100.0),
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(iterations: usize, seed: u64) -> MonteCarloParams {
        MonteCarloParams {
            iterations,
            seed,
            ..MonteCarloParams::default()
        }
    }

    #[test]
    fn same_seed_is_bitwise_identical() {
        let trades: Vec<f64> = (0..40).map(|i| if i % 3 == 0 { -80.0 } else { 60.0 }).collect();
        let a = run_monte_carlo(&trades, &params(500, 42)).unwrap();
        let b = run_monte_carlo(&trades, &params(500, 42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_seeds_differ() {
        let trades: Vec<f64> = (0..40).map(|i| if i % 3 == 0 { -80.0 } else { 60.0 }).collect();
        let a = run_monte_carlo(&trades, &params(500, 1)).unwrap();
        let b = run_monte_carlo(&trades, &params(500, 2)).unwrap();
        // Aggregate stats can coincide, but full percentile maps should not
        assert!(a != b || a.percentiles != b.percentiles);
    }

    #[test]
    fn all_losing_trades_ruin() {
        // 50 x -200 on a 10k account loses everything; ruin is certain
        let trades = vec![-200.0; 50];
        let result = run_monte_carlo(&trades, &params(1000, 7)).unwrap();
        assert!(result.ruin_probability_pct > 50.0);
        assert!(result.confidence_pct < 10.0);
        assert!((result.expected_profit - -10_000.0).abs() < 1e-6);
    }

    #[test]
    fn all_winning_trades_do_not_ruin() {
        let trades = vec![50.0; 50];
        let result = run_monte_carlo(&trades, &params(1000, 7)).unwrap();
        assert!(result.ruin_probability_pct < 10.0);
        assert!(result.confidence_pct > 90.0);
        assert!((result.expected_profit - 2500.0).abs() < 1e-6);
        assert!((result.max_drawdown_median - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ruin_does_not_stop_the_walk() {
        // A crash followed by a full recovery: ruined, but profitable
        let mut trades = vec![-6000.0];
        trades.extend(vec![500.0; 20]);
        let result = run_monte_carlo(&trades, &params(200, 3)).unwrap();
        assert!(result.ruin_probability_pct > 0.0);
        // Final profit computed from the whole sequence: -6000 + 10000
        assert!((result.median_profit - 4000.0).abs() < 1e-6);
    }

    #[test]
    fn percentile_maps_cover_requested_levels() {
        let trades = vec![10.0, -5.0, 20.0, -15.0, 30.0];
        let result = run_monte_carlo(&trades, &params(100, 1)).unwrap();
        assert_eq!(result.percentiles.len(), 7);
        assert!(result.percentiles.contains_key("0.05"));
        assert!(result.dd_percentiles.contains_key("0.95"));
        // Percentiles are non-decreasing across levels
        let p5 = result.percentiles["0.05"];
        let p95 = result.percentiles["0.95"];
        assert!(p5 <= p95);
    }

    #[test]
    fn empty_trades_rejected() {
        assert_eq!(
            run_monte_carlo(&[], &params(100, 1)),
            Err(MonteCarloError::NoTrades)
        );
    }

    #[test]
    fn reconstruct_from_gross_figures() {
        let metrics = TradeMetrics {
            total_trades: 10,
            win_rate: 60.0,
            gross_profit: 600.0,
            gross_loss: 200.0,
            ..TradeMetrics::default()
        };
        let trades = reconstruct_trades(&metrics).unwrap();
        assert_eq!(trades.len(), 10);
        let wins = trades.iter().filter(|t| **t > 0.0).count();
        assert_eq!(wins, 6);
        assert!((trades.iter().sum::<f64>() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn reconstruct_from_profit_factor() {
        // profit 500, pf 2.0 -> gross_loss 500, gross_profit 1000
        let metrics = TradeMetrics {
            total_trades: 100,
            win_rate: 50.0,
            profit: 500.0,
            profit_factor: 2.0,
            ..TradeMetrics::default()
        };
        let trades = reconstruct_trades(&metrics).unwrap();
        assert_eq!(trades.len(), 100);
        assert!((trades.iter().sum::<f64>() - 500.0).abs() < 1e-9);
        assert!((trades.iter().filter(|t| **t > 0.0).sum::<f64>() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_of_one_is_refused() {
        let metrics = TradeMetrics {
            total_trades: 100,
            win_rate: 50.0,
            profit: 0.0,
            profit_factor: 1.0,
            ..TradeMetrics::default()
        };
        assert_eq!(
            reconstruct_trades(&metrics),
            Err(ReconstructionError::DegenerateProfitFactor)
        );
    }

    #[test]
    fn risk_metrics_recovery_uses_absolute_drawdown() {
        // 10k -> 11k -> 10.5k -> 12k: max abs DD 500, net profit 2000
        let trades = vec![1000.0, -500.0, 1500.0];
        let risk = risk_metrics(&trades, 10_000.0, 0.0, 252).unwrap();
        assert!((risk.recovery_factor - 4.0).abs() < 1e-9);
        assert!(risk.max_drawdown_pct > 0.0);
        assert!(risk.sharpe > 0.0);
    }

    #[test]
    fn risk_metrics_empty_is_none() {
        assert!(risk_metrics(&[], 10_000.0, 0.0, 252).is_none());
    }
}
