//! The composite "Go-Live Score": one weighted 0-10 aggregation shared by
//! pipeline gates, pass selection, dashboards, and the leaderboard. There is
//! deliberately a single weight table in the whole crate.

use crate::domain::{PassRecord, TradeMetrics};

// Subscore weights
pub const WEIGHT_CONSISTENCY: f64 = 0.25;
pub const WEIGHT_TOTAL_PROFIT: f64 = 0.25;
pub const WEIGHT_TRADE_COUNT: f64 = 0.20;
pub const WEIGHT_PROFIT_FACTOR: f64 = 0.15;
pub const WEIGHT_MAX_DRAWDOWN: f64 = 0.15;

// Normalization ranges (value span that maps onto 0..1)
pub const RANGE_TOTAL_PROFIT: (f64, f64) = (0.0, 5000.0);
pub const RANGE_TRADE_COUNT: (f64, f64) = (50.0, 200.0);
pub const RANGE_PROFIT_FACTOR: (f64, f64) = (1.0, 3.0);
pub const RANGE_MAX_DRAWDOWN: (f64, f64) = (0.0, 30.0);
pub const RANGE_CONSISTENCY_MIN: (f64, f64) = (0.0, 2000.0);

/// Bonus added to a per-pass score when both segments are profitable.
pub const CONSISTENCY_BONUS: f64 = 0.5;

/// Clamp-normalize `value` into 0..1 over `[lo, hi]`, optionally inverted.
/// Degenerate ranges (`hi <= lo`) normalize to 0.
pub fn normalize(value: f64, lo: f64, hi: f64, invert: bool) -> f64 {
    if hi <= lo {
        return 0.0;
    }
    let clamped = value.clamp(lo, hi);
    let normalized = (clamped - lo) / (hi - lo);
    if invert {
        1.0 - normalized
    } else {
        normalized
    }
}

/// Inputs to the composite score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInput {
    pub profit: f64,
    pub total_trades: u64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    /// In-sample segment profit (criterion units).
    pub back_result: f64,
    /// Out-of-sample segment profit.
    pub forward_result: f64,
}

impl ScoreInput {
    pub fn from_metrics(metrics: &TradeMetrics, back_result: f64, forward_result: f64) -> Self {
        Self {
            profit: metrics.profit,
            total_trades: metrics.total_trades,
            profit_factor: metrics.profit_factor,
            max_drawdown_pct: metrics.max_drawdown_pct,
            back_result,
            forward_result,
        }
    }

    pub fn from_pass(pass: &PassRecord) -> Self {
        let (back, forward) = pass.segment_results();
        Self {
            profit: pass.profit,
            total_trades: pass.total_trades,
            profit_factor: pass.profit_factor,
            max_drawdown_pct: pass.max_drawdown_pct,
            back_result: back,
            forward_result: forward,
        }
    }
}

/// The weaker segment decides consistency; a single profitable segment earns a
/// quarter of the credit it would get if both held up.
fn consistency_subscore(back: f64, forward: f64) -> f64 {
    let (lo, hi) = RANGE_CONSISTENCY_MIN;
    if back > 0.0 && forward > 0.0 {
        normalize(back.min(forward), lo, hi, false)
    } else if back > 0.0 || forward > 0.0 {
        normalize(back.max(forward), lo, hi, false) * 0.25
    } else {
        0.0
    }
}

/// Composite score in 0..10, rounded to one decimal.
pub fn composite_score(input: &ScoreInput) -> f64 {
    let consistency = consistency_subscore(input.back_result, input.forward_result);
    let profit = normalize(input.profit, RANGE_TOTAL_PROFIT.0, RANGE_TOTAL_PROFIT.1, false);
    let trades = normalize(
        input.total_trades as f64,
        RANGE_TRADE_COUNT.0,
        RANGE_TRADE_COUNT.1,
        false,
    );
    let pf = normalize(
        input.profit_factor,
        RANGE_PROFIT_FACTOR.0,
        RANGE_PROFIT_FACTOR.1,
        false,
    );
    let dd = normalize(
        input.max_drawdown_pct,
        RANGE_MAX_DRAWDOWN.0,
        RANGE_MAX_DRAWDOWN.1,
        true,
    );

    let score = consistency * WEIGHT_CONSISTENCY
        + profit * WEIGHT_TOTAL_PROFIT
        + trades * WEIGHT_TRADE_COUNT
        + pf * WEIGHT_PROFIT_FACTOR
        + dd * WEIGHT_MAX_DRAWDOWN;

    round1(score * 10.0)
}

/// Composite plus the consistency bonus when both segments are positive,
/// capped at 10. Used for per-pass ranking.
pub fn score_with_bonus(input: &ScoreInput) -> f64 {
    let mut score = composite_score(input);
    if input.back_result > 0.0 && input.forward_result > 0.0 {
        score = (score + CONSISTENCY_BONUS).min(10.0);
    }
    round1(score)
}

/// Per-pass score used for selection and leaderboards.
pub fn pass_score(pass: &PassRecord) -> f64 {
    score_with_bonus(&ScoreInput::from_pass(pass))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_to_unit_interval() {
        assert!((normalize(-100.0, 0.0, 50.0, false) - 0.0).abs() < f64::EPSILON);
        assert!((normalize(25.0, 0.0, 50.0, false) - 0.5).abs() < f64::EPSILON);
        assert!((normalize(500.0, 0.0, 50.0, false) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn normalize_invert_complements_inside_range() {
        for v in [0.0, 10.0, 15.0, 30.0] {
            let plain = normalize(v, 0.0, 30.0, false);
            let inverted = normalize(v, 0.0, 30.0, true);
            assert!((plain + inverted - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn normalize_degenerate_range_is_zero() {
        assert!((normalize(5.0, 10.0, 10.0, false) - 0.0).abs() < f64::EPSILON);
        assert!((normalize(5.0, 10.0, 3.0, true) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn score_is_bounded() {
        let zero = composite_score(&ScoreInput::default());
        assert!(zero >= 0.0);

        let max = composite_score(&ScoreInput {
            profit: 1_000_000.0,
            total_trades: 10_000,
            profit_factor: 99.0,
            max_drawdown_pct: 0.0,
            back_result: 1_000_000.0,
            forward_result: 1_000_000.0,
        });
        assert!((max - 10.0).abs() < 1e-9);
    }

    #[test]
    fn reference_pass_score_from_weight_table() {
        // consistency 1.0*0.25 + profit 1.0*0.25 + trades 0.4667*0.20
        // + pf 0.55*0.15 + dd 0.3833*0.15 = 0.7333 -> 7.3
        let score = composite_score(&ScoreInput {
            profit: 5000.0,
            total_trades: 120,
            profit_factor: 2.1,
            max_drawdown_pct: 18.5,
            back_result: 4000.0,
            forward_result: 2500.0,
        });
        assert!((score - 7.3).abs() < 1e-9, "score was {score}");
    }

    #[test]
    fn score_monotonic_in_profit() {
        let base = ScoreInput {
            profit: 1000.0,
            total_trades: 100,
            profit_factor: 1.5,
            max_drawdown_pct: 20.0,
            back_result: 500.0,
            forward_result: 500.0,
        };
        let more_profit = ScoreInput {
            profit: 3000.0,
            ..base
        };
        assert!(composite_score(&more_profit) >= composite_score(&base));
    }

    #[test]
    fn score_monotonic_in_drawdown_inverted() {
        let base = ScoreInput {
            profit: 1000.0,
            total_trades: 100,
            profit_factor: 1.5,
            max_drawdown_pct: 10.0,
            back_result: 500.0,
            forward_result: 500.0,
        };
        let worse_dd = ScoreInput {
            max_drawdown_pct: 25.0,
            ..base
        };
        assert!(composite_score(&worse_dd) <= composite_score(&base));
    }

    #[test]
    fn single_positive_segment_gets_quarter_credit() {
        let both = consistency_subscore(2000.0, 2000.0);
        let one = consistency_subscore(2000.0, -10.0);
        assert!((both - 1.0).abs() < 1e-12);
        assert!((one - 0.25).abs() < 1e-12);
        assert!((consistency_subscore(-1.0, -1.0) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn pass_score_bonus_capped_at_ten() {
        let strong = PassRecord {
            result: 9000.0,
            profit: 9000.0,
            profit_factor: 3.5,
            max_drawdown_pct: 2.0,
            total_trades: 400,
            back_result: Some(6000.0),
            forward_result: Some(3000.0),
            ..PassRecord::default()
        };
        assert!((pass_score(&strong) - 10.0).abs() < 1e-9);

        let inconsistent = PassRecord {
            result: 2000.0,
            profit: 2000.0,
            profit_factor: 1.8,
            max_drawdown_pct: 15.0,
            total_trades: 120,
            back_result: Some(2200.0),
            forward_result: Some(-200.0),
            ..PassRecord::default()
        };
        let base = composite_score(&ScoreInput::from_pass(&inconsistent));
        assert!((pass_score(&inconsistent) - base).abs() < 1e-9);
    }
}
