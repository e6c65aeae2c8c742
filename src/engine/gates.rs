//! Gate predicates and failure diagnosis. Every gate is a pure function of
//! measured values against configured thresholds.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::GateThresholds;
use crate::domain::{GateOp, GateResult, GoLiveCheck, MonteCarloResult, TradeMetrics};

/// Gates that must all pass before an EA is considered deployable.
pub const CRITICAL_GATES: &[&str] = &[
    "profit_factor",
    "max_drawdown",
    "minimum_trades",
    "mc_confidence",
    "mc_ruin",
];

pub fn file_exists(path: &Path) -> GateResult {
    let exists = path.exists();
    let value = if exists { 1.0 } else { 0.0 };
    GateResult::new("file_exists", value, GateOp::Eq, 1.0).with_message(format!(
        "{}: EA file {}: {}",
        if exists { "PASS" } else { "FAIL" },
        if exists { "exists" } else { "not found" },
        path.display()
    ))
}

pub fn compilation(success: bool, error_count: usize) -> GateResult {
    let value = if success { 0.0 } else { error_count.max(1) as f64 };
    GateResult::new("compilation", value, GateOp::Eq, 0.0).with_message(format!(
        "{}: compilation {}",
        if success { "PASS" } else { "FAIL" },
        if success {
            "succeeded".to_string()
        } else {
            format!("failed with {error_count} error(s)")
        }
    ))
}

pub fn params_found(count: usize, optimizable: usize) -> GateResult {
    GateResult::new("params_found", count as f64, GateOp::Ge, 1.0).with_message(format!(
        "{}: found {count} parameters ({optimizable} optimizable)",
        if count > 0 { "PASS" } else { "FAIL" },
    ))
}

pub fn minimum_trades(total_trades: u64, thresholds: &GateThresholds) -> GateResult {
    let min = thresholds.min_trades;
    GateResult::new("minimum_trades", total_trades as f64, GateOp::Ge, min as f64).with_message(
        format!(
            "{}: {total_trades} trades (minimum: {min})",
            if total_trades >= min { "PASS" } else { "FAIL" },
        ),
    )
}

pub fn profit_factor(pf: f64, thresholds: &GateThresholds) -> GateResult {
    GateResult::new(
        "profit_factor",
        round2(pf),
        GateOp::Ge,
        thresholds.min_profit_factor,
    )
}

pub fn max_drawdown(dd_pct: f64, thresholds: &GateThresholds) -> GateResult {
    GateResult::new(
        "max_drawdown",
        round2(dd_pct),
        GateOp::Le,
        thresholds.max_drawdown_pct,
    )
}

pub fn mc_confidence(confidence_pct: f64, thresholds: &GateThresholds) -> GateResult {
    let min = thresholds.mc_confidence_min;
    GateResult::new("mc_confidence", round2(confidence_pct), GateOp::Ge, min).with_message(
        format!(
            "{}: MC confidence {confidence_pct}% (minimum: {min}%)",
            if confidence_pct >= min { "PASS" } else { "FAIL" },
        ),
    )
}

pub fn mc_ruin(ruin_pct: f64, thresholds: &GateThresholds) -> GateResult {
    let max = thresholds.mc_ruin_max;
    GateResult::new("mc_ruin", round2(ruin_pct), GateOp::Le, max).with_message(format!(
        "{}: ruin probability {ruin_pct}% (maximum: {max}%)",
        if ruin_pct <= max { "PASS" } else { "FAIL" },
    ))
}

pub fn optimization_passes(passes: usize) -> GateResult {
    GateResult::new("optimization_passes", passes as f64, GateOp::Ge, 1.0)
        .with_message(format!(
            "{}: {passes} optimization passes",
            if passes > 0 { "PASS" } else { "FAIL" },
        ))
}

/// Passes that met the minimum-trade bar in the parsed results.
pub fn valid_passes(count: usize) -> GateResult {
    GateResult::new("valid_passes", count as f64, GateOp::Ge, 1.0)
}

/// Selected passes whose detailed replay succeeded.
pub fn successful_passes(count: usize) -> GateResult {
    GateResult::new("successful_passes", count as f64, GateOp::Ge, 1.0)
}

/// The backtest gate group checked against the best pass (stage 9).
pub fn backtest_gates(metrics: &TradeMetrics, thresholds: &GateThresholds) -> Vec<GateResult> {
    vec![
        profit_factor(metrics.profit_factor, thresholds),
        max_drawdown(metrics.max_drawdown_pct, thresholds),
        minimum_trades(metrics.total_trades, thresholds),
    ]
}

/// The Monte Carlo gate group (stage 10).
pub fn monte_carlo_gates(result: &MonteCarloResult, thresholds: &GateThresholds) -> Vec<GateResult> {
    vec![
        mc_confidence(result.confidence_pct, thresholds),
        mc_ruin(result.ruin_probability_pct, thresholds),
    ]
}

/// Is the EA ready to deploy? All critical gates must be present and passed.
pub fn go_live_ready(gates: &BTreeMap<String, GateResult>) -> GoLiveCheck {
    let mut gate_results = BTreeMap::new();
    let mut ready = true;
    for name in CRITICAL_GATES {
        let passed = gates.get(*name).is_some_and(|g| g.passed);
        gate_results.insert((*name).to_string(), passed);
        if !passed {
            ready = false;
        }
    }
    GoLiveCheck {
        ready,
        gate_results,
        message: if ready {
            "READY for go-live".into()
        } else {
            "NOT ready - some gates failed".into()
        },
    }
}

/// Structured explanation for one failed gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub gate: String,
    pub message: String,
}

/// Explain why gates failed, in terms a strategy author can act on.
///
/// `profit_factor` failures distinguish a thin win/loss size ratio from a low
/// win rate, using `avg_win`/`avg_loss`/`win_rate` from the metrics map.
pub fn diagnose(
    gates: &BTreeMap<String, GateResult>,
    metrics: &BTreeMap<String, f64>,
) -> Vec<Diagnosis> {
    let mut diagnoses = Vec::new();
    let metric = |key: &str, default: f64| metrics.get(key).copied().unwrap_or(default);

    for (name, gate) in gates {
        if gate.passed {
            continue;
        }
        let value = gate.value;
        let threshold = gate.threshold;

        let message = match name.as_str() {
            "profit_factor" => {
                let avg_win = metric("avg_win", 0.0);
                let avg_loss = metric("avg_loss", 1.0).abs();
                if avg_win < avg_loss * 1.5 {
                    format!(
                        "PF {value} < {threshold}: average win ({avg_win:.0}) is too close to \
                         average loss ({avg_loss:.0}). Consider tightening the stop loss or \
                         improving the exit strategy."
                    )
                } else {
                    let win_rate = metric("win_rate", 50.0);
                    format!(
                        "PF {value} < {threshold}: win rate is {win_rate:.0}%. Consider \
                         improving entry signals to increase winning trades."
                    )
                }
            }
            "max_drawdown" => format!(
                "Drawdown {value}% > {threshold}%: consider position sizing, trailing stops, \
                 or reducing exposure during losing streaks."
            ),
            "minimum_trades" => format!(
                "Only {} trades (need {}+): the EA may be too selective. Consider widening \
                 entry conditions or testing a longer period.",
                value as i64, threshold as i64
            ),
            "mc_confidence" => format!(
                "MC confidence {value}% < {threshold}%: results may be due to luck. Trade \
                 sequence matters too much - reduce dependency on specific market conditions."
            ),
            "mc_ruin" => format!(
                "Ruin probability {value}% > {threshold}%: high risk of account blowup. Reduce \
                 position sizes or add circuit breakers for losing streaks."
            ),
            _ => continue,
        };

        diagnoses.push(Diagnosis {
            gate: name.clone(),
            message,
        });
    }

    diagnoses
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
