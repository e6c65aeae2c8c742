use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Comparison operator attached to a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOp {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl GateOp {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            GateOp::Ge => value >= threshold,
            GateOp::Le => value <= threshold,
            GateOp::Gt => value > threshold,
            GateOp::Lt => value < threshold,
            GateOp::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

impl fmt::Display for GateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GateOp::Ge => ">=",
            GateOp::Le => "<=",
            GateOp::Gt => ">",
            GateOp::Lt => "<",
            GateOp::Eq => "==",
        };
        f.write_str(s)
    }
}

/// Result of one threshold check. Only gate functions construct these, so
/// `passed` always agrees with `op.compare(value, threshold)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub value: f64,
    pub threshold: f64,
    pub operator: GateOp,
    pub message: String,
}

impl GateResult {
    pub fn new(name: &str, value: f64, operator: GateOp, threshold: f64) -> Self {
        let passed = operator.compare(value, threshold);
        let message = format!(
            "{}: {name} = {value} ({operator} {threshold})",
            if passed { "PASS" } else { "FAIL" },
        );
        Self {
            name: name.to_string(),
            passed,
            value,
            threshold,
            operator,
            message,
        }
    }

    pub fn with_message(mut self, message: String) -> Self {
        self.message = message;
        self
    }
}

/// Performance metrics from a single backtest run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeMetrics {
    pub profit: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    /// Winning trades as a percentage (0-100).
    pub win_rate: f64,
    pub sharpe: f64,
    #[serde(default)]
    pub sortino: f64,
    #[serde(default)]
    pub expected_payoff: f64,
    #[serde(default)]
    pub recovery_factor: f64,
    #[serde(default)]
    pub gross_profit: f64,
    /// Total loss from losing trades, kept as a positive number.
    #[serde(default)]
    pub gross_loss: f64,
}

impl TradeMetrics {
    /// Flatten into the key/value map stored on workflow state.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert("profit".into(), self.profit);
        map.insert("profit_factor".into(), self.profit_factor);
        map.insert("max_drawdown_pct".into(), self.max_drawdown_pct);
        map.insert("total_trades".into(), self.total_trades as f64);
        map.insert("win_rate".into(), self.win_rate);
        map.insert("sharpe".into(), self.sharpe);
        map.insert("sortino".into(), self.sortino);
        map.insert("expected_payoff".into(), self.expected_payoff);
        map.insert("recovery_factor".into(), self.recovery_factor);
        map.insert("gross_profit".into(), self.gross_profit);
        map.insert("gross_loss".into(), self.gross_loss);
        map
    }

    pub fn from_map(map: &BTreeMap<String, f64>) -> Self {
        let get = |key: &str| map.get(key).copied().unwrap_or(0.0);
        Self {
            profit: get("profit"),
            profit_factor: get("profit_factor"),
            max_drawdown_pct: get("max_drawdown_pct"),
            total_trades: get("total_trades").max(0.0) as u64,
            win_rate: get("win_rate"),
            sharpe: get("sharpe"),
            sortino: get("sortino"),
            expected_payoff: get("expected_payoff"),
            recovery_factor: get("recovery_factor"),
            gross_profit: get("gross_profit"),
            gross_loss: get("gross_loss"),
        }
    }
}

/// Output of the Monte Carlo resampling engine.
///
/// Percentile maps are keyed by the confidence level formatted to two decimals
/// (`"0.05"`, `"0.50"`, ...) so the JSON form is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    pub iterations: usize,
    /// P(final profit > 0), 0-100.
    pub confidence_pct: f64,
    /// P(drawdown reached the ruin threshold), 0-100.
    pub ruin_probability_pct: f64,
    pub expected_profit: f64,
    pub median_profit: f64,
    pub worst_case_p5: f64,
    pub best_case_p95: f64,
    pub max_drawdown_median: f64,
    pub max_drawdown_worst_p95: f64,
    pub percentiles: BTreeMap<String, f64>,
    pub dd_percentiles: BTreeMap<String, f64>,
}

/// Map key for a percentile level.
pub fn level_key(level: f64) -> String {
    format!("{level:.2}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Full,
    Segment,
    Rolling,
    Calendar,
    Year,
}

/// Metrics for one analysis window of the best pass (stage 13).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub id: String,
    pub label: String,
    pub kind: WindowKind,
    pub from: chrono::NaiveDate,
    pub to: chrono::NaiveDate,
    pub profit: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    pub win_rate: f64,
}
