//! Uniform interface over the external market-simulation terminal, with a
//! real child-process implementation and an in-memory one for tests and
//! dry runs.

pub mod dry_run;
pub mod ini;
pub mod terminal;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;

use crate::domain::{DataModel, OptimizationRange, PassRecord, TradeMetrics};

/// Receives heartbeat messages while a simulator call blocks.
pub trait ProgressSink: Send + Sync {
    fn update(&self, message: &str);
}

/// Discards progress messages.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn update(&self, _message: &str) {}
}

/// Forwards progress messages to the tracing subscriber.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn update(&self, message: &str) {
        tracing::info!("{message}");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutcome {
    pub success: bool,
    pub binary_path: Option<PathBuf>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// A single-run request. `report_name`, when set, makes output file selection
/// strict: only a report with that name is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestRequest {
    pub binary_path: PathBuf,
    pub symbol: String,
    pub timeframe: String,
    pub params: BTreeMap<String, String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub model: Option<DataModel>,
    pub latency_ms: Option<u32>,
    pub spread_points: Option<i64>,
    pub report_name: Option<String>,
    pub timeout: Duration,
}

impl BacktestRequest {
    pub fn new(binary_path: PathBuf, symbol: &str, timeframe: &str) -> Self {
        Self {
            binary_path,
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            params: BTreeMap::new(),
            from: None,
            to: None,
            model: None,
            latency_ms: None,
            spread_points: None,
            report_name: None,
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacktestOutcome {
    pub success: bool,
    pub metrics: TradeMetrics,
    pub history_quality_pct: f64,
    pub equity_curve: Vec<f64>,
    pub report_path: Option<PathBuf>,
    pub xml_path: Option<PathBuf>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeRequest {
    pub binary_path: PathBuf,
    pub symbol: String,
    pub timeframe: String,
    pub ranges: Vec<OptimizationRange>,
    pub report_name: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationOutcome {
    pub success: bool,
    pub passes_count: usize,
    /// Sorted descending by the optimizer's criterion.
    pub results: Vec<PassRecord>,
    pub best_result: Option<PassRecord>,
    pub xml_path: Option<PathBuf>,
    pub forward_xml_path: Option<PathBuf>,
    pub errors: Vec<String>,
}

/// The three operations the pipeline needs from a simulator install.
///
/// Implementations never panic across this boundary; failures come back in
/// the outcome's `errors`.
pub trait Simulator: Send + Sync {
    fn compile(&self, ea_path: &std::path::Path) -> CompileOutcome;
    fn backtest(&self, request: &BacktestRequest) -> BacktestOutcome;
    fn optimize(&self, request: &OptimizeRequest) -> OptimizationOutcome;
}
