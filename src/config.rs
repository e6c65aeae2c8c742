use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::{BacktestDates, DataModel};

/// One simulator install the pipeline can drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInstall {
    pub id: String,
    /// Path to the terminal executable.
    pub exe_path: PathBuf,
    /// The install's data directory (reports, tester files, tick bases).
    pub data_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateThresholds {
    pub min_trades: u64,
    pub min_profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub mc_confidence_min: f64,
    pub mc_ruin_max: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_trades: 50,
            min_profit_factor: 1.5,
            max_drawdown_pct: 30.0,
            mc_confidence_min: 80.0,
            mc_ruin_max: 5.0,
        }
    }
}

/// Defaults for the `[Tester]` section of generated run configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterDefaults {
    pub deposit: f64,
    pub currency: String,
    pub leverage: u32,
    pub data_model: DataModel,
    pub execution_latency_ms: u32,
    /// 2 = genetic.
    pub optimization_mode: u8,
    /// 6 = custom OnTester criterion.
    pub optimization_criterion: u8,
    /// 2 = forward segment split by date.
    pub forward_mode: u8,
}

impl Default for TesterDefaults {
    fn default() -> Self {
        Self {
            deposit: 10_000.0,
            currency: "GBP".into(),
            leverage: 100,
            data_model: DataModel::OhlcMinute,
            execution_latency_ms: 10,
            optimization_mode: 2,
            optimization_criterion: 6,
            forward_mode: 2,
        }
    }
}

/// Backtest window shape: `backtest_years` total with the last
/// `forward_years` held out as the forward segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DateConfig {
    pub backtest_years: u32,
    pub forward_years: u32,
    /// Pin the window end for reproducible runs; defaults to today.
    pub anchor: Option<NaiveDate>,
}

impl Default for DateConfig {
    fn default() -> Self {
        Self {
            backtest_years: 4,
            forward_years: 1,
            anchor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloConfig {
    pub iterations: usize,
    pub initial_balance: f64,
    /// Drawdown fraction counted as ruin.
    pub ruin_threshold: f64,
    pub confidence_levels: Vec<f64>,
    /// Fixed PRNG seed; when unset, a seed is derived from the workflow id so
    /// re-runs of the same workflow are bitwise identical.
    pub seed: Option<u64>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            iterations: 10_000,
            initial_balance: 10_000.0,
            ruin_threshold: 0.5,
            confidence_levels: vec![0.05, 0.10, 0.25, 0.50, 0.75, 0.90, 0.95],
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub rolling_days: Vec<u32>,
    pub calendar_months_ago: Vec<u32>,
    pub models: Vec<DataModel>,
    pub tick_latencies_ms: Vec<u32>,
    pub overlay_spread_pips: Vec<f64>,
    pub overlay_slippage_pips: Vec<f64>,
    pub overlay_slippage_sides: u32,
    pub include_overlays: bool,
    pub timeout_per_scenario_s: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            rolling_days: vec![30, 90],
            calendar_months_ago: vec![1, 2, 3],
            models: vec![DataModel::OhlcMinute, DataModel::Tick],
            tick_latencies_ms: vec![10, 50, 100],
            overlay_spread_pips: vec![0.5, 1.0, 2.0],
            overlay_slippage_pips: vec![0.0, 0.5, 1.0],
            overlay_slippage_sides: 2,
            include_overlays: true,
            timeout_per_scenario_s: 900,
        }
    }
}

/// Immutable run configuration, threaded from the CLI through the executor
/// into every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runs_dir: PathBuf,
    pub terminals: Vec<TerminalInstall>,
    pub active_terminal: Option<String>,
    pub dates: DateConfig,
    pub gates: GateThresholds,
    pub tester: TesterDefaults,
    pub monte_carlo: MonteCarloConfig,
    pub stress: StressConfig,
    /// Stage 8b mode: deterministic top-N scoring, or pause for an external
    /// selection payload.
    pub auto_select_passes: bool,
    /// Passes carried into stage 9 and per workflow onto the leaderboard.
    pub top_passes: usize,
    pub max_fix_attempts: u32,
    pub optimization_timeout_s: u64,
    pub backtest_timeout_s: u64,
    /// Minimum trade count below which the injected criterion returns its
    /// sentinel instead of a score.
    pub ontester_min_trades: u32,
    pub progress_interval_s: u64,
    /// Extra symbols queued as child workflows by stage 14.
    pub multi_pair_symbols: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from("runs"),
            terminals: Vec::new(),
            active_terminal: None,
            dates: DateConfig::default(),
            gates: GateThresholds::default(),
            tester: TesterDefaults::default(),
            monte_carlo: MonteCarloConfig::default(),
            stress: StressConfig::default(),
            auto_select_passes: true,
            top_passes: 30,
            max_fix_attempts: 3,
            optimization_timeout_s: 7200,
            backtest_timeout_s: 600,
            ontester_min_trades: 30,
            progress_interval_s: 30,
            multi_pair_symbols: vec!["EURUSD".into(), "USDJPY".into()],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// The active terminal install, or the first configured one.
    pub fn terminal(&self) -> Option<&TerminalInstall> {
        match &self.active_terminal {
            Some(id) => self.terminals.iter().find(|t| &t.id == id),
            None => self.terminals.first(),
        }
    }

    /// Derive the backtest window from the anchor (or `today`).
    pub fn backtest_dates(&self, today: NaiveDate) -> BacktestDates {
        let end = self.dates.anchor.unwrap_or(today);
        let start = end
            .checked_sub_months(Months::new(self.dates.backtest_years * 12))
            .unwrap_or(end);
        let split = end
            .checked_sub_months(Months::new(self.dates.forward_years * 12))
            .unwrap_or(end);
        BacktestDates { start, split, end }
    }
}
