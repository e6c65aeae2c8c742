#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;

use stresslab::config::Config;
use stresslab::domain::OptimizationRange;
use stresslab::pipeline::{Executor, ParamAnalysis, WorkflowSpec};
use stresslab::sim::dry_run::DryRunSimulator;
use stresslab::sim::{NullProgress, ProgressSink, Simulator};
use stresslab::store::RunStore;

/// A small EA source with a realistic parameter surface.
pub const SAMPLE_EA: &str = r#"//+------------------------------------------------------------------+
//| Demo EA                                                          |
//+------------------------------------------------------------------+
#property copyright "demo"
#include <Trade/Trade.mqh>

input int      RsiPeriod = 14;       // RSI lookback
input int      StopLossPips = 40;
input double   Lots = 0.1;
input bool     Use_Trailing = true;
sinput string  TradeComment = "demo";

void OnTick()
{
}
"#;

pub fn write_sample_ea(dir: &Path) -> PathBuf {
    let ea = dir.join("Demo.mq5");
    std::fs::write(&ea, SAMPLE_EA).unwrap();
    ea
}

/// A test config: fixed anchor date, small Monte Carlo, a slim stress suite,
/// and a fixed seed so runs are reproducible.
pub fn test_config(runs_dir: &Path) -> Config {
    let mut config = Config::default();
    config.runs_dir = runs_dir.to_path_buf();
    config.dates.anchor = Some(NaiveDate::from_ymd_opt(2026, 7, 1).unwrap());
    config.monte_carlo.iterations = 300;
    config.monte_carlo.seed = Some(1);
    config.stress.rolling_days = vec![30];
    config.stress.calendar_months_ago = vec![];
    config.stress.models = vec![stresslab::domain::DataModel::OhlcMinute];
    config.stress.tick_latencies_ms = vec![];
    config.stress.include_overlays = false;
    config
}

/// A simulator whose fixtures sail through every gate.
pub fn passing_simulator() -> DryRunSimulator {
    DryRunSimulator::new()
        .with_backtest(120, 5000.0, 2.1, 18.5)
        .with_passes(500)
}

/// A simulator whose validation backtest trips the minimum-trades gate.
pub fn sparse_simulator() -> DryRunSimulator {
    DryRunSimulator::new().with_backtest(20, 500.0, 1.8, 15.0)
}

pub fn sample_payload() -> ParamAnalysis {
    let mut wide_params = BTreeMap::new();
    wide_params.insert("RsiPeriod".to_string(), serde_json::json!(5));
    wide_params.insert("StopLossPips".to_string(), serde_json::json!(100));
    ParamAnalysis {
        wide_params,
        ranges: vec![
            OptimizationRange::sweep("RsiPeriod", 5.0, 1.0, 30.0),
            OptimizationRange::sweep("StopLossPips", 20.0, 10.0, 100.0),
            OptimizationRange::fixed("Lots", 0.1),
        ],
    }
}

pub fn make_executor(
    config: &Config,
    store: &RunStore,
    simulator: Arc<dyn Simulator>,
    ea_path: &Path,
) -> Executor {
    let progress: Arc<dyn ProgressSink> = Arc::new(NullProgress);
    Executor::new(
        config.clone(),
        store.clone(),
        simulator,
        progress,
        &WorkflowSpec {
            ea_path: ea_path.to_path_buf(),
            symbol: "GBPUSD".into(),
            timeframe: "H1".into(),
        },
    )
    .unwrap()
}
