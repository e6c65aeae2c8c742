//! In-memory simulator: configurable fixtures plus a call log. Backs the test
//! suite and the CLI's dry-run mode.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::{
    BacktestOutcome, BacktestRequest, CompileOutcome, OptimizationOutcome, OptimizeRequest,
    Simulator,
};
use crate::domain::{CellValue, PassRecord, TradeMetrics};

/// One recorded call, for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    Compile {
        ea_path: String,
    },
    Backtest {
        symbol: String,
        timeframe: String,
        report_name: Option<String>,
        param_count: usize,
    },
    Optimize {
        symbol: String,
        timeframe: String,
        report_name: Option<String>,
        range_count: usize,
    },
}

pub struct DryRunSimulator {
    pub compile_success: bool,
    pub compile_errors: Vec<String>,
    pub backtest_trades: u64,
    pub backtest_profit: f64,
    pub backtest_profit_factor: f64,
    pub backtest_max_drawdown_pct: f64,
    pub optimization_passes: usize,
    /// Override the generated passes entirely.
    pub optimization_results: Option<Vec<PassRecord>>,
    calls: Mutex<Vec<SimCall>>,
}

impl Default for DryRunSimulator {
    fn default() -> Self {
        Self {
            compile_success: true,
            compile_errors: Vec::new(),
            backtest_trades: 100,
            backtest_profit: 500.0,
            backtest_profit_factor: 1.8,
            backtest_max_drawdown_pct: 15.0,
            optimization_passes: 500,
            optimization_results: None,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl DryRunSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixture metrics for every backtest call.
    pub fn with_backtest(mut self, trades: u64, profit: f64, profit_factor: f64, dd_pct: f64) -> Self {
        self.backtest_trades = trades;
        self.backtest_profit = profit;
        self.backtest_profit_factor = profit_factor;
        self.backtest_max_drawdown_pct = dd_pct;
        self
    }

    pub fn with_passes(mut self, passes: usize) -> Self {
        self.optimization_passes = passes;
        self
    }

    /// A simulator whose compile step fails with the given diagnostics.
    pub fn failing_compile(errors: Vec<String>) -> Self {
        Self {
            compile_success: false,
            compile_errors: errors,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn log(&self, call: SimCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    /// Deterministic generated passes: the best comes first, metrics degrade
    /// with the pass index, swept inputs vary with it.
    fn generate_passes(&self, request: &OptimizeRequest) -> Vec<PassRecord> {
        (0..self.optimization_passes)
            .map(|i| {
                let idx = i as f64;
                let profit = 1000.0 - idx * 2.0;
                let pf = (2.5 - idx * 0.004).max(0.5);
                let dd = 10.0 + idx * 0.02;
                let trades = 100 + (i % 50) as u64;

                let mut params = BTreeMap::new();
                for range in &request.ranges {
                    params.insert(
                        range.name.clone(),
                        CellValue::Float(range.start + (i % 10) as f64),
                    );
                }

                PassRecord {
                    pass: Some(i as i64 + 1),
                    result: profit * pf,
                    profit,
                    profit_factor: pf,
                    expected_payoff: if trades > 0 { profit / trades as f64 } else { 0.0 },
                    max_drawdown_pct: dd,
                    total_trades: trades,
                    sharpe: 1.5 - idx * 0.002,
                    recovery_factor: if dd > 0.0 { profit / (dd * 100.0) } else { 0.0 },
                    back_result: Some(profit * pf * 0.7),
                    forward_result: Some(profit * pf * 0.3),
                    params,
                    ..PassRecord::default()
                }
            })
            .collect()
    }
}

impl Simulator for DryRunSimulator {
    fn compile(&self, ea_path: &Path) -> CompileOutcome {
        self.log(SimCall::Compile {
            ea_path: ea_path.display().to_string(),
        });

        if self.compile_success {
            CompileOutcome {
                success: true,
                binary_path: Some(ea_path.with_extension("ex5")),
                errors: Vec::new(),
                warnings: Vec::new(),
            }
        } else {
            let errors = if self.compile_errors.is_empty() {
                vec!["mock compile error".to_string()]
            } else {
                self.compile_errors.clone()
            };
            CompileOutcome {
                success: false,
                binary_path: None,
                errors,
                warnings: Vec::new(),
            }
        }
    }

    fn backtest(&self, request: &BacktestRequest) -> BacktestOutcome {
        self.log(SimCall::Backtest {
            symbol: request.symbol.clone(),
            timeframe: request.timeframe.clone(),
            report_name: request.report_name.clone(),
            param_count: request.params.len(),
        });

        let initial = 10_000.0;
        let points = self.backtest_trades.max(10);
        let step = if points > 1 {
            self.backtest_profit / (points - 1) as f64
        } else {
            0.0
        };
        let equity_curve: Vec<f64> = (0..points).map(|i| initial + step * i as f64).collect();

        let win_rate = if self.backtest_profit > 0.0 { 55.0 } else { 45.0 };
        let gross_loss = 1000.0;
        let metrics = TradeMetrics {
            profit: self.backtest_profit,
            profit_factor: self.backtest_profit_factor,
            max_drawdown_pct: self.backtest_max_drawdown_pct,
            total_trades: self.backtest_trades,
            win_rate,
            sharpe: if self.backtest_profit > 0.0 { 1.5 } else { 0.5 },
            sortino: 0.0,
            expected_payoff: if self.backtest_trades > 0 {
                self.backtest_profit / self.backtest_trades as f64
            } else {
                0.0
            },
            recovery_factor: if self.backtest_max_drawdown_pct > 0.0 {
                (self.backtest_profit / (self.backtest_max_drawdown_pct * 100.0)).abs()
            } else {
                0.0
            },
            gross_profit: self.backtest_profit + gross_loss,
            gross_loss,
        };

        BacktestOutcome {
            success: true,
            metrics,
            history_quality_pct: 100.0,
            equity_curve,
            report_path: None,
            xml_path: None,
            errors: Vec::new(),
        }
    }

    fn optimize(&self, request: &OptimizeRequest) -> OptimizationOutcome {
        self.log(SimCall::Optimize {
            symbol: request.symbol.clone(),
            timeframe: request.timeframe.clone(),
            report_name: request.report_name.clone(),
            range_count: request.ranges.len(),
        });

        let results = self
            .optimization_results
            .clone()
            .unwrap_or_else(|| self.generate_passes(request));

        OptimizationOutcome {
            success: !results.is_empty(),
            passes_count: results.len(),
            best_result: results.first().cloned(),
            errors: if results.is_empty() {
                vec!["no optimization passes".to_string()]
            } else {
                Vec::new()
            },
            results,
            xml_path: None,
            forward_xml_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OptimizationRange;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn compile_logs_and_returns_binary() {
        let sim = DryRunSimulator::new();
        let outcome = sim.compile(Path::new("/tmp/Demo.mq5"));
        assert!(outcome.success);
        assert_eq!(outcome.binary_path.unwrap(), PathBuf::from("/tmp/Demo.ex5"));
        assert_eq!(sim.calls().len(), 1);
    }

    #[test]
    fn failed_compile_carries_errors() {
        let sim = DryRunSimulator {
            compile_success: false,
            compile_errors: vec!["'foo' - undeclared identifier".into()],
            ..DryRunSimulator::default()
        };
        let outcome = sim.compile(Path::new("/tmp/Demo.mq5"));
        assert!(!outcome.success);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn backtest_fixture_metrics() {
        let sim = DryRunSimulator {
            backtest_trades: 120,
            backtest_profit: 5000.0,
            ..DryRunSimulator::default()
        };
        let outcome = sim.backtest(&BacktestRequest::new(
            PathBuf::from("/tmp/Demo.ex5"),
            "GBPUSD",
            "H1",
        ));
        assert!(outcome.success);
        assert_eq!(outcome.metrics.total_trades, 120);
        assert!((outcome.metrics.profit - 5000.0).abs() < 1e-9);
        let last = *outcome.equity_curve.last().unwrap();
        assert!((last - 15_000.0).abs() < 1e-9);
    }

    #[test]
    fn generated_passes_are_deterministic_and_ordered() {
        let sim = DryRunSimulator {
            optimization_passes: 50,
            ..DryRunSimulator::default()
        };
        let request = OptimizeRequest {
            binary_path: PathBuf::from("/tmp/Demo.ex5"),
            symbol: "GBPUSD".into(),
            timeframe: "H1".into(),
            ranges: vec![OptimizationRange::sweep("Period", 5.0, 1.0, 50.0)],
            report_name: None,
            timeout: Duration::from_secs(10),
        };
        let a = sim.optimize(&request);
        let b = sim.optimize(&request);
        assert_eq!(a.results, b.results);
        assert_eq!(a.passes_count, 50);
        // Best first
        assert!(a.results[0].result >= a.results[1].result);
        assert!(a.results[0].params.contains_key("Period"));
        assert_eq!(sim.calls().len(), 2);
    }
}
