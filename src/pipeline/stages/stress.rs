//! Stages 12-14: stress scenarios, forward-window analysis, and multi-symbol
//! orchestration records.

use std::path::Path;

use crate::domain::{StageData, StageResult, StepId, WorkflowState};
use crate::engine::{stress, windows};
use crate::pipeline::stage::{Stage, StageContext};
use crate::report::deals;
use crate::sim::Simulator;

use super::{best_pass, binary_path};

pub const STRESS_SIDECAR: &str = "stress";

/// Stage 12: replay the best pass across the deterministic scenario suite,
/// then add the post-hoc cost-overlay variants.
pub struct StressScenariosStage;

impl Stage for StressScenariosStage {
    fn id(&self) -> StepId {
        StepId::StressScenarios
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::BacktestTop]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(simulator) = simulator else {
            return StageResult::fail("no simulator available for stress scenarios");
        };
        let Some(binary) = binary_path(state) else {
            return StageResult::fail("no compiled EA");
        };
        let Some(best) = best_pass(state) else {
            return StageResult::fail("no best pass to stress");
        };

        let data_path = ctx.config.terminal().map(|t| t.data_path.clone());

        // The best pass's own full-period report joins overlay generation
        // without being listed as a scenario row
        let baseline = best.report_path.clone().map(|report_path| {
            stress::full_period_baseline(
                &state.backtest_dates,
                ctx.config.tester.data_model,
                ctx.config.tester.execution_latency_ms,
                stress::ScenarioMetrics {
                    profit: best.metrics.profit,
                    profit_factor: best.metrics.profit_factor,
                    max_drawdown_pct: best.metrics.max_drawdown_pct,
                    total_trades: best.metrics.total_trades,
                    history_quality_pct: 0.0,
                    tick_files_ok: None,
                    tick_files_missing: None,
                },
                report_path,
            )
        });

        let results = stress::run_scenarios(
            simulator,
            &binary,
            &state.symbol,
            &state.timeframe,
            &best.input_params,
            &ctx.config.stress,
            &state.backtest_dates,
            ctx.today,
            data_path.as_deref(),
            baseline.as_ref(),
            ctx.progress,
        );

        let base_count = results
            .iter()
            .filter(|r| r.scenario.variant == crate::domain::ScenarioVariant::Base)
            .count();
        let overlay_count = results.len() - base_count;

        let results_file = match ctx
            .store
            .save_sidecar(&state.workflow_id, STRESS_SIDECAR, &results)
        {
            Ok(path) => path.display().to_string(),
            Err(e) => return StageResult::fail(format!("failed to persist scenarios: {e}")),
        };

        StageResult::ok(StageData::StressScenarios {
            scenario_count: results.len(),
            base_count,
            overlay_count,
            results_file,
        })
    }
}

/// Stage 13: pure trade-list window analysis of the best pass. Informational;
/// skips quietly when the replay produced no report to read trades from.
pub struct ForwardWindowsStage;

impl Stage for ForwardWindowsStage {
    fn id(&self) -> StepId {
        StepId::ForwardWindows
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::BacktestTop]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let report_path = best_pass(state).and_then(|b| b.report_path.clone());
        let Some(report_path) = report_path.filter(|p| Path::new(p).exists()) else {
            return StageResult::ok(StageData::ForwardWindows { windows: Vec::new() });
        };

        let extraction = match deals::extract_trades(Path::new(&report_path)) {
            Ok(extraction) => extraction,
            Err(e) => return StageResult::fail(format!("trade extraction failed: {e}")),
        };

        let windows = windows::build_windows(
            &extraction.trades,
            &state.backtest_dates,
            &ctx.config.stress.rolling_days,
            &ctx.config.stress.calendar_months_ago,
            ctx.config.tester.deposit,
        );

        StageResult::ok(StageData::ForwardWindows { windows })
    }
}

/// Stage 14: emit orchestration records for the other configured symbols. The
/// stage never spawns children; the executor reads this result and decides.
pub struct MultiPairStage;

impl Stage for MultiPairStage {
    fn id(&self) -> StepId {
        StepId::MultiPair
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::AnalyzeParams]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let symbols: Vec<String> = ctx
            .config
            .multi_pair_symbols
            .iter()
            .filter(|s| !s.eq_ignore_ascii_case(&state.symbol))
            .cloned()
            .collect();
        let skipped = symbols.is_empty();

        StageResult::ok(StageData::MultiPair { symbols, skipped })
    }
}
