//! Stages 9-11: detailed replays of the selected passes, Monte Carlo
//! robustness, and report generation.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::aggregate;
use crate::domain::{
    PassBacktest, PassBacktestSet, PassRecord, StageData, StageResult, StepId, WorkflowState,
};
use crate::engine::monte_carlo::{self, MonteCarloParams};
use crate::engine::{gates, score};
use crate::pipeline::stage::{report_name_for, Stage, StageContext};
use crate::report::deals;
use crate::sim::{BacktestRequest, Simulator};

use super::optimize::{resolve_selection, OPTIMIZATION_SIDECAR};
use super::{best_pass, binary_path, param_analysis, render_param_value};

pub const BACKTESTS_SIDECAR: &str = "backtests";

/// Stage 9: replay every selected pass in full detail and keep the best.
pub struct BacktestTopStage;

impl Stage for BacktestTopStage {
    fn id(&self) -> StepId {
        StepId::BacktestTop
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::SelectPasses]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(simulator) = simulator else {
            return StageResult::fail("no simulator available for pass replays");
        };
        let Some(binary) = binary_path(state) else {
            return StageResult::fail("no compiled EA");
        };
        let passes: Vec<PassRecord> =
            match ctx.store.load_sidecar(&state.workflow_id, OPTIMIZATION_SIDECAR) {
                Ok(passes) => passes,
                Err(e) => return StageResult::fail(format!("failed to load passes: {e}")),
            };
        let selection = resolve_selection(state, &passes);
        if selection.is_empty() {
            return StageResult::fail("no selected passes to replay");
        }

        // Pinned (non-swept) ranges override whatever the pass carried
        let fixed_params: BTreeMap<String, String> = param_analysis(state)
            .map(|(_, ranges)| {
                ranges
                    .iter()
                    .filter(|r| !r.optimize)
                    .map(|r| (r.name.clone(), render_param_value(&r.pinned_value())))
                    .collect()
            })
            .unwrap_or_default();

        let attempted = selection.len();
        let mut replays: Vec<PassBacktest> = Vec::new();

        for pass in selection {
            let Some(pass_num) = pass.pass else { continue };
            let mut input_params = pass.input_params();
            input_params.extend(fixed_params.clone());

            let mut request =
                BacktestRequest::new(binary.clone(), &state.symbol, &state.timeframe);
            request.params = input_params.clone();
            request.report_name = Some(report_name_for(
                &state.workflow_id,
                self.id(),
                &state.symbol,
                &state.timeframe,
                Some(&format!("pass_{pass_num}")),
            ));
            request.timeout = std::time::Duration::from_secs(ctx.config.backtest_timeout_s);

            ctx.progress
                .update(&format!("replaying pass {pass_num} of {attempted} selected"));
            let outcome = simulator.backtest(&request);
            if !outcome.success {
                tracing::warn!(pass_num, errors = ?outcome.errors, "pass replay failed");
                continue;
            }

            replays.push(PassBacktest {
                pass_num,
                metrics: outcome.metrics,
                back_result: pass.back_result.unwrap_or(pass.result),
                forward_result: pass.forward_result.unwrap_or(0.0),
                report_path: outcome.report_path.map(|p| p.display().to_string()),
                input_params,
            });
        }

        if replays.is_empty() {
            return StageResult {
                success: false,
                data: None,
                gate: Some(gates::successful_passes(0)),
                errors: vec!["all pass replays failed".into()],
            };
        }

        let best = replays
            .iter()
            .max_by(|a, b| a.metrics.profit.total_cmp(&b.metrics.profit))
            .cloned()
            .unwrap_or_else(|| replays[0].clone());

        let sidecar = PassBacktestSet {
            best: best.clone(),
            all: replays.clone(),
        };
        let results_file = match ctx
            .store
            .save_sidecar(&state.workflow_id, BACKTESTS_SIDECAR, &sidecar)
        {
            Ok(path) => path.display().to_string(),
            Err(e) => return StageResult::fail(format!("failed to persist replays: {e}")),
        };

        let mut gate_set = gates::backtest_gates(&best.metrics, &ctx.config.gates);
        gate_set.push(gates::successful_passes(replays.len()));
        let all_passed = gate_set.iter().all(|g| g.passed);

        StageResult {
            success: all_passed,
            data: Some(StageData::BacktestTop {
                best,
                results_file,
                successful: replays.len(),
                attempted,
                gates: gate_set,
            }),
            gate: None,
            errors: Vec::new(),
        }
    }
}

/// Monte Carlo seed: configured, or derived from the workflow id so re-runs
/// of the same workflow reproduce bit for bit.
pub fn monte_carlo_seed(config: &crate::config::Config, workflow_id: &str) -> u64 {
    config.monte_carlo.seed.unwrap_or_else(|| {
        let digest = Sha256::digest(workflow_id.as_bytes());
        u64::from_le_bytes(digest[..8].try_into().unwrap_or_default())
    })
}

/// Stage 10: resample the best pass's trade sequence. Uses the real trade
/// list when the replay produced a report; otherwise reconstructs one from
/// the summary metrics.
pub struct MonteCarloStage;

impl Stage for MonteCarloStage {
    fn id(&self) -> StepId {
        StepId::MonteCarlo
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
        let Some(best) = best_pass(state) else {
            return StageResult::fail("no best pass to resample");
        };

        let trades: Vec<f64> = match best.report_path.as_deref() {
            Some(path) if Path::new(path).exists() => {
                match deals::extract_trades(Path::new(path)) {
                    Ok(extraction) => extraction.trades.iter().map(|t| t.net_profit).collect(),
                    Err(err) => {
                        tracing::warn!(%err, "trade extraction failed, using summary estimate");
                        match monte_carlo::reconstruct_trades(&best.metrics) {
                            Ok(trades) => trades,
                            Err(e) => return StageResult::fail(e.to_string()),
                        }
                    }
                }
            }
            _ => match monte_carlo::reconstruct_trades(&best.metrics) {
                Ok(trades) => trades,
                Err(e) => return StageResult::fail(e.to_string()),
            },
        };

        let params = MonteCarloParams {
            iterations: ctx.config.monte_carlo.iterations,
            initial_balance: ctx.config.monte_carlo.initial_balance,
            ruin_threshold: ctx.config.monte_carlo.ruin_threshold,
            confidence_levels: ctx.config.monte_carlo.confidence_levels.clone(),
            seed: monte_carlo_seed(ctx.config, &state.workflow_id),
        };
        let result = match monte_carlo::run_monte_carlo(&trades, &params) {
            Ok(result) => result,
            Err(e) => return StageResult::fail(e.to_string()),
        };

        let gate_set = gates::monte_carlo_gates(&result, &ctx.config.gates);
        let all_passed = gate_set.iter().all(|g| g.passed);

        StageResult {
            success: all_passed,
            data: Some(StageData::MonteCarlo {
                result,
                gates: gate_set,
            }),
            gate: None,
            errors: Vec::new(),
        }
    }
}

/// Stage 11: always runs, even after failures, so every workflow ends with a
/// diagnostic dashboard and fresh aggregate boards.
pub struct GenerateReportsStage;

impl Stage for GenerateReportsStage {
    fn id(&self) -> StepId {
        StepId::GenerateReports
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let (back, forward) = best_pass(state)
            .map(|b| (b.back_result, b.forward_result))
            .unwrap_or((0.0, 0.0));
        let metrics = state.metrics_snapshot();
        let composite_score =
            score::composite_score(&score::ScoreInput::from_metrics(&metrics, back, forward));

        let go_live = gates::go_live_ready(&state.gates);
        let diagnoses: Vec<String> = if go_live.ready {
            Vec::new()
        } else {
            gates::diagnose(&state.gates, &state.metrics)
                .into_iter()
                .map(|d| format!("{}: {}", d.gate, d.message))
                .collect()
        };

        let dashboard_path =
            match aggregate::write_dashboard(ctx.store, state, composite_score, &go_live, &diagnoses)
            {
                Ok(path) => Some(path.display().to_string()),
                Err(err) => {
                    tracing::warn!(%err, "dashboard generation failed");
                    None
                }
            };

        if let Err(err) = aggregate::generate_leaderboard(ctx.store, ctx.config) {
            tracing::warn!(%err, "leaderboard update failed");
        }
        if let Err(err) = aggregate::generate_boards(ctx.store) {
            tracing::warn!(%err, "boards update failed");
        }

        StageResult::ok(StageData::GenerateReports {
            composite_score,
            go_live_ready: go_live.ready,
            dashboard_path,
            diagnoses,
        })
    }
}
