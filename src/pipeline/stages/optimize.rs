//! Stages 6-8b: tester config, the optimization sweep, result parsing, and
//! pass selection.

use garde::Validate;

use crate::domain::{
    PassRecord, SelectionMethod, StageData, StageResult, StepId, WorkflowState, WorkflowStatus,
};
use crate::engine::{gates, score};
use crate::pipeline::stage::{report_name_for, PassSelection, Stage, StageContext};
use crate::sim::ini::{optimization_ini, TesterSection};
use crate::sim::{OptimizeRequest, Simulator};

use super::{binary_path, param_analysis, selected_passes};

pub const OPTIMIZATION_SIDECAR: &str = "optimization";

/// Stage 6: materialize the optimization tester config so the exact sweep
/// definition is part of the run's artifacts.
pub struct CreateIniStage;

impl Stage for CreateIniStage {
    fn id(&self) -> StepId {
        StepId::CreateIni
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::Compile, StepId::AnalyzeParams, StepId::ValidateTrades]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(binary) = binary_path(state) else {
            return StageResult::fail("no compiled EA");
        };
        let Some((_, ranges)) = param_analysis(state) else {
            return StageResult::fail("no analyzed parameters");
        };

        let expert = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let report_name = report_name_for(
            &state.workflow_id,
            StepId::RunOptimization,
            &state.symbol,
            &state.timeframe,
            None,
        );
        let section = TesterSection {
            expert: &expert,
            symbol: &state.symbol,
            timeframe: &state.timeframe,
            from: state.backtest_dates.start,
            to: state.backtest_dates.end,
            model: ctx.config.tester.data_model,
            latency_ms: ctx.config.tester.execution_latency_ms,
            spread_points: None,
            report_name: &report_name,
            defaults: &ctx.config.tester,
        };
        let ini = optimization_ini(&section, &state.backtest_dates, ranges);

        match ctx
            .store
            .write_artifact(&state.workflow_id, "optimization.ini", &ini)
        {
            Ok(path) => StageResult::ok(StageData::CreateIni {
                ini_path: path.display().to_string(),
            }),
            Err(e) => StageResult::fail(format!("failed to write tester config: {e}")),
        }
    }
}

/// Stage 7: the parameter sweep. Full pass lists go to a sidecar file; the
/// state keeps only the summary.
pub struct RunOptimizationStage;

impl Stage for RunOptimizationStage {
    fn id(&self) -> StepId {
        StepId::RunOptimization
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::CreateIni]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(simulator) = simulator else {
            return StageResult::fail("no simulator available for optimization");
        };
        let Some(binary) = binary_path(state) else {
            return StageResult::fail("no compiled EA");
        };
        let Some((_, ranges)) = param_analysis(state) else {
            return StageResult::fail("no analyzed parameters");
        };

        let request = OptimizeRequest {
            binary_path: binary,
            symbol: state.symbol.clone(),
            timeframe: state.timeframe.clone(),
            ranges: ranges.to_vec(),
            report_name: Some(report_name_for(
                &state.workflow_id,
                self.id(),
                &state.symbol,
                &state.timeframe,
                None,
            )),
            timeout: std::time::Duration::from_secs(ctx.config.optimization_timeout_s),
        };

        let outcome = simulator.optimize(&request);
        if !outcome.success {
            return StageResult {
                success: false,
                data: None,
                gate: Some(gates::optimization_passes(0)),
                errors: outcome.errors,
            };
        }

        let results_file = match ctx.store.save_sidecar(
            &state.workflow_id,
            OPTIMIZATION_SIDECAR,
            &outcome.results,
        ) {
            Ok(path) => path.display().to_string(),
            Err(e) => return StageResult::fail(format!("failed to persist passes: {e}")),
        };

        let gate = gates::optimization_passes(outcome.passes_count);
        StageResult::ok_gated(
            StageData::RunOptimization {
                passes: outcome.passes_count,
                results_file,
                xml_path: outcome.xml_path.map(|p| p.display().to_string()),
                forward_xml_path: outcome.forward_xml_path.map(|p| p.display().to_string()),
            },
            gate,
        )
    }
}

/// Stage 8: sanity-check the parsed passes before anything is selected.
pub struct ParseResultsStage;

impl Stage for ParseResultsStage {
    fn id(&self) -> StepId {
        StepId::ParseResults
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::RunOptimization]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let passes: Vec<PassRecord> =
            match ctx.store.load_sidecar(&state.workflow_id, OPTIMIZATION_SIDECAR) {
                Ok(passes) => passes,
                Err(e) => return StageResult::fail(format!("failed to load passes: {e}")),
            };

        let min_trades = ctx.config.gates.min_trades;
        let valid = passes
            .iter()
            .filter(|p| p.total_trades >= min_trades)
            .count();
        let gate = gates::valid_passes(valid);

        if valid == 0 {
            return StageResult {
                success: false,
                data: Some(StageData::ParseResults {
                    total_passes: passes.len(),
                    valid_passes: 0,
                }),
                gate: Some(gate),
                errors: vec![format!(
                    "no passes meet the minimum trade threshold ({min_trades})"
                )],
            };
        }

        StageResult::ok_gated(
            StageData::ParseResults {
                total_passes: passes.len(),
                valid_passes: valid,
            },
            gate,
        )
    }
}

/// Stage 8b: choose the passes to replay in detail. Auto mode scores every
/// pass deterministically; external mode pauses for a selection payload.
pub struct SelectPassesStage {
    pub payload: Option<PassSelection>,
}

impl Stage for SelectPassesStage {
    fn id(&self) -> StepId {
        StepId::SelectPasses
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::ParseResults]
    }

    fn pause(&self, _state: &WorkflowState, ctx: &StageContext<'_>) -> Option<WorkflowStatus> {
        (!ctx.config.auto_select_passes && self.payload.is_none())
            .then_some(WorkflowStatus::AwaitingStatsAnalysis)
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let passes: Vec<PassRecord> =
            match ctx.store.load_sidecar(&state.workflow_id, OPTIMIZATION_SIDECAR) {
                Ok(passes) => passes,
                Err(e) => return StageResult::fail(format!("failed to load passes: {e}")),
            };
        let min_trades = ctx.config.gates.min_trades;

        if let Some(payload) = &self.payload {
            return Self::external_selection(payload, &passes);
        }

        // Auto mode: rank the valid passes by Go-Live Score
        let mut scored: Vec<(&PassRecord, f64)> = passes
            .iter()
            .filter(|p| p.total_trades >= min_trades && p.pass.is_some())
            .map(|p| (p, score::pass_score(p)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let selected: Vec<i64> = scored
            .iter()
            .take(ctx.config.top_passes)
            .filter_map(|(p, _)| p.pass)
            .collect();

        if selected.is_empty() {
            return StageResult::fail("no scoreable passes to select");
        }

        StageResult::ok(StageData::SelectPasses {
            top_pass: selected.first().copied(),
            selected,
            method: SelectionMethod::Auto,
            scored: scored.len(),
        })
    }
}

impl SelectPassesStage {
    /// Validate an external selection structurally, then against the actual
    /// pass table. Unknown pass numbers reject the whole payload.
    fn external_selection(payload: &PassSelection, passes: &[PassRecord]) -> StageResult {
        if let Err(report) = payload.validate() {
            return StageResult {
                success: false,
                data: None,
                gate: None,
                errors: report
                    .iter()
                    .map(|(path, error)| format!("{path}: {error}"))
                    .collect(),
            };
        }

        let known: std::collections::BTreeSet<i64> =
            passes.iter().filter_map(|p| p.pass).collect();
        let unknown: Vec<i64> = payload
            .selected
            .iter()
            .copied()
            .filter(|n| !known.contains(n))
            .collect();
        if !unknown.is_empty() {
            return StageResult::fail(format!(
                "selection references unknown passes: {unknown:?}"
            ));
        }

        StageResult::ok(StageData::SelectPasses {
            top_pass: payload.selected.first().copied(),
            selected: payload.selected.clone(),
            method: SelectionMethod::External,
            scored: passes.len(),
        })
    }
}

/// Look up the full records for the selected passes, preserving selection
/// order (used by stage 9).
pub fn resolve_selection(state: &WorkflowState, passes: &[PassRecord]) -> Vec<PassRecord> {
    let Some(selected) = selected_passes(state) else {
        return Vec::new();
    };
    selected
        .iter()
        .filter_map(|num| passes.iter().find(|p| p.pass == Some(*num)).cloned())
        .collect()
}
