//! Stage implementations, grouped by pipeline phase.

mod analyze;
mod backtest;
mod optimize;
mod prepare;
mod stress;

pub use analyze::{AnalyzeParamsStage, FixEaStage, ValidateTradesStage};
pub use backtest::{BacktestTopStage, GenerateReportsStage, MonteCarloStage, BACKTESTS_SIDECAR};
pub use optimize::{
    CreateIniStage, ParseResultsStage, RunOptimizationStage, SelectPassesStage,
    OPTIMIZATION_SIDECAR,
};
pub use prepare::{
    CompileStage, ExtractParamsStage, InjectOnTesterStage, InjectSafetyStage, LoadEaStage,
};
pub use stress::{ForwardWindowsStage, MultiPairStage, StressScenariosStage};

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::domain::{OptimizationRange, PassBacktest, StageData, StepId, WorkflowState};

/// Path of the instrumented working copy (written by 1b, reused by 1c and 2).
pub fn modified_ea_path(state: &WorkflowState) -> Option<PathBuf> {
    match state.stage_data(StepId::InjectOnTester) {
        Some(StageData::InjectOnTester { modified_path, .. }) => {
            Some(PathBuf::from(modified_path))
        }
        _ => None,
    }
}

/// Compiled binary from stage 2.
pub fn binary_path(state: &WorkflowState) -> Option<PathBuf> {
    match state.stage_data(StepId::Compile) {
        Some(StageData::Compile { binary_path, .. }) => Some(PathBuf::from(binary_path)),
        _ => None,
    }
}

/// Wide validation params and sweep ranges from stage 4.
pub fn param_analysis(
    state: &WorkflowState,
) -> Option<(&BTreeMap<String, serde_json::Value>, &[OptimizationRange])> {
    match state.stage_data(StepId::AnalyzeParams) {
        Some(StageData::AnalyzeParams {
            wide_params,
            ranges,
        }) => Some((wide_params, ranges)),
        _ => None,
    }
}

/// Pass numbers chosen by stage 8b.
pub fn selected_passes(state: &WorkflowState) -> Option<&[i64]> {
    match state.stage_data(StepId::SelectPasses) {
        Some(StageData::SelectPasses { selected, .. }) => Some(selected),
        _ => None,
    }
}

/// Best replayed pass from stage 9.
pub fn best_pass(state: &WorkflowState) -> Option<&PassBacktest> {
    match state.stage_data(StepId::BacktestTop) {
        Some(StageData::BacktestTop { best, .. }) => Some(best),
        _ => None,
    }
}

/// Render a JSON value the way tester inputs are written.
pub fn render_param_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
