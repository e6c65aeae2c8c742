use std::collections::BTreeMap;

use chrono::NaiveDate;
use garde::Validate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::domain::{OptimizationRange, StageResult, StepId, WorkflowState, WorkflowStatus};
use crate::engine::stress::sanitize_id;
use crate::sim::{ProgressSink, Simulator};
use crate::store::RunStore;

/// Read-only context handed to every stage.
pub struct StageContext<'a> {
    pub config: &'a Config,
    pub store: &'a RunStore,
    pub progress: &'a dyn ProgressSink,
    /// Wall-clock date, pinned once per executor so a run is internally
    /// consistent.
    pub today: NaiveDate,
}

/// One pipeline step. Stages are pure functions of prior state plus context;
/// all mutation happens in the executor.
pub trait Stage {
    fn id(&self) -> StepId;

    /// Steps whose results must exist and have passed before this one runs.
    fn dependencies(&self) -> &'static [StepId] {
        &[]
    }

    /// When `Some`, the executor pauses the workflow with this status instead
    /// of executing (human-in-the-loop steps waiting for their payload).
    fn pause(&self, _state: &WorkflowState, _ctx: &StageContext<'_>) -> Option<WorkflowStatus> {
        None
    }

    fn execute(
        &self,
        state: &WorkflowState,
        simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult;
}

/// External payload resuming the param-analysis pause: values that maximize
/// trade count for validation, and the sweep ranges for optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ParamAnalysis {
    #[garde(custom(non_empty_params))]
    pub wide_params: BTreeMap<String, serde_json::Value>,
    #[garde(length(min = 1), dive)]
    pub ranges: Vec<OptimizationRange>,
}

fn non_empty_params(
    params: &BTreeMap<String, serde_json::Value>,
    _ctx: &(),
) -> garde::Result {
    if params.is_empty() {
        return Err(garde::Error::new("wide_params must not be empty"));
    }
    Ok(())
}

/// External payload resuming the stats-analysis pause: pass numbers to carry
/// into the detailed replay, in preference order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PassSelection {
    #[garde(length(min = 1))]
    pub selected: Vec<i64>,
    #[serde(default)]
    #[garde(skip)]
    pub notes: Option<String>,
}

/// Deterministic report name for a simulator call: derived only from the
/// workflow id, stage, symbol/timeframe, and an optional discriminator, then
/// shortened with a digest so distinct inputs can't collide after truncation.
pub fn report_name_for(
    workflow_id: &str,
    step: StepId,
    symbol: &str,
    timeframe: &str,
    discriminator: Option<&str>,
) -> String {
    let step_token = sanitize_id(step.as_str(), 20);
    let full = match discriminator {
        Some(d) => format!("{workflow_id}:{step_token}:{symbol}:{timeframe}:{d}"),
        None => format!("{workflow_id}:{step_token}:{symbol}:{timeframe}"),
    };
    let digest = Sha256::digest(full.as_bytes());
    let suffix = hex::encode(&digest[..4]);

    let wf_short = sanitize_id(workflow_id, 24);
    let base = match discriminator {
        Some(d) => format!("{wf_short}_{step_token}_{}_{suffix}", sanitize_id(d, 10)),
        None => format!("{wf_short}_{step_token}_{suffix}"),
    };
    sanitize_id(&base, 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_names_are_deterministic() {
        let a = report_name_for("Demo_20260701_120000", StepId::ValidateTrades, "GBPUSD", "H1", None);
        let b = report_name_for("Demo_20260701_120000", StepId::ValidateTrades, "GBPUSD", "H1", None);
        assert_eq!(a, b);
        assert!(a.len() <= 60);
    }

    #[test]
    fn report_names_distinguish_discriminators() {
        let p1 = report_name_for("wf", StepId::BacktestTop, "GBPUSD", "H1", Some("pass_17"));
        let p2 = report_name_for("wf", StepId::BacktestTop, "GBPUSD", "H1", Some("pass_18"));
        assert_ne!(p1, p2);
    }

    #[test]
    fn long_workflow_ids_shorten_without_collision() {
        let long_a = "A".repeat(120) + "_one";
        let long_b = "A".repeat(120) + "_two";
        let a = report_name_for(&long_a, StepId::RunOptimization, "GBPUSD", "H1", None);
        let b = report_name_for(&long_b, StepId::RunOptimization, "GBPUSD", "H1", None);
        assert_ne!(a, b);
        assert!(a.len() <= 60);
    }

    #[test]
    fn param_analysis_validation() {
        let empty = ParamAnalysis {
            wide_params: BTreeMap::new(),
            ranges: vec![OptimizationRange::sweep("Period", 5.0, 1.0, 50.0)],
        };
        assert!(empty.validate().is_err());

        let mut wide = BTreeMap::new();
        wide.insert("Period".to_string(), serde_json::json!(5));
        let no_ranges = ParamAnalysis {
            wide_params: wide.clone(),
            ranges: vec![],
        };
        assert!(no_ranges.validate().is_err());

        let bad_range = ParamAnalysis {
            wide_params: wide.clone(),
            ranges: vec![OptimizationRange::sweep("Period", 50.0, 1.0, 5.0)],
        };
        assert!(bad_range.validate().is_err());

        let good = ParamAnalysis {
            wide_params: wide,
            ranges: vec![OptimizationRange::sweep("Period", 5.0, 1.0, 50.0)],
        };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn pass_selection_validation() {
        assert!(PassSelection {
            selected: vec![],
            notes: None
        }
        .validate()
        .is_err());
        assert!(PassSelection {
            selected: vec![3, 17],
            notes: Some("stable cluster".into())
        }
        .validate()
        .is_ok());
    }
}
