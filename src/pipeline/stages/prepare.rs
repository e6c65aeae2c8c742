//! Stages 1-3: load, instrument, compile, extract parameters.

use std::path::Path;

use crate::domain::{StageData, StageResult, StepId, WorkflowState};
use crate::engine::gates;
use crate::mql::{injector, params};
use crate::pipeline::stage::{Stage, StageContext};
use crate::sim::Simulator;

use super::modified_ea_path;

/// Stage 1: verify the EA source exists.
pub struct LoadEaStage;

impl Stage for LoadEaStage {
    fn id(&self) -> StepId {
        StepId::LoadEa
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        _ctx: &StageContext<'_>,
    ) -> StageResult {
        let gate = gates::file_exists(Path::new(&state.ea_path));
        StageResult::ok_gated(
            StageData::LoadEa {
                path: state.ea_path.clone(),
            },
            gate,
        )
    }
}

/// Stage 1b: write the instrumented working copy with the custom criterion.
pub struct InjectOnTesterStage;

impl Stage for InjectOnTesterStage {
    fn id(&self) -> StepId {
        StepId::InjectOnTester
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::LoadEa]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        match injector::create_modified_ea(
            Path::new(&state.ea_path),
            true,
            false,
            ctx.config.ontester_min_trades,
        ) {
            Ok(outcome) => StageResult::ok(StageData::InjectOnTester {
                modified_path: outcome.modified_path.display().to_string(),
                injected: outcome.ontester_injected,
            }),
            Err(e) => StageResult::fail(format!("criterion injection failed: {e}")),
        }
    }
}

/// Stage 1c: add the guard blocks and trade-safety inputs to the working copy.
pub struct InjectSafetyStage;

impl Stage for InjectSafetyStage {
    fn id(&self) -> StepId {
        StepId::InjectSafety
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::InjectOnTester]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        _ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(path) = modified_ea_path(state) else {
            return StageResult::fail("no instrumented EA from the previous step");
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return StageResult::fail(format!("reading {}: {e}", path.display())),
        };
        let (content, injected) = injector::inject_safety(&content);
        if let Err(e) = std::fs::write(&path, content) {
            return StageResult::fail(format!("writing {}: {e}", path.display()));
        }
        StageResult::ok(StageData::InjectSafety {
            modified_path: path.display().to_string(),
            injected,
        })
    }
}

/// Stage 2: compile the instrumented copy.
pub struct CompileStage;

impl Stage for CompileStage {
    fn id(&self) -> StepId {
        StepId::Compile
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::InjectSafety]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        simulator: Option<&dyn Simulator>,
        _ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(simulator) = simulator else {
            return StageResult::fail("no simulator available for compilation");
        };
        let source = modified_ea_path(state)
            .unwrap_or_else(|| std::path::PathBuf::from(&state.ea_path));

        let outcome = simulator.compile(&source);
        let gate = gates::compilation(outcome.success, outcome.errors.len());

        if outcome.success {
            let binary = outcome
                .binary_path
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            StageResult::ok_gated(
                StageData::Compile {
                    binary_path: binary,
                    warnings: outcome.warnings,
                },
                gate,
            )
        } else {
            StageResult {
                success: false,
                data: None,
                gate: Some(gate),
                errors: outcome.errors,
            }
        }
    }
}

/// Stage 3: extract the tunable input surface from the original source.
pub struct ExtractParamsStage;

impl Stage for ExtractParamsStage {
    fn id(&self) -> StepId {
        StepId::ExtractParams
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::Compile]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        _ctx: &StageContext<'_>,
    ) -> StageResult {
        let extracted = match params::extract_params(Path::new(&state.ea_path)) {
            Ok(extracted) => extracted,
            Err(e) => return StageResult::fail(format!("parameter extraction failed: {e}")),
        };
        let optimizable = extracted.iter().filter(|p| p.optimizable).count();
        let gate = gates::params_found(extracted.len(), optimizable);
        StageResult::ok_gated(
            StageData::ExtractParams {
                params: extracted,
                optimizable,
            },
            gate,
        )
    }
}
