//! Stages 4-5b: the param-analysis pause point, the validation backtest, and
//! the repair-loop pause point.

use garde::Validate;

use crate::domain::{GateOp, GateResult, StageData, StageResult, StepId, WorkflowState, WorkflowStatus};
use crate::engine::gates;
use crate::pipeline::stage::{report_name_for, ParamAnalysis, Stage, StageContext};
use crate::sim::{BacktestRequest, Simulator};

use super::{binary_path, param_analysis, render_param_value};

/// Stage 4: waits for externally-supplied parameter intelligence. Without a
/// payload the pipeline parks at `awaiting_param_analysis`; with one, the
/// payload is validated and recorded.
pub struct AnalyzeParamsStage {
    pub payload: Option<ParamAnalysis>,
}

impl Stage for AnalyzeParamsStage {
    fn id(&self) -> StepId {
        StepId::AnalyzeParams
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::ExtractParams]
    }

    fn pause(&self, _state: &WorkflowState, _ctx: &StageContext<'_>) -> Option<WorkflowStatus> {
        self.payload
            .is_none()
            .then_some(WorkflowStatus::AwaitingParamAnalysis)
    }

    fn execute(
        &self,
        _state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        _ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(payload) = &self.payload else {
            return StageResult::fail("no parameter analysis payload supplied");
        };
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

        let gate = GateResult::new(
            "params_analyzed",
            payload.ranges.len() as f64,
            GateOp::Ge,
            1.0,
        );
        StageResult::ok_gated(
            StageData::AnalyzeParams {
                wide_params: payload.wide_params.clone(),
                ranges: payload.ranges.clone(),
            },
            gate,
        )
    }
}

/// Stage 5: a quick replay with the wide parameter set to prove the EA trades
/// at all before spending hours on optimization.
pub struct ValidateTradesStage;

impl Stage for ValidateTradesStage {
    fn id(&self) -> StepId {
        StepId::ValidateTrades
    }

    fn dependencies(&self) -> &'static [StepId] {
        &[StepId::Compile, StepId::AnalyzeParams]
    }

    fn execute(
        &self,
        state: &WorkflowState,
        simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let Some(simulator) = simulator else {
            return StageResult::fail("no simulator available for the validation backtest");
        };
        let Some(binary) = binary_path(state) else {
            return StageResult::fail("no compiled EA");
        };
        let Some((wide_params, _)) = param_analysis(state) else {
            return StageResult::fail("no analyzed parameters");
        };

        let mut request = BacktestRequest::new(binary, &state.symbol, &state.timeframe);
        request.params = wide_params
            .iter()
            .map(|(name, value)| (name.clone(), render_param_value(value)))
            .collect();
        request.report_name = Some(report_name_for(
            &state.workflow_id,
            self.id(),
            &state.symbol,
            &state.timeframe,
            None,
        ));
        request.timeout = std::time::Duration::from_secs(ctx.config.backtest_timeout_s);

        let outcome = simulator.backtest(&request);
        if !outcome.success {
            return StageResult {
                success: false,
                data: None,
                gate: None,
                errors: outcome.errors,
            };
        }

        let gate = gates::minimum_trades(outcome.metrics.total_trades, &ctx.config.gates);
        StageResult::ok_gated(
            StageData::ValidateTrades {
                total_trades: outcome.metrics.total_trades,
                profit: outcome.metrics.profit,
                report_path: outcome.report_path.map(|p| p.display().to_string()),
            },
            gate,
        )
    }
}

/// Stage 5b: the repair-loop pause point. Records the attempt and signals the
/// executor to park at `awaiting_ea_fix` while a fix is applied externally.
/// Never performs fixes itself.
pub struct FixEaStage;

impl Stage for FixEaStage {
    fn id(&self) -> StepId {
        StepId::FixEa
    }

    fn execute(
        &self,
        state: &WorkflowState,
        _simulator: Option<&dyn Simulator>,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let validation_trades = match state.stage_data(StepId::ValidateTrades) {
            Some(StageData::ValidateTrades { total_trades, .. }) => *total_trades,
            _ => 0,
        };
        let max = ctx.config.max_fix_attempts;
        let attempts = state.fix_attempts;
        let gate = gates::minimum_trades(validation_trades, &ctx.config.gates);
        let awaiting = attempts < max;

        let error = if awaiting {
            format!(
                "attempt {}/{max}: EA needs a fix ({validation_trades} trades < {} minimum); \
                 workflow paused for an external fix",
                attempts + 1,
                ctx.config.gates.min_trades
            )
        } else {
            format!(
                "max fix attempts ({max}) exhausted; EA still produces only \
                 {validation_trades} trades"
            )
        };

        StageResult {
            success: false,
            data: Some(StageData::FixEa {
                fix_attempts: if awaiting { attempts + 1 } else { attempts },
                max_fix_attempts: max,
                validation_trades,
                ea_path: state.ea_path.clone(),
                awaiting_fix: awaiting,
            }),
            gate: Some(gate),
            errors: vec![error],
        }
    }
}
