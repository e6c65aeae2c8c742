//! The workflow executor: drives stages in declared order, enforces gates,
//! persists state after every stage, parks at the human-in-the-loop pause
//! points, and runs the bounded repair loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, Utc};
use garde::Validate;

use crate::config::Config;
use crate::domain::{
    PassRecord, StageData, StageResult, StepId, WorkflowState, WorkflowStatus,
};
use crate::engine::gates;
use crate::pipeline::stage::{ParamAnalysis, PassSelection, Stage, StageContext};
use crate::pipeline::stages::{
    self, AnalyzeParamsStage, BacktestTopStage, CompileStage, CreateIniStage, ExtractParamsStage,
    FixEaStage, ForwardWindowsStage, GenerateReportsStage, InjectOnTesterStage, InjectSafetyStage,
    LoadEaStage, MonteCarloStage, MultiPairStage, ParseResultsStage, RunOptimizationStage,
    SelectPassesStage, StressScenariosStage, ValidateTradesStage,
};
use crate::sim::{ProgressSink, Simulator};
use crate::store::RunStore;

/// What a new workflow runs against.
#[derive(Debug, Clone)]
pub struct WorkflowSpec {
    pub ea_path: PathBuf,
    pub symbol: String,
    pub timeframe: String,
}

/// How a driver call ended: parked at a pause point, or terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Paused(WorkflowStatus),
    Finished(WorkflowStatus),
}

pub struct Executor {
    config: Config,
    store: RunStore,
    simulator: Arc<dyn Simulator>,
    progress: Arc<dyn ProgressSink>,
    state: WorkflowState,
    pending_params: Option<ParamAnalysis>,
    pending_selection: Option<PassSelection>,
    today: NaiveDate,
}

impl Executor {
    /// Start a fresh workflow and persist its initial state.
    pub fn new(
        config: Config,
        store: RunStore,
        simulator: Arc<dyn Simulator>,
        progress: Arc<dyn ProgressSink>,
        spec: &WorkflowSpec,
    ) -> Result<Self> {
        Self::create(config, store, simulator, progress, spec, None)
    }

    /// Start a child workflow cross-linked to its parent.
    pub fn new_child(
        config: Config,
        store: RunStore,
        simulator: Arc<dyn Simulator>,
        progress: Arc<dyn ProgressSink>,
        spec: &WorkflowSpec,
        previous_workflow_id: &str,
    ) -> Result<Self> {
        Self::create(
            config,
            store,
            simulator,
            progress,
            spec,
            Some(previous_workflow_id.to_string()),
        )
    }

    fn create(
        config: Config,
        store: RunStore,
        simulator: Arc<dyn Simulator>,
        progress: Arc<dyn ProgressSink>,
        spec: &WorkflowSpec,
        previous_workflow_id: Option<String>,
    ) -> Result<Self> {
        let ea_name = spec
            .ea_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("EA path has no file name")?;
        let today = Local::now().date_naive();
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let workflow_id = format!("{ea_name}_{}_{timestamp}", spec.symbol);

        let terminal_id = config
            .terminal()
            .map_or_else(|| "dry_run".to_string(), |t| t.id.clone());
        let now = Utc::now();

        let state = WorkflowState {
            workflow_id,
            ea_name,
            ea_path: spec.ea_path.display().to_string(),
            symbol: spec.symbol.clone(),
            timeframe: spec.timeframe.clone(),
            terminal_id,
            status: WorkflowStatus::Pending,
            current_step: None,
            steps: BTreeMap::new(),
            metrics: BTreeMap::new(),
            gates: BTreeMap::new(),
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            fix_attempts: 0,
            max_fix_attempts: config.max_fix_attempts,
            previous_workflow_id,
            backtest_dates: config.backtest_dates(today),
            composite_score: None,
            go_live: None,
            original_ea_backup: None,
        };
        store.save_state(&state)?;

        Ok(Self {
            config,
            store,
            simulator,
            progress,
            state,
            pending_params: None,
            pending_selection: None,
            today,
        })
    }

    /// Reattach to a persisted workflow.
    pub fn load(
        config: Config,
        store: RunStore,
        simulator: Arc<dyn Simulator>,
        progress: Arc<dyn ProgressSink>,
        workflow_id: &str,
    ) -> Result<Self> {
        let state = store.load_state(workflow_id)?;
        Ok(Self {
            config,
            store,
            simulator,
            progress,
            state,
            pending_params: None,
            pending_selection: None,
            today: Local::now().date_naive(),
        })
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Run from the beginning (or from where a previous session stopped)
    /// until a pause point or a terminal status.
    pub fn run(&mut self) -> Result<RunOutcome> {
        if self.state.status.is_terminal() {
            bail!(
                "workflow {} already finished with status {:?}",
                self.state.workflow_id,
                self.state.status
            );
        }
        if self.state.status.is_awaiting() {
            bail!(
                "workflow {} is paused ({:?}); resume it instead",
                self.state.workflow_id,
                self.state.status
            );
        }
        self.state.status = WorkflowStatus::InProgress;
        self.advance()
    }

    /// Resume the param-analysis pause with an external payload. Invalid
    /// payloads are rejected without touching state; an identical repeat of an
    /// already-applied payload is a no-op.
    pub fn resume_with_params(&mut self, payload: ParamAnalysis) -> Result<RunOutcome> {
        if self.state.status != WorkflowStatus::AwaitingParamAnalysis {
            if let Some(StageData::AnalyzeParams {
                wide_params,
                ranges,
            }) = self.state.stage_data(StepId::AnalyzeParams)
            {
                if *wide_params == payload.wide_params && *ranges == payload.ranges {
                    return Ok(self.current_outcome());
                }
            }
            bail!(
                "workflow {} is not awaiting parameter analysis (status {:?})",
                self.state.workflow_id,
                self.state.status
            );
        }

        payload
            .validate()
            .map_err(|report| anyhow::anyhow!("invalid parameter analysis: {report}"))?;

        self.pending_params = Some(payload);
        self.state.status = WorkflowStatus::InProgress;
        self.advance()
    }

    /// Resume the stats-analysis pause with an external pass selection.
    pub fn resume_with_passes(&mut self, payload: PassSelection) -> Result<RunOutcome> {
        if self.state.status != WorkflowStatus::AwaitingStatsAnalysis {
            if let Some(StageData::SelectPasses { selected, .. }) =
                self.state.stage_data(StepId::SelectPasses)
            {
                if *selected == payload.selected {
                    return Ok(self.current_outcome());
                }
            }
            bail!(
                "workflow {} is not awaiting stats analysis (status {:?})",
                self.state.workflow_id,
                self.state.status
            );
        }

        payload
            .validate()
            .map_err(|report| anyhow::anyhow!("invalid pass selection: {report}"))?;
        // Semantic validation up front so a bad payload leaves state untouched
        let passes: Vec<PassRecord> = self
            .store
            .load_sidecar(&self.state.workflow_id, stages::OPTIMIZATION_SIDECAR)?;
        let known: std::collections::BTreeSet<i64> =
            passes.iter().filter_map(|p| p.pass).collect();
        let unknown: Vec<i64> = payload
            .selected
            .iter()
            .copied()
            .filter(|n| !known.contains(n))
            .collect();
        if !unknown.is_empty() {
            bail!("pass selection references unknown passes: {unknown:?}");
        }

        self.pending_selection = Some(payload);
        self.state.status = WorkflowStatus::InProgress;
        self.advance()
    }

    /// Re-enter the pipeline after an external EA fix: derived results are
    /// discarded and the workflow re-runs from the top, because the fix likely
    /// changed the parameter surface.
    pub fn restart_after_fix(&mut self) -> Result<RunOutcome> {
        if self.state.status != WorkflowStatus::AwaitingEaFix {
            bail!(
                "workflow {} is not awaiting an EA fix (status {:?})",
                self.state.workflow_id,
                self.state.status
            );
        }

        // The instrumented copy was built from the pre-fix source; remove it
        // (and its binary) so the re-run can't pick up stale artifacts
        if let Some(modified) = stages::modified_ea_path(&self.state) {
            if crate::mql::injector::remove_modified_ea(&modified) {
                tracing::debug!(path = %modified.display(), "removed stale instrumented EA copy");
            }
        }

        self.state.steps.retain(|id, _| *id == StepId::LoadEa);
        self.state.current_step = None;
        self.state.gates.clear();
        self.state.metrics.clear();
        self.pending_params = None;
        self.pending_selection = None;
        self.state.status = WorkflowStatus::InProgress;
        self.persist()?;
        self.advance()
    }

    /// Child workflow specs emitted by stage 14 (empty until it has run).
    pub fn child_specs(&self) -> Vec<WorkflowSpec> {
        match self.state.stage_data(StepId::MultiPair) {
            Some(StageData::MultiPair { symbols, .. }) => symbols
                .iter()
                .map(|symbol| WorkflowSpec {
                    ea_path: PathBuf::from(&self.state.ea_path),
                    symbol: symbol.clone(),
                    timeframe: self.state.timeframe.clone(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Create (but do not run) child executors for the stage-14 records.
    /// Children run strictly sequentially: the simulator install is a
    /// single-owner resource.
    pub fn spawn_children(&self) -> Result<Vec<Executor>> {
        self.child_specs()
            .iter()
            .map(|spec| {
                Executor::new_child(
                    self.config.clone(),
                    self.store.clone(),
                    Arc::clone(&self.simulator),
                    Arc::clone(&self.progress),
                    spec,
                    &self.state.workflow_id,
                )
            })
            .collect()
    }

    fn current_outcome(&self) -> RunOutcome {
        if self.state.status.is_awaiting() {
            RunOutcome::Paused(self.state.status)
        } else {
            RunOutcome::Finished(self.state.status)
        }
    }

    fn advance(&mut self) -> Result<RunOutcome> {
        let mut failed = self
            .state
            .steps
            .iter()
            .any(|(id, r)| !r.success && *id != StepId::FixEa);

        for id in StepId::ORDER {
            if self.state.steps.contains_key(&id) {
                continue;
            }
            // The repair stage only runs through the validation-failure path
            if id == StepId::FixEa {
                continue;
            }
            // After a failure, skip ahead to report generation and stop there
            if failed && id != StepId::GenerateReports {
                continue;
            }

            let stage = self.make_stage(id);

            if !failed {
                let pause = {
                    let ctx = self.context();
                    stage.pause(&self.state, &ctx)
                };
                if let Some(status) = pause {
                    self.state.status = status;
                    self.persist()?;
                    tracing::info!(step = %id, ?status, "workflow paused");
                    return Ok(RunOutcome::Paused(status));
                }
            }

            let unmet = stage
                .dependencies()
                .iter()
                .find(|dep| !self.state.step_passed(**dep))
                .copied();
            let result = match unmet {
                Some(dep) => StageResult::fail(format!(
                    "precondition missing: dependency {dep} did not pass"
                )),
                None => {
                    tracing::info!(step = %id, "starting stage");
                    let ctx = self.context();
                    stage.execute(&self.state, self.simulator_for(id), &ctx)
                }
            };

            let passed = result.success;
            self.record(id, result)?;
            tracing::info!(step = %id, passed, "stage finished");

            if !passed {
                if id == StepId::ValidateTrades {
                    match self.repair()? {
                        Some(outcome) => return Ok(outcome),
                        None => {
                            failed = true;
                            continue;
                        }
                    }
                }
                failed = true;
                if id == StepId::GenerateReports {
                    break;
                }
            }
        }

        let status = if failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        self.state.status = status;
        self.persist()?;
        tracing::info!(workflow = %self.state.workflow_id, ?status, "workflow finished");
        Ok(RunOutcome::Finished(status))
    }

    /// The bounded repair loop. Returns the pause outcome while attempts
    /// remain, or `None` when the budget is exhausted and the workflow should
    /// fail.
    fn repair(&mut self) -> Result<Option<RunOutcome>> {
        let stage = FixEaStage;
        let result = {
            let ctx = self.context();
            stage.execute(&self.state, None, &ctx)
        };

        let (attempts, awaiting) = match &result.data {
            Some(StageData::FixEa {
                fix_attempts,
                awaiting_fix,
                ..
            }) => (*fix_attempts, *awaiting_fix),
            _ => (self.state.fix_attempts, false),
        };
        self.record(StepId::FixEa, result)?;

        if awaiting {
            self.state.fix_attempts = attempts;
            self.backup_original_ea()?;
            self.state.status = WorkflowStatus::AwaitingEaFix;
            self.persist()?;
            tracing::info!(
                attempts,
                max = self.state.max_fix_attempts,
                "workflow paused for an EA fix"
            );
            Ok(Some(RunOutcome::Paused(WorkflowStatus::AwaitingEaFix)))
        } else {
            Ok(None)
        }
    }

    /// Keep a pristine copy of the EA before an external fix touches it.
    fn backup_original_ea(&mut self) -> Result<()> {
        if self.state.original_ea_backup.is_some() {
            return Ok(());
        }
        let source = PathBuf::from(&self.state.ea_path);
        if !source.exists() {
            return Ok(());
        }
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ea".into());
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mq5".into());
        let backup = source.with_file_name(format!("{stem}_original.{ext}"));
        std::fs::copy(&source, &backup)
            .with_context(|| format!("backing up EA to {}", backup.display()))?;
        self.state.original_ea_backup = Some(backup.display().to_string());
        Ok(())
    }

    fn context(&self) -> StageContext<'_> {
        StageContext {
            config: &self.config,
            store: &self.store,
            progress: self.progress.as_ref(),
            today: self.today,
        }
    }

    fn simulator_for(&self, id: StepId) -> Option<&dyn Simulator> {
        match id {
            StepId::Compile
            | StepId::ValidateTrades
            | StepId::RunOptimization
            | StepId::BacktestTop
            | StepId::StressScenarios => Some(self.simulator.as_ref()),
            _ => None,
        }
    }

    fn make_stage(&self, id: StepId) -> Box<dyn Stage> {
        match id {
            StepId::LoadEa => Box::new(LoadEaStage),
            StepId::InjectOnTester => Box::new(InjectOnTesterStage),
            StepId::InjectSafety => Box::new(InjectSafetyStage),
            StepId::Compile => Box::new(CompileStage),
            StepId::ExtractParams => Box::new(ExtractParamsStage),
            StepId::AnalyzeParams => Box::new(AnalyzeParamsStage {
                payload: self.pending_params.clone(),
            }),
            StepId::ValidateTrades => Box::new(ValidateTradesStage),
            StepId::FixEa => Box::new(FixEaStage),
            StepId::CreateIni => Box::new(CreateIniStage),
            StepId::RunOptimization => Box::new(RunOptimizationStage),
            StepId::ParseResults => Box::new(ParseResultsStage),
            StepId::SelectPasses => Box::new(SelectPassesStage {
                payload: self.pending_selection.clone(),
            }),
            StepId::BacktestTop => Box::new(BacktestTopStage),
            StepId::MonteCarlo => Box::new(MonteCarloStage),
            StepId::GenerateReports => Box::new(GenerateReportsStage),
            StepId::StressScenarios => Box::new(StressScenariosStage),
            StepId::ForwardWindows => Box::new(ForwardWindowsStage),
            StepId::MultiPair => Box::new(MultiPairStage),
        }
    }

    /// Persist a stage result and fold its gates/metrics into the state.
    /// Results are immutable once written; resume reads them back verbatim.
    fn record(&mut self, id: StepId, result: StageResult) -> Result<()> {
        if let Some(gate) = &result.gate {
            self.state.gates.insert(gate.name.clone(), gate.clone());
        }
        if let Some(data) = &result.data {
            for gate in data.bundled_gates() {
                self.state.gates.insert(gate.name.clone(), gate.clone());
            }
            self.merge_metrics(data);
        }
        for error in &result.errors {
            self.state.record_error(id, error.clone());
        }

        self.state.current_step = Some(id);
        self.state.steps.insert(id, result);

        if id == StepId::GenerateReports {
            let score = match self.state.stage_data(StepId::GenerateReports) {
                Some(StageData::GenerateReports {
                    composite_score, ..
                }) => Some(*composite_score),
                _ => None,
            };
            self.state.composite_score = score;
            self.state.go_live = Some(gates::go_live_ready(&self.state.gates));
        }

        self.persist()
    }

    fn merge_metrics(&mut self, data: &StageData) {
        match data {
            StageData::BacktestTop { best, .. } => {
                self.state.metrics.extend(best.metrics.to_map());
                self.state
                    .metrics
                    .insert("back_result".into(), best.back_result);
                self.state
                    .metrics
                    .insert("forward_result".into(), best.forward_result);

                // Average win/loss sizes feed the profit-factor diagnosis
                let m = &best.metrics;
                let winning = (m.total_trades as f64 * m.win_rate / 100.0).round();
                let losing = (m.total_trades as f64 - winning).max(0.0);
                if winning > 0.0 {
                    self.state
                        .metrics
                        .insert("avg_win".into(), m.gross_profit / winning);
                }
                if losing > 0.0 {
                    self.state
                        .metrics
                        .insert("avg_loss".into(), -(m.gross_loss.abs() / losing));
                }
            }
            StageData::MonteCarlo { result, .. } => {
                self.state
                    .metrics
                    .insert("mc_confidence".into(), result.confidence_pct);
                self.state
                    .metrics
                    .insert("mc_ruin_probability".into(), result.ruin_probability_pct);
            }
            _ => {}
        }
    }

    fn persist(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        self.store.save_state(&self.state)?;
        Ok(())
    }
}

/// Drive several workflows one after another. Parallel workflows would race
/// on the simulator install, so batching is strictly sequential.
pub fn run_batch(
    config: &Config,
    store: &RunStore,
    simulator: &Arc<dyn Simulator>,
    progress: &Arc<dyn ProgressSink>,
    specs: &[WorkflowSpec],
) -> Result<Vec<(String, RunOutcome)>> {
    let mut outcomes = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut executor = Executor::new(
            config.clone(),
            store.clone(),
            Arc::clone(simulator),
            Arc::clone(progress),
            spec,
        )?;
        let outcome = executor.run()?;
        outcomes.push((executor.state().workflow_id.clone(), outcome));
    }
    Ok(outcomes)
}
