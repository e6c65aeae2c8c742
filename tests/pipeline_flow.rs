//! End-to-end pipeline scenarios against the in-memory simulator.

mod common;

use std::sync::Arc;

use stresslab::domain::{StageData, StepId, WorkflowStatus};
use stresslab::pipeline::{Executor, RunOutcome};
use stresslab::sim::dry_run::DryRunSimulator;
use stresslab::sim::{NullProgress, ProgressSink, Simulator};
use stresslab::store::RunStore;

use common::{make_executor, passing_simulator, sample_payload, sparse_simulator, test_config, write_sample_ea};

#[test]
fn happy_path_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    let sim: Arc<dyn Simulator> = Arc::new(passing_simulator());

    let mut executor = make_executor(&config, &store, Arc::clone(&sim), &ea);

    // Phase 1 runs up to the param-analysis pause
    let outcome = executor.run().unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Paused(WorkflowStatus::AwaitingParamAnalysis)
    );
    let state = executor.state();
    assert!(state.step_passed(StepId::LoadEa));
    assert!(state.step_passed(StepId::Compile));
    assert!(state.step_passed(StepId::ExtractParams));
    assert!(!state.steps.contains_key(&StepId::AnalyzeParams));

    // Extraction found the declared inputs
    match state.stage_data(StepId::ExtractParams) {
        Some(StageData::ExtractParams {
            params,
            optimizable,
        }) => {
            assert_eq!(params.len(), 5);
            assert_eq!(*optimizable, 3); // RsiPeriod, StopLossPips, Lots
        }
        other => panic!("unexpected extract data: {other:?}"),
    }

    // Supplying ranges resumes through to completion (auto pass selection)
    let outcome = executor.resume_with_params(sample_payload()).unwrap();
    assert_eq!(outcome, RunOutcome::Finished(WorkflowStatus::Completed));

    let state = executor.state();
    for id in [
        StepId::ValidateTrades,
        StepId::CreateIni,
        StepId::RunOptimization,
        StepId::ParseResults,
        StepId::SelectPasses,
        StepId::BacktestTop,
        StepId::MonteCarlo,
        StepId::GenerateReports,
        StepId::StressScenarios,
        StepId::ForwardWindows,
        StepId::MultiPair,
    ] {
        assert!(state.step_passed(id), "step {id} did not pass");
    }

    // All critical gates present and passed
    for gate in ["profit_factor", "max_drawdown", "minimum_trades", "mc_confidence", "mc_ruin"] {
        assert!(
            state.gates.get(gate).is_some_and(|g| g.passed),
            "gate {gate} missing or failed"
        );
    }

    // Composite score agrees with an independent recomputation from the same
    // metrics (the leaderboard relies on this)
    let metrics = state.metrics_snapshot();
    let back = state.metrics["back_result"];
    let forward = state.metrics["forward_result"];
    let expected = stresslab::engine::score::composite_score(
        &stresslab::engine::score::ScoreInput::from_metrics(&metrics, back, forward),
    );
    assert_eq!(state.composite_score, Some(expected));
    assert!(expected > 0.0 && expected <= 10.0);
    assert!(state.go_live.as_ref().unwrap().ready);

    // Monte Carlo on an always-profitable fixture is confident
    match state.stage_data(StepId::MonteCarlo) {
        Some(StageData::MonteCarlo { result, .. }) => {
            assert!(result.confidence_pct > 90.0);
            assert!(result.ruin_probability_pct < 10.0);
        }
        other => panic!("unexpected monte carlo data: {other:?}"),
    }

    // Aggregates were rebuilt by the report stage
    assert!(store.leaderboard_dir().join("data.json").exists());
    assert!(store.boards_dir().join("data.json").exists());
    assert!(store
        .dashboards_dir(&state.workflow_id)
        .join("data.json")
        .exists());

    // Only declared steps are ever recorded
    assert!(state.steps.keys().all(|id| StepId::ORDER.contains(id)));
}

#[test]
fn validation_failure_enters_the_repair_loop() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    // 20 trades misses the minimum of 50
    let sim: Arc<dyn Simulator> = Arc::new(sparse_simulator());

    let mut executor = make_executor(&config, &store, sim, &ea);
    executor.run().unwrap();
    let outcome = executor.resume_with_params(sample_payload()).unwrap();

    assert_eq!(outcome, RunOutcome::Paused(WorkflowStatus::AwaitingEaFix));
    let state = executor.state();
    assert_eq!(state.fix_attempts, 1);

    let fix = state.step_result(StepId::FixEa).unwrap();
    assert!(!fix.success);
    assert!(fix.errors[0].contains("20 trades < 50"));

    // The original EA was backed up before handing it to the fixer
    let backup = state.original_ea_backup.as_ref().unwrap();
    assert!(std::path::Path::new(backup).exists());

    // Nothing past validation ran
    assert!(!state.steps.contains_key(&StepId::CreateIni));
    assert!(!state.steps.contains_key(&StepId::RunOptimization));
}

#[test]
fn restart_after_fix_discards_derived_state_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);

    let failing: Arc<dyn Simulator> = Arc::new(sparse_simulator());
    let mut executor = make_executor(&config, &store, failing, &ea);
    executor.run().unwrap();
    executor.resume_with_params(sample_payload()).unwrap();
    let workflow_id = executor.state().workflow_id.clone();
    assert_eq!(executor.state().status, WorkflowStatus::AwaitingEaFix);

    // The "fixed" EA now trades plenty: reattach with a healthy simulator
    let progress: Arc<dyn ProgressSink> = Arc::new(NullProgress);
    let healthy: Arc<dyn Simulator> = Arc::new(passing_simulator());
    let mut resumed = Executor::load(
        config.clone(),
        store.clone(),
        healthy,
        progress,
        &workflow_id,
    )
    .unwrap();

    let outcome = resumed.restart_after_fix().unwrap();
    // The restart re-extracts and pauses for fresh parameter analysis
    assert_eq!(
        outcome,
        RunOutcome::Paused(WorkflowStatus::AwaitingParamAnalysis)
    );
    let state = resumed.state();
    assert_eq!(state.fix_attempts, 1);
    assert!(!state.steps.contains_key(&StepId::ValidateTrades));
    assert!(!state.steps.contains_key(&StepId::FixEa));

    let outcome = resumed.resume_with_params(sample_payload()).unwrap();
    assert_eq!(outcome, RunOutcome::Finished(WorkflowStatus::Completed));
}

#[test]
fn repair_attempts_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let mut config = test_config(&runs);
    config.max_fix_attempts = 1;
    let store = RunStore::new(&runs);
    let failing: Arc<dyn Simulator> = Arc::new(sparse_simulator());

    let mut executor = make_executor(&config, &store, Arc::clone(&failing), &ea);
    executor.run().unwrap();
    executor.resume_with_params(sample_payload()).unwrap();
    assert_eq!(executor.state().status, WorkflowStatus::AwaitingEaFix);

    // The fix didn't help; the second failure exhausts the budget
    let outcome = executor.restart_after_fix().unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Paused(WorkflowStatus::AwaitingParamAnalysis)
    );
    let outcome = executor.resume_with_params(sample_payload()).unwrap();
    assert_eq!(outcome, RunOutcome::Finished(WorkflowStatus::Failed));

    let state = executor.state();
    assert!(state.fix_attempts <= state.max_fix_attempts);
    // The diagnostic report stage still ran
    assert!(state.steps.contains_key(&StepId::GenerateReports));
    assert!(store
        .dashboards_dir(&state.workflow_id)
        .join("data.json")
        .exists());
}

#[test]
fn resume_with_params_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    let sim: Arc<dyn Simulator> = Arc::new(passing_simulator());

    let mut executor = make_executor(&config, &store, sim, &ea);
    executor.run().unwrap();

    let first = executor.resume_with_params(sample_payload()).unwrap();
    assert_eq!(first, RunOutcome::Finished(WorkflowStatus::Completed));
    let steps_after_first = executor.state().steps.clone();

    // Same payload again: a no-op, not an error, and steps are untouched
    let second = executor.resume_with_params(sample_payload()).unwrap();
    assert_eq!(second, RunOutcome::Finished(WorkflowStatus::Completed));
    assert_eq!(executor.state().steps, steps_after_first);

    // A different payload is rejected
    let mut altered = sample_payload();
    altered
        .wide_params
        .insert("RsiPeriod".to_string(), serde_json::json!(9));
    assert!(executor.resume_with_params(altered).is_err());
}

#[test]
fn invalid_resume_payload_leaves_state_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    let sim: Arc<dyn Simulator> = Arc::new(passing_simulator());

    let mut executor = make_executor(&config, &store, sim, &ea);
    executor.run().unwrap();

    // Inverted bounds fail structural validation
    let mut bad = sample_payload();
    bad.ranges[0].start = 50.0;
    bad.ranges[0].stop = 5.0;
    assert!(executor.resume_with_params(bad).is_err());

    let state = executor.state();
    assert_eq!(state.status, WorkflowStatus::AwaitingParamAnalysis);
    assert!(!state.steps.contains_key(&StepId::AnalyzeParams));

    // A valid payload still goes through afterwards
    let outcome = executor.resume_with_params(sample_payload()).unwrap();
    assert_eq!(outcome, RunOutcome::Finished(WorkflowStatus::Completed));
}

#[test]
fn compile_failure_fails_the_workflow_but_reports() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    let sim: Arc<dyn Simulator> = Arc::new(DryRunSimulator::failing_compile(vec![
        "'CTrade' - undeclared identifier".into(),
    ]));

    let mut executor = make_executor(&config, &store, sim, &ea);
    let outcome = executor.run().unwrap();
    assert_eq!(outcome, RunOutcome::Finished(WorkflowStatus::Failed));

    let state = executor.state();
    assert!(!state.step_passed(StepId::Compile));
    assert!(state.gates.get("compilation").is_some_and(|g| !g.passed));
    // Later stages were skipped, but the report stage still ran
    assert!(!state.steps.contains_key(&StepId::ExtractParams));
    assert!(state.steps.contains_key(&StepId::GenerateReports));
}

#[test]
fn multi_pair_records_children_and_spawns_cross_linked_workflows() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    let sim: Arc<dyn Simulator> = Arc::new(passing_simulator());

    let mut executor = make_executor(&config, &store, Arc::clone(&sim), &ea);
    executor.run().unwrap();
    executor.resume_with_params(sample_payload()).unwrap();

    // The parent symbol is GBPUSD, so both configured extras are recorded
    let specs = executor.child_specs();
    let symbols: Vec<&str> = specs.iter().map(|s| s.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["EURUSD", "USDJPY"]);

    let children = executor.spawn_children().unwrap();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(
            child.state().previous_workflow_id.as_deref(),
            Some(executor.state().workflow_id.as_str())
        );
    }

    // Children run sequentially and park at their own param-analysis pause
    for mut child in children {
        let outcome = child.run().unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Paused(WorkflowStatus::AwaitingParamAnalysis)
        );
    }
}

#[test]
fn state_survives_a_round_trip_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    let sim: Arc<dyn Simulator> = Arc::new(passing_simulator());

    let mut executor = make_executor(&config, &store, Arc::clone(&sim), &ea);
    executor.run().unwrap();
    executor.resume_with_params(sample_payload()).unwrap();

    let reloaded = store.load_state(&executor.state().workflow_id).unwrap();
    assert_eq!(&reloaded, executor.state());

    // Sidecars referenced from the state exist on disk
    match reloaded.stage_data(StepId::RunOptimization) {
        Some(StageData::RunOptimization { results_file, .. }) => {
            assert!(std::path::Path::new(results_file).exists());
        }
        other => panic!("unexpected optimization data: {other:?}"),
    }
    match reloaded.stage_data(StepId::BacktestTop) {
        Some(StageData::BacktestTop {
            best, results_file, ..
        }) => {
            assert!(std::path::Path::new(results_file).exists());
            assert!(best.metrics.profit > 0.0);
        }
        other => panic!("unexpected backtest data: {other:?}"),
    }
}

#[test]
fn stress_stage_enumerates_the_configured_suite() {
    let dir = tempfile::tempdir().unwrap();
    let ea = write_sample_ea(dir.path());
    let runs = dir.path().join("runs");
    let config = test_config(&runs);
    let store = RunStore::new(&runs);
    let sim: Arc<dyn Simulator> = Arc::new(passing_simulator());

    let mut executor = make_executor(&config, &store, sim, &ea);
    executor.run().unwrap();
    executor.resume_with_params(sample_payload()).unwrap();

    // One rolling window x one model, no overlays in the test config
    match executor.state().stage_data(StepId::StressScenarios) {
        Some(StageData::StressScenarios {
            scenario_count,
            base_count,
            overlay_count,
            results_file,
        }) => {
            assert_eq!(*scenario_count, 1);
            assert_eq!(*base_count, 1);
            assert_eq!(*overlay_count, 0);
            assert!(std::path::Path::new(results_file).exists());
        }
        other => panic!("unexpected stress data: {other:?}"),
    }
}
