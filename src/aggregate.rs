//! Read-only aggregation over the state store: the per-workflow dashboard
//! payload, the cross-workflow leaderboard, and the boards index. Scores are
//! recomputed with the same engine the pipeline gates use, so the two can
//! never disagree.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::domain::{
    GoLiveCheck, PassBacktestSet, PassRecord, StageData, StepId, WorkflowState, WorkflowStatus,
};
use crate::engine::score::{self, ScoreInput};
use crate::store::RunStore;

/// Minimal static shell; the data sidecar is the real artifact and the
/// presentation layer renders from it.
const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{{TITLE}}</title>
</head>
<body>
<h1>{{TITLE}}</h1>
<pre id="data">Loading...</pre>
<script>
const DATA = {{DATA_JSON}};
document.getElementById('data').textContent = JSON.stringify(DATA, null, 2);
</script>
</body>
</html>
"#;

fn render_page(title: &str, data: &serde_json::Value) -> String {
    PAGE_TEMPLATE
        .replace("{{TITLE}}", title)
        .replace("{{DATA_JSON}}", &serde_json::to_string_pretty(data).unwrap_or_default())
}

fn write_board(dir: &PathBuf, title: &str, data: &serde_json::Value) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("data.json"), serde_json::to_vec_pretty(data)?)?;
    let index = dir.join("index.html");
    std::fs::write(&index, render_page(title, data))?;
    Ok(index)
}

/// One leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub workflow_id: String,
    pub ea_name: String,
    pub symbol: String,
    pub timeframe: String,
    pub pass_num: i64,
    pub score: f64,
    pub profit: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: u64,
    pub win_rate: f64,
    pub back_result: f64,
    pub forward_result: f64,
    pub consistent: bool,
    /// Where the metrics came from: a detailed replay or the raw sweep.
    pub source: String,
}

/// Workflows that should not contribute to the leaderboard.
fn excluded(status: WorkflowStatus) -> bool {
    matches!(status, WorkflowStatus::Failed | WorkflowStatus::Pending) || status.is_awaiting()
}

/// Best-pass rows for one workflow: the stage-9 replays when present, else
/// the top of the stage-7 sweep.
fn extract_top_passes(
    store: &RunStore,
    state: &WorkflowState,
    per_workflow: usize,
) -> Vec<LeaderboardEntry> {
    let mut entries = Vec::new();

    if let Ok(set) = store.load_sidecar::<PassBacktestSet>(&state.workflow_id, "backtests") {
        for replay in set.all.iter().take(per_workflow) {
            let input = ScoreInput::from_metrics(
                &replay.metrics,
                replay.back_result,
                replay.forward_result,
            );
            entries.push(LeaderboardEntry {
                rank: 0,
                workflow_id: state.workflow_id.clone(),
                ea_name: state.ea_name.clone(),
                symbol: state.symbol.clone(),
                timeframe: state.timeframe.clone(),
                pass_num: replay.pass_num,
                score: score::score_with_bonus(&input),
                profit: replay.metrics.profit,
                profit_factor: replay.metrics.profit_factor,
                max_drawdown_pct: replay.metrics.max_drawdown_pct,
                total_trades: replay.metrics.total_trades,
                win_rate: replay.metrics.win_rate,
                back_result: replay.back_result,
                forward_result: replay.forward_result,
                consistent: replay.back_result > 0.0 && replay.forward_result > 0.0,
                source: "backtest".into(),
            });
        }
        if !entries.is_empty() {
            return entries;
        }
    }

    if let Ok(passes) = store.load_sidecar::<Vec<PassRecord>>(&state.workflow_id, "optimization") {
        for pass in passes.iter().take(per_workflow) {
            let Some(pass_num) = pass.pass else { continue };
            let (back, forward) = pass.segment_results();
            entries.push(LeaderboardEntry {
                rank: 0,
                workflow_id: state.workflow_id.clone(),
                ea_name: state.ea_name.clone(),
                symbol: state.symbol.clone(),
                timeframe: state.timeframe.clone(),
                pass_num,
                score: score::pass_score(pass),
                profit: pass.profit,
                profit_factor: pass.profit_factor,
                max_drawdown_pct: pass.max_drawdown_pct,
                total_trades: pass.total_trades,
                win_rate: pass.win_rate,
                back_result: back,
                forward_result: forward,
                consistent: back > 0.0 && forward > 0.0,
                source: "optimization".into(),
            });
        }
    }

    entries
}

/// Build the global leaderboard and write `runs/leaderboard/`.
pub fn generate_leaderboard(store: &RunStore, config: &Config) -> Result<PathBuf> {
    let mut entries: Vec<LeaderboardEntry> = Vec::new();
    let mut workflows_processed = 0usize;

    for state in store.scan_states() {
        if excluded(state.status) {
            continue;
        }
        let rows = extract_top_passes(store, &state, config.top_passes);
        if !rows.is_empty() {
            workflows_processed += 1;
            entries.extend(rows);
        }
    }

    entries.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.rank = index + 1;
    }

    let data = serde_json::json!({
        "passes": entries,
        "total_passes": entries.len(),
        "workflows_processed": workflows_processed,
    });
    write_board(&store.leaderboard_dir(), "Leaderboard", &data)
}

/// Build the boards index (every workflow, regardless of status) and write
/// `runs/boards/`.
pub fn generate_boards(store: &RunStore) -> Result<PathBuf> {
    let mut rows: Vec<serde_json::Value> = Vec::new();

    for state in store.scan_states() {
        let steps_passed = state.steps.values().filter(|r| r.success).count();
        let best_score = state.composite_score;
        rows.push(serde_json::json!({
            "workflow_id": state.workflow_id,
            "ea_name": state.ea_name,
            "symbol": state.symbol,
            "timeframe": state.timeframe,
            "status": state.status,
            "composite_score": best_score,
            "steps_recorded": state.steps.len(),
            "steps_passed": steps_passed,
            "fix_attempts": state.fix_attempts,
            "updated_at": state.updated_at,
        }));
    }

    rows.sort_by(|a, b| {
        let at = |v: &serde_json::Value| v["updated_at"].as_str().unwrap_or("").to_string();
        at(b).cmp(&at(a))
    });

    let data = serde_json::json!({
        "workflows": rows,
        "total": rows.len(),
    });
    write_board(&store.boards_dir(), "Workflow Boards", &data)
}

/// Write the per-workflow dashboard payload (`runs/dashboards/<id>/`).
pub fn write_dashboard(
    store: &RunStore,
    state: &WorkflowState,
    composite_score: f64,
    go_live: &GoLiveCheck,
    diagnoses: &[String],
) -> Result<PathBuf> {
    let mc = match state.stage_data(StepId::MonteCarlo) {
        Some(StageData::MonteCarlo { result, .. }) => serde_json::to_value(result)?,
        _ => serde_json::Value::Null,
    };
    let windows = match state.stage_data(StepId::ForwardWindows) {
        Some(StageData::ForwardWindows { windows }) => serde_json::to_value(windows)?,
        _ => serde_json::Value::Null,
    };

    let data = serde_json::json!({
        "workflow_id": state.workflow_id,
        "ea_name": state.ea_name,
        "symbol": state.symbol,
        "timeframe": state.timeframe,
        "status": state.status,
        "composite_score": composite_score,
        "go_live": go_live,
        "diagnoses": diagnoses,
        "metrics": state.metrics,
        "gates": state.gates,
        "monte_carlo": mc,
        "forward_windows": windows,
        "backtest_dates": state.backtest_dates,
        "errors": state.errors,
    });
    write_board(
        &store.dashboards_dir(&state.workflow_id),
        &format!("{} - {}", state.ea_name, state.symbol),
        &data,
    )
}
