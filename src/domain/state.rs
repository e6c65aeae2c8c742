use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::metrics::{GateResult, MonteCarloResult, TradeMetrics, WindowMetrics};
use super::param::{OptimizationRange, Parameter};
use super::passes::PassBacktest;

/// The declared, ordered step list. `Ord` on this enum is declaration order,
/// which is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum StepId {
    #[serde(rename = "1_load_ea")]
    LoadEa,
    #[serde(rename = "1b_inject_ontester")]
    InjectOnTester,
    #[serde(rename = "1c_inject_safety")]
    InjectSafety,
    #[serde(rename = "2_compile")]
    Compile,
    #[serde(rename = "3_extract_params")]
    ExtractParams,
    #[serde(rename = "4_analyze_params")]
    AnalyzeParams,
    #[serde(rename = "5_validate_trades")]
    ValidateTrades,
    #[serde(rename = "5b_fix_ea")]
    FixEa,
    #[serde(rename = "6_create_ini")]
    CreateIni,
    #[serde(rename = "7_run_optimization")]
    RunOptimization,
    #[serde(rename = "8_parse_results")]
    ParseResults,
    #[serde(rename = "8b_select_passes")]
    SelectPasses,
    #[serde(rename = "9_backtest_top")]
    BacktestTop,
    #[serde(rename = "10_monte_carlo")]
    MonteCarlo,
    #[serde(rename = "11_generate_reports")]
    GenerateReports,
    #[serde(rename = "12_stress_scenarios")]
    StressScenarios,
    #[serde(rename = "13_forward_windows")]
    ForwardWindows,
    #[serde(rename = "14_multi_pair")]
    MultiPair,
}

impl StepId {
    pub const ORDER: [StepId; 18] = [
        StepId::LoadEa,
        StepId::InjectOnTester,
        StepId::InjectSafety,
        StepId::Compile,
        StepId::ExtractParams,
        StepId::AnalyzeParams,
        StepId::ValidateTrades,
        StepId::FixEa,
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
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::LoadEa => "1_load_ea",
            StepId::InjectOnTester => "1b_inject_ontester",
            StepId::InjectSafety => "1c_inject_safety",
            StepId::Compile => "2_compile",
            StepId::ExtractParams => "3_extract_params",
            StepId::AnalyzeParams => "4_analyze_params",
            StepId::ValidateTrades => "5_validate_trades",
            StepId::FixEa => "5b_fix_ea",
            StepId::CreateIni => "6_create_ini",
            StepId::RunOptimization => "7_run_optimization",
            StepId::ParseResults => "8_parse_results",
            StepId::SelectPasses => "8b_select_passes",
            StepId::BacktestTop => "9_backtest_top",
            StepId::MonteCarlo => "10_monte_carlo",
            StepId::GenerateReports => "11_generate_reports",
            StepId::StressScenarios => "12_stress_scenarios",
            StepId::ForwardWindows => "13_forward_windows",
            StepId::MultiPair => "14_multi_pair",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    AwaitingParamAnalysis,
    AwaitingStatsAnalysis,
    AwaitingEaFix,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Paused at a human-in-the-loop point.
    pub fn is_awaiting(self) -> bool {
        matches!(
            self,
            WorkflowStatus::AwaitingParamAnalysis
                | WorkflowStatus::AwaitingStatsAnalysis
                | WorkflowStatus::AwaitingEaFix
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// How stage 8b picked the passes to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    Auto,
    External,
}

/// Typed per-stage payload; the serde tag doubles as the persistence codec.
///
/// Large artifacts (full pass lists, per-pass backtests, scenario rows) live in
/// sidecar files referenced by `results_file` paths, so state files stay small.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageData {
    LoadEa {
        path: String,
    },
    InjectOnTester {
        modified_path: String,
        injected: bool,
    },
    InjectSafety {
        modified_path: String,
        injected: bool,
    },
    Compile {
        binary_path: String,
        warnings: Vec<String>,
    },
    ExtractParams {
        params: Vec<Parameter>,
        optimizable: usize,
    },
    AnalyzeParams {
        wide_params: BTreeMap<String, serde_json::Value>,
        ranges: Vec<OptimizationRange>,
    },
    ValidateTrades {
        total_trades: u64,
        profit: f64,
        report_path: Option<String>,
    },
    FixEa {
        fix_attempts: u32,
        max_fix_attempts: u32,
        validation_trades: u64,
        ea_path: String,
        awaiting_fix: bool,
    },
    CreateIni {
        ini_path: String,
    },
    RunOptimization {
        passes: usize,
        results_file: String,
        xml_path: Option<String>,
        forward_xml_path: Option<String>,
    },
    ParseResults {
        total_passes: usize,
        valid_passes: usize,
    },
    SelectPasses {
        selected: Vec<i64>,
        method: SelectionMethod,
        top_pass: Option<i64>,
        scored: usize,
    },
    BacktestTop {
        best: PassBacktest,
        results_file: String,
        successful: usize,
        attempted: usize,
        gates: Vec<GateResult>,
    },
    MonteCarlo {
        result: MonteCarloResult,
        gates: Vec<GateResult>,
    },
    GenerateReports {
        composite_score: f64,
        go_live_ready: bool,
        dashboard_path: Option<String>,
        diagnoses: Vec<String>,
    },
    StressScenarios {
        scenario_count: usize,
        base_count: usize,
        overlay_count: usize,
        results_file: String,
    },
    ForwardWindows {
        windows: Vec<WindowMetrics>,
    },
    MultiPair {
        symbols: Vec<String>,
        skipped: bool,
    },
}

impl StageData {
    /// Gate results bundled inside the payload (stages 9 and 10 check several).
    pub fn bundled_gates(&self) -> &[GateResult] {
        match self {
            StageData::BacktestTop { gates, .. } | StageData::MonteCarlo { gates, .. } => gates,
            _ => &[],
        }
    }
}

/// Immutable record of one executed stage. Resume reads it back verbatim; a
/// stage never rewrites its own result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<StageData>,
    #[serde(default)]
    pub gate: Option<GateResult>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl StageResult {
    pub fn ok(data: StageData) -> Self {
        Self {
            success: true,
            data: Some(data),
            gate: None,
            errors: Vec::new(),
        }
    }

    pub fn ok_gated(data: StageData, gate: GateResult) -> Self {
        Self {
            success: gate.passed,
            data: Some(data),
            gate: Some(gate),
            errors: Vec::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            gate: None,
            errors: vec![error.into()],
        }
    }

}

/// The in-sample/forward/backtest date window for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestDates {
    pub start: NaiveDate,
    /// Forward segment starts here.
    pub split: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub step: StepId,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Go-live readiness derived from the critical gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoLiveCheck {
    pub ready: bool,
    pub gate_results: BTreeMap<String, bool>,
    pub message: String,
}

/// Durable state of one workflow. The executor owns the in-memory value; the
/// state store owns the on-disk form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub ea_name: String,
    pub ea_path: String,
    pub symbol: String,
    pub timeframe: String,
    pub terminal_id: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub current_step: Option<StepId>,
    /// Keyed by step; `BTreeMap` iteration follows the declared step order.
    #[serde(default)]
    pub steps: BTreeMap<StepId, StageResult>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub gates: BTreeMap<String, GateResult>,
    #[serde(default)]
    pub errors: Vec<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub fix_attempts: u32,
    pub max_fix_attempts: u32,
    #[serde(default)]
    pub previous_workflow_id: Option<String>,
    pub backtest_dates: BacktestDates,
    #[serde(default)]
    pub composite_score: Option<f64>,
    #[serde(default)]
    pub go_live: Option<GoLiveCheck>,
    #[serde(default)]
    pub original_ea_backup: Option<String>,
}

impl WorkflowState {
    pub fn step_result(&self, id: StepId) -> Option<&StageResult> {
        self.steps.get(&id)
    }

    pub fn step_passed(&self, id: StepId) -> bool {
        self.steps.get(&id).is_some_and(|r| r.success)
    }

    /// First declared step without a recorded result.
    pub fn next_step(&self) -> Option<StepId> {
        StepId::ORDER.iter().copied().find(|s| !self.steps.contains_key(s))
    }

    /// Typed lookup of a stage payload.
    pub fn stage_data(&self, id: StepId) -> Option<&StageData> {
        self.steps.get(&id).and_then(|r| r.data.as_ref())
    }

    pub fn metrics_snapshot(&self) -> TradeMetrics {
        TradeMetrics::from_map(&self.metrics)
    }

    pub fn record_error(&mut self, step: StepId, message: impl Into<String>) {
        self.errors.push(WorkflowError {
            step,
            message: message.into(),
            at: Utc::now(),
        });
    }
}
