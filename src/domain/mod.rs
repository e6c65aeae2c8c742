pub mod metrics;
pub mod param;
pub mod passes;
pub mod scenario;
pub mod state;
pub mod trade;

pub use metrics::{GateOp, GateResult, MonteCarloResult, TradeMetrics, WindowKind, WindowMetrics};
pub use param::{OptimizationRange, ParamType, Parameter};
pub use passes::{CellValue, ForwardSegment, PassBacktest, PassBacktestSet, PassRecord};
pub use scenario::{DataModel, OverlaySettings, Scenario, ScenarioSettings, ScenarioVariant, ScenarioWindow};
pub use state::{
    BacktestDates, GoLiveCheck, SelectionMethod, StageData, StageResult, StepId, WorkflowError,
    WorkflowState, WorkflowStatus,
};
pub use trade::{Trade, TradeSide};
