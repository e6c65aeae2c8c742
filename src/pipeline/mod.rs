//! The resumable pipeline: stage contract, the 18 stage implementations, and
//! the executor that drives them.

pub mod executor;
pub mod stage;
pub mod stages;

pub use executor::{Executor, RunOutcome, WorkflowSpec};
pub use stage::{ParamAnalysis, PassSelection, Stage, StageContext};
