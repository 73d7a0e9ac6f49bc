//! Planning module.
//!
//! This module compares the desired graph against recorded state, orders
//! the resulting changes into an execution plan, and executes that plan
//! against the provider adapters.

mod diff;
mod executor;
mod plan;

pub use diff::{
    AttributeChange, DiffEngine, DiffResult, DiffType, PlannedValue, ResourceDiff, SchemaRegistry,
};
pub use executor::{
    CancelSignal, ExecutionReport, ExecutorConfig, PlanExecutor, StepResult, StepStatus,
};
pub use plan::{ActionType, ExecutionPlan, PlanStep, Planner};
