//! 工作流状态机
//!
//! research → narrative → validate → done / error 的持久化步骤驱动，与自由委派的 Agent 图相互独立。

pub mod engine;
pub mod graph;
pub mod store;
pub mod types;

pub use engine::{build_prompt, contains_marker, EngineOptions, StepExecutor, WorkflowEngine};
pub use graph::StepGraph;
pub use store::{InMemoryWorkflowStore, SqliteWorkflowStore, StoreError, WorkflowStore};
pub use types::{
    classify_request, StatePatch, StateRecord, ValidationOutcome, WorkflowError, WorkflowState,
    WorkflowStep,
};
