//! Agent 层：两阶段构建的 Agent 图与委派运行器

pub mod graph;
pub mod pipeline;
pub mod registry;
pub mod runner;

pub use graph::AgentGraph;
pub use pipeline::standard_graph;
pub use registry::{AgentRegistry, AgentSpec};
pub use runner::{DelegationOutcome, DelegationRunner, Handoff, RunMode, RunnerOptions};
