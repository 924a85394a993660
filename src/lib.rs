//! Kilig - 多智能体编排核心
//!
//! 模块划分：
//! - **agents**: Agent 定义、委派图（只能转移给相邻 Agent）与委派运行器
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、会话监管（取消与单会话互斥）
//! - **llm**: LLM 客户端抽象、OpenRouter 实现、模型栈故障转移、文本工具调用解析
//! - **memory**: 对话消息与滑动窗口
//! - **observability**: tracing 初始化
//! - **repair**: 响应修复流水线（工具调用修复、自我转移防护）
//! - **tools**: 工具注册表、执行器、transfer schema 与产物工具
//! - **workflow**: research → narrative → validate 的持久化状态机

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod repair;
pub mod tools;
pub mod workflow;

pub use agents::{AgentGraph, DelegationRunner};
pub use llm::FailoverRouter;
pub use workflow::{WorkflowEngine, WorkflowStep};
