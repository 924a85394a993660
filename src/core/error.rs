//! Agent 层错误类型
//!
//! 委派与工具执行过程中的错误。模型调用错误由路由器先行故障转移，只有整个模型栈耗尽后才以 Provider 形式出现。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误（模型、协议、工具、图构建等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Provider(#[from] LlmError),

    /// 转移到非邻居 Agent：记录并拒绝，不改变当前 Agent
    #[error("Protocol violation: {from} may not transfer to {to}")]
    ProtocolViolation { from: String, to: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// transfer 调用缺少 agentName：与非邻居转移一样记为违规
    #[error("transfer_to_agent requires an agentName argument")]
    MissingTransferTarget,

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Hallucinated tool: {0}")]
    HallucinatedTool(String),

    #[error("Turn limit exceeded after {0} turns")]
    TurnLimitExceeded(usize),

    #[error("Agent graph error: {0}")]
    Graph(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 取消信号（包括路由器中途取消）
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            AgentError::Cancelled | AgentError::Provider(LlmError::Cancelled)
        )
    }
}
