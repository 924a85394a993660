//! 响应修复流水线
//!
//! 每个模型响应在交给委派层之前，按固定顺序经过两个独立阶段：
//! - **ToolCallRepair**：从文本中找回被「叙述」出来的转移意图，替换为单个 transfer 调用
//! - **LoopGuard**：拦截转移给自己的调用，改为就地继续的提示
//!
//! 两个阶段都是 (response, current_agent) → response 的纯函数，幂等，且输出中最多一个 transfer 调用。

pub mod loop_guard;
pub mod tool_repair;

pub use loop_guard::LoopGuard;
pub use tool_repair::ToolCallRepair;

use crate::llm::ProviderResponse;

/// 响应处理阶段
pub trait ResponseProcessor: Send + Sync {
    /// 阶段名称（日志用）
    fn name(&self) -> &'static str;

    /// 处理一个响应；current_agent 为产生该响应的 Agent
    fn process(&self, response: ProviderResponse, current_agent: &str) -> ProviderResponse;
}

/// 有序的处理阶段列表
pub struct RepairPipeline {
    stages: Vec<Box<dyn ResponseProcessor>>,
}

impl RepairPipeline {
    pub fn new(stages: Vec<Box<dyn ResponseProcessor>>) -> Self {
        Self { stages }
    }

    /// 标准顺序：先修复，再防自环
    pub fn standard() -> Self {
        Self::new(vec![Box::new(ToolCallRepair), Box::new(LoopGuard)])
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn apply(&self, response: ProviderResponse, current_agent: &str) -> ProviderResponse {
        self.stages
            .iter()
            .fold(response, |resp, stage| stage.process(resp, current_agent))
    }
}

impl Default for RepairPipeline {
    fn default() -> Self {
        Self::standard()
    }
}
