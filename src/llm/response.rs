//! 归一化的模型响应
//!
//! 所有后端的返回都被转换为 ProviderResponse：文本片段、结构化工具调用、token 用量与可选的错误分类。
//! 修复流水线（repair）与委派层只面向这一种类型。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::traits::LlmErrorKind;

/// 保留的控制转移调用名
pub const TRANSFER_TOOL: &str = "transfer_to_agent";
/// 目标 Agent 参数名
pub const AGENT_NAME_KEY: &str = "agentName";
/// 兼容旧调用方的参数名
pub const LEGACY_AGENT_NAME_KEY: &str = "agent_name";

/// 结构化工具调用：{name, args}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// 构造保留的 transfer 调用
    pub fn transfer(target: impl Into<String>) -> Self {
        let mut args = Map::new();
        args.insert(AGENT_NAME_KEY.to_string(), Value::String(target.into()));
        Self::new(TRANSFER_TOOL, args)
    }

    pub fn is_transfer(&self) -> bool {
        self.name == TRANSFER_TOOL
    }

    /// transfer 的目标 Agent；同时接受 agentName 与 agent_name
    pub fn transfer_target(&self) -> Option<&str> {
        if !self.is_transfer() {
            return None;
        }
        self.args
            .get(AGENT_NAME_KEY)
            .or_else(|| self.args.get(LEGACY_AGENT_NAME_KEY))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// 将 transfer 的旧参数名改写为 agentName，其它调用原样返回
    pub fn normalized(mut self) -> Self {
        if self.is_transfer() && !self.args.contains_key(AGENT_NAME_KEY) {
            if let Some(value) = self.args.remove(LEGACY_AGENT_NAME_KEY) {
                self.args.insert(AGENT_NAME_KEY.to_string(), value);
            }
        }
        self
    }
}

/// 响应中的单个片段
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Text(String),
    ToolCall(ToolInvocation),
}

/// token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// 一次模型调用的归一化结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub parts: Vec<ResponsePart>,
    pub usage: TokenUsage,
    /// 后端在 200 响应中夹带的错误（如 choice 级别的 error）
    pub error_kind: Option<LlmErrorKind>,
}

impl ProviderResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![ResponsePart::Text(text.into())],
            ..Self::default()
        }
    }

    pub fn from_parts(parts: Vec<ResponsePart>) -> Self {
        Self {
            parts,
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    /// 所有文本片段按换行拼接
    pub fn text(&self) -> String {
        self.texts().collect::<Vec<_>>().join("\n")
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            ResponsePart::Text(t) => Some(t.as_str()),
            ResponsePart::ToolCall(_) => None,
        })
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|p| match p {
            ResponsePart::ToolCall(call) => Some(call),
            ResponsePart::Text(_) => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    /// 第一个 transfer 调用
    pub fn transfer(&self) -> Option<&ToolInvocation> {
        self.tool_calls().find(|c| c.is_transfer())
    }

    pub fn transfer_count(&self) -> usize {
        self.tool_calls().filter(|c| c.is_transfer()).count()
    }
}
