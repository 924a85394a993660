//! 保留的 transfer 调用 Schema（schemars 自动生成）
//!
//! 每个 Agent 的工具列表里都会注入 transfer_to_agent，其 agentName 被限定为该 Agent 的邻居集合。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::TRANSFER_TOOL;
use crate::tools::ToolSchema;

/// transfer_to_agent 的参数；旧调用方使用 agent_name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransferArgs {
    /// 目标 Agent 名称
    #[serde(rename = "agentName", alias = "agent_name")]
    pub agent_name: String,
}

/// 生成 transfer_to_agent 的工具描述，agentName 限定为 peers 中的名称
pub fn transfer_tool_schema<S: AsRef<str>>(peers: &[S]) -> ToolSchema {
    let mut parameters = serde_json::to_value(schema_for!(TransferArgs)).unwrap_or(Value::Null);
    if let Some(obj) = parameters.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    if let Some(agent) = parameters.pointer_mut("/properties/agentName") {
        if let Some(agent) = agent.as_object_mut() {
            let names: Vec<Value> = peers
                .iter()
                .map(|p| Value::String(p.as_ref().to_string()))
                .collect();
            agent.insert("enum".to_string(), Value::Array(names));
        }
    }

    let listed = peers
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(", ");
    ToolSchema {
        name: TRANSFER_TOOL.to_string(),
        description: format!(
            "Transfer control to another agent. Allowed targets: {listed}. Never transfer to yourself."
        ),
        parameters,
    }
}
