//! 委派运行器
//!
//! 从某个 Agent 出发循环：组装提示词 → 路由器调用模型 → 修复流水线 → 处理工具调用与控制转移。
//! - 无 transfer、无工具调用的响应是终止条件，返回该 Agent 的文本
//! - 工具调用经 ToolExecutor 执行，结果作为 Tool 消息写回，同一 Agent 再次被调用
//! - 转移目标必须是当前 Agent 的邻居；非邻居转移记为违规、注入提示，当前 Agent 不变
//! - 总轮数受 max_turns 约束

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agents::{AgentGraph, AgentSpec};
use crate::core::AgentError;
use crate::llm::{FailoverRouter, LlmError, TokenUsage, ToolInvocation};
use crate::memory::{ConversationMemory, Message};
use crate::repair::RepairPipeline;
use crate::tools::{transfer_tool_schema, ToolExecutor, ToolSchema};

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// 跟随 transfer 在图中移动
    Delegating,
    /// 只运行指定 Agent，不提供也不跟随 transfer（工作流步骤使用）
    Isolated,
}

/// 一次控制转移（或被拒绝的转移）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub from: String,
    pub to: String,
}

/// 一次委派运行的结果
#[derive(Debug, Clone)]
pub struct DelegationOutcome {
    /// 给出最终回答的 Agent
    pub agent: String,
    pub text: String,
    pub transfers: Vec<Handoff>,
    /// 被拒绝的转移；缺少目标时 to 为空
    pub violations: Vec<Handoff>,
    pub turns: usize,
    pub usage: TokenUsage,
}

/// 委派运行器配置
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_turns: usize,
    pub history_turns: usize,
    pub tool_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_turns: 12,
            history_turns: 20,
            tool_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DelegationRunner {
    graph: Arc<AgentGraph>,
    router: Arc<FailoverRouter>,
    repair: RepairPipeline,
    options: RunnerOptions,
}

impl DelegationRunner {
    pub fn new(graph: Arc<AgentGraph>, router: Arc<FailoverRouter>, options: RunnerOptions) -> Self {
        Self {
            graph,
            router,
            repair: RepairPipeline::standard(),
            options,
        }
    }

    pub fn with_repair(mut self, repair: RepairPipeline) -> Self {
        self.repair = repair;
        self
    }

    pub fn graph(&self) -> &AgentGraph {
        &self.graph
    }

    /// 从根 Agent 开始委派
    pub async fn run(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<DelegationOutcome, AgentError> {
        let root = self.graph.root().name.clone();
        self.run_agent(&root, input, RunMode::Delegating, cancel).await
    }

    pub async fn run_agent(
        &self,
        start: &str,
        input: &str,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<DelegationOutcome, AgentError> {
        let mut current = self.graph.agent(start)?.clone();
        let mut memory = ConversationMemory::new(self.options.history_turns);
        memory.push(Message::user(input));

        let mut transfers = Vec::new();
        let mut violations = Vec::new();
        let mut usage = TokenUsage::default();

        for turn in 1..=self.options.max_turns {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let messages = self.build_messages(&current, &memory, mode);
            let tools = self.tool_schemas(&current, mode);
            let routed = match self.router.invoke(&messages, &tools, cancel).await {
                Ok(routed) => routed,
                Err(LlmError::Cancelled) => return Err(AgentError::Cancelled),
                Err(e) => return Err(e.into()),
            };
            usage.add(routed.response.usage);
            tracing::info!(
                agent = %current.name,
                model = %routed.model,
                attempts = routed.attempts,
                turn,
                "Agent turn"
            );

            let response = self.repair.apply(routed.response, &current.name);
            let text = response.text();
            if !text.trim().is_empty() {
                memory.push(Message::assistant(text.clone()));
            }

            let transfer = response.transfer().cloned();
            let calls: Vec<ToolInvocation> = response
                .tool_calls()
                .filter(|c| !c.is_transfer())
                .cloned()
                .collect();

            if !calls.is_empty() {
                let executor = ToolExecutor::with_timeout(current.tools.clone(), self.options.tool_timeout);
                for call in calls.iter() {
                    let content = match executor
                        .execute(&call.name, serde_json::Value::Object(call.args.clone()))
                        .await
                    {
                        Ok(content) => content,
                        Err(e) => format!("Error: {e}"),
                    };
                    memory.push(Message::tool(call.name.clone(), content));
                }
            }

            match (transfer, mode) {
                (Some(call), RunMode::Delegating) => {
                    self.handle_transfer(&call, &mut current, &mut memory, &mut transfers, &mut violations);
                    continue;
                }
                (Some(call), RunMode::Isolated) => {
                    tracing::warn!(
                        agent = %current.name,
                        target = ?call.transfer_target(),
                        "Transfer ignored in isolated run"
                    );
                }
                (None, _) => {}
            }
            if !calls.is_empty() {
                continue;
            }

            return Ok(DelegationOutcome {
                agent: current.name.clone(),
                text,
                transfers,
                violations,
                turns: turn,
                usage,
            });
        }

        tracing::error!(agent = %current.name, max_turns = self.options.max_turns, "Turn limit exceeded");
        Err(AgentError::TurnLimitExceeded(self.options.max_turns))
    }

    fn handle_transfer(
        &self,
        call: &ToolInvocation,
        current: &mut Arc<AgentSpec>,
        memory: &mut ConversationMemory,
        transfers: &mut Vec<Handoff>,
        violations: &mut Vec<Handoff>,
    ) {
        let Some(target) = call.transfer_target() else {
            let e = AgentError::MissingTransferTarget;
            tracing::warn!(agent = %current.name, error = %e, "Rejected transfer");
            violations.push(Handoff {
                from: current.name.clone(),
                to: String::new(),
            });
            memory.push(Message::system(format!(
                "[PROTOCOL ERROR] {}. Allowed targets: [{}].",
                e,
                self.graph.peers(&current.name).join(", ")
            )));
            return;
        };

        match self.graph.check_transfer(&current.name, target) {
            Ok(next) => {
                tracing::info!(from = %current.name, to = %next.name, "Control transferred");
                transfers.push(Handoff {
                    from: current.name.clone(),
                    to: next.name.clone(),
                });
                memory.push(Message::system(format!(
                    "Control transferred from '{}' to '{}'.",
                    current.name, next.name
                )));
                *current = next.clone();
            }
            Err(e) => {
                tracing::warn!(agent = %current.name, target = %target, error = %e, "Rejected transfer");
                violations.push(Handoff {
                    from: current.name.clone(),
                    to: target.to_string(),
                });
                memory.push(Message::system(format!(
                    "[PROTOCOL ERROR] '{}' is not reachable from '{}'. Allowed targets: [{}].",
                    target,
                    current.name,
                    self.graph.peers(&current.name).join(", ")
                )));
            }
        }
    }

    fn build_messages(&self, agent: &AgentSpec, memory: &ConversationMemory, mode: RunMode) -> Vec<Message> {
        let mut system = format!("You are the '{}' agent.\n{}", agent.name, agent.instructions);
        let peers = self.graph.peers(&agent.name);
        if mode == RunMode::Delegating && !peers.is_empty() {
            system.push_str(&format!(
                "\n\nYou may hand off with transfer_to_agent to: {}. Never transfer to yourself.",
                peers.join(", ")
            ));
        }
        let mut messages = Vec::with_capacity(memory.len() + 1);
        messages.push(Message::system(system));
        messages.extend_from_slice(memory.messages());
        messages
    }

    fn tool_schemas(&self, agent: &AgentSpec, mode: RunMode) -> Vec<ToolSchema> {
        let mut tools = agent.tools.schemas();
        let peers = self.graph.peers(&agent.name);
        if mode == RunMode::Delegating && !peers.is_empty() {
            tools.push(transfer_tool_schema(&peers));
        }
        tools
    }
}
