//! 工作流引擎
//!
//! 无交互的步骤驱动：加载状态 → 用累积的字段组装提示词 → 运行该步骤的 Agent → 写回结果并计算下一步 →
//! 一次性持久化 {state, next_step}。步骤进度只保存在存储中，进程重启后可继续。
//! 质检失败回到 narrative，次数受 max_narrative_attempts 约束，超出后转入 step_error。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agents::{DelegationRunner, RunMode};
use crate::core::{AgentError, SessionSupervisor};
use crate::memory::Message;
use crate::workflow::graph::StepGraph;
use crate::workflow::store::WorkflowStore;
use crate::workflow::types::{
    StatePatch, StateRecord, ValidationOutcome, WorkflowError, WorkflowState, WorkflowStep,
};

/// 步骤执行器：对指定 Agent 运行一次提示词，返回其文本输出
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        agent: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError>;
}

#[async_trait]
impl StepExecutor for DelegationRunner {
    async fn execute(
        &self,
        agent: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        self.run_agent(agent, prompt, RunMode::Isolated, cancel)
            .await
            .map(|outcome| outcome.text)
    }
}

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// 质检通过标记（整词匹配，INVALID 不算通过）
    pub success_marker: String,
    pub max_narrative_attempts: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            success_marker: "VALID".to_string(),
            max_narrative_attempts: 3,
        }
    }
}

/// 整词匹配标记
pub fn contains_marker(text: &str, marker: &str) -> bool {
    !marker.is_empty()
        && text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .any(|word| word == marker)
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    executor: Arc<dyn StepExecutor>,
    supervisor: Arc<SessionSupervisor>,
    graph: StepGraph,
    options: EngineOptions,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: Arc<dyn StepExecutor>,
        supervisor: Arc<SessionSupervisor>,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            executor,
            supervisor,
            graph: StepGraph::standard(),
            options,
        }
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<StateRecord>, WorkflowError> {
        Ok(self.store.load(session_id).await?)
    }

    /// 执行当前步骤并返回持久化后的步骤；新会话必须提供 input
    pub async fn run_step(
        &self,
        session_id: &str,
        user_id: &str,
        input: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowStep, WorkflowError> {
        let _lease = self.supervisor.acquire(session_id).await;
        tracing::debug!(
            session_id,
            active_sessions = self.supervisor.tracked_sessions(),
            "Session lease acquired"
        );

        let record = match self.store.load(session_id).await? {
            Some(record) => {
                if input.is_some_and(|i| !i.trim().is_empty()) {
                    tracing::debug!(session_id, "Session exists, new input ignored");
                }
                record
            }
            None => {
                let text = input
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or(WorkflowError::MissingInput)?;
                tracing::info!(session_id, user_id, "Creating workflow session");
                self.store
                    .create(session_id, user_id, WorkflowState::new(text))
                    .await?
            }
        };

        let step = record.current_step;
        let Some(agent) = step.agent() else {
            tracing::info!(session_id, step = %step, "Workflow already finished");
            return Ok(step);
        };
        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        tracing::info!(session_id, step = %step, agent, "Running workflow step");
        match self.execute(step, agent, &record.state, cancel).await {
            Ok((patch, next)) => {
                self.graph.check(step, next)?;
                self.store.update(session_id, patch, step, Some(next)).await?;
                tracing::info!(session_id, from = %step, to = %next, "Workflow step committed");
                Ok(next)
            }
            Err(WorkflowError::Agent(e)) if e.is_cancelled() => {
                tracing::warn!(session_id, step = %step, "Workflow step cancelled, state untouched");
                Err(WorkflowError::Cancelled)
            }
            Err(WorkflowError::Agent(e)) => {
                tracing::error!(session_id, step = %step, error = %e, "Workflow step failed");
                let next = WorkflowStep::Error;
                self.graph.check(step, next)?;
                self.store
                    .update(session_id, StatePatch::new().with_error(e.to_string()), step, Some(next))
                    .await?;
                Ok(next)
            }
            Err(e) => Err(e),
        }
    }

    /// 连续执行直到终止步骤
    pub async fn run_to_completion(
        &self,
        session_id: &str,
        user_id: &str,
        input: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WorkflowStep, WorkflowError> {
        let mut step = self.run_step(session_id, user_id, input, cancel).await?;
        while !step.is_terminal() {
            step = self.run_step(session_id, user_id, None, cancel).await?;
        }
        Ok(step)
    }

    async fn execute(
        &self,
        step: WorkflowStep,
        agent: &str,
        state: &WorkflowState,
        cancel: &CancellationToken,
    ) -> Result<(StatePatch, WorkflowStep), WorkflowError> {
        let prompt = build_prompt(step, state);
        let output = self.executor.execute(agent, &prompt, cancel).await?;
        let patch = StatePatch::new()
            .with_result(step, output.clone())
            .with_history(Message::assistant(output.clone()));

        let outcome = match step {
            WorkflowStep::Research => (patch, WorkflowStep::Narrative),
            WorkflowStep::Narrative => (
                patch.with_narrative_attempts(state.narrative_attempts + 1),
                WorkflowStep::Validate,
            ),
            WorkflowStep::Validate => {
                let is_valid = contains_marker(&output, &self.options.success_marker);
                let patch = patch.with_validation(ValidationOutcome {
                    is_valid,
                    feedback: output,
                });
                if is_valid {
                    (patch, WorkflowStep::Done)
                } else if state.narrative_attempts < self.options.max_narrative_attempts {
                    tracing::warn!(
                        attempts = state.narrative_attempts,
                        max = self.options.max_narrative_attempts,
                        "Validation failed, retrying narrative"
                    );
                    (patch, WorkflowStep::Narrative)
                } else {
                    tracing::error!(
                        attempts = state.narrative_attempts,
                        "Validation failed, narrative retries exhausted"
                    );
                    (
                        patch.with_error(format!(
                            "validation failed after {} narrative attempts",
                            state.narrative_attempts
                        )),
                        WorkflowStep::Error,
                    )
                }
            }
            WorkflowStep::Done | WorkflowStep::Error => {
                return Err(WorkflowError::InvalidTransition { from: step, to: step })
            }
        };
        Ok(outcome)
    }
}

fn deliverable(state: &WorkflowState) -> &'static str {
    if state.classification == "video" {
        "video script"
    } else {
        "comic manifest"
    }
}

/// 由累积字段组装步骤提示词
pub fn build_prompt(step: WorkflowStep, state: &WorkflowState) -> String {
    let research = state.result(WorkflowStep::Research).unwrap_or("(none)");
    match step {
        WorkflowStep::Research => format!(
            "Research request: \"{}\"\nTarget format: {}\n\nPerform the research and return your findings.",
            state.text,
            deliverable(state)
        ),
        WorkflowStep::Narrative => {
            let mut prompt = format!(
                "Create a {} for the request \"{}\" based on this research:\n{}",
                deliverable(state),
                state.text,
                research
            );
            if let Some(validation) = state.validation.as_ref().filter(|v| !v.is_valid) {
                prompt.push_str(&format!(
                    "\n\nThe previous draft was rejected by the validator:\n{}\n\nPrevious draft:\n{}\n\nFix every issue listed.",
                    validation.feedback,
                    state.result(WorkflowStep::Narrative).unwrap_or("(none)")
                ));
            }
            prompt
        }
        WorkflowStep::Validate => format!(
            "Validate this {}:\n{}\n\nResearch it is based on:\n{}",
            deliverable(state),
            state.result(WorkflowStep::Narrative).unwrap_or("(none)"),
            research
        ),
        WorkflowStep::Done | WorkflowStep::Error => String::new(),
    }
}
