//! 工作流类型定义
//!
//! 步骤枚举、会话状态、持久化记录与部分更新（patch），以及工作流错误类型

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::pipeline::{NARRATIVE, SCIENTIST, VALIDATOR};
use crate::core::AgentError;
use crate::memory::Message;
use crate::workflow::store::StoreError;

/// 工作流步骤（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkflowStep {
    #[serde(rename = "step_research")]
    Research,
    #[serde(rename = "step_narrative")]
    Narrative,
    #[serde(rename = "step_validate")]
    Validate,
    #[serde(rename = "step_done")]
    Done,
    #[serde(rename = "step_error")]
    Error,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; 5] = [
        WorkflowStep::Research,
        WorkflowStep::Narrative,
        WorkflowStep::Validate,
        WorkflowStep::Done,
        WorkflowStep::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStep::Research => "step_research",
            WorkflowStep::Narrative => "step_narrative",
            WorkflowStep::Validate => "step_validate",
            WorkflowStep::Done => "step_done",
            WorkflowStep::Error => "step_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStep::Done | WorkflowStep::Error)
    }

    /// 执行该步骤的 Agent；终止步骤没有
    pub fn agent(&self) -> Option<&'static str> {
        match self {
            WorkflowStep::Research => Some(SCIENTIST),
            WorkflowStep::Narrative => Some(NARRATIVE),
            WorkflowStep::Validate => Some(VALIDATOR),
            WorkflowStep::Done | WorkflowStep::Error => None,
        }
    }
}

impl fmt::Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStep {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| WorkflowError::UnknownStep(s.to_string()))
    }
}

/// 最近一次质检结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub feedback: String,
}

/// 会话状态（持久化为 JSON）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// 原始请求
    pub text: String,
    /// "video" 或 "comic"
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    /// 各步骤的输出，按步骤名索引
    #[serde(default)]
    pub results: BTreeMap<String, String>,
    #[serde(default)]
    pub validation: Option<ValidationOutcome>,
    #[serde(default)]
    pub narrative_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            classification: classify_request(&text).to_string(),
            conversation_history: vec![Message::user(text.clone())],
            text,
            ..Self::default()
        }
    }

    pub fn result(&self, step: WorkflowStep) -> Option<&str> {
        self.results.get(step.as_str()).map(String::as_str)
    }
}

/// 请求里提到视频或动画时走视频流水线，否则默认漫画
pub fn classify_request(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    if ["video", "animation", "revideo"].iter().any(|k| lower.contains(k)) {
        "video"
    } else {
        "comic"
    }
}

/// 存储中的一条会话记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub session_id: String,
    pub user_id: String,
    pub state: WorkflowState,
    pub current_step: WorkflowStep,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 部分更新：results 按键合并，history 追加，其余字段有值时覆盖
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub results: BTreeMap<String, String>,
    pub validation: Option<ValidationOutcome>,
    pub narrative_attempts: Option<u32>,
    pub error: Option<String>,
    pub append_history: Vec<Message>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, step: WorkflowStep, output: impl Into<String>) -> Self {
        self.results.insert(step.as_str().to_string(), output.into());
        self
    }

    pub fn with_validation(mut self, validation: ValidationOutcome) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_narrative_attempts(mut self, attempts: u32) -> Self {
        self.narrative_attempts = Some(attempts);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_history(mut self, message: Message) -> Self {
        self.append_history.push(message);
        self
    }

    pub fn apply(&self, state: &mut WorkflowState) {
        state
            .results
            .extend(self.results.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(validation) = &self.validation {
            state.validation = Some(validation.clone());
        }
        if let Some(attempts) = self.narrative_attempts {
            state.narrative_attempts = attempts;
        }
        if let Some(error) = &self.error {
            state.error = Some(error.clone());
        }
        state
            .conversation_history
            .extend(self.append_history.iter().cloned());
    }
}

/// 工作流错误类型
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Cannot start a new session without input")]
    MissingInput,

    #[error("Invalid step transition {from} -> {to}")]
    InvalidTransition { from: WorkflowStep, to: WorkflowStep },

    #[error("Unknown workflow step: {0}")]
    UnknownStep(String),

    #[error("Workflow cancelled")]
    Cancelled,

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}
