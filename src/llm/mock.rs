//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设结果；脚本耗尽后返回 fallback（若有），否则回显最后一条 User 消息。
//! 记录调用次数与每次收到的消息，便于断言路由与提示词。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, ProviderResponse};
use crate::memory::{Message, Role};
use crate::tools::ToolSchema;

type Scripted = Result<ProviderResponse, LlmError>;

/// 脚本化 Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    model: String,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// 依次返回 script 中的结果
    pub fn scripted(model: impl Into<String>, script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::new(model)
        }
    }

    /// 每次都返回同一段文本
    pub fn always_text(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            fallback: Some(Ok(ProviderResponse::from_text(text))),
            ..Self::new(model)
        }
    }

    /// 每次都返回同一个错误
    pub fn failing(model: impl Into<String>, error: LlmError) -> Self {
        Self {
            fallback: Some(Err(error)),
            ..Self::new(model)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息列表
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn next_scripted(&self) -> Option<Scripted> {
        match self.script.lock() {
            Ok(mut script) => script.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
    ) -> Result<ProviderResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }

        if let Some(next) = self.next_scripted() {
            return next;
        }
        if let Some(fallback) = &self.fallback {
            return fallback.clone();
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(ProviderResponse::from_text(format!("Echo from Mock: {last_user}")))
    }
}
