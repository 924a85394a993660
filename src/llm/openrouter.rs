//! OpenRouter（OpenAI 兼容）HTTP 客户端
//!
//! 直接调用 `/chat/completions`：HTTP 状态码、`Retry-After` 与错误消息都交给 LlmError::classify 分类，
//! 不做任何内部重试（重试只发生在路由器的模型栈遍历中）。
//! polyfill 模型不发送 tools 字段，而是在 system 消息中描述工具，让模型以代码块写出调用。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::{
    LlmClient, LlmError, LlmErrorKind, ProviderResponse, ResponsePart, TokenUsage, ToolInvocation,
};
use crate::memory::{Message, Role};
use crate::tools::ToolSchema;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// 默认免费模型栈（按优先级）
pub const FREE_MODEL_STACK: &[&str] = &[
    "xiaomi/mimo-v2-flash:free",
    "tng/deepseek-r1t-chimera:free",
    "meta-llama/llama-3.3-70b-instruct:free",
];

/// 已知只会以文本形式输出工具调用的模型
pub const POLYFILL_MODELS: &[&str] = &[
    "google/gemma-3-27b-it:free",
    "meta-llama/llama-3.3-70b-instruct:free",
    "qwen/qwen-2.5-coder-32b-instruct:free",
];

/// Token 使用统计（累计值，跨调用共享）
#[derive(Debug, Clone, Default)]
pub struct SharedUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl SharedUsage {
    pub fn add(&self, usage: TokenUsage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    pub fn get(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// 单个模型的 OpenRouter 客户端
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    polyfill: bool,
    pub usage: SharedUsage,
}

impl OpenRouterClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
            .unwrap_or_default();
        if api_key.is_empty() {
            tracing::warn!("No OPENROUTER_API_KEY found; requests to {} will fail", model);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(OPENROUTER_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.to_string(),
            polyfill: false,
            usage: SharedUsage::default(),
        })
    }

    /// 标记为 polyfill 模型：不发送原生 tools，改为提示词描述
    pub fn with_polyfill(mut self, polyfill: bool) -> Self {
        self.polyfill = polyfill;
        self
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolSchema]) -> ChatCompletionRequest {
        let mut wire: Vec<WireMessage> = messages.iter().map(WireMessage::from).collect();
        let native_tools = !self.polyfill && !tools.is_empty();

        if self.polyfill && !tools.is_empty() {
            wire.insert(
                0,
                WireMessage {
                    role: "system",
                    content: polyfill_tool_prompt(tools),
                },
            );
        }

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: wire,
            tools: native_tools.then(|| {
                tools
                    .iter()
                    .map(|t| WireTool {
                        kind: "function",
                        function: t.clone(),
                    })
                    .collect()
            }),
            tool_choice: native_tools.then_some("auto"),
            stream: false,
        }
    }
}

/// polyfill 模型的工具说明
fn polyfill_tool_prompt(tools: &[ToolSchema]) -> String {
    let mut prompt = String::from(
        "You cannot call tools natively. To call a tool, reply with exactly one fenced block:\n\
         ```tool_code\ntool_name(key='value', count=1, flag=true)\n```\nAvailable tools:\n",
    );
    for tool in tools {
        prompt.push_str(&format!(
            "- {}: {} Parameters: {}\n",
            tool.name, tool.description, tool.parameters
        ));
    }
    prompt
}

fn map_transport_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else if e.is_connect() || e.is_request() {
        LlmError::Network(e.to_string())
    } else {
        LlmError::classify(e.status().map(|s| s.as_u16()), &e.to_string())
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn token_usage(&self) -> TokenUsage {
        self.usage.get()
    }

    async fn invoke(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, LlmError> {
        let request = self.build_request(messages, tools);
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Title", "Kilig Pipeline")
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response.text().await.unwrap_or_default();
            return Err(match LlmError::classify(Some(status.as_u16()), &body) {
                LlmError::RateLimited { .. } => LlmError::RateLimited { retry_after_ms },
                other => other,
            });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let parsed = parse_completion(body)?;
        self.usage.add(parsed.usage);
        Ok(parsed)
    }
}

/// 将 chat/completions 响应体转为 ProviderResponse
fn parse_completion(body: ChatCompletionResponse) -> Result<ProviderResponse, LlmError> {
    if let Some(err) = body.error {
        return Err(LlmError::classify(err.status(), &err.message));
    }
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;

    let mut parts = Vec::new();
    if let Some(message) = choice.message {
        if let Some(content) = message.content.filter(|c| !c.trim().is_empty()) {
            parts.push(ResponsePart::Text(content));
        }
        for call in message.tool_calls.unwrap_or_default() {
            match serde_json::from_str::<Map<String, Value>>(non_empty_args(&call.function.arguments)) {
                Ok(args) => parts.push(ResponsePart::ToolCall(
                    ToolInvocation::new(call.function.name, args).normalized(),
                )),
                Err(e) => tracing::debug!(
                    tool = %call.function.name,
                    "Skipping tool call with malformed arguments: {}",
                    e
                ),
            }
        }
    }

    let usage = body
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    let error_kind = match choice.error {
        Some(err) => Some(LlmError::classify(err.status(), &err.message).kind()),
        None if choice.finish_reason.as_deref() == Some("error") => Some(LlmErrorKind::Api),
        None => None,
    };

    Ok(ProviderResponse {
        parts,
        usage,
        error_kind,
    })
}

fn non_empty_args(raw: &str) -> &str {
    if raw.trim().is_empty() {
        "{}"
    } else {
        raw
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        match m.role {
            Role::System => Self {
                role: "system",
                content: m.content.clone(),
            },
            Role::User => Self {
                role: "user",
                content: m.content.clone(),
            },
            Role::Assistant => Self {
                role: "assistant",
                content: m.content.clone(),
            },
            // 工具结果以文本回传，不依赖 tool_call_id
            Role::Tool => Self {
                role: "user",
                content: format!(
                    "Tool result ({}): {}",
                    m.name.as_deref().unwrap_or("tool"),
                    m.content
                ),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolSchema,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: Option<WireResponseMessage>,
    finish_reason: Option<String>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    message: String,
}

impl WireError {
    fn status(&self) -> Option<u16> {
        match &self.code {
            Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }
}
