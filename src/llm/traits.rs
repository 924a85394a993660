//! LLM 客户端抽象与错误分类
//!
//! 每个后端模型标识对应一个 LlmClient；invoke 为一次非流式调用。
//! LlmError::is_retryable 是封闭谓词：限流、超时、网络错误、「不支持原生工具调用」可切换到下一个模型，其余立即失败。

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

use crate::llm::{ProviderResponse, TokenUsage};
use crate::memory::Message;
use crate::tools::ToolSchema;

/// LLM 客户端 trait：一个实例对应模型栈中的一个模型
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 后端模型标识，如 `meta-llama/llama-3.3-70b-instruct:free`
    fn model(&self) -> &str;

    /// 单次调用：messages 为完整上下文，tools 为本轮可用的工具 schema
    async fn invoke(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, LlmError>;

    /// 累计 token 用量，默认不统计
    fn token_usage(&self) -> TokenUsage {
        TokenUsage::default()
    }
}

/// 错误分类（不含细节），也用于标记 200 响应中夹带的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmErrorKind {
    RateLimited,
    Timeout,
    Network,
    ToolCallingUnsupported,
    Api,
    InvalidResponse,
    Cancelled,
    Exhausted,
}

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("model does not support native tool calling: {0}")]
    ToolCallingUnsupported(String),

    #[error("API error (status {status:?}): {message}")]
    Api { status: Option<u16>, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("model stack is empty")]
    EmptyStack,

    #[error("all {attempts} models failed: {}", .errors.join("; "))]
    Exhausted { attempts: usize, errors: Vec<String> },
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "quota",
    "resource exhausted",
    "resource_exhausted",
];

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const NETWORK_MARKERS: &[&str] = &[
    "connection reset",
    "econnreset",
    "connection refused",
    "econnrefused",
    "connection closed",
    "socket hang up",
    "broken pipe",
];

const TOOL_UNSUPPORTED_MARKERS: &[&str] = &[
    "support tool use",
    "does not support tools",
    "tools are not supported",
    "tool calling is not supported",
    "does not support function calling",
    "function calling is not supported",
];

/// 错误消息中形如状态码的标记
fn status_marker(message: &str) -> Option<u16> {
    static STATUS_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = STATUS_RE
        .get_or_init(|| Regex::new(r"\b(408|429|502|503|504)\b").ok())
        .as_ref()?;
    re.captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl LlmError {
    /// 由状态码与错误消息构造带分类的错误
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        let lower = message.to_lowercase();
        match status.or_else(|| status_marker(message)) {
            Some(429) => return LlmError::RateLimited { retry_after_ms: None },
            Some(408) | Some(504) => return LlmError::Timeout,
            Some(502) | Some(503) => return LlmError::Network(message.to_string()),
            _ => {}
        }
        if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::RateLimited { retry_after_ms: None }
        } else if TIMEOUT_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::Timeout
        } else if NETWORK_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::Network(message.to_string())
        } else if TOOL_UNSUPPORTED_MARKERS.iter().any(|m| lower.contains(m)) {
            LlmError::ToolCallingUnsupported(message.to_string())
        } else {
            LlmError::Api {
                status,
                message: message.to_string(),
            }
        }
    }

    /// 由分类还原错误（用于 200 响应中夹带的错误）
    pub fn from_kind(kind: LlmErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            LlmErrorKind::RateLimited => LlmError::RateLimited { retry_after_ms: None },
            LlmErrorKind::Timeout => LlmError::Timeout,
            LlmErrorKind::Network => LlmError::Network(detail),
            LlmErrorKind::ToolCallingUnsupported => LlmError::ToolCallingUnsupported(detail),
            LlmErrorKind::Api => LlmError::Api {
                status: None,
                message: detail,
            },
            LlmErrorKind::InvalidResponse => LlmError::InvalidResponse(detail),
            LlmErrorKind::Cancelled => LlmError::Cancelled,
            LlmErrorKind::Exhausted => LlmError::Exhausted {
                attempts: 0,
                errors: vec![detail],
            },
        }
    }

    pub fn kind(&self) -> LlmErrorKind {
        match self {
            LlmError::RateLimited { .. } => LlmErrorKind::RateLimited,
            LlmError::Timeout => LlmErrorKind::Timeout,
            LlmError::Network(_) => LlmErrorKind::Network,
            LlmError::ToolCallingUnsupported(_) => LlmErrorKind::ToolCallingUnsupported,
            LlmError::Api { .. } | LlmError::EmptyStack => LlmErrorKind::Api,
            LlmError::InvalidResponse(_) => LlmErrorKind::InvalidResponse,
            LlmError::Cancelled => LlmErrorKind::Cancelled,
            LlmError::Exhausted { .. } => LlmErrorKind::Exhausted,
        }
    }

    /// 是否可切换到下一个模型
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::Timeout
                | LlmError::Network(_)
                | LlmError::ToolCallingUnsupported(_)
        )
    }

    /// 后端给出的建议等待时间
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// 故障转移之间的退避策略：指数增长，上限 max_backoff；限流提示的等待时间同样受上限约束
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 不等待，直接切换（测试用）
    pub fn none() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// 第 failed_attempts 次失败后、尝试下一个模型前的等待时间
    pub fn delay_for(&self, failed_attempts: u32, error: &LlmError) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let scaled = (self.initial_backoff.as_nanos() as f64 * factor).round();
        let cap = self.max_backoff.as_nanos() as f64;
        let backoff = Duration::from_nanos(scaled.min(cap) as u64);
        match error.retry_after() {
            Some(hint) => hint.max(backoff).min(self.max_backoff),
            None => backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_status() {
        assert!(matches!(
            LlmError::classify(Some(429), "Rate Limit"),
            LlmError::RateLimited { .. }
        ));
        assert_eq!(LlmError::classify(Some(504), "gateway"), LlmError::Timeout);
        assert!(matches!(
            LlmError::classify(Some(503), "unavailable"),
            LlmError::Network(_)
        ));
        assert!(matches!(
            LlmError::classify(Some(400), "bad request"),
            LlmError::Api { status: Some(400), .. }
        ));
    }

    #[test]
    fn test_classify_by_message() {
        assert!(LlmError::classify(None, "Daily quota exceeded for model").is_retryable());
        assert!(LlmError::classify(None, "upstream error 429 from provider").is_retryable());
        assert_eq!(LlmError::classify(None, "request timed out"), LlmError::Timeout);
        assert!(matches!(
            LlmError::classify(None, "read ECONNRESET"),
            LlmError::Network(_)
        ));
        assert!(matches!(
            LlmError::classify(Some(404), "No endpoints found that support tool use"),
            LlmError::ToolCallingUnsupported(_)
        ));
        assert!(!LlmError::classify(Some(401), "invalid api key").is_retryable());
    }

    #[test]
    fn test_non_retryable_variants() {
        assert!(!LlmError::Cancelled.is_retryable());
        assert!(!LlmError::InvalidResponse("x".into()).is_retryable());
        assert!(!LlmError::Exhausted {
            attempts: 3,
            errors: vec![]
        }
        .is_retryable());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        };
        let err = LlmError::Timeout;
        assert_eq!(retry.delay_for(1, &err), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2, &err), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3, &err), Duration::from_millis(300));
    }

    #[test]
    fn test_retry_after_hint_is_respected_up_to_cap() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
            multiplier: 2.0,
        };
        let hinted = LlmError::RateLimited {
            retry_after_ms: Some(400),
        };
        assert_eq!(retry.delay_for(1, &hinted), Duration::from_millis(400));
        let too_long = LlmError::RateLimited {
            retry_after_ms: Some(60_000),
        };
        assert_eq!(retry.delay_for(1, &too_long), Duration::from_millis(1000));
    }

    #[test]
    fn test_kind_roundtrip_keeps_retryability() {
        let err = LlmError::from_kind(LlmErrorKind::ToolCallingUnsupported, "model-x");
        assert_eq!(err.kind(), LlmErrorKind::ToolCallingUnsupported);
        assert!(err.is_retryable());
    }
}
