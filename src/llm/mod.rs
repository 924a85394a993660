//! LLM 层：客户端抽象、OpenRouter 实现、多模型故障转移与文本工具调用解析

pub mod call_syntax;
pub mod mock;
pub mod openrouter;
pub mod response;
pub mod router;
pub mod traits;

pub use call_syntax::{extract_tool_call, parse_call, CallExpr, ParseError};
pub use mock::MockLlmClient;
pub use openrouter::{OpenRouterClient, FREE_MODEL_STACK, OPENROUTER_BASE_URL, POLYFILL_MODELS};
pub use response::{
    ProviderResponse, ResponsePart, TokenUsage, ToolInvocation, AGENT_NAME_KEY,
    LEGACY_AGENT_NAME_KEY, TRANSFER_TOOL,
};
pub use router::{is_polyfill_model, normalize_text_tool_calls, FailoverRouter, ModelStack, RoutedResponse};
pub use traits::{LlmClient, LlmError, LlmErrorKind, RetryConfig};
