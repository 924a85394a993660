//! 多模型故障转移路由
//!
//! 按模型栈声明顺序依次尝试：可重试错误（限流、超时、网络、不支持原生工具调用）切换到下一个模型，
//! 其它错误立即返回。每次逻辑请求最多调用 N 次（N = 栈长度），栈不会被第二次遍历。
//! 成功的响应若没有原生工具调用，则尝试从文本代码块中恢复工具调用。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::call_syntax::extract_tool_call;
use super::{LlmClient, LlmError, ProviderResponse, ResponsePart, RetryConfig};
use crate::memory::Message;
use crate::tools::ToolSchema;

/// 有序、非空的模型标识序列；遍历位置属于每次调用，不保存在栈上
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelStack {
    models: Vec<String>,
}

impl ModelStack {
    pub fn new<I, S>(models: I) -> Result<Self, LlmError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let models: Vec<String> = models
            .into_iter()
            .map(Into::into)
            .filter(|m: &String| !m.trim().is_empty())
            .collect();
        if models.is_empty() {
            return Err(LlmError::EmptyStack);
        }
        Ok(Self { models })
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn primary(&self) -> &str {
        &self.models[0]
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// 路由成功的结果：归一化响应、实际使用的模型与尝试次数
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: ProviderResponse,
    pub model: String,
    pub attempts: usize,
}

/// 模型是否在 polyfill 列表中；比较时忽略 `:free` 之类的变体后缀
pub fn is_polyfill_model(polyfill_models: &[String], model: &str) -> bool {
    let base = |m: &str| m.split(':').next().unwrap_or(m).trim().to_string();
    let model = base(model);
    polyfill_models.iter().any(|p| base(p) == model)
}

/// 故障转移路由器：持有与模型栈一一对应的客户端
pub struct FailoverRouter {
    backends: Vec<Arc<dyn LlmClient>>,
    retry: RetryConfig,
    /// 已知只会用文本输出工具调用的模型（仅用于日志）
    polyfill_models: Vec<String>,
}

impl FailoverRouter {
    pub fn new(backends: Vec<Arc<dyn LlmClient>>, retry: RetryConfig) -> Result<Self, LlmError> {
        if backends.is_empty() {
            return Err(LlmError::EmptyStack);
        }
        Ok(Self {
            backends,
            retry,
            polyfill_models: Vec::new(),
        })
    }

    /// 由模型栈与客户端工厂构建，工厂对每个模型标识调用一次
    pub fn from_stack<F>(stack: &ModelStack, retry: RetryConfig, mut factory: F) -> Result<Self, LlmError>
    where
        F: FnMut(&str) -> Result<Arc<dyn LlmClient>, LlmError>,
    {
        let backends = stack
            .models()
            .iter()
            .map(|m| factory(m))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(backends, retry)
    }

    pub fn with_polyfill_models(mut self, models: Vec<String>) -> Self {
        self.polyfill_models = models;
        self
    }

    pub fn models(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.model().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn is_polyfill(&self, model: &str) -> bool {
        is_polyfill_model(&self.polyfill_models, model)
    }

    /// 执行一次逻辑请求；所有模型失败后返回 Exhausted，取消时返回 Cancelled
    pub async fn invoke(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<RoutedResponse, LlmError> {
        let mut errors = Vec::with_capacity(self.backends.len());

        for (index, backend) in self.backends.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            let model = backend.model();
            tracing::info!(model, attempt = index + 1, "Trying model");

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                r = backend.invoke(messages, tools) => r,
            };

            let error = match result {
                Ok(response) => match response.error_kind {
                    Some(kind) => LlmError::from_kind(kind, format!("in-band error from {model}")),
                    None => {
                        let mut response = response;
                        if normalize_text_tool_calls(&mut response) {
                            tracing::info!(
                                model,
                                polyfill = self.is_polyfill(model),
                                "Recovered tool call from text output"
                            );
                        }
                        return Ok(RoutedResponse {
                            response,
                            model: model.to_string(),
                            attempts: index + 1,
                        });
                    }
                },
                Err(e) => e,
            };

            if matches!(error, LlmError::Cancelled) || !error.is_retryable() {
                tracing::error!(model, error = %error, "Non-retryable model error");
                return Err(error);
            }

            tracing::warn!(model, error = %error, "Model failed, switching to next model");
            errors.push(format!("{model}: {error}"));

            if index + 1 < self.backends.len() {
                let delay = self.retry.delay_for((index + 1) as u32, &error);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Err(LlmError::Exhausted {
            attempts: self.backends.len(),
            errors,
        })
    }
}

/// 响应中没有原生工具调用时，从第一个文本片段的代码块中恢复一个调用并追加到片段末尾；返回是否恢复成功
pub fn normalize_text_tool_calls(response: &mut ProviderResponse) -> bool {
    if response.has_tool_calls() {
        return false;
    }
    let recovered = response.texts().next().and_then(extract_tool_call);
    match recovered {
        Some(call) => {
            response.parts.push(ResponsePart::ToolCall(call));
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmErrorKind, MockLlmClient, ToolInvocation};

    fn router(backends: Vec<Arc<MockLlmClient>>) -> FailoverRouter {
        let backends = backends
            .into_iter()
            .map(|b| b as Arc<dyn LlmClient>)
            .collect();
        FailoverRouter::new(backends, RetryConfig::none()).unwrap()
    }

    #[test]
    fn test_from_stack_builds_one_backend_per_model() {
        let stack = ModelStack::new(vec!["a", "b"]).unwrap();
        let router = FailoverRouter::from_stack(&stack, RetryConfig::none(), |m| {
            Ok(Arc::new(MockLlmClient::new(m)) as Arc<dyn LlmClient>)
        })
        .unwrap();
        assert_eq!(router.models(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_model_stack_rejects_empty() {
        assert_eq!(ModelStack::new(Vec::<String>::new()), Err(LlmError::EmptyStack));
        assert_eq!(ModelStack::new(vec!["  "]), Err(LlmError::EmptyStack));
        let stack = ModelStack::new(vec!["a", "b"]).unwrap();
        assert_eq!(stack.primary(), "a");
        assert_eq!(stack.len(), 2);
    }

    #[tokio::test]
    async fn test_failover_to_third_model() {
        let a = Arc::new(MockLlmClient::failing("model-a", LlmError::RateLimited { retry_after_ms: None }));
        let b = Arc::new(MockLlmClient::failing("model-b", LlmError::Timeout));
        let c = Arc::new(MockLlmClient::always_text("model-c", "hello"));
        let router = router(vec![a.clone(), b.clone(), c.clone()]);

        let routed = router
            .invoke(&[Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.attempts, 3);
        assert_eq!(routed.model, "model-c");
        assert_eq!(routed.response.text(), "hello");
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_exhausted_after_exactly_n_attempts() {
        let backends: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|m| Arc::new(MockLlmClient::failing(*m, LlmError::Network("reset".into()))))
            .collect();
        let router = router(backends.clone());

        let err = router
            .invoke(&[Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            LlmError::Exhausted { attempts, errors } => {
                assert_eq!(attempts, 3);
                assert_eq!(errors.len(), 3);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert!(backends.iter().all(|b| b.calls() == 1));
    }

    #[tokio::test]
    async fn test_non_retryable_error_aborts_immediately() {
        let a = Arc::new(MockLlmClient::failing(
            "a",
            LlmError::Api {
                status: Some(401),
                message: "bad key".into(),
            },
        ));
        let b = Arc::new(MockLlmClient::always_text("b", "unused"));
        let router = router(vec![a.clone(), b.clone()]);

        let err = router
            .invoke(&[Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Api { status: Some(401), .. }));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_in_band_error_kind_triggers_failover() {
        let mut flagged = ProviderResponse::from_text("partial");
        flagged.error_kind = Some(LlmErrorKind::RateLimited);
        let a = Arc::new(MockLlmClient::scripted("a", vec![Ok(flagged)]));
        let b = Arc::new(MockLlmClient::always_text("b", "ok"));
        let router = router(vec![a, b]);

        let routed = router
            .invoke(&[Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.model, "b");
        assert_eq!(routed.attempts, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let a = Arc::new(MockLlmClient::always_text("a", "ok"));
        let router = router(vec![a.clone()]);
        let token = CancellationToken::new();
        token.cancel();

        let err = router.invoke(&[Message::user("hi")], &[], &token).await.unwrap_err();
        assert_eq!(err, LlmError::Cancelled);
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_text_tool_call_is_normalized() {
        let a = Arc::new(MockLlmClient::always_text(
            "google/gemma-3-27b-it:free",
            "```tool_code\ntransfer_to_agent(agent_name='scientist')\n```",
        ));
        let router = router(vec![a]).with_polyfill_models(vec!["google/gemma-3-27b-it:free".into()]);

        let routed = router
            .invoke(&[Message::user("hi")], &[], &CancellationToken::new())
            .await
            .unwrap();
        let transfer = routed.response.transfer().unwrap();
        assert_eq!(transfer, &ToolInvocation::transfer("scientist"));
    }

    #[test]
    fn test_polyfill_match_ignores_variant_suffix() {
        let list = vec!["google/gemma-3-27b-it:free".to_string()];
        assert!(is_polyfill_model(&list, "google/gemma-3-27b-it:free"));
        assert!(is_polyfill_model(&list, "google/gemma-3-27b-it"));
        assert!(is_polyfill_model(&list, "google/gemma-3-27b-it:nitro"));
        assert!(!is_polyfill_model(&list, "google/gemma-3-27b-it-v2:free"));
        assert!(!is_polyfill_model(&list, "xiaomi/mimo-v2-flash:free"));
        assert!(!is_polyfill_model(&[], "google/gemma-3-27b-it:free"));
    }

    #[test]
    fn test_native_tool_calls_skip_normalization() {
        let mut response = ProviderResponse::from_parts(vec![
            ResponsePart::Text("```\nf(a=1)\n```".into()),
            ResponsePart::ToolCall(ToolInvocation::transfer("root")),
        ]);
        assert!(!normalize_text_tool_calls(&mut response));
        assert_eq!(response.parts.len(), 2);
    }
}
