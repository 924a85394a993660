//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `KILIG__*` 覆盖（双下划线表示嵌套，如 `KILIG__WORKFLOW__MAX_NARRATIVE_ATTEMPTS=5`）。
//! 列表键（model_stack / polyfill_models）在环境变量中用逗号分隔。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agents::RunnerOptions;
use crate::llm::{RetryConfig, FREE_MODEL_STACK, OPENROUTER_BASE_URL, POLYFILL_MODELS};
use crate::workflow::EngineOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub agents: AgentsSection,
    pub workflow: WorkflowSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 未指定用户时使用
    pub default_user_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "kilig".to_string(),
            default_user_id: "local".to_string(),
        }
    }
}

/// [llm] 段：OpenRouter 地址、模型栈、超时与退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    /// 未设置时读取 OPENROUTER_API_KEY
    pub api_key: Option<String>,
    /// 按优先级排列的模型
    pub model_stack: Vec<String>,
    /// 只能以文本输出工具调用的模型
    pub polyfill_models: Vec<String>,
    pub timeouts: LlmTimeoutsSection,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: OPENROUTER_BASE_URL.to_string(),
            api_key: None,
            model_stack: FREE_MODEL_STACK.iter().map(|m| m.to_string()).collect(),
            polyfill_models: POLYFILL_MODELS.iter().map(|m| m.to_string()).collect(),
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [llm.retry] 段：切换模型前的退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            multiplier: 2.0,
        }
    }
}

impl LlmRetrySection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// [agents] 段：委派轮数与对话保留轮数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub max_turns: usize,
    pub history_turns: usize,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            max_turns: 12,
            history_turns: 20,
        }
    }
}

/// [workflow] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub success_marker: String,
    pub max_narrative_attempts: u32,
    /// memory / sqlite
    pub store: StoreKind,
    pub sqlite_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            success_marker: "VALID".to_string(),
            max_narrative_attempts: 3,
            store: StoreKind::Sqlite,
            sqlite_path: PathBuf::from("data/kilig.db"),
        }
    }
}

impl AppConfig {
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            max_turns: self.agents.max_turns,
            history_turns: self.agents.history_turns,
            tool_timeout: Duration::from_secs(self.tools.tool_timeout_secs),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            success_marker: self.workflow.success_marker.clone(),
            max_narrative_attempts: self.workflow.max_narrative_attempts,
        }
    }
}

/// 从 config 目录加载配置，环境变量 KILIG__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 KILIG__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("KILIG")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("llm.model_stack")
            .with_list_parse_key("llm.polyfill_models")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
