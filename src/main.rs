//! Kilig - 多 Agent 科学内容生成流水线
//!
//! 入口：初始化日志、加载配置、构建模型路由与 Agent 图，然后执行子命令。
//! - `kilig workflow <input>`：驱动一个会话直到终止步骤
//! - `kilig chat <input>`：从 root 开始跑一次自由委派
//! - `kilig status <session>`：查看会话状态

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use kilig::agents::{standard_graph, DelegationRunner};
use kilig::config::{load_config, AppConfig, StoreKind};
use kilig::core::SessionSupervisor;
use kilig::llm::{is_polyfill_model, FailoverRouter, LlmClient, ModelStack, OpenRouterClient};
use kilig::tools::{ArtifactStore, ReadArtifactTool, SaveArtifactTool, ToolRegistry};
use kilig::workflow::{InMemoryWorkflowStore, SqliteWorkflowStore, WorkflowEngine, WorkflowStore};

#[derive(Parser, Debug)]
#[command(name = "kilig")]
#[command(version, about = "Resilient multi-agent orchestration for scientific media", long_about = None)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, env = "KILIG_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行工作流（research → narrative → validate）
    Workflow {
        /// 新会话的请求文本；继续已有会话时可省略
        input: Option<String>,

        /// 会话 ID，默认新建
        #[arg(short, long)]
        session: Option<String>,

        #[arg(short, long)]
        user: Option<String>,

        /// 只执行一个步骤
        #[arg(long)]
        step: bool,
    },

    /// 从 root Agent 开始自由委派
    Chat {
        input: String,
    },

    /// 打印会话状态（JSON）
    Status {
        session: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kilig::observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;

    let supervisor = Arc::new(SessionSupervisor::new());
    let ctrl_c = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl+C received, cancelling in-flight calls");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Commands::Workflow {
            input,
            session,
            user,
            step,
        } => {
            let engine = build_engine(&cfg, supervisor.clone())?;
            let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let user_id = user.unwrap_or_else(|| cfg.app.default_user_id.clone());
            let cancel = supervisor.child_token();

            let result = if step {
                engine
                    .run_step(&session_id, &user_id, input.as_deref(), &cancel)
                    .await
            } else {
                engine
                    .run_to_completion(&session_id, &user_id, input.as_deref(), &cancel)
                    .await
            };
            let final_step = result.with_context(|| format!("Workflow {session_id} failed"))?;
            println!("session: {session_id}\nstep: {final_step}");
            if let Some(record) = engine.load(&session_id).await? {
                println!("{}", serde_json::to_string_pretty(&record.state)?);
            }
        }
        Commands::Chat { input } => {
            let runner = build_runner(&cfg)?;
            let outcome = runner
                .run(&input, &supervisor.child_token())
                .await
                .context("Delegation failed")?;
            for handoff in &outcome.transfers {
                println!("-> {} => {}", handoff.from, handoff.to);
            }
            for violation in &outcome.violations {
                println!("!! rejected {} => {}", violation.from, violation.to);
            }
            println!(
                "[{}] ({} turns, {} tokens)\n{}",
                outcome.agent, outcome.turns, outcome.usage.total_tokens, outcome.text
            );
        }
        Commands::Status { session } => {
            let store = build_store(&cfg)?;
            match store.load(&session).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("Session {session} not found"),
            }
        }
    }

    Ok(())
}

fn build_router(cfg: &AppConfig) -> anyhow::Result<FailoverRouter> {
    let stack = ModelStack::new(cfg.llm.model_stack.clone()).context("llm.model_stack is empty")?;
    let timeout = Duration::from_secs(cfg.llm.timeouts.request);
    let router = FailoverRouter::from_stack(&stack, cfg.llm.retry.to_retry_config(), |model| {
        let polyfill = is_polyfill_model(&cfg.llm.polyfill_models, model);
        let client = OpenRouterClient::new(
            Some(&cfg.llm.base_url),
            model,
            cfg.llm.api_key.as_deref(),
            timeout,
        )?
        .with_polyfill(polyfill);
        Ok(Arc::new(client) as Arc<dyn LlmClient>)
    })
    .context("Failed to build model router")?;
    tracing::info!(models = ?router.models(), "Model stack ready");
    Ok(router.with_polyfill_models(cfg.llm.polyfill_models.clone()))
}

fn build_runner(cfg: &AppConfig) -> anyhow::Result<DelegationRunner> {
    let artifacts = ArtifactStore::new();
    let mut tools = ToolRegistry::new();
    tools.register(SaveArtifactTool::new(artifacts.clone()));
    tools.register(ReadArtifactTool::new(artifacts));

    let graph = standard_graph(Some(Arc::new(tools))).context("Failed to wire agent graph")?;
    Ok(DelegationRunner::new(
        Arc::new(graph),
        Arc::new(build_router(cfg)?),
        cfg.runner_options(),
    ))
}

fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn WorkflowStore>> {
    Ok(match cfg.workflow.store {
        StoreKind::Memory => Arc::new(InMemoryWorkflowStore::new()),
        StoreKind::Sqlite => Arc::new(
            SqliteWorkflowStore::open(&cfg.workflow.sqlite_path).with_context(|| {
                format!("Failed to open {}", cfg.workflow.sqlite_path.display())
            })?,
        ),
    })
}

fn build_engine(cfg: &AppConfig, supervisor: Arc<SessionSupervisor>) -> anyhow::Result<WorkflowEngine> {
    Ok(WorkflowEngine::new(
        build_store(cfg)?,
        Arc::new(build_runner(cfg)?),
        supervisor,
        cfg.engine_options(),
    ))
}
