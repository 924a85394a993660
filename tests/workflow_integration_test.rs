//! 工作流集成测试：Mock 模型 → 委派运行器 → 工作流引擎 → SQLite 存储

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kilig::agents::{standard_graph, DelegationRunner, RunnerOptions};
use kilig::core::SessionSupervisor;
use kilig::llm::{FailoverRouter, LlmClient, LlmError, MockLlmClient, ProviderResponse, RetryConfig};
use kilig::workflow::{
    EngineOptions, SqliteWorkflowStore, WorkflowEngine, WorkflowStep, WorkflowStore,
};

fn texts(outputs: &[&str]) -> Vec<Result<ProviderResponse, LlmError>> {
    outputs
        .iter()
        .map(|s| Ok(ProviderResponse::from_text(*s)))
        .collect()
}

fn engine_on(db: &Path, llm: Arc<MockLlmClient>, max_attempts: u32) -> WorkflowEngine {
    let router = FailoverRouter::new(vec![llm as Arc<dyn LlmClient>], RetryConfig::none()).unwrap();
    let graph = standard_graph(None).unwrap();
    let runner = DelegationRunner::new(Arc::new(graph), Arc::new(router), RunnerOptions::default());
    let store = Arc::new(SqliteWorkflowStore::open(db).unwrap());
    WorkflowEngine::new(
        store,
        Arc::new(runner),
        Arc::new(SessionSupervisor::new()),
        EngineOptions {
            max_narrative_attempts: max_attempts,
            ..EngineOptions::default()
        },
    )
}

#[tokio::test]
async fn test_research_narrative_validate_done() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::scripted(
        "model-a",
        texts(&["Research: tides follow the moon", "Panel 1: the moon pulls", "VALID"]),
    ));
    let engine = engine_on(&dir.path().join("kilig.db"), llm.clone(), 3);

    let step = engine
        .run_to_completion("s1", "alice", Some("Comic about tides"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, WorkflowStep::Done);
    assert_eq!(llm.calls(), 3);

    let record = engine.load("s1").await.unwrap().unwrap();
    assert_eq!(record.user_id, "alice");
    assert_eq!(record.current_step, WorkflowStep::Done);
    assert_eq!(record.state.classification, "comic");
    assert_eq!(
        record.state.result(WorkflowStep::Research),
        Some("Research: tides follow the moon")
    );
    assert_eq!(record.state.narrative_attempts, 1);
    assert!(record.state.validation.as_ref().unwrap().is_valid);
}

#[tokio::test]
async fn test_rejected_draft_is_rewritten_with_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::scripted(
        "model-a",
        texts(&[
            "Research notes",
            "Draft one",
            "INVALID: missing citations",
            "Draft two",
            "VALID",
        ]),
    ));
    let engine = engine_on(&dir.path().join("kilig.db"), llm.clone(), 3);

    let step = engine
        .run_to_completion("s2", "bob", Some("Video on black holes"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, WorkflowStep::Done);

    let record = engine.load("s2").await.unwrap().unwrap();
    assert_eq!(record.state.classification, "video");
    assert_eq!(record.state.result(WorkflowStep::Research), Some("Research notes"));
    assert_eq!(record.state.result(WorkflowStep::Narrative), Some("Draft two"));
    assert_eq!(record.state.narrative_attempts, 2);

    // 第二次 narrative 调用的提示词带有质检意见与上一版草稿
    let rewrite_prompt = llm.seen_messages()[3]
        .last()
        .map(|m| m.content.clone())
        .unwrap();
    assert!(rewrite_prompt.contains("missing citations"));
    assert!(rewrite_prompt.contains("Draft one"));
    assert!(rewrite_prompt.contains("Research notes"));
}

#[tokio::test]
async fn test_retry_ceiling_ends_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::scripted(
        "model-a",
        texts(&["Research", "Draft", "INVALID: wrong", "Draft again", "INVALID: still wrong"]),
    ));
    let engine = engine_on(&dir.path().join("kilig.db"), llm.clone(), 2);

    let step = engine
        .run_to_completion("s3", "carol", Some("Comic on enzymes"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, WorkflowStep::Error);
    assert_eq!(llm.calls(), 5);

    let record = engine.load("s3").await.unwrap().unwrap();
    assert_eq!(record.state.narrative_attempts, 2);
    assert!(record.state.error.as_deref().unwrap().contains("2 narrative attempts"));
    assert!(!record.state.validation.as_ref().unwrap().is_valid);
}

#[tokio::test]
async fn test_session_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("kilig.db");

    let first = Arc::new(MockLlmClient::scripted("model-a", texts(&["Research notes"])));
    let engine = engine_on(&db, first, 3);
    let step = engine
        .run_step("s4", "dave", Some("Comic on volcanoes"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, WorkflowStep::Narrative);
    drop(engine);

    let second = Arc::new(MockLlmClient::scripted("model-a", texts(&["Draft", "VALID"])));
    let engine = engine_on(&db, second.clone(), 3);
    let step = engine
        .run_to_completion("s4", "dave", None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, WorkflowStep::Done);
    assert_eq!(second.calls(), 2);

    let store = SqliteWorkflowStore::open(&db).unwrap();
    let record = store.load("s4").await.unwrap().unwrap();
    assert_eq!(record.state.result(WorkflowStep::Research), Some("Research notes"));
    assert_eq!(record.state.result(WorkflowStep::Narrative), Some("Draft"));
}

#[tokio::test]
async fn test_provider_failure_is_recorded_as_error_step() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlmClient::failing("model-a", LlmError::Timeout));
    let engine = engine_on(&dir.path().join("kilig.db"), llm, 3);

    let step = engine
        .run_step("s5", "erin", Some("Comic on atoms"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(step, WorkflowStep::Error);

    let record = engine.load("s5").await.unwrap().unwrap();
    assert!(record.state.error.is_some());
    assert!(record.state.results.is_empty());
}
