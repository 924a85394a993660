//! 工作流状态存储
//!
//! 每个 session 一条记录：{state, current_step}。update 是条件写：只有当前步骤等于 expected 时才提交，
//! 否则返回 Conflict，避免同一 session 的并发重试互相覆盖。提供内存与 SQLite 两种实现。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::workflow::types::{StatePatch, StateRecord, WorkflowState, WorkflowStep};

/// 存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    #[error("Step conflict for session {session_id}: expected {expected}, found {found}")]
    Conflict {
        session_id: String,
        expected: WorkflowStep,
        found: WorkflowStep,
    },

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(format!("state serialization: {e}"))
    }
}

/// 工作流存储接口
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// 新建会话，初始步骤为 step_research
    async fn create(
        &self,
        session_id: &str,
        user_id: &str,
        state: WorkflowState,
    ) -> Result<StateRecord, StoreError>;

    /// 读取会话；不存在时返回 None
    async fn load(&self, session_id: &str) -> Result<Option<StateRecord>, StoreError>;

    /// 合并 patch 并（可选）推进步骤；当前步骤不等于 expected 时返回 Conflict
    async fn update(
        &self,
        session_id: &str,
        patch: StatePatch,
        expected: WorkflowStep,
        next: Option<WorkflowStep>,
    ) -> Result<StateRecord, StoreError>;
}

fn check_expected(record: &StateRecord, expected: WorkflowStep) -> Result<(), StoreError> {
    if record.current_step != expected {
        return Err(StoreError::Conflict {
            session_id: record.session_id.clone(),
            expected,
            found: record.current_step,
        });
    }
    Ok(())
}

/// 内存存储（测试与单进程使用）
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    records: RwLock<HashMap<String, StateRecord>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(
        &self,
        session_id: &str,
        user_id: &str,
        state: WorkflowState,
    ) -> Result<StateRecord, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(session_id) {
            return Err(StoreError::AlreadyExists(session_id.to_string()));
        }
        let now = Utc::now();
        let record = StateRecord {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            state,
            current_step: WorkflowStep::Research,
            created_at: now,
            updated_at: now,
        };
        records.insert(session_id.to_string(), record.clone());
        Ok(record)
    }

    async fn load(&self, session_id: &str) -> Result<Option<StateRecord>, StoreError> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn update(
        &self,
        session_id: &str,
        patch: StatePatch,
        expected: WorkflowStep,
        next: Option<WorkflowStep>,
    ) -> Result<StateRecord, StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        check_expected(record, expected)?;
        patch.apply(&mut record.state);
        if let Some(next) = next {
            record.current_step = next;
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_states (
    session_id   TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    state        TEXT NOT NULL,
    current_step TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflow_states_user_id ON workflow_states(user_id);
"#;

/// SQLite 存储：单连接加锁，所有操作在 spawn_blocking 中执行
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWorkflowStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("create {}: {e}", parent.display())))?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp '{raw}': {e}")))
}

fn read_record(conn: &Connection, session_id: &str) -> Result<Option<StateRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT user_id, state, current_step, created_at, updated_at
             FROM workflow_states WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((user_id, state, step, created_at, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(StateRecord {
        session_id: session_id.to_string(),
        user_id,
        state: serde_json::from_str(&state)?,
        current_step: step
            .parse()
            .map_err(|_| StoreError::Backend(format!("unknown step '{step}' in store")))?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    }))
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn create(
        &self,
        session_id: &str,
        user_id: &str,
        state: WorkflowState,
    ) -> Result<StateRecord, StoreError> {
        let now = Utc::now();
        let record = StateRecord {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            state,
            current_step: WorkflowStep::Research,
            created_at: now,
            updated_at: now,
        };
        let row = record.clone();
        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO workflow_states
                 (session_id, user_id, state, current_step, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.session_id,
                    row.user_id,
                    serde_json::to_string(&row.state)?,
                    row.current_step.as_str(),
                    row.created_at.to_rfc3339(),
                    row.updated_at.to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists(row.session_id));
            }
            Ok(())
        })
        .await?;
        Ok(record)
    }

    async fn load(&self, session_id: &str) -> Result<Option<StateRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| read_record(conn, &session_id)).await
    }

    async fn update(
        &self,
        session_id: &str,
        patch: StatePatch,
        expected: WorkflowStep,
        next: Option<WorkflowStep>,
    ) -> Result<StateRecord, StoreError> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let mut record = read_record(&tx, &session_id)?
                .ok_or_else(|| StoreError::NotFound(session_id.clone()))?;
            check_expected(&record, expected)?;

            patch.apply(&mut record.state);
            if let Some(next) = next {
                record.current_step = next;
            }
            record.updated_at = Utc::now();

            let changed = tx.execute(
                "UPDATE workflow_states
                 SET state = ?1, current_step = ?2, updated_at = ?3
                 WHERE session_id = ?4 AND current_step = ?5",
                params![
                    serde_json::to_string(&record.state)?,
                    record.current_step.as_str(),
                    record.updated_at.to_rfc3339(),
                    session_id,
                    expected.as_str(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict {
                    session_id,
                    expected,
                    found: record.current_step,
                });
            }
            tx.commit()?;
            Ok(record)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn WorkflowStore) {
        let created = store
            .create("s1", "u1", WorkflowState::new("Tides"))
            .await
            .unwrap();
        assert_eq!(created.current_step, WorkflowStep::Research);
        assert!(matches!(
            store.create("s1", "u1", WorkflowState::new("again")).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let updated = store
            .update(
                "s1",
                StatePatch::new().with_result(WorkflowStep::Research, "facts"),
                WorkflowStep::Research,
                Some(WorkflowStep::Narrative),
            )
            .await
            .unwrap();
        assert_eq!(updated.current_step, WorkflowStep::Narrative);

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.current_step, WorkflowStep::Narrative);
        assert_eq!(loaded.state.result(WorkflowStep::Research), Some("facts"));
        assert_eq!(loaded.state.text, "Tides");
        assert_eq!(loaded.user_id, "u1");

        let stale = store
            .update(
                "s1",
                StatePatch::new().with_error("late writer"),
                WorkflowStep::Research,
                Some(WorkflowStep::Error),
            )
            .await;
        assert!(matches!(
            stale,
            Err(StoreError::Conflict { expected: WorkflowStep::Research, found: WorkflowStep::Narrative, .. })
        ));
        let unchanged = store.load("s1").await.unwrap().unwrap();
        assert_eq!(unchanged.state.error, None);

        assert!(store.load("missing").await.unwrap().is_none());
        assert!(matches!(
            store
                .update("missing", StatePatch::new(), WorkflowStep::Research, None)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise(&InMemoryWorkflowStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        exercise(&SqliteWorkflowStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("kilig.db");
        {
            let store = SqliteWorkflowStore::open(&path).unwrap();
            store.create("s1", "u1", WorkflowState::new("X")).await.unwrap();
        }
        let reopened = SqliteWorkflowStore::open(&path).unwrap();
        let record = reopened.load("s1").await.unwrap().unwrap();
        assert_eq!(record.current_step, WorkflowStep::Research);
        assert_eq!(record.state.classification, "comic");
    }
}
