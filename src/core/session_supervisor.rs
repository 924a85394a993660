//! 会话监管：取消令牌与单会话写租约
//!
//! 持有根 CancellationToken，Ctrl+C 时取消所有在途调用；每个 session 一把 tokio Mutex，
//! 保证同一 session 同时只有一个步骤在执行（不同 session 互不影响）。
//! 最后一个租约释放且无人等待时，该 session 的锁条目随之移除。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

type LeaseTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

fn lock_table(table: &LeaseTable) -> std::sync::MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// 持有期间独占某个 session 的执行权
#[derive(Debug)]
pub struct SessionLease {
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: LeaseTable,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        // 先放锁，再看表里的条目是否只剩自身引用
        drop(self.guard.take());
        let mut leases = lock_table(&self.table);
        let idle = leases
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            leases.remove(&self.session_id);
        }
    }
}

/// 会话级生命周期管理
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    /// 用户 Cancel 时触发
    cancel_token: CancellationToken,
    leases: LeaseTable,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// 创建子 token（用于单个步骤）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    fn lock_for(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        lock_table(&self.leases)
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// 等待并获取 session 租约
    pub async fn acquire(&self, session_id: &str) -> SessionLease {
        let guard = self.lock_for(session_id).lock_owned().await;
        self.lease(session_id, guard)
    }

    /// 租约已被占用时立即返回 None
    pub fn try_acquire(&self, session_id: &str) -> Option<SessionLease> {
        let guard = self.lock_for(session_id).try_lock_owned().ok()?;
        Some(self.lease(session_id, guard))
    }

    fn lease(&self, session_id: &str, guard: OwnedMutexGuard<()>) -> SessionLease {
        SessionLease {
            session_id: session_id.to_string(),
            guard: Some(guard),
            table: Arc::clone(&self.leases),
        }
    }

    /// 当前仍有持有者或等待者的 session 数
    pub fn tracked_sessions(&self) -> usize {
        lock_table(&self.leases).len()
    }
}
