//! 核心层：Agent 错误类型、会话监管（取消令牌与单会话租约）

pub mod error;
pub mod session_supervisor;

pub use error::AgentError;
pub use session_supervisor::{SessionLease, SessionSupervisor};
