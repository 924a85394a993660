//! 记忆层：委派过程中的短期对话记录

pub mod conversation;

pub use conversation::{ConversationMemory, Message, Role};
