//! 自环保护：Agent 转移给自己会让调用方挂起或空转
//!
//! 第一个 transfer 调用的目标等于当前 Agent（忽略大小写）时，删除该调用并注入一段就地继续的提示；
//! 其余 transfer 调用一律丢弃，保证每个响应最多一个 transfer。

use super::ResponseProcessor;
use crate::llm::{ProviderResponse, ResponsePart};

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopGuard;

impl LoopGuard {
    /// 替换自我转移的提示文本
    pub fn continuation_notice(target: &str) -> String {
        format!(
            "[SYSTEM ERROR] You attempted to transfer to '{target}', which is yourself. \
             Do not transfer to yourself. Continue the task locally with your own tools and proceed."
        )
    }
}

fn same_agent(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

impl ResponseProcessor for LoopGuard {
    fn name(&self) -> &'static str {
        "loop_guard"
    }

    fn process(&self, response: ProviderResponse, current_agent: &str) -> ProviderResponse {
        if response.transfer().is_none() {
            return response;
        }

        let mut seen_transfer = false;
        let mut parts = Vec::with_capacity(response.parts.len());
        for part in response.parts {
            match part {
                ResponsePart::ToolCall(call) if call.is_transfer() => {
                    if seen_transfer {
                        tracing::warn!(
                            agent = %current_agent,
                            target = ?call.transfer_target(),
                            "Dropping extra transfer call"
                        );
                        continue;
                    }
                    seen_transfer = true;
                    match call.transfer_target() {
                        Some(target) if same_agent(target, current_agent) => {
                            tracing::warn!(agent = %current_agent, "Blocked self-transfer");
                            parts.push(ResponsePart::Text(Self::continuation_notice(target)));
                        }
                        _ => parts.push(ResponsePart::ToolCall(call)),
                    }
                }
                other => parts.push(other),
            }
        }
        ProviderResponse { parts, ..response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolInvocation;

    #[test]
    fn test_self_transfer_becomes_continuation() {
        let raw = ProviderResponse::from_parts(vec![
            ResponsePart::Text("Handing off.".into()),
            ResponsePart::ToolCall(ToolInvocation::transfer("NARRATIVE")),
        ]);
        let out = LoopGuard.process(raw, "narrative");
        assert_eq!(out.transfer_count(), 0);
        assert_eq!(out.texts().count(), 2);
        assert!(out.text().contains("Continue the task locally"));
    }

    #[test]
    fn test_peer_transfer_passes_through() {
        let raw = ProviderResponse::from_parts(vec![ResponsePart::ToolCall(
            ToolInvocation::transfer("designer"),
        )]);
        let out = LoopGuard.process(raw.clone(), "narrative");
        assert_eq!(out, raw);
    }

    #[test]
    fn test_only_first_transfer_survives() {
        let raw = ProviderResponse::from_parts(vec![
            ResponsePart::ToolCall(ToolInvocation::transfer("scientist")),
            ResponsePart::ToolCall(ToolInvocation::transfer("root")),
        ]);
        let out = LoopGuard.process(raw, "scientist");
        assert_eq!(out.transfer_count(), 0);
        assert_eq!(out.texts().count(), 1);

        let again = LoopGuard.process(out.clone(), "scientist");
        assert_eq!(again, out);
    }
}
