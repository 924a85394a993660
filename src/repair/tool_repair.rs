//! 工具调用修复：部分模型会把转移意图写成文本里的 JSON，而不是调用 transfer_to_agent
//!
//! 在每个文本片段中逐个 `{` 位置尝试解析 JSON 对象，找到带 agentName / agent_name 的对象后，
//! 丢弃所有文本片段，替换为一个 transfer 调用。已有 transfer 调用的响应保留原调用，
//! 只删掉其中携带 Agent 名称的文本片段，避免下游再次把它们修复成第二个转移。

use serde_json::{Map, Value};

use super::ResponseProcessor;
use crate::llm::{ProviderResponse, ResponsePart, ToolInvocation, AGENT_NAME_KEY, LEGACY_AGENT_NAME_KEY};

/// 可能包着参数的字段名
const NESTED_ARG_KEYS: &[&str] = &["args", "arguments", "parameters"];

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolCallRepair;

impl ToolCallRepair {
    /// 在文本中找第一个携带 Agent 名称的 JSON 对象
    pub fn find_agent_target(text: &str) -> Option<String> {
        text.match_indices('{').find_map(|(start, _)| {
            let mut stream =
                serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(Value::Object(obj))) => agent_in_object(&obj),
                _ => None,
            }
        })
    }
}

fn agent_key(obj: &Map<String, Value>) -> Option<String> {
    [AGENT_NAME_KEY, LEGACY_AGENT_NAME_KEY]
        .iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

fn agent_in_object(obj: &Map<String, Value>) -> Option<String> {
    agent_key(obj).or_else(|| {
        NESTED_ARG_KEYS
            .iter()
            .filter_map(|k| obj.get(*k))
            .filter_map(Value::as_object)
            .find_map(agent_key)
    })
}

/// 已有 transfer 调用时，去掉叙述转移目标的文本片段
fn strip_narrated_targets(response: ProviderResponse, current_agent: &str) -> ProviderResponse {
    let before = response.parts.len();
    let parts: Vec<ResponsePart> = response
        .parts
        .into_iter()
        .filter(|p| match p {
            ResponsePart::Text(text) => ToolCallRepair::find_agent_target(text).is_none(),
            ResponsePart::ToolCall(_) => true,
        })
        .collect();
    if parts.len() < before {
        tracing::debug!(
            agent = %current_agent,
            dropped = before - parts.len(),
            "Dropped narrated transfer text next to a transfer call"
        );
    }
    ProviderResponse { parts, ..response }
}

impl ResponseProcessor for ToolCallRepair {
    fn name(&self) -> &'static str {
        "tool_call_repair"
    }

    fn process(&self, response: ProviderResponse, current_agent: &str) -> ProviderResponse {
        if response.transfer().is_some() {
            return strip_narrated_targets(response, current_agent);
        }
        let Some(target) = response.texts().find_map(Self::find_agent_target) else {
            return response;
        };

        tracing::warn!(
            agent = %current_agent,
            target = %target,
            "Repaired transfer narrated as text into a transfer call"
        );
        let mut parts = vec![ResponsePart::ToolCall(ToolInvocation::transfer(target))];
        parts.extend(
            response
                .parts
                .into_iter()
                .filter(|p| matches!(p, ResponsePart::ToolCall(_))),
        );
        ProviderResponse { parts, ..response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_json_after_prose() {
        let raw = ProviderResponse::from_text(
            "Let me think about who should do this.\n```json\n{\"agent_name\":\"scientist\"}\n```",
        );
        let out = ToolCallRepair.process(raw, "root");
        assert_eq!(
            out.parts,
            vec![ResponsePart::ToolCall(ToolInvocation::transfer("scientist"))]
        );
    }

    #[test]
    fn test_nested_args_and_later_text_part() {
        let raw = ProviderResponse::from_parts(vec![
            ResponsePart::Text("no json here {not json".into()),
            ResponsePart::Text(
                r#"{"name": "transfer_to_agent", "args": {"agentName": "designer"}}"#.into(),
            ),
        ]);
        let out = ToolCallRepair.process(raw, "narrative");
        assert_eq!(out.transfer(), Some(&ToolInvocation::transfer("designer")));
        assert_eq!(out.texts().count(), 0);
    }

    #[test]
    fn test_existing_transfer_wins_over_narrated_target() {
        let raw = ProviderResponse::from_parts(vec![
            ResponsePart::Text("Handing over now.".into()),
            ResponsePart::Text("{\"agent_name\": \"validator\"}".into()),
            ResponsePart::ToolCall(ToolInvocation::transfer("root")),
        ]);
        let out = ToolCallRepair.process(raw, "designer");
        assert_eq!(
            out.parts,
            vec![
                ResponsePart::Text("Handing over now.".into()),
                ResponsePart::ToolCall(ToolInvocation::transfer("root")),
            ]
        );
    }

    #[test]
    fn test_json_without_agent_key_is_plain_text() {
        let raw = ProviderResponse::from_text("Result: {\"score\": 3, \"agent_name\": \"\"}");
        let out = ToolCallRepair.process(raw.clone(), "validator");
        assert_eq!(out, raw);
    }

    #[test]
    fn test_other_tool_calls_are_kept() {
        let mut args = Map::new();
        args.insert("name".into(), Value::String("a.txt".into()));
        let save = ToolInvocation::new("read_artifact", args);
        let raw = ProviderResponse::from_parts(vec![
            ResponsePart::Text("{\"agentName\": \"root\"}".into()),
            ResponsePart::ToolCall(save.clone()),
        ]);
        let out = ToolCallRepair.process(raw, "scientist");
        assert_eq!(
            out.parts,
            vec![
                ResponsePart::ToolCall(ToolInvocation::transfer("root")),
                ResponsePart::ToolCall(save),
            ]
        );
    }
}
