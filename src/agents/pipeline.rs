//! 标准内容生成流水线的 Agent 图
//!
//! root 负责协调，scientist 研究，narrative 编写脚本或漫画清单，designer 生成场景图，validator 质检。
//! 视频与漫画两条流水线共用同一张图，走哪条由 root 的指令决定。

use std::sync::Arc;

use crate::agents::{AgentGraph, AgentRegistry, AgentSpec};
use crate::core::AgentError;
use crate::tools::ToolRegistry;

pub const ROOT: &str = "root";
pub const SCIENTIST: &str = "scientist";
pub const NARRATIVE: &str = "narrative";
pub const DESIGNER: &str = "designer";
pub const VALIDATOR: &str = "validator";

/// 标准邻接表
pub const STANDARD_EDGES: &[(&str, &[&str])] = &[
    (ROOT, &[SCIENTIST, NARRATIVE, DESIGNER, VALIDATOR]),
    (SCIENTIST, &[NARRATIVE, ROOT]),
    (NARRATIVE, &[DESIGNER, ROOT]),
    (DESIGNER, &[VALIDATOR, ROOT]),
    (VALIDATOR, &[ROOT]),
];

const ROOT_INSTRUCTIONS: &str = "You coordinate a scientific media pipeline that turns a topic into an \
educational video or a scientific comic. For a video or animation: research with 'scientist', script with \
'narrative', design the scene graph with 'designer', then check it with 'validator'. Otherwise produce a \
comic: research, then a comic manifest from 'narrative', then validation. Give clear instructions on every \
hand-off and delegate with the tool, never by writing the hand-off as text.";

const SCIENTIST_INSTRUCTIONS: &str = "You are the research scientist. Investigate the requested topic and \
return a structured analysis: key findings, supporting evidence, notable figures or metrics, and open \
questions. Be factual and cite sources when you know them.";

const NARRATIVE_INSTRUCTIONS: &str = "You are the narrative architect. Turn the research analysis into a \
script: a video script with scenes, or a comic manifest with panels, captions and dialogue. Keep the \
science accurate and the story engaging. If validator feedback is provided, fix every issue it lists.";

const DESIGNER_INSTRUCTIONS: &str = "You are the scene designer. Convert a video script into a scene graph \
describing layout, visuals, timing and transitions for each scene.";

const VALIDATOR_INSTRUCTIONS: &str = "You are the quality validator. Check the manifest or scene graph for \
scientific accuracy, structure and completeness. Start your answer with the single word VALID if it passes, \
or INVALID followed by a list of concrete problems if it does not.";

/// 构建标准 Agent 图；tools 为所有 Agent 共享的工具集
pub fn standard_graph(tools: Option<Arc<ToolRegistry>>) -> Result<AgentGraph, AgentError> {
    let tools = tools.unwrap_or_default();
    let agents = [
        (ROOT, "Coordinator of the media pipeline", ROOT_INSTRUCTIONS),
        (SCIENTIST, "Researches the scientific topic", SCIENTIST_INSTRUCTIONS),
        (NARRATIVE, "Writes scripts and comic manifests", NARRATIVE_INSTRUCTIONS),
        (DESIGNER, "Designs video scene graphs", DESIGNER_INSTRUCTIONS),
        (VALIDATOR, "Quality checks the output", VALIDATOR_INSTRUCTIONS),
    ];

    let mut registry = AgentRegistry::new();
    for (name, description, instructions) in agents {
        registry.register(
            AgentSpec::new(name, instructions)
                .with_description(description)
                .with_tools(tools.clone()),
        )?;
    }
    registry.set_root(ROOT)?;
    registry.wire(STANDARD_EDGES.iter().map(|(from, peers)| (*from, peers.iter().copied())))
}
