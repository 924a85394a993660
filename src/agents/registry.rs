//! Agent 注册表（两阶段构建）
//!
//! 第一阶段注册所有 Agent（名称、说明、工具集）；第二阶段一次性连边，得到不可变的 AgentGraph。
//! 边集合单独存放在邻接表里，不去修改已创建 Agent 的引用。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::agents::AgentGraph;
use crate::core::AgentError;
use crate::tools::ToolRegistry;

/// Agent 定义：名称、简介、系统指令、工具集
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub instructions: String,
    pub tools: Arc<ToolRegistry>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instructions: instructions.into(),
            tools: Arc::new(ToolRegistry::new()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }
}

/// 名称比较不区分大小写
pub(crate) fn agent_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// 第一阶段：收集 Agent 与根节点
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<AgentSpec>>,
    root: Option<String>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: AgentSpec) -> Result<(), AgentError> {
        let key = agent_key(&spec.name);
        if key.is_empty() {
            return Err(AgentError::Graph("agent name must not be empty".into()));
        }
        if self.agents.contains_key(&key) {
            return Err(AgentError::Graph(format!("agent '{}' registered twice", spec.name)));
        }
        self.agents.insert(key, Arc::new(spec));
        Ok(())
    }

    pub fn set_root(&mut self, name: &str) -> Result<(), AgentError> {
        let key = agent_key(name);
        if !self.agents.contains_key(&key) {
            return Err(AgentError::UnknownAgent(name.to_string()));
        }
        self.root = Some(key);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// 第二阶段：连边并冻结。每个 Agent 的边只能设置一次，未出现的 Agent 边集为空
    pub fn wire<'a, I, P>(self, edges: I) -> Result<AgentGraph, AgentError>
    where
        I: IntoIterator<Item = (&'a str, P)>,
        P: IntoIterator<Item = &'a str>,
    {
        let root = self
            .root
            .as_ref()
            .and_then(|key| self.agents.get(key))
            .cloned()
            .ok_or_else(|| AgentError::Graph("root agent not set".into()))?;

        let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (from, peers) in edges {
            let from_key = agent_key(from);
            if !self.agents.contains_key(&from_key) {
                return Err(AgentError::UnknownAgent(from.to_string()));
            }
            if adjacency.contains_key(&from_key) {
                return Err(AgentError::Graph(format!("edges of '{from}' wired twice")));
            }
            let mut set = BTreeSet::new();
            for peer in peers {
                let peer_key = agent_key(peer);
                if !self.agents.contains_key(&peer_key) {
                    return Err(AgentError::UnknownAgent(peer.to_string()));
                }
                if peer_key == from_key {
                    return Err(AgentError::Graph(format!("'{from}' cannot be its own peer")));
                }
                set.insert(peer_key);
            }
            adjacency.insert(from_key, set);
        }
        for key in self.agents.keys() {
            adjacency.entry(key.clone()).or_default();
        }

        tracing::info!(
            agents = self.agents.len(),
            edges = adjacency.values().map(BTreeSet::len).sum::<usize>(),
            root = %root.name,
            "Agent graph wired"
        );
        Ok(AgentGraph::new(self.agents, adjacency, root))
    }
}
