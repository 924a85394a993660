//! Agent 图
//!
//! 由 AgentRegistry::wire 生成，之后不可变。邻接表决定每个 Agent 能转移到哪些 Agent，
//! 非邻居转移一律视为协议违规。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::agents::registry::agent_key;
use crate::agents::AgentSpec;
use crate::core::AgentError;

/// 冻结后的 Agent 图
#[derive(Debug, Clone)]
pub struct AgentGraph {
    agents: BTreeMap<String, Arc<AgentSpec>>,
    adjacency: BTreeMap<String, BTreeSet<String>>,
    root: Arc<AgentSpec>,
}

impl AgentGraph {
    pub(crate) fn new(
        agents: BTreeMap<String, Arc<AgentSpec>>,
        adjacency: BTreeMap<String, BTreeSet<String>>,
        root: Arc<AgentSpec>,
    ) -> Self {
        Self {
            agents,
            adjacency,
            root,
        }
    }

    pub fn root(&self) -> &Arc<AgentSpec> {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<&Arc<AgentSpec>> {
        self.agents.get(&agent_key(name))
    }

    pub fn agent(&self, name: &str) -> Result<&Arc<AgentSpec>, AgentError> {
        self.get(name)
            .ok_or_else(|| AgentError::UnknownAgent(name.to_string()))
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.values().map(|a| a.name.as_str()).collect()
    }

    /// name 的邻居（使用注册时的名称）
    pub fn peers(&self, name: &str) -> Vec<&str> {
        self.adjacency
            .get(&agent_key(name))
            .map(|set| {
                set.iter()
                    .filter_map(|k| self.agents.get(k))
                    .map(|a| a.name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_adjacent(&self, from: &str, to: &str) -> bool {
        self.adjacency
            .get(&agent_key(from))
            .is_some_and(|set| set.contains(&agent_key(to)))
    }

    /// 校验 from → to 的转移；合法时返回目标 Agent
    pub fn check_transfer(&self, from: &str, to: &str) -> Result<&Arc<AgentSpec>, AgentError> {
        let from_spec = self.agent(from)?;
        if !self.is_adjacent(from, to) {
            return Err(AgentError::ProtocolViolation {
                from: from_spec.name.clone(),
                to: to.to_string(),
            });
        }
        self.agent(to)
    }
}

#[cfg(test)]
mod tests {
    use crate::agents::{AgentRegistry, AgentSpec};
    use crate::core::AgentError;

    fn graph() -> super::AgentGraph {
        let mut registry = AgentRegistry::new();
        for name in ["root", "scientist", "narrative"] {
            registry.register(AgentSpec::new(name, "x")).unwrap();
        }
        registry.set_root("root").unwrap();
        registry
            .wire(vec![
                ("root", vec!["scientist", "narrative"]),
                ("scientist", vec!["narrative", "root"]),
            ])
            .unwrap()
    }

    #[test]
    fn test_adjacency_is_case_insensitive() {
        let graph = graph();
        assert_eq!(graph.root().name, "root");
        assert!(graph.is_adjacent("Root", "SCIENTIST"));
        assert_eq!(graph.check_transfer("scientist", "Narrative").unwrap().name, "narrative");
        assert_eq!(graph.peers("root"), vec!["narrative", "scientist"]);
    }

    #[test]
    fn test_non_adjacent_transfer_is_violation() {
        let graph = graph();
        assert!(graph.peers("narrative").is_empty());
        assert!(matches!(
            graph.check_transfer("narrative", "scientist"),
            Err(AgentError::ProtocolViolation { from, to }) if from == "narrative" && to == "scientist"
        ));
        assert!(matches!(
            graph.check_transfer("root", "ghost"),
            Err(AgentError::ProtocolViolation { .. })
        ));
        assert!(matches!(
            graph.check_transfer("ghost", "root"),
            Err(AgentError::UnknownAgent(_))
        ));
    }
}
