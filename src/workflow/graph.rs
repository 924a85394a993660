//! 步骤转移表
//!
//! 用邻接表描述合法的步骤转移；引擎在持久化前校验每一次转移。

use std::collections::{BTreeMap, BTreeSet};

use crate::workflow::types::{WorkflowError, WorkflowStep};

/// 步骤转移图
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// 邻接表：步骤 -> 可到达的下一步
    adjacency: BTreeMap<WorkflowStep, BTreeSet<WorkflowStep>>,
}

impl StepGraph {
    /// research → narrative → validate → done，validate 失败回到 narrative；任一非终止步骤可转入 error
    pub fn standard() -> Self {
        use crate::workflow::types::WorkflowStep::*;
        let edges: [(WorkflowStep, &[WorkflowStep]); 3] = [
            (Research, &[Narrative, Error][..]),
            (Narrative, &[Validate, Error][..]),
            (Validate, &[Done, Narrative, Error][..]),
        ];
        let mut adjacency: BTreeMap<WorkflowStep, BTreeSet<WorkflowStep>> = WorkflowStep::ALL
            .into_iter()
            .map(|step| (step, BTreeSet::new()))
            .collect();
        for (from, to) in edges {
            adjacency.entry(from).or_default().extend(to.iter().copied());
        }
        Self { adjacency }
    }

    pub fn successors(&self, from: WorkflowStep) -> Vec<WorkflowStep> {
        self.adjacency
            .get(&from)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn allows(&self, from: WorkflowStep, to: WorkflowStep) -> bool {
        self.adjacency.get(&from).is_some_and(|set| set.contains(&to))
    }

    pub fn check(&self, from: WorkflowStep, to: WorkflowStep) -> Result<(), WorkflowError> {
        if self.allows(from, to) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidTransition { from, to })
        }
    }
}

impl Default for StepGraph {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::WorkflowStep::*;

    #[test]
    fn test_standard_edges() {
        let graph = StepGraph::standard();
        assert!(graph.allows(Research, Narrative));
        assert!(graph.allows(Validate, Narrative));
        assert!(graph.allows(Validate, Done));
        assert!(!graph.allows(Research, Validate));
        assert!(!graph.allows(Narrative, Done));
        assert_eq!(graph.successors(Validate), vec![Narrative, Done, Error]);
    }

    #[test]
    fn test_terminal_steps_have_no_successors() {
        let graph = StepGraph::standard();
        for step in [Done, Error] {
            assert!(graph.successors(step).is_empty());
            assert!(matches!(
                graph.check(step, Research),
                Err(WorkflowError::InvalidTransition { .. })
            ));
        }
    }
}
