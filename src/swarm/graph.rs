//! Roster dependency graphs.
//!
//! A roster's `dependency_refs` form a directed graph over agents. The graph
//! is validated up front: unknown references, duplicate ids, and cycles are
//! all rejected before any agent is dispatched.

use crate::agent::{AgentRequest, AgentRoster};
use crate::errors::SwarmError;
use std::collections::{HashMap, HashSet};

/// Index into the roster's agent list.
pub type AgentIndex = usize;

/// A validated dependency graph over a roster.
#[derive(Debug)]
pub struct RosterGraph {
    agents: Vec<AgentRequest>,
    index_map: HashMap<String, AgentIndex>,
    /// index -> agents that depend on it
    dependents: Vec<Vec<AgentIndex>>,
    /// index -> agents it depends on
    dependencies: Vec<Vec<AgentIndex>>,
}

impl RosterGraph {
    /// Build and validate the graph. Cycles yield `InvalidGraph` with the
    /// participating agent ids.
    pub fn build(roster: &AgentRoster) -> Result<Self, SwarmError> {
        let mut index_map = HashMap::new();
        for (i, agent) in roster.agents.iter().enumerate() {
            if index_map.insert(agent.agent_id.clone(), i).is_some() {
                return Err(SwarmError::DuplicateAgent {
                    agent_id: agent.agent_id.clone(),
                });
            }
        }

        let n = roster.agents.len();
        let mut dependents: Vec<Vec<AgentIndex>> = vec![Vec::new(); n];
        let mut dependencies: Vec<Vec<AgentIndex>> = vec![Vec::new(); n];

        for (to_idx, agent) in roster.agents.iter().enumerate() {
            for dep in &agent.dependency_refs {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| SwarmError::UnknownDependency {
                            agent_id: agent.agent_id.clone(),
                            dependency: dep.clone(),
                        })?;
                dependents[from_idx].push(to_idx);
                dependencies[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            agents: roster.agents.clone(),
            index_map,
            dependents,
            dependencies,
        };
        graph.validate_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm. Leftover nodes with nonzero in-degree are the cycle
    /// participants.
    fn validate_acyclic(&self) -> Result<(), SwarmError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: Vec<AgentIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.agents.len() {
            let participants: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.agents[i].agent_id.clone())
                .collect();
            return Err(SwarmError::InvalidGraph { participants });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agent(&self, index: AgentIndex) -> &AgentRequest {
        &self.agents[index]
    }

    pub fn index_of(&self, agent_id: &str) -> Option<AgentIndex> {
        self.index_map.get(agent_id).copied()
    }

    /// Dispatch levels: level 0 holds agents with no dependencies, each
    /// later level unblocks when the previous ones complete. Within a level,
    /// agents keep their declared roster order.
    pub fn levels(&self) -> Vec<Vec<AgentIndex>> {
        let mut levels = Vec::new();
        let mut placed: HashSet<AgentIndex> = HashSet::new();

        while placed.len() < self.agents.len() {
            let ready: Vec<AgentIndex> = (0..self.agents.len())
                .filter(|i| !placed.contains(i))
                .filter(|&i| self.dependencies[i].iter().all(|d| placed.contains(d)))
                .collect();
            if ready.is_empty() {
                // Unreachable after validate_acyclic, but avoid spinning.
                break;
            }
            for &i in &ready {
                placed.insert(i);
            }
            levels.push(ready);
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRole;

    fn roster(specs: &[(&str, &[&str])]) -> AgentRoster {
        AgentRoster::new(
            specs
                .iter()
                .map(|(id, deps)| {
                    let mut req = AgentRequest::new(id, AgentRole::Developer);
                    for dep in *deps {
                        req = req.depends_on(dep);
                    }
                    req
                })
                .collect(),
        )
    }

    #[test]
    fn test_diamond_levels() {
        // B -> A, C -> A, D -> B,C
        let graph = RosterGraph::build(&roster(&[
            ("A", &[]),
            ("B", &["A"]),
            ("C", &["A"]),
            ("D", &["B", "C"]),
        ]))
        .unwrap();

        let levels = graph.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec![0]);
        assert_eq!(levels[1], vec![1, 2]);
        assert_eq!(levels[2], vec![3]);
    }

    #[test]
    fn test_level_order_follows_roster_order() {
        let graph =
            RosterGraph::build(&roster(&[("z", &[]), ("a", &[]), ("m", &[])])).unwrap();
        let levels = graph.levels();
        assert_eq!(levels.len(), 1);
        // Declared order, not alphabetical
        assert_eq!(levels[0], vec![0, 1, 2]);
    }

    #[test]
    fn test_self_cycle_rejected() {
        let err = RosterGraph::build(&roster(&[("A", &[]), ("D", &["D"])])).unwrap_err();
        match err {
            SwarmError::InvalidGraph { participants } => {
                assert_eq!(participants, vec!["D"]);
            }
            other => panic!("Expected InvalidGraph, got {other}"),
        }
    }

    #[test]
    fn test_long_cycle_rejected() {
        let err =
            RosterGraph::build(&roster(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"])]))
                .unwrap_err();
        assert!(matches!(err, SwarmError::InvalidGraph { .. }));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = RosterGraph::build(&roster(&[("A", &["ghost"])])).unwrap_err();
        match err {
            SwarmError::UnknownDependency { dependency, .. } => {
                assert_eq!(dependency, "ghost");
            }
            other => panic!("Expected UnknownDependency, got {other}"),
        }
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let err = RosterGraph::build(&roster(&[("A", &[]), ("A", &[])])).unwrap_err();
        assert!(matches!(err, SwarmError::DuplicateAgent { .. }));
    }

    #[test]
    fn test_empty_roster() {
        let graph = RosterGraph::build(&AgentRoster::default()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.levels().is_empty());
    }
}
