//! Dependency graph analysis over input mappings.
//!
//! Uses `petgraph` to model every step node (composites included) with an
//! edge from each mapping source to the step that reads it. Topological sort
//! detects cycles; the same graph answers "what is downstream of this step"
//! when a failure propagates under `ContinueWithSkip`.

use std::collections::{HashMap, HashSet};

use maestro_types::workflow::WorkflowDefinition;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::ValidationError;

/// Step-id graph with an edge `source -> reader` per input mapping.
pub struct MappingGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    index: HashMap<&'a str, NodeIndex>,
}

impl<'a> MappingGraph<'a> {
    /// Build the graph. Mappings to unknown steps and the global input are ignored.
    pub fn build(def: &'a WorkflowDefinition) -> Self {
        let steps = def.all_steps();
        let mut graph = DiGraph::<&str, ()>::new();
        let index: HashMap<&str, NodeIndex> = steps
            .iter()
            .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
            .collect();

        for step in &steps {
            let to = index[step.id.as_str()];
            for source in step.upstream_ids() {
                if let Some(&from) = index.get(source) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Self { graph, index }
    }

    /// Step ids in a dependency-respecting order, or the step on a cycle.
    pub fn topological_order(&self) -> Result<Vec<&'a str>, ValidationError> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n]).collect())
            .map_err(|cycle| ValidationError::CycleDetected(self.graph[cycle.node_id()].to_string()))
    }

    /// Transitive closure of steps that read (directly or not) from `step_id`.
    pub fn downstream_of(&self, step_id: &str) -> Vec<&'a str> {
        self.closure(step_id, Direction::Outgoing)
    }

    /// Transitive closure of steps that `step_id` reads from.
    pub fn upstream_of(&self, step_id: &str) -> Vec<&'a str> {
        self.closure(step_id, Direction::Incoming)
    }

    fn closure(&self, step_id: &str, direction: Direction) -> Vec<&'a str> {
        let Some(&start) = self.index.get(step_id) else {
            return Vec::new();
        };

        let mut visited = HashSet::new();
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            for next in self.graph.neighbors_directed(current, direction) {
                if visited.insert(next) {
                    out.push(self.graph[next]);
                    stack.push(next);
                }
            }
        }
        out
    }
}

/// Fail with `CycleDetected` if the mapping graph has a cycle.
pub fn validate_acyclic(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    MappingGraph::build(def).topological_order().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_types::workflow::{FailurePolicy, InputMapping, StepDefinition, StepKind};

    /// Helper: agent step reading the whole payload of each dependency.
    fn agent_step(id: &str, depends_on: Vec<&str>) -> StepDefinition {
        let mut step = StepDefinition::new(
            id,
            StepKind::Sequential {
                agent_id: "test-agent".to_string(),
            },
        );
        step.input_mapping = depends_on
            .into_iter()
            .map(|d| InputMapping::whole(d, d))
            .collect();
        step
    }

    fn def(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "dag".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            failure_policy: FailurePolicy::ContinueWithSkip,
            steps,
        }
    }

    #[test]
    fn test_linear_chain_topological_order() {
        let d = def(vec![
            agent_step("a", vec![]),
            agent_step("b", vec!["a"]),
            agent_step("c", vec!["b"]),
        ]);
        let order = MappingGraph::build(&d).topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|s| *s == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_cycle_detected() {
        // Only reachable for hand-built definitions that skip scope checks.
        let d = def(vec![agent_step("a", vec!["b"]), agent_step("b", vec!["a"])]);
        let err = validate_acyclic(&d).unwrap_err();
        assert!(err.to_string().contains("cycle detected"), "got: {err}");
    }

    #[test]
    fn test_downstream_closure() {
        //     a
        //    / \
        //   b   c
        //   |
        //   d
        let d = def(vec![
            agent_step("a", vec![]),
            agent_step("b", vec!["a"]),
            agent_step("c", vec!["a"]),
            agent_step("d", vec!["b"]),
        ]);
        let graph = MappingGraph::build(&d);

        let mut down = graph.downstream_of("b");
        down.sort();
        assert_eq!(down, vec!["d"]);

        let mut down = graph.downstream_of("a");
        down.sort();
        assert_eq!(down, vec!["b", "c", "d"]);

        let mut up = graph.upstream_of("d");
        up.sort();
        assert_eq!(up, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_step_has_empty_closure() {
        let d = def(vec![agent_step("a", vec![])]);
        let graph = MappingGraph::build(&d);
        assert!(graph.downstream_of("nonexistent").is_empty());
        assert!(graph.upstream_of("a").is_empty());
    }

    #[test]
    fn test_global_input_is_not_an_edge() {
        let mut step = agent_step("a", vec![]);
        step.input_mapping
            .push(InputMapping::new("$input", "topic", "topic"));
        let d = def(vec![step]);
        assert_eq!(MappingGraph::build(&d).topological_order().unwrap(), vec!["a"]);
    }
}
