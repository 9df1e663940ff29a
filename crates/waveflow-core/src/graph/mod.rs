//! # Execution Graph
//!
//! Builds the execution plan for a workflow: a flat node table (one node
//! per step, indexed by declaration order), directed dependency edges,
//! and the topological "waves" the scheduler executes in order.
//!
//! Edges come from two sources: explicit `dependsOn` entries and implicit
//! `{{tasks.<id>...}}` references inside step input templates. Cycles,
//! levels, and waves are computed over indices; no shared-ownership graph
//! is required.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::Serialize;

use crate::error::EngineError;
use crate::model::Step;
use crate::template::Template;

/// One node of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub step_id: String,
    /// 0 for nodes with no dependencies, otherwise `max(dep.level) + 1`.
    pub level: usize,
}

/// The ordered plan for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionGraph {
    /// Indexed by step declaration order.
    pub nodes: Vec<GraphNode>,
    /// `(dependency, dependent)` index pairs, deduplicated and sorted.
    pub edges: Vec<(usize, usize)>,
    /// Nodes sharing a level, ascending; within a wave, declaration
    /// order. Scheduling is order-independent for correctness, but the
    /// tie-break keeps logs and tests deterministic.
    pub waves: Vec<Vec<usize>>,
}

impl ExecutionGraph {
    /// Build the plan. All structural errors found are reported together;
    /// cycle detection runs only on structurally sound input and reports
    /// one cycle per invocation.
    pub fn build(steps: &[Step]) -> Result<Self, Vec<EngineError>> {
        let mut errors = Vec::new();

        let mut index_by_id: HashMap<&str, usize> = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            if index_by_id.insert(step.id.as_str(), index).is_some() {
                errors.push(EngineError::DuplicateId {
                    step_id: step.id.clone(),
                });
            }
        }

        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        for (index, step) in steps.iter().enumerate() {
            for dependency in &step.depends_on {
                match index_by_id.get(dependency.as_str()) {
                    Some(&from) => {
                        edges.insert((from, index));
                    }
                    None => errors.push(EngineError::UnknownDependency {
                        step_id: step.id.clone(),
                        reference: dependency.clone(),
                    }),
                }
            }
            for template_source in step.input.values() {
                match Template::parse(template_source) {
                    Ok(template) => {
                        for referenced in template.referenced_steps() {
                            match index_by_id.get(referenced) {
                                Some(&from) => {
                                    edges.insert((from, index));
                                }
                                None => errors.push(EngineError::UnknownDependency {
                                    step_id: step.id.clone(),
                                    reference: referenced.to_string(),
                                }),
                            }
                        }
                    }
                    Err(error) => errors.push(error),
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let adjacency = adjacency_list(steps.len(), &edges);
        if let Some(cycle) = find_cycle(steps, &adjacency) {
            return Err(vec![EngineError::CircularDependency { cycle }]);
        }

        let levels = compute_levels(steps.len(), &edges, &adjacency);
        let wave_count = levels.iter().copied().max().map_or(0, |max| max + 1);
        let mut waves = vec![Vec::new(); wave_count];
        for (index, &level) in levels.iter().enumerate() {
            waves[level].push(index);
        }

        let nodes = steps
            .iter()
            .zip(levels.iter())
            .map(|(step, &level)| GraphNode {
                step_id: step.id.clone(),
                level,
            })
            .collect();

        Ok(Self {
            nodes,
            edges: edges.into_iter().collect(),
            waves,
        })
    }
}

fn adjacency_list(node_count: usize, edges: &BTreeSet<(usize, usize)>) -> Vec<Vec<usize>> {
    let mut adjacency = vec![Vec::new(); node_count];
    for &(from, to) in edges {
        adjacency[from].push(to);
    }
    adjacency
}

/// DFS with an explicit recursion stack; the reported path begins and
/// ends at the same step id.
fn find_cycle(steps: &[Step], adjacency: &[Vec<usize>]) -> Option<Vec<String>> {
    fn dfs(
        node: usize,
        adjacency: &[Vec<usize>],
        visited: &mut [bool],
        on_stack: &mut [bool],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        visited[node] = true;
        on_stack[node] = true;
        path.push(node);

        for &next in &adjacency[node] {
            if on_stack[next] {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<usize> = path[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            if !visited[next] {
                if let Some(cycle) = dfs(next, adjacency, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }

        on_stack[node] = false;
        path.pop();
        None
    }

    let mut visited = vec![false; steps.len()];
    let mut on_stack = vec![false; steps.len()];
    let mut path = Vec::new();

    for start in 0..steps.len() {
        if !visited[start] {
            if let Some(cycle) = dfs(start, adjacency, &mut visited, &mut on_stack, &mut path) {
                return Some(
                    cycle
                        .into_iter()
                        .map(|index| steps[index].id.clone())
                        .collect(),
                );
            }
        }
    }
    None
}

/// Kahn's algorithm over the acyclic edge set.
fn compute_levels(
    node_count: usize,
    edges: &BTreeSet<(usize, usize)>,
    adjacency: &[Vec<usize>],
) -> Vec<usize> {
    let mut indegree = vec![0usize; node_count];
    for &(_, to) in edges {
        indegree[to] += 1;
    }

    let mut levels = vec![0usize; node_count];
    let mut queue: VecDeque<usize> = (0..node_count).filter(|&n| indegree[n] == 0).collect();

    while let Some(node) = queue.pop_front() {
        for &next in &adjacency[node] {
            levels[next] = levels[next].max(levels[node] + 1);
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepBuilder;

    fn step(id: &str) -> StepBuilder {
        StepBuilder::new(id).task_ref("some-task")
    }

    #[test]
    fn independent_steps_form_a_single_wave() {
        let steps = vec![
            step("a").build(),
            step("b").build(),
            step("c").build(),
            step("d").build(),
        ];
        let graph = ExecutionGraph::build(&steps).unwrap();
        assert_eq!(graph.waves, vec![vec![0, 1, 2, 3]]);
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn fork_join_produces_three_waves() {
        let steps = vec![
            step("root").build(),
            step("left").depends_on("root").build(),
            step("right").depends_on("root").build(),
            step("join").depends_on("left").depends_on("right").build(),
        ];
        let graph = ExecutionGraph::build(&steps).unwrap();
        assert_eq!(graph.waves, vec![vec![0], vec![1, 2], vec![3]]);
        assert_eq!(graph.nodes[3].level, 2);
    }

    #[test]
    fn template_references_create_implicit_edges() {
        let steps = vec![
            step("fetch").build(),
            step("use")
                .input("value", "{{tasks.fetch.output.x}}")
                .build(),
        ];
        let graph = ExecutionGraph::build(&steps).unwrap();
        assert_eq!(graph.edges, vec![(0, 1)]);
        assert_eq!(graph.waves, vec![vec![0], vec![1]]);
    }

    #[test]
    fn explicit_and_implicit_edges_deduplicate() {
        let steps = vec![
            step("fetch").build(),
            step("use")
                .depends_on("fetch")
                .input("value", "{{tasks.fetch.output.x}}")
                .build(),
        ];
        let graph = ExecutionGraph::build(&steps).unwrap();
        assert_eq!(graph.edges, vec![(0, 1)]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let steps = vec![step("a").build(), step("a").build()];
        let errors = ExecutionGraph::build(&steps).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind(), "duplicate-id");
    }

    #[test]
    fn unknown_dependencies_are_rejected_from_both_sources() {
        let steps = vec![
            step("a").depends_on("ghost").build(),
            step("b").input("v", "{{tasks.phantom.output}}").build(),
        ];
        let errors = ExecutionGraph::build(&steps).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind() == "unknown-dep"));
    }

    #[test]
    fn malformed_templates_fail_planning() {
        let steps = vec![step("a").input("v", "{{tasks.b.output").build()];
        let errors = ExecutionGraph::build(&steps).unwrap_err();
        assert_eq!(errors[0].kind(), "template-malformed");
    }

    #[test]
    fn cycles_report_a_closed_path() {
        let steps = vec![
            step("a").depends_on("b").build(),
            step("b").depends_on("a").build(),
        ];
        let errors = ExecutionGraph::build(&steps).unwrap_err();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            EngineError::CircularDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let steps = vec![step("a").depends_on("a").build()];
        let errors = ExecutionGraph::build(&steps).unwrap_err();
        match &errors[0] {
            EngineError::CircularDependency { cycle } => {
                assert_eq!(cycle, &vec!["a".to_string(), "a".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn planning_is_deterministic() {
        let steps = vec![
            step("root").build(),
            step("left").depends_on("root").build(),
            step("right").depends_on("root").build(),
            step("join")
                .input("l", "{{tasks.left.output}}")
                .input("r", "{{tasks.right.output}}")
                .build(),
        ];
        let first = ExecutionGraph::build(&steps).unwrap();
        let second = ExecutionGraph::build(&steps).unwrap();
        assert_eq!(first, second);
    }
}
