//! Dependency resolution over plan nodes.
//!
//! Builds a [`DependencyGraph`] from the depends-on sets the parser filled
//! in, validates that every edge points at a real node, and produces a
//! deterministic topological order with Kahn's algorithm. When the sort
//! stalls, a DFS over the unsorted remainder recovers a concrete cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::plan::{NodeId, Plan};

/// Errors from [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("dependency cycle detected: {}", format_path(.0))]
    CycleDetected(Vec<NodeId>),

    #[error("{node} depends on unknown node {dependency}")]
    UnknownDependency { node: NodeId, dependency: NodeId },
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(NodeId::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Validated, acyclic view of a plan's dependency edges.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    deps: BTreeMap<NodeId, BTreeSet<NodeId>>,
    dependents: BTreeMap<NodeId, BTreeSet<NodeId>>,
    order: Vec<NodeId>,
    position: HashMap<NodeId, usize>,
}

/// Resolve a plan into a [`DependencyGraph`].
pub fn resolve(plan: &Plan) -> Result<DependencyGraph, ResolveError> {
    let edges = plan
        .nodes()
        .map(|node| (node.id(), node.depends_on().clone()));
    DependencyGraph::from_edges(edges)
}

impl DependencyGraph {
    /// Build a graph from `(node, depends_on)` pairs.
    pub fn from_edges(
        edges: impl IntoIterator<Item = (NodeId, BTreeSet<NodeId>)>,
    ) -> Result<Self, ResolveError> {
        let deps: BTreeMap<NodeId, BTreeSet<NodeId>> = edges.into_iter().collect();

        let mut dependents: BTreeMap<NodeId, BTreeSet<NodeId>> =
            deps.keys().map(|id| (*id, BTreeSet::new())).collect();
        for (node, node_deps) in &deps {
            for dep in node_deps {
                match dependents.get_mut(dep) {
                    Some(set) => {
                        set.insert(*node);
                    }
                    None => {
                        return Err(ResolveError::UnknownDependency {
                            node: *node,
                            dependency: *dep,
                        });
                    }
                }
            }
        }

        // Kahn's algorithm. The ready set is ordered so the output does not
        // depend on hash iteration order.
        let mut in_degree: BTreeMap<NodeId, usize> =
            deps.iter().map(|(id, d)| (*id, d.len())).collect();
        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(deps.len());
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for dependent in &dependents[&node] {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() != deps.len() {
            let sorted: BTreeSet<NodeId> = order.iter().copied().collect();
            let remaining: BTreeSet<NodeId> = deps
                .keys()
                .filter(|id| !sorted.contains(id))
                .copied()
                .collect();
            return Err(ResolveError::CycleDetected(find_cycle(&deps, &remaining)));
        }

        let position = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        Ok(Self {
            deps,
            dependents,
            order,
            position,
        })
    }

    /// Deterministic topological order: every node after its dependencies.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Waves of mutually independent nodes. Every node's dependencies lie
    /// in strictly earlier waves.
    pub fn levels(&self) -> Vec<Vec<NodeId>> {
        let mut depth: HashMap<NodeId, usize> = HashMap::with_capacity(self.order.len());
        let mut levels: Vec<Vec<NodeId>> = Vec::new();
        for id in &self.order {
            let level = self.deps[id]
                .iter()
                .filter_map(|dep| depth.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(*id, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(*id);
        }
        levels
    }

    pub fn dependencies_of(&self, id: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.deps.get(&id)
    }

    pub fn dependents_of(&self, id: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.dependents.get(&id)
    }

    /// Rank of `id` in [`Self::order`].
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.position.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Walk dependency edges inside the stalled remainder until a node repeats.
///
/// Every remaining node has at least one remaining dependency (otherwise
/// Kahn's algorithm would have released it), so the walk always closes.
fn find_cycle(
    deps: &BTreeMap<NodeId, BTreeSet<NodeId>>,
    remaining: &BTreeSet<NodeId>,
) -> Vec<NodeId> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut seen: HashMap<NodeId, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let next = deps
            .get(&current)
            .and_then(|d| d.iter().find(|n| remaining.contains(n)))
            .copied();
        let Some(next) = next else {
            return path;
        };
        if let Some(&at) = seen.get(&next) {
            let mut cycle = path.split_off(at);
            cycle.push(next);
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::parse;

    fn edges(list: &[(NodeId, &[NodeId])]) -> Vec<(NodeId, BTreeSet<NodeId>)> {
        list.iter()
            .map(|(id, deps)| (*id, deps.iter().copied().collect()))
            .collect()
    }

    const PLAN: &str = "\
# Plan
## Sprint 0: A
1. **One**
2. **Two**
## Sprint 1: B
1. **Three**
";

    #[test]
    fn orders_parsed_plan_topologically() {
        let plan = parse(PLAN).unwrap();
        let graph = resolve(&plan).unwrap();
        assert_eq!(
            graph.order(),
            &[
                NodeId::task(0, 1),
                NodeId::task(0, 2),
                NodeId::gate(0),
                NodeId::task(1, 1),
                NodeId::gate(1),
            ]
        );
        assert_eq!(graph.position(NodeId::gate(0)), Some(2));
        assert_eq!(
            graph.dependents_of(NodeId::gate(0)),
            Some(&BTreeSet::from([NodeId::task(1, 1)]))
        );
    }

    #[test]
    fn every_node_follows_its_dependencies() {
        let plan = parse(PLAN).unwrap();
        let graph = resolve(&plan).unwrap();
        for id in graph.order() {
            for dep in graph.dependencies_of(*id).unwrap() {
                assert!(graph.position(*dep) < graph.position(*id));
            }
        }
    }

    #[test]
    fn levels_group_independent_nodes() {
        let a = NodeId::task(0, 1);
        let b = NodeId::task(0, 2);
        let c = NodeId::task(0, 3);
        let g = NodeId::gate(0);
        let graph = DependencyGraph::from_edges(edges(&[
            (a, &[]),
            (b, &[]),
            (c, &[a]),
            (g, &[b, c]),
        ]))
        .unwrap();
        assert_eq!(graph.levels(), vec![vec![a, b], vec![c], vec![g]]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let a = NodeId::task(0, 1);
        let err = DependencyGraph::from_edges(edges(&[(a, &[NodeId::task(4, 4)])])).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownDependency {
                node: a,
                dependency: NodeId::task(4, 4)
            }
        );
    }

    #[test]
    fn reports_concrete_direct_cycle() {
        let a = NodeId::task(0, 1);
        let b = NodeId::task(0, 2);
        let err = DependencyGraph::from_edges(edges(&[(a, &[b]), (b, &[a])])).unwrap_err();
        assert_eq!(err, ResolveError::CycleDetected(vec![a, b, a]));
        assert_eq!(err.to_string(), "dependency cycle detected: 0.1 -> 0.2 -> 0.1");
    }

    #[test]
    fn reports_transitive_cycle_without_tail() {
        let root = NodeId::task(0, 1);
        let a = NodeId::task(0, 2);
        let b = NodeId::task(0, 3);
        let c = NodeId::task(0, 4);
        let outside = NodeId::task(0, 5);
        let err = DependencyGraph::from_edges(edges(&[
            (root, &[]),
            (a, &[root, c]),
            (b, &[a]),
            (c, &[b]),
            (outside, &[c]),
        ]))
        .unwrap_err();
        let ResolveError::CycleDetected(path) = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        let members: BTreeSet<NodeId> = path.iter().copied().collect();
        assert_eq!(members, BTreeSet::from([a, b, c]));
    }

    #[test]
    fn parsed_plans_never_cycle() {
        let docs = [
            PLAN,
            "## Sprint 0: Empty\n## Sprint 1: Also empty\n",
            "## Sprint 0: A\n### Task 0.3: c\n### Task 0.1: a\n## Sprint 1: B\n## Sprint 2: C\n1. **x**\n",
        ];
        for doc in docs {
            let plan = parse(doc).unwrap();
            let graph = resolve(&plan).unwrap();
            assert_eq!(graph.len(), plan.nodes().count());
        }
    }
}
