//! Dependency ordering for batch loads and shutdown.

use std::collections::{BTreeSet, HashMap};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;

/// One plugin as seen by the sorter.
#[derive(Debug, Clone, Copy)]
pub struct DepNode<'a> {
    pub name: &'a str,
    pub priority: i32,
    pub dependencies: &'a [String],
}

/// Result of [`dependency_order`]; all values are indices into the input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyOrder {
    /// Dependencies before dependents; ties by priority, then name.
    pub order: Vec<usize>,
    /// Nodes on a dependency cycle, in input order.
    pub cyclic: Vec<usize>,
    /// Nodes not on a cycle that depend (transitively) on one, with the
    /// unresolvable dependency's name.
    pub blocked: Vec<(usize, String)>,
}

/// Topologically sort `nodes` by their dependencies.
///
/// Dependencies naming plugins outside `nodes` are ignored here; whether
/// they are satisfied is checked when each plugin is activated.
pub fn dependency_order(nodes: &[DepNode<'_>]) -> DependencyOrder {
    // Edge d -> i: d loads before i. Node weights are input indices.
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(nodes.len(), nodes.len());
    let handles: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
    let index: HashMap<&str, NodeIndex> = nodes
        .iter()
        .zip(&handles)
        .map(|(n, idx)| (n.name, *idx))
        .collect();
    for (node, &to) in nodes.iter().zip(&handles) {
        for dep in node.dependencies {
            if let Some(&from) = index.get(dep.as_str()) {
                graph.update_edge(from, to, ());
            }
        }
    }

    let mut cyclic: Vec<usize> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|idx| graph[idx])
        .collect();
    cyclic.sort_unstable();

    // Everything downstream of a cycle can never load.
    let mut stuck = vec![false; nodes.len()];
    for &i in &cyclic {
        let mut dfs = Dfs::new(&graph, handles[i]);
        while let Some(idx) = dfs.next(&graph) {
            stuck[graph[idx]] = true;
        }
    }

    let blocked = (0..nodes.len())
        .filter(|i| stuck[*i] && cyclic.binary_search(i).is_err())
        .map(|i| {
            let blocker = nodes[i]
                .dependencies
                .iter()
                .find(|dep| index.get(dep.as_str()).map_or(false, |d| stuck[graph[*d]]))
                .cloned()
                .unwrap_or_default();
            (i, blocker)
        })
        .collect();

    // Priority-keyed walk over the acyclic remainder.
    let mut pending: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.neighbors_directed(idx, Direction::Incoming).count())
        .collect();
    let key = |idx: NodeIndex| {
        let node = &nodes[graph[idx]];
        (node.priority, node.name, idx)
    };
    let mut ready: BTreeSet<(i32, &str, NodeIndex)> = graph
        .node_indices()
        .filter(|idx| !stuck[graph[*idx]] && pending[graph[*idx]] == 0)
        .map(key)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some((_, _, idx)) = ready.pop_first() {
        order.push(graph[idx]);
        for dependent in graph.neighbors_directed(idx, Direction::Outgoing) {
            let i = graph[dependent];
            pending[i] -= 1;
            if pending[i] == 0 {
                ready.insert(key(dependent));
            }
        }
    }

    DependencyOrder {
        order,
        cyclic,
        blocked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn names<'a>(nodes: &[DepNode<'a>], idx: &[usize]) -> Vec<&'a str> {
        idx.iter().map(|i| nodes[*i].name).collect()
    }

    #[test]
    fn test_dependencies_first() {
        let (none, a) = (deps(&[]), deps(&["a"]));
        let nodes = [
            DepNode { name: "b", priority: 0, dependencies: &a },
            DepNode { name: "a", priority: 50, dependencies: &none },
        ];
        let result = dependency_order(&nodes);
        assert_eq!(names(&nodes, &result.order), vec!["a", "b"]);
        assert!(result.cyclic.is_empty());
    }

    #[test]
    fn test_ties_by_priority_then_name() {
        let none = deps(&[]);
        let nodes = [
            DepNode { name: "zeta", priority: 10, dependencies: &none },
            DepNode { name: "beta", priority: 20, dependencies: &none },
            DepNode { name: "alpha", priority: 20, dependencies: &none },
        ];
        let result = dependency_order(&nodes);
        assert_eq!(names(&nodes, &result.order), vec!["zeta", "alpha", "beta"]);
    }

    #[test]
    fn test_cycle_detected_and_downstream_blocked() {
        let (a, b, c, none) = (deps(&["a"]), deps(&["b"]), deps(&["b"]), deps(&[]));
        let nodes = [
            DepNode { name: "a", priority: 0, dependencies: &b },
            DepNode { name: "b", priority: 0, dependencies: &a },
            DepNode { name: "c", priority: 0, dependencies: &c },
            DepNode { name: "free", priority: 0, dependencies: &none },
        ];
        let result = dependency_order(&nodes);
        assert_eq!(names(&nodes, &result.order), vec!["free"]);
        assert_eq!(names(&nodes, &result.cyclic), vec!["a", "b"]);
        assert_eq!(result.blocked, vec![(2, "b".to_string())]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let (me, none) = (deps(&["me"]), deps(&[]));
        let nodes = [
            DepNode { name: "me", priority: 0, dependencies: &me },
            DepNode { name: "other", priority: 0, dependencies: &none },
        ];
        let result = dependency_order(&nodes);
        assert_eq!(names(&nodes, &result.cyclic), vec!["me"]);
        assert_eq!(names(&nodes, &result.order), vec!["other"]);
    }

    #[test]
    fn test_blocked_chain_names_nearest_blocker() {
        let (a, b, c, d) = (deps(&["b"]), deps(&["a"]), deps(&["b"]), deps(&["c", "c"]));
        let nodes = [
            DepNode { name: "a", priority: 0, dependencies: &a },
            DepNode { name: "b", priority: 0, dependencies: &b },
            DepNode { name: "c", priority: 0, dependencies: &c },
            DepNode { name: "d", priority: 0, dependencies: &d },
        ];
        let result = dependency_order(&nodes);
        assert!(result.order.is_empty());
        assert_eq!(
            result.blocked,
            vec![(2, "b".to_string()), (3, "c".to_string())]
        );
    }

    #[test]
    fn test_duplicate_dependency_entries() {
        let (none, twice) = (deps(&[]), deps(&["a", "a"]));
        let nodes = [
            DepNode { name: "b", priority: 0, dependencies: &twice },
            DepNode { name: "a", priority: 9, dependencies: &none },
        ];
        let result = dependency_order(&nodes);
        assert_eq!(names(&nodes, &result.order), vec!["a", "b"]);
    }

    #[test]
    fn test_external_dependencies_ignored() {
        let ext = deps(&["not-here"]);
        let nodes = [DepNode { name: "a", priority: 0, dependencies: &ext }];
        let result = dependency_order(&nodes);
        assert_eq!(result.order, vec![0]);
    }
}
