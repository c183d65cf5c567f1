//! The dependency graph arena.
//!
//! Nodes live in a flat vector and edges are index sets, so the graph
//! is acyclic-checkable and mutable during the walk without any shared
//! ownership between nodes. An edge from `a` to `b` records that `a`
//! depends on `b` and must be visited after it.

use std::collections::BTreeSet;

use super::node::GraphNode;

/// Index of a node within its [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// The raw index, for diagnostics.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A directed dependency graph over [`GraphNode`]s.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<GraphNode>,
    /// Per node, the nodes it depends on.
    deps: Vec<BTreeSet<usize>>,
    /// Per node, the nodes depending on it.
    rdeps: Vec<BTreeSet<usize>>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id.
    pub fn add_node(&mut self, node: GraphNode) -> NodeId {
        self.nodes.push(node);
        self.deps.push(BTreeSet::new());
        self.rdeps.push(BTreeSet::new());
        NodeId(self.nodes.len() - 1)
    }

    /// Records that `node` must be visited after `depends_on`.
    /// Self-edges are ignored.
    pub fn add_dependency(&mut self, node: NodeId, depends_on: NodeId) {
        if node == depends_on {
            return;
        }
        self.deps[node.0].insert(depends_on.0);
        self.rdeps[depends_on.0].insert(node.0);
    }

    /// Removes a dependency edge, if present.
    pub fn remove_dependency(&mut self, node: NodeId, depends_on: NodeId) {
        self.deps[node.0].remove(&depends_on.0);
        self.rdeps[depends_on.0].remove(&node.0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    /// All node ids, in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    /// The nodes `id` depends on.
    pub fn dependencies(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.deps[id.0].iter().copied().map(NodeId)
    }

    /// The nodes depending on `id`.
    pub fn dependents(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.rdeps[id.0].iter().copied().map(NodeId)
    }

    #[must_use]
    pub fn dependency_count(&self, id: NodeId) -> usize {
        self.deps[id.0].len()
    }

    /// The transitive closure of dependencies of the given seed nodes,
    /// including the seeds themselves.
    #[must_use]
    pub fn ancestors_of(&self, seeds: &[NodeId]) -> BTreeSet<NodeId> {
        let mut seen: BTreeSet<NodeId> = seeds.iter().copied().collect();
        let mut stack: Vec<NodeId> = seeds.to_vec();
        while let Some(id) = stack.pop() {
            for dep in self.dependencies(id) {
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        seen
    }

    /// The transitive closure of dependents of the given seed nodes,
    /// including the seeds themselves.
    #[must_use]
    pub fn descendants_of(&self, seeds: &[NodeId]) -> BTreeSet<NodeId> {
        let mut seen: BTreeSet<NodeId> = seeds.iter().copied().collect();
        let mut stack: Vec<NodeId> = seeds.to_vec();
        while let Some(id) = stack.pop() {
            for dependent in self.dependents(id) {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Removes every node not in `keep`, rewiring nothing: edges
    /// touching removed nodes are dropped. Ids are compacted.
    pub fn retain(&mut self, keep: &BTreeSet<NodeId>) {
        let mut remap = vec![usize::MAX; self.nodes.len()];
        let mut nodes = Vec::with_capacity(keep.len());
        for (old, node) in self.nodes.drain(..).enumerate() {
            if keep.contains(&NodeId(old)) {
                remap[old] = nodes.len();
                nodes.push(node);
            }
        }
        let remap_set = |set: &BTreeSet<usize>| -> BTreeSet<usize> {
            set.iter()
                .filter_map(|&i| (remap[i] != usize::MAX).then_some(remap[i]))
                .collect()
        };
        let deps = self
            .deps
            .iter()
            .enumerate()
            .filter(|(old, _)| remap[*old] != usize::MAX)
            .map(|(_, set)| remap_set(set))
            .collect();
        let rdeps = self
            .rdeps
            .iter()
            .enumerate()
            .filter(|(old, _)| remap[*old] != usize::MAX)
            .map(|(_, set)| remap_set(set))
            .collect();
        self.nodes = nodes;
        self.deps = deps;
        self.rdeps = rdeps;
    }

    /// Finds one dependency cycle, if any, as a path of node ids.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color = vec![Color::White; self.nodes.len()];
        let mut parent = vec![usize::MAX; self.nodes.len()];

        for start in 0..self.nodes.len() {
            if color[start] != Color::White {
                continue;
            }
            // Iterative DFS along dependency edges.
            let mut stack = vec![(start, false)];
            while let Some((n, processed)) = stack.pop() {
                if processed {
                    color[n] = Color::Black;
                    continue;
                }
                if color[n] == Color::Black {
                    continue;
                }
                color[n] = Color::Gray;
                stack.push((n, true));
                for &dep in &self.deps[n] {
                    match color[dep] {
                        Color::White => {
                            parent[dep] = n;
                            stack.push((dep, false));
                        }
                        Color::Gray => {
                            // Back edge: walk parents from n to dep.
                            let mut cycle = vec![NodeId(dep)];
                            let mut cur = n;
                            while cur != dep && cur != usize::MAX {
                                cycle.push(NodeId(cur));
                                cur = parent[cur];
                            }
                            cycle.reverse();
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                }
            }
        }
        None
    }

    /// Nodes with no dependents, i.e. nothing waits on them.
    #[must_use]
    pub fn sinkless(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .filter(|&n| self.rdeps[n].is_empty())
            .map(NodeId)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::GraphNode;

    fn label(name: &str) -> GraphNode {
        GraphNode::Provider {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_cycle_detection() {
        let mut g = Graph::new();
        let a = g.add_node(label("a"));
        let b = g.add_node(label("b"));
        let c = g.add_node(label("c"));
        g.add_dependency(a, b);
        g.add_dependency(b, c);
        assert!(g.find_cycle().is_none());

        g.add_dependency(c, a);
        let cycle = g.find_cycle().expect("cycle expected");
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn test_retain_compacts_and_drops_edges() {
        let mut g = Graph::new();
        let a = g.add_node(label("a"));
        let b = g.add_node(label("b"));
        let c = g.add_node(label("c"));
        g.add_dependency(a, b);
        g.add_dependency(b, c);

        let keep: BTreeSet<NodeId> = [a, c].into_iter().collect();
        g.retain(&keep);
        assert_eq!(g.len(), 2);
        // The a->b and b->c edges are gone with b.
        for id in g.node_ids() {
            assert_eq!(g.dependency_count(id), 0);
        }
    }

    #[test]
    fn test_ancestors_of() {
        let mut g = Graph::new();
        let a = g.add_node(label("a"));
        let b = g.add_node(label("b"));
        let c = g.add_node(label("c"));
        let d = g.add_node(label("d"));
        g.add_dependency(a, b);
        g.add_dependency(b, c);

        let closure = g.ancestors_of(&[a]);
        assert!(closure.contains(&a) && closure.contains(&b) && closure.contains(&c));
        assert!(!closure.contains(&d));
    }

    #[test]
    fn test_descendants_of() {
        let mut g = Graph::new();
        let a = g.add_node(label("a"));
        let b = g.add_node(label("b"));
        let c = g.add_node(label("c"));
        let d = g.add_node(label("d"));
        g.add_dependency(a, b);
        g.add_dependency(b, c);

        let closure = g.descendants_of(&[c]);
        assert!(closure.contains(&c) && closure.contains(&b) && closure.contains(&a));
        assert!(!closure.contains(&d));
    }

    #[test]
    fn test_remove_dependency() {
        let mut g = Graph::new();
        let a = g.add_node(label("a"));
        let b = g.add_node(label("b"));
        g.add_dependency(a, b);
        assert_eq!(g.dependency_count(a), 1);

        g.remove_dependency(a, b);
        assert_eq!(g.dependency_count(a), 0);
        assert_eq!(g.dependents(b).count(), 0);
    }
}
