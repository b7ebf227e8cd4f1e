//! Dependency graph built on `petgraph`.
//!
//! An edge `A -> B` means B references A's outputs or lists A in
//! `depends_on`, so A must be applied first.

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

use crate::error::GraphError;
use crate::model::{ResourceAddress, ResourceNode, ResourceRef, Selector};

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Derived from an attribute reference.
    Reference,
    /// Declared through `depends_on`.
    Explicit,
}

/// A frozen DAG of concrete resource nodes.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<ResourceAddress, EdgeKind>,
    index_map: HashMap<ResourceAddress, NodeIndex>,
    nodes: BTreeMap<ResourceAddress, ResourceNode>,
    groups: BTreeMap<String, Vec<ResourceAddress>>,
}

impl DependencyGraph {
    /// Builds the graph from expanded nodes.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for duplicate addresses, references to
    /// undeclared resources, self references and cycles.
    pub fn build(nodes: Vec<ResourceNode>) -> Result<Self, GraphError> {
        Self::build_with_groups(nodes, std::iter::empty::<String>())
    }

    /// Builds the graph, also recording declared `type.name` groups that
    /// expanded to zero instances. References to such a group add no edges
    /// and a splat over it resolves to an empty list.
    ///
    /// # Errors
    ///
    /// Same as [`DependencyGraph::build`].
    pub fn build_with_groups(
        nodes: Vec<ResourceNode>,
        declared: impl IntoIterator<Item = String>,
    ) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index_map = HashMap::new();
        let mut by_address = BTreeMap::new();
        let mut groups: BTreeMap<String, Vec<ResourceAddress>> = BTreeMap::new();

        for node in nodes {
            let address = node.address.clone();
            if by_address.contains_key(&address) {
                return Err(GraphError::DuplicateAddress {
                    address: address.to_string(),
                });
            }
            let idx = graph.add_node(address.clone());
            index_map.insert(address.clone(), idx);
            groups.entry(address.group()).or_default().push(address.clone());
            by_address.insert(address, node);
        }
        for group in declared {
            groups.entry(group).or_default();
        }
        for members in groups.values_mut() {
            members.sort();
        }

        let mut dag = Self {
            graph,
            index_map,
            nodes: by_address,
            groups,
        };

        let mut edges = Vec::new();
        for node in dag.nodes.values() {
            let referenced = node
                .references()
                .into_iter()
                .map(|r| (&r.target, EdgeKind::Reference));
            let explicit = node.depends_on.iter().map(|d| (d, EdgeKind::Explicit));

            for (target, kind) in referenced.chain(explicit) {
                for dependency in dag.targets(&node.address, target)? {
                    if dependency == node.address {
                        return Err(GraphError::SelfReference {
                            address: node.address.to_string(),
                        });
                    }
                    edges.push((dependency, node.address.clone(), kind));
                }
            }
        }

        for (from, to, kind) in edges {
            let from_idx = dag.index_map[&from];
            let to_idx = dag.index_map[&to];
            if dag.graph.find_edge(from_idx, to_idx).is_none() {
                dag.graph.add_edge(from_idx, to_idx, kind);
            }
        }

        // Surface cycles at build time.
        dag.topological_order()?;

        debug!(
            nodes = dag.graph.node_count(),
            edges = dag.graph.edge_count(),
            "Built dependency graph"
        );
        Ok(dag)
    }

    /// Resolves a reference target to the concrete addresses it covers.
    fn targets(
        &self,
        from: &ResourceAddress,
        target: &ResourceRef,
    ) -> Result<Vec<ResourceAddress>, GraphError> {
        let unknown = || GraphError::UnknownReference {
            from: from.to_string(),
            target: target.to_string(),
        };
        let members = self.groups.get(&target.group()).ok_or_else(unknown)?;

        match &target.selector {
            Selector::Single | Selector::Splat => Ok(members.clone()),
            Selector::Instance(key) => members
                .iter()
                .find(|a| a.key.as_ref() == Some(key))
                .cloned()
                .map(|a| vec![a])
                .ok_or_else(unknown),
        }
    }

    /// Declared groups with no instances.
    pub fn empty_groups(&self) -> impl Iterator<Item = &str> {
        self.groups
            .iter()
            .filter(|(_, members)| members.is_empty())
            .map(|(group, _)| group.as_str())
    }

    /// Returns the node with the given address.
    #[must_use]
    pub fn node(&self, address: &ResourceAddress) -> Option<&ResourceNode> {
        self.nodes.get(address)
    }

    /// Iterates nodes in address order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Iterates declared addresses in address order.
    pub fn addresses(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.nodes.keys()
    }

    /// Returns true if the address is declared.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.nodes.contains_key(address)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Topological order using Kahn's algorithm.
    ///
    /// Ties are broken by address so the order is deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] naming the nodes that take part in a
    /// cycle when the graph is not acyclic.
    pub fn topological_order(&self) -> Result<Vec<ResourceAddress>, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (idx, degree)
            })
            .collect();

        let mut ready: BTreeSet<(&ResourceAddress, NodeIndex)> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&idx, _)| (&self.graph[idx], idx))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some((address, idx)) = ready.pop_first() {
            order.push(address.clone());
            in_degree.remove(&idx);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((&self.graph[next], next));
                    }
                }
            }
        }

        if in_degree.is_empty() {
            return Ok(order);
        }

        Err(GraphError::Cycle {
            nodes: self.cycle_members(in_degree.into_keys().collect()),
        })
    }

    /// Reduces Kahn's residual set to the nodes on a cycle by peeling off
    /// nodes that only sit downstream of one.
    fn cycle_members(&self, mut residual: BTreeSet<NodeIndex>) -> Vec<String> {
        loop {
            let downstream: Vec<NodeIndex> = residual
                .iter()
                .copied()
                .filter(|&idx| {
                    !self
                        .graph
                        .neighbors_directed(idx, Direction::Outgoing)
                        .any(|n| residual.contains(&n))
                })
                .collect();
            if downstream.is_empty() {
                break;
            }
            for idx in downstream {
                residual.remove(&idx);
            }
        }

        let mut names: Vec<String> = residual
            .into_iter()
            .map(|idx| self.graph[idx].to_string())
            .collect();
        names.sort();
        names
    }

    /// Groups nodes by depth: the length of the longest path from a root.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if the graph is cyclic.
    pub fn levels(&self) -> Result<Vec<Vec<ResourceAddress>>, GraphError> {
        let depths = self.depths()?;
        let mut levels: Vec<Vec<ResourceAddress>> = Vec::new();
        for (address, depth) in depths {
            if levels.len() <= depth {
                levels.resize_with(depth + 1, Vec::new);
            }
            levels[depth].push(address);
        }
        for level in &mut levels {
            level.sort();
        }
        Ok(levels)
    }

    /// Depth of every node.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if the graph is cyclic.
    pub fn depths(&self) -> Result<BTreeMap<ResourceAddress, usize>, GraphError> {
        let mut depths = BTreeMap::new();
        for address in self.topological_order()? {
            let depth = self
                .dependencies(&address)
                .iter()
                .filter_map(|dep| depths.get(dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depths.insert(address, depth);
        }
        Ok(depths)
    }

    /// Direct dependencies of a node.
    #[must_use]
    pub fn dependencies(&self, address: &ResourceAddress) -> Vec<ResourceAddress> {
        self.neighbors(address, Direction::Incoming)
    }

    /// Direct dependents of a node.
    #[must_use]
    pub fn dependents(&self, address: &ResourceAddress) -> Vec<ResourceAddress> {
        self.neighbors(address, Direction::Outgoing)
    }

    /// Every node reachable downstream of `address`.
    #[must_use]
    pub fn transitive_dependents(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<ResourceAddress> = self.dependents(address).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
            }
        }
        seen
    }

    fn neighbors(&self, address: &ResourceAddress, direction: Direction) -> Vec<ResourceAddress> {
        let Some(&idx) = self.index_map.get(address) else {
            return Vec::new();
        };
        let mut out: Vec<ResourceAddress> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|i| self.graph[i].clone())
            .collect();
        out.sort();
        out
    }

    /// Edges as `(dependency, dependent, kind)` triples, sorted.
    #[must_use]
    pub fn edges(&self) -> Vec<(ResourceAddress, ResourceAddress, EdgeKind)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_indices()
            .filter_map(|e| {
                let (from, to) = self.graph.edge_endpoints(e)?;
                Some((
                    self.graph[from].clone(),
                    self.graph[to].clone(),
                    self.graph[e],
                ))
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        edges
    }
}

/// Orders removed resources for deletion using the dependencies recorded in
/// state: every level only holds resources whose dependents within the set
/// sit in earlier levels.
///
/// Dependencies outside the set are ignored.
#[must_use]
pub fn removal_levels(
    dependencies: &BTreeMap<ResourceAddress, Vec<ResourceAddress>>,
) -> Vec<Vec<ResourceAddress>> {
    let mut dependents: BTreeMap<&ResourceAddress, BTreeSet<&ResourceAddress>> =
        dependencies.keys().map(|a| (a, BTreeSet::new())).collect();
    for (address, deps) in dependencies {
        for dep in deps {
            if let Some(set) = dependents.get_mut(dep) {
                if dep != address {
                    set.insert(address);
                }
            }
        }
    }

    let mut levels = Vec::new();
    let mut remaining = dependents;
    while !remaining.is_empty() {
        let level: Vec<ResourceAddress> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(a, _)| (*a).clone())
            .collect();

        if level.is_empty() {
            // Recorded dependencies should never be cyclic; delete the rest together.
            warn!(
                remaining = remaining.len(),
                "Cyclic dependencies recorded in state, deleting remaining resources in one level"
            );
            levels.push(remaining.keys().map(|a| (*a).clone()).collect());
            break;
        }

        for address in &level {
            remaining.remove(address);
        }
        for deps in remaining.values_mut() {
            deps.retain(|d| !level.contains(*d));
        }
        levels.push(level);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrValue, InstanceKey};
    use serde_json::json;

    fn node(address: &str, refs: &[&str]) -> ResourceNode {
        let mut node = ResourceNode::new(ResourceAddress::parse(address).unwrap());
        for (i, r) in refs.iter().enumerate() {
            node = node.with_attribute(
                format!("ref{i}"),
                AttrValue::parse(&json!(format!("${{{r}}}"))).unwrap(),
            );
        }
        node
    }

    fn addr(s: &str) -> ResourceAddress {
        ResourceAddress::parse(s).unwrap()
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let graph = DependencyGraph::build(vec![
            node("aws_db.main", &["aws_subnet.a.id", "aws_iam_role.db.arn"]),
            node("aws_subnet.a", &["aws_vpc.main.id"]),
            node("aws_vpc.main", &[]),
            node("aws_iam_role.db", &[]),
        ])
        .unwrap();

        let order = graph.topological_order().unwrap();
        let pos = |s: &str| order.iter().position(|a| *a == addr(s)).unwrap();
        for (from, to, _) in graph.edges() {
            assert!(pos(&from.to_string()) < pos(&to.to_string()));
        }
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_levels_use_longest_path() {
        let graph = DependencyGraph::build(vec![
            node("t.a", &[]),
            node("t.b", &["t.a.id"]),
            node("t.c", &["t.a.id", "t.b.id"]),
            node("t.d", &[]),
        ])
        .unwrap();
        let levels = graph.levels().unwrap();
        assert_eq!(levels, vec![
            vec![addr("t.a"), addr("t.d")],
            vec![addr("t.b")],
            vec![addr("t.c")],
        ]);
    }

    #[test]
    fn test_cycle_names_only_participants() {
        let err = DependencyGraph::build(vec![
            node("t.a", &["t.c.id"]),
            node("t.b", &["t.a.id"]),
            node("t.c", &["t.b.id"]),
            node("t.tail", &["t.c.id"]),
            node("t.root", &[]),
        ])
        .unwrap_err();
        let GraphError::Cycle { nodes } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(nodes, vec!["t.a", "t.b", "t.c"]);
    }

    #[test]
    fn test_build_errors() {
        assert!(matches!(
            DependencyGraph::build(vec![node("t.a", &["t.missing.id"])]).unwrap_err(),
            GraphError::UnknownReference { .. }
        ));
        assert!(matches!(
            DependencyGraph::build(vec![node("t.a", &["t.a.id"])]).unwrap_err(),
            GraphError::SelfReference { .. }
        ));
        assert!(matches!(
            DependencyGraph::build(vec![node("t.a", &[]), node("t.a", &[])]).unwrap_err(),
            GraphError::DuplicateAddress { .. }
        ));
    }

    #[test]
    fn test_splat_over_zero_instance_group_adds_no_edges() {
        let lb = node("aws_lb.main", &["aws_subnet.az[*].id"]);
        let graph =
            DependencyGraph::build_with_groups(vec![lb], [String::from("aws_subnet.az")]).unwrap();

        assert!(graph.dependencies(&addr("aws_lb.main")).is_empty());
        assert_eq!(graph.empty_groups().collect::<Vec<_>>(), vec!["aws_subnet.az"]);
        assert_eq!(graph.levels().unwrap().len(), 1);
    }

    #[test]
    fn test_splat_and_explicit_dependencies() {
        let s0 = ResourceAddress::new("aws_subnet", "az").with_key(InstanceKey::Key(String::from("a")));
        let s1 = ResourceAddress::new("aws_subnet", "az").with_key(InstanceKey::Key(String::from("b")));
        let lb = node("aws_lb.main", &["aws_subnet.az[*].id"]);
        let agent = ResourceNode::new(addr("ci_agent.main"))
            .with_dependency(ResourceRef::parse_dependency("aws_lb.main").unwrap());

        let graph = DependencyGraph::build(vec![
            ResourceNode::new(s0.clone()),
            ResourceNode::new(s1.clone()),
            lb,
            agent,
        ])
        .unwrap();

        assert_eq!(graph.dependencies(&addr("aws_lb.main")), vec![s0.clone(), s1]);
        assert_eq!(
            graph.transitive_dependents(&s0),
            BTreeSet::from([addr("aws_lb.main"), addr("ci_agent.main")])
        );
        assert!(graph
            .edges()
            .iter()
            .any(|(_, to, kind)| *to == addr("ci_agent.main") && *kind == EdgeKind::Explicit));
    }

    #[test]
    fn test_removal_levels_delete_dependents_first() {
        let mut deps = BTreeMap::new();
        deps.insert(addr("t.vpc"), vec![]);
        deps.insert(addr("t.subnet"), vec![addr("t.vpc")]);
        deps.insert(addr("t.db"), vec![addr("t.subnet"), addr("t.kept")]);
        let levels = removal_levels(&deps);
        assert_eq!(levels, vec![
            vec![addr("t.db")],
            vec![addr("t.subnet")],
            vec![addr("t.vpc")],
        ]);
    }
}
