//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse dependency edges strictly from each node's
//! `depends_on`, validates them, and computes a stable topological order.

use dagsmith_core::NodeId;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::manifest::Manifest;

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: node -> sorted, deduplicated list of nodes it depends on
    parents: BTreeMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> sorted list of nodes that depend on it
    children: BTreeMap<NodeId, Vec<NodeId>>,

    /// Topological order, ties broken by unique_id
    order: Vec<NodeId>,

    /// Position of each node in `order`
    topo_index: HashMap<NodeId, usize>,
}

impl DependencyGraph {
    /// Build a dependency graph from every node and source in a manifest
    ///
    /// Fails if an edge targets a node that is not in the manifest, or if
    /// the edges form a cycle.
    pub fn build(manifest: &Manifest) -> Result<Self, GraphValidationError> {
        let mut parents: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();

        for node in manifest.iter() {
            let mut deps = Vec::with_capacity(node.depends_on.nodes.len());
            for dep in &node.depends_on.nodes {
                if !manifest.contains(dep) {
                    return Err(GraphValidationError::MissingDependency {
                        node: node.unique_id.clone(),
                        dependency: dep.clone(),
                    });
                }
                deps.push(dep.clone());
            }
            deps.sort();
            deps.dedup();
            parents.insert(node.unique_id.clone(), deps);
        }

        let graph = Self::from_parents(parents)?;
        tracing::debug!(nodes = graph.len(), "built dependency graph");
        Ok(graph)
    }

    /// Build from a complete parent map (every edge target is a key)
    fn from_parents(parents: BTreeMap<NodeId, Vec<NodeId>>) -> Result<Self, GraphValidationError> {
        let mut children: BTreeMap<NodeId, Vec<NodeId>> =
            parents.keys().map(|id| (id.clone(), Vec::new())).collect();

        for (node_id, deps) in &parents {
            for dep in deps {
                if let Some(list) = children.get_mut(dep) {
                    list.push(node_id.clone());
                }
            }
        }
        // BTreeMap iteration already yields children in lexical order

        let order = topological_order(&parents, &children)?;
        let topo_index = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        Ok(Self {
            parents,
            children,
            order,
            topo_index,
        })
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.parents.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// All nodes in topological order
    pub fn nodes(&self) -> &[NodeId] {
        &self.order
    }

    /// Stable topological linearization
    ///
    /// Every node appears after all of its parents; among nodes whose
    /// parents are all placed, the lexically smallest unique_id comes first.
    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Position of a node in the topological order
    pub fn topo_index(&self, node_id: &str) -> Option<usize> {
        self.topo_index.get(node_id).copied()
    }

    /// Get immediate parents (dependencies) of a node
    pub fn parents(&self, node_id: &str) -> &[NodeId] {
        self.parents.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Get immediate children (dependents) of a node
    pub fn children(&self, node_id: &str) -> &[NodeId] {
        self.children.get(node_id).map(Vec::as_slice).unwrap_or_default()
    }

    /// All upstream nodes (transitive closure of parents), excluding the node
    pub fn ancestors(&self, node_id: &str) -> BTreeSet<NodeId> {
        self.walk(node_id, &self.parents, None)
    }

    /// All downstream nodes (transitive closure of children), excluding the node
    pub fn descendants(&self, node_id: &str) -> BTreeSet<NodeId> {
        self.walk(node_id, &self.children, None)
    }

    /// Upstream nodes at most `depth` edges away
    pub fn ancestors_within(&self, node_id: &str, depth: usize) -> BTreeSet<NodeId> {
        self.walk(node_id, &self.parents, Some(depth))
    }

    /// Downstream nodes at most `depth` edges away
    pub fn descendants_within(&self, node_id: &str, depth: usize) -> BTreeSet<NodeId> {
        self.walk(node_id, &self.children, Some(depth))
    }

    /// Check if `target` is reachable downstream from `source`
    pub fn has_path(&self, source: &str, target: &str) -> bool {
        self.descendants(source).contains(target)
    }

    fn walk(
        &self,
        start: &str,
        edges: &BTreeMap<NodeId, Vec<NodeId>>,
        max_depth: Option<usize>,
    ) -> BTreeSet<NodeId> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((start, 0usize));

        // BFS so that the first visit of a node is at its shortest distance
        while let Some((current, depth)) = queue.pop_front() {
            if max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            for next in edges.get(current).into_iter().flatten() {
                if next != start && visited.insert(next.clone()) {
                    queue.push_back((next.as_str(), depth + 1));
                }
            }
        }

        visited
    }

    /// Induced subgraph over `selected`, preserving transitive ordering
    ///
    /// Each selected node's parents become its nearest selected ancestors,
    /// so removing an unselected node connects its parents to its children.
    /// Ids not present in the graph are ignored.
    pub fn subgraph(&self, selected: &BTreeSet<NodeId>) -> DependencyGraph {
        let mut parents = BTreeMap::new();

        for node_id in selected.iter().filter(|id| self.contains(id)) {
            let mut nearest = BTreeSet::new();
            let mut seen = BTreeSet::new();
            let mut stack: Vec<&NodeId> = self.parents(node_id).iter().collect();

            while let Some(parent) = stack.pop() {
                if !seen.insert(parent) {
                    continue;
                }
                if selected.contains(parent) {
                    nearest.insert(parent.clone());
                } else {
                    stack.extend(self.parents(parent));
                }
            }

            parents.insert(node_id.clone(), nearest.into_iter().collect::<Vec<_>>());
        }

        let mut children: BTreeMap<NodeId, Vec<NodeId>> =
            parents.keys().map(|id| (id.clone(), Vec::new())).collect();
        for (node_id, deps) in &parents {
            for dep in deps {
                if let Some(list) = children.get_mut(dep) {
                    list.push(node_id.clone());
                }
            }
        }

        // The restriction of a topological order is a topological order of
        // the restricted graph, and keeps the same tie-breaks.
        let order: Vec<NodeId> = self
            .order
            .iter()
            .filter(|id| parents.contains_key(*id))
            .cloned()
            .collect();
        let topo_index = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        DependencyGraph {
            parents,
            children,
            order,
            topo_index,
        }
    }
}

/// Kahn's algorithm with a lexically ordered ready set
fn topological_order(
    parents: &BTreeMap<NodeId, Vec<NodeId>>,
    children: &BTreeMap<NodeId, Vec<NodeId>>,
) -> Result<Vec<NodeId>, GraphValidationError> {
    let mut in_degree: BTreeMap<&str, usize> = parents
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.len()))
        .collect();

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, &degree)| degree == 0)
        .map(|(&id, _)| id)
        .collect();

    let mut order = Vec::with_capacity(parents.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());

        for child in children.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(child.as_str());
                }
            }
        }
    }

    if order.len() == parents.len() {
        return Ok(order);
    }

    let remaining: BTreeSet<&str> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(id, _)| id)
        .collect();

    Err(GraphValidationError::Cycle {
        path: find_cycle(parents, &remaining),
    })
}

/// Extract one cycle from the nodes Kahn's algorithm could not place
///
/// Every remaining node still has at least one remaining parent, so
/// following remaining parents from any of them must revisit a node.
fn find_cycle(parents: &BTreeMap<NodeId, Vec<NodeId>>, remaining: &BTreeSet<&str>) -> Vec<NodeId> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut current = start;

    loop {
        if let Some(&pos) = position.get(current) {
            let mut cycle: Vec<NodeId> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);

        let next = parents
            .get(current)
            .into_iter()
            .flatten()
            .find(|p| remaining.contains(p.as_str()));

        match next {
            Some(next) => current = next.as_str(),
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Graph validation errors; fatal before compilation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphValidationError {
    #[error("Node '{node}' depends on '{dependency}', which is not in the manifest")]
    MissingDependency { node: NodeId, dependency: NodeId },

    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<NodeId> },

    #[error("Invalid selector '{0}'")]
    UnknownSelector(String),
}
