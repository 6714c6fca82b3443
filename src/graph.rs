// src/graph.rs

//! The dependency graph over a set of nodes.
//!
//! Built once from the root nodes before anything runs, the graph assigns a
//! dense [`NodeId`] to every reachable node (shared nodes are de-duplicated
//! by identity), derives forward and reverse edges, and verifies the
//! whole-graph invariants: acyclicity, no two producers for one output
//! file, every consumed file either on disk or produced by a declared
//! (transitive) dependency, and every declared executable resolvable.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::errors::GraphError;
use crate::fileset::FileSet;
use crate::fsutil;
use crate::node::Node;

pub type NodeId = usize;

#[derive(Debug)]
pub struct NodeGraph {
    nodes: Vec<Arc<Node>>,
    dependencies: Vec<Vec<NodeId>>,
    subnodes: Vec<Vec<NodeId>>,
    dependents: Vec<Vec<NodeId>>,
    parents: Vec<Vec<NodeId>>,
    topo: Vec<NodeId>,
}

impl NodeGraph {
    pub fn new(roots: &[Arc<Node>]) -> Result<Self, GraphError> {
        let mut nodes: Vec<Arc<Node>> = Vec::new();
        let mut ids: HashMap<*const Node, NodeId> = HashMap::new();

        // Discovery order is the input order, so ids are deterministic.
        let mut stack: Vec<Arc<Node>> = roots.iter().rev().cloned().collect();
        while let Some(node) = stack.pop() {
            let ptr = Arc::as_ptr(&node);
            if ids.contains_key(&ptr) {
                continue;
            }
            ids.insert(ptr, nodes.len());
            for child in node.dependencies().iter().chain(node.subnodes()).rev() {
                stack.push(child.clone());
            }
            nodes.push(node);
        }

        let count = nodes.len();
        let mut dependencies = vec![Vec::new(); count];
        let mut subnodes = vec![Vec::new(); count];
        let mut dependents = vec![Vec::new(); count];
        let mut parents = vec![Vec::new(); count];
        for (id, node) in nodes.iter().enumerate() {
            for dep in node.dependencies() {
                let dep_id = ids[&Arc::as_ptr(dep)];
                dependencies[id].push(dep_id);
                dependents[dep_id].push(id);
            }
            for sub in node.subnodes() {
                let sub_id = ids[&Arc::as_ptr(sub)];
                subnodes[id].push(sub_id);
                parents[sub_id].push(id);
            }
        }

        let topo = {
            let mut edges = DiGraphMap::<NodeId, ()>::new();
            for id in 0..count {
                edges.add_node(id);
            }
            for (id, deps) in dependencies.iter().enumerate() {
                for &dep in deps {
                    edges.add_edge(dep, id, ());
                }
            }
            for (id, subs) in subnodes.iter().enumerate() {
                for &sub in subs {
                    edges.add_edge(sub, id, ());
                }
            }
            toposort(&edges, None).map_err(|cycle| GraphError::Cycle {
                node: nodes[cycle.node_id()].label(),
            })?
        };

        let graph = Self {
            nodes,
            dependencies,
            subnodes,
            dependents,
            parents,
            topo,
        };
        graph.check_output_clobbers()?;
        graph.check_input_files()?;
        graph.check_executables()?;
        debug!(nodes = graph.len(), "node graph validated");
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        0..self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Arc<Node> {
        &self.nodes[id]
    }

    pub fn dependencies_of(&self, id: NodeId) -> &[NodeId] {
        &self.dependencies[id]
    }

    pub fn subnodes_of(&self, id: NodeId) -> &[NodeId] {
        &self.subnodes[id]
    }

    pub fn dependents_of(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id]
    }

    pub fn parents_of(&self, id: NodeId) -> &[NodeId] {
        &self.parents[id]
    }

    /// Ids in dependency-first order.
    pub fn topo_order(&self) -> &[NodeId] {
        &self.topo
    }

    /// Nodes (transitively) downstream of `id`, through both dependent and
    /// parent edges. Does not include `id` itself.
    pub fn downstream_of(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for &next in self.dependents[current]
                .iter()
                .chain(&self.parents[current])
            {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen.remove(&id);
        seen.into_iter().collect()
    }

    fn check_output_clobbers(&self) -> Result<(), GraphError> {
        let mut producers: BTreeMap<&std::path::Path, Vec<NodeId>> = BTreeMap::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if let Some(info) = node.info() {
                for path in info.output_files.iter() {
                    producers.entry(path).or_default().push(id);
                }
            }
        }

        for (path, ids) in &producers {
            if ids.len() > 1 {
                return Err(GraphError::OutputClobber {
                    file: path.to_path_buf(),
                    nodes: ids.iter().map(|&id| self.nodes[id].label()).collect(),
                });
            }
        }
        Ok(())
    }

    /// Every input and auxiliary file must either exist on disk or be the
    /// output of a node the consumer transitively depends on.
    fn check_input_files(&self) -> Result<(), GraphError> {
        let mut producer_of: BTreeMap<&std::path::Path, NodeId> = BTreeMap::new();
        for (id, node) in self.nodes.iter().enumerate() {
            if let Some(info) = node.info() {
                for path in info.output_files.iter() {
                    producer_of.insert(path, id);
                }
            }
        }

        // Transitive dependency closure per node, in topo order.
        let mut closures: Vec<BTreeSet<NodeId>> = vec![BTreeSet::new(); self.nodes.len()];
        for &id in &self.topo {
            let mut closure = BTreeSet::new();
            for &child in self.dependencies[id].iter().chain(&self.subnodes[id]) {
                closure.insert(child);
                closure.extend(closures[child].iter().copied());
            }
            closures[id] = closure;
        }

        let mut bad_files: BTreeMap<&std::path::Path, Vec<NodeId>> = BTreeMap::new();
        for (id, node) in self.nodes.iter().enumerate() {
            let Some(info) = node.info() else { continue };
            for path in info.input_files.iter().chain(info.auxiliary_files.iter()) {
                let satisfied = match producer_of.get(path) {
                    Some(&producer) => closures[id].contains(&producer),
                    None => path.exists(),
                };
                if !satisfied {
                    bad_files.entry(path).or_default().push(id);
                }
            }
        }

        if let Some((path, ids)) = bad_files.into_iter().next() {
            return Err(GraphError::MissingInput {
                file: path.to_path_buf(),
                nodes: ids.iter().map(|&id| self.nodes[id].label()).collect(),
            });
        }
        Ok(())
    }

    fn check_executables(&self) -> Result<(), GraphError> {
        let mut executables = FileSet::empty();
        for node in &self.nodes {
            if let Some(info) = node.info() {
                executables.merge(&info.executables);
            }
        }

        let missing = fsutil::missing_executables(&executables);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(GraphError::MissingExecutables {
                executables: missing,
            })
        }
    }
}
