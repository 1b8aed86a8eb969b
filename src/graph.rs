//! The node graph.
//!
//! Nodes live in an arena ([`petgraph::Graph`]) and refer to each other by
//! [`NodeId`] handles, so parents never own their children and back
//! references cannot form ownership cycles. Edges point from a dependency to
//! its dependent, which is the direction work flows in.
//!
//! The graph is pure data. It is mutated while the build is being described
//! and while implicit dependencies are discovered, and is only read once the
//! walk starts.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::action::Action;
use crate::core::ArcStr;
use crate::error::ConfigError;
use crate::scanner::Scanner;

/// Handle to a node in a [`Graph`].
pub type NodeId = NodeIndex;

/// Per-run state of a node. States only move forward within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Unvisited,
    Pending,
    UpToDate,
    NeedsBuild,
    Executing,
    Built,
    Failed,
}

impl NodeState {
    /// Whether the node will not change state again in this run.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::UpToDate | NodeState::Built | NodeState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Unvisited => "unvisited",
            NodeState::Pending => "pending",
            NodeState::UpToDate => "up-to-date",
            NodeState::NeedsBuild => "needs-build",
            NodeState::Executing => "executing",
            NodeState::Built => "built",
            NodeState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flags set on a node by the build description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes {
    /// The output is never deleted before the action reruns.
    pub precious: bool,
    /// The node is rebuilt on every run regardless of its signature.
    pub always_build: bool,
    /// A failing action does not fail the node's dependents.
    pub ignore_errors: bool,
    /// The node is a byproduct of another node's action.
    pub side_effect: bool,
}

/// Why one node depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dependency {
    /// Declared by the build description.
    Explicit,
    /// Discovered by a scanner.
    Implicit,
    /// The dependent is written as a byproduct of the dependency's action.
    SideEffect,
}

/// Edge weight. `seq` is the order edges were added in, which survives
/// edge removal where petgraph's edge indices do not.
#[derive(Debug, Clone, Copy)]
struct Edge {
    kind: Dependency,
    seq: usize,
}

pub struct Node {
    key: ArcStr,
    path: Option<Utf8PathBuf>,
    pub(crate) action: Option<Arc<dyn Action>>,
    pub(crate) scanner: Option<Arc<dyn Scanner>>,
    pub attributes: Attributes,
    /// Created by a scanner rather than the build description.
    discovered: bool,
}

impl Node {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn key_arc(&self) -> &ArcStr {
        &self.key
    }

    /// File system location, absent for aliases.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn action(&self) -> Option<&dyn Action> {
        self.action.as_deref()
    }

    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }

    /// A source is a file nothing in the graph knows how to produce.
    pub fn is_source(&self) -> bool {
        self.action.is_none() && self.path.is_some() && !self.attributes.side_effect
    }

    /// Whether the node only exists because a scanner named it.
    pub fn is_discovered(&self) -> bool {
        self.discovered
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("action", &self.action.as_ref().map(|a| a.identity().into_owned()))
            .field("attributes", &self.attributes)
            .finish()
    }
}

#[derive(Default)]
pub struct Graph {
    graph: petgraph::Graph<Node, Edge>,
    index: HashMap<ArcStr, NodeId>,
    next_seq: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the file node for `key`, creating it on first use.
    pub fn add_node(&mut self, key: impl AsRef<str>) -> NodeId {
        let key = key.as_ref();
        self.insert(key, Some(Utf8PathBuf::from(key)))
    }

    /// Returns the alias node `name`, creating it on first use. Aliases have
    /// no file behind them and only group other nodes.
    pub fn add_alias(&mut self, name: impl AsRef<str>) -> NodeId {
        self.insert(name.as_ref(), None)
    }

    fn insert(&mut self, key: &str, path: Option<Utf8PathBuf>) -> NodeId {
        if let Some(&id) = self.index.get(key) {
            return id;
        }

        let key: ArcStr = key.into();
        let id = self.graph.add_node(Node {
            key: key.clone(),
            path,
            action: None,
            scanner: None,
            attributes: Attributes::default(),
            discovered: false,
        });
        self.index.insert(key, id);
        id
    }

    pub fn get(&self, key: &str) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    pub fn lookup(&self, key: &str) -> Result<NodeId, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::UnknownNode(key.into()))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.graph[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.graph[id]
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices()
    }

    pub fn set_action(&mut self, id: NodeId, action: impl Action + 'static) {
        self.graph[id].action = Some(Arc::new(action));
    }

    pub fn set_scanner(&mut self, id: NodeId, scanner: impl Scanner + 'static) {
        self.graph[id].scanner = Some(Arc::new(scanner));
    }

    pub fn attributes_mut(&mut self, id: NodeId) -> &mut Attributes {
        &mut self.graph[id].attributes
    }

    /// Returns the node for a file a scanner referenced, creating it on first
    /// use. Nodes the build description already knows keep their standing.
    pub(crate) fn add_discovered(&mut self, key: &str) -> NodeId {
        if let Some(&id) = self.index.get(key) {
            return id;
        }
        let id = self.add_node(key);
        self.graph[id].discovered = true;
        id
    }

    /// Declares that `parent` depends on `child`. Repeated declarations are
    /// ignored.
    pub fn add_dependency(&mut self, parent: NodeId, child: NodeId) {
        self.graph[child].discovered = false;
        self.connect(parent, child, Dependency::Explicit);
    }

    /// Records an implicit dependency. Returns `false` when the two nodes
    /// were already connected.
    pub(crate) fn add_implicit(&mut self, parent: NodeId, child: NodeId) -> bool {
        self.connect(parent, child, Dependency::Implicit)
    }

    /// Drops every implicit dependency of the nodes in `parents`, so a new
    /// discovery pass starts from the declared graph.
    pub(crate) fn clear_implicit(&mut self, parents: &BTreeSet<NodeId>) {
        self.graph.retain_edges(|graph, edge| {
            graph[edge].kind != Dependency::Implicit
                || graph
                    .edge_endpoints(edge)
                    .is_none_or(|(_, parent)| !parents.contains(&parent))
        });
    }

    /// Declares `side` as a byproduct of `producer`'s action. The side-effect
    /// node becomes a dependent of the producer, and producers sharing a
    /// side effect never run at the same time.
    pub fn add_side_effect(&mut self, producer: NodeId, side: NodeId) {
        let node = &mut self.graph[side];
        node.attributes.side_effect = true;
        node.discovered = false;
        self.connect(side, producer, Dependency::SideEffect);
    }

    fn connect(&mut self, parent: NodeId, child: NodeId, kind: Dependency) -> bool {
        if let Some(edge) = self.graph.find_edge(child, parent) {
            // A declaration outranks a discovery of the same edge.
            let existing = &mut self.graph[edge];
            if existing.kind == Dependency::Implicit && kind == Dependency::Explicit {
                existing.kind = kind;
            }
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.graph.add_edge(child, parent, Edge { kind, seq });
        true
    }

    fn sorted_edges(&self, id: NodeId, direction: Direction) -> Vec<(Dependency, usize, NodeId)> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(id, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                let Edge { kind, seq } = *edge.weight();
                (kind, seq, other)
            })
            .collect();
        edges.sort();
        edges
    }

    /// All dependencies of `id`: explicit ones in declaration order, then
    /// implicit ones in discovery order, then side-effect producers.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.sorted_edges(id, Direction::Incoming)
            .into_iter()
            .map(|(_, _, child)| child)
            .collect()
    }

    /// Dependencies of the given kind, in order.
    pub fn children_of_kind(&self, id: NodeId, kind: Dependency) -> Vec<NodeId> {
        self.sorted_edges(id, Direction::Incoming)
            .into_iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, child)| child)
            .collect()
    }

    /// Nodes depending on `id`.
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        self.sorted_edges(id, Direction::Outgoing)
            .into_iter()
            .map(|(_, _, parent)| parent)
            .collect()
    }

    /// Side-effect nodes written by `id`'s action.
    pub fn side_effects(&self, id: NodeId) -> Vec<NodeId> {
        self.sorted_edges(id, Direction::Outgoing)
            .into_iter()
            .filter(|(kind, _, _)| *kind == Dependency::SideEffect)
            .map(|(_, _, side)| side)
            .collect()
    }

    /// Every node reachable from `roots` through dependency edges, roots
    /// included.
    pub fn closure(&self, roots: &[NodeId]) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeId> = roots.to_vec();

        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.graph.neighbors_directed(id, Direction::Incoming));
            }
        }

        seen
    }

    /// Finds every dependency cycle. Each cycle is reported as a key sequence
    /// that starts and ends at the same node, following "depends on" edges.
    /// An empty result means the graph is acyclic.
    pub fn detect_cycles(&self) -> Vec<Vec<ArcStr>> {
        let mut cycles = Vec::new();

        for component in petgraph::algo::tarjan_scc(&self.graph) {
            let Some(&start) = component.iter().min() else {
                continue;
            };

            if component.len() == 1 && self.graph.find_edge(start, start).is_none() {
                continue;
            }

            let members: HashSet<NodeId> = component.iter().copied().collect();
            let path = self.cycle_path(start, &members);
            cycles.push(path.into_iter().map(|id| self.graph[id].key.clone()).collect());
        }

        cycles.sort();
        cycles
    }

    /// Shortest walk from `start` back to itself inside one strongly
    /// connected component.
    fn cycle_path(&self, start: NodeId, members: &HashSet<NodeId>) -> Vec<NodeId> {
        let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
        let mut queue = VecDeque::new();
        let mut closing = None;

        for child in self.children(start) {
            if child == start {
                return vec![start, start];
            }
            if members.contains(&child) && !previous.contains_key(&child) {
                previous.insert(child, start);
                queue.push_back(child);
            }
        }

        while let Some(id) = queue.pop_front() {
            for child in self.children(id) {
                if child == start {
                    closing = Some(id);
                    break;
                }
                if members.contains(&child) && !previous.contains_key(&child) {
                    previous.insert(child, id);
                    queue.push_back(child);
                }
            }
            if closing.is_some() {
                break;
            }
        }

        let mut path = vec![start];
        let mut cursor = closing;
        while let Some(id) = cursor {
            path.push(id);
            cursor = previous.get(&id).copied().filter(|&p| p != start);
        }
        path[1..].reverse();
        path.push(start);
        path
    }
}
