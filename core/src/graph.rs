//! Indoor navigation graph model.
//!
//! The graph is loaded once (typically from JSON handed over by the caching collaborator), validated eagerly,
//! and then indexed into a read-only [`NavGraph`]. Topology is never mutated in place: a new graph requires a
//! new `NavGraph`.
//!
//! Edges are stored once, in one direction. Every stored edge implies a mirror edge for traversal in the opposite
//! direction whose `forward_bias` is `1 - forward_bias`. The mirror is derived when the adjacency index is built
//! and is never part of the serialized data.
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt::{self, Display};

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{NodeId, Position};

/// A navigation graph node: the finest position granularity the engine reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// x coordinate in meters, floor-local frame
    pub x: f64,
    /// y coordinate in meters, floor-local frame
    pub y: f64,
}
impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node {} ({:.2}, {:.2})", self.id, self.x, self.y)
    }
}
impl Node {
    pub fn new(id: impl Into<NodeId>, x: f64, y: f64) -> Node {
        Node {
            id: id.into(),
            x,
            y,
        }
    }
    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }
}

fn default_forward_bias() -> f64 {
    0.5
}

/// A directed edge between two nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    /// Walking length of the edge in meters
    pub length: f64,
    /// Traversal preference in [0, 1] for `from -> to`; 0.5 is symmetric
    #[serde(default = "default_forward_bias", rename = "forwardBias", alias = "forward_bias")]
    pub forward_bias: f64,
}
impl Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Edge {} -> {} ({:.2} m, bias {:.2})",
            self.from, self.to, self.length, self.forward_bias
        )
    }
}
impl Edge {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, length: f64) -> Edge {
        Edge {
            from: from.into(),
            to: to.into(),
            length,
            forward_bias: default_forward_bias(),
        }
    }
    pub fn with_forward_bias(mut self, forward_bias: f64) -> Edge {
        self.forward_bias = forward_bias;
        self
    }
    /// The derived mirror edge, traversing `to -> from` with bias `1 - forward_bias`
    pub fn reversed(&self) -> Edge {
        Edge {
            from: self.to.clone(),
            to: self.from.clone(),
            length: self.length,
            forward_bias: 1.0 - self.forward_bias,
        }
    }
}

/// Raw graph data: the set of nodes plus edges, as delivered by the caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}
impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Graph {
        Graph { nodes, edges }
    }
    /// Check every structural invariant, describing the first violation found.
    ///
    /// Node ids must be unique with finite coordinates. Every edge must reference existing endpoints, have a
    /// finite positive length and a forward bias in [0, 1].
    pub fn check(&self) -> Result<()> {
        let mut ids: HashSet<&str> = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !node.x.is_finite() || !node.y.is_finite() {
                bail!("node '{}' has a non-finite position", node.id);
            }
            if !ids.insert(node.id.as_str()) {
                bail!("duplicate node id '{}'", node.id);
            }
        }
        for edge in &self.edges {
            if !ids.contains(edge.from.as_str()) {
                bail!("edge {} references missing node '{}'", edge, edge.from);
            }
            if !ids.contains(edge.to.as_str()) {
                bail!("edge {} references missing node '{}'", edge, edge.to);
            }
            if !edge.length.is_finite() || edge.length <= 0.0 {
                bail!("edge {} must have a positive length", edge);
            }
            if !(0.0..=1.0).contains(&edge.forward_bias) {
                bail!("edge {} has a forward bias outside [0, 1]", edge);
            }
        }
        Ok(())
    }
    /// `true` when every edge references existing endpoints and all other invariants of [`Graph::check`] hold
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }
}

/// Validated, indexed, read-only navigation graph.
#[derive(Clone, Debug, Default)]
pub struct NavGraph {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    adjacency: HashMap<NodeId, Vec<(NodeId, Edge)>>,
    edge_count: usize,
}
impl Display for NavGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NavGraph {{ nodes: {}, edges: {} }}",
            self.nodes.len(),
            self.edge_count
        )
    }
}
impl TryFrom<Graph> for NavGraph {
    type Error = anyhow::Error;
    fn try_from(graph: Graph) -> Result<Self> {
        NavGraph::new(graph)
    }
}
impl NavGraph {
    /// Build the id lookup and the bidirectional adjacency index.
    ///
    /// # Errors
    /// Invalid graphs are rejected, never repaired. See [`Graph::check`].
    pub fn new(graph: Graph) -> Result<NavGraph> {
        graph.check().context("invalid navigation graph")?;
        let Graph { nodes, edges } = graph;
        let index: HashMap<NodeId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.clone(), i))
            .collect();
        let mut adjacency: HashMap<NodeId, Vec<(NodeId, Edge)>> = nodes
            .iter()
            .map(|node| (node.id.clone(), Vec::new()))
            .collect();
        for edge in &edges {
            let mirror = edge.reversed();
            if let Some(list) = adjacency.get_mut(&edge.from) {
                list.push((edge.to.clone(), edge.clone()));
            }
            if let Some(list) = adjacency.get_mut(&mirror.from) {
                list.push((mirror.to.clone(), mirror));
            }
        }
        debug!(
            "Indexed navigation graph with {} nodes and {} edges",
            nodes.len(),
            edges.len()
        );
        Ok(NavGraph {
            nodes,
            index,
            adjacency,
            edge_count: edges.len(),
        })
    }
    /// Parse graph JSON (`{"nodes": [...], "edges": [...]}`) and index it
    pub fn from_json(json: &str) -> Result<NavGraph> {
        let graph: Graph = serde_json::from_str(json).context("malformed graph JSON")?;
        NavGraph::new(graph)
    }
    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.id.as_str())
    }
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }
    /// Neighbors of a node in both edge directions, each paired with the edge oriented away from `id`.
    ///
    /// Unknown ids have no neighbors.
    pub fn neighbors(&self, id: &str) -> &[(NodeId, Edge)] {
        self.adjacency
            .get(id)
            .map(|list| list.as_slice())
            .unwrap_or(&[])
    }
    /// Planar Euclidean distance between two nodes, `None` if either is unknown
    pub fn distance(&self, a: &str, b: &str) -> Option<f64> {
        let a = self.node(a)?;
        let b = self.node(b)?;
        Some(a.position().distance_to(&b.position()))
    }
    /// All nodes within `radius` meters of `point`
    pub fn nodes_within_radius(&self, point: &Position, radius: f64) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| node.position().distance_to(point) <= radius)
            .collect()
    }
    /// All nodes within `radius` meters of node `id`, including the node itself. Unknown ids yield nothing.
    pub fn nodes_within_radius_of(&self, id: &str, radius: f64) -> Vec<&Node> {
        match self.node(id) {
            Some(center) => self.nodes_within_radius(&center.position(), radius),
            None => Vec::new(),
        }
    }
    /// Node closest to `point`, ties broken by graph order
    pub fn nearest_node(&self, point: &Position) -> Option<&Node> {
        self.nodes.iter().min_by(|a, b| {
            a.position()
                .distance_to(point)
                .total_cmp(&b.position().distance_to(point))
        })
    }
    /// Geometric heading of an edge in radians, `None` if the endpoints coincide or are unknown
    pub fn edge_heading(&self, edge: &Edge) -> Option<f64> {
        let from = self.node(&edge.from)?;
        let to = self.node(&edge.to)?;
        from.position().heading_to(&to.position())
    }
    /// Shortest walking distance from `source` to every node reachable from it.
    ///
    /// Edges are walkable in both directions. Unknown sources reach nothing.
    pub fn path_lengths_from(&self, source: &str) -> HashMap<&str, f64> {
        let mut settled: HashMap<&str, f64> = HashMap::new();
        let Some(start) = self.node(source) else {
            return settled;
        };
        let mut frontier = BinaryHeap::new();
        frontier.push(Frontier {
            cost: 0.0,
            id: start.id.as_str(),
        });
        while let Some(Frontier { cost, id }) = frontier.pop() {
            if settled.contains_key(id) {
                continue;
            }
            settled.insert(id, cost);
            for (next, edge) in self.neighbors(id) {
                if !settled.contains_key(next.as_str()) {
                    frontier.push(Frontier {
                        cost: cost + edge.length,
                        id: next.as_str(),
                    });
                }
            }
        }
        settled
    }
    /// Re-check that every adjacency entry references indexed nodes
    pub fn validate(&self) -> bool {
        self.adjacency.iter().all(|(id, list)| {
            self.index.contains_key(id)
                && list
                    .iter()
                    .all(|(neighbor, edge)| self.index.contains_key(neighbor) && edge.to == *neighbor)
        })
    }
}

/// Dijkstra frontier entry, ordered so the cheapest pops first from a max-heap
#[derive(PartialEq)]
struct Frontier<'a> {
    cost: f64,
    id: &'a str,
}
impl Eq for Frontier<'_> {}
impl Ord for Frontier<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.id.cmp(self.id))
    }
}
impl PartialOrd for Frontier<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
