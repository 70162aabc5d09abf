//! The graph container and its two engines.
//!
//! [`Graph`] owns the nodes (as weights of a petgraph `StableGraph`, so
//! handles stay valid across mutations) and the directed edges between
//! their ports. On top of the container sit the two interlocked engines:
//!
//! - **Property propagation** ([`Graph::resolve_all_properties`]): after
//!   any user-driven change, walks the topologically sorted node list,
//!   runs each node's local resolvers, forwards edge properties into
//!   neighbours (creating dynamic counterparts on first sight), and
//!   verifies that every property settled and that back-edge endpoints
//!   agree.
//! - **Action delivery** ([`Graph::post_action`]): drains a FIFO queue of
//!   (node, port, action) tuples hop-by-hop through neighbour lookups.
//!   A handler may synchronously post more actions; a test-and-set flag
//!   makes those append to the ongoing drain instead of starting a new
//!   one.
//!
//! The commit/release gate suppresses both engines during bulk
//! connection changes: propagation no-ops and actions are discarded
//! while the graph is released.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::{EdgeFiltered, EdgeRef, IntoEdgeReferences};
use petgraph::{Directed, Direction};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::action::Action;
use crate::edge::Edge;
use crate::error::CoreError;
use crate::node::{Node, PropSnapshot};
use crate::source::{SourceInfo, SourceKind};

/// Hard cap on queued action deliveries per drain.
const MAX_ACTION_ITERATIONS: usize = 200;

// If all edge properties were known at the beginning, a single pass
// would suffice. The first pass usually makes nodes create dynamic edge
// properties, which default to dirty; a second pass resolves those. The
// cap is fixed: changing it changes observable behaviour for dynamic
// edge properties.
const MAX_PROPAGATION_PASSES: usize = 2;

/// Stable node handle. Maps to a petgraph `NodeIndex<u32>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<NodeIndex<u32>> for NodeId {
    fn from(idx: NodeIndex<u32>) -> Self {
        NodeId(idx.index() as u32)
    }
}

impl From<NodeId> for NodeIndex<u32> {
    fn from(id: NodeId) -> Self {
        NodeIndex::new(id.0 as usize)
    }
}

type QueuedAction = (NodeId, SourceInfo, Action);

/// The action queue plus the flag marking an ongoing drain.
struct ActionQueue {
    queue: Mutex<VecDeque<QueuedAction>>,
    draining: AtomicBool,
}

impl ActionQueue {
    fn new() -> Self {
        ActionQueue {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    fn push(&self, item: QueuedAction) {
        self.queue.lock().push_back(item);
    }

    fn pop(&self) -> Option<QueuedAction> {
        self.queue.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Handed to action handlers for posting follow-up actions.
///
/// Posts go onto the same queue the ongoing drain is working through,
/// preserving FIFO order relative to the initial enqueue.
pub struct ActionOutbox<'a> {
    queue: &'a ActionQueue,
    src: NodeId,
}

impl ActionOutbox<'_> {
    /// Posts an action from the current node onto the given edge port.
    pub fn post(&mut self, port: SourceInfo, action: Action) -> Result<(), CoreError> {
        if !port.is_edge() {
            return Err(CoreError::InvalidPort { src: port });
        }
        trace!(action = action.key(), id = action.id(), %port, "deferring posted action");
        self.queue.push((self.src, port, action));
        Ok(())
    }
}

/// A directed graph of processing nodes with property propagation and
/// action delivery.
pub struct Graph {
    graph: StableGraph<Node, Edge, Directed, u32>,
    /// Commit/release gate. Starts released; propagation is enabled once
    /// release/commit pairs balance out to zero.
    release_count: u32,
    actions: ActionQueue,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Creates an empty graph. The graph starts released: nothing
    /// propagates until [`commit`](Self::commit) brings the release
    /// count to zero.
    pub fn new() -> Self {
        Graph {
            graph: StableGraph::default(),
            release_count: 1,
            actions: ActionQueue::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Moves a node into the graph, initializing its properties, and
    /// returns its handle.
    pub fn add_node(&mut self, mut node: Node) -> Result<NodeId, CoreError> {
        node.init_props()?;
        let idx = self.graph.add_node(node);
        trace!(node = self.graph[idx].unique_id(), "added node to graph");
        Ok(NodeId::from(idx))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id.into())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.graph.node_weight_mut(id.into())
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Connects two node ports.
    ///
    /// The block ids of `edge` are filled in from the node unique ids.
    /// A repeated identical connect is silently accepted. Changing the
    /// attributes of an existing edge, or connecting a port that is
    /// already connected elsewhere, is a routing error. An edge whose
    /// propagating subgraph would no longer sort topologically is
    /// removed again and reported as a graph cycle.
    pub fn connect(&mut self, src: NodeId, dst: NodeId, mut edge: Edge) -> Result<(), CoreError> {
        let src_idx = self.index_of(src)?;
        let dst_idx = self.index_of(dst)?;
        edge.src_blockid = self.graph[src_idx].unique_id().to_string();
        edge.dst_blockid = self.graph[dst_idx].unique_id().to_string();
        trace!("connecting {}", edge);

        for existing in self.graph.edges_directed(src_idx, Direction::Outgoing) {
            if check_edge_conflict(&edge, existing.weight())? {
                return Ok(());
            }
        }
        for existing in self.graph.edges_directed(dst_idx, Direction::Incoming) {
            if check_edge_conflict(&edge, existing.weight())? {
                return Ok(());
            }
        }

        let edge_idx = self.graph.add_edge(src_idx, dst_idx, edge);
        if self.topo_sorted_nodes().is_err() {
            let edge = self
                .graph
                .remove_edge(edge_idx)
                .expect("edge was just added");
            error!(
                "adding edge {} without disabling property propagation leads to an unresolvable graph",
                edge
            );
            return Err(CoreError::GraphCycle {
                src: edge.src_blockid,
                dst: edge.dst_blockid,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commit/release gate
    // -----------------------------------------------------------------------

    /// Decrements the release count. On reaching zero, every node's
    /// topology is checked and one full propagation pass runs.
    pub fn commit(&mut self) -> Result<(), CoreError> {
        if self.release_count > 0 {
            self.release_count -= 1;
            if self.release_count == 0 {
                self.check_topology()?;
            }
        }
        trace!("commit => release count {}", self.release_count);
        self.resolve_all_properties()
    }

    /// Increments the release count, suppressing propagation and action
    /// delivery until commits balance it out.
    pub fn release(&mut self) {
        self.release_count += 1;
        trace!("release => release count {}", self.release_count);
    }

    pub fn is_committed(&self) -> bool {
        self.release_count == 0
    }

    fn check_topology(&self) -> Result<(), CoreError> {
        let mut failures = Vec::new();
        for idx in self.graph.node_indices() {
            let mut connected_inputs: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Incoming)
                .map(|e| e.weight().dst_port)
                .collect();
            let mut connected_outputs: Vec<usize> = self
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| e.weight().src_port)
                .collect();
            connected_inputs.sort_unstable();
            connected_outputs.sort_unstable();
            let node = &self.graph[idx];
            if !node.check_topology(&connected_inputs, &connected_outputs) {
                error!(
                    "node {} cannot handle its current topology ({} inputs, {} outputs)",
                    node.unique_id(),
                    connected_inputs.len(),
                    connected_outputs.len()
                );
                failures.push(node.unique_id().to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Routing {
                reason: format!("graph topology is not valid: {}", failures.join(", ")),
            })
        }
    }

    // -----------------------------------------------------------------------
    // User property API
    // -----------------------------------------------------------------------

    /// Writes a user property on a node and triggers a graph-wide
    /// resolution.
    pub fn set_property<T: crate::value::PropPayload>(
        &mut self,
        node: NodeId,
        id: &str,
        value: T,
        instance: usize,
    ) -> Result<(), CoreError> {
        let idx = self.index_of(node)?;
        self.graph[idx].write_user_property(id, value, instance)?;
        self.resolve_all_properties()
    }

    /// Reads a user property on a node, triggering a graph-wide
    /// resolution first. Not a pure accessor.
    pub fn get_property<T: crate::value::PropPayload>(
        &mut self,
        node: NodeId,
        id: &str,
        instance: usize,
    ) -> Result<T, CoreError> {
        let idx = self.index_of(node)?;
        self.resolve_all_properties()?;
        self.graph[idx].read_user_property(id, instance)
    }

    // -----------------------------------------------------------------------
    // Property propagation engine
    // -----------------------------------------------------------------------

    /// Runs property propagation over the whole graph.
    ///
    /// A no-op while the graph is released or empty. Walks the
    /// topologically sorted node list forward and backward from the
    /// start node, resolving, forwarding and cleaning at each step,
    /// for exactly two full passes; then verifies quiescence and
    /// back-edge consistency.
    pub fn resolve_all_properties(&mut self) -> Result<(), CoreError> {
        if self.graph.node_count() == 0 {
            return Ok(());
        }
        if self.release_count > 0 {
            return Ok(());
        }

        let initial_dirty_nodes = self.find_dirty_nodes();
        if initial_dirty_nodes.len() > 1 {
            warn!(
                "found {} dirty nodes in initial search (expected one or zero); \
                 property propagation may resolve this",
                initial_dirty_nodes.len()
            );
            for idx in &initial_dirty_nodes {
                warn!("dirty: {}", self.graph[*idx].unique_id());
            }
        }
        let start = match initial_dirty_nodes.first() {
            Some(idx) => *idx,
            None => {
                debug!("no dirty properties found; starting on arbitrary node");
                self.graph
                    .node_indices()
                    .next()
                    .expect("graph is not empty")
            }
        };

        let order = self.topo_sorted_nodes().map_err(|_| CoreError::Resolve {
            reason: "cannot resolve graph: it has at least one cycle in propagating edges".into(),
        })?;
        let mut pos = order
            .iter()
            .position(|&idx| idx == start)
            .expect("start node is part of the sorted node list");
        let mut forward = true;
        let mut passes = 0;

        loop {
            let idx = order[pos];
            trace!("resolving node {}", self.graph[idx].unique_id());

            // Local resolution may dirty more properties on this node.
            self.graph[idx].resolve_props()?;
            // Push edge properties into the neighbours, skipping edges
            // with property propagation disabled.
            self.forward_edge_props(idx)?;
            // Everything on this node settles for this step.
            self.graph[idx].clean_props();

            // Move the cursor: bounce off both ends of the sorted list.
            if forward {
                pos += 1;
                if pos == order.len() {
                    forward = false;
                    pos -= 1;
                }
            }
            if !forward {
                if order.len() > 1 {
                    pos -= 1;
                    if pos == 0 {
                        forward = true;
                    }
                } else {
                    forward = true;
                }
            }
            // Passing the start node moving forward closes one full pass.
            if forward && order[pos] == start {
                passes += 1;
                if passes == MAX_PROPAGATION_PASSES {
                    trace!("terminating graph resolution after pass {}", passes);
                    break;
                }
            }
        }

        // No non-framework property may still be dirty; anything left
        // over means the resolvers could not converge.
        let remaining = self.find_dirty_nodes();
        if !remaining.is_empty() {
            let mut offenders = Vec::new();
            for idx in remaining {
                let node = &self.graph[idx];
                for (src, id) in node.dirty_property_ids() {
                    error!("dirty: {}[{} {}]", node.unique_id(), src, id);
                    offenders.push(format!("{}[{} {}]", node.unique_id(), src, id));
                }
            }
            return Err(CoreError::Resolve {
                reason: format!("could not resolve properties: {}", offenders.join(", ")),
            });
        }

        // Back-edges don't propagate, so their endpoints must agree on
        // their own.
        let mut consistent = true;
        for edge_ref in self.graph.edge_references() {
            let edge = edge_ref.weight();
            if edge.property_propagation_active {
                continue;
            }
            let src_node = &self.graph[edge_ref.source()];
            let dst_node = &self.graph[edge_ref.target()];
            for prop in src_node.props() {
                if prop.src() != SourceInfo::output_edge(edge.src_port) {
                    continue;
                }
                let counterpart = dst_node
                    .find_property(SourceInfo::input_edge(edge.dst_port), prop.id())
                    .map(|key| &dst_node.props()[key.0]);
                if let Some(counterpart) = counterpart {
                    if !prop.equal(counterpart) {
                        error!(
                            "edge property {} inconsistent on back-edge {}",
                            prop.id(),
                            edge
                        );
                        consistent = false;
                    }
                }
            }
        }
        if !consistent {
            return Err(CoreError::Resolve {
                reason: "back-edge properties inconsistent after resolution".into(),
            });
        }
        Ok(())
    }

    /// Nodes with at least one dirty non-framework property, in node
    /// iteration order.
    fn find_dirty_nodes(&self) -> Vec<NodeIndex<u32>> {
        self.graph
            .node_indices()
            .filter(|idx| self.graph[*idx].has_dirty_props())
            .collect()
    }

    /// Topologically sorts the propagating subgraph (back-edges
    /// removed).
    fn topo_sorted_nodes(&self) -> Result<Vec<NodeIndex<u32>>, CoreError> {
        let filtered =
            EdgeFiltered::from_fn(&self.graph, |e| e.weight().property_propagation_active);
        toposort(&filtered, None).map_err(|_| CoreError::Resolve {
            reason: "not a DAG".into(),
        })
    }

    /// Forwards all edge properties of `origin` into its neighbours.
    fn forward_edge_props(&mut self, origin: NodeIndex<u32>) -> Result<(), CoreError> {
        let snapshots: Vec<PropSnapshot> = self.graph[origin]
            .props()
            .iter()
            .filter(|p| p.src().is_edge())
            .map(|p| PropSnapshot {
                id: p.id().to_string(),
                src: p.src(),
                value: p.value().clone(),
            })
            .collect();
        trace!(
            "forwarding up to {} edge properties from node {}",
            snapshots.len(),
            self.graph[origin].unique_id()
        );
        for snapshot in snapshots {
            let Some((neighbour_idx, edge)) = self.find_neighbour(origin, snapshot.src)? else {
                continue;
            };
            if !edge.property_propagation_active {
                continue;
            }
            let neighbour_port = if snapshot.src.kind == SourceKind::InputEdge {
                edge.src_port
            } else {
                edge.dst_port
            };
            self.graph[neighbour_idx].forward_edge_property(&snapshot, neighbour_port)?;
        }
        Ok(())
    }

    /// Finds the node attached to `origin` across the edge matching
    /// `port`, together with the edge record.
    fn find_neighbour(
        &self,
        origin: NodeIndex<u32>,
        port: SourceInfo,
    ) -> Result<Option<(NodeIndex<u32>, Edge)>, CoreError> {
        match port.kind {
            SourceKind::InputEdge => {
                for e in self.graph.edges_directed(origin, Direction::Incoming) {
                    if e.weight().dst_port == port.instance {
                        return Ok(Some((e.source(), e.weight().clone())));
                    }
                }
                Ok(None)
            }
            SourceKind::OutputEdge => {
                for e in self.graph.edges_directed(origin, Direction::Outgoing) {
                    if e.weight().src_port == port.instance {
                        return Ok(Some((e.target(), e.weight().clone())));
                    }
                }
                Ok(None)
            }
            _ => Err(CoreError::InvalidPort { src: port }),
        }
    }

    // -----------------------------------------------------------------------
    // Action delivery engine
    // -----------------------------------------------------------------------

    /// Posts an action from a node onto one of its edge ports and drains
    /// the queue.
    ///
    /// Actions posted while the graph is released are discarded with a
    /// warning: they are meaningful only on a live graph. If a drain is
    /// already ongoing (an action handler posting synchronously), the
    /// action is appended to the ongoing drain instead.
    pub fn post_action(
        &mut self,
        src: NodeId,
        port: SourceInfo,
        action: Action,
    ) -> Result<(), CoreError> {
        if self.release_count > 0 {
            warn!(
                "graph is not committed; will not propagate action `{}`",
                action.key()
            );
            return Ok(());
        }
        if !port.is_edge() {
            return Err(CoreError::InvalidPort { src: port });
        }
        self.index_of(src)?;

        let handling_ongoing = self.actions.draining.swap(true, Ordering::SeqCst);
        self.actions.push((src, port, action));
        if handling_ongoing {
            trace!("action handling ongoing, deferring delivery");
            return Ok(());
        }

        let result = self.drain_actions();
        self.actions.draining.store(false, Ordering::SeqCst);
        result
    }

    /// Delivers an action directly to a node, as if it had arrived on
    /// `port`, then drains any actions the node posted in response.
    pub fn deliver_action(
        &mut self,
        node: NodeId,
        port: SourceInfo,
        action: Action,
    ) -> Result<(), CoreError> {
        let idx = self.index_of(node)?;
        let handling_ongoing = self.actions.draining.swap(true, Ordering::SeqCst);
        let delivered = {
            let Graph { graph, actions, .. } = &*self;
            let mut outbox = ActionOutbox {
                queue: actions,
                src: node,
            };
            graph[idx].receive_action(port, &action, &mut outbox)
        };
        if handling_ongoing {
            return delivered;
        }
        let drained = self.drain_actions();
        self.actions.draining.store(false, Ordering::SeqCst);
        delivered.and(drained)
    }

    fn drain_actions(&mut self) -> Result<(), CoreError> {
        let mut iterations = 0usize;
        while !self.actions.is_empty() {
            iterations += 1;
            if iterations > MAX_ACTION_ITERATIONS {
                return Err(CoreError::RecursionLimit {
                    limit: MAX_ACTION_ITERATIONS,
                });
            }
            let (src, src_port, action) = self.actions.pop().expect("queue is not empty");
            let src_idx = self.index_of(src)?;
            let Some((recipient_idx, edge)) = self.find_neighbour(src_idx, src_port)? else {
                warn!(
                    "cannot forward action `{}` from {}:{}, no neighbour found",
                    action.key(),
                    self.graph[src_idx].unique_id(),
                    src_port
                );
                continue;
            };
            let recipient_port = SourceInfo::new(
                src_port.kind.invert_edge(),
                if src_port.kind == SourceKind::InputEdge {
                    edge.dst_port
                } else {
                    edge.src_port
                },
            );
            trace!(
                "delivering action {}#{} to {}:{}",
                action.key(),
                action.id(),
                self.graph[recipient_idx].unique_id(),
                recipient_port
            );
            let Graph { graph, actions, .. } = &*self;
            let mut outbox = ActionOutbox {
                queue: actions,
                src: NodeId::from(recipient_idx),
            };
            // A failed handler aborts only itself; the drain continues.
            if let Err(e) = graph[recipient_idx].receive_action(recipient_port, &action, &mut outbox)
            {
                warn!(
                    "action handler on {} failed: {}",
                    graph[recipient_idx].unique_id(),
                    e
                );
            }
        }
        trace!("delivered all actions, terminating action handling");
        Ok(())
    }

    fn index_of(&self, id: NodeId) -> Result<NodeIndex<u32>, CoreError> {
        let idx: NodeIndex<u32> = id.into();
        if self.graph.node_weight(idx).is_some() {
            Ok(idx)
        } else {
            Err(CoreError::NodeNotFound { id })
        }
    }
}

/// Validates a new edge against one existing edge at the same node.
///
/// Returns `Ok(true)` for an identical duplicate (silently accepted by
/// the caller), `Ok(false)` when the edges are unrelated, and a routing
/// error for a modification or a port reconnection.
fn check_edge_conflict(new: &Edge, existing: &Edge) -> Result<bool, CoreError> {
    if existing == new {
        info!("ignoring repeated call to connect {}", new);
        return Ok(true);
    }
    if existing.src_blockid == new.src_blockid
        && existing.src_port == new.src_port
        && existing.dst_blockid == new.dst_blockid
        && existing.dst_port == new.dst_port
    {
        error!("caught attempt to modify properties of edge {}", existing);
        return Err(CoreError::Routing {
            reason: format!("attempt to modify properties of edge {}", existing),
        });
    }
    if existing.src_blockid == new.src_blockid && existing.src_port == new.src_port {
        error!(
            "attempting to reconnect output port {}:{}",
            existing.src_blockid, existing.src_port
        );
        return Err(CoreError::Routing {
            reason: format!(
                "attempt to reconnect output port {}:{}",
                existing.src_blockid, existing.src_port
            ),
        });
    }
    if existing.dst_blockid == new.dst_blockid && existing.dst_port == new.dst_port {
        error!(
            "attempting to reconnect input port {}:{}",
            existing.dst_blockid, existing.dst_port
        );
        return Err(CoreError::Routing {
            reason: format!(
                "attempt to reconnect input port {}:{}",
                existing.dst_blockid, existing.dst_port
            ),
        });
    }
    Ok(false)
}
