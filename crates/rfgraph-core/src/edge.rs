//! Graph edges.
//!
//! An edge is an ordered port-to-port connection between two nodes. The
//! `property_propagation_active` flag decides whether the framework uses
//! the edge for property propagation; an edge with the flag cleared is a
//! back-edge. Actions traverse back-edges, properties do not, and
//! back-edges do not count toward cycle detection. Instead, the engine
//! checks after convergence that the two endpoints of a back-edge agree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of connection an edge represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// A fixed connection between two processing blocks.
    Static,
    /// A user-created connection between two processing blocks.
    Dynamic,
    /// A connection from a block to a software RX streamer.
    RxStream,
    /// A connection from a software TX streamer to a block.
    TxStream,
}

/// A directed port-to-port connection.
///
/// The block ids are filled in by [`Graph::connect`](crate::graph::Graph::connect)
/// from the node unique ids; callers only supply the ports, the kind,
/// and the propagation flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Unique id of the source node.
    pub src_blockid: String,
    /// Port number on the source node.
    pub src_port: usize,
    /// Unique id of the destination node.
    pub dst_blockid: String,
    /// Port number on the destination node.
    pub dst_port: usize,
    pub kind: EdgeKind,
    /// When true, the framework uses this edge for property propagation.
    pub property_propagation_active: bool,
}

impl Edge {
    pub fn new(
        src_port: usize,
        dst_port: usize,
        kind: EdgeKind,
        property_propagation_active: bool,
    ) -> Self {
        Edge {
            src_blockid: String::new(),
            src_port,
            dst_blockid: String::new(),
            dst_port,
            kind,
            property_propagation_active,
        }
    }

    /// A dynamic, propagating edge.
    pub fn dynamic(src_port: usize, dst_port: usize) -> Self {
        Edge::new(src_port, dst_port, EdgeKind::Dynamic, true)
    }

    /// A dynamic back-edge: actions traverse it, properties do not.
    pub fn back_edge(src_port: usize, dst_port: usize) -> Self {
        Edge::new(src_port, dst_port, EdgeKind::Dynamic, false)
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_blockid, self.src_port, self.dst_blockid, self.dst_port
        )
    }
}
