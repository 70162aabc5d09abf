//! rfgraph-core: property propagation and action delivery for RF
//! processing graphs.
//!
//! This crate implements the host-side control core of a directed graph
//! of signal-processing nodes connected by typed edges:
//!
//! - **Properties** are typed, named, origin-tagged parameters (sample
//!   rate, gain, decimation, ...) with dirty/clean tracking. Nodes
//!   register *resolvers* with declared read/write sets; the engine
//!   re-runs them after any user-driven change until the whole graph is
//!   consistent, forwarding edge properties between neighbours and
//!   creating dynamic counterparts for properties a node has never seen.
//! - **Actions** are small messages (stream commands, overrun events,
//!   ...) routed hop-by-hop between neighbouring nodes, optionally
//!   rewritten by each node as they pass through.
//!
//! # Architecture
//!
//! - [`source`]: resource-source descriptors tagging where a property or
//!   action comes from
//! - [`value`] / [`property`]: the tagged value set and the property
//!   cell with access modes
//! - [`node`]: property registry, resolvers, action handlers, and
//!   forwarding policies
//! - [`edge`] / [`graph`]: the container, the commit/release gate, and
//!   the two engines
//! - [`action`]: action objects and payloads
//! - [`error`]: the error taxonomy
//!
//! # Example
//!
//! ```rust,ignore
//! use rfgraph_core::{Edge, Graph, Node, SourceInfo};
//!
//! let mut graph = Graph::new();
//! let radio = graph.add_node(build_radio())?;
//! let ddc = graph.add_node(build_ddc())?;
//! graph.connect(radio, ddc, Edge::dynamic(0, 0))?;
//! graph.commit()?;
//!
//! // Propagates through the whole chain:
//! graph.set_property(radio, "master_clock_rate", 200e6, 0)?;
//! ```

pub mod action;
pub mod edge;
pub mod error;
pub mod graph;
pub mod node;
pub mod property;
pub mod source;
pub mod value;

pub use action::{
    Action, ActionPayload, RxErrorCode, RxEventInfo, StreamCmd, StreamMode, RX_EVENT_ACTION_KEY,
    STREAM_CMD_ACTION_KEY,
};
pub use edge::{Edge, EdgeKind};
pub use error::CoreError;
pub use graph::{ActionOutbox, Graph, NodeId};
pub use node::{ForwardingPolicy, Node, PropContext, PropKey};
pub use property::{Access, Property};
pub use source::{SourceInfo, SourceKind};
pub use value::{ExtValue, ExtensionValue, PropPayload, PropType, PropValue};
