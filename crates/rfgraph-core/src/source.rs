//! Resource-source descriptors.
//!
//! Every property and every action in the graph is tagged with where it
//! comes from: the user-facing API, one of the node's input or output
//! edges (identified by port index), or the framework itself. The
//! (kind, instance) pair is used as a compound key throughout the
//! property registry and the edge bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of resource source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Set or queried through the user-facing property API.
    User,
    /// Tied to an input edge (upstream-facing port).
    InputEdge,
    /// Tied to an output edge (downstream-facing port).
    OutputEdge,
    /// Owned by the framework itself (e.g. the always-dirty sentinel).
    Framework,
}

impl SourceKind {
    /// Returns `true` for the two edge kinds.
    pub fn is_edge(self) -> bool {
        matches!(self, SourceKind::InputEdge | SourceKind::OutputEdge)
    }

    /// Swaps `InputEdge` and `OutputEdge`; other kinds are returned
    /// unchanged.
    pub fn invert_edge(self) -> SourceKind {
        match self {
            SourceKind::InputEdge => SourceKind::OutputEdge,
            SourceKind::OutputEdge => SourceKind::InputEdge,
            other => other,
        }
    }
}

/// Identifies the origin of a property or action: a source kind plus an
/// instance number (the port index for edge kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceInfo {
    pub kind: SourceKind,
    pub instance: usize,
}

impl SourceInfo {
    pub const fn new(kind: SourceKind, instance: usize) -> Self {
        SourceInfo { kind, instance }
    }

    /// User source, instance 0.
    pub const fn user() -> Self {
        SourceInfo::new(SourceKind::User, 0)
    }

    /// User source with an explicit instance number.
    pub const fn user_at(instance: usize) -> Self {
        SourceInfo::new(SourceKind::User, instance)
    }

    /// Framework source, instance 0.
    pub const fn framework() -> Self {
        SourceInfo::new(SourceKind::Framework, 0)
    }

    /// Input edge at the given port.
    pub const fn input_edge(instance: usize) -> Self {
        SourceInfo::new(SourceKind::InputEdge, instance)
    }

    /// Output edge at the given port.
    pub const fn output_edge(instance: usize) -> Self {
        SourceInfo::new(SourceKind::OutputEdge, instance)
    }

    /// Returns `true` for input- and output-edge sources.
    pub fn is_edge(self) -> bool {
        self.kind.is_edge()
    }

    /// Returns the descriptor with input and output swapped, preserving
    /// the instance.
    pub fn inverted(self) -> Self {
        SourceInfo::new(self.kind.invert_edge(), self.instance)
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SourceKind::User => "USER",
            SourceKind::InputEdge => "INPUT_EDGE",
            SourceKind::OutputEdge => "OUTPUT_EDGE",
            SourceKind::Framework => "FRAMEWORK",
        };
        write!(f, "{}:{}", kind, self.instance)
    }
}
