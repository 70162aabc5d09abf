//! Core error types.
//!
//! Uses `thiserror` for structured, matchable variants. Registration and
//! connection errors are returned synchronously to the caller. Errors
//! raised inside a property resolver abort that resolver, access modes
//! are restored by the scoped grants, and the failure surfaces from the
//! top-level resolution as [`CoreError::Resolve`]. Errors in action
//! handlers abort the current handler only; the delivery loop continues
//! with the next queued action.

use thiserror::Error;

use crate::graph::NodeId;
use crate::property::Access;
use crate::source::SourceInfo;
use crate::value::PropType;

/// Errors produced by the rfgraph core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A property lookup by (source, id) found nothing.
    #[error("no property `{id}` with source {src} on node `{node}`")]
    Lookup {
        node: String,
        src: SourceInfo,
        id: String,
    },

    /// A node handle did not resolve to a live node.
    #[error("node not found: {id}")]
    NodeNotFound { id: NodeId },

    /// The property registered under this id has a different value type.
    #[error("type mismatch on property `{id}`: registered {registered}, requested {requested}")]
    TypeMismatch {
        id: String,
        registered: PropType,
        requested: PropType,
    },

    /// A read or write outside the granted access rights.
    #[error("access violation: cannot {op} property `{id}` under {access:?} access")]
    AccessViolation {
        id: String,
        access: Access,
        op: &'static str,
    },

    /// Registering a property whose (source, id) pair is already taken.
    #[error("property `{id}` with source {src} is already registered on node `{node}`")]
    KeyCollision {
        node: String,
        src: SourceInfo,
        id: String,
    },

    /// The connection would introduce a cycle in propagating edges.
    #[error("connecting `{src}` -> `{dst}` would create a cycle in propagating edges")]
    GraphCycle { src: String, dst: String },

    /// An attempt to route over a statically incompatible port: edge
    /// modification, port reconnection, or a failed topology check.
    #[error("routing error: {reason}")]
    Routing { reason: String },

    /// Property propagation did not converge, or back-edge endpoints
    /// disagree after convergence.
    #[error("resolve error: {reason}")]
    Resolve { reason: String },

    /// Action delivery exceeded the iteration cap.
    #[error("action delivery terminated: exceeded the limit of {limit} iterations")]
    RecursionLimit { limit: usize },

    /// An action was posted on a port that is neither an input nor an
    /// output edge.
    #[error("invalid port for action: {src} (expected an input or output edge)")]
    InvalidPort { src: SourceInfo },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_carry_context() {
        let err = CoreError::Lookup {
            node: "radio0".into(),
            src: SourceInfo::user(),
            id: "gain".into(),
        };
        assert_eq!(
            err.to_string(),
            "no property `gain` with source USER:0 on node `radio0`"
        );

        let err = CoreError::TypeMismatch {
            id: "decim".into(),
            registered: PropType::Int,
            requested: PropType::Double,
        };
        assert_eq!(
            err.to_string(),
            "type mismatch on property `decim`: registered int, requested double"
        );

        let err = CoreError::RecursionLimit { limit: 200 };
        assert!(err.to_string().contains("200"));
    }
}
