//! Error types for graph construction and particle inference.

use thiserror::Error;

use crate::engine::graph::NodeId;

/// Errors raised while building a graph or running a forward/backward pass.
///
/// The variants follow three families:
/// - `Logic`: a contract violation by the caller or an internal inconsistency
///   (wrong state, schedule built out of order, missing monitor node).
/// - `Numerical`: a quantity of the weight arithmetic degenerated (zero sums,
///   NaN ESS or normalizing constant, non-positive posterior precision).
/// - `Node`: any of the above raised while a specific node was being sampled
///   or evaluated, wrapped with that node's id.
///
/// Marked `#[non_exhaustive]` so new variants can be added without a breaking change.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SmcError {
    /// Method called in the wrong state or an internal invariant was broken.
    #[error("logic error: {0}")]
    Logic(String),

    /// Invalid configuration or graph description.
    #[error("validation error: {0}")]
    Validation(String),

    /// A numerical quantity degenerated.
    #[error("numerical error: {quantity} ({context})")]
    Numerical {
        quantity: &'static str,
        context: String,
    },

    /// Failure scoped to a single node.
    #[error("node {node}: {source}")]
    Node {
        node: NodeId,
        #[source]
        source: Box<SmcError>,
    },
}

impl SmcError {
    pub fn numerical(quantity: &'static str, context: impl Into<String>) -> Self {
        SmcError::Numerical {
            quantity,
            context: context.into(),
        }
    }

    /// Wraps `err` with `node`, keeping the innermost node if already scoped.
    pub fn at_node(node: NodeId, err: SmcError) -> Self {
        match err {
            scoped @ SmcError::Node { .. } => scoped,
            other => SmcError::Node {
                node,
                source: Box::new(other),
            },
        }
    }

    /// Returns the node this error is scoped to, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            SmcError::Node { node, .. } => Some(*node),
            _ => None,
        }
    }

    /// True for numerical errors, including node-scoped ones.
    pub fn is_numerical(&self) -> bool {
        match self {
            SmcError::Numerical { .. } => true,
            SmcError::Node { source, .. } => source.is_numerical(),
            _ => false,
        }
    }

    /// True for logic errors, including node-scoped ones.
    pub fn is_logic(&self) -> bool {
        match self {
            SmcError::Logic(_) => true,
            SmcError::Node { source, .. } => source.is_logic(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_scope_keeps_innermost_node() {
        let inner = SmcError::at_node(NodeId(3), SmcError::numerical("ESS", "NaN"));
        let outer = SmcError::at_node(NodeId(7), inner);
        assert_eq!(outer.node(), Some(NodeId(3)));
        assert!(outer.is_numerical());
        assert!(!outer.is_logic());
    }

    #[test]
    fn numerical_error_names_quantity() {
        let err = SmcError::numerical("sum of weights", "iteration 4");
        assert_eq!(
            err.to_string(),
            "numerical error: sum of weights (iteration 4)"
        );
    }
}
