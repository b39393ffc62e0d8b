//! Internal invariant violations
//!
//! These should not be reachable in correct operation. When one is raised
//! it is fatal and reported distinctly from a backend execution failure.

use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalError {
    #[error("Node {0} was compiled twice")]
    AlreadyCompiled(NodeId),

    #[error("CTEs were injected into node {0} twice")]
    AlreadyInjected(NodeId),

    #[error("Node {0} has not been compiled")]
    NotCompiled(NodeId),

    #[error("Node {0} reached execution without injected SQL")]
    NotInjected(NodeId),

    #[error("Node {0} is not present in the manifest")]
    UnknownNode(NodeId),
}
