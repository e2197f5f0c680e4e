//! Federation error types.

use thiserror::Error;
use weft_transport::{ErrorCode, TransportError};

use crate::node_id::NodeId;

/// Errors surfaced by the federation layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FederationError {
    /// A site node needs at least one seed to bootstrap from.
    #[error("seed node list is empty")]
    NoSeedNodes,

    /// No partner satisfied the routing constraints for this node id.
    #[error("no partner found for node {0}")]
    PartnerNotFound(NodeId),

    /// A routed reply carried a non-success error code.
    #[error("reply carried error code {0:?}")]
    Fault(ErrorCode),

    /// An underlying transport operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
