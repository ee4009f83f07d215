//! Error types for the skeleton store and the mutation protocol.

use crate::geometry::Coordinate;
use crate::nml::NmlError;
use crate::skeleton::{NodeId, TreeId};
use thiserror::Error;

/// Errors from graph store operations. None of these leave partial state behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkeletonError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Tree not found: {0}")]
    TreeNotFound(TreeId),
    #[error("No segment between nodes {0} and {1}")]
    SegmentNotFound(NodeId, NodeId),
    #[error("Node {0} cannot be linked to itself")]
    SelfLoop(NodeId),
    #[error("Nodes {0} and {1} are already linked")]
    DuplicateSegment(NodeId, NodeId),
    #[error("Node id {0} is already in use")]
    NodeIdInUse(NodeId),
    #[error("Position {0} cannot be stored")]
    UnrepresentablePosition(Coordinate),
    #[error("'{0}' cannot be used as a node property key")]
    InvalidPropertyKey(String),
    #[error("Node {0} has no comment")]
    NoComment(NodeId),
    #[error("Node {0} is already a branch point")]
    AlreadyBranchPoint(NodeId),
    #[error("Branch point stack is empty")]
    EmptyBranchStack,
    #[error("Cannot merge tree {0} into itself")]
    SameTree(TreeId),
    #[error("Identifier space exhausted")]
    IdSpaceExhausted,
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("Nothing to redo")]
    NothingToRedo,
}

/// Result type for graph store operations.
pub type SkeletonResult<T> = Result<T, SkeletonError>;

/// Errors from the guarded mutation entry points.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The lock could not be taken in time or the store is shutting down.
    #[error("Skeleton is unavailable")]
    Unavailable,
    /// A remote replay did not target the next local revision.
    #[error("Synchronization broken: expected revision {expected}, received {received}")]
    SyncBroken { expected: u64, received: u64 },
    #[error(transparent)]
    Skeleton(#[from] SkeletonError),
    #[error(transparent)]
    Document(#[from] NmlError),
}

impl ProtocolError {
    /// Whether this error means the peer link can no longer be trusted.
    pub fn is_sync_broken(&self) -> bool {
        matches!(self, ProtocolError::SyncBroken { .. })
    }
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
