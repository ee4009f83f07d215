//! Skeletrace Core Library
//!
//! Skeleton graph store for neuron tracing: trees of 3D nodes joined by
//! segments, a revision-gated mutation protocol for two-peer sessions, the
//! structural graph operations and NML reading and writing.

pub mod collaboration;
pub mod config;
pub mod error;
pub mod geometry;
pub mod history;
pub mod mutation;
pub mod nml;
pub mod protocol;
pub mod skeleton;
pub mod storage;
pub mod sync;
pub mod voxel;

pub use collaboration::PeerSession;
pub use config::{CommentRadiusRule, SkeletonConfig};
pub use error::{ProtocolError, ProtocolResult, SkeletonError, SkeletonResult};
pub use geometry::{Coordinate, FloatCoordinate};
pub use mutation::{Effect, Mutation, UndoKind};
pub use nml::{LoadMode, LoadSummary, NmlError};
pub use protocol::{RevisionedMutation, SharedSkeleton, Snapshot};
pub use skeleton::{
    Component, NewNode, Node, NodeId, Segment, Skeleton, SkeletonEvent, Tree, TreeColor, TreeId,
};
pub use sync::{ClientMessage, ConnectionState, ServerMessage, SyncEvent};
#[cfg(not(target_arch = "wasm32"))]
pub use sync::PeerSocket;
pub use voxel::{SparseLabels, VoxelSource};
