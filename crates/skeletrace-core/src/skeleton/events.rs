//! Change notifications for collaborators (renderer, UI panels).

use super::model::{NodeId, TreeId};

/// Something changed in the store.
///
/// Events are queued by every mutation and drained with
/// [`Skeleton::take_events`](super::Skeleton::take_events).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkeletonEvent {
    NodeAdded(NodeId),
    NodeRemoved(NodeId),
    /// Position, radius, comment, tree membership or properties changed.
    NodeChanged(NodeId),
    TreeAdded(TreeId),
    TreeRemoved(TreeId),
    /// Comment, color, render flag or membership changed.
    TreeChanged(TreeId),
    SegmentAdded { source: NodeId, target: NodeId },
    SegmentRemoved { source: NodeId, target: NodeId },
    /// Active node or active tree changed.
    SelectionChanged { node: Option<NodeId>, tree: Option<TreeId> },
    BranchStackChanged,
    /// Everything was replaced; drop all cached state.
    Reset,
}
