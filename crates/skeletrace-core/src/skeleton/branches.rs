//! The branch point stack.

use super::{NodeId, Skeleton, SkeletonEvent};
use crate::error::{SkeletonError, SkeletonResult};

impl Skeleton {
    /// Push a node onto the branch stack and flag it as a branch node.
    pub fn push_branch(&mut self, node: NodeId) -> SkeletonResult<()> {
        self.push_branch_node(node)?;
        self.commit();
        Ok(())
    }

    pub(crate) fn push_branch_node(&mut self, node: NodeId) -> SkeletonResult<()> {
        let entry = self
            .nodes
            .get_mut(&node)
            .ok_or(SkeletonError::NodeNotFound(node))?;
        if entry.is_branch_node {
            return Err(SkeletonError::AlreadyBranchPoint(node));
        }
        entry.is_branch_node = true;
        self.branch_stack.push(node);
        self.emit(SkeletonEvent::NodeChanged(node));
        self.emit(SkeletonEvent::BranchStackChanged);
        Ok(())
    }

    /// Pop the most recent branch point that still exists and make it active.
    ///
    /// Entries whose node was deleted in the meantime are skipped.
    pub fn pop_branch(&mut self) -> SkeletonResult<NodeId> {
        let node = self.pop_branch_node()?;
        self.commit();
        Ok(node)
    }

    pub(crate) fn pop_branch_node(&mut self) -> SkeletonResult<NodeId> {
        let index = self
            .branch_stack
            .iter()
            .rposition(|id| self.nodes.contains_key(id))
            .ok_or(SkeletonError::EmptyBranchStack)?;

        let skipped = self.branch_stack.len() - index - 1;
        if skipped > 0 {
            log::warn!("Skipped {} stale branch point(s)", skipped);
        }
        let node = self.branch_stack[index];
        self.branch_stack.truncate(index);
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.is_branch_node = false;
        }
        self.emit(SkeletonEvent::NodeChanged(node));
        self.emit(SkeletonEvent::BranchStackChanged);
        self.activate_node(node);
        Ok(node)
    }

    /// Branch points, bottom of the stack first. May include deleted nodes.
    pub fn branch_stack(&self) -> &[NodeId] {
        &self.branch_stack
    }

    /// Branch points whose node still exists, in push order.
    pub fn live_branch_points(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.branch_stack
            .iter()
            .copied()
            .filter(|id| self.nodes.contains_key(id))
    }
}
