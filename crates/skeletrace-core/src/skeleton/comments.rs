//! Node comments and comment navigation.

use super::{NodeId, Skeleton, SkeletonEvent};
use crate::error::{SkeletonError, SkeletonResult};
use std::collections::{BTreeMap, BTreeSet};

/// Secondary indices over node comments.
///
/// The comment text itself lives on the node; this keeps creation order for
/// cyclic traversal and a text → nodes multi-map for lookups.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommentIndex {
    order: Vec<NodeId>,
    by_text: BTreeMap<String, BTreeSet<NodeId>>,
    current: Option<NodeId>,
}

impl CommentIndex {
    pub(crate) fn insert(&mut self, node: NodeId, text: &str) {
        if !self.order.contains(&node) {
            self.order.push(node);
        }
        self.by_text.entry(text.to_string()).or_default().insert(node);
    }

    pub(crate) fn remove(&mut self, node: NodeId, text: &str) {
        if let Some(nodes) = self.by_text.get_mut(text) {
            nodes.remove(&node);
            if nodes.is_empty() {
                self.by_text.remove(text);
            }
        }
        if let Some(pos) = self.order.iter().position(|&n| n == node) {
            self.order.remove(pos);
            if self.current == Some(node) {
                self.current = self.order.get(pos).or(self.order.first()).copied();
            }
        }
    }

    pub(crate) fn contains(&self, node: NodeId) -> bool {
        self.order.contains(&node)
    }

    /// Commented nodes in the order their comments were created.
    pub(crate) fn order(&self) -> &[NodeId] {
        &self.order
    }
}

impl Skeleton {
    /// Attach a comment to a node, replacing any existing one.
    ///
    /// An empty string deletes the comment. When comment radius rules are
    /// enabled, a matching comment also sets the node's radius.
    pub fn set_comment(&mut self, node: NodeId, text: &str) -> SkeletonResult<()> {
        self.write_comment(node, text)?;
        self.commit();
        Ok(())
    }

    pub(crate) fn write_comment(&mut self, node: NodeId, text: &str) -> SkeletonResult<()> {
        if text.is_empty() {
            return self.erase_comment(node);
        }
        let radius = self.config().radius_for_comment(text);
        let entry = self
            .nodes
            .get_mut(&node)
            .ok_or(SkeletonError::NodeNotFound(node))?;
        let previous = entry.comment.replace(text.to_string());
        if let Some(radius) = radius {
            entry.radius = radius;
        }
        if let Some(previous) = previous {
            self.comments.remove_text(node, &previous);
        }
        self.comments.insert(node, text);
        self.comments.current = Some(node);
        if radius.is_some() {
            self.update_circ_radius(node);
        }
        self.emit(SkeletonEvent::NodeChanged(node));
        Ok(())
    }

    /// Remove a node's comment.
    pub fn delete_comment(&mut self, node: NodeId) -> SkeletonResult<()> {
        self.erase_comment(node)?;
        self.commit();
        Ok(())
    }

    pub(crate) fn erase_comment(&mut self, node: NodeId) -> SkeletonResult<()> {
        let entry = self
            .nodes
            .get_mut(&node)
            .ok_or(SkeletonError::NodeNotFound(node))?;
        let text = entry.comment.take().ok_or(SkeletonError::NoComment(node))?;
        self.comments.remove(node, &text);
        self.emit(SkeletonEvent::NodeChanged(node));
        Ok(())
    }

    /// Nodes whose comment is exactly `text`.
    pub fn nodes_with_comment(&self, text: &str) -> Vec<NodeId> {
        self.comments
            .by_text
            .get(text)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Commented nodes whose comment contains `needle`, in creation order.
    pub fn comments_containing(&self, needle: &str) -> Vec<NodeId> {
        self.comments
            .order
            .iter()
            .copied()
            .filter(|id| self.comment_matches(*id, needle))
            .collect()
    }

    pub fn comment_count(&self) -> usize {
        self.comments.order.len()
    }

    /// Node the comment cursor currently points at.
    pub fn current_comment(&self) -> Option<NodeId> {
        self.comments.current
    }

    /// Advance the comment cursor to the next comment containing `needle`
    /// (any comment if empty), wrapping around.
    pub fn next_comment(&mut self, needle: &str) -> Option<NodeId> {
        self.step_comment(needle, true)
    }

    /// Move the comment cursor backwards; see [`Skeleton::next_comment`].
    pub fn previous_comment(&mut self, needle: &str) -> Option<NodeId> {
        self.step_comment(needle, false)
    }

    fn step_comment(&mut self, needle: &str, forward: bool) -> Option<NodeId> {
        let order = &self.comments.order;
        let len = order.len();
        if len == 0 {
            return None;
        }
        let start = self
            .comments
            .current
            .and_then(|c| order.iter().position(|&n| n == c));

        let found = (1..=len)
            .map(|step| match (start, forward) {
                (Some(s), true) => (s + step) % len,
                (Some(s), false) => (s + len - step % len) % len,
                (None, true) => step - 1,
                (None, false) => len - step,
            })
            .map(|idx| order[idx])
            .find(|&id| self.comment_matches(id, needle))?;

        self.comments.current = Some(found);
        Some(found)
    }

    fn comment_matches(&self, node: NodeId, needle: &str) -> bool {
        self.nodes
            .get(&node)
            .and_then(|n| n.comment.as_deref())
            .is_some_and(|text| text.contains(needle))
    }
}

impl CommentIndex {
    /// Drop `node` from the text index only, keeping its place in the order.
    fn remove_text(&mut self, node: NodeId, text: &str) {
        if let Some(nodes) = self.by_text.get_mut(text) {
            nodes.remove(&node);
            if nodes.is_empty() {
                self.by_text.remove(text);
            }
        }
    }
}
