//! Connected components and moving nodes between trees.

use super::{NodeId, Skeleton, SkeletonEvent, TreeId};
use crate::error::{SkeletonError, SkeletonResult};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Nodes reachable from a start node, and the trees they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Visited nodes in breadth-first order, starting node first.
    pub nodes: Vec<NodeId>,
    pub trees: BTreeSet<TreeId>,
}

impl Skeleton {
    /// Breadth-first walk over segments in both directions.
    pub fn connected_component(&self, start: NodeId) -> SkeletonResult<Component> {
        if !self.nodes.contains_key(&start) {
            return Err(SkeletonError::NodeNotFound(start));
        }
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut nodes = Vec::new();
        let mut trees = BTreeSet::new();

        while let Some(id) = queue.pop_front() {
            let node = &self.nodes[&id];
            trees.insert(node.tree);
            nodes.push(id);
            for key in &node.segments {
                let next = self.segment(key).other_end(id);
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(Component { nodes, trees })
    }

    /// Move the component containing `start` into a new tree.
    ///
    /// Returns `None` without changing anything when the component already is
    /// exactly one whole tree.
    pub fn extract_component(&mut self, start: NodeId) -> SkeletonResult<Option<TreeId>> {
        let tree = self.split_component(start, 0)?;
        if tree.is_some() {
            self.commit();
        }
        Ok(tree)
    }

    /// Whether extracting from `start` would leave the store unchanged.
    pub(crate) fn component_is_whole_tree(&self, start: NodeId) -> SkeletonResult<bool> {
        let component = self.connected_component(start)?;
        Ok(self.is_whole_tree(&component))
    }

    fn is_whole_tree(&self, component: &Component) -> bool {
        let mut trees = component.trees.iter();
        match (trees.next(), trees.next()) {
            (Some(only), None) => self
                .trees
                .get(only)
                .is_some_and(|tree| tree.nodes.len() == component.nodes.len()),
            _ => false,
        }
    }

    pub(crate) fn split_component(
        &mut self,
        start: NodeId,
        requested_tree: TreeId,
    ) -> SkeletonResult<Option<TreeId>> {
        let component = self.connected_component(start)?;
        if self.is_whole_tree(&component) {
            log::debug!("Component of node {} already is a whole tree", start);
            return Ok(None);
        }
        let tree = self.insert_tree(requested_tree, None)?;
        let sources = self.migrate_nodes(&component.nodes, tree);
        self.settle_after_migration(sources);
        log::debug!(
            "Extracted {} node(s) from {} tree(s) into tree {}",
            component.nodes.len(),
            component.trees.len(),
            tree
        );
        Ok(Some(tree))
    }

    /// Move every node of `absorb` into `keep` and delete `absorb`.
    pub fn merge_trees(&mut self, keep: TreeId, absorb: TreeId) -> SkeletonResult<()> {
        self.join_trees(keep, absorb)?;
        self.commit();
        Ok(())
    }

    pub(crate) fn join_trees(&mut self, keep: TreeId, absorb: TreeId) -> SkeletonResult<()> {
        if keep == absorb {
            return Err(SkeletonError::SameTree(keep));
        }
        if !self.trees.contains_key(&keep) {
            return Err(SkeletonError::TreeNotFound(keep));
        }
        let moving = self
            .trees
            .get(&absorb)
            .ok_or(SkeletonError::TreeNotFound(absorb))?
            .nodes
            .clone();
        self.migrate_nodes(&moving, keep);
        self.follow_active_node();
        self.remove_tree(absorb)?;
        log::debug!("Merged tree {} into tree {}", absorb, keep);
        Ok(())
    }

    /// Move a set of nodes into an existing tree.
    pub fn move_nodes_to_tree(&mut self, nodes: &[NodeId], tree: TreeId) -> SkeletonResult<()> {
        self.relocate_nodes(nodes, tree)?;
        self.commit();
        Ok(())
    }

    pub(crate) fn relocate_nodes(&mut self, nodes: &[NodeId], tree: TreeId) -> SkeletonResult<()> {
        if !self.trees.contains_key(&tree) {
            return Err(SkeletonError::TreeNotFound(tree));
        }
        if let Some(&missing) = nodes.iter().find(|id| !self.nodes.contains_key(id)) {
            return Err(SkeletonError::NodeNotFound(missing));
        }
        let sources = self.migrate_nodes(nodes, tree);
        self.settle_after_migration(sources);
        Ok(())
    }

    /// Reassign nodes to `tree`, keeping their relative order. Returns the
    /// trees they came from.
    fn migrate_nodes(&mut self, ids: &[NodeId], tree: TreeId) -> BTreeSet<TreeId> {
        let mut sources = BTreeSet::new();
        let mut moved = Vec::new();
        for &id in ids {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.tree != tree {
                sources.insert(node.tree);
                node.tree = tree;
                moved.push(id);
            }
        }
        if moved.is_empty() {
            return sources;
        }

        let moving: HashSet<NodeId> = moved.iter().copied().collect();
        for source in &sources {
            if let Some(t) = self.trees.get_mut(source) {
                t.nodes.retain(|n| !moving.contains(n));
            }
        }
        if let Some(t) = self.trees.get_mut(&tree) {
            t.nodes.extend(moved.iter().copied());
        }

        for id in moved {
            self.emit(SkeletonEvent::NodeChanged(id));
        }
        for source in &sources {
            self.emit(SkeletonEvent::TreeChanged(*source));
        }
        self.emit(SkeletonEvent::TreeChanged(tree));
        sources
    }

    fn settle_after_migration(&mut self, sources: BTreeSet<TreeId>) {
        self.follow_active_node();
        if !self.config().remove_empty_trees {
            return;
        }
        for source in sources {
            let emptied = self.trees.get(&source).is_some_and(|t| t.nodes.is_empty());
            if emptied && self.remove_tree(source).is_ok() {
                log::debug!("Removed tree {} emptied by migration", source);
            }
        }
    }

    /// Re-derive the active tree from the active node after it changed trees.
    fn follow_active_node(&mut self) {
        let stale = self
            .active_node()
            .filter(|node| Some(node.tree) != self.active_tree)
            .map(|node| node.id);
        if let Some(id) = stale {
            self.activate_node(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SkeletonConfig;
    use crate::geometry::Coordinate;
    use crate::skeleton::NewNode;

    fn node(skeleton: &mut Skeleton, tree: TreeId, x: i32) -> NodeId {
        skeleton
            .add_node(NewNode::new(tree, Coordinate::new(x, 0, 0)))
            .unwrap()
    }

    #[test]
    fn test_extract_joins_linked_trees() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let t2 = skeleton.add_tree(0, None).unwrap();
        let n1 = node(&mut skeleton, t1, 0);
        let n2 = node(&mut skeleton, t2, 10);
        skeleton.add_segment(n1, n2).unwrap();

        let new_tree = skeleton.extract_component(n1).unwrap().unwrap();
        assert_eq!(skeleton.find_tree_by_id(new_tree).unwrap().nodes(), &[n1, n2]);
        assert!(skeleton.find_tree_by_id(t1).is_none());
        assert!(skeleton.find_tree_by_id(t2).is_none());
        assert!(skeleton.find_segment_between(n1, n2).is_some());
        assert_eq!(skeleton.active_tree_id(), Some(new_tree));
        skeleton.assert_consistent();
    }

    #[test]
    fn test_extract_whole_tree_is_noop() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let a = node(&mut skeleton, t1, 0);
        let b = node(&mut skeleton, t1, 1);
        skeleton.add_segment(a, b).unwrap();
        let revision = skeleton.revision();

        assert_eq!(skeleton.extract_component(b).unwrap(), None);
        assert_eq!(skeleton.revision(), revision);
        assert_eq!(skeleton.tree_count(), 1);
    }

    #[test]
    fn test_extract_splits_partial_tree() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let a = node(&mut skeleton, t1, 0);
        let b = node(&mut skeleton, t1, 1);
        let c = node(&mut skeleton, t1, 5);
        skeleton.add_segment(b, c).unwrap();

        let new_tree = skeleton.extract_component(c).unwrap().unwrap();
        assert_eq!(skeleton.find_tree_by_id(t1).unwrap().nodes(), &[a]);
        assert_eq!(skeleton.find_tree_by_id(new_tree).unwrap().nodes(), &[c, b]);
        // The active node stayed behind, so the active tree did too.
        assert_eq!(skeleton.active_node_id(), Some(a));
        assert_eq!(skeleton.active_tree_id(), Some(t1));
        skeleton.assert_consistent();
    }

    #[test]
    fn test_extract_keeps_empty_trees_when_configured() {
        let config = SkeletonConfig { remove_empty_trees: false, ..SkeletonConfig::default() };
        let mut skeleton = Skeleton::new(config);
        let t1 = skeleton.add_tree(0, None).unwrap();
        let t2 = skeleton.add_tree(0, None).unwrap();
        let a = node(&mut skeleton, t1, 0);
        let b = node(&mut skeleton, t2, 1);
        skeleton.add_segment(a, b).unwrap();

        skeleton.extract_component(a).unwrap().unwrap();
        assert!(skeleton.find_tree_by_id(t1).unwrap().is_empty());
        assert!(skeleton.find_tree_by_id(t2).unwrap().is_empty());
    }

    #[test]
    fn test_merge_trees() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let t2 = skeleton.add_tree(0, None).unwrap();
        let a = node(&mut skeleton, t1, 0);
        let b = node(&mut skeleton, t2, 1);
        skeleton.set_active_node(b).unwrap();

        assert_eq!(skeleton.merge_trees(t1, t1).unwrap_err(), SkeletonError::SameTree(t1));
        skeleton.merge_trees(t1, t2).unwrap();
        assert_eq!(skeleton.find_tree_by_id(t1).unwrap().nodes(), &[a, b]);
        assert!(skeleton.find_tree_by_id(t2).is_none());
        assert_eq!(skeleton.active_tree_id(), Some(t1));
        assert_eq!(skeleton.active_node_id(), Some(b));
        skeleton.assert_consistent();
    }

    #[test]
    fn test_move_nodes_validates_before_moving() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let t2 = skeleton.add_tree(0, None).unwrap();
        let a = node(&mut skeleton, t1, 0);
        let b = node(&mut skeleton, t1, 1);

        assert_eq!(
            skeleton.move_nodes_to_tree(&[a, 77], t2).unwrap_err(),
            SkeletonError::NodeNotFound(77)
        );
        assert_eq!(skeleton.find_node_by_id(a).unwrap().tree, t1);

        skeleton.move_nodes_to_tree(&[b], t2).unwrap();
        assert_eq!(skeleton.find_tree_by_id(t2).unwrap().nodes(), &[b]);
        skeleton.move_nodes_to_tree(&[a], t2).unwrap();
        assert!(skeleton.find_tree_by_id(t1).is_none());
        assert_eq!(skeleton.active_tree_id(), Some(t2));
        skeleton.assert_consistent();
    }

    #[test]
    fn test_component_walks_both_directions() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let a = node(&mut skeleton, t1, 0);
        let b = node(&mut skeleton, t1, 1);
        let c = node(&mut skeleton, t1, 2);
        skeleton.add_segment(a, b).unwrap();
        skeleton.add_segment(c, b).unwrap();

        let component = skeleton.connected_component(c).unwrap();
        assert_eq!(component.nodes, vec![c, b, a]);
        assert!(skeleton.component_is_whole_tree(a).unwrap());
    }
}
