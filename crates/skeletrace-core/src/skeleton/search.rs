//! Nearest-node search and ID-ordered navigation.

use super::{NodeId, Skeleton, TreeId};
use crate::geometry::Coordinate;
use std::ops::Bound;

impl Skeleton {
    /// Node closest to `position`.
    ///
    /// Searches `preferred` first when it names a non-empty tree, and falls
    /// back to every node otherwise. Ties go to the lower ID.
    pub fn find_nearby_node(&self, preferred: Option<TreeId>, position: Coordinate) -> Option<NodeId> {
        let candidates: Box<dyn Iterator<Item = NodeId> + '_> =
            match preferred.and_then(|id| self.trees.get(&id)) {
                Some(tree) if !tree.nodes.is_empty() => Box::new(tree.nodes.iter().copied()),
                _ => Box::new(self.nodes.keys().copied()),
            };
        candidates
            .filter_map(|id| self.nodes.get(&id))
            .min_by_key(|node| (node.position.distance_squared(position), node.id))
            .map(|node| node.id)
    }

    /// Node with the closest lower ID, wrapping to the highest ID.
    ///
    /// With `same_tree`, only nodes sharing the reference node's tree count.
    pub fn node_with_prev_id(&self, reference: NodeId, same_tree: bool) -> Option<NodeId> {
        let tree = self.tree_filter(reference, same_tree)?;
        let matches = |id: &&NodeId| *id != &reference && tree.is_none_or(|t| self.nodes[*id].tree == t);
        self.nodes
            .range(..reference)
            .rev()
            .map(|(id, _)| id)
            .find(matches)
            .or_else(|| self.nodes.keys().rev().find(matches))
            .copied()
    }

    /// Node with the closest higher ID, wrapping to the lowest ID.
    pub fn node_with_next_id(&self, reference: NodeId, same_tree: bool) -> Option<NodeId> {
        let tree = self.tree_filter(reference, same_tree)?;
        let matches = |id: &&NodeId| *id != &reference && tree.is_none_or(|t| self.nodes[*id].tree == t);
        self.nodes
            .range((Bound::Excluded(reference), Bound::Unbounded))
            .map(|(id, _)| id)
            .find(matches)
            .or_else(|| self.nodes.keys().find(matches))
            .copied()
    }

    /// Tree with the closest lower ID, wrapping to the highest ID.
    pub fn tree_with_prev_id(&self, reference: TreeId) -> Option<TreeId> {
        self.trees
            .range(..reference)
            .next_back()
            .map(|(id, _)| *id)
            .or_else(|| self.trees.keys().next_back().copied())
            .filter(|id| *id != reference)
    }

    /// Tree with the closest higher ID, wrapping to the lowest ID.
    pub fn tree_with_next_id(&self, reference: TreeId) -> Option<TreeId> {
        self.trees
            .range((Bound::Excluded(reference), Bound::Unbounded))
            .next()
            .map(|(id, _)| *id)
            .or_else(|| self.trees.keys().next().copied())
            .filter(|id| *id != reference)
    }

    /// `Some(None)` for no restriction, `Some(Some(tree))` to restrict,
    /// `None` if restriction was requested for an unknown node.
    fn tree_filter(&self, reference: NodeId, same_tree: bool) -> Option<Option<TreeId>> {
        if !same_tree {
            return Some(None);
        }
        self.nodes.get(&reference).map(|node| Some(node.tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::NewNode;

    #[test]
    fn test_nearby_prefers_tree() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let t2 = skeleton.add_tree(0, None).unwrap();
        let t3 = skeleton.add_tree(0, None).unwrap();
        let far = skeleton.add_node(NewNode::new(t1, Coordinate::new(50, 0, 0))).unwrap();
        let near = skeleton.add_node(NewNode::new(t2, Coordinate::new(1, 0, 0))).unwrap();

        let origin = Coordinate::new(0, 0, 0);
        assert_eq!(skeleton.find_nearby_node(Some(t1), origin), Some(far));
        assert_eq!(skeleton.find_nearby_node(None, origin), Some(near));
        // Empty and unknown trees fall back to the full scan.
        assert_eq!(skeleton.find_nearby_node(Some(t3), origin), Some(near));
        assert_eq!(skeleton.find_nearby_node(Some(99), origin), Some(near));
    }

    #[test]
    fn test_nearby_on_empty_store() {
        let skeleton = Skeleton::default();
        assert_eq!(skeleton.find_nearby_node(None, Coordinate::default()), None);
    }

    #[test]
    fn test_prev_next_node_ids_wrap() {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let t2 = skeleton.add_tree(0, None).unwrap();
        for (id, tree) in [(2, t1), (5, t2), (9, t1)] {
            skeleton
                .add_node(NewNode::new(tree, Coordinate::default()).with_id(id))
                .unwrap();
        }
        assert_eq!(skeleton.node_with_next_id(2, false), Some(5));
        assert_eq!(skeleton.node_with_next_id(2, true), Some(9));
        assert_eq!(skeleton.node_with_next_id(9, false), Some(2));
        assert_eq!(skeleton.node_with_prev_id(5, false), Some(2));
        assert_eq!(skeleton.node_with_prev_id(2, false), Some(9));
        assert_eq!(skeleton.node_with_prev_id(5, true), None);
        // A reference that is not a node still orders by value.
        assert_eq!(skeleton.node_with_next_id(6, false), Some(9));
    }

    #[test]
    fn test_prev_next_tree_ids_wrap() {
        let mut skeleton = Skeleton::default();
        for id in [3, 4, 8] {
            skeleton.add_tree(id, None).unwrap();
        }
        assert_eq!(skeleton.tree_with_next_id(3), Some(4));
        assert_eq!(skeleton.tree_with_next_id(8), Some(3));
        assert_eq!(skeleton.tree_with_prev_id(3), Some(8));
        assert_eq!(skeleton.tree_with_prev_id(8), Some(4));

        let mut single = Skeleton::default();
        single.add_tree(1, None).unwrap();
        assert_eq!(single.tree_with_next_id(1), None);
    }
}
