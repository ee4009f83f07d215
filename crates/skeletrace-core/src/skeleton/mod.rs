//! The skeleton graph store.
//!
//! A [`Skeleton`] owns every tree, node, segment, comment and branch point of
//! an annotation session. Nodes and trees live in ID-keyed maps and reference
//! each other by ID only; a segment is a single record shared by both
//! endpoints, so the forward and backward halves can never drift apart.
//!
//! Every successful mutation bumps [`Skeleton::revision`] by exactly one and
//! marks the store as having unsaved changes. Failed mutations leave the store
//! untouched.

mod branches;
mod comments;
mod components;
mod events;
mod model;
mod search;

pub use components::Component;
pub use events::SkeletonEvent;
pub use model::{NewNode, Node, NodeId, Segment, SegmentRef, Tree, TreeColor, TreeId};

pub(crate) use comments::CommentIndex;
pub(crate) use model::EdgeKey;

use crate::config::SkeletonConfig;
use crate::error::{SkeletonError, SkeletonResult};
use crate::geometry::Coordinate;
use crate::nml::{DocumentParameters, is_property_key};
use crate::voxel::{VoxelLookup, VoxelSource};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// In-memory annotation state.
#[derive(Debug, Clone)]
pub struct Skeleton {
    /// Unique session identifier.
    pub id: String,
    pub(crate) trees: BTreeMap<TreeId, Tree>,
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    pub(crate) segments: HashMap<EdgeKey, Segment>,
    greatest_node_id: NodeId,
    greatest_tree_id: TreeId,
    active_node: Option<NodeId>,
    active_tree: Option<TreeId>,
    pub(crate) comments: CommentIndex,
    /// Branch points, bottom first.
    pub(crate) branch_stack: Vec<NodeId>,
    revision: u64,
    unsaved_changes: bool,
    /// Opaque document parameters carried through load and save.
    pub(crate) parameters: DocumentParameters,
    /// Annotation time accumulated before `session_start`.
    time_offset_ms: u64,
    session_start: Instant,
    config: SkeletonConfig,
    voxels: VoxelLookup,
    events: Vec<SkeletonEvent>,
}

impl Default for Skeleton {
    fn default() -> Self {
        Self::new(SkeletonConfig::default())
    }
}

impl Skeleton {
    /// Create an empty store.
    pub fn new(config: SkeletonConfig) -> Self {
        let parameters = DocumentParameters {
            experiment: config.experiment.clone(),
            ..DocumentParameters::default()
        };
        Self {
            id: Uuid::new_v4().to_string(),
            trees: BTreeMap::new(),
            nodes: BTreeMap::new(),
            segments: HashMap::new(),
            greatest_node_id: 0,
            greatest_tree_id: 0,
            active_node: None,
            active_tree: None,
            comments: CommentIndex::default(),
            branch_stack: Vec::new(),
            revision: 0,
            unsaved_changes: false,
            parameters,
            time_offset_ms: 0,
            session_start: Instant::now(),
            config,
            voxels: VoxelLookup::default(),
            events: Vec::new(),
        }
    }

    // --- Bookkeeping ---

    /// Current revision. Starts at 0 and grows by one per mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Overwrite the revision, e.g. after adopting a peer's snapshot.
    pub(crate) fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    /// Record one successful mutation.
    pub(crate) fn commit(&mut self) {
        self.revision += 1;
        self.unsaved_changes = true;
    }

    /// Whether anything changed since the last save.
    pub fn has_unsaved_changes(&self) -> bool {
        self.unsaved_changes
    }

    /// Clear the unsaved-changes flag after a successful save.
    pub fn mark_saved(&mut self) {
        self.unsaved_changes = false;
    }

    pub fn config(&self) -> &SkeletonConfig {
        &self.config
    }

    pub fn parameters(&self) -> &DocumentParameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut DocumentParameters {
        &mut self.parameters
    }

    /// Attach or detach the dataset's label lookup.
    pub fn set_voxel_source(&mut self, source: Option<Arc<dyn VoxelSource>>) {
        self.voxels.set(source);
    }

    /// Milliseconds of annotation time, including time loaded from a document.
    pub fn annotation_time_ms(&self) -> u64 {
        self.time_offset_ms + self.session_start.elapsed().as_millis() as u64
    }

    pub(crate) fn set_annotation_time_ms(&mut self, ms: u64) {
        self.time_offset_ms = ms;
        self.session_start = Instant::now();
    }

    /// Drain queued change notifications.
    pub fn take_events(&mut self) -> Vec<SkeletonEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn emit(&mut self, event: SkeletonEvent) {
        self.events.push(event);
    }

    // --- Queries ---

    pub fn find_node_by_id(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn find_tree_by_id(&self, id: TreeId) -> Option<&Tree> {
        self.trees.get(&id)
    }

    /// The segment linking `a` and `b`, in whichever direction it was created.
    pub fn find_segment_between(&self, a: NodeId, b: NodeId) -> Option<&Segment> {
        self.segments.get(&EdgeKey::new(a, b))
    }

    /// Trees in ascending ID order.
    pub fn trees(&self) -> impl Iterator<Item = &Tree> {
        self.trees.values()
    }

    /// Nodes in ascending ID order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Nodes of one tree in insertion order.
    pub fn tree_nodes(&self, tree: TreeId) -> impl Iterator<Item = &Node> {
        self.trees
            .get(&tree)
            .into_iter()
            .flat_map(|t| t.nodes.iter())
            .filter_map(|id| self.nodes.get(id))
    }

    /// All segments, each once.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Segments incident to `node`, flagged forward or backward from its side.
    pub fn node_segments(&self, node: NodeId) -> Vec<SegmentRef<'_>> {
        let Some(n) = self.nodes.get(&node) else {
            return Vec::new();
        };
        n.segments
            .iter()
            .map(|key| {
                let segment = self.segment(key);
                SegmentRef { segment, forward: segment.source == node }
            })
            .collect()
    }

    /// IDs of the nodes linked to `node`.
    pub fn neighbours(&self, node: NodeId) -> Vec<NodeId> {
        self.node_segments(node)
            .iter()
            .map(|r| r.segment.other_end(node))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty() && self.nodes.is_empty()
    }

    pub fn greatest_node_id(&self) -> NodeId {
        self.greatest_node_id
    }

    pub fn greatest_tree_id(&self) -> TreeId {
        self.greatest_tree_id
    }

    pub fn active_node(&self) -> Option<&Node> {
        self.active_node.and_then(|id| self.nodes.get(&id))
    }

    pub fn active_node_id(&self) -> Option<NodeId> {
        self.active_node
    }

    pub fn active_tree(&self) -> Option<&Tree> {
        self.active_tree.and_then(|id| self.trees.get(&id))
    }

    pub fn active_tree_id(&self) -> Option<TreeId> {
        self.active_tree
    }

    /// Look up a segment record that an index says must exist.
    fn segment(&self, key: &EdgeKey) -> &Segment {
        match self.segments.get(key) {
            Some(segment) => segment,
            None => panic!("segment index out of sync for {key:?}"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> SkeletonResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(SkeletonError::NodeNotFound(id))
    }

    fn tree_mut(&mut self, id: TreeId) -> SkeletonResult<&mut Tree> {
        self.trees.get_mut(&id).ok_or(SkeletonError::TreeNotFound(id))
    }

    pub(crate) fn next_node_id(&self) -> SkeletonResult<NodeId> {
        self.greatest_node_id
            .checked_add(1)
            .ok_or(SkeletonError::IdSpaceExhausted)
    }

    pub(crate) fn next_tree_id(&self) -> SkeletonResult<TreeId> {
        self.greatest_tree_id
            .checked_add(1)
            .ok_or(SkeletonError::IdSpaceExhausted)
    }

    /// Tree ID an `add_tree(id)` call would end up with.
    pub(crate) fn resolve_tree_id(&self, requested: TreeId) -> SkeletonResult<TreeId> {
        if requested != 0 && !self.trees.contains_key(&requested) {
            Ok(requested)
        } else {
            self.next_tree_id()
        }
    }

    // --- Trees ---

    /// Add a tree. ID 0 or an ID already in use gets the next free ID.
    pub fn add_tree(&mut self, id: TreeId, color: Option<TreeColor>) -> SkeletonResult<TreeId> {
        let id = self.insert_tree(id, color)?;
        self.commit();
        Ok(id)
    }

    pub(crate) fn insert_tree(
        &mut self,
        requested: TreeId,
        color: Option<TreeColor>,
    ) -> SkeletonResult<TreeId> {
        let id = self.resolve_tree_id(requested)?;
        if requested != 0 && requested != id {
            log::debug!("Tree id {} in use, reassigned to {}", requested, id);
        }
        self.trees.insert(id, Tree::new(id, color));
        self.greatest_tree_id = self.greatest_tree_id.max(id);
        self.emit(SkeletonEvent::TreeAdded(id));
        if self.active_tree.is_none() {
            self.activate_tree(id);
        }
        Ok(id)
    }

    /// Delete a tree and every node it owns.
    pub fn delete_tree(&mut self, id: TreeId) -> SkeletonResult<()> {
        self.remove_tree(id)?;
        self.commit();
        Ok(())
    }

    pub(crate) fn remove_tree(&mut self, id: TreeId) -> SkeletonResult<()> {
        let tree = self.trees.get(&id).ok_or(SkeletonError::TreeNotFound(id))?;
        let owned = tree.nodes.clone();
        let last_position = self.active_node().map(|n| n.position);
        let lost_active_node = self.active_node.is_some_and(|n| owned.contains(&n));

        for node in owned {
            self.remove_node(node, false);
        }
        self.trees.remove(&id);
        self.emit(SkeletonEvent::TreeRemoved(id));
        log::debug!("Deleted tree {}", id);

        if self.active_tree == Some(id) || lost_active_node {
            match self.tree_with_next_id(id) {
                Some(next) => self.activate_tree_near(next, last_position),
                None => {
                    self.active_tree = None;
                    self.active_node = None;
                    self.emit_selection();
                }
            }
        }
        Ok(())
    }

    pub fn set_tree_comment(&mut self, id: TreeId, comment: &str) -> SkeletonResult<()> {
        self.tree_mut(id)?.comment = comment.to_string();
        self.emit(SkeletonEvent::TreeChanged(id));
        self.commit();
        Ok(())
    }

    /// Set an explicit color, or `None` to return to the palette color.
    pub fn set_tree_color(&mut self, id: TreeId, color: Option<TreeColor>) -> SkeletonResult<()> {
        let tree = self.tree_mut(id)?;
        tree.color = color.unwrap_or_else(|| TreeColor::for_tree(id));
        tree.custom_color = color.is_some();
        self.emit(SkeletonEvent::TreeChanged(id));
        self.commit();
        Ok(())
    }

    pub fn set_tree_render(&mut self, id: TreeId, render: bool) -> SkeletonResult<()> {
        self.tree_mut(id)?.render = render;
        self.emit(SkeletonEvent::TreeChanged(id));
        self.commit();
        Ok(())
    }

    // --- Nodes ---

    /// Add a node to an existing tree.
    ///
    /// ID 0 assigns `greatest_node_id + 1`; an explicit ID that is taken is
    /// rejected.
    pub fn add_node(&mut self, new: NewNode) -> SkeletonResult<NodeId> {
        let id = self.insert_node(new)?;
        self.commit();
        Ok(id)
    }

    pub(crate) fn insert_node(&mut self, new: NewNode) -> SkeletonResult<NodeId> {
        if !self.trees.contains_key(&new.tree) {
            return Err(SkeletonError::TreeNotFound(new.tree));
        }
        let id = match new.id {
            0 => self.next_node_id()?,
            id if self.nodes.contains_key(&id) => return Err(SkeletonError::NodeIdInUse(id)),
            id => id,
        };
        check_position(new.position)?;
        if let Some(key) = new.properties.keys().find(|key| !is_property_key(key)) {
            return Err(SkeletonError::InvalidPropertyKey(key.clone()));
        }
        let radius = new.radius.unwrap_or(self.config.default_radius);
        let node = Node {
            id,
            tree: new.tree,
            position: new.position,
            radius,
            timestamp: new.timestamp.unwrap_or_else(|| self.annotation_time_ms()),
            viewport: new.viewport,
            magnification: new.magnification,
            properties: new.properties,
            circ_radius: radius,
            comment: None,
            is_branch_node: false,
            subobject_id: self.voxels.lookup(new.position),
            selected: false,
            segments: Vec::new(),
        };
        self.nodes.insert(id, node);
        self.tree_mut(new.tree)?.nodes.push(id);
        self.greatest_node_id = self.greatest_node_id.max(id);
        self.emit(SkeletonEvent::NodeAdded(id));
        self.emit(SkeletonEvent::TreeChanged(new.tree));
        log::debug!("Added node {} to tree {} at {}", id, new.tree, new.position);

        if self.active_node.is_none() {
            self.activate_node(id);
        }
        Ok(id)
    }

    /// Delete a node together with its segments and comment.
    ///
    /// If it was the active node, the nearest remaining node becomes active.
    pub fn delete_node(&mut self, id: NodeId) -> SkeletonResult<()> {
        if !self.nodes.contains_key(&id) {
            return Err(SkeletonError::NodeNotFound(id));
        }
        self.remove_node(id, true);
        self.commit();
        Ok(())
    }

    /// Remove an existing node. Panics if it does not exist.
    pub(crate) fn remove_node(&mut self, id: NodeId, reactivate: bool) {
        let keys = self.nodes[&id].segments.clone();
        for key in keys {
            self.unlink(key);
        }

        let Some(node) = self.nodes.remove(&id) else {
            panic!("remove_node called for missing node {id}");
        };
        if let Some(text) = &node.comment {
            self.comments.remove(id, text);
        }
        if let Some(tree) = self.trees.get_mut(&node.tree) {
            tree.nodes.retain(|&n| n != id);
        }
        self.emit(SkeletonEvent::NodeRemoved(id));
        self.emit(SkeletonEvent::TreeChanged(node.tree));

        if self.active_node == Some(id) {
            self.active_node = None;
            if reactivate {
                match self.find_nearby_node(Some(node.tree), node.position) {
                    Some(next) => self.activate_node(next),
                    None => self.emit_selection(),
                }
            }
        }
    }

    /// Move a node; incident segment lengths and radii follow.
    pub fn move_node(&mut self, id: NodeId, position: Coordinate) -> SkeletonResult<()> {
        check_position(position)?;
        let subobject = self.voxels.lookup(position);
        let node = self.node_mut(id)?;
        node.position = position;
        node.subobject_id = subobject;
        let keys = node.segments.clone();

        let mut touched = vec![id];
        for key in keys {
            let (source, target) = {
                let seg = self.segment(&key);
                (seg.source, seg.target)
            };
            let length = self.nodes[&source].position.distance(self.nodes[&target].position);
            if let Some(seg) = self.segments.get_mut(&key) {
                seg.length = length;
            }
            touched.push(if source == id { target } else { source });
        }
        for node in touched {
            self.update_circ_radius(node);
            self.emit(SkeletonEvent::NodeChanged(node));
        }
        self.commit();
        Ok(())
    }

    pub fn set_node_radius(&mut self, id: NodeId, radius: f32) -> SkeletonResult<()> {
        self.node_mut(id)?.radius = radius;
        self.update_circ_radius(id);
        self.emit(SkeletonEvent::NodeChanged(id));
        self.commit();
        Ok(())
    }

    /// Set a property, or remove it when `value` is `None`.
    ///
    /// Keys must survive an NML round trip, see [`is_property_key`].
    pub fn set_node_property(
        &mut self,
        id: NodeId,
        key: &str,
        value: Option<&str>,
    ) -> SkeletonResult<()> {
        if value.is_some() && !is_property_key(key) {
            return Err(SkeletonError::InvalidPropertyKey(key.to_string()));
        }
        let node = self.node_mut(id)?;
        match value {
            Some(value) => {
                node.properties.insert(key.to_string(), value.to_string());
            }
            None => {
                node.properties.remove(key);
            }
        }
        self.emit(SkeletonEvent::NodeChanged(id));
        self.commit();
        Ok(())
    }

    pub(crate) fn update_circ_radius(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let circ = node
            .segments
            .iter()
            .map(|key| self.segment(key).length)
            .fold(node.radius, f32::max);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.circ_radius = circ;
        }
    }

    // --- Segments ---

    /// Link two distinct, not yet linked nodes.
    pub fn add_segment(&mut self, source: NodeId, target: NodeId) -> SkeletonResult<Segment> {
        let segment = self.link(source, target)?;
        self.commit();
        Ok(segment)
    }

    pub(crate) fn link(&mut self, source: NodeId, target: NodeId) -> SkeletonResult<Segment> {
        if source == target {
            return Err(SkeletonError::SelfLoop(source));
        }
        let a = self.nodes.get(&source).ok_or(SkeletonError::NodeNotFound(source))?;
        let b = self.nodes.get(&target).ok_or(SkeletonError::NodeNotFound(target))?;
        let key = EdgeKey::new(source, target);
        if self.segments.contains_key(&key) {
            return Err(SkeletonError::DuplicateSegment(source, target));
        }

        let segment = Segment { source, target, length: a.position.distance(b.position) };
        self.segments.insert(key, segment.clone());
        for id in [source, target] {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.segments.push(key);
                node.circ_radius = node.circ_radius.max(segment.length);
            }
        }
        self.emit(SkeletonEvent::SegmentAdded { source, target });
        Ok(segment)
    }

    /// Delete the segment between two nodes, whatever its direction.
    pub fn delete_segment(&mut self, source: NodeId, target: NodeId) -> SkeletonResult<()> {
        let key = EdgeKey::new(source, target);
        if !self.segments.contains_key(&key) {
            return Err(SkeletonError::SegmentNotFound(source, target));
        }
        self.unlink(key);
        self.commit();
        Ok(())
    }

    /// Remove an existing segment from the store and from both endpoints.
    fn unlink(&mut self, key: EdgeKey) {
        let Some(segment) = self.segments.remove(&key) else {
            panic!("unlink called for missing segment {key:?}");
        };
        for id in [segment.source, segment.target] {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.segments.retain(|k| *k != key);
            }
            self.update_circ_radius(id);
        }
        self.emit(SkeletonEvent::SegmentRemoved {
            source: segment.source,
            target: segment.target,
        });
    }

    // --- Selection ---

    /// Make `id` the active node; the active tree follows.
    pub fn set_active_node(&mut self, id: NodeId) -> SkeletonResult<()> {
        if !self.nodes.contains_key(&id) {
            return Err(SkeletonError::NodeNotFound(id));
        }
        self.activate_node(id);
        self.commit();
        Ok(())
    }

    /// Make `id` the active tree.
    ///
    /// The active node moves to the tree's node nearest the previously active
    /// position, or is cleared if the tree is empty.
    pub fn set_active_tree(&mut self, id: TreeId) -> SkeletonResult<()> {
        if !self.trees.contains_key(&id) {
            return Err(SkeletonError::TreeNotFound(id));
        }
        self.activate_tree(id);
        self.commit();
        Ok(())
    }

    pub(crate) fn activate_node(&mut self, id: NodeId) {
        if let Some(old) = self.active_node.and_then(|n| self.nodes.get_mut(&n)) {
            old.selected = false;
        }
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.selected = true;
        let tree = node.tree;
        self.active_node = Some(id);
        self.active_tree = Some(tree);
        self.emit_selection();
    }

    pub(crate) fn activate_tree(&mut self, id: TreeId) {
        let keep = self
            .active_node()
            .is_some_and(|node| node.tree == id);
        if keep {
            self.active_tree = Some(id);
            self.emit_selection();
            return;
        }
        let anchor = self.active_node().map(|n| n.position);
        self.activate_tree_near(id, anchor);
    }

    /// Activate a tree and its node nearest `anchor` (first node without one).
    fn activate_tree_near(&mut self, id: TreeId, anchor: Option<Coordinate>) {
        let first = self.trees.get(&id).and_then(|t| t.nodes.first().copied());
        let next = match anchor {
            Some(pos) if first.is_some() => self.find_nearby_node(Some(id), pos),
            _ => first,
        };
        match next {
            Some(node) => self.activate_node(node),
            None => {
                if let Some(old) = self.active_node.and_then(|n| self.nodes.get_mut(&n)) {
                    old.selected = false;
                }
                self.active_node = None;
                self.active_tree = Some(id);
                self.emit_selection();
            }
        }
    }

    fn emit_selection(&mut self) {
        self.emit(SkeletonEvent::SelectionChanged {
            node: self.active_node,
            tree: self.active_tree,
        });
    }

    // --- Whole store ---

    /// Remove all annotation state.
    pub fn clear(&mut self) {
        self.reset();
        self.commit();
    }

    /// Reset to empty without touching the revision.
    pub(crate) fn reset(&mut self) {
        self.trees.clear();
        self.nodes.clear();
        self.segments.clear();
        self.comments = CommentIndex::default();
        self.branch_stack.clear();
        self.greatest_node_id = 0;
        self.greatest_tree_id = 0;
        self.active_node = None;
        self.active_tree = None;
        self.events.clear();
        self.emit(SkeletonEvent::Reset);
        log::info!("Skeleton {} cleared", self.id);
    }

    /// Replace all annotation state with `other`'s, keeping identity,
    /// configuration, voxel source and revision.
    pub(crate) fn replace_contents(&mut self, other: Skeleton) {
        self.trees = other.trees;
        self.nodes = other.nodes;
        self.segments = other.segments;
        self.comments = other.comments;
        self.branch_stack = other.branch_stack;
        self.greatest_node_id = other.greatest_node_id;
        self.greatest_tree_id = other.greatest_tree_id;
        self.active_node = other.active_node;
        self.active_tree = other.active_tree;
        self.parameters = other.parameters;
        self.time_offset_ms = other.time_offset_ms;
        self.session_start = other.session_start;
        self.events.clear();
        self.emit(SkeletonEvent::Reset);
    }

    /// Empty scratch store sharing this store's configuration and voxel source.
    pub(crate) fn scratch(&self) -> Skeleton {
        let mut scratch = Skeleton::new(self.config.clone());
        scratch.voxels = self.voxels.clone();
        scratch
    }

    /// Check the structural invariants. Test helper; panics on violation.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (id, node) in &self.nodes {
            let tree = self.trees.get(&node.tree).expect("node's tree exists");
            assert_eq!(tree.nodes.iter().filter(|&&n| n == *id).count(), 1);
            for key in &node.segments {
                let seg = self.segments.get(key).expect("segment exists");
                assert!(seg.touches(*id));
            }
            assert_eq!(node.comment.is_some(), self.comments.contains(*id));
        }
        for (key, seg) in &self.segments {
            assert_eq!(*key, seg.key());
            assert!(self.nodes[&seg.source].segments.contains(key));
            assert!(self.nodes[&seg.target].segments.contains(key));
        }
        for tree in self.trees.values() {
            for n in &tree.nodes {
                assert_eq!(self.nodes[n].tree, tree.id);
            }
        }
        if let Some(active) = self.active_node {
            assert_eq!(Some(self.nodes[&active].tree), self.active_tree);
        }
    }
}

/// Node positions must have a 1-based NML form.
fn check_position(position: Coordinate) -> SkeletonResult<()> {
    match position.to_wire() {
        Some(_) => Ok(()),
        None => Err(SkeletonError::UnrepresentablePosition(position)),
    }
}
