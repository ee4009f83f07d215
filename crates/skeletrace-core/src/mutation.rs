//! Typed mutations shared by the local and the remote path.
//!
//! A local caller builds a [`Mutation`], the store [resolves](Skeleton::resolve)
//! every store-assigned value in it (IDs, timestamps, radii), and the resolved
//! form is what gets applied, recorded for undo and sent to peers. Replaying
//! a resolved mutation on an identical store yields an identical store.

use crate::error::{ProtocolResult, SkeletonResult};
use crate::geometry::Coordinate;
use crate::nml::{LoadMode, LoadSummary};
use crate::skeleton::{NewNode, NodeId, Segment, Skeleton, TreeColor, TreeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    AddTree {
        id: TreeId,
        color: Option<TreeColor>,
    },
    DeleteTree {
        id: TreeId,
    },
    SetTreeComment {
        id: TreeId,
        comment: String,
    },
    SetTreeColor {
        id: TreeId,
        color: Option<TreeColor>,
    },
    SetTreeRender {
        id: TreeId,
        render: bool,
    },
    AddNode {
        node: NewNode,
    },
    DeleteNode {
        id: NodeId,
    },
    MoveNode {
        id: NodeId,
        position: Coordinate,
    },
    SetNodeRadius {
        id: NodeId,
        radius: f32,
    },
    SetNodeProperty {
        id: NodeId,
        key: String,
        value: Option<String>,
    },
    AddSegment {
        source: NodeId,
        target: NodeId,
    },
    DeleteSegment {
        source: NodeId,
        target: NodeId,
    },
    SetComment {
        node: NodeId,
        text: String,
    },
    DeleteComment {
        node: NodeId,
    },
    PushBranch {
        node: NodeId,
    },
    PopBranch,
    SetActiveNode {
        id: NodeId,
    },
    SetActiveTree {
        id: TreeId,
    },
    /// `tree` is the ID for the new tree, 0 to assign one.
    ExtractComponent {
        start: NodeId,
        tree: TreeId,
    },
    MergeTrees {
        keep: TreeId,
        absorb: TreeId,
    },
    MoveNodesToTree {
        nodes: Vec<NodeId>,
        tree: TreeId,
    },
    Clear,
    Load {
        nml: String,
        mode: LoadMode,
    },
}

/// How a mutation interacts with the undo history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    /// Recorded together with its inverse.
    Reversible,
    /// Selection only; neither recorded nor clearing the history.
    Transient,
    /// Too broad to invert; clears the history.
    Structural,
}

impl Mutation {
    pub fn undo_kind(&self) -> UndoKind {
        match self {
            Mutation::SetActiveNode { .. } | Mutation::SetActiveTree { .. } => UndoKind::Transient,
            Mutation::ExtractComponent { .. }
            | Mutation::MergeTrees { .. }
            | Mutation::MoveNodesToTree { .. }
            | Mutation::Clear
            | Mutation::Load { .. } => UndoKind::Structural,
            _ => UndoKind::Reversible,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::AddTree { .. } => "add_tree",
            Mutation::DeleteTree { .. } => "delete_tree",
            Mutation::SetTreeComment { .. } => "set_tree_comment",
            Mutation::SetTreeColor { .. } => "set_tree_color",
            Mutation::SetTreeRender { .. } => "set_tree_render",
            Mutation::AddNode { .. } => "add_node",
            Mutation::DeleteNode { .. } => "delete_node",
            Mutation::MoveNode { .. } => "move_node",
            Mutation::SetNodeRadius { .. } => "set_node_radius",
            Mutation::SetNodeProperty { .. } => "set_node_property",
            Mutation::AddSegment { .. } => "add_segment",
            Mutation::DeleteSegment { .. } => "delete_segment",
            Mutation::SetComment { .. } => "set_comment",
            Mutation::DeleteComment { .. } => "delete_comment",
            Mutation::PushBranch { .. } => "push_branch",
            Mutation::PopBranch => "pop_branch",
            Mutation::SetActiveNode { .. } => "set_active_node",
            Mutation::SetActiveTree { .. } => "set_active_tree",
            Mutation::ExtractComponent { .. } => "extract_component",
            Mutation::MergeTrees { .. } => "merge_trees",
            Mutation::MoveNodesToTree { .. } => "move_nodes_to_tree",
            Mutation::Clear => "clear",
            Mutation::Load { .. } => "load",
        }
    }
}

/// What applying a mutation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Nothing changed and the revision did not move.
    Unchanged,
    Applied,
    TreeAdded(TreeId),
    NodeAdded(NodeId),
    SegmentAdded(Segment),
    BranchPopped(NodeId),
    ComponentExtracted(TreeId),
    Loaded(LoadSummary),
}

impl Effect {
    pub fn changed(&self) -> bool {
        !matches!(self, Effect::Unchanged)
    }
}

impl Skeleton {
    /// Fill in every value the store would otherwise choose while applying.
    pub fn resolve(&self, mutation: Mutation) -> SkeletonResult<Mutation> {
        Ok(match mutation {
            Mutation::AddTree { id, color } => Mutation::AddTree {
                id: self.resolve_tree_id(id)?,
                color,
            },
            Mutation::AddNode { mut node } => {
                if node.id == 0 {
                    node.id = self.next_node_id()?;
                }
                node.radius.get_or_insert(self.config().default_radius);
                node.timestamp.get_or_insert_with(|| self.annotation_time_ms());
                Mutation::AddNode { node }
            }
            Mutation::ExtractComponent { start, tree: 0 } => Mutation::ExtractComponent {
                start,
                tree: self.next_tree_id()?,
            },
            other => other,
        })
    }

    /// Apply a mutation. Every call that returns anything but
    /// [`Effect::Unchanged`] bumped the revision by exactly one.
    pub fn apply(&mut self, mutation: &Mutation) -> ProtocolResult<Effect> {
        let effect = match mutation {
            Mutation::AddTree { id, color } => Effect::TreeAdded(self.add_tree(*id, *color)?),
            Mutation::DeleteTree { id } => {
                self.delete_tree(*id)?;
                Effect::Applied
            }
            Mutation::SetTreeComment { id, comment } => {
                self.set_tree_comment(*id, comment)?;
                Effect::Applied
            }
            Mutation::SetTreeColor { id, color } => {
                self.set_tree_color(*id, *color)?;
                Effect::Applied
            }
            Mutation::SetTreeRender { id, render } => {
                self.set_tree_render(*id, *render)?;
                Effect::Applied
            }
            Mutation::AddNode { node } => Effect::NodeAdded(self.add_node(node.clone())?),
            Mutation::DeleteNode { id } => {
                self.delete_node(*id)?;
                Effect::Applied
            }
            Mutation::MoveNode { id, position } => {
                self.move_node(*id, *position)?;
                Effect::Applied
            }
            Mutation::SetNodeRadius { id, radius } => {
                self.set_node_radius(*id, *radius)?;
                Effect::Applied
            }
            Mutation::SetNodeProperty { id, key, value } => {
                self.set_node_property(*id, key, value.as_deref())?;
                Effect::Applied
            }
            Mutation::AddSegment { source, target } => {
                Effect::SegmentAdded(self.add_segment(*source, *target)?)
            }
            Mutation::DeleteSegment { source, target } => {
                self.delete_segment(*source, *target)?;
                Effect::Applied
            }
            Mutation::SetComment { node, text } => {
                self.set_comment(*node, text)?;
                Effect::Applied
            }
            Mutation::DeleteComment { node } => {
                self.delete_comment(*node)?;
                Effect::Applied
            }
            Mutation::PushBranch { node } => {
                self.push_branch(*node)?;
                Effect::Applied
            }
            Mutation::PopBranch => Effect::BranchPopped(self.pop_branch()?),
            Mutation::SetActiveNode { id } => {
                self.set_active_node(*id)?;
                Effect::Applied
            }
            Mutation::SetActiveTree { id } => {
                self.set_active_tree(*id)?;
                Effect::Applied
            }
            Mutation::ExtractComponent { start, tree } => {
                match self.split_component(*start, *tree)? {
                    Some(tree) => {
                        self.commit();
                        Effect::ComponentExtracted(tree)
                    }
                    None => Effect::Unchanged,
                }
            }
            Mutation::MergeTrees { keep, absorb } => {
                self.merge_trees(*keep, *absorb)?;
                Effect::Applied
            }
            Mutation::MoveNodesToTree { nodes, tree } => {
                self.move_nodes_to_tree(nodes, *tree)?;
                Effect::Applied
            }
            Mutation::Clear => {
                self.clear();
                Effect::Applied
            }
            Mutation::Load { nml, mode } => Effect::Loaded(self.load_nml(nml, *mode)?),
        };
        log::debug!("Applied {} at revision {}", mutation.name(), self.revision());
        Ok(effect)
    }

    /// Mutations that undo `mutation` when applied after it, computed against
    /// the current (pre-mutation) state. `None` for kinds that are not
    /// [`UndoKind::Reversible`] or that would fail.
    pub fn inverse_of(&self, mutation: &Mutation) -> Option<Vec<Mutation>> {
        let inverse = match mutation {
            Mutation::AddTree { id, .. } => vec![Mutation::DeleteTree { id: *id }],
            Mutation::DeleteTree { id } => self.rebuild_tree(*id)?,
            Mutation::SetTreeComment { id, .. } => vec![Mutation::SetTreeComment {
                id: *id,
                comment: self.find_tree_by_id(*id)?.comment.clone(),
            }],
            Mutation::SetTreeColor { id, .. } => {
                let tree = self.find_tree_by_id(*id)?;
                vec![Mutation::SetTreeColor {
                    id: *id,
                    color: tree.custom_color.then_some(tree.color),
                }]
            }
            Mutation::SetTreeRender { id, .. } => vec![Mutation::SetTreeRender {
                id: *id,
                render: self.find_tree_by_id(*id)?.render,
            }],
            Mutation::AddNode { node } => vec![Mutation::DeleteNode { id: node.id }],
            Mutation::DeleteNode { id } => self.rebuild_nodes(&[*id], &HashSet::new())?,
            Mutation::MoveNode { id, .. } => vec![Mutation::MoveNode {
                id: *id,
                position: self.find_node_by_id(*id)?.position,
            }],
            Mutation::SetNodeRadius { id, .. } => vec![Mutation::SetNodeRadius {
                id: *id,
                radius: self.find_node_by_id(*id)?.radius,
            }],
            Mutation::SetNodeProperty { id, key, .. } => vec![Mutation::SetNodeProperty {
                id: *id,
                key: key.clone(),
                value: self.find_node_by_id(*id)?.properties.get(key).cloned(),
            }],
            Mutation::AddSegment { source, target } => vec![Mutation::DeleteSegment {
                source: *source,
                target: *target,
            }],
            Mutation::DeleteSegment { source, target } => {
                let segment = self.find_segment_between(*source, *target)?;
                vec![Mutation::AddSegment {
                    source: segment.source,
                    target: segment.target,
                }]
            }
            Mutation::SetComment { node, .. } | Mutation::DeleteComment { node } => {
                let current = self.find_node_by_id(*node)?;
                let mut steps = vec![match &current.comment {
                    Some(text) => Mutation::SetComment {
                        node: *node,
                        text: text.clone(),
                    },
                    None => Mutation::DeleteComment { node: *node },
                }];
                // Radius rules fire both when the comment is set and when the
                // old one is put back.
                let forward_radius = match mutation {
                    Mutation::SetComment { text, .. } => self.config().radius_for_comment(text),
                    _ => None,
                };
                let restored_radius = current
                    .comment
                    .as_deref()
                    .and_then(|text| self.config().radius_for_comment(text));
                if [forward_radius, restored_radius]
                    .into_iter()
                    .flatten()
                    .any(|radius| radius != current.radius)
                {
                    steps.push(Mutation::SetNodeRadius {
                        id: *node,
                        radius: current.radius,
                    });
                }
                steps
            }
            Mutation::PushBranch { .. } => vec![Mutation::PopBranch],
            Mutation::PopBranch => {
                let node = self.live_branch_points().last()?;
                vec![Mutation::PushBranch { node }]
            }
            _ => return None,
        };
        Some(inverse)
    }

    /// Mutations recreating a tree with its nodes, comments and segments.
    fn rebuild_tree(&self, id: TreeId) -> Option<Vec<Mutation>> {
        let tree = self.find_tree_by_id(id)?;
        let mut steps = vec![Mutation::AddTree {
            id,
            color: tree.custom_color.then_some(tree.color),
        }];
        if !tree.comment.is_empty() {
            steps.push(Mutation::SetTreeComment {
                id,
                comment: tree.comment.clone(),
            });
        }
        if !tree.render {
            steps.push(Mutation::SetTreeRender { id, render: false });
        }
        let members: HashSet<NodeId> = tree.nodes().iter().copied().collect();
        steps.extend(self.rebuild_nodes(tree.nodes(), &members)?);
        Some(steps)
    }

    /// Mutations recreating `ids` and their incident segments. Segments
    /// between two nodes of `batch` are emitted once.
    fn rebuild_nodes(&self, ids: &[NodeId], batch: &HashSet<NodeId>) -> Option<Vec<Mutation>> {
        let mut nodes = Vec::new();
        let mut comments = Vec::new();
        let mut segments = Vec::new();
        for &id in ids {
            let node = self.find_node_by_id(id)?;
            nodes.push(Mutation::AddNode {
                node: NewNode::from_node(node),
            });
            if let Some(text) = &node.comment {
                comments.push(Mutation::SetComment {
                    node: id,
                    text: text.clone(),
                });
                if self
                    .config()
                    .radius_for_comment(text)
                    .is_some_and(|radius| radius != node.radius)
                {
                    comments.push(Mutation::SetNodeRadius {
                        id,
                        radius: node.radius,
                    });
                }
            }
            for half in self.node_segments(id) {
                let other = half.segment.other_end(id);
                // Inner segments are emitted from their source side only.
                if batch.contains(&other) && !half.forward {
                    continue;
                }
                segments.push(Mutation::AddSegment {
                    source: half.segment.source,
                    target: half.segment.target,
                });
            }
        }
        nodes.extend(comments);
        nodes.extend(segments);
        Some(nodes)
    }
}
