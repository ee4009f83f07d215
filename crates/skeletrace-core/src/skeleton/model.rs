//! Trees, nodes and segments.

use crate::geometry::Coordinate;
use peniko::Color;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store-wide unique node identifier. Zero means "assign one".
pub type NodeId = u64;

/// Store-wide unique tree identifier. Zero means "assign one".
pub type TreeId = u64;

/// RGBA tree color with float channels in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl TreeColor {
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Deterministic palette color for a tree ID.
    ///
    /// Walks the hue circle by the golden ratio so neighbouring IDs get
    /// well separated colors.
    pub fn for_tree(id: TreeId) -> Self {
        const GOLDEN_RATIO_CONJUGATE: f64 = 0.618_033_988_749_895;
        let hue = (id as f64 * GOLDEN_RATIO_CONJUGATE).fract() as f32;
        let (r, g, b) = hsv_to_rgb(hue, 0.75, 0.95);
        Self::new(r, g, b, 1.0)
    }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    match sector as i32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

impl From<Color> for TreeColor {
    fn from(color: Color) -> Self {
        let [r, g, b, a] = color.components;
        Self { r, g, b, a }
    }
}

impl From<TreeColor> for Color {
    fn from(color: TreeColor) -> Self {
        Color::new([color.r, color.g, color.b, color.a])
    }
}

/// A named, colored partition of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub id: TreeId,
    /// Display color. Palette-derived unless `custom_color` is set.
    pub color: TreeColor,
    /// Whether `color` was chosen explicitly rather than taken from the palette.
    pub custom_color: bool,
    pub comment: String,
    /// Render-visibility flag.
    pub render: bool,
    /// Owned nodes in insertion order.
    pub(crate) nodes: Vec<NodeId>,
}

impl Tree {
    pub(crate) fn new(id: TreeId, color: Option<TreeColor>) -> Self {
        Self {
            id,
            color: color.unwrap_or_else(|| TreeColor::for_tree(id)),
            custom_color: color.is_some(),
            comment: String::new(),
            render: true,
            nodes: Vec::new(),
        }
    }

    /// Node IDs in insertion order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Normalized (unordered) key of a node pair. One segment exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EdgeKey(NodeId, NodeId);

impl EdgeKey {
    pub(crate) fn new(a: NodeId, b: NodeId) -> Self {
        if a <= b { EdgeKey(a, b) } else { EdgeKey(b, a) }
    }
}

/// A directed edge stored once for both of its endpoints.
///
/// The source holds it as its forward segment, the target as the backward
/// one. Removing the record removes both halves at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub source: NodeId,
    pub target: NodeId,
    /// Euclidean distance between the endpoints, kept current on moves.
    pub length: f32,
}

impl Segment {
    pub(crate) fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source, self.target)
    }

    /// The endpoint that is not `node`.
    pub fn other_end(&self, node: NodeId) -> NodeId {
        if self.source == node { self.target } else { self.source }
    }

    pub fn touches(&self, node: NodeId) -> bool {
        self.source == node || self.target == node
    }
}

/// A segment as seen from one of its endpoints.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRef<'a> {
    pub segment: &'a Segment,
    /// `true` for the forward half (the viewing node is the source).
    pub forward: bool,
}

/// A positioned, radius-bearing point owned by exactly one tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub tree: TreeId,
    pub position: Coordinate,
    pub radius: f32,
    /// Milliseconds of annotation time at creation.
    pub timestamp: u64,
    /// Viewport the node was placed in.
    pub viewport: i32,
    /// Magnification the node was placed at.
    pub magnification: u32,
    pub properties: BTreeMap<String, String>,
    /// Max of own radius and incident segment lengths.
    pub circ_radius: f32,
    pub comment: Option<String>,
    pub is_branch_node: bool,
    /// Label read from the voxel layer at the node's position.
    pub subobject_id: Option<u64>,
    pub selected: bool,
    #[serde(skip)]
    pub(crate) segments: Vec<EdgeKey>,
}

impl Node {
    /// Number of incident segments (forward and backward).
    pub fn degree(&self) -> usize {
        self.segments.len()
    }
}

/// Parameters for a node to be added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    /// Requested ID, 0 to let the store assign one.
    pub id: NodeId,
    pub tree: TreeId,
    pub position: Coordinate,
    /// `None` uses the configured default radius.
    pub radius: Option<f32>,
    pub viewport: i32,
    pub magnification: u32,
    /// `None` stamps the node with the current annotation time.
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl NewNode {
    pub fn new(tree: TreeId, position: Coordinate) -> Self {
        Self {
            id: 0,
            tree,
            position,
            radius: None,
            viewport: 0,
            magnification: 1,
            timestamp: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = Some(radius);
        self
    }

    pub fn with_viewport(mut self, viewport: i32, magnification: u32) -> Self {
        self.viewport = viewport;
        self.magnification = magnification;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Rebuild the creation parameters of an existing node.
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id,
            tree: node.tree,
            position: node.position,
            radius: Some(node.radius),
            viewport: node.viewport,
            magnification: node.magnification,
            timestamp: Some(node.timestamp),
            properties: node.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_key_is_unordered() {
        assert_eq!(EdgeKey::new(3, 7), EdgeKey::new(7, 3));
        assert_ne!(EdgeKey::new(3, 7), EdgeKey::new(3, 8));
    }

    #[test]
    fn test_palette_is_deterministic() {
        assert_eq!(TreeColor::for_tree(4), TreeColor::for_tree(4));
        assert_ne!(TreeColor::for_tree(1), TreeColor::for_tree(2));
        let c = TreeColor::for_tree(9);
        for channel in [c.r, c.g, c.b] {
            assert!((0.0..=1.0).contains(&channel));
        }
    }

    #[test]
    fn test_color_conversion() {
        let color = TreeColor::new(0.25, 0.5, 0.75, 1.0);
        let peniko: Color = color.into();
        assert_eq!(TreeColor::from(peniko), color);
    }

    #[test]
    fn test_segment_other_end() {
        let seg = Segment { source: 1, target: 2, length: 1.0 };
        assert_eq!(seg.other_end(1), 2);
        assert_eq!(seg.other_end(2), 1);
        assert!(seg.touches(2));
        assert!(!seg.touches(3));
    }
}
