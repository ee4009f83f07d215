//! NML output.

use super::{CREATOR_VERSION, RawElement, TIME_CHECKSUM_KEY};
use crate::skeleton::{Node, Skeleton, Tree};

impl Skeleton {
    /// Serialize the store as an NML document.
    ///
    /// Writing does not touch the store; the branch stack in particular is
    /// written in push order and left as is.
    pub fn to_nml(&self) -> String {
        let mut xml = XmlWriter::default();
        xml.line("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        xml.open("things", &[]);

        self.write_parameters(&mut xml);
        for tree in self.trees() {
            self.write_tree(&mut xml, tree);
        }

        xml.open("comments", &[]);
        for id in self.comments.order() {
            if let Some(text) = self.find_node_by_id(*id).and_then(|n| n.comment.as_deref()) {
                xml.empty("comment", &[("node", id.to_string()), ("content", text.to_string())]);
            }
        }
        xml.close("comments");

        xml.open("branchpoints", &[]);
        for id in self.live_branch_points() {
            xml.empty("branchpoint", &[("id", id.to_string())]);
        }
        xml.close("branchpoints");

        xml.close("things");
        xml.finish()
    }

    fn write_parameters(&self, xml: &mut XmlWriter) {
        let params = self.parameters();
        let time = self.annotation_time_ms();

        xml.open("parameters", &[]);
        xml.empty("experiment", &[("name", params.experiment.clone())]);
        let created = params.created_in.as_deref().unwrap_or(CREATOR_VERSION);
        xml.empty("createdin", &[("version", created.to_string())]);
        xml.empty("lastsavedin", &[("version", CREATOR_VERSION.to_string())]);
        if let Some(scale) = params.scale {
            xml.empty(
                "scale",
                &[("x", scale.x.to_string()), ("y", scale.y.to_string()), ("z", scale.z.to_string())],
            );
        }
        if let Some(offset) = params.offset {
            xml.empty(
                "offset",
                &[("x", offset.x.to_string()), ("y", offset.y.to_string()), ("z", offset.z.to_string())],
            );
        }
        xml.empty(
            "time",
            &[("ms", time.to_string()), ("checksum", (time ^ TIME_CHECKSUM_KEY).to_string())],
        );
        if let Some(active) = self.active_node_id() {
            xml.empty("activeNode", &[("id", active.to_string())]);
        }
        if let Some(position) = params.edit_position.and_then(|p| {
            let wire = p.to_wire();
            if wire.is_none() {
                log::warn!("Edit position {} has no NML form, not written", p);
            }
            wire
        }) {
            xml.empty(
                "editPosition",
                &[("x", position.x.to_string()), ("y", position.y.to_string()), ("z", position.z.to_string())],
            );
        }
        for raw in &params.extra {
            xml.raw(raw);
        }
        xml.close("parameters");
    }

    fn write_tree(&self, xml: &mut XmlWriter, tree: &Tree) {
        let channels = if tree.custom_color {
            [tree.color.r, tree.color.g, tree.color.b, tree.color.a].map(|c| c.to_string())
        } else {
            ["-1", "-1", "-1", "-1"].map(str::to_string)
        };
        let [r, g, b, a] = channels;
        let mut attributes = vec![
            ("id", tree.id.to_string()),
            ("color.r", r),
            ("color.g", g),
            ("color.b", b),
            ("color.a", a),
            ("comment", tree.comment.clone()),
        ];
        if !tree.render {
            attributes.push(("render", "0".to_string()));
        }
        xml.open("thing", &attributes);

        xml.open("nodes", &[]);
        for node in self.tree_nodes(tree.id) {
            write_node(xml, node);
        }
        xml.close("nodes");

        // Each segment is written once, under its source node's tree.
        xml.open("edges", &[]);
        for node in self.tree_nodes(tree.id) {
            for half in self.node_segments(node.id).into_iter().filter(|s| s.forward) {
                xml.empty(
                    "edge",
                    &[
                        ("source", half.segment.source.to_string()),
                        ("target", half.segment.target.to_string()),
                    ],
                );
            }
        }
        xml.close("edges");
        xml.close("thing");
    }
}

fn write_node(xml: &mut XmlWriter, node: &Node) {
    // The store refuses positions without a 1-based form.
    let Some(position) = node.position.to_wire() else {
        log::error!("Node {} at {} has no NML position, not written", node.id, node.position);
        return;
    };
    let mut attributes = vec![
        ("id", node.id.to_string()),
        ("radius", node.radius.to_string()),
        ("x", position.x.to_string()),
        ("y", position.y.to_string()),
        ("z", position.z.to_string()),
        ("inVp", node.viewport.to_string()),
        ("inMag", node.magnification.to_string()),
        ("time", node.timestamp.to_string()),
    ];
    if let Some(subobject) = node.subobject_id {
        attributes.push(("subobject", subobject.to_string()));
    }
    for (key, value) in &node.properties {
        attributes.push((key.as_str(), value.clone()));
    }
    xml.empty("node", &attributes);
}

/// Minimal indenting XML builder.
#[derive(Default)]
struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn tag(name: &str, attributes: &[(&str, String)], close: &str) -> String {
        let mut tag = format!("<{name}");
        for (key, value) in attributes {
            tag.push_str(&format!(" {key}=\"{}\"", escape(value)));
        }
        tag.push_str(close);
        tag
    }

    fn open(&mut self, name: &str, attributes: &[(&str, String)]) {
        self.line(&Self::tag(name, attributes, ">"));
        self.depth += 1;
    }

    fn empty(&mut self, name: &str, attributes: &[(&str, String)]) {
        self.line(&Self::tag(name, attributes, "/>"));
    }

    fn close(&mut self, name: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.line(&format!("</{name}>"));
    }

    fn raw(&mut self, element: &RawElement) {
        let attributes: Vec<(&str, String)> = element
            .attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        match (&element.text, element.children.is_empty()) {
            (None, true) => self.empty(&element.name, &attributes),
            (Some(text), true) => {
                let open = Self::tag(&element.name, &attributes, ">");
                self.line(&format!("{open}{}</{}>", escape(text), element.name));
            }
            (text, false) => {
                self.open(&element.name, &attributes);
                if let Some(text) = text {
                    self.line(&escape(text));
                }
                for child in &element.children {
                    self.raw(child);
                }
                self.close(&element.name);
            }
        }
    }

    fn finish(self) -> String {
        self.out
    }
}

/// Escape text for use in attribute values and character data.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\n' => escaped.push_str("&#10;"),
            '\r' => escaped.push_str("&#13;"),
            '\t' => escaped.push_str("&#9;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Coordinate, FloatCoordinate};
    use crate::nml::LoadMode;
    use crate::skeleton::{NewNode, TreeColor};

    fn sample() -> Skeleton {
        let mut skeleton = Skeleton::default();
        let t1 = skeleton.add_tree(0, None).unwrap();
        let t2 = skeleton.add_tree(0, Some(TreeColor::new(0.25, 0.5, 0.75, 1.0))).unwrap();
        let a = skeleton
            .add_node(
                NewNode::new(t1, Coordinate::new(0, 5, 9))
                    .with_radius(2.25)
                    .with_property("note", "a \"quoted\" <value>"),
            )
            .unwrap();
        let b = skeleton.add_node(NewNode::new(t1, Coordinate::new(3, 5, 9))).unwrap();
        let c = skeleton.add_node(NewNode::new(t2, Coordinate::new(9, 9, 9))).unwrap();
        skeleton.add_segment(b, a).unwrap();
        skeleton.add_segment(b, c).unwrap();
        skeleton.set_comment(a, "first\nline & more").unwrap();
        skeleton.push_branch(c).unwrap();
        skeleton.push_branch(a).unwrap();
        skeleton.set_tree_comment(t2, "dendrite").unwrap();
        skeleton.set_tree_render(t2, false).unwrap();
        skeleton.parameters_mut().scale = Some(FloatCoordinate::new(9.0, 9.0, 20.0));
        skeleton.parameters_mut().edit_position = Some(Coordinate::new(0, 0, 0));
        skeleton
    }

    #[test]
    fn test_wire_format() {
        let nml = sample().to_nml();
        assert!(nml.contains(r#"<node id="1" radius="2.25" x="1" y="6" z="10""#));
        assert!(nml.contains(r#"color.r="-1" color.g="-1" color.b="-1" color.a="-1""#));
        assert!(nml.contains(r#"color.r="0.25" color.g="0.5""#));
        assert!(nml.contains(r#"<edge source="2" target="1"/>"#));
        assert!(nml.contains(r#"content="first&#10;line &amp; more""#));
        assert!(nml.contains(r#"<editPosition x="1" y="1" z="1"/>"#));
        let stack = nml.find(r#"<branchpoint id="3"/>"#).unwrap();
        assert!(stack < nml.find(r#"<branchpoint id="1"/>"#).unwrap());
    }

    #[test]
    fn test_round_trip() {
        let original = sample();
        let mut loaded = Skeleton::default();
        loaded.load_nml(&original.to_nml(), LoadMode::Replace).unwrap();

        for node in original.nodes() {
            let copy = loaded.find_node_by_id(node.id).unwrap();
            assert_eq!(copy.tree, node.tree);
            assert_eq!(copy.position, node.position);
            assert_eq!(copy.radius, node.radius);
            assert_eq!(copy.timestamp, node.timestamp);
            assert_eq!(copy.comment, node.comment);
            assert_eq!(copy.properties, node.properties);
            assert_eq!(copy.is_branch_node, node.is_branch_node);
        }
        for tree in original.trees() {
            let copy = loaded.find_tree_by_id(tree.id).unwrap();
            assert_eq!(copy.nodes(), tree.nodes());
            assert_eq!(copy.color, tree.color);
            assert_eq!(copy.custom_color, tree.custom_color);
            assert_eq!(copy.comment, tree.comment);
            assert_eq!(copy.render, tree.render);
        }
        assert_eq!(loaded.segment_count(), original.segment_count());
        assert_eq!(loaded.branch_stack(), original.branch_stack());
        assert_eq!(loaded.active_node_id(), original.active_node_id());
        assert_eq!(loaded.parameters().scale, original.parameters().scale);
        assert_eq!(loaded.parameters().edit_position, original.parameters().edit_position);
        loaded.assert_consistent();
    }

    #[test]
    fn test_stale_branch_points_are_not_written() {
        let mut skeleton = sample();
        skeleton.delete_node(3).unwrap();
        let nml = skeleton.to_nml();
        assert!(!nml.contains(r#"<branchpoint id="3"/>"#));
        assert_eq!(skeleton.branch_stack(), &[3, 1]);
    }

    #[test]
    fn test_raw_parameters_survive() {
        let mut skeleton = Skeleton::default();
        let mut raw = RawElement::new("viewer").with_attribute("zoom", "2");
        raw.children.push(RawElement::new("layer").with_attribute("name", "em & seg"));
        skeleton.parameters_mut().extra.push(raw.clone());

        let mut loaded = Skeleton::default();
        loaded.load_nml(&skeleton.to_nml(), LoadMode::Replace).unwrap();
        assert_eq!(loaded.parameters().extra, vec![raw]);
    }

    #[test]
    fn test_extreme_positions_and_properties_reload() {
        let mut skeleton = Skeleton::default();
        let tree = skeleton.add_tree(0, None).unwrap();
        let low = Coordinate::new(i32::MIN, 0, i32::MIN);
        let high = Coordinate::new(i32::MAX - 1, i32::MAX - 1, 0);
        let a = skeleton
            .add_node(NewNode::new(tree, low).with_property("cell_type", "stellate"))
            .unwrap();
        let b = skeleton.add_node(NewNode::new(tree, high)).unwrap();
        skeleton.set_node_property(b, "syn.count", Some("12")).unwrap();
        skeleton.parameters_mut().edit_position = Some(Coordinate::new(i32::MAX, 0, 0));

        let nml = skeleton.to_nml();
        assert!(!nml.contains("editPosition"));
        let mut loaded = Skeleton::default();
        loaded.load_nml(&nml, LoadMode::Replace).unwrap();
        assert_eq!(loaded.find_node_by_id(a).unwrap().position, low);
        assert_eq!(loaded.find_node_by_id(b).unwrap().position, high);
        assert_eq!(loaded.find_node_by_id(a).unwrap().properties, skeleton.find_node_by_id(a).unwrap().properties);
        assert_eq!(loaded.find_node_by_id(b).unwrap().properties, skeleton.find_node_by_id(b).unwrap().properties);
        assert_eq!(loaded.parameters().edit_position, None);
    }
}
