//! NML parsing.

use super::{
    DocumentParameters, LoadMode, NODE_ATTRIBUTES, NmlError, NmlResult, RawElement,
    TIME_CHECKSUM_KEY, is_property_key,
};
use crate::error::SkeletonError;
use crate::geometry::{Coordinate, FloatCoordinate};
use crate::skeleton::{NewNode, NodeId, Skeleton, TreeColor, TreeId};
use roxmltree::{Document, Node as XmlNode};
use std::str::FromStr;

/// What a load added to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub trees: usize,
    pub nodes: usize,
    pub segments: usize,
    pub comments: usize,
    pub branch_points: usize,
    /// Amount added to every node ID in the document (0 for replace loads).
    pub node_offset: NodeId,
    /// Amount added to every tree ID in the document (0 for replace loads).
    pub tree_offset: TreeId,
}

impl Skeleton {
    /// Load an NML document.
    ///
    /// The document is built into a scratch store first, so a malformed
    /// document leaves this store exactly as it was.
    pub fn load_nml(&mut self, text: &str, mode: LoadMode) -> NmlResult<LoadSummary> {
        let (loaded, summary) = self.read_nml(text, mode)?;
        self.replace_contents(loaded);
        self.commit();
        log::info!(
            "Loaded {} tree(s) and {} node(s) ({:?})",
            summary.trees,
            summary.nodes,
            mode
        );
        Ok(summary)
    }

    /// Parse `text` into a new store holding the result of the load.
    pub(crate) fn read_nml(&self, text: &str, mode: LoadMode) -> NmlResult<(Skeleton, LoadSummary)> {
        let document = Document::parse(text)?;
        let root = document.root_element();
        if root.tag_name().name() != "things" {
            return Err(NmlError::WrongRoot(root.tag_name().name().to_string()));
        }

        let (target, summary) = match mode {
            LoadMode::Replace => (self.scratch(), LoadSummary::default()),
            LoadMode::Merge => (
                self.clone(),
                LoadSummary {
                    node_offset: self.greatest_node_id(),
                    tree_offset: self.greatest_tree_id(),
                    ..LoadSummary::default()
                },
            ),
        };
        let mut reader = Reader {
            target,
            summary,
            parameters: None,
            time: None,
            active_node: None,
            edges: Vec::new(),
            comments: Vec::new(),
            branch_points: Vec::new(),
        };
        reader.read_document(root)?;
        reader.finish(mode)
    }
}

/// Document state buffered until every node exists.
struct Reader {
    target: Skeleton,
    summary: LoadSummary,
    parameters: Option<DocumentParameters>,
    time: Option<TimeValue>,
    active_node: Option<NodeId>,
    edges: Vec<(NodeId, NodeId)>,
    comments: Vec<(NodeId, String)>,
    branch_points: Vec<NodeId>,
}

/// The raw `<time>` parameter.
struct TimeValue {
    ms: Option<u64>,
    checksum: Option<u64>,
}

impl Reader {
    fn read_document(&mut self, root: XmlNode) -> NmlResult<()> {
        for child in root.children().filter(XmlNode::is_element) {
            match child.tag_name().name() {
                "parameters" => self.read_parameters(child)?,
                "thing" => self.read_thing(child)?,
                "comments" => {
                    for comment in elements(child, "comment") {
                        let node = self.node_id(required(comment, "node")?)?;
                        let content = comment.attribute("content").unwrap_or_default();
                        self.comments.push((node, content.to_string()));
                    }
                }
                "branchpoints" => {
                    for point in elements(child, "branchpoint") {
                        let node = self.node_id(required(point, "id")?)?;
                        self.branch_points.push(node);
                    }
                }
                other => log::debug!("Ignoring <{}> in NML document", other),
            }
        }
        Ok(())
    }

    fn read_parameters(&mut self, element: XmlNode) -> NmlResult<()> {
        let mut params = DocumentParameters::default();
        for child in element.children().filter(XmlNode::is_element) {
            match child.tag_name().name() {
                "experiment" => {
                    params.experiment = child.attribute("name").unwrap_or_default().to_string();
                }
                "createdin" => params.created_in = child.attribute("version").map(str::to_string),
                "lastsavedin" => {
                    params.last_saved_in = child.attribute("version").map(str::to_string);
                }
                "scale" => {
                    params.scale = Some(FloatCoordinate::new(
                        required(child, "x")?,
                        required(child, "y")?,
                        required(child, "z")?,
                    ));
                }
                "offset" => params.offset = Some(coordinate(child)?),
                "editPosition" => params.edit_position = Some(wire_coordinate(child)?),
                "time" => {
                    self.time = Some(TimeValue {
                        ms: optional(child, "ms")?,
                        checksum: optional(child, "checksum")?,
                    });
                }
                "activeNode" => self.active_node = Some(self.node_id(required(child, "id")?)?),
                _ => params.extra.push(raw_element(child)),
            }
        }
        self.parameters = Some(params);
        Ok(())
    }

    fn read_thing(&mut self, thing: XmlNode) -> NmlResult<()> {
        let raw_id: TreeId = required(thing, "id")?;
        let requested = if raw_id == 0 { 0 } else { self.tree_id(raw_id)? };
        if requested != 0 && self.target.find_tree_by_id(requested).is_some() {
            return Err(NmlError::DuplicateTree(raw_id));
        }
        let tree_id = self.target.insert_tree(requested, tree_color(thing)?)?;
        if let Some(tree) = self.target.trees.get_mut(&tree_id) {
            tree.comment = thing.attribute("comment").unwrap_or_default().to_string();
            tree.render = optional::<u8>(thing, "render")?.is_none_or(|flag| flag != 0);
        }
        self.summary.trees += 1;

        for child in thing.children().filter(XmlNode::is_element) {
            match child.tag_name().name() {
                "nodes" => {
                    for node in elements(child, "node") {
                        self.read_node(node, tree_id)?;
                    }
                }
                "edges" => {
                    for edge in elements(child, "edge") {
                        let source = self.node_id(required(edge, "source")?)?;
                        let target = self.node_id(required(edge, "target")?)?;
                        self.edges.push((source, target));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn read_node(&mut self, element: XmlNode, tree: TreeId) -> NmlResult<()> {
        let raw_id: NodeId = required(element, "id")?;
        if raw_id == 0 {
            return Err(invalid(element, "id", "0"));
        }
        let id = self.node_id(raw_id)?;
        if self.target.find_node_by_id(id).is_some() {
            return Err(NmlError::DuplicateNode(raw_id));
        }

        let mut new = NewNode::new(tree, wire_coordinate(element)?).with_id(id);
        new.radius = optional(element, "radius")?;
        new.viewport = optional(element, "inVp")?.unwrap_or(0);
        new.magnification = optional(element, "inMag")?.unwrap_or(1);
        new.timestamp = Some(optional(element, "time")?.unwrap_or(0));
        for attribute in element.attributes() {
            let name = attribute.name();
            if NODE_ATTRIBUTES.contains(&name) {
                continue;
            }
            if is_property_key(name) {
                new.properties.insert(name.to_string(), attribute.value().to_string());
            } else {
                log::warn!("Skipping attribute '{}' of node {}", name, raw_id);
            }
        }
        let subobject: Option<u64> = optional(element, "subobject")?;

        self.target.insert_node(new)?;
        if let (Some(subobject), Some(node)) = (subobject, self.target.nodes.get_mut(&id)) {
            node.subobject_id = Some(subobject);
        }
        self.summary.nodes += 1;
        Ok(())
    }

    /// Resolve the buffered references and hand back the finished store.
    fn finish(mut self, mode: LoadMode) -> NmlResult<(Skeleton, LoadSummary)> {
        for (source, target) in std::mem::take(&mut self.edges) {
            for end in [source, target] {
                if self.target.find_node_by_id(end).is_none() {
                    return Err(NmlError::UnknownNode(end - self.summary.node_offset));
                }
            }
            match self.target.link(source, target) {
                Ok(_) => self.summary.segments += 1,
                Err(err @ (SkeletonError::DuplicateSegment(..) | SkeletonError::SelfLoop(_))) => {
                    log::warn!("Skipping edge {} -> {}: {}", source, target, err);
                }
                Err(err) => return Err(err.into()),
            }
        }

        for (node, content) in std::mem::take(&mut self.comments) {
            if self.target.find_node_by_id(node).is_none() {
                log::warn!("Skipping comment on unknown node {}", node);
                continue;
            }
            if content.is_empty() {
                log::warn!("Skipping empty comment on node {}", node);
                continue;
            }
            self.target.write_comment(node, &content)?;
            self.summary.comments += 1;
        }

        for node in std::mem::take(&mut self.branch_points) {
            match self.target.push_branch_node(node) {
                Ok(()) => self.summary.branch_points += 1,
                Err(err) => log::warn!("Skipping branch point {}: {}", node, err),
            }
        }

        if mode == LoadMode::Replace {
            let mut params = self.parameters.take().unwrap_or_default();
            if params.experiment.is_empty() {
                params.experiment = self.target.config().experiment.clone();
            }
            let obfuscated = params.has_obfuscated_time();
            self.target.parameters = params;
            if let Some(time) = self.time.take() {
                self.target.set_annotation_time_ms(decode_time(&time, obfuscated));
            }
            if let Some(active) = self.active_node.filter(|id| self.target.nodes.contains_key(id)) {
                self.target.activate_node(active);
            }
        }
        Ok((self.target, self.summary))
    }

    fn node_id(&self, raw: NodeId) -> NmlResult<NodeId> {
        raw.checked_add(self.summary.node_offset)
            .ok_or(NmlError::Skeleton(SkeletonError::IdSpaceExhausted))
    }

    fn tree_id(&self, raw: TreeId) -> NmlResult<TreeId> {
        raw.checked_add(self.summary.tree_offset)
            .ok_or(NmlError::Skeleton(SkeletonError::IdSpaceExhausted))
    }
}

fn decode_time(time: &TimeValue, obfuscated: bool) -> u64 {
    match (obfuscated, time.checksum) {
        (true, Some(checksum)) => {
            let decoded = checksum ^ TIME_CHECKSUM_KEY;
            if time.ms.is_some_and(|ms| ms != decoded) {
                log::warn!("Annotation time does not match its checksum, using the checksum");
            }
            decoded
        }
        _ => time.ms.unwrap_or(0),
    }
}

fn elements<'a, 'input>(
    parent: XmlNode<'a, 'input>,
    name: &'static str,
) -> impl Iterator<Item = XmlNode<'a, 'input>> {
    parent
        .children()
        .filter(move |child| child.is_element() && child.tag_name().name() == name)
}

fn invalid(element: XmlNode, attribute: &str, value: &str) -> NmlError {
    NmlError::InvalidAttribute {
        element: element.tag_name().name().to_string(),
        attribute: attribute.to_string(),
        value: value.to_string(),
    }
}

fn optional<T: FromStr>(element: XmlNode, name: &'static str) -> NmlResult<Option<T>> {
    element
        .attribute(name)
        .map(|value| value.trim().parse().map_err(|_| invalid(element, name, value)))
        .transpose()
}

fn required<T: FromStr>(element: XmlNode, name: &'static str) -> NmlResult<T> {
    optional(element, name)?.ok_or_else(|| NmlError::MissingAttribute {
        element: element.tag_name().name().to_string(),
        attribute: name,
    })
}

fn coordinate(element: XmlNode) -> NmlResult<Coordinate> {
    Ok(Coordinate::new(
        required(element, "x")?,
        required(element, "y")?,
        required(element, "z")?,
    ))
}

/// A 1-based `x`/`y`/`z` triple, shifted to 0-based.
fn wire_coordinate(element: XmlNode) -> NmlResult<Coordinate> {
    let wire = coordinate(element)?;
    wire.from_wire().ok_or_else(|| {
        let axis = [("x", wire.x), ("y", wire.y), ("z", wire.z)]
            .into_iter()
            .find(|(_, value)| *value == i32::MIN)
            .unwrap_or(("x", wire.x));
        invalid(element, axis.0, &axis.1.to_string())
    })
}

/// A `-1` red channel (or no color at all) selects the palette color.
fn tree_color(thing: XmlNode) -> NmlResult<Option<TreeColor>> {
    let Some(r) = optional::<f32>(thing, "color.r")? else {
        return Ok(None);
    };
    if r < 0.0 {
        return Ok(None);
    }
    Ok(Some(TreeColor::new(
        r,
        optional(thing, "color.g")?.unwrap_or(0.0),
        optional(thing, "color.b")?.unwrap_or(0.0),
        optional(thing, "color.a")?.unwrap_or(1.0),
    )))
}

fn raw_element(element: XmlNode) -> RawElement {
    RawElement {
        name: element.tag_name().name().to_string(),
        attributes: element
            .attributes()
            .map(|a| (a.name().to_string(), a.value().to_string()))
            .collect(),
        text: element
            .children()
            .filter(XmlNode::is_text)
            .filter_map(|t| t.text())
            .map(str::trim)
            .find(|t| !t.is_empty())
            .map(str::to_string),
        children: element
            .children()
            .filter(XmlNode::is_element)
            .map(raw_element)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<things>
  <comments>
    <comment node="3" content="soma"/>
  </comments>
  <parameters>
    <experiment name="e2006"/>
    <createdin version="KNOSSOS 3.2"/>
    <time ms="5000"/>
    <activeNode id="3"/>
    <editPosition x="11" y="21" z="31"/>
    <skeletonVPState zoom="0.5"/>
  </parameters>
  <thing id="4" color.r="-1" color.g="-1" color.b="-1" color.a="-1" comment="axon">
    <nodes>
      <node id="3" radius="2.5" x="1" y="1" z="1" inVp="1" inMag="2" time="10" flavour="sweet"/>
      <node id="7" radius="1" x="11" y="1" z="1" inVp="0" inMag="1" time="11"/>
    </nodes>
    <edges>
      <edge source="3" target="7"/>
    </edges>
  </thing>
  <branchpoints>
    <branchpoint id="7"/>
  </branchpoints>
</things>"#;

    #[test]
    fn test_replace_load() {
        let mut skeleton = Skeleton::default();
        let summary = skeleton.load_nml(DOCUMENT, LoadMode::Replace).unwrap();
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.segments, 1);

        let node = skeleton.find_node_by_id(3).unwrap();
        assert_eq!(node.tree, 4);
        assert_eq!(node.position, Coordinate::new(0, 0, 0));
        assert_eq!(node.radius, 2.5);
        assert_eq!((node.viewport, node.magnification, node.timestamp), (1, 2, 10));
        assert_eq!(node.properties.get("flavour").map(String::as_str), Some("sweet"));
        assert_eq!(node.comment.as_deref(), Some("soma"));
        assert_eq!(skeleton.find_segment_between(3, 7).unwrap().length, 10.0);

        let tree = skeleton.find_tree_by_id(4).unwrap();
        assert!(!tree.custom_color);
        assert_eq!(tree.comment, "axon");
        assert_eq!(skeleton.branch_stack(), &[7]);
        assert_eq!(skeleton.active_node_id(), Some(3));

        let params = skeleton.parameters();
        assert_eq!(params.experiment, "e2006");
        assert_eq!(params.edit_position, Some(Coordinate::new(10, 20, 30)));
        assert_eq!(params.extra, vec![RawElement::new("skeletonVPState").with_attribute("zoom", "0.5")]);
        // Pre-3.4 documents store the time in the clear.
        assert!(skeleton.annotation_time_ms() >= 5000);
        skeleton.assert_consistent();
    }

    #[test]
    fn test_merge_shifts_ids() {
        let mut skeleton = Skeleton::default();
        let tree = skeleton.add_tree(0, None).unwrap();
        for x in 0..9 {
            skeleton
                .add_node(NewNode::new(tree, Coordinate::new(x, 0, 0)))
                .unwrap();
        }
        let active = skeleton.active_node_id();
        let summary = skeleton.load_nml(DOCUMENT, LoadMode::Merge).unwrap();
        assert_eq!((summary.node_offset, summary.tree_offset), (9, 1));

        assert_eq!(skeleton.find_node_by_id(12).unwrap().tree, 5);
        assert!(skeleton.find_segment_between(12, 16).is_some());
        assert_eq!(skeleton.nodes_with_comment("soma"), vec![12]);
        assert_eq!(skeleton.branch_stack(), &[16]);
        assert_eq!(skeleton.node_count(), 11);
        // Merging keeps the current selection and parameters.
        assert_eq!(skeleton.active_node_id(), active);
        assert!(skeleton.parameters().experiment.is_empty());
        skeleton.assert_consistent();
    }

    #[test]
    fn test_failed_load_is_atomic() {
        let mut skeleton = Skeleton::default();
        let tree = skeleton.add_tree(0, None).unwrap();
        skeleton.add_node(NewNode::new(tree, Coordinate::default())).unwrap();
        let revision = skeleton.revision();

        let dangling = r#"<things><thing id="1"><nodes>
            <node id="1" x="1" y="1" z="1"/></nodes>
            <edges><edge source="1" target="2"/></edges></thing></things>"#;
        assert!(matches!(
            skeleton.load_nml(dangling, LoadMode::Replace),
            Err(NmlError::UnknownNode(2))
        ));
        assert!(matches!(
            skeleton.load_nml("<things><thing id=\"1\">", LoadMode::Replace),
            Err(NmlError::Xml(_))
        ));
        assert!(matches!(
            skeleton.load_nml("<nml/>", LoadMode::Replace),
            Err(NmlError::WrongRoot(_))
        ));
        let duplicate = r#"<things><thing id="1"><nodes>
            <node id="1" x="1" y="1" z="1"/><node id="1" x="2" y="1" z="1"/>
            </nodes></thing></things>"#;
        assert!(matches!(
            skeleton.load_nml(duplicate, LoadMode::Replace),
            Err(NmlError::DuplicateNode(1))
        ));
        let bad_radius = r#"<things><thing id="1"><nodes>
            <node id="1" radius="wide" x="1" y="1" z="1"/></nodes></thing></things>"#;
        assert!(matches!(
            skeleton.load_nml(bad_radius, LoadMode::Replace),
            Err(NmlError::InvalidAttribute { .. })
        ));

        assert_eq!(skeleton.revision(), revision);
        assert_eq!(skeleton.node_count(), 1);
    }

    #[test]
    fn test_obfuscated_time_trusts_checksum() {
        let time = TimeValue { ms: Some(1), checksum: Some(42 ^ TIME_CHECKSUM_KEY) };
        assert_eq!(decode_time(&time, true), 42);
        assert_eq!(decode_time(&time, false), 1);
        let plain = TimeValue { ms: Some(7), checksum: None };
        assert_eq!(decode_time(&plain, true), 7);
    }

    #[test]
    fn test_empty_comment_is_skipped() {
        let document = r#"<things><thing id="1"><nodes>
            <node id="1" x="1" y="1" z="1"/><node id="2" x="2" y="1" z="1"/></nodes></thing>
            <comments><comment node="1" content=""/><comment node="2"/></comments></things>"#;
        let mut skeleton = Skeleton::default();
        let summary = skeleton.load_nml(document, LoadMode::Replace).unwrap();
        assert_eq!((summary.nodes, summary.comments), (2, 0));
        assert_eq!(skeleton.comment_count(), 0);
        assert!(skeleton.find_node_by_id(1).unwrap().comment.is_none());
    }

    #[test]
    fn test_out_of_range_coordinate_is_rejected() {
        let document = r#"<things><thing id="1"><nodes>
            <node id="1" x="1" y="-2147483648" z="1"/></nodes></thing></things>"#;
        let mut skeleton = Skeleton::default();
        match skeleton.load_nml(document, LoadMode::Replace) {
            Err(NmlError::InvalidAttribute { element, attribute, .. }) => {
                assert_eq!((element.as_str(), attribute.as_str()), ("node", "y"));
            }
            other => panic!("expected an invalid attribute, got {other:?}"),
        }
        let edit = r#"<things><parameters>
            <editPosition x="-2147483648" y="1" z="1"/></parameters></things>"#;
        assert!(matches!(
            skeleton.load_nml(edit, LoadMode::Replace),
            Err(NmlError::InvalidAttribute { .. })
        ));
        assert_eq!(skeleton.node_count(), 0);
    }

    #[test]
    fn test_unusable_attribute_names_are_not_properties() {
        let document = r#"<things><thing id="1"><nodes>
            <node id="1" x="1" y="1" z="1" kind="soma" x·y="2"/></nodes></thing></things>"#;
        let mut skeleton = Skeleton::default();
        skeleton.load_nml(document, LoadMode::Replace).unwrap();
        let properties = &skeleton.find_node_by_id(1).unwrap().properties;
        assert_eq!(properties.len(), 1);
        assert_eq!(properties.get("kind").map(String::as_str), Some("soma"));
    }

    #[test]
    fn test_dangling_comment_is_skipped() {
        let document = r#"<things><thing id="1"><nodes>
            <node id="1" x="1" y="1" z="1"/></nodes></thing>
            <comments><comment node="9" content="lost"/></comments></things>"#;
        let mut skeleton = Skeleton::default();
        let summary = skeleton.load_nml(document, LoadMode::Replace).unwrap();
        assert_eq!(summary.comments, 0);
        assert_eq!(skeleton.comment_count(), 0);
    }
}
