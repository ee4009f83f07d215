//! NML, the XML interchange format for skeleton annotations.
//!
//! A document has a `<things>` root holding one `<parameters>` block, one
//! `<thing>` per tree (with nested `<nodes>` and `<edges>`), a `<comments>`
//! block and a `<branchpoints>` block. Coordinates are 1-based on the wire.

mod read;
mod write;

pub use read::LoadSummary;

use crate::error::SkeletonError;
use crate::geometry::{Coordinate, FloatCoordinate};
use crate::skeleton::{NodeId, TreeId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version string written to `createdin` and `lastsavedin`.
pub const CREATOR_VERSION: &str = "skeletrace 3.4";

/// XOR key for the annotation time checksum.
pub const TIME_CHECKSUM_KEY: u64 = 1347211869;

/// First creator version whose documents carry an obfuscated time.
const OBFUSCATED_TIME_SINCE: (u32, u32) = (3, 4);

/// Node attributes with a dedicated field; everything else is a property.
pub(crate) const NODE_ATTRIBUTES: [&str; 9] =
    ["id", "radius", "x", "y", "z", "inVp", "inMag", "time", "subobject"];

/// Whether `key` can be written as a `<node>` attribute and read back as the
/// same property.
///
/// Dedicated node attributes, namespace-like names and anything that is not
/// an XML name are refused.
pub fn is_property_key(key: &str) -> bool {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && key != "xmlns"
        && !NODE_ATTRIBUTES.contains(&key)
}

/// How a document is combined with the current store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Clear the store and take every ID verbatim.
    Replace,
    /// Keep the store and shift every incoming ID past the current greatest.
    Merge,
}

/// Errors from reading an NML document. A failed load changes nothing.
#[derive(Debug, Error)]
pub enum NmlError {
    #[error("Malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("Expected <things> root, found <{0}>")]
    WrongRoot(String),
    #[error("<{element}> is missing attribute '{attribute}'")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },
    #[error("<{element}> has invalid {attribute}=\"{value}\"")]
    InvalidAttribute {
        element: String,
        attribute: String,
        value: String,
    },
    #[error("Node id {0} appears more than once")]
    DuplicateNode(NodeId),
    #[error("Tree id {0} appears more than once")]
    DuplicateTree(TreeId),
    #[error("Edge references unknown node {0}")]
    UnknownNode(NodeId),
    #[error(transparent)]
    Skeleton(#[from] SkeletonError),
}

/// Result type for NML operations.
pub type NmlResult<T> = Result<T, NmlError>;

/// An element under `<parameters>` this crate does not interpret.
///
/// Kept verbatim so viewer state written by other tools survives a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<RawElement>,
}

impl RawElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Document-level settings carried through load and save.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentParameters {
    pub experiment: String,
    /// Creator version of the tool that first wrote the document.
    pub created_in: Option<String>,
    /// Creator version of the tool that last wrote the document.
    pub last_saved_in: Option<String>,
    /// Voxel size in nanometres.
    pub scale: Option<FloatCoordinate>,
    pub offset: Option<Coordinate>,
    /// Viewer position, 0-based.
    pub edit_position: Option<Coordinate>,
    pub extra: Vec<RawElement>,
}

impl DocumentParameters {
    /// Version that decides how the document's time value is encoded.
    fn writer_version(&self) -> Option<&str> {
        self.last_saved_in.as_deref().or(self.created_in.as_deref())
    }

    /// Whether the document's time was written XOR-obfuscated.
    pub fn has_obfuscated_time(&self) -> bool {
        self.writer_version()
            .and_then(parse_version)
            .is_some_and(|version| version >= OBFUSCATED_TIME_SINCE)
    }
}

/// Extract `(major, minor)` from strings such as `"skeletrace 3.4"`,
/// `"KNOSSOS 4.1.2"` or `"3.4"`.
pub fn parse_version(text: &str) -> Option<(u32, u32)> {
    let numeric = text
        .split_whitespace()
        .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))?;
    let mut parts = numeric.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .unwrap_or(0);
    Some((major, minor))
}
