//! Provenance-bearing YAML trees.
//!
//! Everything the loader touches is a [`Node`]: a scalar, sequence or mapping
//! that remembers which file, line and column it came from. Scalars are kept
//! in their on-disk string form; typed accessors parse on demand and cite the
//! node's [`Provenance`] when the value has the wrong shape. Equality is
//! structural over values, provenance is metadata only.

use crate::error::{LoadError, Result};
use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::Arc,
};
use yaml_rust2::{
    emitter::YamlEmitter,
    parser::{Event, MarkedEventReceiver, Parser},
    scanner::{Marker, TScalarStyle},
    yaml::{Hash, Yaml},
};

pub mod composite;
pub mod expression;

pub use composite::{
    compose, resolve_directives, resolve_pending_lists, IncludeResolver, NoIncludes,
};

/// Where a node came from. The file name is shared between all nodes of one
/// document, so cloning a provenance is two pointer-sized copies.
#[derive(Clone, Debug)]
pub struct Provenance {
    file: Arc<str>,
    line: u32,
    col: u32,
}

impl Provenance {
    pub fn new(file: Arc<str>, line: u32, col: u32) -> Self {
        Self { file, line, col }
    }

    /// Provenance for values produced by the core rather than read from disk.
    pub fn synthetic(origin: &str) -> Self {
        Self { file: Arc::from(origin), line: 0, col: 0 }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{} [line {} column {}]", self.file, self.line, self.col)
        }
    }
}

/// The value part of a node.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Scalar(String),
    Sequence(Vec<Node>),
    Mapping(BTreeMap<String, Node>),
}

#[derive(Clone, Debug)]
pub struct Node {
    value: Value,
    provenance: Provenance,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Node {
    pub fn new(value: Value, provenance: Provenance) -> Self {
        Self { value, provenance }
    }

    pub fn scalar(value: impl Into<String>, provenance: Provenance) -> Self {
        Self::new(Value::Scalar(value.into()), provenance)
    }

    pub fn sequence(items: Vec<Node>, provenance: Provenance) -> Self {
        Self::new(Value::Sequence(items), provenance)
    }

    pub fn mapping(map: BTreeMap<String, Node>, provenance: Provenance) -> Self {
        Self::new(Value::Mapping(map), provenance)
    }

    /// An empty mapping attributed to the core.
    pub fn empty(origin: &str) -> Self {
        Self::mapping(BTreeMap::new(), Provenance::synthetic(origin))
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub(crate) fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn is_mapping(&self) -> bool {
        matches!(self.value, Value::Mapping(_))
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self.value, Value::Sequence(_))
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match &self.value {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Node]> {
        match &self.value {
            Value::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.value {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match &mut self.value {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn expect_scalar(&self) -> Result<&str, LoadError> {
        self.as_scalar().ok_or_else(|| {
            load_error!(ExpectedScalar, self.provenance.clone(), "expected a scalar value")
        })
    }

    pub fn expect_sequence(&self) -> Result<&[Node], LoadError> {
        self.as_sequence().ok_or_else(|| {
            load_error!(ExpectedSequence, self.provenance.clone(), "expected a list")
        })
    }

    pub fn expect_mapping(&self) -> Result<&BTreeMap<String, Node>, LoadError> {
        self.as_mapping().ok_or_else(|| {
            load_error!(ExpectedMapping, self.provenance.clone(), "expected a mapping")
        })
    }

    /// Looks up a direct child of a mapping node.
    pub fn get(&self, key: &str) -> Option<&Node> {
        self.as_mapping().and_then(|m| m.get(key))
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.as_mapping_mut().and_then(|m| m.get_mut(key))
    }

    /// Looks up a required child, failing with the mapping's provenance.
    pub fn get_node(&self, key: &str) -> Result<&Node, LoadError> {
        let map = self.expect_mapping()?;
        map.get(key).ok_or_else(|| {
            load_error!(MissingKey, self.provenance.clone(), "missing required key '{key}'")
        })
    }

    pub fn get_str(&self, key: &str) -> Result<&str, LoadError> {
        self.get_node(key)?.expect_scalar()
    }

    pub fn get_str_opt(&self, key: &str) -> Result<Option<&str>, LoadError> {
        match self.get(key) {
            Some(node) => Ok(Some(node.expect_scalar()?)),
            None => Ok(None),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, LoadError> {
        match self.get(key) {
            Some(node) => node.parse_bool(),
            None => Ok(default),
        }
    }

    pub fn parse_bool(&self) -> Result<bool, LoadError> {
        match self.expect_scalar()? {
            "true" | "True" => Ok(true),
            "false" | "False" => Ok(false),
            other => Err(load_error!(
                ExpectedBool,
                self.provenance.clone(),
                "expected a boolean, not '{other}'"
            )),
        }
    }

    pub fn parse_int(&self) -> Result<i64, LoadError> {
        let s = self.expect_scalar()?;
        s.parse().map_err(|_| {
            load_error!(ExpectedInt, self.provenance.clone(), "expected an integer, not '{s}'")
        })
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, LoadError> {
        match self.get(key) {
            Some(node) => node.parse_int(),
            None => Ok(default),
        }
    }

    /// A required list of scalars.
    pub fn get_str_list(&self, key: &str) -> Result<Vec<String>, LoadError> {
        let mut out = Vec::new();
        for item in self.get_node(key)?.expect_sequence()? {
            out.push(item.expect_scalar()?.to_string());
        }
        Ok(out)
    }

    /// An optional list of scalars, empty when the key is absent.
    pub fn get_str_list_opt(&self, key: &str) -> Result<Vec<String>, LoadError> {
        match self.get(key) {
            Some(node) => {
                let mut out = Vec::new();
                for item in node.expect_sequence()? {
                    out.push(item.expect_scalar()?.to_string());
                }
                Ok(out)
            }
            None => Ok(Vec::new()),
        }
    }

    /// An optional mapping from string to string, empty when absent.
    pub fn get_str_map_opt(&self, key: &str) -> Result<BTreeMap<String, String>, LoadError> {
        let mut out = BTreeMap::new();
        if let Some(node) = self.get(key) {
            for (k, v) in node.expect_mapping()? {
                out.insert(k.clone(), v.expect_scalar()?.to_string());
            }
        }
        Ok(out)
    }

    /// Rejects keys outside the allowed set. Run after directive resolution,
    /// when only semantic keys remain.
    pub fn validate_keys(&self, allowed: &[&str]) -> Result<(), LoadError> {
        for (key, child) in self.expect_mapping()? {
            if !allowed.contains(&key.as_str()) {
                return Err(load_error!(
                    UnknownKey,
                    child.provenance().clone(),
                    "unexpected key '{key}'"
                ));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, key: impl Into<String>, node: Node) {
        if let Some(map) = self.as_mapping_mut() {
            map.insert(key.into(), node);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Node> {
        self.as_mapping_mut().and_then(|m| m.remove(key))
    }

    /// Converts to a plain json value; mapping keys keep their sorted order.
    /// This is the form the cache-key engine canonicalizes.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.value {
            Value::Scalar(s) => serde_json::Value::String(s.clone()),
            Value::Sequence(items) => {
                serde_json::Value::Array(items.iter().map(Node::to_json).collect())
            }
            Value::Mapping(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// Loads a single YAML document from a string.
///
/// `shortname` is the name recorded in provenance, conventionally the
/// project-relative path of the file.
pub fn load_string(content: &str, shortname: &str) -> Result<Node, LoadError> {
    let file: Arc<str> = Arc::from(shortname);
    let mut builder = NodeBuilder::new(file.clone());
    let mut parser = Parser::new_from_str(content);
    parser.load(&mut builder, false).map_err(|e| {
        load_error!(InvalidYaml, Provenance::new(file.clone(), 0, 0), "malformed YAML: {e}")
    })?;
    if let Some(err) = builder.error {
        return Err(err);
    }
    Ok(builder
        .root
        .unwrap_or_else(|| Node::mapping(BTreeMap::new(), Provenance::new(file, 1, 1))))
}

/// Loads a single YAML document from a file on disk.
pub fn load(path: &Path, shortname: &str) -> Result<Node> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::error::Error::from(crate::error::IoError::new(e, path))
    })?;
    Ok(load_string(&content, shortname)?)
}

/// Serializes a node back to YAML text. Used when tracking writes new refs
/// into element files.
pub fn dump(node: &Node) -> Result<String, LoadError> {
    let yaml = to_yaml(node);
    let mut out = String::new();
    let mut emitter = YamlEmitter::new(&mut out);
    emitter.dump(&yaml).map_err(|e| {
        load_error!(InvalidYaml, node.provenance().clone(), "cannot serialize node: {e:?}")
    })?;
    // The emitter prefixes documents with the `---` marker; project files
    // conventionally omit it.
    let out = out.strip_prefix("---\n").unwrap_or(&out).to_string();
    Ok(out)
}

fn to_yaml(node: &Node) -> Yaml {
    match node.value() {
        Value::Scalar(s) => Yaml::String(s.clone()),
        Value::Sequence(items) => Yaml::Array(items.iter().map(to_yaml).collect()),
        Value::Mapping(map) => {
            let mut hash = Hash::new();
            for (k, v) in map {
                hash.insert(Yaml::String(k.clone()), to_yaml(v));
            }
            Yaml::Hash(hash)
        }
    }
}

/// Builds the node tree directly from marked parser events.
struct NodeBuilder {
    file: Arc<str>,
    stack: Vec<Frame>,
    root: Option<Node>,
    error: Option<LoadError>,
}

enum Frame {
    Mapping { map: BTreeMap<String, Node>, pending_key: Option<String>, provenance: Provenance },
    Sequence { items: Vec<Node>, provenance: Provenance },
}

impl NodeBuilder {
    fn new(file: Arc<str>) -> Self {
        Self { file, stack: Vec::new(), root: None, error: None }
    }

    fn provenance(&self, mark: Marker) -> Provenance {
        Provenance::new(self.file.clone(), mark.line() as u32, mark.col() as u32 + 1)
    }

    fn push_value(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(Frame::Sequence { items, .. }) => items.push(node),
            Some(Frame::Mapping { map, pending_key, provenance }) => {
                match pending_key.take() {
                    Some(key) => {
                        if map.insert(key.clone(), node).is_some() {
                            self.error.get_or_insert(load_error!(
                                InvalidYaml,
                                provenance.clone(),
                                "duplicate mapping key '{key}'"
                            ));
                        }
                    }
                    None => match node.as_scalar() {
                        Some(key) => *pending_key = Some(key.to_string()),
                        None => {
                            self.error.get_or_insert(load_error!(
                                InvalidYaml,
                                node.provenance().clone(),
                                "mapping keys must be plain strings"
                            ));
                        }
                    },
                }
            }
            None => self.root = Some(node),
        }
    }
}

impl MarkedEventReceiver for NodeBuilder {
    fn on_event(&mut self, event: Event, mark: Marker) {
        if self.error.is_some() {
            return;
        }
        match event {
            Event::Scalar(value, style, _anchor, _tag) => {
                // A plain null (`~`, `null` or nothing at all) becomes the
                // empty string; quoted forms stay verbatim.
                let value = if style == TScalarStyle::Plain
                    && matches!(value.as_str(), "~" | "null" | "Null" | "NULL")
                {
                    String::new()
                } else {
                    value
                };
                let prov = self.provenance(mark);
                self.push_value(Node::scalar(value, prov));
            }
            Event::SequenceStart(_, _) => {
                let provenance = self.provenance(mark);
                self.stack.push(Frame::Sequence { items: Vec::new(), provenance });
            }
            Event::MappingStart(_, _) => {
                let provenance = self.provenance(mark);
                self.stack.push(Frame::Mapping {
                    map: BTreeMap::new(),
                    pending_key: None,
                    provenance,
                });
            }
            Event::SequenceEnd | Event::MappingEnd => {
                let node = match self.stack.pop() {
                    Some(Frame::Sequence { items, provenance }) => {
                        Node::sequence(items, provenance)
                    }
                    Some(Frame::Mapping { map, provenance, .. }) => Node::mapping(map, provenance),
                    None => return,
                };
                self.push_value(node);
            }
            Event::Alias(_) => {
                self.error.get_or_insert(load_error!(
                    InvalidYaml,
                    self.provenance(mark),
                    "YAML anchors and aliases are not supported"
                ));
            }
            Event::DocumentStart | Event::DocumentEnd | Event::StreamStart | Event::StreamEnd
            | Event::Nothing => {}
        }
    }
}
