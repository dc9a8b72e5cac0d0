use pipecd_common::{Error, Result};
use regex::Regex;
use serde_json::Value;
use std::fmt;

/// One step from a parent node to a child
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PathStep {
    MapIndex(String),
    SliceIndex(usize),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapIndex(k) => f.write_str(k),
            Self::SliceIndex(i) => write!(f, "{i}"),
        }
    }
}

/// Dot-joined path, e.g. `spec.template.spec.containers.0.image`
pub fn path_string(path: &[PathStep]) -> String {
    path.iter().map(ToString::to_string).collect::<Vec<_>>().join(".")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueType {
    pub const fn of(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }
}

/// A differing position; a `None` side means the position is absent there
#[derive(Clone, Debug, PartialEq)]
pub struct DiffNode {
    pub path: Vec<PathStep>,
    pub path_string: String,
    pub type_x: Option<ValueType>,
    pub type_y: Option<ValueType>,
    pub value_x: Option<Value>,
    pub value_y: Option<Value>,
}

impl DiffNode {
    pub(crate) fn new(path: &[PathStep], x: Option<&Value>, y: Option<&Value>) -> Self {
        Self {
            path: path.to_vec(),
            path_string: path_string(path),
            type_x: x.map(ValueType::of),
            type_y: y.map(ValueType::of),
            value_x: x.cloned(),
            value_y: y.cloned(),
        }
    }
}

/// Differences ordered by path string
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffResult {
    nodes: Vec<DiffNode>,
}

impl DiffResult {
    pub(crate) fn push(&mut self, node: DiffNode) {
        self.nodes.push(node);
    }

    pub(crate) fn sort(&mut self) {
        self.nodes.sort_by(|a, b| a.path_string.cmp(&b.path_string));
    }

    pub fn nodes(&self) -> &[DiffNode] {
        &self.nodes
    }

    pub fn num(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_diff(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// First node whose path string matches `query`
    pub fn find(&self, query: &str) -> Result<&DiffNode> {
        let re = compile(query)?;
        self.nodes
            .iter()
            .find(|n| re.is_match(&n.path_string))
            .ok_or_else(|| Error::not_found(format!("no diff at {query}")))
    }

    pub fn find_all(&self, query: &str) -> Result<Vec<&DiffNode>> {
        let re = compile(query)?;
        Ok(self.nodes.iter().filter(|n| re.is_match(&n.path_string)).collect())
    }

    pub fn find_by_prefix(&self, prefix: &str) -> Vec<&DiffNode> {
        self.nodes.iter().filter(|n| n.path_string.starts_with(prefix)).collect()
    }
}

fn compile(query: &str) -> Result<Regex> {
    Regex::new(query).map_err(|e| Error::invalid_argument(format!("invalid path query {query:?}: {e}")))
}
