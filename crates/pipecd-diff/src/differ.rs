use crate::result::{DiffNode, DiffResult, PathStep, path_string};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Clone, Debug, Default)]
pub struct DiffOptions {
    /// Keys only present in the second tree are not differences
    pub ignore_adding_map_keys: bool,
    /// Null, absent, zero and zero-length values are all equal
    pub equate_empty: bool,
    /// `1.5` equals `"1.5"`
    pub compare_number_and_numeric_string: bool,
    /// Path-string prefixes excluded from the comparison
    pub ignored_paths: Vec<String>,
}

impl DiffOptions {
    #[must_use]
    pub const fn ignore_adding_map_keys(mut self) -> Self {
        self.ignore_adding_map_keys = true;
        self
    }

    #[must_use]
    pub const fn equate_empty(mut self) -> Self {
        self.equate_empty = true;
        self
    }

    #[must_use]
    pub const fn compare_number_and_numeric_string(mut self) -> Self {
        self.compare_number_and_numeric_string = true;
        self
    }

    #[must_use]
    pub fn ignored_paths(mut self, paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ignored_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

/// Every position where `x` and `y` differ
pub fn diff(x: &Value, y: &Value, opts: &DiffOptions) -> DiffResult {
    let mut d = Differ {
        opts,
        result: DiffResult::default(),
    };
    let mut path = Vec::new();
    d.diff(&mut path, Some(x), Some(y));
    d.result.sort();
    d.result
}

struct Differ<'a> {
    opts: &'a DiffOptions,
    result: DiffResult,
}

fn is_empty(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Differ<'_> {
    fn ignored(&self, path: &[PathStep]) -> bool {
        if self.opts.ignored_paths.is_empty() {
            return false;
        }
        let s = path_string(path);
        self.opts.ignored_paths.iter().any(|p| s.starts_with(p.as_str()))
    }

    fn add(&mut self, path: &[PathStep], x: Option<&Value>, y: Option<&Value>) {
        self.result.push(DiffNode::new(path, x, y));
    }

    fn diff(&mut self, path: &mut Vec<PathStep>, x: Option<&Value>, y: Option<&Value>) {
        if self.ignored(path) {
            return;
        }
        if self.opts.equate_empty && is_empty(x) && is_empty(y) {
            return;
        }
        let (Some(vx), Some(vy)) = (x, y) else {
            self.add(path, x, y);
            return;
        };

        match (vx, vy) {
            (Value::Number(_), Value::Number(_)) => self.diff_number(path, vx, vy),
            (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_))
                if self.opts.compare_number_and_numeric_string
                    && as_number(vx).is_some()
                    && as_number(vy).is_some() =>
            {
                self.diff_number(path, vx, vy);
            }
            (Value::Object(mx), Value::Object(my)) => {
                let keys: BTreeSet<&String> = mx.keys().chain(my.keys()).collect();
                for k in keys {
                    let nx = mx.get(k);
                    if self.opts.ignore_adding_map_keys && nx.is_none() {
                        continue;
                    }
                    path.push(PathStep::MapIndex(k.clone()));
                    self.diff(path, nx, my.get(k));
                    path.pop();
                }
            }
            (Value::Array(ax), Value::Array(ay)) => {
                let common = ax.len().min(ay.len());
                for i in 0..ax.len().max(ay.len()) {
                    path.push(PathStep::SliceIndex(i));
                    if i < common {
                        self.diff(path, ax.get(i), ay.get(i));
                    } else if !self.ignored(path) {
                        self.add(path, ax.get(i), ay.get(i));
                    }
                    path.pop();
                }
            }
            _ if vx == vy => {}
            _ => self.add(path, x, y),
        }
    }

    #[allow(clippy::float_cmp)]
    fn diff_number(&mut self, path: &[PathStep], x: &Value, y: &Value) {
        if as_number(x) != as_number(y) {
            self.add(path, Some(x), Some(y));
        }
    }
}
