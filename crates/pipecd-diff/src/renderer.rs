use crate::result::{DiffNode, DiffResult, PathStep};
use serde_json::Value;
use std::fmt::Write;

/// Renders a [`DiffResult`] as YAML-like text
///
/// Every node starts with a `#<path>` comment; parents shared with the
/// previous node are not repeated. Removed values are marked `-` and added
/// values `+`.
#[derive(Clone, Debug, Default)]
pub struct Renderer {
    left_padding: usize,
    redact: Option<Redaction>,
}

#[derive(Clone, Debug)]
struct Redaction {
    prefix: String,
    replacement_x: String,
    replacement_y: String,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indent the whole output by `padding` levels of two spaces
    #[must_use]
    pub const fn with_left_padding(mut self, padding: usize) -> Self {
        self.left_padding = padding;
        self
    }

    /// Print the replacements instead of the values under `prefix`
    #[must_use]
    pub fn with_redact_path(
        mut self,
        prefix: impl Into<String>,
        replacement_x: impl Into<String>,
        replacement_y: impl Into<String>,
    ) -> Self {
        self.redact = Some(Redaction {
            prefix: prefix.into(),
            replacement_x: replacement_x.into(),
            replacement_y: replacement_y.into(),
        });
        self
    }

    pub fn render(&self, result: &DiffResult) -> String {
        let mut out = String::new();
        let mut prev: &[PathStep] = &[];
        for node in result.nodes() {
            self.render_node(&mut out, node, prev);
            prev = &node.path;
        }
        out
    }

    fn render_node(&self, out: &mut String, node: &DiffNode, prev: &[PathStep]) {
        let pad = self.left_padding;
        let shared = shared_depth(&node.path, prev);
        let _ = writeln!(out, "{:w$}#{}", "", node.path_string, w = (pad + shared) * 2);

        let parents = node.path.len().saturating_sub(1);
        let mut in_array = false;
        for (i, step) in node.path.iter().enumerate().take(parents).skip(shared) {
            match step {
                PathStep::SliceIndex(_) => {
                    let _ = write!(out, "{:w$}- ", "", w = (pad + i) * 2);
                    in_array = true;
                }
                PathStep::MapIndex(k) if in_array => {
                    let _ = writeln!(out, "{k}:");
                    in_array = false;
                }
                PathStep::MapIndex(k) => {
                    let _ = writeln!(out, "{:w$}{k}:", "", w = (pad + i) * 2);
                }
            }
        }

        let (x, y) = match &self.redact {
            Some(r) if node.path_string.starts_with(&r.prefix) => (
                Some(Value::String(r.replacement_x.clone())),
                Some(Value::String(r.replacement_y.clone())),
            ),
            _ => (node.value_x.clone(), node.value_y.clone()),
        };
        let depth = pad + node.path.len().max(1) - 1;
        let last = node.path.last();
        write_value(out, "-", x.as_ref(), last, depth);
        write_value(out, "+", y.as_ref(), last, depth);
    }
}

/// Length of the common prefix, or 0 when the paths do not diverge
fn shared_depth(x: &[PathStep], y: &[PathStep]) -> usize {
    x.iter().zip(y).position(|(a, b)| a != b).unwrap_or(0)
}

fn write_value(out: &mut String, mark: &str, v: Option<&Value>, last: Option<&PathStep>, depth: usize) {
    let Some((text, mut multiline)) = v.map(|v| render_value(v, "")) else {
        return;
    };
    if text.is_empty() {
        return;
    }
    let in_slice = matches!(last, Some(PathStep::SliceIndex(_)));
    if in_slice {
        multiline = false;
    }
    let head = (depth * 2).saturating_sub(1);
    let body = depth * 2 + 1;
    let key = last.map(ToString::to_string).unwrap_or_default();
    if in_slice {
        let _ = write!(out, "{mark}{:head$}- ", "");
    } else if multiline {
        let _ = writeln!(out, "{mark}{:head$}{key}:", "");
    } else {
        let _ = write!(out, "{mark}{:head$}{key}: ", "");
    }

    for (i, line) in text.split('\n').enumerate() {
        if (!in_slice && multiline) || (in_slice && i > 0) {
            let _ = writeln!(out, "{mark}{:body$}{line}", "");
        } else {
            let _ = writeln!(out, "{line}");
        }
    }
}

/// Text of a value and whether it spans several lines
fn render_value(v: &Value, prefix: &str) -> (String, bool) {
    let nested = format!("{prefix}  ");
    match v {
        Value::Null => (String::new(), false),
        Value::Bool(b) => (b.to_string(), false),
        Value::Number(n) => (n.to_string(), false),
        Value::String(s) => (s.clone(), false),
        Value::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let lines: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    let (sub, nl) = render_value(&m[k], &nested);
                    if nl {
                        format!("{prefix}{k}:\n{sub}")
                    } else {
                        format!("{prefix}{k}: {sub}")
                    }
                })
                .collect();
            if lines.is_empty() {
                return (String::new(), false);
            }
            (lines.join("\n"), true)
        }
        Value::Array(items) => {
            let mut lines = Vec::new();
            for item in items {
                let (sub, _) = render_value(item, &nested);
                for (i, part) in sub.split('\n').enumerate() {
                    let part = part.strip_prefix(nested.as_str()).unwrap_or(part);
                    if i == 0 {
                        lines.push(format!("{prefix}- {part}"));
                    } else {
                        lines.push(format!("{prefix}  {part}"));
                    }
                }
            }
            (lines.join("\n"), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiffOptions, diff};
    use serde_json::json;

    #[test]
    fn test_render_leaf_change() {
        let x = json!({"spec": {"replicas": 2}});
        let y = json!({"spec": {"replicas": 3}});
        let out = Renderer::new().render(&diff(&x, &y, &DiffOptions::default()));
        assert_eq!(out, "#spec.replicas\nspec:\n- replicas: 2\n+ replicas: 3\n");
    }

    #[test]
    fn test_render_shares_parents_and_pads() {
        let x = json!({"spec": {"a": "1", "b": "2"}});
        let y = json!({"spec": {"a": "x", "b": "y"}});
        let out = Renderer::new()
            .with_left_padding(1)
            .render(&diff(&x, &y, &DiffOptions::default()));
        let expected = "  #spec.a\n  spec:\n-   a: 1\n+   a: x\n    #spec.b\n-   b: 2\n+   b: y\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_render_added_slice_item_and_map() {
        let x = json!({"ports": [80]});
        let y = json!({"ports": [80, {"port": 443, "name": "https"}]});
        let out = Renderer::new().render(&diff(&x, &y, &DiffOptions::default()));
        assert_eq!(out, "#ports.1\nports:\n+ - name: https\n+   port: 443\n");
    }

    #[test]
    fn test_render_redacts_matching_paths() {
        let x = json!({"data": {"password": "old"}});
        let y = json!({"data": {"password": "new"}});
        let out = Renderer::new()
            .with_redact_path("data", "*****", "***** (changed)")
            .render(&diff(&x, &y, &DiffOptions::default()));
        assert!(!out.contains("old"));
        assert!(out.contains("- password: *****\n"));
        assert!(out.contains("+ password: ***** (changed)\n"));
    }

    #[test]
    fn test_render_empty_result() {
        let v = json!({"a": 1});
        assert_eq!(Renderer::new().render(&diff(&v, &v, &DiffOptions::default())), "");
    }
}
