//! `{{ .Path }}` substitution in queries, URLs and headers
//!
//! Supported paths are `App.Name`, `App.Env`, `K8s.Namespace`,
//! `Variant.Name`, `AppCustomArgs.<key>` and `VariantCustomArgs.<key>`.
//! Anything else, including a custom arg that is not set, is an error.

use pipecd_common::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_-]+)*)\s*-?\}\}").unwrap_or_else(|e| {
        unreachable!("placeholder pattern is valid: {e}")
    })
});

pub const CANARY_VARIANT: &str = "canary";
pub const BASELINE_VARIANT: &str = "baseline";
pub const PRIMARY_VARIANT: &str = "primary";

/// Custom arg holding the Kubernetes namespace of the application
pub const K8S_NAMESPACE_ARG: &str = "k8sNamespace";

/// Deployment-wide values available to every probe
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TemplateArgs {
    pub app_name: String,
    pub app_env: String,
    pub k8s_namespace: String,
    pub app_custom_args: BTreeMap<String, String>,
}

impl TemplateArgs {
    pub fn new(app_name: impl Into<String>, app_env: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_env: app_env.into(),
            ..Default::default()
        }
    }

    /// Layer probe-level args over the application-wide ones
    pub fn with_app_args(&self, overrides: &BTreeMap<String, String>) -> Self {
        let mut args = self.clone();
        for (k, v) in overrides {
            args.app_custom_args.insert(k.clone(), v.clone());
        }
        if let Some(ns) = args.app_custom_args.get(K8S_NAMESPACE_ARG) {
            args.k8s_namespace = ns.clone();
        }
        args
    }

    pub fn render(&self, input: &str) -> Result<String> {
        render(input, self, None)
    }

    /// Render for one variant of a canary comparison
    pub fn render_variant(&self, input: &str, variant: &str, variant_args: &BTreeMap<String, String>) -> Result<String> {
        render(input, self, Some((variant, variant_args)))
    }
}

fn render(input: &str, args: &TemplateArgs, variant: Option<(&str, &BTreeMap<String, String>)>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(input) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&input[last..whole.start()]);
        out.push_str(lookup(path.as_str(), args, variant)?);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn lookup<'a>(
    path: &str,
    args: &'a TemplateArgs,
    variant: Option<(&'a str, &'a BTreeMap<String, String>)>,
) -> Result<&'a str> {
    let missing = || Error::invalid_argument(format!("template value .{path} is not available"));
    let value = match path.split_once('.') {
        Some(("App", "Name")) => args.app_name.as_str(),
        Some(("App", "Env")) => args.app_env.as_str(),
        Some(("K8s", "Namespace")) => args.k8s_namespace.as_str(),
        Some(("Variant", "Name")) => variant.ok_or_else(missing)?.0,
        Some(("AppCustomArgs", key)) => args.app_custom_args.get(key).ok_or_else(missing)?.as_str(),
        Some(("VariantCustomArgs", key)) => variant.and_then(|(_, v)| v.get(key)).ok_or_else(missing)?.as_str(),
        _ => return Err(missing()),
    };
    Ok(value)
}
