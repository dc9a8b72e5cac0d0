//! Analysis stage, template and provider configuration
//!
//! All structures deserialize from the camelCase YAML/JSON used in
//! application configs and the piped config.

use pipecd_common::{Duration, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File names searched for in the shared config directory
pub const TEMPLATE_FILE_NAMES: &[&str] = &["analysis-template.yaml", "analysis-template.yml"];
pub const TEMPLATE_KIND: &str = "AnalysisTemplate";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisStageOptions {
    /// Total budget of the stage, across restarts
    pub duration: Duration,
    pub metrics: Vec<TemplatableAnalysisMetrics>,
    pub logs: Vec<TemplatableAnalysisLog>,
    pub https: Vec<TemplatableAnalysisHttp>,
}

impl AnalysisStageOptions {
    pub fn validate(&self) -> Result<()> {
        if self.duration == Duration::ZERO {
            return Err(Error::invalid_argument("analysis duration must be set"));
        }
        for m in &self.metrics {
            if m.template.name.is_empty() {
                m.analysis.validate()?;
            }
        }
        for l in &self.logs {
            if l.template.name.is_empty() {
                check_interval(l.analysis.interval, "log")?;
            }
        }
        for h in &self.https {
            if h.template.name.is_empty() {
                check_interval(h.analysis.interval, "http")?;
            }
        }
        Ok(())
    }
}

fn check_interval(interval: Duration, what: &str) -> Result<()> {
    if interval == Duration::ZERO {
        return Err(Error::invalid_argument(format!("interval of {what} analysis must be set")));
    }
    Ok(())
}

/// Reference to a named entry of the analysis template
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisTemplateRef {
    pub name: String,
    /// Custom args overriding the application-wide ones
    pub app_args: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStrategy {
    #[default]
    Threshold,
    Previous,
    CanaryBaseline,
    CanaryPrimary,
}

/// Direction of a deviation that counts as a failure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisDeviation {
    #[default]
    Either,
    High,
    Low,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisExpected {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AnalysisExpected {
    pub fn validate(&self) -> Result<()> {
        if self.min.is_none() && self.max.is_none() {
            return Err(Error::invalid_argument("expected range needs min or max"));
        }
        Ok(())
    }

    /// Bounds are inclusive
    pub fn in_range(&self, value: f64) -> bool {
        self.min.is_none_or(|min| min <= value) && self.max.is_none_or(|max| value <= max)
    }
}

impl std::fmt::Display for AnalysisExpected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.min, self.max) {
            (Some(min), Some(max)) => write!(f, "{min} <= value <= {max}"),
            (Some(min), None) => write!(f, "{min} <= value"),
            (None, Some(max)) => write!(f, "value <= {max}"),
            (None, None) => f.write_str("any value"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisMetrics {
    pub strategy: AnalysisStrategy,
    pub provider: String,
    pub query: String,
    pub expected: AnalysisExpected,
    pub interval: Duration,
    pub failure_limit: u32,
    pub skip_on_no_data: bool,
    pub deviation: AnalysisDeviation,
    pub baseline_args: BTreeMap<String, String>,
    pub canary_args: BTreeMap<String, String>,
    pub primary_args: BTreeMap<String, String>,
    /// Per-query timeout
    pub timeout: Duration,
}

impl AnalysisMetrics {
    pub fn validate(&self) -> Result<()> {
        check_interval(self.interval, "metrics")?;
        if self.provider.is_empty() {
            return Err(Error::invalid_argument("metrics analysis needs a provider"));
        }
        if self.query.is_empty() {
            return Err(Error::invalid_argument("metrics analysis needs a query"));
        }
        if self.strategy == AnalysisStrategy::Threshold {
            self.expected.validate()?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisLog {
    pub provider: String,
    pub query: String,
    pub interval: Duration,
    pub failure_limit: u32,
    pub skip_on_no_data: bool,
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisHttp {
    pub url: String,
    pub method: String,
    pub custom_headers: Vec<HttpHeader>,
    pub expected_code: u16,
    /// Accepted for compatibility; responses are judged by status only
    pub expected_response: String,
    pub interval: Duration,
    pub failure_limit: u32,
    pub skip_on_no_data: bool,
    pub timeout: Duration,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplatableAnalysisMetrics {
    #[serde(flatten)]
    pub analysis: AnalysisMetrics,
    pub template: AnalysisTemplateRef,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplatableAnalysisLog {
    #[serde(flatten)]
    pub analysis: AnalysisLog,
    pub template: AnalysisTemplateRef,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplatableAnalysisHttp {
    #[serde(flatten)]
    pub analysis: AnalysisHttp,
    pub template: AnalysisTemplateRef,
}

/// Named probes shared by every application of a repository
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisTemplateSpec {
    pub metrics: BTreeMap<String, AnalysisMetrics>,
    pub logs: BTreeMap<String, AnalysisLog>,
    pub https: BTreeMap<String, AnalysisHttp>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateFile {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    spec: AnalysisTemplateSpec,
}

impl AnalysisTemplateSpec {
    /// Load the template from `dir`; `NotFound` when there is none
    pub fn load(dir: &Path) -> Result<Self> {
        for name in TEMPLATE_FILE_NAMES {
            let path = dir.join(name);
            let data = match std::fs::read_to_string(&path) {
                Ok(d) => d,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let file: TemplateFile = serde_yaml::from_str(&data)
                .map_err(|e| Error::invalid_argument(format!("invalid analysis template {}: {e}", path.display())))?;
            if file.kind != TEMPLATE_KIND {
                return Err(Error::invalid_argument(format!(
                    "{} has kind {:?}, want {TEMPLATE_KIND}",
                    path.display(),
                    file.kind
                )));
            }
            return Ok(file.spec);
        }
        Err(Error::not_found(format!("no analysis template in {}", dir.display())))
    }
}

// ---- Providers ----

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisProviderConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: AnalysisProviderKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisProviderKind {
    Prometheus(PrometheusConfig),
    Datadog(DatadogConfig),
    Stackdriver(StackdriverConfig),
}

impl AnalysisProviderKind {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Prometheus(_) => "PROMETHEUS",
            Self::Datadog(_) => "DATADOG",
            Self::Stackdriver(_) => "STACKDRIVER",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusConfig {
    pub address: String,
    pub username_file: String,
    pub password_file: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatadogConfig {
    /// Site such as `datadoghq.com`, or a full base URL
    pub address: String,
    pub api_key_file: String,
    pub application_key_file: String,
    /// Base64 encoded key, exclusive with `api_key_file`
    pub api_key_data: String,
    pub application_key_data: String,
}

impl DatadogConfig {
    pub fn validate(&self) -> Result<()> {
        let pairs = [
            ("API key", &self.api_key_file, &self.api_key_data),
            ("application key", &self.application_key_file, &self.application_key_data),
        ];
        for (what, file, data) in pairs {
            match (file.is_empty(), data.is_empty()) {
                (true, true) => return Err(Error::configuration(format!("datadog {what} is not set"))),
                (false, false) => {
                    return Err(Error::configuration(format!("datadog {what} is set both as a file and as data")));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackdriverConfig {
    pub service_account_file: String,
    /// Project whose logs are queried
    pub project: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stage_options() {
        let yaml = r#"
duration: 10m
metrics:
  - strategy: THRESHOLD
    provider: prom
    query: rate(errors[1m])
    expected:
      max: 0.01
    interval: 1m
    failureLimit: 2
  - template:
      name: http_error_rate
      appArgs:
        job: web
https:
  - url: http://canary/health
    expectedCode: 200
    interval: 30s
"#;
        let opts: AnalysisStageOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(opts.duration.as_std(), std::time::Duration::from_secs(600));
        assert_eq!(opts.metrics[0].analysis.failure_limit, 2);
        assert_eq!(opts.metrics[1].template.name, "http_error_rate");
        assert_eq!(opts.metrics[1].template.app_args["job"], "web");
        assert_eq!(opts.https[0].analysis.expected_code, 200);
        opts.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_interval() {
        let opts = AnalysisStageOptions {
            duration: Duration::from_secs(60),
            logs: vec![TemplatableAnalysisLog::default()],
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_expected_range_is_inclusive() {
        let e = AnalysisExpected { min: Some(1.0), max: Some(2.0) };
        assert!(e.in_range(1.0) && e.in_range(2.0));
        assert!(!e.in_range(0.9) && !e.in_range(2.1));
        assert!(AnalysisExpected::default().validate().is_err());
    }

    #[test]
    fn test_load_template() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AnalysisTemplateSpec::load(dir.path()).unwrap_err().is_not_found());

        std::fs::write(
            dir.path().join("analysis-template.yaml"),
            "kind: AnalysisTemplate\nspec:\n  metrics:\n    errors:\n      provider: prom\n      query: up{app=\"{{ .App.Name }}\"}\n      interval: 1m\n",
        )
        .unwrap();
        let spec = AnalysisTemplateSpec::load(dir.path()).unwrap();
        assert_eq!(spec.metrics["errors"].provider, "prom");

        std::fs::write(dir.path().join("analysis-template.yaml"), "kind: Application\n").unwrap();
        assert!(AnalysisTemplateSpec::load(dir.path()).is_err());
    }

    #[test]
    fn test_provider_config_tagging() {
        let yaml = "name: dd\ntype: DATADOG\nconfig:\n  apiKeyFile: /etc/dd/api\n  applicationKeyFile: /etc/dd/app\n";
        let p: AnalysisProviderConfig = serde_yaml::from_str(yaml).unwrap();
        let AnalysisProviderKind::Datadog(dd) = &p.kind else { panic!("not datadog") };
        dd.validate().unwrap();
        assert_eq!(p.kind.type_name(), "DATADOG");
    }
}
