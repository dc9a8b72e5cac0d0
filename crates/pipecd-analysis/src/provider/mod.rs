//! Analysis providers
//!
//! Metrics providers return the data points of a query over a time range;
//! an empty result is `NotFound` so callers can honour `skipOnNoData`. Log
//! providers pass on any successful query and fail only when the query
//! itself cannot be run.

pub mod datadog;
pub mod http;
pub mod prometheus;
pub mod stackdriver;

use crate::config::{AnalysisProviderConfig, AnalysisProviderKind};
use async_trait::async_trait;
use pipecd_common::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use datadog::DatadogProvider;
pub use http::HttpProbe;
pub use prometheus::PrometheusProvider;
pub use stackdriver::StackdriverProvider;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DataPoint {
    /// Unix seconds
    pub timestamp: i64,
    pub value: f64,
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timestamp: {}, value: {}", self.timestamp, self.value)
    }
}

/// Closed time range in unix seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryRange {
    pub from: i64,
    pub to: i64,
}

impl QueryRange {
    /// The `len_secs` seconds ending at `to`
    pub const fn ending_at(to: i64, len_secs: i64) -> Self {
        Self { from: to - len_secs, to }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from >= self.to {
            return Err(Error::invalid_argument(format!(
                "query range start {} must be before its end {}",
                self.from, self.to
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    fn provider_type(&self) -> &'static str;

    /// Points of `query` within `range`; `NotFound` when there are none
    async fn query_points(&self, query: &str, range: QueryRange) -> Result<Vec<DataPoint>>;
}

#[async_trait]
pub trait LogProvider: Send + Sync {
    fn provider_type(&self) -> &'static str;

    /// Evaluate `query` over `range`; any `Ok` is a pass and carries a summary
    async fn evaluate(&self, query: &str, range: QueryRange) -> Result<String>;
}

/// Providers declared in the piped config, by name
#[derive(Default)]
pub struct ProviderRegistry {
    metrics: BTreeMap<String, Arc<dyn MetricsProvider>>,
    logs: BTreeMap<String, Arc<dyn LogProvider>>,
}

impl ProviderRegistry {
    pub fn from_configs(configs: &[AnalysisProviderConfig]) -> Result<Self> {
        let mut registry = Self::default();
        for cfg in configs {
            if registry.metrics.contains_key(&cfg.name) || registry.logs.contains_key(&cfg.name) {
                return Err(Error::configuration(format!("analysis provider {} is declared twice", cfg.name)));
            }
            match &cfg.kind {
                AnalysisProviderKind::Prometheus(c) => {
                    registry.add_metrics(&cfg.name, Arc::new(PrometheusProvider::from_config(c)?));
                }
                AnalysisProviderKind::Datadog(c) => {
                    registry.add_metrics(&cfg.name, Arc::new(DatadogProvider::from_config(c)?));
                }
                AnalysisProviderKind::Stackdriver(c) => {
                    registry.add_log(&cfg.name, Arc::new(StackdriverProvider::from_config(c)?));
                }
            }
        }
        Ok(registry)
    }

    pub fn add_metrics(&mut self, name: &str, provider: Arc<dyn MetricsProvider>) -> &mut Self {
        self.metrics.insert(name.to_string(), provider);
        self
    }

    pub fn add_log(&mut self, name: &str, provider: Arc<dyn LogProvider>) -> &mut Self {
        self.logs.insert(name.to_string(), provider);
        self
    }

    pub fn metrics_provider(&self, name: &str) -> Result<Arc<dyn MetricsProvider>> {
        self.metrics
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("metrics provider {name} is not configured")))
    }

    pub fn log_provider(&self, name: &str) -> Result<Arc<dyn LogProvider>> {
        self.logs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("log provider {name} is not configured")))
    }
}

/// Read a credential file, trimming the trailing newline editors add
pub(crate) fn read_secret(path: &str) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::configuration(format!("failed to read {path}: {e}")))?;
    Ok(raw.trim_end_matches(['\r', '\n']).to_string())
}

pub(crate) async fn check_response(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        401 => Error::unauthenticated(format!("{what}: {body}")),
        403 => Error::permission_denied(format!("{what}: {body}")),
        404 => Error::not_found(format!("{what}: {body}")),
        _ => Error::internal(format!("{what}: unexpected status {status}: {body}")),
    })
}

pub(crate) fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::deadline_exceeded(e.to_string())
    } else {
        Error::internal(e.to_string())
    }
}
