//! One probe driven by its own ticker
//!
//! The first tick fires one interval after start. Each tick either passes,
//! fails, is skipped for lack of data, or finishes the probe early. The
//! probe errors as soon as its failures exceed the failure limit.

use crate::config::{AnalysisDeviation, AnalysisMetrics, AnalysisStrategy};
use crate::executor::ResultStore;
use crate::mannwhitney::{self, Location};
use crate::provider::{HttpProbe, LogProvider, MetricsProvider, QueryRange};
use crate::template::{BASELINE_VARIANT, CANARY_VARIANT, PRIMARY_VARIANT, TemplateArgs};
use async_trait::async_trait;
use pipecd_common::model::now_unix;
use pipecd_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of a single tick
#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    Expected,
    Unexpected(String),
    /// Nothing left to evaluate; the probe ends as a pass
    Finished(String),
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Evaluate once; `NotFound` means the query returned no data
    async fn tick(&self) -> Result<Tick>;
}

pub struct Analyzer {
    pub id: String,
    pub interval: Duration,
    pub failure_limit: u32,
    pub skip_on_no_data: bool,
    /// Bound on one tick; zero leaves it unbounded
    pub timeout: Duration,
    pub probe: Box<dyn Probe>,
}

impl Analyzer {
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::invalid_argument(format!("analysis {} has no interval", self.id)));
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                r = self.tick_once() => r,
            };
            match result {
                Ok(Tick::Expected) => {
                    info!(analysis = %self.id, "query result is the expected one");
                    continue;
                }
                Ok(Tick::Finished(reason)) => {
                    info!(analysis = %self.id, reason = %reason, "analysis finished early");
                    return Ok(());
                }
                Ok(Tick::Unexpected(reason)) => {
                    warn!(analysis = %self.id, reason = %reason, "query result is not the expected one");
                }
                Err(e) if e.is_not_found() && self.skip_on_no_data => {
                    info!(analysis = %self.id, error = %e, "no data returned, skipping this evaluation");
                    continue;
                }
                Err(e) => {
                    warn!(analysis = %self.id, error = %e, "analysis query failed");
                }
            }
            failures += 1;
            metrics::counter!("analysis_failures_total", "kind" => self.probe.kind()).increment(1);
            if failures > self.failure_limit {
                return Err(Error::internal(format!(
                    "analysis {} failed because the failure number exceeded the failure limit ({})",
                    self.id, self.failure_limit
                )));
            }
        }
    }

    async fn tick_once(&self) -> Result<Tick> {
        if self.timeout.is_zero() {
            return self.probe.tick().await;
        }
        tokio::time::timeout(self.timeout, self.probe.tick())
            .await
            .map_err(|_| Error::deadline_exceeded(format!("analysis {} timed out after {:?}", self.id, self.timeout)))?
    }
}

// ---- Metrics ----

pub struct MetricsProbe {
    pub cfg: AnalysisMetrics,
    pub args: TemplateArgs,
    pub provider: Arc<dyn MetricsProvider>,
    pub results: Arc<dyn ResultStore>,
    /// Unix seconds the stage started, carried over restarts
    pub stage_start: i64,
}

impl MetricsProbe {
    fn window(&self, now: i64) -> QueryRange {
        QueryRange::ending_at(now, self.cfg.interval.as_std().as_secs() as i64)
    }

    async fn values(&self, query: &str, range: QueryRange) -> Result<Vec<f64>> {
        let points = self.provider.query_points(query, range).await?;
        Ok(points.into_iter().map(|p| p.value).collect())
    }

    async fn threshold(&self) -> Result<Tick> {
        self.cfg.expected.validate()?;
        let query = self.args.render(&self.cfg.query)?;
        let points = self.provider.query_points(&query, self.window(now_unix())).await?;
        if let Some(outlier) = points.iter().find(|p| !self.cfg.expected.in_range(p.value)) {
            return Ok(Tick::Unexpected(format!(
                "found a data point ({outlier}) outside the expected range ({}), query {query:?}",
                self.cfg.expected
            )));
        }
        Ok(Tick::Expected)
    }

    async fn previous(&self) -> Result<Tick> {
        let query = self.args.render(&self.cfg.query)?;
        let now = now_unix();
        let current = self.values(&query, self.window(now)).await?;

        let prev = match self.results.get_latest().await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => {
                return Ok(Tick::Finished(
                    "no previous successful analysis, this seems to be the first deployment".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };
        let elapsed = (now - self.stage_start).max(0);
        let prev_range = self.window(prev.start_time + elapsed);
        let previous = self.values(&query, prev_range).await?;
        compare(&current, &previous, self.cfg.deviation, &query)
    }

    async fn canary(&self, control: &str, control_args: &BTreeMap<String, String>) -> Result<Tick> {
        let range = self.window(now_unix());
        let canary_query = self.args.render_variant(&self.cfg.query, CANARY_VARIANT, &self.cfg.canary_args)?;
        let control_query = self.args.render_variant(&self.cfg.query, control, control_args)?;
        let canary = self.values(&canary_query, range).await?;
        let control_values = self.values(&control_query, range).await?;
        info!(canary = canary.len(), control = control_values.len(), variant = control, "got data points");
        compare(&canary, &control_values, self.cfg.deviation, &canary_query)
    }
}

fn compare(experiment: &[f64], control: &[f64], deviation: AnalysisDeviation, query: &str) -> Result<Tick> {
    let alt = match deviation {
        AnalysisDeviation::Either => Location::Differs,
        AnalysisDeviation::High => Location::Greater,
        AnalysisDeviation::Low => Location::Less,
    };
    if mannwhitney::accept(experiment, control, alt)? {
        Ok(Tick::Expected)
    } else {
        Ok(Tick::Unexpected(format!(
            "the difference between the medians is statistically significant, query {query:?}"
        )))
    }
}

#[async_trait]
impl Probe for MetricsProbe {
    fn kind(&self) -> &'static str {
        "metrics"
    }

    async fn tick(&self) -> Result<Tick> {
        match self.cfg.strategy {
            AnalysisStrategy::Threshold => self.threshold().await,
            AnalysisStrategy::Previous => self.previous().await,
            AnalysisStrategy::CanaryBaseline => self.canary(BASELINE_VARIANT, &self.cfg.baseline_args).await,
            AnalysisStrategy::CanaryPrimary => self.canary(PRIMARY_VARIANT, &self.cfg.primary_args).await,
        }
    }
}

// ---- Logs ----

pub struct LogProbe {
    pub query: String,
    pub interval: Duration,
    pub provider: Arc<dyn LogProvider>,
}

#[async_trait]
impl Probe for LogProbe {
    fn kind(&self) -> &'static str {
        "log"
    }

    async fn tick(&self) -> Result<Tick> {
        let range = QueryRange::ending_at(now_unix(), self.interval.as_secs() as i64);
        let summary = self.provider.evaluate(&self.query, range).await?;
        info!(provider = self.provider.provider_type(), summary = %summary, "log query passed");
        Ok(Tick::Expected)
    }
}

// ---- HTTP ----

#[async_trait]
impl Probe for HttpProbe {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn tick(&self) -> Result<Tick> {
        let (ok, reason) = self.probe().await?;
        Ok(if ok { Tick::Expected } else { Tick::Unexpected(format!("{}: {reason}", self.url())) })
    }
}
