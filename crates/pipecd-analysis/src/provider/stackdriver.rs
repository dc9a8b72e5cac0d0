//! Cloud Logging queries
//!
//! The query is a logging filter such as
//! `severity>=ERROR AND resource.labels.service_name="web"`. Every successful
//! query passes and reports how many entries matched within the range; only
//! transport, HTTP and decoding failures are errors.

use super::{LogProvider, QueryRange, check_response, http_error};
use crate::config::StackdriverConfig;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use pipecd_common::gcp::{SCOPE_CLOUD_PLATFORM, TokenSource};
use pipecd_common::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub const PROVIDER_TYPE: &str = "STACKDRIVER";
const LOGGING_BASE_URL: &str = "https://logging.googleapis.com";
const PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

pub struct StackdriverProvider {
    http: reqwest::Client,
    base_url: String,
    project: String,
    tokens: Arc<TokenSource>,
}

fn rfc3339(ts: i64) -> Result<String> {
    DateTime::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| Error::invalid_argument(format!("timestamp {ts} is out of range")))
}

/// Restrict `query` to the entries logged within `range`
pub fn range_filter(query: &str, range: QueryRange) -> Result<String> {
    Ok(format!(
        "({query}) AND timestamp>=\"{}\" AND timestamp<=\"{}\"",
        rfc3339(range.from)?,
        rfc3339(range.to)?
    ))
}

fn summary(matched: usize) -> String {
    match matched {
        0 => "no log entry matched".to_string(),
        n if n >= PAGE_SIZE => format!("found at least {n} log entries"),
        n => format!("found {n} log entries"),
    }
}

impl StackdriverProvider {
    pub fn from_config(cfg: &StackdriverConfig) -> Result<Self> {
        if cfg.project.is_empty() {
            return Err(Error::configuration("stackdriver project must be set"));
        }
        let tokens = TokenSource::new(&cfg.service_account_file, &[SCOPE_CLOUD_PLATFORM])?;
        Ok(Self::new(LOGGING_BASE_URL, &cfg.project, Arc::new(tokens)))
    }

    pub fn new(base_url: &str, project: &str, tokens: Arc<TokenSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            project: project.to_string(),
            tokens,
        }
    }
}

#[async_trait]
impl LogProvider for StackdriverProvider {
    fn provider_type(&self) -> &'static str {
        PROVIDER_TYPE
    }

    async fn evaluate(&self, query: &str, range: QueryRange) -> Result<String> {
        range.validate()?;
        let filter = range_filter(query, range)?;
        let token = self.tokens.token().await?;
        let resp = self
            .http
            .post(format!("{}/v2/entries:list", self.base_url))
            .bearer_auth(token)
            .json(&json!({
                "resourceNames": [format!("projects/{}", self.project)],
                "filter": filter,
                "pageSize": PAGE_SIZE,
            }))
            .send()
            .await
            .map_err(http_error)?;
        let parsed: ListResponse = check_response(resp, "stackdriver query").await?.json().await.map_err(http_error)?;
        Ok(summary(parsed.entries.len()))
    }
}
