//! Prometheus range queries over the HTTP API

use super::{DataPoint, MetricsProvider, QueryRange, check_response, http_error, read_secret};
use crate::config::PrometheusConfig;
use async_trait::async_trait;
use pipecd_common::{Error, Result};
use serde::Deserialize;
use serde_json::Value;

pub const PROVIDER_TYPE: &str = "PROMETHEUS";

/// Resolution requested from `query_range` is the range split in this many steps
const STEPS_PER_RANGE: i64 = 60;

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: Vec<Series>,
}

#[derive(Deserialize)]
struct Series {
    #[serde(default)]
    values: Vec<(f64, String)>,
    #[serde(default)]
    value: Option<(f64, String)>,
}

pub struct PrometheusProvider {
    http: reqwest::Client,
    address: String,
    basic_auth: Option<(String, String)>,
}

impl PrometheusProvider {
    pub fn from_config(cfg: &PrometheusConfig) -> Result<Self> {
        if cfg.address.is_empty() {
            return Err(Error::configuration("prometheus address must be set"));
        }
        let mut provider = Self::new(&cfg.address);
        if !cfg.username_file.is_empty() || !cfg.password_file.is_empty() {
            if cfg.username_file.is_empty() || cfg.password_file.is_empty() {
                return Err(Error::configuration("prometheus basic auth needs both usernameFile and passwordFile"));
            }
            provider.basic_auth = Some((read_secret(&cfg.username_file)?, read_secret(&cfg.password_file)?));
        }
        Ok(provider)
    }

    pub fn new(address: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            address: address.trim_end_matches('/').to_string(),
            basic_auth: None,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }
}

fn step_secs(range: QueryRange) -> i64 {
    ((range.to - range.from) / STEPS_PER_RANGE).max(1)
}

fn parse_points(data: QueryData) -> Result<Vec<DataPoint>> {
    let samples: Vec<(f64, String)> = match data.result_type.as_str() {
        "matrix" => data.result.into_iter().flat_map(|s| s.values).collect(),
        "vector" => data.result.into_iter().filter_map(|s| s.value).collect(),
        other => return Err(Error::unsupported(format!("prometheus result type {other} is not supported"))),
    };
    let mut points = Vec::with_capacity(samples.len());
    for (ts, raw) in samples {
        let value: f64 = raw
            .parse()
            .map_err(|_| Error::internal(format!("prometheus returned a non-numeric sample {raw:?}")))?;
        // A ratio over zero traffic evaluates to NaN; it carries no data.
        if value.is_nan() {
            continue;
        }
        points.push(DataPoint { timestamp: ts as i64, value });
    }
    Ok(points)
}

#[async_trait]
impl MetricsProvider for PrometheusProvider {
    fn provider_type(&self) -> &'static str {
        PROVIDER_TYPE
    }

    async fn query_points(&self, query: &str, range: QueryRange) -> Result<Vec<DataPoint>> {
        range.validate()?;
        let mut req = self
            .http
            .get(format!("{}/api/v1/query_range", self.address))
            .query(&[
                ("query", query.to_string()),
                ("start", range.from.to_string()),
                ("end", range.to.to_string()),
                ("step", step_secs(range).to_string()),
            ]);
        if let Some((user, password)) = &self.basic_auth {
            req = req.basic_auth(user, Some(password));
        }
        let resp = check_response(req.send().await.map_err(http_error)?, "prometheus query").await?;
        let body: Value = resp.json().await.map_err(http_error)?;
        let parsed: QueryResponse = serde_json::from_value(body)?;
        if parsed.status != "success" {
            return Err(Error::internal(format!("prometheus query failed: {}", parsed.error)));
        }
        let points = parse_points(
            parsed
                .data
                .ok_or_else(|| Error::internal("prometheus response has no data"))?,
        )?;
        if points.is_empty() {
            return Err(Error::not_found(format!("no data points for query {query:?}")));
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RANGE: QueryRange = QueryRange { from: 1_700_000_000, to: 1_700_000_600 };

    #[tokio::test]
    async fn test_query_range_matrix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .and(query_param("query", "up"))
            .and(query_param("start", "1700000000"))
            .and(query_param("step", "10"))
            // admin:secret
            .and(header("authorization", "Basic YWRtaW46c2VjcmV0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "matrix",
                    "result": [{"metric": {"job": "web"}, "values": [[1700000000.5, "1"], [1700000010, "NaN"], [1700000020, "0.25"]]}]
                }
            })))
            .mount(&server)
            .await;

        let provider = PrometheusProvider::new(&server.uri()).with_basic_auth("admin", "secret");
        let points = provider.query_points("up", RANGE).await.unwrap();
        assert_eq!(
            points,
            vec![
                DataPoint { timestamp: 1_700_000_000, value: 1.0 },
                DataPoint { timestamp: 1_700_000_020, value: 0.25 },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_result_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"resultType": "matrix", "result": []}
            })))
            .mount(&server)
            .await;
        let err = PrometheusProvider::new(&server.uri()).query_points("up", RANGE).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_bad_query_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "status": "error", "errorType": "bad_data", "error": "parse error"
            })))
            .mount(&server)
            .await;
        let err = PrometheusProvider::new(&server.uri()).query_points("up{", RANGE).await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("parse error"));
    }

    #[test]
    fn test_basic_auth_needs_both_files() {
        let cfg = PrometheusConfig {
            address: "http://prom".into(),
            username_file: "/etc/user".into(),
            ..Default::default()
        };
        assert!(PrometheusProvider::from_config(&cfg).is_err());
    }
}
