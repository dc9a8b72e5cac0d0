//! Datadog timeseries queries

use super::{DataPoint, MetricsProvider, QueryRange, check_response, http_error, read_secret};
use crate::config::DatadogConfig;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pipecd_common::{Error, Result};
use serde::Deserialize;

pub const PROVIDER_TYPE: &str = "DATADOG";
pub const DEFAULT_ADDRESS: &str = "datadoghq.com";

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    series: Vec<Series>,
}

#[derive(Deserialize)]
struct Series {
    /// `[epoch millis, value]`, where the value is null for gaps
    #[serde(default)]
    pointlist: Vec<(f64, Option<f64>)>,
}

pub struct DatadogProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    application_key: String,
}

/// `datadoghq.eu` becomes `https://api.datadoghq.eu`; full URLs are kept
pub fn base_url(address: &str) -> String {
    let address = if address.is_empty() { DEFAULT_ADDRESS } else { address };
    if address.starts_with("http://") || address.starts_with("https://") {
        address.trim_end_matches('/').to_string()
    } else {
        format!("https://api.{address}")
    }
}

fn decode_key(data: &str, what: &str) -> Result<String> {
    let raw = STANDARD
        .decode(data.trim())
        .map_err(|e| Error::configuration(format!("datadog {what} is not valid base64: {e}")))?;
    String::from_utf8(raw)
        .map(|s| s.trim_end_matches(['\r', '\n']).to_string())
        .map_err(|_| Error::configuration(format!("datadog {what} is not valid utf-8")))
}

impl DatadogProvider {
    pub fn from_config(cfg: &DatadogConfig) -> Result<Self> {
        cfg.validate()?;
        let api_key = if cfg.api_key_file.is_empty() {
            decode_key(&cfg.api_key_data, "API key")?
        } else {
            read_secret(&cfg.api_key_file)?
        };
        let application_key = if cfg.application_key_file.is_empty() {
            decode_key(&cfg.application_key_data, "application key")?
        } else {
            read_secret(&cfg.application_key_file)?
        };
        Ok(Self::new(&cfg.address, api_key, application_key))
    }

    pub fn new(address: &str, api_key: impl Into<String>, application_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url(address),
            api_key: api_key.into(),
            application_key: application_key.into(),
        }
    }
}

#[async_trait]
impl MetricsProvider for DatadogProvider {
    fn provider_type(&self) -> &'static str {
        PROVIDER_TYPE
    }

    async fn query_points(&self, query: &str, range: QueryRange) -> Result<Vec<DataPoint>> {
        range.validate()?;
        let resp = self
            .http
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[
                ("from", range.from.to_string()),
                ("to", range.to.to_string()),
                ("query", query.to_string()),
            ])
            .header("DD-API-KEY", &self.api_key)
            .header("DD-APPLICATION-KEY", &self.application_key)
            .send()
            .await
            .map_err(http_error)?;
        let parsed: QueryResponse = check_response(resp, "datadog query").await?.json().await.map_err(http_error)?;
        if parsed.status == "error" {
            return Err(Error::internal(format!("datadog query failed: {}", parsed.error)));
        }
        let points: Vec<DataPoint> = parsed
            .series
            .into_iter()
            .flat_map(|s| s.pointlist)
            .filter_map(|(ms, value)| {
                value.map(|value| DataPoint {
                    timestamp: (ms / 1000.0) as i64,
                    value,
                })
            })
            .collect();
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

    const RANGE: QueryRange = QueryRange { from: 1_700_000_000, to: 1_700_000_060 };

    #[test]
    fn test_base_url() {
        assert_eq!(base_url(""), "https://api.datadoghq.com");
        assert_eq!(base_url("datadoghq.eu"), "https://api.datadoghq.eu");
        assert_eq!(base_url("http://127.0.0.1:8080/"), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_keys_from_data() {
        let cfg = DatadogConfig {
            api_key_data: STANDARD.encode("api\n"),
            application_key_data: STANDARD.encode("app"),
            ..Default::default()
        };
        let provider = DatadogProvider::from_config(&cfg).unwrap();
        assert_eq!(provider.api_key, "api");
        assert_eq!(provider.application_key, "app");
    }

    #[tokio::test]
    async fn test_query_points() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("from", "1700000000"))
            .and(query_param("to", "1700000060"))
            .and(header("DD-API-KEY", "api"))
            .and(header("DD-APPLICATION-KEY", "app"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "series": [{"pointlist": [[1700000000000.0, 0.5], [1700000030000.0, null], [1700000060000.0, 0.75]]}]
            })))
            .mount(&server)
            .await;

        let points = DatadogProvider::new(&server.uri(), "api", "app")
            .query_points("avg:errors{*}", RANGE)
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1], DataPoint { timestamp: 1_700_000_060, value: 0.75 });
    }

    #[tokio::test]
    async fn test_no_series_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "ok", "series": []})))
            .mount(&server)
            .await;
        let err = DatadogProvider::new(&server.uri(), "a", "b").query_points("q", RANGE).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bad key"))
            .mount(&server)
            .await;
        let err = DatadogProvider::new(&server.uri(), "a", "b").query_points("q", RANGE).await.unwrap_err();
        assert_eq!(err.kind(), pipecd_common::ErrorKind::PermissionDenied);
    }
}
