//! Google Cloud Storage driver over the JSON API

use crate::{ObjectAttrs, ObjectReader, Store, body_reader, check_response, http_error};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use pipecd_common::config::GcsConfig;
use pipecd_common::gcp::{SCOPE_DEVSTORAGE, TokenSource};
use pipecd_common::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;

const GCS_BASE_URL: &str = "https://storage.googleapis.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    /// Sizes are reported as decimal strings
    #[serde(default)]
    size: String,
    #[serde(default)]
    etag: String,
    #[serde(default)]
    updated: String,
}

pub struct GcsStore {
    http: reqwest::Client,
    base_url: String,
    bucket: String,
    tokens: Arc<TokenSource>,
}

impl GcsStore {
    pub fn from_config(cfg: &GcsConfig) -> Result<Self> {
        if cfg.bucket.is_empty() {
            return Err(Error::configuration("gcs bucket must be set"));
        }
        let tokens = TokenSource::new(&cfg.credentials_file, &[SCOPE_DEVSTORAGE])?;
        Ok(Self::new(GCS_BASE_URL, &cfg.bucket, Arc::new(tokens)))
    }

    pub fn new(base_url: &str, bucket: &str, tokens: Arc<TokenSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            tokens,
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            self.bucket,
            urlencoding::encode(path)
        )
    }

    async fn get_object(&self, path: &str) -> Result<reqwest::Response> {
        let token = self.tokens.token().await?;
        let resp = self
            .http
            .get(self.object_url(path))
            .query(&[("alt", "media")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(http_error)?;
        check_response(resp, path).await
    }
}

#[async_trait]
impl Store for GcsStore {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.get_object(path).await?.bytes().await.map_err(http_error)
    }

    async fn get_reader(&self, path: &str) -> Result<ObjectReader> {
        Ok(body_reader(self.get_object(path).await?))
    }

    async fn put(&self, path: &str, content: Bytes) -> Result<()> {
        let token = self.tokens.token().await?;
        let url = format!("{}/upload/storage/v1/b/{}/o", self.base_url, self.bucket);
        let resp = self
            .http
            .post(url)
            .query(&[("uploadType", "media"), ("name", path)])
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(content)
            .send()
            .await
            .map_err(http_error)?;
        check_response(resp, path).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let token = self.tokens.token().await?;
        let resp = self
            .http
            .delete(self.object_url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(http_error)?;
        check_response(resp, path).await.map(|_| ())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>> {
        let url = format!("{}/storage/v1/b/{}/o", self.base_url, self.bucket);
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = self.tokens.token().await?;
            let mut req = self.http.get(&url).bearer_auth(token).query(&[("prefix", prefix)]);
            if let Some(t) = &page_token {
                req = req.query(&[("pageToken", t.as_str())]);
            }
            let resp = check_response(req.send().await.map_err(http_error)?, prefix).await?;
            let page: ListResponse = resp.json().await.map_err(http_error)?;
            out.extend(page.items.into_iter().map(|o| ObjectAttrs {
                path: o.name,
                size: o.size.parse().unwrap_or_default(),
                etag: o.etag,
                updated_at: DateTime::parse_from_rfc3339(&o.updated)
                    .map(|t| t.timestamp())
                    .unwrap_or_default(),
            }));
            match page.next_page_token {
                Some(t) if !t.is_empty() => page_token = Some(t),
                _ => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> GcsStore {
        GcsStore::new(&server.uri(), "pipecd", Arc::new(TokenSource::fixed("tok")))
    }

    #[tokio::test]
    async fn test_gcs_list_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/pipecd/o"))
            .and(query_param("pageToken", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "command-output/b.json", "size": "7", "etag": "E2", "updated": "2024-01-01T00:00:00Z"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/pipecd/o"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "command-output/a.json", "size": "3", "etag": "E1", "updated": "2024-01-01T00:00:00Z"}],
                "nextPageToken": "next"
            })))
            .mount(&server)
            .await;

        let objects = store(&server).list("command-output/").await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].size, 3);
        assert_eq!(objects[1].etag, "E2");
        assert_eq!(objects[1].updated_at, 1_704_067_200);
    }

    #[tokio::test]
    async fn test_gcs_get_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        assert!(store(&server).get("nope.json").await.unwrap_err().is_not_found());
    }
}
