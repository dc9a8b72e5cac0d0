//! S3 REST client and the S3 driver
//!
//! Requests are signed with SigV4. Listing uses ListObjectsV2 and follows
//! continuation tokens until the result is no longer truncated.

use crate::{ObjectAttrs, ObjectReader, Store, body_reader, check_response, http_error};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use pipecd_common::config::S3Config;
use pipecd_common::sigv4::{Credentials, SigV4Signer, encode_key_path};
use pipecd_common::{Error, Result};
use reqwest::{Method, Url};
use serde::Deserialize;
use tracing::debug;

/// Addressing style of bucket URLs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Addressing {
    /// `https://<bucket>.s3.<region>.amazonaws.com/<key>`
    VirtualHost,
    /// `<endpoint>/<bucket>/<key>`
    Path,
}

/// Low-level S3 client bound to one bucket
#[derive(Clone)]
pub struct S3Client {
    http: reqwest::Client,
    endpoint: Url,
    bucket: String,
    addressing: Addressing,
    signer: SigV4Signer,
    credentials: Credentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    is_truncated: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
    #[serde(default)]
    contents: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "ETag", default)]
    etag: String,
    #[serde(default)]
    last_modified: String,
}

impl S3Client {
    pub fn new(
        endpoint: &str,
        bucket: impl Into<String>,
        region: &str,
        addressing: Addressing,
        credentials: Credentials,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::configuration(format!("invalid endpoint {endpoint}: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            bucket: bucket.into(),
            addressing,
            signer: SigV4Signer::new(region, "s3"),
            credentials,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn url(&self, key: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        match self.addressing {
            Addressing::Path => {
                let path = if key.is_empty() {
                    format!("/{}", self.bucket)
                } else {
                    format!("/{}/{}", self.bucket, encode_key_path(key))
                };
                url.set_path(&path);
            }
            Addressing::VirtualHost => {
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::configuration("endpoint has no host"))?
                    .to_string();
                url.set_host(Some(&format!("{}.{host}", self.bucket)))
                    .map_err(|e| Error::configuration(format!("invalid bucket host: {e}")))?;
                url.set_path(&format!("/{}", encode_key_path(key)));
            }
        }
        if !query.is_empty() {
            let q = query
                .iter()
                .map(|(k, v)| format!("{}={}", pipecd_common::sigv4::uri_encode(k), pipecd_common::sigv4::uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            url.set_query(Some(&q));
        }
        Ok(url)
    }

    async fn send(&self, method: Method, url: Url, body: Bytes) -> Result<reqwest::Response> {
        let mut headers = HeaderMap::new();
        self.signer.sign(
            &self.credentials,
            method.as_str(),
            &url,
            &mut headers,
            &body,
            Utc::now(),
        )?;
        debug!(%method, %url, "s3 request");
        self.http
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(http_error)
    }

    pub async fn get_object(&self, key: &str) -> Result<reqwest::Response> {
        let url = self.url(key, &[])?;
        let resp = self.send(Method::GET, url, Bytes::new()).await?;
        check_response(resp, key).await
    }

    pub async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        let url = self.url(key, &[])?;
        let resp = self.send(Method::PUT, url, body).await?;
        check_response(resp, key).await.map(|_| ())
    }

    /// Delete an object; S3 answers 204 even for missing keys
    pub async fn delete_object(&self, key: &str) -> Result<()> {
        let url = self.url(key, &[])?;
        let resp = self.send(Method::DELETE, url, Bytes::new()).await?;
        check_response(resp, key).await.map(|_| ())
    }

    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectAttrs>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(t) = token.as_deref() {
                query.push(("continuation-token", t));
            }
            let url = self.url("", &query)?;
            let resp = self.send(Method::GET, url, Bytes::new()).await?;
            let body = check_response(resp, prefix).await?.text().await.map_err(http_error)?;
            let page: ListBucketResult = quick_xml::de::from_str(&body)
                .map_err(|e| Error::internal(format!("invalid ListObjectsV2 response: {e}")))?;

            out.extend(page.contents.into_iter().map(|e| ObjectAttrs {
                path: e.key,
                size: e.size,
                etag: e.etag.trim_matches('"').to_string(),
                updated_at: DateTime::parse_from_rfc3339(&e.last_modified)
                    .map(|t| t.timestamp())
                    .unwrap_or_default(),
            }));

            match (page.is_truncated, page.next_continuation_token) {
                (true, Some(next)) => token = Some(next),
                _ => break,
            }
        }
        Ok(out)
    }

    pub async fn head_bucket(&self) -> Result<()> {
        let url = self.url("", &[])?;
        let resp = self.send(Method::HEAD, url, Bytes::new()).await?;
        check_response(resp, &self.bucket).await.map(|_| ())
    }

    pub async fn create_bucket(&self) -> Result<()> {
        let url = self.url("", &[])?;
        let resp = self.send(Method::PUT, url, Bytes::new()).await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(Error::already_exists(self.bucket.clone()));
        }
        check_response(resp, &self.bucket).await.map(|_| ())
    }
}

/// Amazon S3 driver
pub struct S3Store {
    client: S3Client,
}

impl S3Store {
    pub fn from_config(cfg: &S3Config) -> Result<Self> {
        if cfg.bucket.is_empty() {
            return Err(Error::configuration("s3 bucket must be set"));
        }
        let region = if cfg.region.is_empty() { "us-east-1" } else { cfg.region.as_str() };
        let credentials = if cfg.credentials_file.is_empty() {
            Credentials::from_env()?
        } else {
            Credentials::from_shared_file(&cfg.credentials_file, &cfg.profile)?
        };
        let (endpoint, addressing) = if cfg.endpoint.is_empty() {
            (format!("https://s3.{region}.amazonaws.com"), Addressing::VirtualHost)
        } else {
            (cfg.endpoint.clone(), Addressing::Path)
        };
        Ok(Self {
            client: S3Client::new(&endpoint, &cfg.bucket, region, addressing, credentials)?,
        })
    }

    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Store for S3Store {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.client.get_object(path).await?.bytes().await.map_err(http_error)
    }

    async fn get_reader(&self, path: &str) -> Result<ObjectReader> {
        Ok(body_reader(self.client.get_object(path).await?))
    }

    async fn put(&self, path: &str, content: Bytes) -> Result<()> {
        self.client.put_object(path, content).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client.delete_object(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>> {
        self.client.list_objects(prefix).await
    }
}
