//! Google Cloud OAuth2 access tokens
//!
//! Tokens come either from a service-account key file (signed JWT grant) or
//! from the GCE metadata server. A token is cached until a minute before it
//! expires.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

pub const SCOPE_CLOUD_PLATFORM: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const SCOPE_DEVSTORAGE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
pub const SCOPE_DATASTORE: &str = "https://www.googleapis.com/auth/datastore";

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: String,
}

#[derive(Serialize)]
struct GrantClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

enum Source {
    ServiceAccount(ServiceAccountKey),
    Metadata { url: String },
    Static(String),
}

/// Source of bearer tokens for Google APIs
pub struct TokenSource {
    source: Source,
    scopes: String,
    http: reqwest::Client,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenSource {
    /// Build from a credentials file, or the metadata server when `path` is empty
    pub fn new(credentials_file: &str, scopes: &[&str]) -> Result<Self> {
        let source = if credentials_file.is_empty() {
            Source::Metadata {
                url: METADATA_TOKEN_URL.to_string(),
            }
        } else {
            Source::ServiceAccount(read_key(Path::new(credentials_file))?)
        };
        Ok(Self::with_source(source, scopes))
    }

    /// Always hand out the given token, used against emulators and in tests
    pub fn fixed(token: impl Into<String>) -> Self {
        Self::with_source(Source::Static(token.into()), &[])
    }

    /// Fetch tokens from a metadata-server compatible endpoint
    pub fn metadata(url: impl Into<String>) -> Self {
        Self::with_source(Source::Metadata { url: url.into() }, &[])
    }

    fn with_source(source: Source, scopes: &[&str]) -> Self {
        Self {
            source,
            scopes: scopes.join(" "),
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// Return a valid access token, refreshing it when needed
    pub async fn token(&self) -> Result<String> {
        if let Source::Static(t) = &self.source {
            return Ok(t.clone());
        }
        let cached = self.cached.lock().clone();
        if let Some((token, expires)) = cached {
            if Instant::now() + EXPIRY_SLACK < expires {
                return Ok(token);
            }
        }

        let resp = match &self.source {
            Source::ServiceAccount(key) => self.fetch_with_key(key).await?,
            Source::Metadata { url } => self.fetch_from_metadata(url).await?,
            Source::Static(t) => return Ok(t.clone()),
        };
        let ttl = Duration::from_secs(if resp.expires_in == 0 { 3600 } else { resp.expires_in });
        *self.cached.lock() = Some((resp.access_token.clone(), Instant::now() + ttl));
        Ok(resp.access_token)
    }

    async fn fetch_with_key(&self, key: &ServiceAccountKey) -> Result<TokenResponse> {
        let aud = if key.token_uri.is_empty() {
            DEFAULT_TOKEN_URI
        } else {
            &key.token_uri
        };
        let now = chrono::Utc::now().timestamp();
        let claims = GrantClaims {
            iss: &key.client_email,
            scope: &self.scopes,
            aud,
            iat: now,
            exp: now + 3600,
        };
        let encoding_key = jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Error::configuration(format!("invalid service account private key: {e}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &encoding_key,
        )
        .map_err(|e| Error::internal(format!("failed to sign token grant: {e}")))?;

        let resp = self
            .http
            .post(aud)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::internal(format!("token request failed: {e}")))?;
        parse_token_response(resp).await
    }

    async fn fetch_from_metadata(&self, url: &str) -> Result<TokenResponse> {
        let resp = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::internal(format!("metadata token request failed: {e}")))?;
        parse_token_response(resp).await
    }
}

async fn parse_token_response(resp: reqwest::Response) -> Result<TokenResponse> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::unauthenticated(format!("token endpoint returned {status}: {body}")));
    }
    resp.json()
        .await
        .map_err(|e| Error::internal(format!("invalid token response: {e}")))
}

fn read_key(path: &Path) -> Result<ServiceAccountKey> {
    let data = std::fs::read(path)
        .map_err(|e| Error::configuration(format!("failed to read credentials {}: {e}", path.display())))?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::configuration(format!("invalid credentials {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_metadata_token_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok", "expires_in": 3600})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ts = TokenSource::metadata(format!("{}/token", server.uri()));
        assert_eq!(ts.token().await.unwrap(), "tok");
        assert_eq!(ts.token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn test_metadata_token_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let ts = TokenSource::metadata(server.uri());
        assert!(ts.token().await.is_err());
    }

    #[test]
    fn test_missing_key_file() {
        assert!(TokenSource::new("/nonexistent/key.json", &[SCOPE_DEVSTORAGE]).is_err());
    }
}
