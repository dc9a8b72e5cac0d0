//! Request authentication for the gRPC endpoints
//!
//! Each endpoint has its own scheme in the `authorization` metadata:
//!
//! - piped API and ext-authz: `PIPED-TOKEN <project-id>,<piped-id>,<piped-key>`
//! - external API: `API-KEY <key-id>.<secret>`
//! - web API: `ID-TOKEN <jwt>`, or the session cookie
//!
//! Verified credentials are kept in a short-lived in-memory cache so that
//! a busy piped does not hit the datastore on every call.

use crate::jwt::{COOKIE_NAME, JwtManager};
use crate::rbac;
use async_trait::async_trait;
use parking_lot::RwLock;
use pipecd_common::model::{ApiKeyRole, extract_api_key_id, now_unix};
use pipecd_common::{Error, Result};
use pipecd_datastore::{ApiKeyStore, PipedStore};
use pipecd_stores::ApiKeyLastUsedStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::metadata::MetadataMap;
use tracing::{debug, warn};

pub const AUTHORIZATION: &str = "authorization";
pub const PIPED_TOKEN_SCHEME: &str = "PIPED-TOKEN";
pub const API_KEY_SCHEME: &str = "API-KEY";
pub const ID_TOKEN_SCHEME: &str = "ID-TOKEN";

/// How long a verified credential is trusted without a datastore lookup
pub const CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    type Identity: Send + 'static;

    async fn authenticate(&self, method: &str, metadata: &MetadataMap) -> Result<Self::Identity>;
}

/// Credential of `scheme` from an authorization header value
pub fn parse_credentials<'a>(header: &'a str, scheme: &str) -> Result<&'a str> {
    let (got, credentials) = header
        .trim()
        .split_once(' ')
        .ok_or_else(|| Error::unauthenticated("malformed authorization header"))?;
    if got != scheme {
        return Err(Error::unauthenticated(format!("expected {scheme} credentials, got {got}")));
    }
    let credentials = credentials.trim();
    if credentials.is_empty() {
        return Err(Error::unauthenticated("missing credentials"));
    }
    Ok(credentials)
}

fn authorization(metadata: &MetadataMap) -> Option<&str> {
    metadata.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn cookie<'a>(metadata: &'a MetadataMap, name: &str) -> Option<&'a str> {
    let raw = metadata.get("cookie")?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then_some(v)
    })
}

/// Entries trusted until `ttl` after verification
struct CredentialCache<V> {
    entries: RwLock<HashMap<String, (V, Instant)>>,
    ttl: Duration,
}

impl<V: Clone> CredentialCache<V> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        let (v, at) = entries.get(key)?;
        (at.elapsed() < self.ttl).then(|| v.clone())
    }

    fn put(&self, key: &str, v: V) {
        let mut entries = self.entries.write();
        entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
        entries.insert(key.to_string(), (v, Instant::now()));
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipedIdentity {
    pub project_id: String,
    pub piped_id: String,
}

pub struct PipedTokenAuth {
    pipeds: Arc<PipedStore>,
    verified: CredentialCache<PipedIdentity>,
}

impl PipedTokenAuth {
    pub fn new(pipeds: Arc<PipedStore>) -> Self {
        Self {
            pipeds,
            verified: CredentialCache::new(CREDENTIAL_CACHE_TTL),
        }
    }

    /// Verify a `<project-id>,<piped-id>,<piped-key>` token
    pub async fn verify_token(&self, token: &str) -> Result<PipedIdentity> {
        if let Some(id) = self.verified.get(token) {
            return Ok(id);
        }
        let mut parts = token.splitn(3, ',');
        let (Some(project_id), Some(piped_id), Some(key)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::unauthenticated("malformed piped token"));
        };
        if project_id.is_empty() || piped_id.is_empty() || key.is_empty() {
            return Err(Error::unauthenticated("malformed piped token"));
        }

        let piped = self.pipeds.get(piped_id).await.map_err(|e| {
            if e.is_not_found() {
                Error::unauthenticated(format!("piped {piped_id} is not registered"))
            } else {
                e
            }
        })?;
        if piped.project_id != project_id {
            return Err(Error::unauthenticated("piped does not belong to the project"));
        }
        if piped.disabled {
            return Err(Error::unauthenticated(format!("piped {piped_id} is disabled")));
        }
        piped.check_key(key)?;

        let id = PipedIdentity {
            project_id: project_id.to_string(),
            piped_id: piped_id.to_string(),
        };
        self.verified.put(token, id.clone());
        debug!(piped_id = %piped_id, "verified piped token");
        Ok(id)
    }

    pub async fn verify_header(&self, header: &str) -> Result<PipedIdentity> {
        let token = parse_credentials(header, PIPED_TOKEN_SCHEME)?;
        self.verify_token(token).await
    }
}

#[async_trait]
impl Authenticator for PipedTokenAuth {
    type Identity = PipedIdentity;

    async fn authenticate(&self, _method: &str, metadata: &MetadataMap) -> Result<PipedIdentity> {
        let header = authorization(metadata).ok_or_else(|| Error::unauthenticated("missing piped token"))?;
        self.verify_header(header).await
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKeyIdentity {
    pub key_id: String,
    pub project_id: String,
    pub role: ApiKeyRole,
}

/// External API methods that need a read-write key
const API_WRITE_METHODS: &[&str] = &["SyncApplication", "RegisterEvent", "RequestPlanPreview"];

pub struct ApiKeyAuth {
    keys: Arc<ApiKeyStore>,
    last_used: ApiKeyLastUsedStore,
    verified: CredentialCache<ApiKeyIdentity>,
}

impl ApiKeyAuth {
    pub fn new(keys: Arc<ApiKeyStore>, last_used: ApiKeyLastUsedStore) -> Self {
        Self {
            keys,
            last_used,
            verified: CredentialCache::new(CREDENTIAL_CACHE_TTL),
        }
    }

    pub async fn verify_key(&self, key: &str) -> Result<ApiKeyIdentity> {
        let id = match self.verified.get(key) {
            Some(id) => id,
            None => {
                let key_id = extract_api_key_id(key)?;
                let stored = self.keys.get(key_id).await.map_err(|e| {
                    if e.is_not_found() {
                        Error::unauthenticated("unknown api key")
                    } else {
                        e
                    }
                })?;
                stored.check_key(key)?;
                if stored.disabled {
                    return Err(Error::unauthenticated(format!("api key {key_id} is disabled")));
                }
                let id = ApiKeyIdentity {
                    key_id: stored.id,
                    project_id: stored.project_id,
                    role: stored.role,
                };
                self.verified.put(key, id.clone());
                id
            }
        };
        if let Err(e) = self.last_used.put(&id.key_id, now_unix()).await {
            warn!(key_id = %id.key_id, error = %e, "failed to record api key usage");
        }
        Ok(id)
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuth {
    type Identity = ApiKeyIdentity;

    async fn authenticate(&self, method: &str, metadata: &MetadataMap) -> Result<ApiKeyIdentity> {
        let header = authorization(metadata).ok_or_else(|| Error::unauthenticated("missing api key"))?;
        let key = parse_credentials(header, API_KEY_SCHEME)?;
        let id = self.verify_key(key).await?;
        if API_WRITE_METHODS.contains(&method) && id.role != ApiKeyRole::ReadWrite {
            return Err(Error::permission_denied(format!("{method} requires a read-write api key")));
        }
        Ok(id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebIdentity {
    pub subject: String,
    pub project_id: String,
    pub roles: Vec<String>,
}

pub struct WebAuth {
    jwt: Arc<JwtManager>,
}

impl WebAuth {
    pub const fn new(jwt: Arc<JwtManager>) -> Self {
        Self { jwt }
    }
}

#[async_trait]
impl Authenticator for WebAuth {
    type Identity = WebIdentity;

    async fn authenticate(&self, method: &str, metadata: &MetadataMap) -> Result<WebIdentity> {
        let token = match authorization(metadata) {
            Some(header) => parse_credentials(header, ID_TOKEN_SCHEME)?,
            None => cookie(metadata, COOKIE_NAME).ok_or_else(|| Error::unauthenticated("missing id token"))?,
        };
        let claims = self.jwt.verify(token)?;
        let permission = rbac::method_permission(method)
            .ok_or_else(|| Error::permission_denied(format!("unknown method {method}")))?;
        if !rbac::any_role_allows(&claims.role.project_rbac_roles, permission) {
            return Err(Error::permission_denied(format!(
                "{} is not allowed to {permission}",
                claims.sub
            )));
        }
        Ok(WebIdentity {
            subject: claims.sub,
            project_id: claims.role.project_id,
            roles: claims.role.project_rbac_roles,
        })
    }
}
