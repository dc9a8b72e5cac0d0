//! AWS Signature V4 request signing
//!
//! Used by the S3/MinIO filestore and the ECS client. Signs outgoing requests
//! with the `Authorization` header form of SigV4.
//! Reference: https://docs.aws.amazon.com/IAM/latest/UserGuide/reference_sigv.html

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Static AWS credentials
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    /// Read an access key and a secret key from two files
    pub fn from_key_files(access_key_file: impl AsRef<Path>, secret_key_file: impl AsRef<Path>) -> Result<Self> {
        let access = read_trimmed(access_key_file.as_ref())?;
        let secret = read_trimmed(secret_key_file.as_ref())?;
        Ok(Self::new(access, secret))
    }

    /// Read a profile from an AWS shared credentials file
    pub fn from_shared_file(path: impl AsRef<Path>, profile: &str) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("failed to read {}: {e}", path.display())))?;
        let profile = if profile.is_empty() { "default" } else { profile };

        let mut in_profile = false;
        let mut values = BTreeMap::new();
        for line in content.lines().map(str::trim) {
            if line.starts_with('[') && line.ends_with(']') {
                in_profile = line[1..line.len() - 1].trim() == profile;
                continue;
            }
            if !in_profile || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                values.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        let access = values.remove("aws_access_key_id").ok_or_else(|| {
            Error::configuration(format!("profile {profile} has no aws_access_key_id"))
        })?;
        let secret = values.remove("aws_secret_access_key").ok_or_else(|| {
            Error::configuration(format!("profile {profile} has no aws_secret_access_key"))
        })?;
        Ok(Self {
            access_key_id: access,
            secret_access_key: secret,
            session_token: values.remove("aws_session_token"),
        })
    }

    /// Read `AWS_ACCESS_KEY_ID`/`AWS_SECRET_ACCESS_KEY`/`AWS_SESSION_TOKEN`
    pub fn from_env() -> Result<Self> {
        let access = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::configuration("AWS_ACCESS_KEY_ID is not set"))?;
        let secret = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::configuration("AWS_SECRET_ACCESS_KEY is not set"))?;
        Ok(Self {
            access_key_id: access,
            secret_access_key: secret,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::configuration(format!("failed to read {}: {e}", path.display())))
}

/// AWS Signature V4 signer for one region and service
#[derive(Clone, Debug)]
pub struct SigV4Signer {
    /// AWS region (e.g., "us-east-1")
    region: String,
    /// Service name, `s3` or `ecs`
    service: String,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Sign a request in place
    ///
    /// Adds `host`, `x-amz-date`, `x-amz-content-sha256`, the session token
    /// when present, and `authorization`. Every header already present in
    /// `headers` is signed.
    pub fn sign(
        &self,
        creds: &Credentials,
        method: &str,
        url: &reqwest::Url,
        headers: &mut HeaderMap,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let payload_hash = hex_sha256(payload);

        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => return Err(Error::invalid_argument(format!("url {url} has no host"))),
        };
        insert_header(headers, "host", &host)?;
        insert_header(headers, "x-amz-date", &amz_date)?;
        insert_header(headers, "x-amz-content-sha256", &payload_hash)?;
        if let Some(token) = &creds.session_token {
            insert_header(headers, "x-amz-security-token", token)?;
        }

        let mut canonical_headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in headers.iter() {
            if name == AUTHORIZATION {
                continue;
            }
            let value = value
                .to_str()
                .map_err(|_| Error::invalid_argument(format!("header {name} is not ascii")))?;
            canonical_headers.insert(name.as_str().to_lowercase(), value.trim().to_string());
        }
        let signed_headers = canonical_headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_headers_str: String = canonical_headers
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri(url.path()),
            canonical_query_string(url.query().unwrap_or("")),
            canonical_headers_str,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{date_stamp}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{credential_scope}\n{}",
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, &self.region, &self.service);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
            creds.access_key_id
        );
        insert_header(headers, AUTHORIZATION.as_str(), &authorization)
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::invalid_argument(format!("invalid header name {name}: {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::invalid_argument(format!("invalid header value for {name}: {e}")))?;
    headers.insert(name, value);
    Ok(())
}

/// Canonical URI: every segment decoded then re-encoded once
fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|seg| uri_encode(&urlencoding::decode(seg).map_or_else(|_| seg.to_string(), |s| s.into_owned())))
        .collect::<Vec<_>>()
        .join("/")
}

/// Build canonical query string (sorted parameters)
fn canonical_query_string(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut params: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|param| {
            let (k, v) = param.split_once('=').unwrap_or((param, ""));
            let decode = |s: &str| {
                urlencoding::decode(&s.replace('+', " ")).map_or_else(|_| s.to_string(), |d| d.into_owned())
            };
            (uri_encode(&decode(k)), uri_encode(&decode(v)))
        })
        .collect();
    params.sort();
    params
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// URI encode a string (AWS style, unreserved characters kept)
pub fn uri_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Encode an object key for use in a path, keeping `/`
pub fn encode_key_path(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Derive the signing key
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Calculate HMAC-SHA256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Calculate SHA256 and return hex string
pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
