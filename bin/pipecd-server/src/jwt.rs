//! Session tokens for the web console
//!
//! HS256 JWTs signed with the encryption key. The token travels either in
//! `authorization: ID-TOKEN <jwt>` or in the `token` cookie.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use pipecd_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const COOKIE_NAME: &str = "token";
const ISSUER: &str = "pipecd";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub project_id: String,
    /// Built-in or custom role names granted in the project
    pub project_rbac_roles: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub role: Role,
}

impl Claims {
    pub fn new(subject: impl Into<String>, role: Role, now: i64, ttl: Duration) -> Self {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Self {
            sub: subject.into(),
            iss: ISSUER.to_string(),
            iat: now,
            nbf: now,
            exp: now.saturating_add(ttl),
            role,
        }
    }
}

pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(key: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_nbf = true;
        Self {
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
        }
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::internal(format!("failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::unauthenticated(format!("invalid token: {e}")))
    }
}
