use super::{hash_id, impl_entity, require};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiKeyRole {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Per-project credential for the external API
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    /// Hex encoded SHA-256 of the full key
    pub key_hash: String,
    pub project_id: String,
    pub role: ApiKeyRole,
    pub creator: String,
    pub disabled: bool,
    pub last_used_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApiKey {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")?;
        require(&self.name, "name")?;
        require(&self.key_hash, "keyHash")?;
        require(&self.project_id, "projectId")
    }

    /// Store the hash of `key`
    pub fn set_key_hash(&mut self, key: &str) {
        self.key_hash = hash_id(&[key]);
    }

    pub fn check_key(&self, key: &str) -> Result<()> {
        if hash_id(&[key]) == self.key_hash {
            Ok(())
        } else {
            Err(Error::unauthenticated("wrong api key"))
        }
    }
}

/// Split an `<id>.<secret>` API key into its id
pub fn extract_api_key_id(key: &str) -> Result<&str> {
    match key.split_once('.') {
        Some((id, secret)) if !id.is_empty() && !secret.is_empty() => Ok(id),
        _ => Err(Error::unauthenticated("malformed api key")),
    }
}

impl_entity!(ApiKey, "APIKey");
