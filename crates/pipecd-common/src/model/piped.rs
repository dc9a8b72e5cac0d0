use super::{ApplicationGitRepository, impl_entity, require};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Maximum number of keys a piped may hold at once
pub const MAX_PIPED_KEYS: usize = 2;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipedKey {
    /// Hex encoded SHA-256 of the key
    pub hash: String,
    pub creator: String,
    pub created_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A registered delivery agent
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Piped {
    pub id: String,
    pub name: String,
    pub desc: String,
    pub project_id: String,
    pub keys: Vec<PipedKey>,
    pub version: String,
    pub desired_version: String,
    pub started_at: i64,
    pub platform_providers: Vec<PlatformProvider>,
    pub repositories: Vec<ApplicationGitRepository>,
    /// Public key used to encrypt secrets for this piped
    pub secret_encryption_public_key: String,
    /// Raw piped configuration reported on startup
    pub config: String,
    pub disabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Piped {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")?;
        require(&self.name, "name")?;
        require(&self.project_id, "projectId")?;
        if self.keys.len() > MAX_PIPED_KEYS {
            return Err(Error::invalid_argument(format!(
                "a piped can have at most {MAX_PIPED_KEYS} keys"
            )));
        }
        Ok(())
    }

    /// Append a key, refusing when the piped already holds the maximum
    pub fn add_key(&mut self, hash: impl Into<String>, creator: impl Into<String>, created_at: i64) -> Result<()> {
        if self.keys.len() >= MAX_PIPED_KEYS {
            return Err(Error::invalid_argument(format!(
                "number of keys for each piped must be less than or equal to {MAX_PIPED_KEYS}, please delete the old keys first"
            )));
        }
        self.keys.push(PipedKey {
            hash: hash.into(),
            creator: creator.into(),
            created_at,
        });
        Ok(())
    }

    /// Keep only the most recently created key
    pub fn delete_old_keys(&mut self) {
        if let Some(latest) = self.keys.iter().max_by_key(|k| k.created_at).cloned() {
            self.keys = vec![latest];
        }
    }

    /// Check a raw key against every stored hash
    pub fn check_key(&self, key: &str) -> Result<()> {
        let hash = crate::model::hash_id(&[key]);
        if self.keys.iter().any(|k| k.hash == hash) {
            Ok(())
        } else {
            Err(Error::unauthenticated("wrong piped key"))
        }
    }
}

impl_entity!(Piped, "Piped");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::hash_id;

    #[test]
    fn test_piped_keys() {
        let mut p = Piped::default();
        p.add_key(hash_id(&["k1"]), "alice", 1).unwrap();
        p.add_key(hash_id(&["k2"]), "alice", 2).unwrap();
        assert!(p.add_key(hash_id(&["k3"]), "alice", 3).is_err());

        assert!(p.check_key("k1").is_ok());
        p.delete_old_keys();
        assert_eq!(p.keys.len(), 1);
        assert!(p.check_key("k1").is_err());
        assert!(p.check_key("k2").is_ok());
    }
}
