use super::EntityStore;
use pipecd_common::model::{ApplicationGitRepository, Piped, PlatformProvider, now_unix};
use pipecd_common::Result;

/// Runtime facts a piped reports about itself on startup
#[derive(Clone, Debug, Default)]
pub struct PipedMetadata {
    pub version: String,
    pub config: String,
    pub platform_providers: Vec<PlatformProvider>,
    pub repositories: Vec<ApplicationGitRepository>,
    pub secret_encryption_public_key: String,
    pub started_at: i64,
}

impl EntityStore<Piped> {
    /// Add a key hash; fails once the piped holds the maximum number of keys
    pub async fn add_key(&self, id: &str, key_hash: &str, creator: &str) -> Result<Piped> {
        let now = now_unix();
        self.update(id, |p| p.add_key(key_hash, creator, now)).await
    }

    pub async fn delete_old_keys(&self, id: &str) -> Result<Piped> {
        self.update(id, |p| {
            p.delete_old_keys();
            Ok(())
        })
        .await
    }

    pub async fn enable(&self, id: &str) -> Result<Piped> {
        self.update(id, |p| {
            p.disabled = false;
            Ok(())
        })
        .await
    }

    pub async fn disable(&self, id: &str) -> Result<Piped> {
        self.update(id, |p| {
            p.disabled = true;
            Ok(())
        })
        .await
    }

    pub async fn update_info(&self, id: &str, name: &str, desc: &str) -> Result<Piped> {
        self.update(id, |p| {
            p.name = name.to_string();
            p.desc = desc.to_string();
            Ok(())
        })
        .await
    }

    pub async fn update_metadata(&self, id: &str, meta: &PipedMetadata) -> Result<Piped> {
        self.update(id, |p| {
            p.version.clone_from(&meta.version);
            p.config.clone_from(&meta.config);
            p.platform_providers.clone_from(&meta.platform_providers);
            p.repositories.clone_from(&meta.repositories);
            p.secret_encryption_public_key
                .clone_from(&meta.secret_encryption_public_key);
            p.started_at = meta.started_at;
            Ok(())
        })
        .await
    }

    pub async fn update_desired_version(&self, id: &str, version: &str) -> Result<Piped> {
        self.update(id, |p| {
            p.desired_version = version.to_string();
            Ok(())
        })
        .await
    }
}
