use pipecd_cache::Cache;
use pipecd_platform::ecs::Manifests;
use std::sync::Arc;
use tracing::warn;

/// Head manifests of applications, keyed by application and commit
pub struct ManifestCache {
    cache: Arc<dyn Cache>,
}

fn key(app_id: &str, commit: &str) -> String {
    format!("app-manifests/{app_id}/{commit}")
}

impl ManifestCache {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// Cached manifests; any failure counts as a miss
    pub async fn get(&self, app_id: &str, commit: &str) -> Option<Manifests> {
        let raw = match self.cache.get(&key(app_id, commit)).await {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(app_id, commit, error = %e, "failed to read manifests cache");
                return None;
            }
        };
        serde_json::from_slice(&raw)
            .inspect_err(|e| warn!(app_id, commit, error = %e, "dropping malformed cached manifests"))
            .ok()
    }

    pub async fn put(&self, app_id: &str, commit: &str, manifests: &Manifests) {
        let raw = match serde_json::to_vec(manifests) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(app_id, error = %e, "failed to encode manifests");
                return;
            }
        };
        if let Err(e) = self.cache.put(&key(app_id, commit), &raw).await {
            warn!(app_id, commit, error = %e, "failed to write manifests cache");
        }
    }
}
