//! Application configurations found in git but not yet registered
//!
//! Each project has its own hash; every piped owns one field holding the full
//! list it last reported, so a report replaces that piped's previous one.

use crate::decode;
use pipecd_cache::HashCacheFactory;
use pipecd_common::Result;
use pipecd_common::model::ApplicationKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationInfo {
    pub id: String,
    pub name: String,
    pub kind: ApplicationKind,
    pub labels: BTreeMap<String, String>,
    pub repo_id: String,
    pub path: String,
    pub config_filename: String,
    pub piped_id: String,
    pub description: String,
}

pub fn hash_key(project_id: &str) -> String {
    format!("HASHKEY:UNREGISTERED_APPS:{project_id}")
}

pub struct UnregisteredAppStore {
    hashes: Arc<dyn HashCacheFactory>,
}

impl UnregisteredAppStore {
    pub fn new(hashes: Arc<dyn HashCacheFactory>) -> Self {
        Self { hashes }
    }

    pub async fn put(&self, project_id: &str, piped_id: &str, apps: &[ApplicationInfo]) -> Result<()> {
        let raw = serde_json::to_vec(apps)?;
        self.hashes.hash(&hash_key(project_id)).put(piped_id, &raw).await
    }

    /// Reports of every piped of the project, ordered by path
    pub async fn list(&self, project_id: &str) -> Result<Vec<ApplicationInfo>> {
        let all = match self.hashes.hash(&hash_key(project_id)).get_all().await {
            Ok(all) => all,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut apps = Vec::new();
        for (piped_id, raw) in all {
            let mut reported: Vec<ApplicationInfo> = decode(&format!("unregistered apps of {piped_id}"), &raw)?;
            apps.append(&mut reported);
        }
        apps.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(apps)
    }
}
