use super::EntityStore;
use pipecd_common::model::ApiKey;
use pipecd_common::{Error, Result};

impl EntityStore<ApiKey> {
    /// Disable a key owned by `project_id`
    pub async fn disable(&self, id: &str, project_id: &str) -> Result<ApiKey> {
        self.update(id, |k| {
            if k.project_id != project_id {
                return Err(Error::invalid_argument("requested api key does not belong to the project"));
            }
            k.disabled = true;
            Ok(())
        })
        .await
    }

    /// Only moves forward; older reports are ignored
    pub async fn update_last_used(&self, id: &str, used_at: i64) -> Result<ApiKey> {
        self.update(id, |k| {
            k.last_used_at = k.last_used_at.max(used_at);
            Ok(())
        })
        .await
    }
}
