//! Outputs reported by pipeds for handled commands (plan previews)

use bytes::Bytes;
use pipecd_common::Result;
use pipecd_filestore::Store;
use std::sync::Arc;

pub const PREFIX: &str = "command-output/";

pub struct CommandOutputStore {
    fs: Arc<dyn Store>,
}

fn path(command_id: &str) -> String {
    format!("{PREFIX}{command_id}.json")
}

impl CommandOutputStore {
    pub fn new(fs: Arc<dyn Store>) -> Self {
        Self { fs }
    }

    pub async fn get(&self, command_id: &str) -> Result<Bytes> {
        self.fs.get(&path(command_id)).await
    }

    pub async fn put(&self, command_id: &str, output: Bytes) -> Result<()> {
        self.fs.put(&path(command_id), output).await
    }

    pub async fn delete(&self, command_id: &str) -> Result<()> {
        self.fs.delete(&path(command_id)).await
    }

    /// Ids of outputs last written before `before` (unix seconds)
    pub async fn list_written_before(&self, before: i64) -> Result<Vec<String>> {
        let objects = self.fs.list(PREFIX).await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.updated_at < before)
            .filter_map(|o| {
                let id = o.path.strip_prefix(PREFIX)?.strip_suffix(".json")?;
                (!id.contains('/')).then(|| id.to_string())
            })
            .collect())
    }
}
