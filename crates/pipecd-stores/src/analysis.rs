//! Analysis records shared between stage runs

use crate::ReadThrough;
use pipecd_cache::Cache;
use pipecd_common::Result;
use pipecd_common::model::{AnalysisMetadata, AnalysisResult};
use pipecd_filestore::Store;
use std::sync::Arc;

/// Most recent successful analysis per application
pub struct AnalysisResultStore {
    inner: ReadThrough,
}

impl AnalysisResultStore {
    pub fn new(fs: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self {
            inner: ReadThrough::new(fs, cache),
        }
    }

    fn path(application_id: &str) -> String {
        format!("latest-analysis-result/{application_id}.json")
    }

    fn cache_key(application_id: &str) -> String {
        format!("most-recent-successful-analysis:{application_id}")
    }

    pub async fn get_latest(&self, application_id: &str) -> Result<AnalysisResult> {
        self.inner
            .get(&Self::cache_key(application_id), &Self::path(application_id))
            .await
    }

    pub async fn put_latest(&self, application_id: &str, result: &AnalysisResult) -> Result<()> {
        self.inner
            .put(&Self::cache_key(application_id), &Self::path(application_id), result)
            .await
    }
}

/// Query window of the analysis stage of one deployment
pub struct AnalysisMetadataStore {
    inner: ReadThrough,
}

impl AnalysisMetadataStore {
    pub fn new(fs: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self {
            inner: ReadThrough::new(fs, cache),
        }
    }

    fn path(deployment_id: &str, stage_id: &str) -> String {
        format!("analysis-metadata/{deployment_id}/{stage_id}.json")
    }

    fn cache_key(deployment_id: &str, stage_id: &str) -> String {
        format!("analysis-metadata:{deployment_id}:{stage_id}")
    }

    pub async fn get(&self, deployment_id: &str, stage_id: &str) -> Result<AnalysisMetadata> {
        self.inner
            .get(
                &Self::cache_key(deployment_id, stage_id),
                &Self::path(deployment_id, stage_id),
            )
            .await
    }

    pub async fn put(&self, stage_id: &str, metadata: &AnalysisMetadata) -> Result<()> {
        self.inner
            .put(
                &Self::cache_key(&metadata.deployment_id, stage_id),
                &Self::path(&metadata.deployment_id, stage_id),
                metadata,
            )
            .await
    }
}
