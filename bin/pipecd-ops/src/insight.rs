//! Insight collector
//!
//! Folds deployments completed since the stored milestone into deployment
//! frequency and change-failure-rate chunks, per application and project
//! wide, at daily and monthly steps.

use crate::schedule::Job;
use async_trait::async_trait;
use pipecd_common::{Error, Result};
use pipecd_common::config::InsightCollectorDeployment;
use pipecd_common::model::{Deployment, DeploymentStatus, InsightChunk, InsightMetricsKind, InsightStep};
use pipecd_datastore::{Commander, DataStore, DeploymentStore, ListOptions, Operator, Order};
use pipecd_stores::insight::{Milestone, bucket_start, chunk_path};
use pipecd_stores::InsightStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const RETRY_BACKOFF: Duration = Duration::from_secs(5);

const STEPS: [InsightStep; 2] = [InsightStep::Daily, InsightStep::Monthly];

/// Chunks touched by one collection, keyed by their filestore path
#[derive(Default)]
struct ChunkSet {
    chunks: BTreeMap<String, (InsightChunk, i64)>,
}

impl ChunkSet {
    async fn chunk(
        &mut self,
        store: &InsightStore,
        project_id: &str,
        application_id: &str,
        kind: InsightMetricsKind,
        step: InsightStep,
        at: i64,
    ) -> Result<&mut InsightChunk> {
        let path = chunk_path(project_id, application_id, kind, step, at)?;
        if !self.chunks.contains_key(&path) {
            let chunk = store.get_or_new_chunk(project_id, application_id, kind, step, at).await?;
            self.chunks.insert(path.clone(), (chunk, at));
        }
        let (chunk, _) = self
            .chunks
            .get_mut(&path)
            .ok_or_else(|| Error::internal(format!("chunk {path} vanished")))?;
        Ok(chunk)
    }
}

pub struct InsightCollector {
    deployments: DeploymentStore,
    insights: InsightStore,
    config: InsightCollectorDeployment,
}

impl InsightCollector {
    pub fn new(ds: &Arc<dyn DataStore>, insights: InsightStore, config: InsightCollectorDeployment) -> Self {
        Self {
            deployments: DeploymentStore::new(ds.clone(), Commander::Ops),
            insights,
            config,
        }
    }

    pub fn schedule(&self) -> &str {
        &self.config.schedule
    }

    async fn completed_between(&self, from: i64, to: i64) -> Result<Vec<Deployment>> {
        let opts = ListOptions::default()
            .filter("CompletedAt", Operator::GreaterThan, from)
            .filter("CompletedAt", Operator::LessThanOrEqual, to)
            .order(Order::asc("CompletedAt"));
        let all = self.deployments.list_all(&opts).await?;
        Ok(all.into_iter().filter(|d| d.status.is_completed()).collect())
    }

    async fn fold(&self, set: &mut ChunkSet, d: &Deployment) -> Result<()> {
        let (success, failure) = match d.status {
            DeploymentStatus::DeploymentSuccess => (1, 0),
            DeploymentStatus::DeploymentFailure => (0, 1),
            _ => (0, 0),
        };
        for app in [d.application_id.as_str(), ""] {
            for step in STEPS {
                let bucket = bucket_start(step, d.completed_at)?;
                let at = d.completed_at;
                let freq = set
                    .chunk(&self.insights, &d.project_id, app, InsightMetricsKind::DeploymentFrequency, step, at)
                    .await?;
                if at > freq.accumulated_to {
                    freq.accumulate(bucket, 1.0);
                }
                let cfr = set
                    .chunk(&self.insights, &d.project_id, app, InsightMetricsKind::ChangeFailureRate, step, at)
                    .await?;
                if at > cfr.accumulated_to {
                    cfr.add_outcomes(bucket, success, failure);
                }
            }
        }
        Ok(())
    }

    /// One collection pass up to `now`
    pub async fn collect(&self, now: i64) -> Result<usize> {
        let milestone = self.insights.get_milestone().await?;
        if milestone.deployment_completed_at >= now {
            return Ok(0);
        }
        let deployments = self.completed_between(milestone.deployment_completed_at, now).await?;

        let mut set = ChunkSet::default();
        for d in &deployments {
            self.fold(&mut set, d).await?;
        }
        for (chunk, at) in set.chunks.values_mut() {
            chunk.accumulated_to = now;
            self.insights.put_chunk(chunk, *at).await?;
        }
        // A chunk ignores deployments up to its accumulatedTo, so a pass that
        // fails between chunk writes can be rerun over the same window
        self.insights
            .put_milestone(&Milestone {
                deployment_completed_at: now,
            })
            .await?;
        Ok(deployments.len())
    }
}

#[async_trait]
impl Job for InsightCollector {
    fn name(&self) -> &'static str {
        "insight-collector"
    }

    async fn run(&self, now: i64) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.collect(now).await {
                Ok(folded) => {
                    info!(deployments = folded, "collected deployment insights");
                    return Ok(());
                }
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "insight collection failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pipecd_common::model::InsightDataPoint;
    use pipecd_filestore::MemoryStore;

    // 2024-02-15T12:00:00Z
    const FEB_15: i64 = 1_707_998_400;
    const FEB_15_MIDNIGHT: i64 = FEB_15 - 12 * 3600;
    // 2024-02-01T00:00:00Z
    const FEB_1: i64 = 1_706_745_600;
    const HOUR: i64 = 3600;

    async fn add(ds: &Arc<dyn DataStore>, id: &str, app: &str, status: DeploymentStatus, completed_at: i64) {
        DeploymentStore::new(ds.clone(), Commander::Piped)
            .add(Deployment {
                id: id.into(),
                application_id: app.into(),
                piped_id: "piped".into(),
                project_id: "p".into(),
                status,
                completed_at,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    async fn points(
        store: &InsightStore,
        app: &str,
        kind: InsightMetricsKind,
        step: InsightStep,
    ) -> Vec<InsightDataPoint> {
        store
            .list_data_points("p", app, kind, step, FEB_1, FEB_15 + 30 * 24 * HOUR)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_collect_folds_completed_deployments() {
        let ds = testing::datastore();
        add(&ds, "d1", "a", DeploymentStatus::DeploymentSuccess, FEB_15).await;
        add(&ds, "d2", "a", DeploymentStatus::DeploymentFailure, FEB_15 + HOUR).await;
        add(&ds, "d3", "b", DeploymentStatus::DeploymentSuccess, FEB_15 + 2 * HOUR).await;
        add(&ds, "d4", "b", DeploymentStatus::DeploymentRunning, 0).await;

        let insights = InsightStore::new(Arc::new(MemoryStore::new()));
        let collector = InsightCollector::new(&ds, insights, InsightCollectorDeployment::default());
        assert_eq!(collector.collect(FEB_15 + 3 * HOUR).await.unwrap(), 3);

        let store = &collector.insights;
        let freq = points(store, "a", InsightMetricsKind::DeploymentFrequency, InsightStep::Daily).await;
        assert_eq!(freq, vec![InsightDataPoint::new(FEB_15_MIDNIGHT, 2.0)]);

        let all = points(store, "", InsightMetricsKind::DeploymentFrequency, InsightStep::Monthly).await;
        assert_eq!(all, vec![InsightDataPoint::new(FEB_1, 3.0)]);

        let cfr = points(store, "a", InsightMetricsKind::ChangeFailureRate, InsightStep::Daily).await;
        assert_eq!(cfr.len(), 1);
        assert!((cfr[0].value - 0.5).abs() < f64::EPSILON);

        // A second pass only sees deployments completed after the milestone
        assert_eq!(collector.collect(FEB_15 + 4 * HOUR).await.unwrap(), 0);
        add(&ds, "d5", "a", DeploymentStatus::DeploymentSuccess, FEB_15 + 5 * HOUR).await;
        assert_eq!(collector.collect(FEB_15 + 6 * HOUR).await.unwrap(), 1);
        let freq = points(store, "a", InsightMetricsKind::DeploymentFrequency, InsightStep::Daily).await;
        assert_eq!(freq, vec![InsightDataPoint::new(FEB_15_MIDNIGHT, 3.0)]);
    }
}
