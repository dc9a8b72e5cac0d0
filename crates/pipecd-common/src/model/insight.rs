use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightMetricsKind {
    #[default]
    DeploymentFrequency,
    ChangeFailureRate,
}

impl InsightMetricsKind {
    pub const fn path_segment(self) -> &'static str {
        match self {
            Self::DeploymentFrequency => "deployment_frequency",
            Self::ChangeFailureRate => "change_failure_rate",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightStep {
    #[default]
    Daily,
    Monthly,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsightDataPoint {
    /// Start of the bucket, unix seconds
    pub timestamp: i64,
    pub value: f64,
    /// Outcome counts behind a change-failure-rate value
    #[serde(skip_serializing_if = "is_zero")]
    pub success_count: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub failure_count: i64,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl InsightDataPoint {
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value,
            success_count: 0,
            failure_count: 0,
        }
    }
}

/// One chunk of a metric series, stored per month (daily step) or year
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsightChunk {
    pub project_id: String,
    pub application_id: String,
    pub kind: InsightMetricsKind,
    pub step: InsightStep,
    pub labels: BTreeMap<String, String>,
    pub data_points: Vec<InsightDataPoint>,
    pub accumulated_to: i64,
}

impl InsightChunk {
    /// Add `value` to the point at `timestamp`, inserting it in order when missing
    pub fn accumulate(&mut self, timestamp: i64, value: f64) {
        match self.data_points.binary_search_by_key(&timestamp, |p| p.timestamp) {
            Ok(i) => self.data_points[i].value += value,
            Err(i) => self.data_points.insert(i, InsightDataPoint::new(timestamp, value)),
        }
    }

    /// Add deployment outcomes to the point at `timestamp` and recompute its rate
    #[allow(clippy::cast_precision_loss)]
    pub fn add_outcomes(&mut self, timestamp: i64, success: i64, failure: i64) {
        let i = match self.data_points.binary_search_by_key(&timestamp, |p| p.timestamp) {
            Ok(i) => i,
            Err(i) => {
                self.data_points.insert(i, InsightDataPoint::new(timestamp, 0.0));
                i
            }
        };
        let p = &mut self.data_points[i];
        p.success_count += success;
        p.failure_count += failure;
        let total = p.success_count + p.failure_count;
        p.value = if total == 0 { 0.0 } else { p.failure_count as f64 / total as f64 };
    }

    /// Overwrite the point at `timestamp`
    pub fn set(&mut self, timestamp: i64, value: f64) {
        match self.data_points.binary_search_by_key(&timestamp, |p| p.timestamp) {
            Ok(i) => self.data_points[i].value = value,
            Err(i) => self.data_points.insert(i, InsightDataPoint::new(timestamp, value)),
        }
    }
}
