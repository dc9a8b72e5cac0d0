//! Insight metric chunks
//!
//! A chunk with the daily step holds one month of points and lives at
//! `.../daily/<yyyy-mm>.json`; a monthly-step chunk holds one year at
//! `.../monthly/<yyyy>.json`. Project-wide series use the application
//! segment `all`.

use crate::{get_json, put_json};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use pipecd_common::model::{InsightChunk, InsightDataPoint, InsightMetricsKind, InsightStep};
use pipecd_common::{Error, Result};
use pipecd_filestore::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PROJECT_WIDE: &str = "all";

pub const MILESTONE_PATH: &str = "insights/milestone.json";

/// How far the collector has folded completed deployments into chunks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Milestone {
    pub deployment_completed_at: i64,
}

/// Widest window [`InsightStore::list_data_points`] serves
pub const MAX_RANGE_SECS: i64 = 2 * 365 * 24 * 3600;

fn date_of(ts: i64) -> Result<NaiveDate> {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|t| t.date_naive())
        .ok_or_else(|| Error::invalid_argument(format!("timestamp {ts} is out of range")))
}

fn unix(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0).map_or(0, |t| t.and_utc().timestamp())
}

const fn step_segment(step: InsightStep) -> &'static str {
    match step {
        InsightStep::Daily => "daily",
        InsightStep::Monthly => "monthly",
    }
}

/// Start of the bucket holding `ts`: midnight for daily, the 1st for monthly
pub fn bucket_start(step: InsightStep, ts: i64) -> Result<i64> {
    let d = date_of(ts)?;
    Ok(match step {
        InsightStep::Daily => unix(d),
        InsightStep::Monthly => unix(d.with_day(1).unwrap_or(d)),
    })
}

/// First day of the chunk period holding `date`
fn period_start(step: InsightStep, date: NaiveDate) -> NaiveDate {
    let first = match step {
        InsightStep::Daily => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
        InsightStep::Monthly => NaiveDate::from_ymd_opt(date.year(), 1, 1),
    };
    first.unwrap_or(date)
}

fn next_period(step: InsightStep, start: NaiveDate) -> Option<NaiveDate> {
    let months = match step {
        InsightStep::Daily => 1,
        InsightStep::Monthly => 12,
    };
    start.checked_add_months(Months::new(months))
}

fn period_name(step: InsightStep, start: NaiveDate) -> String {
    match step {
        InsightStep::Daily => format!("{:04}-{:02}", start.year(), start.month()),
        InsightStep::Monthly => format!("{:04}", start.year()),
    }
}

pub fn chunk_path(
    project_id: &str,
    application_id: &str,
    kind: InsightMetricsKind,
    step: InsightStep,
    at: i64,
) -> Result<String> {
    let app = if application_id.is_empty() { PROJECT_WIDE } else { application_id };
    let start = period_start(step, date_of(at)?);
    Ok(format!(
        "insights/{project_id}/{app}/{}/{}/{}.json",
        kind.path_segment(),
        step_segment(step),
        period_name(step, start)
    ))
}

pub struct InsightStore {
    fs: Arc<dyn Store>,
}

impl InsightStore {
    pub fn new(fs: Arc<dyn Store>) -> Self {
        Self { fs }
    }

    /// Chunk of the period holding `at`
    pub async fn get_chunk(
        &self,
        project_id: &str,
        application_id: &str,
        kind: InsightMetricsKind,
        step: InsightStep,
        at: i64,
    ) -> Result<InsightChunk> {
        let path = chunk_path(project_id, application_id, kind, step, at)?;
        get_json(self.fs.as_ref(), &path).await
    }

    /// Stored chunk of the period holding `at`, or an empty one
    pub async fn get_or_new_chunk(
        &self,
        project_id: &str,
        application_id: &str,
        kind: InsightMetricsKind,
        step: InsightStep,
        at: i64,
    ) -> Result<InsightChunk> {
        match self.get_chunk(project_id, application_id, kind, step, at).await {
            Ok(c) => Ok(c),
            Err(e) if e.is_not_found() => Ok(InsightChunk {
                project_id: project_id.to_string(),
                application_id: application_id.to_string(),
                kind,
                step,
                ..Default::default()
            }),
            Err(e) => Err(e),
        }
    }

    /// Write `chunk` as the chunk of the period holding `at`
    pub async fn put_chunk(&self, chunk: &InsightChunk, at: i64) -> Result<()> {
        let path = chunk_path(&chunk.project_id, &chunk.application_id, chunk.kind, chunk.step, at)?;
        put_json(self.fs.as_ref(), &path, chunk).await
    }

    /// Stored milestone, or the zero milestone before the first collection
    pub async fn get_milestone(&self) -> Result<Milestone> {
        match get_json(self.fs.as_ref(), MILESTONE_PATH).await {
            Ok(m) => Ok(m),
            Err(e) if e.is_not_found() => Ok(Milestone::default()),
            Err(e) => Err(e),
        }
    }

    pub async fn put_milestone(&self, milestone: &Milestone) -> Result<()> {
        put_json(self.fs.as_ref(), MILESTONE_PATH, milestone).await
    }

    /// Points with `from <= timestamp < to` across every chunk of the range
    pub async fn list_data_points(
        &self,
        project_id: &str,
        application_id: &str,
        kind: InsightMetricsKind,
        step: InsightStep,
        from: i64,
        to: i64,
    ) -> Result<Vec<InsightDataPoint>> {
        if from >= to {
            return Err(Error::invalid_argument(format!("empty range [{from}, {to})")));
        }
        if to - from > MAX_RANGE_SECS {
            return Err(Error::invalid_argument("range is longer than two years"));
        }
        let mut out = Vec::new();
        let end = date_of(to)?;
        let mut cur = Some(period_start(step, date_of(from)?));
        while let Some(start) = cur.filter(|s| *s <= end) {
            match self.get_chunk(project_id, application_id, kind, step, unix(start)).await {
                Ok(chunk) => out.extend(
                    chunk
                        .data_points
                        .into_iter()
                        .filter(|p| from <= p.timestamp && p.timestamp < to),
                ),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            cur = next_period(step, start);
        }
        Ok(out)
    }
}
