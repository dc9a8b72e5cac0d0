//! Job scheduling: fixed tickers and cron expressions
//!
//! A failed run is logged and counted, then the loop waits for the next
//! slot. Loops only return on cancellation or an unusable schedule.

use async_trait::async_trait;
use chrono::Utc;
use croner::Cron;
use pipecd_common::model::now_unix;
use pipecd_common::{Error, Result};
use pipecd_runtime::CancellationToken;
use pipecd_runtime::metrics::record_job_run;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// One pass with `now` as the reference time (unix seconds)
    async fn run(&self, now: i64) -> Result<()>;
}

async fn run_once(job: &dyn Job) {
    let started = std::time::Instant::now();
    match job.run(now_unix()).await {
        Ok(()) => {
            record_job_run(job.name(), true);
            debug!(job = job.name(), elapsed_ms = started.elapsed().as_millis(), "job run finished");
        }
        Err(e) => {
            record_job_run(job.name(), false);
            error!(job = job.name(), error = %e, "job run failed");
        }
    }
}

/// Run `job` every `interval`, first after one full interval
pub async fn every(job: Arc<dyn Job>, interval: Duration, token: CancellationToken) -> Result<()> {
    info!(job = job.name(), interval_secs = interval.as_secs(), "starting job");
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => {
                info!(job = job.name(), "job stopped");
                return Ok(());
            }
            _ = ticker.tick() => run_once(job.as_ref()).await,
        }
    }
}

/// Parse a five-field cron expression
pub fn parse_cron(expr: &str) -> Result<Cron> {
    Cron::new(expr)
        .parse()
        .map_err(|e| Error::configuration(format!("invalid cron expression {expr:?}: {e}")))
}

fn until_next(cron: &Cron, expr: &str) -> Result<Duration> {
    let now = Utc::now();
    let next = cron
        .find_next_occurrence(&now, false)
        .map_err(|e| Error::internal(format!("no next occurrence for {expr:?}: {e}")))?;
    Ok((next - now).to_std().unwrap_or_default())
}

/// Run `job` at every occurrence of the cron expression `expr` (UTC)
pub async fn cron(job: Arc<dyn Job>, expr: &str, token: CancellationToken) -> Result<()> {
    let cron = parse_cron(expr)?;
    info!(job = job.name(), schedule = expr, "starting job");
    loop {
        let wait = until_next(&cron, expr)?;
        tokio::select! {
            () = token.cancelled() => {
                info!(job = job.name(), "job stopped");
                return Ok(());
            }
            () = tokio::time::sleep(wait) => run_once(job.as_ref()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Job for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, _now: i64) -> Result<()> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::internal("first run fails"));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_survives_failed_runs_and_stops_on_cancel() {
        let job = Arc::new(Counting(AtomicUsize::new(0)));
        let token = CancellationToken::new();
        let handle = tokio::spawn(every(job.clone(), Duration::from_secs(10), token.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(job.0.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_parse_cron() {
        assert!(parse_cron("0 9 * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }
}
