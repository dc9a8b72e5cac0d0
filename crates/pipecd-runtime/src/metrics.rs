//! Prometheus metrics
//!
//! Components record through the `metrics` facade; binaries install the
//! Prometheus recorder once and the admin server renders it on `/metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use pipecd_common::{Error, Result};

pub const GRPCAPI_REQUESTS_TOTAL: &str = "grpcapi_requests_total";
pub const GRPCAPI_REQUEST_DURATION_SECONDS: &str = "grpcapi_request_duration_seconds";
pub const CACHE_OPERATIONS_TOTAL: &str = "cache_operations_total";
pub const FILEDB_OBJECT_CACHE_TOTAL: &str = "filedb_object_cache_total";
pub const OPS_JOB_RUNS_TOTAL: &str = "ops_job_runs_total";

/// Install the global Prometheus recorder
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::internal(format!("failed to install metrics recorder: {e}")))
}

/// Count one run of a background job
pub fn record_job_run(job: &'static str, ok: bool) {
    let result = if ok { "success" } else { "failure" };
    metrics::counter!(OPS_JOB_RUNS_TOTAL, "job" => job, "result" => result).increment(1);
}

/// Count one gRPC call and observe its latency
pub fn record_grpc_call(service: &str, method: &str, code: &str, seconds: f64) {
    metrics::counter!(
        GRPCAPI_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "method" => method.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
    metrics::histogram!(
        GRPCAPI_REQUEST_DURATION_SECONDS,
        "service" => service.to_string(),
        "method" => method.to_string()
    )
    .record(seconds);
}
