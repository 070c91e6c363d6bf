pub(crate) const METRIC_SHUTDOWN_INITIATED: &str = "guard_shutdown_initiated_total";
pub(crate) const METRIC_CLEANUP_FAILED: &str = "guard_cleanup_failed_total";
pub(crate) const METRIC_CLEANUP_RUN_DURATION: &str = "guard_cleanup_run_duration_seconds";
pub(crate) const METRIC_CLEANUP_TIMEOUT: &str = "guard_cleanup_timeout_total";
pub(crate) const METRIC_TERMINATED: &str = "guard_terminated_total";

pub(crate) fn emit_shutdown_initiated(trigger: &str, detail: &str) {
    metrics::counter!(
        METRIC_SHUTDOWN_INITIATED,
        "trigger" => trigger.to_string(),
        "detail" => detail.to_string()
    )
    .increment(1);
}

pub(crate) fn emit_cleanup_failure(path: &str) {
    metrics::counter!(METRIC_CLEANUP_FAILED, "path" => path.to_string()).increment(1);
}

pub(crate) fn emit_cleanup_duration(path: &str, duration_secs: f64) {
    metrics::histogram!(METRIC_CLEANUP_RUN_DURATION, "path" => path.to_string())
        .record(duration_secs);
}

pub(crate) fn emit_cleanup_timeout(path: &str) {
    metrics::counter!(METRIC_CLEANUP_TIMEOUT, "path" => path.to_string()).increment(1);
}

pub(crate) fn emit_terminated(via: &str) {
    metrics::counter!(METRIC_TERMINATED, "via" => via.to_string()).increment(1);
}
