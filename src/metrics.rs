use tracing::trace;

// Trace-event counters; the Prometheus recorder installed in main renders
// whatever the process records.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "catalog.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "catalog.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn upload_outcomes(succeeded: usize, failed: usize) {
    trace!(
        target = "catalog.metrics",
        succeeded = succeeded as u64,
        failed = failed as u64,
        "upload_outcomes"
    );
}

pub fn merge_rows(added: usize, skipped: usize) {
    trace!(
        target = "catalog.metrics",
        added = added as u64,
        skipped = skipped as u64,
        "merge_rows"
    );
}
