use tracing::trace;

// Trace-based counters; a recorder can be attached to the `hermes.metrics` target.

pub fn inc_requests(operation: &'static str) {
    trace!(
        target = "hermes.metrics",
        operation = operation,
        "requests_total_inc"
    );
}

pub fn retry_scheduled(operation: &'static str, attempt: u32, delay_ms: u128) {
    trace!(
        target = "hermes.metrics",
        operation = operation,
        attempt = attempt,
        delay_ms = delay_ms as u64,
        "retry_scheduled"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "hermes.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
