use tracing::trace;

// Each helper records through the `metrics` facade, which the Prometheus recorder
// installed in `main` renders on `/metrics`, and mirrors the sample as a trace event.

pub fn inc_requests(route: &'static str) {
    ::metrics::counter!("resale_requests_total", "route" => route).increment(1);
    trace!(
        target = "resale.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn remote_attempt(method: &str, status: u16) {
    ::metrics::counter!(
        "resale_remote_attempts_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    trace!(
        target = "resale.metrics",
        method = method,
        status = status,
        "remote_attempts_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    ::metrics::histogram!("resale_stage_duration_ms", "stage" => stage).record(elapsed_ms as f64);
    trace!(
        target = "resale.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
