use crate::models::Stage;
use tracing::trace;

// Thin wrappers over the `metrics` facade. Without an installed recorder these
// are no-ops, which keeps tests free of global state.

pub fn job_outcome(stage: Stage, outcome: &'static str) {
    metrics::counter!("relist_job_outcomes_total", "stage" => stage.as_str(), "outcome" => outcome)
        .increment(1);
}

pub fn stage_elapsed(stage: Stage, elapsed_ms: u128) {
    trace!(
        target = "relist.metrics",
        stage = stage.as_str(),
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
    metrics::histogram!("relist_stage_duration_ms", "stage" => stage.as_str())
        .record(elapsed_ms as f64);
}

pub fn gate_veto(rule: &'static str) {
    metrics::counter!("relist_gate_vetoes_total", "rule" => rule).increment(1);
}

pub fn gate_dry_run(rule: &'static str) {
    metrics::counter!("relist_gate_dry_run_violations_total", "rule" => rule).increment(1);
}

pub fn profit_alert(marketplace: &'static str) {
    metrics::counter!("relist_profit_alerts_total", "marketplace" => marketplace).increment(1);
}

pub fn breaker_tripped() {
    metrics::counter!("relist_circuit_breaker_trips_total").increment(1);
}

pub fn duplicate_delivery() {
    metrics::counter!("relist_duplicate_deliveries_total").increment(1);
}

pub fn recovery_counts(retried: usize, dead_lettered: usize, reenqueued: usize, archived: usize) {
    metrics::counter!("relist_recovery_retried_total").increment(retried as u64);
    metrics::counter!("relist_recovery_dead_lettered_total").increment(dead_lettered as u64);
    metrics::counter!("relist_recovery_reenqueued_total").increment(reenqueued as u64);
    metrics::counter!("relist_recovery_archived_total").increment(archived as u64);
}
