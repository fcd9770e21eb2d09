//! Counters

use ::metrics::counter;

/// An authentication exchange started
pub fn auth_attempted(mechanism: &'static str) {
    counter!("pgbackup_connect_auth_attempted_total", "mechanism" => mechanism).increment(1);
}

/// The server sent AuthenticationOk
pub fn auth_successful(mechanism: &'static str) {
    counter!("pgbackup_connect_auth_successful_total", "mechanism" => mechanism).increment(1);
}

/// Authentication failed or could not be attempted
pub fn auth_failed(mechanism: &'static str, reason: &'static str) {
    counter!(
        "pgbackup_connect_auth_failed_total",
        "mechanism" => mechanism,
        "reason" => reason
    )
    .increment(1);
}

/// A simple query finished (`ok` or `error`)
pub fn query_completed(status: &'static str) {
    counter!("pgbackup_connect_queries_total", "status" => status).increment(1);
}

/// One connection attempt finished
pub fn attempt_completed(stage: &'static str, outcome: &'static str) {
    counter!(
        "pgbackup_connect_attempts_total",
        "stage" => stage,
        "outcome" => outcome
    )
    .increment(1);
}

/// A negotiation ended; `outcome` is the success label or the error label
pub fn negotiation_completed(outcome: &'static str) {
    counter!("pgbackup_connect_negotiations_total", "outcome" => outcome).increment(1);
}

/// An archiving warning was produced
pub fn warning_emitted(kind: &'static str) {
    counter!("pgbackup_connect_warnings_total", "kind" => kind).increment(1);
}
