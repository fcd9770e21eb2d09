//! Histograms (durations in milliseconds)

use ::metrics::histogram;

/// Time from the first authentication request to AuthenticationOk
pub fn auth_duration(mechanism: &'static str, duration_ms: u64) {
    histogram!("pgbackup_connect_auth_duration_ms", "mechanism" => mechanism)
        .record(duration_ms as f64);
}

/// TLS negotiation, startup and authentication of one connection
pub fn startup_duration(duration_ms: u64) {
    histogram!("pgbackup_connect_startup_duration_ms").record(duration_ms as f64);
}

/// One attempt, including the health check when it connected
pub fn attempt_duration(stage: &'static str, duration_ms: u64) {
    histogram!("pgbackup_connect_attempt_duration_ms", "stage" => stage)
        .record(duration_ms as f64);
}

/// A whole negotiation
pub fn negotiation_duration(outcome: &'static str, duration_ms: u64) {
    histogram!("pgbackup_connect_negotiation_duration_ms", "outcome" => outcome)
        .record(duration_ms as f64);
}
