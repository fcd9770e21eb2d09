//! Metrics emitted through the `metrics` facade
//!
//! Nothing is recorded unless the embedding process installs a recorder.
//! All names share the `pgbackup_connect_` prefix.

pub mod counters;
pub mod histograms;
pub mod labels;
