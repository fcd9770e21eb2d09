//! Notification hook for negotiation progress

use super::{AttemptFailure, AttemptStage, Warning};

/// Receives negotiation events; every method defaults to a no-op
pub trait NegotiationObserver: Send + Sync {
    /// An attempt failed; the sequence continues unless it was the last one
    fn attempt_failed(&self, _failure: &AttemptFailure) {}

    /// Direct and utility attempts failed; `prior` is about to be retried on localhost
    fn localhost_fallback(&self, _prior: &[AttemptFailure]) {}

    /// The health check produced a warning
    fn warning(&self, _warning: &Warning) {}

    /// A session passed the health check
    fn connected(&self, _stage: AttemptStage, _endpoint: &str) {}
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl NegotiationObserver for TracingObserver {
    fn attempt_failed(&self, failure: &AttemptFailure) {
        tracing::debug!(
            stage = %failure.stage,
            host = %failure.host,
            port = failure.port,
            error = %failure.error,
            "connection attempt failed"
        );
    }

    fn localhost_fallback(&self, prior: &[AttemptFailure]) {
        for failure in prior {
            tracing::error!(stage = %failure.stage, "{}", failure.error);
        }
        tracing::error!("failed to connect using the configured host and port, trying localhost:5432");
    }

    fn warning(&self, warning: &Warning) {
        tracing::warn!(kind = ?warning.kind, "{}", warning.message);
    }

    fn connected(&self, stage: AttemptStage, endpoint: &str) {
        tracing::info!(%stage, endpoint, "connected to postgres");
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl NegotiationObserver for NoopObserver {}

impl<O: NegotiationObserver + ?Sized> NegotiationObserver for std::sync::Arc<O> {
    fn attempt_failed(&self, failure: &AttemptFailure) {
        (**self).attempt_failed(failure)
    }

    fn localhost_fallback(&self, prior: &[AttemptFailure]) {
        (**self).localhost_fallback(prior)
    }

    fn warning(&self, warning: &Warning) {
        (**self).warning(warning)
    }

    fn connected(&self, stage: AttemptStage, endpoint: &str) {
        (**self).connected(stage, endpoint)
    }
}
