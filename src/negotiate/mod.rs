//! Connection negotiation
//!
//! A [`Negotiator`] tries, strictly in order and stopping at the first success:
//!
//! 1. the base config as given ([`AttemptStage::Direct`]);
//! 2. the base config with `gp_role=utility`, then with `gp_session_role=utility`
//!    (Greenplum segments only accept utility-mode sessions);
//! 3. `localhost:5432` without a utility key, unless the base host already is `localhost`.
//!
//! Every attempt works on its own copy of the config. The session that
//! connects is then asked for `archive_mode` and `archive_command`; a
//! misconfiguration becomes a [`Warning`], an unreadable setting fails the
//! whole negotiation.

pub mod health;
pub mod observer;
pub mod plan;

pub use health::HealthCheck;
pub use observer::{NegotiationObserver, NoopObserver, TracingObserver};
pub use plan::AttemptStage;

use crate::config::ConnectionConfig;
use crate::driver::{Driver, Session};
use crate::error::ConnectError;
use crate::metrics::{counters, histograms, labels};
use crate::{Error, Result};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How long a session that failed its health check gets to say goodbye
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Kind of archiving misconfiguration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// `archive_mode` is neither `on` nor `always`
    ArchivingDisabled,
    /// `archive_command` is empty or `(disabled)`
    ArchiveCommandMissing,
}

impl WarningKind {
    fn label(self) -> &'static str {
        match self {
            WarningKind::ArchivingDisabled => "archiving_disabled",
            WarningKind::ArchiveCommandMissing => "archive_command_missing",
        }
    }
}

/// Non-fatal finding of the health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    /// What is wrong
    pub kind: WarningKind,
    /// Operator-facing text
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A failed attempt, as recorded in the history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    /// Stage of the attempt
    pub stage: AttemptStage,
    /// Host the attempt used
    pub host: String,
    /// Port the attempt used
    pub port: u16,
    /// Rendered driver error
    pub error: String,
}

/// A successful negotiation
#[derive(Debug)]
pub struct Negotiated<S> {
    /// The open session; the caller owns it from here on
    pub session: S,
    /// Archiving warnings, in the order they were found
    pub warnings: Vec<Warning>,
    /// Stage that connected
    pub stage: AttemptStage,
    /// Attempts that failed before `stage`
    pub history: Vec<AttemptFailure>,
    /// Exact config the session was opened with
    pub config: ConnectionConfig,
}

impl<S> Negotiated<S> {
    /// Serializable summary for backup metadata
    pub fn report(&self) -> NegotiationReport {
        NegotiationReport {
            stage: self.stage,
            host: self.config.host().to_string(),
            port: self.config.port(),
            warnings: self.warnings.clone(),
            failed_attempts: self.history.clone(),
        }
    }

    /// Drop the bookkeeping and keep the session
    pub fn into_session(self) -> S {
        self.session
    }
}

/// Summary of how a session was obtained
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationReport {
    /// Stage that connected
    pub stage: AttemptStage,
    /// Host of the session
    pub host: String,
    /// Port of the session
    pub port: u16,
    /// Archiving warnings
    pub warnings: Vec<Warning>,
    /// Attempts that failed first
    pub failed_attempts: Vec<AttemptFailure>,
}

impl NegotiationReport {
    /// Render as JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

type ConfigOption = Box<dyn Fn(&mut ConnectionConfig) -> Result<()> + Send + Sync>;

/// Overall deadline of one negotiation
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

/// Why a guarded call did not produce a value
enum Interrupted {
    /// Cancelled or past the deadline
    Aborted(Error),
    /// The call itself failed
    Failed(Error),
}

/// Retry/fallback policy around a [`Driver`]
pub struct Negotiator<D, O = TracingObserver> {
    driver: D,
    observer: O,
    timeout: Option<Duration>,
    options: Vec<ConfigOption>,
}

impl<D: Driver> Negotiator<D> {
    /// Negotiator reporting through `tracing`
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            observer: TracingObserver,
            timeout: None,
            options: Vec::new(),
        }
    }
}

impl<D: Driver, O: NegotiationObserver> Negotiator<D, O> {
    /// Replace the observer
    pub fn with_observer<P: NegotiationObserver>(self, observer: P) -> Negotiator<D, P> {
        Negotiator {
            driver: self.driver,
            observer,
            timeout: self.timeout,
            options: self.options,
        }
    }

    /// Bound the whole negotiation, health check included
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Register a config option, applied to the working copy before the first attempt
    ///
    /// ```
    /// use pgbackup_connect::{Negotiator, WireDriver};
    ///
    /// let negotiator = Negotiator::new(WireDriver).option(|config| {
    ///     config.set_application_name("wal-archiver");
    ///     Ok(())
    /// });
    /// # drop(negotiator);
    /// ```
    pub fn option<F>(mut self, option: F) -> Self
    where
        F: Fn(&mut ConnectionConfig) -> Result<()> + Send + Sync + 'static,
    {
        self.options.push(Box::new(option));
        self
    }

    /// The wrapped driver
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Run the attempt sequence and the health check
    ///
    /// `base` is never modified. Cancelling `ctx` (or hitting the timeout)
    /// aborts the in-flight attempt or query and makes no further attempts.
    pub async fn negotiate(
        &self,
        ctx: &CancellationToken,
        base: &ConnectionConfig,
    ) -> std::result::Result<Negotiated<D::Session>, ConnectError> {
        let started = Instant::now();
        let deadline = self.timeout.map(|limit| Deadline {
            at: started + limit,
            limit,
        });

        let result = self
            .run(ctx, base, deadline)
            .instrument(tracing::info_span!("negotiate", endpoint = %base.endpoint()))
            .await;

        let outcome = match &result {
            Ok(_) => labels::OUTCOME_SUCCESS,
            Err(err) => err.label(),
        };
        counters::negotiation_completed(outcome);
        histograms::negotiation_duration(outcome, started.elapsed().as_millis() as u64);
        result
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        base: &ConnectionConfig,
        deadline: Option<Deadline>,
    ) -> std::result::Result<Negotiated<D::Session>, ConnectError> {
        if !base.origin().is_trusted() {
            return Err(ConnectError::config_invalid(
                "configuration was not produced by validated parsing",
            ));
        }

        let mut working = base.clone();
        for option in &self.options {
            option(&mut working).map_err(|e| ConnectError::config_invalid(e.to_string()))?;
        }
        working
            .validate()
            .map_err(|e| ConnectError::config_invalid(e.to_string()))?;

        let mut history: Vec<AttemptFailure> = Vec::new();
        let mut last_error = None;

        for stage in plan::stages_for(&working) {
            if ctx.is_cancelled() {
                return Err(ConnectError::Cancelled {
                    stage,
                    history,
                    source: Error::Cancelled,
                });
            }
            if stage == AttemptStage::LocalhostFallback {
                self.observer.localhost_fallback(&history);
            }

            let config = stage.configure(&working);
            let attempt_started = Instant::now();
            let opened = guarded(ctx, deadline, self.driver.open(&config))
                .instrument(tracing::debug_span!(
                    "attempt",
                    stage = stage.label(),
                    endpoint = %config.endpoint()
                ))
                .await;
            histograms::attempt_duration(stage.label(), attempt_started.elapsed().as_millis() as u64);

            match opened {
                Ok(session) => {
                    counters::attempt_completed(stage.label(), labels::OUTCOME_SUCCESS);
                    return self
                        .check_health(ctx, deadline, session, stage, history, config)
                        .await;
                }
                Err(Interrupted::Aborted(source)) => {
                    return Err(ConnectError::Cancelled {
                        stage,
                        history,
                        source,
                    });
                }
                Err(Interrupted::Failed(err)) => {
                    counters::attempt_completed(stage.label(), labels::OUTCOME_FAILURE);
                    let failure = AttemptFailure {
                        stage,
                        host: config.host().to_string(),
                        port: config.port(),
                        error: err.to_string(),
                    };
                    self.observer.attempt_failed(&failure);
                    history.push(failure);
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(source) => Err(ConnectError::NegotiationExhausted { history, source }),
            None => Err(ConnectError::config_invalid("no connection attempt was possible")),
        }
    }

    async fn check_health(
        &self,
        ctx: &CancellationToken,
        deadline: Option<Deadline>,
        mut session: D::Session,
        stage: AttemptStage,
        history: Vec<AttemptFailure>,
        config: ConnectionConfig,
    ) -> std::result::Result<Negotiated<D::Session>, ConnectError> {
        let mut warnings = Vec::new();

        let mut checks = vec![HealthCheck::ArchiveMode];
        while let Some(check) = checks.pop() {
            let value = match guarded(ctx, deadline, session.query_scalar(check.query())).await {
                Ok(value) => value,
                Err(interrupted) => {
                    // The session is unusable for the caller either way
                    let _ = tokio::time::timeout(CLOSE_GRACE, session.close()).await;
                    return Err(match interrupted {
                        Interrupted::Aborted(source) => ConnectError::Cancelled {
                            stage,
                            history,
                            source,
                        },
                        Interrupted::Failed(source) => ConnectError::HealthCheckFailed {
                            check,
                            stage,
                            history,
                            source,
                        },
                    });
                }
            };
            tracing::debug!(%check, %value, "health check");

            let warning = match check {
                HealthCheck::ArchiveMode => {
                    let warning = health::check_archive_mode(&value);
                    if warning.is_none() {
                        checks.push(HealthCheck::ArchiveCommand);
                    }
                    warning
                }
                HealthCheck::ArchiveCommand => health::check_archive_command(&value),
            };
            if let Some(warning) = warning {
                counters::warning_emitted(warning.kind.label());
                self.observer.warning(&warning);
                warnings.push(warning);
            }
        }

        self.observer.connected(stage, &config.endpoint());
        Ok(Negotiated {
            session,
            warnings,
            stage,
            history,
            config,
        })
    }
}

impl<D, O> std::fmt::Debug for Negotiator<D, O>
where
    D: std::fmt::Debug,
    O: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("driver", &self.driver)
            .field("observer", &self.observer)
            .field("timeout", &self.timeout)
            .field("options", &self.options.len())
            .finish()
    }
}

/// Race `fut` against cancellation of `ctx` and the deadline
async fn guarded<T>(
    ctx: &CancellationToken,
    deadline: Option<Deadline>,
    fut: impl Future<Output = Result<T>>,
) -> std::result::Result<T, Interrupted> {
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline.at).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Interrupted::Aborted(Error::Cancelled)),
        _ = expired => Err(Interrupted::Aborted(Error::Timeout(
            deadline.map(|d| d.limit).unwrap_or_default(),
        ))),
        result = fut => result.map_err(Interrupted::Failed),
    }
}
