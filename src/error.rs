//! Error types
//!
//! Two layers:
//! * [`Error`] is what a single driver operation (connect, query, close) fails with
//! * [`ConnectError`] is what a whole negotiation fails with

use crate::negotiate::{AttemptFailure, AttemptStage, HealthCheck};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Driver-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file I/O failed
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or unsupported configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The server sent something the client did not expect
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected our credentials, or no usable auth method exists
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server reported an error for a query
    #[error("sql error: {0}")]
    Sql(String),

    /// The server closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection cannot accept a query in its current state
    #[error("connection busy: {0}")]
    ConnectionBusy(String),

    /// Internal state machine violation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The operation was cancelled through its context
    #[error("operation cancelled")]
    Cancelled,

    /// The operation hit its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether this error came from cancellation or a deadline rather than the server.
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout(_))
    }

    /// Short label for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::Protocol(_) => "protocol",
            Error::Authentication(_) => "authentication",
            Error::Sql(_) => "sql",
            Error::ConnectionClosed => "connection_closed",
            Error::ConnectionBusy(_) => "connection_busy",
            Error::InvalidState { .. } => "invalid_state",
            Error::Cancelled => "cancelled",
            Error::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a [`ConnectError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Config did not come from trusted parsing, or an option broke it
    ConfigInvalid,
    /// Connected, but archive settings could not be read
    HealthCheckFailed,
    /// Every attempt failed
    NegotiationExhausted,
    /// Context cancelled or deadline reached
    Cancelled,
}

/// Terminal failure of a negotiation
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Refused before any attempt was made
    #[error("connect: refusing to negotiate with an untrusted configuration: {reason}")]
    ConfigInvalid {
        /// What made the config unacceptable
        reason: String,
    },

    /// A session was opened but the archiving check query failed
    #[error("connect: postgres {check} test failed (connected via {stage})")]
    HealthCheckFailed {
        /// Which check failed
        check: HealthCheck,
        /// Attempt that produced the session
        stage: AttemptStage,
        /// Failed attempts that preceded the successful one
        history: Vec<AttemptFailure>,
        /// Underlying query error
        #[source]
        source: Error,
    },

    /// All attempts failed; `source` is the failure of the last one
    #[error("connect: postgres connection failed after {} attempt(s), last via {}", history.len(), last_stage(history))]
    NegotiationExhausted {
        /// Every attempt in the order it was made
        history: Vec<AttemptFailure>,
        /// Error of the last attempt
        #[source]
        source: Error,
    },

    /// Negotiation aborted by the context
    #[error("connect: negotiation aborted during {stage}")]
    Cancelled {
        /// Stage in flight when the abort happened
        stage: AttemptStage,
        /// Attempts that failed before the abort
        history: Vec<AttemptFailure>,
        /// [`Error::Cancelled`] or [`Error::Timeout`]
        #[source]
        source: Error,
    },
}

fn last_stage(history: &[AttemptFailure]) -> String {
    history
        .last()
        .map(|f| f.stage.to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl ConnectError {
    /// Error classification
    pub fn kind(&self) -> ConnectErrorKind {
        match self {
            ConnectError::ConfigInvalid { .. } => ConnectErrorKind::ConfigInvalid,
            ConnectError::HealthCheckFailed { .. } => ConnectErrorKind::HealthCheckFailed,
            ConnectError::NegotiationExhausted { .. } => ConnectErrorKind::NegotiationExhausted,
            ConnectError::Cancelled { .. } => ConnectErrorKind::Cancelled,
        }
    }

    /// Failed attempts recorded before the negotiation ended
    pub fn history(&self) -> &[AttemptFailure] {
        match self {
            ConnectError::ConfigInvalid { .. } => &[],
            ConnectError::HealthCheckFailed { history, .. }
            | ConnectError::NegotiationExhausted { history, .. }
            | ConnectError::Cancelled { history, .. } => history,
        }
    }

    pub(crate) fn config_invalid(reason: impl Into<String>) -> Self {
        ConnectError::ConfigInvalid {
            reason: reason.into(),
        }
    }

    /// Label for metrics
    pub(crate) fn label(&self) -> &'static str {
        match self.kind() {
            ConnectErrorKind::ConfigInvalid => "config_invalid",
            ConnectErrorKind::HealthCheckFailed => "health_check_failed",
            ConnectErrorKind::NegotiationExhausted => "exhausted",
            ConnectErrorKind::Cancelled => "cancelled",
        }
    }
}
