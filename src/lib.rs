//! pgbackup-connect: resilient PostgreSQL / Greenplum connection negotiation
//! for backup agents.
//!
//! A backup agent is usually pointed at a server through `PG*` environment
//! variables and has to cope with whatever it finds there: a standalone
//! PostgreSQL, a Greenplum segment that only accepts utility-mode sessions,
//! or a stale `PGHOST` on a machine whose local server is the right one.
//! The [`Negotiator`] walks through those cases in a fixed order and then
//! verifies that WAL archiving is configured, so a backup never starts
//! silently on a server whose archive status is unknown.
//!
//! # Crate layout
//!
//! * [`config`]: trusted configuration parsing (URL + environment) and builder
//! * [`negotiate`]: attempt sequence, health check, observer hook
//! * [`driver`]: the seam the negotiator is generic over
//! * [`connection`], [`protocol`], [`auth`]: the bundled wire-protocol driver
//! * [`metrics`]: counters and histograms through the `metrics` facade
//!
//! # Example
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), pgbackup_connect::ConnectError> {
//! let ctx = CancellationToken::new();
//! let negotiated = pgbackup_connect::connect(&ctx).await?;
//! for warning in &negotiated.warnings {
//!     eprintln!("WARNING: {}", warning);
//! }
//! let mut conn = negotiated.into_session();
//! let version = conn.query_scalar("show server_version").await;
//! # let _ = version;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod negotiate;
pub mod protocol;

pub use config::{ConfigOrigin, ConnectionConfig, ConnectionConfigBuilder};
pub use connection::{Connection, SslMode};
pub use driver::{Driver, Session, WireDriver};
pub use error::{ConnectError, ConnectErrorKind, Error, Result};
pub use negotiate::{
    AttemptFailure, AttemptStage, HealthCheck, Negotiated, NegotiationObserver,
    NegotiationReport, Negotiator, TracingObserver, Warning, WarningKind,
};

use tokio_util::sync::CancellationToken;

/// Negotiate a session from the `PG*` environment with the bundled driver
pub async fn connect(
    ctx: &CancellationToken,
) -> std::result::Result<Negotiated<Connection>, ConnectError> {
    let config = ConnectionConfig::from_env().map_err(|e| {
        ConnectError::config_invalid(format!("unable to read environment variables: {}", e))
    })?;
    Negotiator::new(WireDriver).negotiate(ctx, &config).await
}
