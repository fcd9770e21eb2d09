//! Seam between the negotiator and whatever speaks the wire protocol
//!
//! The negotiator only needs to open a session for a config, run scalar
//! queries on it and close it. [`WireDriver`] is the bundled implementation;
//! tests substitute scripted doubles.

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::Result;
use std::future::Future;

/// Opens sessions
pub trait Driver: Send + Sync {
    /// Session type produced by [`Driver::open`]
    type Session: Session;

    /// Connect and authenticate with exactly the given config
    fn open(&self, config: &ConnectionConfig) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// An established, authenticated session
pub trait Session: Send {
    /// Run a query that yields one text value
    fn query_scalar(&mut self, sql: &str) -> impl Future<Output = Result<String>> + Send;

    /// Release the session
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// Driver backed by [`Connection`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WireDriver;

impl Driver for WireDriver {
    type Session = Connection;

    async fn open(&self, config: &ConnectionConfig) -> Result<Connection> {
        Connection::connect(config).await
    }
}

impl Session for Connection {
    async fn query_scalar(&mut self, sql: &str) -> Result<String> {
        Connection::query_scalar(self, sql).await
    }

    async fn close(self) -> Result<()> {
        Connection::close(self).await
    }
}
