//! Core connection type

use super::state::ConnectionState;
use super::tls::{self, SslMode};
use super::transport::Transport;
use crate::auth::{scram, ScramSha256};
use crate::config::ConnectionConfig;
use crate::metrics::labels;
use crate::protocol::constants::PROTOCOL_VERSION;
use crate::protocol::{
    decode_message, encode_message, AuthenticationMessage, BackendMessage, FrontendMessage,
};
use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::time::Instant;
use tracing::Instrument;

/// Result of a simple query, values in text format
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Column names from the row description
    pub columns: Vec<String>,
    /// Rows; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
    /// Tag of the last CommandComplete (e.g. `SHOW`, `SELECT 1`)
    pub command_tag: Option<String>,
}

impl QueryResult {
    /// The single value of a one-column result (first row)
    pub fn into_scalar(self) -> Result<String> {
        if self.columns.len() != 1 {
            return Err(Error::Protocol(format!(
                "expected a single column, got {}",
                self.columns.len()
            )));
        }
        let row = self
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("query returned no rows".into()))?;
        row.into_iter()
            .next()
            .flatten()
            .ok_or_else(|| Error::Protocol("query returned NULL".into()))
    }
}

/// Postgres connection
///
/// Owns its socket exclusively; queries take `&mut self`, so one query runs at a time.
pub struct Connection {
    transport: Option<Transport>,
    state: ConnectionState,
    read_buf: BytesMut,
    process_id: Option<i32>,
    secret_key: Option<i32>,
    server_params: HashMap<String, String>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("process_id", &self.process_id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create connection from transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Some(transport),
            state: ConnectionState::Initial,
            read_buf: BytesMut::with_capacity(8192),
            process_id: None,
            secret_key: None,
            server_params: HashMap::new(),
        }
    }

    /// Open a transport for `config` and run startup, bounded by its connect timeout
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let establish = async {
            let transport = match config.socket_path() {
                Some(path) => Transport::connect_unix(&path).await?,
                None => Transport::connect_tcp(config.host(), config.port()).await?,
            };
            let mut conn = Connection::new(transport);
            conn.startup(config).await?;
            Ok(conn)
        };

        match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, establish)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => establish.await,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session runs over TLS
    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Value the server reported through ParameterStatus (e.g. `server_version`)
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(String::as_str)
    }

    /// Backend process id from BackendKeyData
    pub fn process_id(&self) -> Option<i32> {
        self.process_id
    }

    /// Secret key from BackendKeyData
    pub fn secret_key(&self) -> Option<i32> {
        self.secret_key
    }

    /// Negotiate TLS upgrade with the server via the SSLRequest protocol.
    ///
    /// If the server answers `N`, plain text is kept unless `sslmode` requires TLS.
    async fn negotiate_tls(&mut self, config: &ConnectionConfig) -> Result<()> {
        let Some(client_config) = tls::client_config(config)? else {
            return Ok(());
        };
        self.state.transition(ConnectionState::NegotiatingTls)?;
        self.send_message(&FrontendMessage::SslRequest).await?;

        while self.read_buf.is_empty() {
            let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
            if transport.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
        let response = self.read_buf[0];
        self.read_buf.advance(1);

        match response {
            b'S' => {
                // Anything already buffered would have bypassed encryption
                if !self.read_buf.is_empty() {
                    return Err(Error::Protocol(
                        "unencrypted data received after SSLRequest response".into(),
                    ));
                }
                let transport = self.transport.take().ok_or(Error::ConnectionClosed)?;
                self.transport = Some(transport.upgrade_to_tls(client_config, config.host()).await?);
                tracing::debug!(sslmode = %config.sslmode(), "TLS established");
                Ok(())
            }
            b'N' if config.sslmode().requires_tls() => Err(Error::Config(format!(
                "server does not support TLS (sslmode={})",
                config.sslmode()
            ))),
            b'N' => {
                tracing::debug!("server declined TLS, continuing unencrypted");
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "unexpected SSLRequest response byte: 0x{:02X}",
                other
            ))),
        }
    }

    /// Perform TLS negotiation, startup and authentication
    pub async fn startup(&mut self, config: &ConnectionConfig) -> Result<()> {
        let started = Instant::now();
        async {
            let over_unix = matches!(self.transport, Some(Transport::Unix(_)));
            if !over_unix && config.sslmode() != SslMode::Disable {
                self.negotiate_tls(config).await?;
            }

            self.state.transition(ConnectionState::AwaitingAuth)?;
            self.send_message(&FrontendMessage::Startup {
                version: PROTOCOL_VERSION,
                params: startup_params(config),
            })
            .await?;

            self.state.transition(ConnectionState::Authenticating)?;
            self.authenticate(config).await?;

            self.state.transition(ConnectionState::Idle)?;
            crate::metrics::histograms::startup_duration(started.elapsed().as_millis() as u64);
            tracing::debug!(tls = self.is_tls(), "startup complete");
            Ok(())
        }
        .instrument(tracing::debug_span!(
            "startup",
            endpoint = %config.endpoint(),
            user = %config.user(),
            database = %config.database()
        ))
        .await
    }

    /// Read authentication requests until ReadyForQuery
    async fn authenticate(&mut self, config: &ConnectionConfig) -> Result<()> {
        let auth_start = Instant::now();
        let mut mechanism = labels::MECHANISM_TRUST;

        loop {
            match self.receive_message().await? {
                BackendMessage::Authentication(auth) => match auth {
                    AuthenticationMessage::Ok => {
                        crate::metrics::counters::auth_successful(mechanism);
                        crate::metrics::histograms::auth_duration(
                            mechanism,
                            auth_start.elapsed().as_millis() as u64,
                        );
                        // ParameterStatus and BackendKeyData follow before ReadyForQuery
                    }
                    AuthenticationMessage::CleartextPassword => {
                        mechanism = labels::MECHANISM_CLEARTEXT;
                        crate::metrics::counters::auth_attempted(mechanism);
                        let password = require_password(config, mechanism)?;
                        self.send_message(&FrontendMessage::Password(password.to_string()))
                            .await?;
                    }
                    AuthenticationMessage::Sasl { mechanisms } => {
                        mechanism = labels::MECHANISM_SCRAM;
                        crate::metrics::counters::auth_attempted(mechanism);
                        self.handle_sasl(&mechanisms, config).await?;
                    }
                    AuthenticationMessage::Md5Password { .. } => {
                        crate::metrics::counters::auth_failed(labels::MECHANISM_MD5, "unsupported");
                        return Err(Error::Authentication(
                            "MD5 authentication not supported, use SCRAM-SHA-256 or cleartext password"
                                .into(),
                        ));
                    }
                    AuthenticationMessage::Other(code) => {
                        crate::metrics::counters::auth_failed(labels::MECHANISM_OTHER, "unsupported");
                        return Err(Error::Authentication(format!(
                            "unsupported authentication method (code {})",
                            code
                        )));
                    }
                    AuthenticationMessage::SaslContinue { .. }
                    | AuthenticationMessage::SaslFinal { .. } => {
                        return Err(Error::Protocol(
                            "SASL message received outside of a SASL exchange".into(),
                        ));
                    }
                },
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = Some(process_id);
                    self.secret_key = Some(secret_key);
                }
                BackendMessage::ParameterStatus { name, value } => {
                    tracing::trace!(%name, %value, "parameter status");
                    self.server_params.insert(name, value);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!(%notice, "notice during startup");
                }
                BackendMessage::ReadyForQuery { .. } => return Ok(()),
                BackendMessage::ErrorResponse(err) => {
                    crate::metrics::counters::auth_failed(mechanism, "server_error");
                    return Err(Error::Authentication(err.to_string()));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during auth: {:?}",
                        other
                    )));
                }
            }
        }
    }

    /// SCRAM-SHA-256 exchange; returns after the server signature checks out
    async fn handle_sasl(&mut self, mechanisms: &[String], config: &ConnectionConfig) -> Result<()> {
        if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
            return Err(Error::Authentication(format!(
                "server does not offer {}; available: {}",
                scram::MECHANISM,
                mechanisms.join(", ")
            )));
        }
        let password = require_password(config, labels::MECHANISM_SCRAM)?;

        let client = ScramSha256::new(password);
        self.send_message(&FrontendMessage::SaslInitialResponse {
            mechanism: scram::MECHANISM.to_string(),
            data: client.client_first().into_bytes(),
        })
        .await?;

        let server_first = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslContinue { data }) => data,
            BackendMessage::ErrorResponse(err) => return Err(Error::Authentication(err.to_string())),
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASLContinue, got {:?}",
                    other
                )))
            }
        };
        let server_first = String::from_utf8(server_first)
            .map_err(|_| Error::Protocol("server-first-message is not UTF-8".into()))?;

        // PBKDF2 runs off the runtime so the attempt stays cancellable
        let (client_final, verifier) =
            tokio::task::spawn_blocking(move || client.handle_server_first(&server_first))
                .await
                .map_err(|e| Error::Authentication(format!("SCRAM key derivation failed: {}", e)))?
                .map_err(|e| Error::Authentication(e.to_string()))?;
        self.send_message(&FrontendMessage::SaslResponse {
            data: client_final.into_bytes(),
        })
        .await?;

        let server_final = match self.receive_message().await? {
            BackendMessage::Authentication(AuthenticationMessage::SaslFinal { data }) => data,
            BackendMessage::ErrorResponse(err) => {
                crate::metrics::counters::auth_failed(labels::MECHANISM_SCRAM, "server_error");
                return Err(Error::Authentication(err.to_string()));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected SASLFinal, got {:?}",
                    other
                )))
            }
        };
        let server_final = String::from_utf8(server_final)
            .map_err(|_| Error::Protocol("server-final-message is not UTF-8".into()))?;

        verifier.verify(&server_final).map_err(|e| {
            crate::metrics::counters::auth_failed(labels::MECHANISM_SCRAM, "bad_server_signature");
            Error::Authentication(e.to_string())
        })
    }

    /// Execute a simple query, collecting every row as text
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        if self.state != ConnectionState::Idle {
            return Err(Error::ConnectionBusy(format!(
                "connection in state: {}",
                self.state
            )));
        }
        self.state.transition(ConnectionState::Querying)?;
        self.send_message(&FrontendMessage::Query(sql.to_string()))
            .await?;

        let mut result = QueryResult::default();
        let mut server_error = None;
        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription(fields) => {
                    result.columns = fields.into_iter().map(|f| f.name).collect();
                    result.rows.clear();
                }
                BackendMessage::DataRow(values) => {
                    let row = values
                        .into_iter()
                        .map(|v| v.map(|b| text_value(&b)).transpose())
                        .collect::<Result<Vec<_>>>()?;
                    result.rows.push(row);
                }
                BackendMessage::CommandComplete(tag) => result.command_tag = Some(tag),
                BackendMessage::EmptyQueryResponse => {}
                BackendMessage::ErrorResponse(err) => {
                    // Keep reading: the server still sends ReadyForQuery
                    server_error.get_or_insert(err);
                }
                BackendMessage::NoticeResponse(notice) => {
                    tracing::debug!(%notice, "notice");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_params.insert(name, value);
                }
                BackendMessage::ReadyForQuery { .. } => break,
                BackendMessage::Unknown { tag } => {
                    tracing::trace!(tag, "skipping unhandled message");
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in query response: {:?}",
                        other
                    )));
                }
            }
        }
        self.state.transition(ConnectionState::Idle)?;

        let status = if server_error.is_some() { "error" } else { "ok" };
        crate::metrics::counters::query_completed(status);
        match server_error {
            Some(err) => Err(Error::Sql(err.to_string())),
            None => Ok(result),
        }
    }

    /// Run a query expected to yield a single text value, e.g. `SHOW archive_mode`
    pub async fn query_scalar(&mut self, sql: &str) -> Result<String> {
        self.simple_query(sql)
            .instrument(tracing::debug_span!("query_scalar", sql))
            .await?
            .into_scalar()
    }

    fn transport(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or(Error::ConnectionClosed)
    }

    async fn send_message(&mut self, msg: &FrontendMessage) -> Result<()> {
        let buf = encode_message(msg)?;
        self.transport()?.send(&buf).await
    }

    async fn receive_message(&mut self) -> Result<BackendMessage> {
        loop {
            let decoded =
                decode_message(&self.read_buf).map_err(|e| Error::Protocol(e.to_string()))?;
            if let Some((msg, consumed)) = decoded {
                self.read_buf.advance(consumed);
                return Ok(msg);
            }

            let Some(transport) = self.transport.as_mut() else {
                return Err(Error::ConnectionClosed);
            };
            if transport.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    /// Send Terminate and shut the socket down
    pub async fn close(mut self) -> Result<()> {
        self.state.transition(ConnectionState::Closed)?;
        let _ = self.send_message(&FrontendMessage::Terminate).await;
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown().await?;
        }
        Ok(())
    }
}

/// Startup parameters in send order: user, database, application_name, then runtime params
fn startup_params(config: &ConnectionConfig) -> Vec<(String, String)> {
    let mut params = vec![
        ("user".to_string(), config.user().to_string()),
        ("database".to_string(), config.database().to_string()),
    ];
    if let Some(name) = config.application_name() {
        params.push(("application_name".to_string(), name.to_string()));
    }
    params.extend(
        config
            .runtime_params()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    params
}

fn require_password<'a>(config: &'a ConnectionConfig, mechanism: &'static str) -> Result<&'a str> {
    config.password().ok_or_else(|| {
        crate::metrics::counters::auth_failed(mechanism, "no_password");
        Error::Authentication(format!("server requested {} but no password is configured", mechanism))
    })
}

fn text_value(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Protocol("column value is not valid UTF-8".into()))
}
