//! Connection configuration
//!
//! A [`ConnectionConfig`] records where it came from. Only configs produced by
//! [`ConnectionConfig::parse`], [`ConnectionConfig::from_env`] or
//! [`ConnectionConfigBuilder::validate`] are trusted by the negotiator; a plain
//! [`ConnectionConfigBuilder::build`] is fine for opening a [`Connection`]
//! directly but is refused by [`Negotiator`].
//!
//! [`Connection`]: crate::connection::Connection
//! [`Negotiator`]: crate::negotiate::Negotiator

mod parse;

use crate::connection::SslMode;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Standard PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// Host name used by the last-resort fallback attempt
pub const LOCALHOST: &str = "localhost";

/// Where a configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigOrigin {
    /// Assembled by hand without validation
    Unvalidated,
    /// Parsed from a connection URL (with environment defaults)
    ConnectionString,
    /// Parsed from `PG*` environment variables only
    Environment,
    /// Built programmatically and validated
    Builder,
}

impl ConfigOrigin {
    /// Whether the negotiator may use a config of this origin
    pub fn is_trusted(self) -> bool {
        !matches!(self, ConfigOrigin::Unvalidated)
    }
}

/// Connection configuration
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    user: String,
    database: String,
    password: Option<String>,
    application_name: Option<String>,
    connect_timeout: Option<Duration>,
    sslmode: SslMode,
    sslrootcert: Option<PathBuf>,
    runtime_params: BTreeMap<String, String>,
    origin: ConfigOrigin,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("application_name", &self.application_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("sslmode", &self.sslmode)
            .field("sslrootcert", &self.sslrootcert)
            .field("runtime_params", &self.runtime_params)
            .field("origin", &self.origin)
            .finish()
    }
}

impl ConnectionConfig {
    /// Start building a configuration by hand
    ///
    /// # Examples
    ///
    /// ```
    /// use pgbackup_connect::config::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::builder()
    ///     .host("db.internal")
    ///     .port(6432)
    ///     .user("backup")
    ///     .database("postgres")
    ///     .validate()?;
    /// assert!(config.origin().is_trusted());
    /// # Ok::<(), pgbackup_connect::Error>(())
    /// ```
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Host name, IP address, or Unix socket directory
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port (also selects the Unix socket file)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// User name
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Database name
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Password, if any
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Application name reported to the server
    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    /// Bound on transport connect plus startup
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// TLS mode
    pub fn sslmode(&self) -> SslMode {
        self.sslmode
    }

    /// Root certificate file used by `verify-ca` / `verify-full`
    pub fn sslrootcert(&self) -> Option<&std::path::Path> {
        self.sslrootcert.as_deref()
    }

    /// Runtime parameters sent in the startup packet
    pub fn runtime_params(&self) -> &BTreeMap<String, String> {
        &self.runtime_params
    }

    /// Look up a single runtime parameter
    pub fn runtime_param(&self, key: &str) -> Option<&str> {
        self.runtime_params.get(key).map(String::as_str)
    }

    /// Where this config came from
    pub fn origin(&self) -> ConfigOrigin {
        self.origin
    }

    /// True when `host` names a Unix socket directory
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }

    /// Full socket path (`{dir}/.s.PGSQL.{port}`) for Unix socket configs
    pub fn socket_path(&self) -> Option<PathBuf> {
        self.is_unix_socket()
            .then(|| PathBuf::from(format!("{}/.s.PGSQL.{}", self.host, self.port)))
    }

    /// `host:port`, for logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Replace the host
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = host.into();
    }

    /// Replace the port
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Set or replace a runtime parameter
    pub fn set_runtime_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.runtime_params.insert(key.into(), value.into());
    }

    /// Remove a runtime parameter, returning its old value
    pub fn remove_runtime_param(&mut self, key: &str) -> Option<String> {
        self.runtime_params.remove(key)
    }

    /// Replace the application name
    pub fn set_application_name(&mut self, name: impl Into<String>) {
        self.application_name = Some(name.into());
    }

    /// Replace the connect timeout
    pub fn set_connect_timeout(&mut self, timeout: Option<Duration>) {
        self.connect_timeout = timeout;
    }

    /// Check the invariants every usable config must satisfy
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must not be 0".into()));
        }
        if self.user.is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }
        if self.database.is_empty() {
            return Err(Error::Config("database must not be empty".into()));
        }
        for (key, value) in &self.runtime_params {
            if key.is_empty() {
                return Err(Error::Config("runtime parameter name must not be empty".into()));
            }
            if key.contains('\0') || value.contains('\0') {
                return Err(Error::Config(format!(
                    "runtime parameter '{}' contains a NUL byte",
                    key.replace('\0', "\\0")
                )));
            }
        }
        if self.is_unix_socket() && self.sslmode.requires_tls() {
            return Err(Error::Config(format!(
                "sslmode={} cannot be used with a Unix socket",
                self.sslmode
            )));
        }
        Ok(())
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    host: String,
    port: u16,
    user: Option<String>,
    database: Option<String>,
    password: Option<String>,
    application_name: Option<String>,
    connect_timeout: Option<Duration>,
    sslmode: SslMode,
    sslrootcert: Option<PathBuf>,
    runtime_params: BTreeMap<String, String>,
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self {
            host: LOCALHOST.to_string(),
            port: DEFAULT_PORT,
            user: None,
            database: None,
            password: None,
            application_name: None,
            connect_timeout: None,
            sslmode: SslMode::default(),
            sslrootcert: None,
            runtime_params: BTreeMap::new(),
        }
    }
}

impl ConnectionConfigBuilder {
    /// Host name, IP address, or Unix socket directory (default: `localhost`)
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port (default: 5432)
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// User name (default: the OS user)
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Database name (default: the user name)
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Application name reported to the server
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Bound on transport connect plus startup
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// TLS mode (default: `prefer`)
    pub fn sslmode(mut self, mode: SslMode) -> Self {
        self.sslmode = mode;
        self
    }

    /// Root certificate file for `verify-ca` / `verify-full`
    pub fn sslrootcert(mut self, path: impl Into<PathBuf>) -> Self {
        self.sslrootcert = Some(path.into());
        self
    }

    /// Add a runtime parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.runtime_params.insert(key.into(), value.into());
        self
    }

    /// Build without validation. The result is not accepted by the negotiator.
    pub fn build(self) -> ConnectionConfig {
        self.finish(ConfigOrigin::Unvalidated)
    }

    /// Build and validate, producing a trusted config
    pub fn validate(self) -> Result<ConnectionConfig> {
        let config = self.finish(ConfigOrigin::Builder);
        config.validate()?;
        Ok(config)
    }

    fn finish(self, origin: ConfigOrigin) -> ConnectionConfig {
        let user = self.user.unwrap_or_else(whoami::username);
        let database = self.database.unwrap_or_else(|| user.clone());
        ConnectionConfig {
            host: self.host,
            port: self.port,
            user,
            database,
            password: self.password,
            application_name: self.application_name,
            connect_timeout: self.connect_timeout,
            sslmode: self.sslmode,
            sslrootcert: self.sslrootcert,
            runtime_params: self.runtime_params,
            origin,
        }
    }
}
