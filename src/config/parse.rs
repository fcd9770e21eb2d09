//! Trusted configuration parsing
//!
//! Supports:
//! * `postgres://[user[:password]@][host][:port][/database][?key=value&...]`
//! * `postgresql://` as an alias scheme
//! * the empty string, meaning "environment only"
//!
//! `PG*` environment variables supply defaults; anything in the URL wins.
//! Unknown query keys become runtime parameters.

use super::{ConfigOrigin, ConnectionConfig, DEFAULT_PORT, LOCALHOST};
use crate::connection::SslMode;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings gathered from the environment and the URL before defaults apply
#[derive(Debug, Default)]
struct Settings {
    host: Option<String>,
    port: Option<String>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    application_name: Option<String>,
    sslmode: Option<String>,
    sslrootcert: Option<String>,
    connect_timeout: Option<String>,
    runtime_params: BTreeMap<String, String>,
}

impl Settings {
    fn from_env<F>(env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| env(key).filter(|v| !v.is_empty());
        Self {
            host: get("PGHOST"),
            port: get("PGPORT"),
            user: get("PGUSER"),
            password: get("PGPASSWORD"),
            database: get("PGDATABASE"),
            application_name: get("PGAPPNAME"),
            sslmode: get("PGSSLMODE"),
            sslrootcert: get("PGSSLROOTCERT"),
            connect_timeout: get("PGCONNECT_TIMEOUT"),
            runtime_params: BTreeMap::new(),
        }
    }

    /// Apply a `key=value` from the URL query string
    fn apply(&mut self, key: String, value: String) {
        match key.as_str() {
            "host" => self.host = Some(value),
            "port" => self.port = Some(value),
            "user" => self.user = Some(value),
            "password" => self.password = Some(value),
            "dbname" => self.database = Some(value),
            "application_name" => self.application_name = Some(value),
            "sslmode" => self.sslmode = Some(value),
            "sslrootcert" => self.sslrootcert = Some(value),
            "connect_timeout" => self.connect_timeout = Some(value),
            _ => {
                self.runtime_params.insert(key, value);
            }
        }
    }
}

impl ConnectionConfig {
    /// Parse a connection URL, using `PG*` environment variables as defaults
    ///
    /// # Examples
    ///
    /// ```
    /// use pgbackup_connect::config::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::parse("postgres://backup@10.0.0.1:6000/postgres?gp_role=utility")?;
    /// assert_eq!(config.host(), "10.0.0.1");
    /// assert_eq!(config.port(), 6000);
    /// assert_eq!(config.runtime_param("gp_role"), Some("utility"));
    /// # Ok::<(), pgbackup_connect::Error>(())
    /// ```
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_with_env(s, |key| std::env::var(key).ok())
    }

    /// Build a config purely from `PG*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::parse("")
    }

    /// Like [`parse`](Self::parse) with an explicit environment lookup
    pub fn parse_with_env<F>(s: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::from_env(env);
        let s = s.trim();

        let origin = if s.is_empty() {
            ConfigOrigin::Environment
        } else {
            parse_url(s, &mut settings)?;
            ConfigOrigin::ConnectionString
        };

        let config = resolve(settings, origin)?;
        config.validate()?;
        tracing::debug!(endpoint = %config.endpoint(), origin = ?origin, "parsed connection config");
        Ok(config)
    }
}

fn parse_url(s: &str, settings: &mut Settings) -> Result<()> {
    let rest = s
        .strip_prefix("postgres://")
        .or_else(|| s.strip_prefix("postgresql://"))
        .ok_or_else(|| {
            Error::Config("connection string must start with postgres:// or postgresql://".into())
        })?;

    let rest = rest.split_once('#').map_or(rest, |(r, _)| r);
    let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };

    let host_port = match authority.rfind('@') {
        Some(pos) => {
            let userinfo = &authority[..pos];
            match userinfo.split_once(':') {
                Some((user, password)) => {
                    settings.user = Some(percent_decode(user)?);
                    settings.password = Some(percent_decode(password)?);
                }
                None => settings.user = Some(percent_decode(userinfo)?),
            }
            &authority[pos + 1..]
        }
        None => authority,
    };

    if host_port.contains(',') {
        return Err(Error::Config(
            "multiple hosts in one connection string are not supported".into(),
        ));
    }

    let (host, port) = split_host_port(host_port)?;
    if let Some(host) = host {
        settings.host = Some(percent_decode(host)?);
    }
    if let Some(port) = port {
        settings.port = Some(port.to_string());
    }

    if !path.is_empty() {
        settings.database = Some(percent_decode(path)?);
    }

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::Config(format!("query parameter '{}' has no value", pair))
        })?;
        settings.apply(percent_decode(key)?, percent_decode(value)?);
    }

    Ok(())
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
fn split_host_port(s: &str) -> Result<(Option<&str>, Option<&str>)> {
    if s.is_empty() {
        return Ok((None, None));
    }

    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::Config("unterminated IPv6 address".into()))?;
        let host = &rest[..end];
        let port = match &rest[end + 1..] {
            "" => None,
            tail => Some(tail.strip_prefix(':').ok_or_else(|| {
                Error::Config(format!("unexpected characters after IPv6 address: {}", tail))
            })?),
        };
        return Ok((Some(host), port.filter(|p| !p.is_empty())));
    }

    match s.rsplit_once(':') {
        Some((host, port)) => Ok((
            Some(host).filter(|h| !h.is_empty()),
            Some(port).filter(|p| !p.is_empty()),
        )),
        None => Ok((Some(s), None)),
    }
}

fn resolve(settings: Settings, origin: ConfigOrigin) -> Result<ConnectionConfig> {
    let host = settings
        .host
        .or_else(resolve_default_socket_dir)
        .unwrap_or_else(|| LOCALHOST.to_string());

    let port = match settings.port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port '{}'", p)))?,
        None => DEFAULT_PORT,
    };

    let user = settings.user.unwrap_or_else(whoami::username);
    let database = settings.database.unwrap_or_else(|| user.clone());

    let sslmode = match settings.sslmode {
        Some(mode) => mode.parse()?,
        None if host.starts_with('/') => SslMode::Disable,
        None => SslMode::default(),
    };

    let connect_timeout = match settings.connect_timeout {
        Some(t) => parse_connect_timeout(&t)?,
        None => None,
    };

    Ok(ConnectionConfig {
        host,
        port,
        user,
        database,
        password: settings.password,
        application_name: settings.application_name,
        connect_timeout,
        sslmode,
        sslrootcert: settings.sslrootcert.map(PathBuf::from),
        runtime_params: settings.runtime_params,
        origin,
    })
}

/// Seconds; zero means no timeout
fn parse_connect_timeout(s: &str) -> Result<Option<Duration>> {
    let secs = s
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("invalid connect_timeout '{}'", s)))?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

/// First existing standard Unix socket directory
fn resolve_default_socket_dir() -> Option<String> {
    ["/run/postgresql", "/var/run/postgresql", "/tmp"]
        .into_iter()
        .find(|dir| Path::new(dir).is_dir())
        .map(str::to_string)
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| Error::Config(format!("invalid percent-encoding in '{}'", s)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::Config(format!("'{}' is not valid UTF-8", s)))
}
