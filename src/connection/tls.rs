//! TLS negotiation support
//!
//! Maps libpq `sslmode` semantics onto a rustls [`ClientConfig`]:
//! * `prefer` / `require`: encrypt, accept any certificate
//! * `verify-ca`: certificate chain must validate, name is not checked
//! * `verify-full`: chain and host name must validate

use crate::config::ConnectionConfig;
use crate::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::path::Path;
use std::sync::Arc;

/// SSL/TLS mode matching the PostgreSQL `sslmode` parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never use TLS
    Disable,
    /// Use TLS when the server offers it, otherwise plaintext
    ///
    /// Only a server that declines the SSLRequest gets a plaintext session. A
    /// handshake that fails after the server accepted is an error, with no
    /// plaintext retry.
    #[default]
    Prefer,
    /// TLS mandatory, certificate not verified
    Require,
    /// TLS mandatory, certificate chain verified
    VerifyCa,
    /// TLS mandatory, certificate chain and host name verified
    VerifyFull,
}

impl SslMode {
    /// Whether a plaintext connection is unacceptable
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Require | Self::VerifyCa | Self::VerifyFull)
    }

    /// Whether the server certificate must chain to a trusted root
    pub fn requires_verification(&self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disable => "disable",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        })
    }
}

impl std::str::FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            _ => Err(Error::Config(format!(
                "invalid sslmode '{}': expected disable, prefer, require, verify-ca, or verify-full",
                s
            ))),
        }
    }
}

/// Build the rustls client configuration for `config`.
///
/// Returns `None` when the mode does not use TLS at all.
pub fn client_config(config: &ConnectionConfig) -> Result<Option<Arc<ClientConfig>>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let verifier: Arc<dyn ServerCertVerifier> = match config.sslmode() {
        SslMode::Disable => return Ok(None),
        SslMode::Prefer | SslMode::Require => Arc::new(AcceptAnyCert {
            provider: provider.clone(),
        }),
        mode @ (SslMode::VerifyCa | SslMode::VerifyFull) => {
            let roots = Arc::new(load_roots(config.sslrootcert())?);
            let webpki = WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                .build()
                .map_err(|e| Error::Config(format!("cannot build certificate verifier: {}", e)))?;
            if mode == SslMode::VerifyFull {
                webpki as Arc<dyn ServerCertVerifier>
            } else {
                Arc::new(IgnoreHostname { inner: webpki })
            }
        }
    };

    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("unsupported TLS protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    Ok(Some(Arc::new(client)))
}

/// Server name for SNI and certificate checks; accepts DNS names and IP addresses
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_end_matches('.');
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::Config(format!("invalid hostname for TLS: '{}'", host)))
}

fn load_roots(ca_path: Option<&Path>) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();

    if let Some(path) = ca_path {
        let pem = std::fs::read(path).map_err(|e| {
            Error::Config(format!(
                "failed to read root certificate '{}': {}",
                path.display(),
                e
            ))
        })?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                Error::Config(format!(
                    "failed to parse root certificate '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            store
                .add(cert)
                .map_err(|e| Error::Config(format!("rejected root certificate: {}", e)))?;
        }
        if store.is_empty() {
            return Err(Error::Config(format!(
                "no certificates found in '{}'",
                path.display()
            )));
        }
        return Ok(store);
    }

    let native = rustls_native_certs::load_native_certs();
    let (added, _ignored) = store.add_parsable_certificates(native.certs);
    if added == 0 {
        tracing::warn!(
            errors = native.errors.len(),
            "no system root certificates found, falling back to bundled webpki roots"
        );
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(store)
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Full chain verification minus the host name check (`verify-ca`)
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(ref e)) if is_name_mismatch(e) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn is_name_mismatch(e: &CertificateError) -> bool {
    matches!(
        e,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_mismatch_variants() {
        assert!(is_name_mismatch(&CertificateError::NotValidForName));
        assert!(is_name_mismatch(&CertificateError::NotValidForNameContext {
            expected: ServerName::try_from("db.example.com").unwrap().to_owned(),
            presented: vec!["other.example.com".into()],
        }));
        assert!(!is_name_mismatch(&CertificateError::Expired));
        assert!(!is_name_mismatch(&CertificateError::UnknownIssuer));
    }

    fn config_with(mode: SslMode) -> ConnectionConfig {
        ConnectionConfig::builder()
            .host("db.example.com")
            .user("u")
            .sslmode(mode)
            .build()
    }

    #[test]
    fn test_ssl_mode_from_str() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("prefer".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert_eq!("require".parse::<SslMode>().unwrap(), SslMode::Require);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!(
            "verify-full".parse::<SslMode>().unwrap(),
            SslMode::VerifyFull
        );
        assert!("allow".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_ssl_mode_display_roundtrips_names() {
        for mode in [
            SslMode::Disable,
            SslMode::Prefer,
            SslMode::Require,
            SslMode::VerifyCa,
            SslMode::VerifyFull,
        ] {
            assert_eq!(mode.to_string().parse::<SslMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_ssl_mode_default_is_prefer() {
        assert_eq!(SslMode::default(), SslMode::Prefer);
        assert!(!SslMode::Prefer.requires_tls());
        assert!(SslMode::Require.requires_tls());
        assert!(!SslMode::Require.requires_verification());
        assert!(SslMode::VerifyFull.requires_verification());
    }

    #[test]
    fn test_disable_has_no_client_config() {
        assert!(client_config(&config_with(SslMode::Disable))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_require_builds_client_config() {
        assert!(client_config(&config_with(SslMode::Require))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_missing_root_cert_file_fails() {
        let config = ConnectionConfig::builder()
            .user("u")
            .sslmode(SslMode::VerifyFull)
            .sslrootcert("/nonexistent/root.crt")
            .build();
        assert!(matches!(client_config(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_server_name_accepts_ip_and_dns() {
        assert!(server_name("10.0.0.1").is_ok());
        assert!(server_name("db.example.com.").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
