//! Protocol message types

use bytes::Bytes;

/// Frontend message (client → server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Startup packet with its parameters, in send order
    Startup {
        /// Protocol version
        version: i32,
        /// Connection parameters
        params: Vec<(String, String)>,
    },

    /// Cleartext password
    Password(String),

    /// First SASL message, naming the chosen mechanism
    SaslInitialResponse {
        /// Mechanism name (e.g. `SCRAM-SHA-256`)
        mechanism: String,
        /// Client-first message
        data: Vec<u8>,
    },

    /// Subsequent SASL message
    SaslResponse {
        /// Client-final message
        data: Vec<u8>,
    },

    /// Simple query
    Query(String),

    /// Terminate
    Terminate,

    /// SSLRequest (TLS negotiation)
    SslRequest,
}

/// Backend message (server → client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// Authentication request
    Authentication(AuthenticationMessage),

    /// Backend key data (for cancellation)
    BackendKeyData {
        /// Process ID
        process_id: i32,
        /// Secret key
        secret_key: i32,
    },

    /// Command complete, carrying the command tag
    CommandComplete(String),

    /// Data row; `None` is SQL NULL
    DataRow(Vec<Option<Bytes>>),

    /// Response to an empty query string
    EmptyQueryResponse,

    /// Error response
    ErrorResponse(ErrorFields),

    /// Notice response
    NoticeResponse(ErrorFields),

    /// Parameter status
    ParameterStatus {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },

    /// Ready for query
    ReadyForQuery {
        /// Transaction status
        status: u8,
    },

    /// Row description
    RowDescription(Vec<FieldDescription>),

    /// A message this client does not interpret
    Unknown {
        /// Message tag
        tag: u8,
    },
}

/// Authentication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationMessage {
    /// Authentication OK
    Ok,

    /// Cleartext password required
    CleartextPassword,

    /// MD5 password required
    Md5Password {
        /// Salt for the MD5 hash
        salt: [u8; 4],
    },

    /// SASL mechanisms offered
    Sasl {
        /// Mechanism names (e.g. `["SCRAM-SHA-256"]`)
        mechanisms: Vec<String>,
    },

    /// SASL server challenge
    SaslContinue {
        /// Server-first message
        data: Vec<u8>,
    },

    /// SASL outcome
    SaslFinal {
        /// Server-final message
        data: Vec<u8>,
    },

    /// Any other method (Kerberos, GSSAPI, SSPI, ...)
    Other(i32),
}

/// Column metadata from RowDescription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: u32,
    /// Format code (0 = text, 1 = binary)
    pub format_code: i16,
}

/// Error/notice fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity (ERROR, FATAL, WARNING, ...)
    pub severity: Option<String>,
    /// SQLSTATE code
    pub code: Option<String>,
    /// Human-readable message
    pub message: Option<String>,
    /// Additional detail
    pub detail: Option<String>,
    /// Hint
    pub hint: Option<String>,
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref severity) = self.severity {
            write!(f, "{}: ", severity)?;
        }
        f.write_str(self.message.as_deref().unwrap_or("unknown server error"))?;
        if let Some(ref code) = self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(ref detail) = self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fields_display() {
        let fields = ErrorFields {
            severity: Some("FATAL".into()),
            code: Some("28000".into()),
            message: Some("no pg_hba.conf entry".into()),
            ..Default::default()
        };
        assert_eq!(
            fields.to_string(),
            "FATAL: no pg_hba.conf entry (SQLSTATE 28000)"
        );
    }

    #[test]
    fn test_error_fields_display_without_message() {
        assert_eq!(ErrorFields::default().to_string(), "unknown server error");
    }
}
