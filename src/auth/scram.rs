//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677) as used by PostgreSQL 10+
//!
//! The exchange is modelled as two steps that consume their state, so a
//! server-final message can only be checked against the exchange it belongs to:
//!
//! ```text
//! ScramSha256::new ──client_first()──▶ server-first ──handle_server_first()──▶ ScramVerifier
//! ScramVerifier ──verify(server-final)──▶ Ok(())
//! ```
//!
//! PostgreSQL takes the user name from the startup packet, so the SCRAM
//! `n=` attribute is sent empty. Channel binding is not offered.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// SASL mechanism name
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "client does not support channel binding"
const GS2_HEADER: &str = "n,,";

/// Upper bound on the PBKDF2 iteration count a server may request
pub const MAX_ITERATIONS: u32 = 1_000_000;

/// SCRAM exchange failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    /// The server message could not be parsed or was inconsistent
    #[error("invalid server message: {0}")]
    InvalidServerMessage(String),
    /// The server signature did not match; the server does not know the password
    #[error("server signature verification failed")]
    InvalidServerSignature,
    /// The server reported an error in its final message
    #[error("server rejected authentication: {0}")]
    ServerError(String),
}

/// Client side of a SCRAM-SHA-256 exchange
pub struct ScramSha256 {
    password: String,
    nonce: String,
}

impl std::fmt::Debug for ScramSha256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramSha256")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl ScramSha256 {
    /// Start an exchange with a fresh random nonce
    pub fn new(password: impl Into<String>) -> Self {
        let mut raw = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce(password, BASE64.encode(raw))
    }

    fn with_nonce(password: impl Into<String>, nonce: String) -> Self {
        Self {
            password: password.into(),
            nonce,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.nonce)
    }

    /// client-first-message, sent in SASLInitialResponse
    pub fn client_first(&self) -> String {
        format!("{}{}", GS2_HEADER, self.client_first_bare())
    }

    /// Consume server-first-message; returns client-final-message and the verifier
    pub fn handle_server_first(self, server_first: &str) -> Result<(String, ScramVerifier), ScramError> {
        let ServerFirst {
            nonce,
            salt,
            iterations,
        } = ServerFirst::parse(server_first)?;

        if !nonce.starts_with(&self.nonce) || nonce.len() == self.nonce.len() {
            return Err(ScramError::InvalidServerMessage(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let salted = salted_password(&self.password, &salt, iterations);
        let client_key = hmac(&salted, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c={},r={}", BASE64.encode(GS2_HEADER), nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let signature = hmac(&stored_key, auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let client_final = format!("{},p={}", without_proof, BASE64.encode(proof));
        let verifier = ScramVerifier {
            expected: hmac(&hmac(&salted, b"Server Key"), auth_message.as_bytes()),
        };
        Ok((client_final, verifier))
    }
}

/// Checks the server-final-message of one exchange
#[derive(Debug)]
pub struct ScramVerifier {
    expected: [u8; 32],
}

impl ScramVerifier {
    /// Verify `v=<signature>`; `e=<reason>` becomes [`ScramError::ServerError`]
    pub fn verify(self, server_final: &str) -> Result<(), ScramError> {
        let mut signature = None;
        for attr in server_final.split(',') {
            if let Some(reason) = attr.strip_prefix("e=") {
                return Err(ScramError::ServerError(reason.to_string()));
            }
            if let Some(v) = attr.strip_prefix("v=") {
                signature = Some(v);
            }
        }

        let signature = signature
            .ok_or_else(|| ScramError::InvalidServerMessage("missing server signature".into()))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| ScramError::InvalidServerMessage("server signature is not base64".into()))?;

        if constant_time_eq(&signature, &self.expected) {
            Ok(())
        } else {
            Err(ScramError::InvalidServerSignature)
        }
    }
}

#[derive(Debug)]
struct ServerFirst {
    nonce: String,
    salt: Vec<u8>,
    iterations: u32,
}

impl ServerFirst {
    fn parse(msg: &str) -> Result<Self, ScramError> {
        let invalid = |what: &str| ScramError::InvalidServerMessage(what.to_string());
        let (mut nonce, mut salt, mut iterations) = (None, None, None);

        for attr in msg.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) if !v.is_empty() => nonce = Some(v),
                Some(("s", v)) if !v.is_empty() => salt = Some(v),
                Some(("i", v)) if !v.is_empty() => iterations = Some(v),
                Some(("m", _)) => return Err(invalid("mandatory extension not supported")),
                _ => {}
            }
        }

        let salt = BASE64
            .decode(salt.ok_or_else(|| invalid("missing salt"))?)
            .map_err(|_| invalid("salt is not base64"))?;
        let iterations = iterations
            .ok_or_else(|| invalid("missing iteration count"))?
            .parse::<u32>()
            .ok()
            .filter(|&i| i > 0)
            .ok_or_else(|| invalid("iteration count must be a positive integer"))?;
        if iterations > MAX_ITERATIONS {
            return Err(invalid("iteration count exceeds limit"));
        }

        Ok(Self {
            nonce: nonce.ok_or_else(|| invalid("missing nonce"))?.to_string(),
            salt,
            iterations,
        })
    }
}

fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
