//! Label values shared by counters and histograms

/// No password exchange
pub const MECHANISM_TRUST: &str = "trust";
/// Cleartext password
pub const MECHANISM_CLEARTEXT: &str = "cleartext";
/// SCRAM-SHA-256
pub const MECHANISM_SCRAM: &str = "scram-sha-256";
/// MD5 (always rejected)
pub const MECHANISM_MD5: &str = "md5";
/// Kerberos, GSSAPI, SSPI and anything newer
pub const MECHANISM_OTHER: &str = "other";

/// Attempt or negotiation succeeded
pub const OUTCOME_SUCCESS: &str = "success";
/// Attempt failed
pub const OUTCOME_FAILURE: &str = "failure";
