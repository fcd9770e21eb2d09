//! Authentication mechanisms

pub mod scram;

pub use scram::{ScramError, ScramSha256, ScramVerifier};
