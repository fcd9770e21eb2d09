//! Connection management
//!
//! This module handles:
//! * Transport abstraction (TCP, TLS, Unix socket)
//! * Connection lifecycle (startup, auth, simple queries)
//! * State machine enforcement
//! * TLS configuration per `sslmode`

mod conn;
mod state;
mod tls;
mod transport;

pub use conn::{Connection, QueryResult};
pub use state::ConnectionState;
pub use tls::{client_config, server_name, SslMode};
pub use transport::Transport;
