//! Connection state machine

use crate::{Error, Result};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, nothing sent yet
    Initial,

    /// SSLRequest sent, awaiting the server's S/N byte
    NegotiatingTls,

    /// Startup packet about to be sent
    AwaitingAuth,

    /// Exchanging authentication messages
    Authenticating,

    /// Ready for a query
    Idle,

    /// Query sent, reading its results
    Querying,

    /// Closed; terminal
    Closed,
}

impl ConnectionState {
    /// States reachable in one step (besides `Closed`, which is always reachable)
    fn successors(self) -> &'static [ConnectionState] {
        use ConnectionState::*;
        match self {
            Initial => &[NegotiatingTls, AwaitingAuth],
            NegotiatingTls => &[AwaitingAuth],
            AwaitingAuth => &[Authenticating],
            Authenticating => &[Idle],
            Idle => &[Querying],
            Querying => &[Idle],
            Closed => &[],
        }
    }

    /// Check if transition is valid
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        next == ConnectionState::Closed || self.successors().contains(&next)
    }

    /// Transition to new state
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("a state reachable from {}", self),
                actual: next.to_string(),
            });
        }
        tracing::trace!(from = %self, to = %next, "connection state change");
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::NegotiatingTls => "negotiating_tls",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Authenticating => "authenticating",
            Self::Idle => "idle",
            Self::Querying => "querying",
            Self::Closed => "closed",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_path_without_tls() {
        let mut state = ConnectionState::Initial;
        assert!(state.transition(ConnectionState::AwaitingAuth).is_ok());
        assert!(state.transition(ConnectionState::Authenticating).is_ok());
        assert!(state.transition(ConnectionState::Idle).is_ok());
    }

    #[test]
    fn test_startup_path_with_tls() {
        let mut state = ConnectionState::Initial;
        assert!(state.transition(ConnectionState::NegotiatingTls).is_ok());
        assert!(state.transition(ConnectionState::AwaitingAuth).is_ok());
    }

    #[test]
    fn test_query_cycle() {
        let mut state = ConnectionState::Idle;
        for _ in 0..3 {
            assert!(state.transition(ConnectionState::Querying).is_ok());
            assert!(state.transition(ConnectionState::Idle).is_ok());
        }
    }

    #[test]
    fn test_cannot_skip_authentication() {
        let mut state = ConnectionState::Initial;
        let err = state.transition(ConnectionState::Idle).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(state, ConnectionState::Initial);
    }

    #[test]
    fn test_cannot_query_while_querying() {
        let mut state = ConnectionState::Querying;
        assert!(state.transition(ConnectionState::Querying).is_err());
    }

    #[test]
    fn test_close_from_any_state() {
        for start in [
            ConnectionState::Initial,
            ConnectionState::NegotiatingTls,
            ConnectionState::Authenticating,
            ConnectionState::Querying,
            ConnectionState::Closed,
        ] {
            let mut state = start;
            assert!(state.transition(ConnectionState::Closed).is_ok());
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut state = ConnectionState::Closed;
        assert!(state.transition(ConnectionState::Idle).is_err());
    }
}
