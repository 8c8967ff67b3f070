//! Socket lifecycle state machine

use crate::{Error, Result};

/// Socket lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Constructed, no connect issued
    Idle,

    /// connect() issued, native open in flight
    Connecting,

    /// Handle installed, readable and writable
    Open,

    /// Writable side ended, teardown in progress
    Closing,

    /// Terminal
    Closed,
}

impl SocketState {
    /// Check if transition is valid. Destruction from any state lands on
    /// `Closed`.
    pub fn can_transition_to(&self, next: SocketState) -> bool {
        use SocketState::*;

        matches!(
            (self, next),
            (Idle, Connecting) | (Connecting, Open) | (Open, Closing) | (_, Closed)
        )
    }

    /// Transition to a new state
    pub fn transition(&mut self, next: SocketState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState {
                expected: format!("valid transition from {:?}", self),
                actual: format!("{:?}", next),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Public readiness report, mirroring `socket.readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    /// Readable only; the writable side has ended
    ReadOnly,
    /// Writable only; the readable side has ended
    WriteOnly,
    Closed,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::ReadOnly => write!(f, "readOnly"),
            Self::WriteOnly => write!(f, "writeOnly"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let mut state = SocketState::Idle;
        assert!(state.transition(SocketState::Connecting).is_ok());
        assert!(state.transition(SocketState::Open).is_ok());
        assert!(state.transition(SocketState::Closing).is_ok());
        assert!(state.transition(SocketState::Closed).is_ok());
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = SocketState::Idle;
        assert!(state.transition(SocketState::Open).is_err());
    }

    #[test]
    fn test_close_from_any_state() {
        for start in [
            SocketState::Idle,
            SocketState::Connecting,
            SocketState::Open,
            SocketState::Closing,
        ] {
            let mut state = start;
            assert!(state.transition(SocketState::Closed).is_ok());
        }
    }

    #[test]
    fn test_ready_state_display() {
        assert_eq!(ReadyState::Opening.to_string(), "opening");
        assert_eq!(ReadyState::ReadOnly.to_string(), "readOnly");
        assert_eq!(ReadyState::WriteOnly.to_string(), "writeOnly");
    }
}
