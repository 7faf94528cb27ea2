//! Session lifecycle states.
//!
//! ```text
//! Connecting ──► Active ──► Error
//!     │            └──────► Closed
//!     ├──────────────────► Error
//!     └──────────────────► Closed
//! ```
//!
//! `Error` and `Closed` are terminal.

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Devices opening and remote session being requested. No audio leaves.
    Connecting,
    /// Remote confirmed; capture transmits and playback schedules.
    Active,
    /// Device, permission or remote failure.
    Error,
    /// Remote hangup or local close.
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Error | SessionState::Closed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Error)
                | (Connecting, Closed)
                | (Active, Error)
                | (Active, Closed)
        )
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// `ParleyError::InvalidTransition` when the edge does not exist; the
    /// state is left unchanged.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(ParleyError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Error => "error",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::{self, *};

    #[test]
    fn forward_edges_are_allowed() {
        let mut s = Connecting;
        s.transition(Active).unwrap();
        s.transition(Closed).unwrap();
        assert!(s.is_terminal());

        let mut s = Connecting;
        s.transition(Error).unwrap();
        assert_eq!(s, Error);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [Error, Closed] {
            for next in [Connecting, Active, Error, Closed] {
                let mut s = terminal;
                assert!(s.transition(next).is_err());
                assert_eq!(s, terminal);
            }
        }
    }

    #[test]
    fn no_backward_or_self_edges() {
        assert!(!Active.can_transition_to(Connecting));
        assert!(!Active.can_transition_to(Active));
        assert!(!Connecting.can_transition_to(Connecting));
    }

    #[test]
    fn serializes_lowercase() {
        let s: SessionState = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(s, Active);
        assert_eq!(serde_json::to_string(&Closed).unwrap(), "\"closed\"");
        assert_eq!(Error.to_string(), "error");
    }
}
