//! Status events broadcast by a [`LiveSession`](super::LiveSession).

use serde::{Deserialize, Serialize};

use super::state::SessionState;

/// Sent on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionState,
    /// Optional human-readable detail (e.g. error message or close reason).
    pub detail: Option<String>,
}

/// Delivered once to the close callback after teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    /// Terminal state the session ended in.
    pub state: SessionState,
    pub detail: Option<String>,
}
