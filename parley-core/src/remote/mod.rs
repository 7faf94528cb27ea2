//! Remote live-session boundary.
//!
//! A [`RemoteConnector`] opens one bidirectional session. The session owns
//! the outbound sender (fed by capture) and hands the receiving end to the
//! connector; the connector returns a [`RemoteLink`] whose inbound channel
//! delivers [`InboundMessage`]s in arrival order.

pub mod protocol;

#[cfg(feature = "ws")]
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Message sent to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    /// One capture frame: base64 PCM with its MIME descriptor.
    #[serde(rename_all = "camelCase")]
    Audio { data: String, mime_type: String },
}

/// Message received from the remote, already mapped out of the wire envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundMessage {
    /// Session confirmed; capture may start transmitting.
    Ready,
    /// Speech chunk: base64 PCM at the negotiated output rate.
    #[serde(rename_all = "camelCase")]
    Audio { data: String, mime_type: String },
    /// The current utterance was interrupted (barge-in).
    Interrupted,
    TurnComplete,
    /// The remote hung up.
    Closed { reason: Option<String> },
    Error { message: String },
}

/// Everything the remote needs to configure a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    /// Response modality requested from the remote, e.g. `AUDIO`.
    pub response_modality: String,
    pub system_instruction: String,
}

/// Close side of an established remote session.
pub trait RemoteHandle: Send {
    /// Release the session. Must be safe to call more than once.
    fn close(&mut self);
}

/// An established remote session.
pub struct RemoteLink {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub handle: Box<dyn RemoteHandle>,
}

impl std::fmt::Debug for RemoteLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLink").finish_non_exhaustive()
    }
}

/// Opens remote sessions.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Open a session configured by `setup`, transmitting whatever arrives
    /// on `outbound`.
    ///
    /// # Errors
    /// Returns `ParleyError::RemoteSession` when the remote cannot be reached
    /// or rejects the setup.
    async fn connect(
        &self,
        setup: &SessionSetup,
        outbound: mpsc::Receiver<OutboundMessage>,
    ) -> Result<RemoteLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_serialize_tagged_camel_case() {
        let out = OutboundMessage::Audio {
            data: "AAA=".into(),
            mime_type: "audio/pcm;rate=16000".into(),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["mimeType"], "audio/pcm;rate=16000");

        let json = serde_json::to_value(InboundMessage::TurnComplete).unwrap();
        assert_eq!(json["type"], "turnComplete");
    }
}
