//! JSON envelope of the live audio session protocol.
//!
//! Client frames are externally tagged objects (`{"setup": ...}`,
//! `{"realtimeInput": ...}`). Server frames carry any combination of
//! `setupComplete`, `serverContent` and `goAway`; one server frame may map
//! to several [`InboundMessage`]s.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{InboundMessage, OutboundMessage, SessionSetup};
use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    /// First frame of every session.
    pub fn setup(setup: &SessionSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };
        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![setup.response_modality.clone()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<OutboundMessage> for ClientMessage {
    fn from(message: OutboundMessage) -> Self {
        match message {
            OutboundMessage::Audio { data, mime_type } => ClientMessage::RealtimeInput(RealtimeInput {
                media_chunks: vec![Blob { mime_type, data }],
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<Blob>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ServerMessage {
    /// Flatten into session messages.
    ///
    /// An interruption is emitted before any audio in the same frame, so
    /// audio carried alongside it starts the new timeline.
    pub fn into_inbound(self) -> Vec<InboundMessage> {
        let mut out = Vec::new();
        if self.setup_complete.is_some() {
            out.push(InboundMessage::Ready);
        }
        if let Some(content) = self.server_content {
            if content.interrupted {
                out.push(InboundMessage::Interrupted);
            }
            for part in content.model_turn.into_iter().flat_map(|t| t.parts) {
                if let Some(text) = part.text {
                    debug!(len = text.len(), "ignoring text part");
                }
                match part.inline_data {
                    Some(blob) if blob.mime_type.starts_with("audio/") => {
                        out.push(InboundMessage::Audio {
                            data: blob.data,
                            mime_type: blob.mime_type,
                        });
                    }
                    Some(blob) => debug!(mime_type = %blob.mime_type, "ignoring non-audio part"),
                    None => {}
                }
            }
            if content.turn_complete {
                out.push(InboundMessage::TurnComplete);
            }
        }
        if let Some(go_away) = self.go_away {
            debug!(%go_away, "remote announced disconnect");
        }
        out
    }
}

/// Parse one server text frame.
///
/// # Errors
/// `ParleyError::Protocol` when the frame is not a JSON object of the
/// expected shape.
pub fn parse_server_message(text: &str) -> Result<Vec<InboundMessage>> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| ParleyError::Protocol(format!("bad server frame: {e}")))?;
    Ok(message.into_inbound())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> SessionSetup {
        SessionSetup {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".into(),
            voice: "Zephyr".into(),
            response_modality: "AUDIO".into(),
            system_instruction: "Be brief.".into(),
        }
    }

    #[test]
    fn setup_frame_matches_wire_shape() {
        let value: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&setup()).encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-2.5-flash-native-audio-preview-09-2025",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Zephyr" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );
    }

    #[test]
    fn configured_setup_reaches_the_wire_whole() {
        let setup = crate::session::SessionConfig {
            voice: "Puck".into(),
            ..Default::default()
        }
        .setup_for("Goal: ship v1");
        let value: serde_json::Value =
            serde_json::from_str(&ClientMessage::setup(&setup).encode().unwrap()).unwrap();
        let frame = &value["setup"];
        assert_eq!(frame["model"], format!("models/{}", setup.model));
        assert_eq!(
            frame["generationConfig"]["responseModalities"],
            json!([setup.response_modality])
        );
        assert_eq!(
            frame["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(
            frame["systemInstruction"]["parts"][0]["text"],
            setup.system_instruction.as_str()
        );
    }

    #[test]
    fn outbound_audio_becomes_realtime_input() {
        let msg = ClientMessage::from(OutboundMessage::Audio {
            data: "AAEC".into(),
            mime_type: "audio/pcm;rate=16000".into(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{ "mimeType": "audio/pcm;rate=16000", "data": "AAEC" }]
                }
            })
        );
    }

    #[test]
    fn setup_complete_is_ready() {
        assert_eq!(
            parse_server_message(r#"{"setupComplete":{}}"#).unwrap(),
            vec![InboundMessage::Ready]
        );
    }

    #[test]
    fn server_content_maps_in_order() {
        let frame = json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAA=" } },
                    { "text": "hello" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQA=" } }
                ]},
                "turnComplete": true
            }
        });
        let msgs = parse_server_message(&frame.to_string()).unwrap();
        assert_eq!(
            msgs,
            vec![
                InboundMessage::Interrupted,
                InboundMessage::Audio {
                    data: "AAA=".into(),
                    mime_type: "audio/pcm;rate=24000".into()
                },
                InboundMessage::Audio {
                    data: "AQA=".into(),
                    mime_type: "audio/pcm;rate=24000".into()
                },
                InboundMessage::TurnComplete,
            ]
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msgs = parse_server_message(r#"{"usageMetadata":{"totalTokenCount":5}}"#).unwrap();
        assert!(msgs.is_empty());
    }

    #[test]
    fn non_object_frame_is_protocol_error() {
        assert!(matches!(
            parse_server_message("not json"),
            Err(ParleyError::Protocol(_))
        ));
    }
}
