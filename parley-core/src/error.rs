use thiserror::Error;

use crate::session::SessionState;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device access failed: {0}")]
    DeviceAccess(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("remote session error: {0}")]
    RemoteSession(String),

    #[error("malformed audio: {byte_len} bytes is not a whole number of {channels}-channel i16 frames")]
    MalformedAudio { byte_len: usize, channels: usize },

    #[error("invalid transport encoding: {0}")]
    InvalidTransport(String),

    #[error("outbound channel unavailable, chunk dropped")]
    TransmitDropped,

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Whether this error must terminate the session.
    ///
    /// Malformed inbound audio and dropped outbound frames are absorbed where
    /// they happen; everything touching devices or the remote is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ParleyError::MalformedAudio { .. }
                | ParleyError::InvalidTransport(_)
                | ParleyError::TransmitDropped
        )
    }

    /// Whether this error comes from the local audio devices.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            ParleyError::DeviceAccess(_)
                | ParleyError::NoDefaultInputDevice
                | ParleyError::NoDefaultOutputDevice
                | ParleyError::AudioStream(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
