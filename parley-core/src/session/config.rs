use serde::{Deserialize, Serialize};

use crate::{
    codec::PcmFormat,
    error::{ParleyError, Result},
    remote::SessionSetup,
};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_RESPONSE_MODALITY: &str = "AUDIO";

/// Placeholder replaced by the collaborator's context string.
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a performance coach built around the \
12 Week Year method. Help the user run their weekly accountability meeting. \
Current user context: {context}. Be brief, direct and motivating.";

/// Samples per capture frame at the input rate (256 ms at 16 kHz).
pub const DEFAULT_FRAME_LEN: usize = 4096;

/// Capture frames that may wait for the remote writer before frames drop.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 32;

/// Configuration for one [`LiveSession`](super::LiveSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    pub response_modality: String,
    /// Must contain `{context}` exactly where the context belongs.
    pub system_instruction_template: String,
    #[serde(skip, default = "input_format")]
    pub input_format: PcmFormat,
    #[serde(skip, default = "output_format")]
    pub output_format: PcmFormat,
    pub frame_len: usize,
    pub outbound_capacity: usize,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
}

fn input_format() -> PcmFormat {
    PcmFormat::INPUT
}

fn output_format() -> PcmFormat {
    PcmFormat::OUTPUT
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            response_modality: DEFAULT_RESPONSE_MODALITY.into(),
            system_instruction_template: DEFAULT_SYSTEM_INSTRUCTION.into(),
            input_format: PcmFormat::INPUT,
            output_format: PcmFormat::OUTPUT,
            frame_len: DEFAULT_FRAME_LEN,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            preferred_input_device: None,
            preferred_output_device: None,
        }
    }
}

impl SessionConfig {
    /// Reject values a session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(ParleyError::Config("model must not be empty".into()));
        }
        if self.frame_len == 0 {
            return Err(ParleyError::Config("frame_len must be positive".into()));
        }
        if self.outbound_capacity == 0 {
            return Err(ParleyError::Config("outbound_capacity must be positive".into()));
        }
        if self.input_format.sample_rate == 0 || self.output_format.sample_rate == 0 {
            return Err(ParleyError::Config("sample rates must be positive".into()));
        }
        Ok(())
    }

    /// Build the remote setup, consuming `context` into the system instruction.
    pub fn setup_for(&self, context: &str) -> SessionSetup {
        SessionSetup {
            model: self.model.clone(),
            voice: self.voice.clone(),
            response_modality: self.response_modality.clone(),
            system_instruction: self
                .system_instruction_template
                .replace(CONTEXT_PLACEHOLDER, context.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_production_values() {
        let config = SessionConfig::default();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.voice, "Zephyr");
        assert_eq!(config.input_format.sample_rate, 16_000);
        assert_eq!(config.output_format.sample_rate, 24_000);
        assert_eq!(config.frame_len, 4096);
        config.validate().unwrap();
    }

    #[test]
    fn context_lands_in_system_instruction() {
        let setup = SessionConfig::default().setup_for("  Goal: ship v1 by March.  ");
        assert!(setup
            .system_instruction
            .contains("Current user context: Goal: ship v1 by March."));
        assert!(!setup.system_instruction.contains(CONTEXT_PLACEHOLDER));
        assert_eq!(setup.response_modality, "AUDIO");
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = SessionConfig {
            outbound_capacity: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ParleyError::Config(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"voice":"Puck"}"#).unwrap();
        assert_eq!(config.voice, "Puck");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.output_format, PcmFormat::OUTPUT);
    }
}
