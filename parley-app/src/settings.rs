//! Persistent host settings (JSON file next to the binary or at `$PARLEY_SETTINGS`).

use std::fs;
use std::path::{Path, PathBuf};

use parley_core::{
    remote::ws::DEFAULT_ENDPOINT,
    session::config::{
        DEFAULT_FRAME_LEN, DEFAULT_MODEL, DEFAULT_OUTBOUND_CAPACITY, DEFAULT_SYSTEM_INSTRUCTION,
        DEFAULT_VOICE,
    },
    SessionConfig,
};
use serde::{Deserialize, Serialize};

const SETTINGS_FILE_NAME: &str = "parley.settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub frame_len: usize,
    pub outbound_capacity: usize,
    pub start_muted: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.into(),
            model: DEFAULT_MODEL.into(),
            voice: DEFAULT_VOICE.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            preferred_input_device: None,
            preferred_output_device: None,
            frame_len: DEFAULT_FRAME_LEN,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            start_muted: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.api_key = trimmed(self.api_key.as_deref());
        self.endpoint = or_default(&self.endpoint, DEFAULT_ENDPOINT);
        self.model = normalize_model(&self.model);
        self.voice = or_default(&self.voice, DEFAULT_VOICE);
        if self.system_instruction.trim().is_empty() {
            self.system_instruction = DEFAULT_SYSTEM_INSTRUCTION.into();
        }
        self.preferred_input_device = trimmed(self.preferred_input_device.as_deref());
        self.preferred_output_device = trimmed(self.preferred_output_device.as_deref());
        // 16 ms .. 1 s of audio at 16 kHz
        self.frame_len = self.frame_len.clamp(256, 16_000);
        self.outbound_capacity = self.outbound_capacity.clamp(1, 512);
    }

    /// Apply `PARLEY_*` environment overrides. Variables win over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("PARLEY_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(endpoint) = lookup("PARLEY_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.model = model;
        }
        if let Some(voice) = lookup("PARLEY_VOICE") {
            self.voice = voice;
        }
        self.normalize();
    }

    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction_template: self.system_instruction.clone(),
            frame_len: self.frame_len,
            outbound_capacity: self.outbound_capacity,
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            ..SessionConfig::default()
        }
    }
}

/// Accept the bare model id as well as the `models/` resource name.
pub fn normalize_model(raw: &str) -> String {
    let model = raw.trim();
    let model = model.strip_prefix("models/").unwrap_or(model);
    or_default(model, DEFAULT_MODEL)
}

fn or_default(raw: &str, default: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        default.into()
    } else {
        value.into()
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn default_settings_path() -> PathBuf {
    std::env::var_os("PARLEY_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/nonexistent/parley.settings.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn normalize_trims_and_clamps() {
        let mut settings = AppSettings {
            api_key: Some("   ".into()),
            model: " models/gemini-live ".into(),
            voice: "".into(),
            preferred_input_device: Some(" USB Mic ".into()),
            frame_len: 1,
            outbound_capacity: 0,
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.api_key, None);
        assert_eq!(settings.model, "gemini-live");
        assert_eq!(settings.voice, DEFAULT_VOICE);
        assert_eq!(settings.preferred_input_device.as_deref(), Some("USB Mic"));
        assert_eq!(settings.frame_len, 256);
        assert_eq!(settings.outbound_capacity, 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"voice":"Puck","startMuted":true}"#).unwrap();
        assert_eq!(settings.voice, "Puck");
        assert!(settings.start_muted);
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn env_overrides_win() {
        let mut settings = AppSettings {
            voice: "Puck".into(),
            ..AppSettings::default()
        };
        settings.apply_overrides_from(|key| match key {
            "PARLEY_API_KEY" => Some(" secret ".into()),
            "PARLEY_VOICE" => Some("Kore".into()),
            _ => None,
        });
        assert_eq!(settings.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.voice, "Kore");
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn session_config_carries_settings() {
        let settings = AppSettings {
            voice: "Kore".into(),
            preferred_output_device: Some("Headphones".into()),
            ..AppSettings::default()
        };
        let config = settings.to_session_config();
        assert_eq!(config.voice, "Kore");
        assert_eq!(config.preferred_output_device.as_deref(), Some("Headphones"));
        assert_eq!(config.input_format.sample_rate, 16_000);
        config.validate().unwrap();
    }

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!(
            "parley-settings-{}.json",
            std::process::id()
        ));
        let settings = AppSettings {
            voice: "Charon".into(),
            start_muted: true,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_file(&path);
    }
}
