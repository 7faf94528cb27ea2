//! Audio device enumeration and microphone heuristics.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Input that most likely captures system output rather than a voice.
    pub is_loopback_like: bool,
    /// The device a session opens when no preference is configured.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mix stereo",
    "speakers (",
    "headphones (",
];

const MIC_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "line in",
    "usb",
    "webcam",
];

/// Whether an input device name looks like system-output capture.
///
/// A loopback input would feed the assistant's own speech back to it.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score an input device name as a speech microphone. Higher is better.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Mark the recommended device and order the list: recommended first, then
/// defaults, then by name.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn rank(mut list: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    let best = list
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| match d.direction {
            DeviceDirection::Input => {
                mic_preference_score(&d.name) + if d.is_default { 2 } else { 0 }
            }
            DeviceDirection::Output => i32::from(d.is_default),
        })
        .map(|(idx, _)| idx);
    if let Some(best) = best.and_then(|idx| list.get_mut(idx)) {
        best.is_recommended = true;
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

#[cfg(feature = "audio-cpal")]
fn describe<I>(devices: I, default_name: Option<String>, direction: DeviceDirection) -> Vec<DeviceInfo>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;

    let list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback_like: direction == DeviceDirection::Input
                    && is_loopback_like_name(&name),
                is_recommended: false,
                direction,
                name,
            }
        })
        .collect();
    rank(list)
}

/// List microphones, recommended first.
///
/// Returns an empty `Vec` if enumeration fails or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => describe(devices, default_name, DeviceDirection::Input),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

/// List speakers, default first.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => describe(devices, default_name, DeviceDirection::Output),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    Vec::new()
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            direction: DeviceDirection::Input,
            is_default,
            is_loopback_like: is_loopback_like_name(name),
            is_recommended: false,
        }
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("MacBook Pro Microphone"));
    }

    #[test]
    fn scores_mic_higher_than_loopback() {
        let mic = mic_preference_score("Microphone Array (USB PnP Audio Device)");
        let loopback = mic_preference_score("Stereo Mix (Realtek Audio)");
        assert!(mic > loopback);
    }

    #[test]
    fn loopback_default_is_not_recommended() {
        let ranked = rank(vec![
            input("Stereo Mix (Realtek Audio)", true),
            input("Headset Microphone", false),
        ]);
        assert_eq!(ranked[0].name, "Headset Microphone");
        assert!(ranked[0].is_recommended);
        assert!(!ranked[1].is_recommended);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(input("Mic", true)).unwrap();
        assert_eq!(json["direction"], "input");
        assert_eq!(json["isDefault"], true);
        assert_eq!(json["isLoopbackLike"], false);
    }
}
