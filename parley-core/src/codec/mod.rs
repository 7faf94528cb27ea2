//! PCM codec: f32 ⇄ little-endian i16 samples, and the base64 transport text.
//!
//! All functions are stateless. The live session exchanges raw 16-bit PCM
//! wrapped in base64 strings, tagged with a descriptor such as
//! `audio/pcm;rate=16000`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::{ParleyError, Result};

/// Rate the remote expects microphone audio at (Hz).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Rate the remote synthesizes speech at (Hz).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

const I16_SCALE: f32 = 32768.0;

/// Convert normalized samples to little-endian i16 bytes.
///
/// Each sample maps to `round(x * 32768)`. Only `[-1.0, 1.0]` is in contract;
/// `1.0` lands on `i16::MAX`, anything further out wraps.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &x in samples {
        out.extend_from_slice(&quantize(x).to_le_bytes());
    }
    out
}

fn quantize(x: f32) -> i16 {
    let scaled = (x * I16_SCALE).round() as i32;
    if scaled == i16::MAX as i32 + 1 {
        i16::MAX
    } else {
        scaled as i16
    }
}

/// Decode interleaved little-endian i16 bytes into one sample vector per channel.
///
/// Sample `i` of channel `c` is read from index `i * channels + c`.
///
/// # Errors
/// `ParleyError::MalformedAudio` when the byte length is not a whole number
/// of frames (or `channels` is zero).
pub fn decode_samples(bytes: &[u8], channels: usize) -> Result<Vec<Vec<f32>>> {
    let frame_bytes = 2 * channels;
    if channels == 0 || bytes.len() % frame_bytes != 0 {
        return Err(ParleyError::MalformedAudio {
            byte_len: bytes.len(),
            channels,
        });
    }

    let frames = bytes.len() / frame_bytes;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for frame in bytes.chunks_exact(frame_bytes) {
        for (c, pair) in frame.chunks_exact(2).enumerate() {
            let v = i16::from_le_bytes([pair[0], pair[1]]);
            out[c].push(v as f32 / I16_SCALE);
        }
    }
    Ok(out)
}

/// Mono shorthand for [`decode_samples`].
pub fn decode_mono(bytes: &[u8]) -> Result<Vec<f32>> {
    let mut channels = decode_samples(bytes, 1)?;
    Ok(channels.pop().unwrap_or_default())
}

/// Encode raw bytes as standard (padded) base64.
pub fn encode_transport(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode standard base64 text back into raw bytes.
pub fn decode_transport(text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|e| ParleyError::InvalidTransport(e.to_string()))
}

/// Sample layout of a PCM stream, rendered as a MIME-like descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// Microphone → remote: 16 kHz mono.
    pub const INPUT: PcmFormat = PcmFormat {
        sample_rate: INPUT_SAMPLE_RATE,
        channels: 1,
    };

    /// Remote → speaker: 24 kHz mono.
    pub const OUTPUT: PcmFormat = PcmFormat {
        sample_rate: OUTPUT_SAMPLE_RATE,
        channels: 1,
    };

    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// `audio/pcm;rate=<hz>`, with `;channels=<n>` only when not mono.
    pub fn mime_type(&self) -> String {
        if self.channels == 1 {
            format!("audio/pcm;rate={}", self.sample_rate)
        } else {
            format!(
                "audio/pcm;rate={};channels={}",
                self.sample_rate, self.channels
            )
        }
    }

    /// Parse `audio/pcm;rate=24000` (the `audio/` prefix is optional).
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut parts = descriptor.split(';').map(str::trim);
        let kind = parts.next().unwrap_or_default().to_ascii_lowercase();
        if kind != "audio/pcm" && kind != "pcm" {
            return Err(ParleyError::Protocol(format!(
                "unsupported audio descriptor: {descriptor}"
            )));
        }

        let mut sample_rate = None;
        let mut channels = 1u16;
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "rate" => {
                    sample_rate = value.trim().parse::<u32>().ok();
                }
                "channels" => {
                    channels = value.trim().parse::<u16>().map_err(|_| {
                        ParleyError::Protocol(format!("bad channel count in {descriptor}"))
                    })?;
                }
                _ => {}
            }
        }

        match sample_rate {
            Some(rate) if rate > 0 && channels > 0 => Ok(Self {
                sample_rate: rate,
                channels,
            }),
            _ => Err(ParleyError::Protocol(format!(
                "missing or invalid rate in {descriptor}"
            ))),
        }
    }

    /// Duration in seconds of `frames` frames at this rate.
    pub fn duration_secs(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}
