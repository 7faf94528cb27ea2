//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! Devices run at their native rate (commonly 44.1 or 48 kHz). The live
//! session wants 16 kHz microphone audio and sends 24 kHz speech.
//! `RateConverter` bridges the capture side as a streaming converter on the
//! capture thread; [`convert_buffer`] converts whole playback units before
//! they are handed to the output mixer.
//!
//! When both rates match, `RateConverter` is a passthrough and no rubato
//! session is created at all.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{ParleyError, Result};

/// Input block size used by [`convert_buffer`].
const CONVERT_CHUNK: usize = 1024;

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer; holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `ParleyError::AudioStream` if rubato fails to initialise.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }
        if source_rate == 0 || target_rate == 0 {
            return Err(ParleyError::AudioStream(format!(
                "cannot resample {source_rate} Hz -> {target_rate} Hz"
            )));
        }

        let ratio = target_rate as f64 / source_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| ParleyError::AudioStream(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::debug!(source_rate, target_rate, chunk_size, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Output frames of filter delay introduced by the resampler.
    pub fn output_delay(&self) -> usize {
        self.resampler
            .as_ref()
            .map(|r| r.output_delay())
            .unwrap_or(0)
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Convert a complete buffer, compensating for filter delay.
///
/// The result always holds `round(len * to / from)` samples, so a unit keeps
/// the same duration on the device timeline as on the session timeline.
pub fn convert_buffer(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected = (samples.len() as f64 * to as f64 / from as f64).round() as usize;
    let mut rc = RateConverter::new(from, to, CONVERT_CHUNK)?;
    let delay = rc.output_delay();

    let mut out = rc.process(samples);
    let silence = [0f32; CONVERT_CHUNK];
    // Flush the remainder plus the filter delay through with silence.
    let mut flushes = 0;
    while out.len() < expected + delay && flushes < 64 {
        out.extend(rc.process(&silence));
        flushes += 1;
    }

    out.drain(..delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let out = rc.process(&samples);
        assert_eq!(out, samples);
        assert_eq!(rc.output_delay(), 0);
    }

    #[test]
    fn ratio_48k_to_16k_correct_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(!rc.is_passthrough());
        let out = rc.process(&vec![0.0f32; 960]);
        assert!(!out.is_empty(), "expected non-empty output");
        assert!(
            (out.len() as isize - 320).unsigned_abs() <= 10,
            "output len={} expected≈320",
            out.len()
        );
    }

    #[test]
    fn partial_accumulation_returns_empty() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
    }

    #[test]
    fn whole_buffer_conversion_keeps_duration() {
        let unit = vec![0.25f32; 12_000]; // 0.5 s at 24 kHz
        let out = convert_buffer(&unit, 24_000, 48_000).unwrap();
        assert_eq!(out.len(), 24_000);

        let out = convert_buffer(&unit, 24_000, 44_100).unwrap();
        assert_eq!(out.len(), 22_050);

        // steady-state level survives the filter
        let mid = out[out.len() / 2];
        assert!((mid - 0.25).abs() < 0.02, "mid sample {mid}");
    }

    #[test]
    fn whole_buffer_same_rate_is_copy() {
        let unit = vec![0.1f32; 100];
        assert_eq!(convert_buffer(&unit, 24_000, 24_000).unwrap(), unit);
        assert!(convert_buffer(&[], 24_000, 48_000).unwrap().is_empty());
    }
}
