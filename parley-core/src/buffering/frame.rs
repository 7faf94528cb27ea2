//! Fixed-size capture frames handed from the ring buffer to the capture pipeline.

/// A contiguous block of mono PCM samples at a known sample rate.
///
/// Produced by [`FrameAssembler`] on the capture thread, consumed once by
/// the capture pipeline.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Slices an arbitrary-length sample stream into frames of exactly `frame_len`.
///
/// Leftover samples are kept until the next push completes a frame.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            sample_rate,
            pending: Vec::with_capacity(frame_len),
        }
    }

    /// Append samples, returning every frame completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_len {
                let samples =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
                frames.push(AudioFrame::new(samples, self.sample_rate));
            }
        }
        frames
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}
