//! Microphone capture loop.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain ring buffer → Vec<f32> at the device rate
//! 2. Resample to the session input rate (16 kHz)
//! 3. Slice into fixed-size AudioFrames
//! 4. Per frame: gate check (active, not muted) → PCM encode → transport
//!    encode → try_send on the outbound channel
//! ```
//!
//! The loop runs on the session's device thread. Nothing here waits on the
//! network: a full outbound channel drops the frame.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use crate::{
    audio::resample::RateConverter,
    buffering::{
        frame::{AudioFrame, FrameAssembler},
        AudioConsumer, Consumer,
    },
    codec::{self, PcmFormat},
    diagnostics::PipelineDiagnostics,
    error::{ParleyError, Result},
    remote::OutboundMessage,
};

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty.
const SLEEP_EMPTY: Duration = Duration::from_millis(5);

/// Whether captured audio may leave the process.
///
/// `active` is opened by the session once the remote confirms, and closed on
/// teardown. `muted` is the user's toggle and is independent of session state.
#[derive(Debug, Default)]
pub struct CaptureGate {
    active: AtomicBool,
    muted: AtomicBool,
}

impl CaptureGate {
    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }
}

/// What happened to one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sent,
    /// Dropped because the user muted capture.
    Muted,
    /// Dropped because the session is not `Active`.
    Inactive,
}

/// Encodes frames and hands them to the outbound channel.
#[derive(Debug, Clone)]
pub struct CapturePipeline {
    gate: Arc<CaptureGate>,
    format: PcmFormat,
    mime_type: String,
    outbound: mpsc::Sender<OutboundMessage>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl CapturePipeline {
    pub fn new(
        gate: Arc<CaptureGate>,
        format: PcmFormat,
        outbound: mpsc::Sender<OutboundMessage>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            gate,
            mime_type: format.mime_type(),
            format,
            outbound,
            diagnostics,
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Gate, encode and forward one frame.
    ///
    /// # Errors
    /// `ParleyError::TransmitDropped` when the outbound channel is full or
    /// closed. The frame is gone; callers log and carry on.
    pub fn process_frame(&self, frame: &AudioFrame) -> Result<FrameOutcome> {
        self.diagnostics
            .frames_captured
            .fetch_add(1, Ordering::Relaxed);

        if !self.gate.is_active() {
            self.diagnostics
                .frames_dropped_inactive
                .fetch_add(1, Ordering::Relaxed);
            return Ok(FrameOutcome::Inactive);
        }
        if self.gate.is_muted() {
            self.diagnostics
                .frames_dropped_muted
                .fetch_add(1, Ordering::Relaxed);
            return Ok(FrameOutcome::Muted);
        }

        let bytes = codec::encode_samples(&frame.samples);
        let message = OutboundMessage::Audio {
            data: codec::encode_transport(&bytes),
            mime_type: self.mime_type.clone(),
        };

        match self.outbound.try_send(message) {
            Ok(()) => {
                self.diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(FrameOutcome::Sent)
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.diagnostics
                    .frames_dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                Err(ParleyError::TransmitDropped)
            }
        }
    }
}

/// Everything the capture loop owns.
pub struct CaptureContext {
    pipeline: CapturePipeline,
    consumer: AudioConsumer,
    running: Arc<AtomicBool>,
    /// Rate the input device delivers at.
    capture_sample_rate: u32,
    /// Samples per frame at the session input rate.
    frame_len: usize,
    resampler: RateConverter,
}

impl CaptureContext {
    /// Prepare the capture loop for an input running at `capture_sample_rate`.
    ///
    /// # Errors
    /// Returns `ParleyError::AudioStream` when the device rate cannot be
    /// converted to the session input rate.
    pub fn new(
        pipeline: CapturePipeline,
        consumer: AudioConsumer,
        running: Arc<AtomicBool>,
        capture_sample_rate: u32,
        frame_len: usize,
    ) -> Result<Self> {
        let resampler =
            RateConverter::new(capture_sample_rate, pipeline.format.sample_rate, DRAIN_CHUNK)?;
        Ok(Self {
            pipeline,
            consumer,
            running,
            capture_sample_rate,
            frame_len,
            resampler,
        })
    }
}

/// Run the capture loop until `ctx.running` becomes false.
pub fn run(mut ctx: CaptureContext) {
    let target_rate = ctx.pipeline.format.sample_rate;
    info!(
        capture_rate = ctx.capture_sample_rate,
        target_rate,
        frame_len = ctx.frame_len,
        "capture started"
    );

    let mut assembler = FrameAssembler::new(ctx.frame_len, target_rate);
    let mut raw = vec![0f32; DRAIN_CHUNK];

    while ctx.running.load(Ordering::Relaxed) {
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(SLEEP_EMPTY);
            continue;
        }

        let resampled = ctx.resampler.process(&raw[..n]);
        for frame in assembler.push(&resampled) {
            match ctx.pipeline.process_frame(&frame) {
                Ok(FrameOutcome::Sent) => {}
                Ok(outcome) => debug!(?outcome, "capture frame not sent"),
                Err(e) => debug!(error = %e, "capture frame dropped"),
            }
        }
    }

    let snap = ctx.pipeline.diagnostics.snapshot();
    info!(
        captured = snap.frames_captured,
        sent = snap.frames_sent,
        muted = snap.frames_dropped_muted,
        inactive = snap.frames_dropped_inactive,
        backpressure = snap.frames_dropped_backpressure,
        pending = assembler.pending(),
        "capture stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_capture_ring, Producer};
    use std::time::Instant;

    fn pipeline(capacity: usize) -> (CapturePipeline, Arc<CaptureGate>, mpsc::Receiver<OutboundMessage>) {
        let gate = Arc::new(CaptureGate::default());
        let (tx, rx) = mpsc::channel(capacity);
        let pipeline = CapturePipeline::new(
            Arc::clone(&gate),
            PcmFormat::INPUT,
            tx,
            Arc::new(PipelineDiagnostics::default()),
        );
        (pipeline, gate, rx)
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0.5; 4096], 16_000)
    }

    #[test]
    fn inactive_gate_sends_nothing() {
        let (pipeline, _gate, mut rx) = pipeline(8);
        assert_eq!(pipeline.process_frame(&frame()).unwrap(), FrameOutcome::Inactive);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn active_frame_is_encoded_and_tagged() {
        let (pipeline, gate, mut rx) = pipeline(8);
        gate.activate();
        assert_eq!(pipeline.process_frame(&frame()).unwrap(), FrameOutcome::Sent);

        let OutboundMessage::Audio { data, mime_type } = rx.try_recv().unwrap();
        assert_eq!(mime_type, "audio/pcm;rate=16000");
        let bytes = codec::decode_transport(&data).unwrap();
        assert_eq!(bytes.len(), 2 * 4096);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 16_384);
    }

    #[test]
    fn mute_drops_rather_than_queues() {
        let (pipeline, gate, mut rx) = pipeline(64);
        gate.activate();
        gate.set_muted(true);
        for _ in 0..10 {
            assert_eq!(pipeline.process_frame(&frame()).unwrap(), FrameOutcome::Muted);
        }
        assert!(rx.try_recv().is_err());

        gate.set_muted(false);
        pipeline.process_frame(&frame()).unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "muted frames must not be replayed");

        let snap = pipeline.diagnostics.snapshot();
        assert_eq!(snap.frames_dropped_muted, 10);
        assert_eq!(snap.frames_sent, 1);
    }

    #[test]
    fn full_channel_is_a_soft_failure() {
        let (pipeline, gate, mut rx) = pipeline(1);
        gate.activate();
        assert_eq!(pipeline.process_frame(&frame()).unwrap(), FrameOutcome::Sent);
        let err = pipeline.process_frame(&frame()).unwrap_err();
        assert!(matches!(err, ParleyError::TransmitDropped));
        assert!(!err.is_fatal());

        rx.try_recv().unwrap();
        assert_eq!(pipeline.process_frame(&frame()).unwrap(), FrameOutcome::Sent);
        assert_eq!(pipeline.diagnostics.snapshot().frames_dropped_backpressure, 1);
    }

    #[test]
    fn closed_channel_is_a_soft_failure() {
        let (pipeline, gate, rx) = pipeline(4);
        gate.activate();
        drop(rx);
        assert!(matches!(
            pipeline.process_frame(&frame()),
            Err(ParleyError::TransmitDropped)
        ));
    }

    #[test]
    fn run_frames_ring_audio_until_stopped() {
        let (pipeline, gate, mut rx) = pipeline(16);
        gate.activate();
        let (mut producer, consumer) = create_capture_ring();
        let running = Arc::new(AtomicBool::new(true));

        let ctx = CaptureContext::new(pipeline, consumer, Arc::clone(&running), 16_000, 1024)
            .unwrap();
        let handle = std::thread::spawn(move || run(ctx));

        producer.push_slice(&vec![0.1; 2048 + 100]);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut received = 0;
        while received < 2 && Instant::now() < deadline {
            match rx.try_recv() {
                Ok(_) => received += 1,
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(received, 2);
        assert!(rx.try_recv().is_err(), "partial frame must not be sent");
    }

    #[test]
    fn unusable_device_rate_is_rejected_up_front() {
        let (pipeline, _gate, _rx) = pipeline(4);
        let (_producer, consumer) = create_capture_ring();
        let ctx = CaptureContext::new(pipeline, consumer, Arc::new(AtomicBool::new(true)), 0, 1024);
        assert!(matches!(ctx, Err(ParleyError::AudioStream(_))));
    }
}
