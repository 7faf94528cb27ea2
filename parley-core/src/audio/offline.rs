//! Clock-driven audio backend with no hardware behind it.
//!
//! [`OfflineOutput`] only advances when [`render`](OfflineOutput::render) is
//! called, which makes scheduling fully deterministic. [`OfflineBackend`]
//! pairs it with a microphone fed through
//! [`push_input`](OfflineBackend::push_input). Used for headless runs and
//! tests.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    mixer::Mixer, resample::convert_buffer, AudioBackend, InputStream, OutputStream, StreamGuard,
};
use crate::{
    buffering::{AudioProducer, Producer},
    error::Result,
    playback::{OutputDevice, PlaybackEvent, PlaybackEventSender, PlaybackUnit, UnitId},
};

/// One block produced by [`OfflineOutput::render`].
#[derive(Debug, Clone, Default)]
pub struct RenderedBlock {
    /// Mono samples, one per rendered frame.
    pub samples: Vec<f32>,
    /// Units that played their last frame in this block.
    pub ended: Vec<UnitId>,
}

impl RenderedBlock {
    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0.0)
    }
}

/// Mono output device advanced by hand.
pub struct OfflineOutput {
    sample_rate: u32,
    clock: AtomicU64,
    mixer: Mutex<Mixer>,
    events: Mutex<Option<PlaybackEventSender>>,
}

impl OfflineOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            clock: AtomicU64::new(0),
            mixer: Mutex::new(Mixer::with_capacity(1, 16)),
            events: Mutex::new(None),
        }
    }

    /// Report completions on `events` from now on.
    pub fn attach(&self, events: PlaybackEventSender) {
        *self.events.lock() = Some(events);
    }

    pub fn detach(&self) {
        self.events.lock().take();
    }

    /// Render `frames` frames and advance the clock past them.
    pub fn render(&self, frames: usize) -> RenderedBlock {
        let mut block = RenderedBlock {
            samples: vec![0.0; frames],
            ended: Vec::new(),
        };
        {
            let mut mixer = self.mixer.lock();
            let clock = self.clock.load(Ordering::Acquire);
            mixer.render(&mut block.samples, clock, |id| block.ended.push(id));
            self.clock.fetch_add(frames as u64, Ordering::AcqRel);
        }

        if let Some(events) = self.events.lock().as_ref() {
            for id in &block.ended {
                let _ = events.send(PlaybackEvent::Ended(*id));
            }
        }
        block
    }

    /// Render `secs` worth of frames.
    pub fn advance_secs(&self, secs: f64) -> RenderedBlock {
        let frames = (secs * self.sample_rate as f64).round().max(0.0) as usize;
        self.render(frames)
    }

    /// Units currently held by the mixer (scheduled or playing).
    pub fn voices(&self) -> usize {
        self.mixer.lock().len()
    }

    pub fn clock_frames(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }
}

impl OutputDevice for OfflineOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn schedule(&self, unit: &PlaybackUnit) -> Result<()> {
        let samples: Arc<[f32]> = if unit.sample_rate == self.sample_rate {
            Arc::clone(&unit.samples)
        } else {
            Arc::from(convert_buffer(&unit.samples, unit.sample_rate, self.sample_rate)?)
        };
        let start_frame = (unit.start_time * self.sample_rate as f64).round() as u64;
        self.mixer.lock().add(unit.id, samples, start_frame);
        Ok(())
    }

    fn stop(&self, id: UnitId) {
        self.mixer.lock().stop(id);
    }
}

/// Offline microphone plus [`OfflineOutput`].
#[derive(Clone)]
pub struct OfflineBackend {
    input_rate: u32,
    output: Arc<OfflineOutput>,
    input: Arc<Mutex<Option<AudioProducer>>>,
}

impl OfflineBackend {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate,
            output: Arc::new(OfflineOutput::new(output_rate)),
            input: Arc::new(Mutex::new(None)),
        }
    }

    pub fn output(&self) -> &Arc<OfflineOutput> {
        &self.output
    }

    /// Whether an input stream is currently open.
    pub fn input_open(&self) -> bool {
        self.input.lock().is_some()
    }

    /// Feed microphone samples. Returns how many were accepted; zero when
    /// no input stream is open.
    pub fn push_input(&self, samples: &[f32]) -> usize {
        match self.input.lock().as_mut() {
            Some(producer) => producer.push_slice(samples),
            None => 0,
        }
    }
}

struct InputSlot(Arc<Mutex<Option<AudioProducer>>>);

impl Drop for InputSlot {
    fn drop(&mut self) {
        self.0.lock().take();
        debug!("offline input closed");
    }
}

struct OutputSlot(Arc<OfflineOutput>);

impl Drop for OutputSlot {
    fn drop(&mut self) {
        self.0.detach();
        self.0.mixer.lock().stop_all();
        debug!("offline output closed");
    }
}

impl AudioBackend for OfflineBackend {
    fn open_input(&self, producer: AudioProducer, _running: Arc<AtomicBool>) -> Result<InputStream> {
        *self.input.lock() = Some(producer);
        Ok(InputStream::new(
            self.input_rate,
            StreamGuard::new(InputSlot(Arc::clone(&self.input))),
        ))
    }

    fn open_output(&self, events: PlaybackEventSender) -> Result<OutputStream> {
        self.output.attach(events);
        let device: Arc<dyn OutputDevice> = self.output.clone();
        Ok(OutputStream::new(
            device,
            StreamGuard::new(OutputSlot(Arc::clone(&self.output))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_capture_ring, Observer};
    use tokio::sync::mpsc;

    fn unit(id: u64, start_time: f64, samples: Vec<f32>, sample_rate: u32) -> PlaybackUnit {
        let duration = samples.len() as f64 / sample_rate as f64;
        PlaybackUnit {
            id: UnitId(id),
            samples: Arc::from(samples),
            sample_rate,
            start_time,
            duration,
        }
    }

    #[test]
    fn clock_advances_only_on_render() {
        let out = OfflineOutput::new(24_000);
        assert_eq!(out.now(), 0.0);
        out.render(12_000);
        assert_eq!(out.now(), 0.5);
        assert_eq!(out.clock_frames(), 12_000);
    }

    #[test]
    fn ended_units_are_reported_once() {
        let out = OfflineOutput::new(24_000);
        let (tx, mut rx) = mpsc::unbounded_channel();
        out.attach(tx);
        out.schedule(&unit(1, 0.0, vec![0.5; 100], 24_000)).unwrap();

        let block = out.render(240);
        assert_eq!(block.ended, vec![UnitId(1)]);
        assert_eq!(rx.try_recv().unwrap(), PlaybackEvent::Ended(UnitId(1)));
        assert!(out.render(240).ended.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn foreign_rate_units_are_converted() {
        let out = OfflineOutput::new(48_000);
        out.schedule(&unit(0, 0.0, vec![0.25; 2_400], 24_000)).unwrap();
        let block = out.render(4_800);
        assert_eq!(block.ended, vec![UnitId(0)]);
    }

    #[test]
    fn backend_input_slot_follows_stream_lifetime() {
        let backend = OfflineBackend::new(16_000, 24_000);
        assert_eq!(backend.push_input(&[0.1; 4]), 0);

        let (producer, consumer) = create_capture_ring();
        let stream = backend
            .open_input(producer, Arc::new(AtomicBool::new(true)))
            .unwrap();
        assert_eq!(stream.sample_rate, 16_000);
        assert!(backend.input_open());
        assert_eq!(backend.push_input(&[0.1; 4]), 4);
        assert_eq!(consumer.occupied_len(), 4);

        drop(stream);
        assert!(!backend.input_open());
        assert_eq!(backend.push_input(&[0.1; 4]), 0);
    }

    #[test]
    fn dropping_output_stream_silences_mixer() {
        let backend = OfflineBackend::new(16_000, 24_000);
        let (tx, _rx) = mpsc::unbounded_channel();
        let stream = backend.open_output(tx).unwrap();
        stream
            .device
            .schedule(&unit(0, 0.0, vec![0.5; 24_000], 24_000))
            .unwrap();
        assert_eq!(backend.output().voices(), 1);
        drop(stream);
        assert_eq!(backend.output().voices(), 0);
    }
}
