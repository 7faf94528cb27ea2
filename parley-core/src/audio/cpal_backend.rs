//! cpal implementation of [`AudioBackend`].
//!
//! Input callbacks downmix to mono and push into the capture ring. Output
//! callbacks own a [`Mixer`]; the async side talks to it only through a
//! crossbeam channel drained with `try_recv`, so the callback never waits
//! on a lock held elsewhere.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig,
};
use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use super::{
    device::mic_preference_score, mixer::Mixer, resample::convert_buffer, AudioBackend,
    InputStream, OutputStream, StreamGuard,
};
use crate::{
    buffering::{AudioProducer, Producer},
    codec::OUTPUT_SAMPLE_RATE,
    error::{ParleyError, Result},
    playback::{OutputDevice, PlaybackEvent, PlaybackEventSender, PlaybackUnit, UnitId},
};

/// Upper bound on voices the output mixer preallocates for.
const MIXER_VOICES: usize = 64;

/// Opens the system microphone and speaker through the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    preferred_input: Option<String>,
    preferred_output: Option<String>,
}

impl CpalBackend {
    pub fn new(preferred_input: Option<String>, preferred_output: Option<String>) -> Self {
        Self {
            preferred_input,
            preferred_output,
        }
    }

    fn select_input(&self, host: &cpal::Host) -> Result<cpal::Device> {
        if let Some(device) = find_by_name(host.input_devices(), self.preferred_input.as_deref()) {
            return Ok(device);
        }
        if let Some(device) = host.default_input_device() {
            return Ok(device);
        }

        let devices = host
            .input_devices()
            .map_err(|e| ParleyError::DeviceAccess(e.to_string()))?;
        let fallback = devices
            .max_by_key(|d| d.name().map(|n| mic_preference_score(&n)).unwrap_or(i32::MIN))
            .ok_or(ParleyError::NoDefaultInputDevice)?;
        warn!("no default input device, falling back to best-scoring input");
        Ok(fallback)
    }

    fn select_output(&self, host: &cpal::Host) -> Result<cpal::Device> {
        if let Some(device) = find_by_name(host.output_devices(), self.preferred_output.as_deref()) {
            return Ok(device);
        }
        if let Some(device) = host.default_output_device() {
            return Ok(device);
        }

        let mut devices = host
            .output_devices()
            .map_err(|e| ParleyError::DeviceAccess(e.to_string()))?;
        let fallback = devices.next().ok_or(ParleyError::NoDefaultOutputDevice)?;
        warn!("no default output device, falling back to first available output");
        Ok(fallback)
    }
}

fn find_by_name<I, E>(devices: std::result::Result<I, E>, preferred: Option<&str>) -> Option<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
    E: std::fmt::Display,
{
    let preferred = preferred?;
    match devices {
        Ok(mut devices) => {
            let found = devices.find(|d| d.name().map(|n| n == preferred).unwrap_or(false));
            if found.is_none() {
                warn!("preferred device '{preferred}' not found, falling back");
            }
            found
        }
        Err(e) => {
            warn!("failed to list devices while resolving preference: {e}");
            None
        }
    }
}

fn stream_error(err: cpal::StreamError) {
    error!("audio stream error: {err}");
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, producer: AudioProducer, running: Arc<AtomicBool>) -> Result<InputStream> {
        let host = cpal::default_host();
        let device = self.select_input(&host)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::DeviceAccess(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, format = ?supported.sample_format(), "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, producer, running),
            SampleFormat::I16 => build_input::<i16>(&device, &config, producer, running),
            SampleFormat::U16 => build_input::<u16>(&device, &config, producer, running),
            SampleFormat::U8 => build_input::<u8>(&device, &config, producer, running),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok(InputStream::new(sample_rate, StreamGuard::new(stream)))
    }

    fn open_output(&self, events: PlaybackEventSender) -> Result<OutputStream> {
        let host = cpal::default_host();
        let device = self.select_output(&host)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = choose_output_config(&device)?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, format = ?supported.sample_format(), "output config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let clock = Arc::new(AtomicU64::new(0));
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let render = RenderSide {
            mixer: Mixer::with_capacity(channels as usize, MIXER_VOICES),
            scratch: Vec::new(),
            clock: Arc::clone(&clock),
            commands: commands_rx,
            events,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_output::<f32>(&device, &config, render),
            SampleFormat::I16 => build_output::<i16>(&device, &config, render),
            SampleFormat::U16 => build_output::<u16>(&device, &config, render),
            SampleFormat::U8 => build_output::<u8>(&device, &config, render),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        let handle: Arc<dyn OutputDevice> = Arc::new(CpalOutputDevice {
            sample_rate,
            clock,
            commands: commands_tx,
        });
        Ok(OutputStream::new(handle, StreamGuard::new(stream)))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                for (f, frame) in data.chunks_exact(ch).enumerate() {
                    let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
                    mono[f] = sum / ch as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!("capture ring full: dropped {} frames", mono.len() - written);
                }
            },
            stream_error,
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

/// Prefer a configuration that runs natively at the speech rate, so units
/// reach the mixer without conversion.
fn choose_output_config(device: &cpal::Device) -> Result<SupportedStreamConfig> {
    let wanted = SampleRate(OUTPUT_SAMPLE_RATE);
    if let Ok(ranges) = device.supported_output_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
            .collect();
        candidates.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));
        if let Some(range) = candidates.into_iter().next() {
            return Ok(range.with_sample_rate(wanted));
        }
    }
    device
        .default_output_config()
        .map_err(|e| ParleyError::DeviceAccess(e.to_string()))
}

enum MixerCommand {
    Play {
        id: UnitId,
        samples: Arc<[f32]>,
        start_frame: u64,
    },
    Stop(UnitId),
}

/// State owned by the output callback.
struct RenderSide {
    mixer: Mixer,
    scratch: Vec<f32>,
    clock: Arc<AtomicU64>,
    commands: Receiver<MixerCommand>,
    events: PlaybackEventSender,
}

impl RenderSide {
    fn fill<T: SizedSample + FromSample<f32>>(&mut self, data: &mut [T]) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                MixerCommand::Play {
                    id,
                    samples,
                    start_frame,
                } => self.mixer.add(id, samples, start_frame),
                MixerCommand::Stop(id) => {
                    self.mixer.stop(id);
                }
            }
        }

        self.scratch.resize(data.len(), 0.0);
        let clock = self.clock.load(Ordering::Acquire);
        let events = &self.events;
        self.mixer.render(&mut self.scratch, clock, |id| {
            let _ = events.send(PlaybackEvent::Ended(id));
        });

        for (out, &s) in data.iter_mut().zip(&self.scratch) {
            *out = T::from_sample(s.clamp(-1.0, 1.0));
        }
        let frames = data.len() / self.mixer.channels();
        self.clock.fetch_add(frames as u64, Ordering::Release);
    }
}

fn build_output<T>(device: &cpal::Device, config: &StreamConfig, mut render: RenderSide) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| render.fill(data),
            stream_error,
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

/// `Send` handle to a cpal output stream.
///
/// The device clock counts frames the callback has handed to the driver.
struct CpalOutputDevice {
    sample_rate: u32,
    clock: Arc<AtomicU64>,
    commands: Sender<MixerCommand>,
}

impl OutputDevice for CpalOutputDevice {
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
        self.commands
            .send(MixerCommand::Play {
                id: unit.id,
                samples,
                start_frame,
            })
            .map_err(|_| ParleyError::AudioStream("output stream closed".into()))
    }

    fn stop(&self, id: UnitId) {
        let _ = self.commands.send(MixerCommand::Stop(id));
    }
}
