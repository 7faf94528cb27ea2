//! Audio device boundary.
//!
//! # Design constraints
//!
//! Device callbacks run on OS audio threads at elevated priority. They must
//! not block on a lock held by async code, perform I/O or wait on the
//! network. Capture writes into an SPSC ring producer (`push_slice` is
//! lock-free); playback drains a command channel with `try_recv` and mixes
//! into the device buffer.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Streams are therefore opened and dropped on one dedicated device
//! thread owned by the session; [`StreamGuard`] keeps them alive there
//! without requiring `Send`. Everything that crosses threads (the ring
//! producer, the [`OutputDevice`] handle, the playback event sender) is
//! `Send`.

pub mod device;
pub mod mixer;
pub mod offline;
pub mod resample;

#[cfg(feature = "audio-cpal")]
pub mod cpal_backend;

use std::any::Any;
use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use crate::{
    buffering::AudioProducer,
    error::Result,
    playback::{OutputDevice, PlaybackEventSender},
};

/// Owns whatever keeps a device stream running. Dropping it closes the stream.
pub struct StreamGuard(Option<Box<dyn Any>>);

impl StreamGuard {
    pub fn new<T: 'static>(inner: T) -> Self {
        Self(Some(Box::new(inner)))
    }

    /// Guard for streams with nothing to release.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamGuard")
            .field(&if self.0.is_some() { "live" } else { "empty" })
            .finish()
    }
}

/// An open microphone stream delivering mono f32 samples into the capture ring.
#[derive(Debug)]
pub struct InputStream {
    /// Rate the samples are produced at (Hz).
    pub sample_rate: u32,
    _guard: StreamGuard,
}

impl InputStream {
    pub fn new(sample_rate: u32, guard: StreamGuard) -> Self {
        Self {
            sample_rate,
            _guard: guard,
        }
    }
}

/// An open speaker stream and the handle used to schedule units on it.
pub struct OutputStream {
    pub device: Arc<dyn OutputDevice>,
    _guard: StreamGuard,
}

impl OutputStream {
    pub fn new(device: Arc<dyn OutputDevice>, guard: StreamGuard) -> Self {
        Self {
            device,
            _guard: guard,
        }
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("sample_rate", &self.device.sample_rate())
            .finish_non_exhaustive()
    }
}

/// Opens the microphone and speaker for a session.
///
/// Both methods are called on the session's device thread, which also drops
/// the returned streams.
pub trait AudioBackend: Send + Sync + 'static {
    /// Open the microphone, pushing mono f32 samples into `producer` while
    /// `running` is set.
    ///
    /// # Errors
    /// Returns a device error when access is denied or no input exists.
    fn open_input(&self, producer: AudioProducer, running: Arc<AtomicBool>) -> Result<InputStream>;

    /// Open the speaker. Units that play to completion are reported on `events`.
    fn open_output(&self, events: PlaybackEventSender) -> Result<OutputStream>;
}
