//! # parley-core
//!
//! Full-duplex voice pipeline for live audio sessions.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioBackend input → SPSC RingBuffer → capture::run (device thread)
//!                                                          │ 16 kHz PCM, base64
//!                                                    mpsc::Sender<OutboundMessage>
//!                                                          │
//!                                                    RemoteConnector
//!                                                          │
//!                                                 mpsc::Receiver<InboundMessage>
//!                                                          │
//!                                         session event loop (tokio task)
//!                                           │                      │
//!                                   PlaybackScheduler     InterruptionController
//!                                           │                      │
//!                                      OutputDevice (mixer) ◄──────┘
//! ```
//!
//! Device callbacks never lock or wait on the network. The scheduler cursor,
//! active playback set and interruption epoch share one lock.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod diagnostics;
pub mod error;
pub mod playback;
pub mod remote;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{offline::OfflineBackend, AudioBackend};
pub use codec::PcmFormat;
pub use diagnostics::DiagnosticsSnapshot;
pub use error::ParleyError;
pub use playback::{InterruptionController, PlaybackScheduler, UnitId};
pub use remote::{InboundMessage, OutboundMessage, RemoteConnector, SessionSetup};
pub use session::{LiveSession, SessionConfig, SessionOutcome, SessionState, SessionStatusEvent};

#[cfg(feature = "audio-cpal")]
pub use audio::cpal_backend::CpalBackend;

#[cfg(feature = "ws")]
pub use remote::ws::WsConnector;
