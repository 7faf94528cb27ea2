//! Gapless playback scheduling of inbound speech chunks.
//!
//! ## Scheduling rule
//!
//! ```text
//! start  = max(cursor.next_start_time, device.now())
//! cursor = start + unit.duration
//! ```
//!
//! Chunks arriving ahead of real time queue back to back with no gap;
//! chunks arriving late start at the device clock, leaving a silent gap
//! instead of overlapping or starting in the past.
//!
//! ## Shared state
//!
//! The cursor, the active set and the interruption epoch live behind one
//! `parking_lot::Mutex` shared with [`interrupt::InterruptionController`].
//! Scheduling and interruption therefore never interleave.

pub mod interrupt;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{atomic::Ordering, Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    codec::{self, PcmFormat},
    diagnostics::PipelineDiagnostics,
    error::Result,
};

pub use interrupt::InterruptionController;

/// Identity of one scheduled playback unit. Monotonically increasing per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Notifications from the output device back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The unit played to its last sample.
    Ended(UnitId),
}

/// Channel the output device reports completions on. `send` never blocks,
/// so it is usable from the device callback.
pub type PlaybackEventSender = mpsc::UnboundedSender<PlaybackEvent>;

/// Output side of the audio device boundary.
///
/// Implementations must be cheap to call with a lock held: `schedule` and
/// `stop` only enqueue work for the render side.
pub trait OutputDevice: Send + Sync {
    /// Rate the device renders at (Hz).
    fn sample_rate(&self) -> u32;

    /// Monotonic device clock in seconds.
    fn now(&self) -> f64;

    /// Queue `unit` to start at `unit.start_time` on the device clock.
    fn schedule(&self, unit: &PlaybackUnit) -> Result<()>;

    /// Hard-stop a unit. Unknown or finished ids are ignored.
    fn stop(&self, id: UnitId);
}

/// Decoded speech ready for the device.
#[derive(Debug, Clone)]
pub struct PlaybackUnit {
    pub id: UnitId,
    /// Mono samples at `sample_rate`.
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// Scheduled start on the device clock (seconds).
    pub start_time: f64,
    /// Length in seconds.
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Earliest time the next unit may start.
///
/// `0.0` is the unset sentinel: no future commitment, the next unit starts
/// at the device clock.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SchedulingCursor {
    next_start_time: f64,
}

impl SchedulingCursor {
    pub const UNSET: f64 = 0.0;

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_unset(&self) -> bool {
        self.next_start_time == Self::UNSET
    }

    /// Start time for a unit scheduled when the device clock reads `now`.
    pub fn start_at(&self, now: f64) -> f64 {
        self.next_start_time.max(now)
    }

    pub fn advance(&mut self, start: f64, duration: f64) {
        self.next_start_time = start + duration;
    }

    pub fn reset(&mut self) {
        self.next_start_time = Self::UNSET;
    }
}

/// Scheduling bookkeeping guarded by the scheduler lock.
#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub(crate) cursor: SchedulingCursor,
    /// Active playback set: arena of units keyed by id.
    pub(crate) active: BTreeMap<UnitId, PlaybackUnit>,
    next_id: u64,
    /// Bumped on every interruption.
    pub(crate) epoch: u64,
}

/// Where a unit landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledUnit {
    pub id: UnitId,
    pub start_time: f64,
    pub duration: f64,
}

/// Turns inbound transport chunks into back-to-back playback.
#[derive(Clone)]
pub struct PlaybackScheduler {
    device: Arc<dyn OutputDevice>,
    state: Arc<Mutex<SchedulerState>>,
    format: PcmFormat,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl PlaybackScheduler {
    pub fn new(
        device: Arc<dyn OutputDevice>,
        format: PcmFormat,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            format,
            diagnostics,
        }
    }

    /// Controller sharing this scheduler's lock and device.
    pub fn interruption_controller(&self) -> InterruptionController {
        InterruptionController::new(
            Arc::clone(&self.device),
            Arc::clone(&self.state),
            Arc::clone(&self.diagnostics),
        )
    }

    /// Decode and schedule one inbound chunk, absorbing malformed input.
    ///
    /// Returns `None` when the chunk was dropped (malformed, empty, stale, or
    /// rejected by the device). Never touches the cursor in those cases.
    pub fn enqueue(&self, data: &str) -> Option<ScheduledUnit> {
        self.diagnostics
            .chunks_received
            .fetch_add(1, Ordering::Relaxed);
        match self.try_enqueue(data) {
            Ok(scheduled) => scheduled,
            Err(e) if !e.is_fatal() => {
                self.diagnostics
                    .chunks_malformed
                    .fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = data.len(), "dropping malformed audio chunk");
                None
            }
            Err(e) => {
                warn!(error = %e, "output device rejected playback unit");
                None
            }
        }
    }

    /// Fallible form of [`enqueue`](Self::enqueue).
    pub fn try_enqueue(&self, data: &str) -> Result<Option<ScheduledUnit>> {
        let epoch = self.state.lock().epoch;
        let bytes = codec::decode_transport(data)?;
        let mut channels = codec::decode_samples(&bytes, self.format.channels as usize)?;
        // Only the first channel is played; the session negotiates mono.
        let samples = channels.swap_remove(0);
        self.schedule_samples(samples, epoch)
    }

    /// Schedule already-decoded samples that began decoding at `epoch`.
    ///
    /// If an interruption happened since, the samples belong to the
    /// interrupted utterance and are discarded.
    pub fn schedule_samples(&self, samples: Vec<f32>, epoch: u64) -> Result<Option<ScheduledUnit>> {
        if samples.is_empty() {
            debug!("ignoring empty audio chunk");
            return Ok(None);
        }

        let duration = self.format.duration_secs(samples.len());
        let mut state = self.state.lock();

        if state.epoch != epoch {
            self.diagnostics.chunks_stale.fetch_add(1, Ordering::Relaxed);
            debug!(
                decoded_epoch = epoch,
                current_epoch = state.epoch,
                "discarding chunk decoded before interruption"
            );
            return Ok(None);
        }

        let now = self.device.now();
        let start_time = state.cursor.start_at(now);
        let id = UnitId(state.next_id);

        let unit = PlaybackUnit {
            id,
            samples: Arc::from(samples),
            sample_rate: self.format.sample_rate,
            start_time,
            duration,
        };
        self.device.schedule(&unit)?;

        state.next_id += 1;
        state.cursor.advance(start_time, duration);
        state.active.insert(id, unit);
        self.diagnostics
            .units_scheduled
            .fetch_add(1, Ordering::Relaxed);

        debug!(
            unit = %id,
            start_time,
            duration,
            lead = start_time - now,
            active = state.active.len(),
            "scheduled playback unit"
        );

        Ok(Some(ScheduledUnit {
            id,
            start_time,
            duration,
        }))
    }

    /// Natural end-of-buffer from the device. Returns `false` for ids no
    /// longer tracked (e.g. already stopped by an interruption).
    pub fn on_unit_ended(&self, id: UnitId) -> bool {
        let removed = self.state.lock().active.remove(&id).is_some();
        if removed {
            self.diagnostics
                .units_completed
                .fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn handle_event(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Ended(id) => {
                self.on_unit_ended(id);
            }
        }
    }

    /// Current interruption epoch.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn next_start_time(&self) -> f64 {
        self.state.lock().cursor.next_start_time()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn active_ids(&self) -> Vec<UnitId> {
        self.state.lock().active.keys().copied().collect()
    }

    /// Seconds of scheduled audio not yet played.
    pub fn buffered_secs(&self) -> f64 {
        let state = self.state.lock();
        (state.cursor.next_start_time() - self.device.now()).max(0.0)
    }

    pub fn device(&self) -> &Arc<dyn OutputDevice> {
        &self.device
    }
}

impl fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::offline::OfflineOutput;
    use crate::codec::{encode_samples, encode_transport};

    fn chunk(frames: usize) -> String {
        encode_transport(&encode_samples(&vec![0.2; frames]))
    }

    fn scheduler() -> (PlaybackScheduler, Arc<OfflineOutput>) {
        let output = Arc::new(OfflineOutput::new(24_000));
        let device: Arc<dyn OutputDevice> = output.clone();
        (
            PlaybackScheduler::new(
                device,
                PcmFormat::OUTPUT,
                Arc::new(PipelineDiagnostics::default()),
            ),
            output,
        )
    }

    #[test]
    fn cursor_absorbs_early_and_late_arrivals() {
        let mut cursor = SchedulingCursor::default();
        assert!(cursor.is_unset());
        assert_eq!(cursor.start_at(1.25), 1.25);
        cursor.advance(1.25, 0.5);
        assert_eq!(cursor.start_at(1.3), 1.75);
        assert_eq!(cursor.start_at(2.0), 2.0);
        cursor.reset();
        assert!(cursor.is_unset());
    }

    #[test]
    fn ids_increase_and_units_join_active_set() {
        let (sched, _out) = scheduler();
        let a = sched.enqueue(&chunk(240)).unwrap();
        let b = sched.enqueue(&chunk(240)).unwrap();
        assert!(b.id > a.id);
        assert_eq!(sched.active_ids(), vec![a.id, b.id]);
    }

    #[test]
    fn completion_is_bookkeeping_only() {
        let (sched, _out) = scheduler();
        let a = sched.enqueue(&chunk(240)).unwrap();
        let cursor = sched.next_start_time();
        assert!(sched.on_unit_ended(a.id));
        assert!(!sched.on_unit_ended(a.id));
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.next_start_time(), cursor);
    }

    #[test]
    fn empty_chunk_is_ignored() {
        let (sched, _out) = scheduler();
        assert!(sched.enqueue("").is_none());
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.next_start_time(), SchedulingCursor::UNSET);
    }

    #[test]
    fn stale_epoch_is_discarded() {
        let (sched, _out) = scheduler();
        let epoch = sched.epoch();
        sched.interruption_controller().interrupt();
        let res = sched.schedule_samples(vec![0.1; 240], epoch).unwrap();
        assert!(res.is_none());
        assert_eq!(sched.active_count(), 0);
        assert!(sched
            .schedule_samples(vec![0.1; 240], sched.epoch())
            .unwrap()
            .is_some());
    }

    #[test]
    fn buffered_time_tracks_cursor_lead() {
        let (sched, out) = scheduler();
        sched.enqueue(&chunk(12_000)).unwrap();
        assert!((sched.buffered_secs() - 0.5).abs() < 1e-9);
        out.advance_secs(0.2);
        assert!((sched.buffered_secs() - 0.3).abs() < 1e-9);
    }
}
