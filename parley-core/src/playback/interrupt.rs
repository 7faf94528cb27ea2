//! Barge-in handling.
//!
//! When the remote reports that its current utterance was interrupted, every
//! scheduled or playing unit is hard-stopped, the active set is cleared and
//! the cursor returns to its unset sentinel, all under the scheduler lock.
//! The epoch bump makes any chunk decoded before the interruption stale.

use std::sync::{atomic::Ordering, Arc};

use parking_lot::Mutex;
use tracing::info;

use super::{OutputDevice, SchedulerState};
use crate::diagnostics::PipelineDiagnostics;

/// Stops in-flight playback and resets the scheduling timeline.
#[derive(Clone)]
pub struct InterruptionController {
    device: Arc<dyn OutputDevice>,
    state: Arc<Mutex<SchedulerState>>,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl InterruptionController {
    pub(crate) fn new(
        device: Arc<dyn OutputDevice>,
        state: Arc<Mutex<SchedulerState>>,
        diagnostics: Arc<PipelineDiagnostics>,
    ) -> Self {
        Self {
            device,
            state,
            diagnostics,
        }
    }

    /// Hard-stop everything and reset the cursor. Returns the number of units stopped.
    pub fn interrupt(&self) -> usize {
        let mut state = self.state.lock();

        let stopped = state.active.len();
        for id in state.active.keys() {
            self.device.stop(*id);
        }
        state.active.clear();
        let abandoned_until = state.cursor.next_start_time();
        state.cursor.reset();
        state.epoch = state.epoch.wrapping_add(1);

        self.diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .units_interrupted
            .fetch_add(stopped, Ordering::Relaxed);

        info!(
            stopped,
            abandoned_until,
            epoch = state.epoch,
            "playback interrupted"
        );
        stopped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::audio::offline::OfflineOutput;
    use crate::codec::PcmFormat;
    use crate::diagnostics::PipelineDiagnostics;
    use crate::playback::{OutputDevice, PlaybackScheduler, SchedulingCursor};

    #[test]
    fn interrupt_clears_set_cursor_and_device() {
        let output = Arc::new(OfflineOutput::new(24_000));
        let device: Arc<dyn OutputDevice> = output.clone();
        let diagnostics = Arc::new(PipelineDiagnostics::default());
        let sched = PlaybackScheduler::new(device, PcmFormat::OUTPUT, Arc::clone(&diagnostics));
        let ctl = sched.interruption_controller();

        let epoch = sched.epoch();
        sched.schedule_samples(vec![0.3; 2_400], epoch).unwrap();
        sched.schedule_samples(vec![0.3; 2_400], epoch).unwrap();
        assert_eq!(output.voices(), 2);

        assert_eq!(ctl.interrupt(), 2);
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.next_start_time(), SchedulingCursor::UNSET);
        assert_eq!(output.voices(), 0);
        assert_eq!(sched.epoch(), epoch + 1);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.interruptions, 1);
        assert_eq!(snap.units_interrupted, 2);
    }

    #[test]
    fn interrupt_when_idle_is_harmless() {
        let output = Arc::new(OfflineOutput::new(24_000));
        let sched = PlaybackScheduler::new(
            output,
            PcmFormat::OUTPUT,
            Arc::new(PipelineDiagnostics::default()),
        );
        assert_eq!(sched.interruption_controller().interrupt(), 0);
        assert_eq!(sched.active_count(), 0);
    }
}
