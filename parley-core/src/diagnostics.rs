//! Pipeline counters shared by the capture thread, the scheduler and the
//! session event loop.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped_muted: AtomicUsize,
    pub frames_dropped_inactive: AtomicUsize,
    pub frames_dropped_backpressure: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_malformed: AtomicUsize,
    pub chunks_stale: AtomicUsize,
    pub units_scheduled: AtomicUsize,
    pub units_completed: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub units_interrupted: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped_muted: self.frames_dropped_muted.load(Ordering::Relaxed),
            frames_dropped_inactive: self.frames_dropped_inactive.load(Ordering::Relaxed),
            frames_dropped_backpressure: self
                .frames_dropped_backpressure
                .load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_malformed: self.chunks_malformed.load(Ordering::Relaxed),
            chunks_stale: self.chunks_stale.load(Ordering::Relaxed),
            units_scheduled: self.units_scheduled.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            units_interrupted: self.units_interrupted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub frames_dropped_muted: usize,
    pub frames_dropped_inactive: usize,
    pub frames_dropped_backpressure: usize,
    pub chunks_received: usize,
    pub chunks_malformed: usize,
    pub chunks_stale: usize,
    pub units_scheduled: usize,
    pub units_completed: usize,
    pub interruptions: usize,
    pub units_interrupted: usize,
}
