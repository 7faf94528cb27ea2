//! Sample-accurate software mixer used on the render side of output devices.
//!
//! Voices are placed at absolute frame positions on the device clock. The
//! mixer performs no I/O and no locking; apart from growing its voice list
//! it does not allocate, so it can run inside the device callback.

use std::sync::Arc;

use crate::playback::UnitId;

#[derive(Debug)]
struct Voice {
    id: UnitId,
    samples: Arc<[f32]>,
    start_frame: u64,
    /// Set once the voice produced its first frame.
    started: bool,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Debug)]
pub struct Mixer {
    voices: Vec<Voice>,
    channels: usize,
    /// Frames the pending timeline was pushed back by late voices. Applied
    /// to every voice added while the mixer is busy.
    slip: u64,
}

impl Mixer {
    pub fn with_capacity(channels: usize, voices: usize) -> Self {
        Self {
            voices: Vec::with_capacity(voices),
            channels: channels.max(1),
            slip: 0,
        }
    }

    /// Place mono `samples` at absolute `start_frame`.
    pub fn add(&mut self, id: UnitId, samples: Arc<[f32]>, start_frame: u64) {
        self.voices.push(Voice {
            id,
            samples,
            start_frame: start_frame + self.slip,
            started: false,
        });
    }

    /// Drop a voice immediately. Returns whether it was present.
    pub fn stop(&mut self, id: UnitId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        if self.voices.is_empty() {
            self.slip = 0;
        }
        self.voices.len() != before
    }

    pub fn stop_all(&mut self) {
        self.voices.clear();
        self.slip = 0;
    }

    /// Current timeline slip in frames.
    pub fn slip(&self) -> u64 {
        self.slip
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Mix all voices into interleaved `out`, whose first frame is absolute
    /// frame `clock`. Mono voices are copied to every channel.
    ///
    /// `on_end` is called once for each voice that played its last frame
    /// within this block; such voices are removed.
    ///
    /// A voice that arrives after its start frame has passed starts at
    /// `clock`, and every pending voice slips by the same amount so seams
    /// between back-to-back voices stay gapless and never overlap.
    pub fn render(&mut self, out: &mut [f32], clock: u64, mut on_end: impl FnMut(UnitId)) {
        out.fill(0.0);
        let ch = self.channels;
        let frames = (out.len() / ch) as u64;
        let block_end = clock + frames;

        let earliest_pending = self
            .voices
            .iter()
            .filter(|v| !v.started)
            .map(|v| v.start_frame)
            .min();
        if let Some(earliest) = earliest_pending.filter(|&f| f < clock) {
            let late = clock - earliest;
            for voice in self.voices.iter_mut().filter(|v| !v.started) {
                voice.start_frame += late;
            }
            self.slip += late;
        }

        self.voices.retain_mut(|voice| {
            if !voice.started {
                if voice.start_frame >= block_end {
                    return true;
                }
                voice.started = true;
            }

            let lo = voice.start_frame.max(clock);
            let hi = voice.end_frame().min(block_end);
            for abs in lo..hi {
                let s = voice.samples[(abs - voice.start_frame) as usize];
                let base = (abs - clock) as usize * ch;
                for sample in &mut out[base..base + ch] {
                    *sample += s;
                }
            }

            if voice.end_frame() <= block_end {
                on_end(voice.id);
                false
            } else {
                true
            }
        });

        if self.voices.is_empty() {
            self.slip = 0;
        }
    }
}
