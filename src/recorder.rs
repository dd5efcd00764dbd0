//! Captures real (un-synthesized) key transitions and game events on a
//! per-tick basis. Grounded on `Recorder.h`/`Recorder.cpp`.

pub mod generator;

pub use generator::{generate_script, GenerationOptions, GeneratedProject};

/// A single tick's recorded input, mirroring `RawInputState`/`RawFrameData`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFrameData {
    pub tick_index: u32,
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub shift: bool,
    pub space: bool,
    pub q: bool,
    pub esc: bool,
    pub events: Vec<GameEvent>,
    pub ball_speed: f32,
    pub is_on_ground: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GameEvent {
    pub name: String,
    pub data: i32,
}

/// A source of the real keyboard's state for one tick, supplied by the
/// host; the recorder never samples hardware itself.
pub trait RealInputSource {
    fn sample(&self) -> RawInputSample;
    /// Optional physics snapshot for validation/debugging comments.
    fn physics_snapshot(&self) -> Option<(f32, bool)> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RawInputSample {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub shift: bool,
    pub space: bool,
    pub q: bool,
    pub esc: bool,
}

pub struct Recorder {
    recording: bool,
    current_tick: u32,
    frames: Vec<RawFrameData>,
    pending_events: Vec<GameEvent>,
    max_frames: usize,
    warned_max_frames: bool,
    update_rate_hz: f32,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            recording: false,
            current_tick: 0,
            frames: Vec::new(),
            pending_events: Vec::new(),
            max_frames: 100_000,
            warned_max_frames: false,
            update_rate_hz: 132.0,
        }
    }

    pub fn set_max_frames(&mut self, max_frames: usize) {
        self.max_frames = max_frames;
        self.warned_max_frames = false;
    }

    pub fn set_update_rate(&mut self, ticks_per_second: f32) {
        self.update_rate_hz = ticks_per_second;
    }

    pub fn delta_time_ms(&self) -> f32 {
        1000.0 / self.update_rate_hz
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn current_frame(&self) -> u32 {
        self.current_tick
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn start(&mut self) {
        if self.recording {
            log::warn!("recorder restarted while already recording; discarding prior frames");
        }
        self.frames.clear();
        self.pending_events.clear();
        self.current_tick = 0;
        self.warned_max_frames = false;
        self.recording = true;
        log::info!("recording started");
    }

    pub fn on_game_event(&mut self, name: &str, data: i32) {
        if !self.recording {
            return;
        }
        self.pending_events.push(GameEvent {
            name: name.to_string(),
            data,
        });
    }

    pub fn tick(&mut self, source: &dyn RealInputSource) {
        if !self.recording {
            return;
        }
        if self.frames.len() >= self.max_frames {
            if !self.warned_max_frames {
                log::warn!("recorder hit max frame count {}; auto-stopping", self.max_frames);
                self.warned_max_frames = true;
            }
            self.recording = false;
            return;
        }
        let sample = source.sample();
        let (ball_speed, is_on_ground) = source.physics_snapshot().unwrap_or((0.0, false));
        let frame = RawFrameData {
            tick_index: self.current_tick,
            up: sample.up,
            down: sample.down,
            left: sample.left,
            right: sample.right,
            shift: sample.shift,
            space: sample.space,
            q: sample.q,
            esc: sample.esc,
            events: std::mem::take(&mut self.pending_events),
            ball_speed,
            is_on_ground,
        };
        self.frames.push(frame);
        self.current_tick += 1;
    }

    /// Stops the session and returns the captured frames, flushing any
    /// trailing pending events onto the final frame.
    pub fn stop(&mut self) -> Vec<RawFrameData> {
        if !self.pending_events.is_empty() {
            if let Some(last) = self.frames.last_mut() {
                last.events.append(&mut self.pending_events);
            } else {
                self.pending_events.clear();
            }
        }
        self.recording = false;
        log::info!("recording stopped with {} frames", self.frames.len());
        std::mem::take(&mut self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInput(RawInputSample);
    impl RealInputSource for FixedInput {
        fn sample(&self) -> RawInputSample {
            self.0
        }
    }

    #[test]
    fn records_frames_and_attaches_pending_events() {
        let mut rec = Recorder::new();
        rec.start();
        rec.tick(&FixedInput(RawInputSample {
            up: true,
            ..Default::default()
        }));
        rec.on_game_event("checkpoint", 3);
        rec.tick(&FixedInput(RawInputSample::default()));
        let frames = rec.stop();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].up);
        assert_eq!(frames[1].events, vec![GameEvent { name: "checkpoint".into(), data: 3 }]);
    }

    #[test]
    fn trailing_events_flush_onto_last_frame_on_stop() {
        let mut rec = Recorder::new();
        rec.start();
        rec.tick(&FixedInput(RawInputSample::default()));
        rec.on_game_event("end", 0);
        let frames = rec.stop();
        assert_eq!(frames[0].events.len(), 1);
    }

    #[test]
    fn stops_automatically_at_max_frames() {
        let mut rec = Recorder::new();
        rec.set_max_frames(2);
        rec.start();
        for _ in 0..5 {
            rec.tick(&FixedInput(RawInputSample::default()));
        }
        assert!(!rec.is_recording());
        assert_eq!(rec.total_frames(), 2);
    }

    #[test]
    fn ticking_while_not_recording_is_a_no_op() {
        let mut rec = Recorder::new();
        rec.tick(&FixedInput(RawInputSample::default()));
        assert_eq!(rec.total_frames(), 0);
    }
}
