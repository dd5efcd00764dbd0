//! The top-level state machine coordinating recording, playback, and
//! script translation. Grounded on `TASEngine.h`'s `TASState` bitflags
//! and control surface, reshaped into an explicit finite state machine
//! with a fixed transition table (the bitflag design allowed states
//! the original never actually reaches, e.g. playing and recording at
//! once; an explicit enum with a transition table rules those out at
//! compile time instead of by convention).

use std::collections::VecDeque;

use crate::error::TasError;
use crate::project::ResolvedProject;
use crate::record::player::RecordPlayer;
use crate::record::RecordCompressor;
use crate::recorder::generator::{generate_script, GenerationOptions, GeneratedProject};
use crate::recorder::{RawFrameData, Recorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TasState {
    Idle,
    Recording,
    PlayingScript,
    PlayingRecord,
    Translating,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TasEvent {
    StartRecording,
    StartScriptPlayback,
    StartRecordPlayback,
    StartTranslation,
    Stop,
    Pause,
    Resume,
    LevelChange,
    Error,
}

const TRANSITION_LOG_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct TransitionLogEntry {
    pub from: TasState,
    pub event: TasEvent,
    pub to: TasState,
    pub success: bool,
    pub tick: u64,
}

fn is_active(state: TasState) -> bool {
    state != TasState::Idle
}

/// Whether `event` is a legal transition out of `from`, and if so the
/// resulting state.
fn transition_table(from: TasState, event: TasEvent) -> Option<TasState> {
    use TasEvent::*;
    use TasState::*;
    match event {
        StartRecording if from == Idle => Some(Recording),
        StartScriptPlayback if from == Idle => Some(PlayingScript),
        StartRecordPlayback if from == Idle => Some(PlayingRecord),
        StartTranslation if from == Recording => Some(Translating),
        Stop if is_active(from) => Some(Idle),
        Error if is_active(from) => Some(Idle),
        LevelChange if is_active(from) => Some(Idle),
        Pause if matches!(from, PlayingScript | PlayingRecord) => Some(Paused),
        Resume if from == Paused => Some(Paused), // actual target restored by caller
        _ => None,
    }
}

/// Coordinates a `Recorder`, a `RecordPlayer`, and script playback
/// (driven externally via the context manager) under one state
/// machine, so a caller can never e.g. tick record playback while a
/// recording session is still open.
pub struct TasEngine {
    state: TasState,
    recorder: Recorder,
    player: RecordPlayer,
    transition_log: VecDeque<TransitionLogEntry>,
    paused_from: Option<TasState>,
    current_tick: u64,
    developer_mode: bool,
}

impl Default for TasEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TasEngine {
    pub fn new() -> Self {
        TasEngine {
            state: TasState::Idle,
            recorder: Recorder::new(),
            player: RecordPlayer::new(),
            transition_log: VecDeque::with_capacity(TRANSITION_LOG_CAPACITY),
            paused_from: None,
            current_tick: 0,
            developer_mode: false,
        }
    }

    pub fn state(&self) -> TasState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TasState::Idle
    }

    pub fn is_recording(&self) -> bool {
        self.state == TasState::Recording
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, TasState::PlayingScript | TasState::PlayingRecord)
    }

    pub fn set_developer_mode(&mut self, enabled: bool) {
        self.developer_mode = enabled;
    }

    pub fn developer_mode(&self) -> bool {
        self.developer_mode
    }

    pub fn advance_tick(&mut self) {
        self.current_tick += 1;
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn transition_log(&self) -> impl Iterator<Item = &TransitionLogEntry> {
        self.transition_log.iter()
    }

    /// Runs `on_exit` of the outgoing state, applies the transition,
    /// then `on_enter` of the incoming state; a failure in `on_enter`
    /// forces the machine back to `Idle`. Every attempt, successful or
    /// not, is appended to the bounded transition log.
    fn apply(&mut self, event: TasEvent) -> Result<TasState, TasError> {
        let from = self.state;
        let Some(mut next) = transition_table(from, event) else {
            self.log_transition(from, event, from, false);
            return Err(TasError::InvalidTransition {
                from: format!("{from:?}"),
                event: format!("{event:?}"),
            });
        };

        self.on_exit(from, event);
        let enter_ok = self.on_enter(next, event);
        if !enter_ok {
            next = TasState::Idle;
        }
        self.state = next;
        self.log_transition(from, event, next, enter_ok);
        if enter_ok {
            Ok(next)
        } else {
            Err(TasError::InvalidTransition {
                from: format!("{from:?}"),
                event: format!("{event:?} (on_enter failed)"),
            })
        }
    }

    fn log_transition(&mut self, from: TasState, event: TasEvent, to: TasState, success: bool) {
        if self.transition_log.len() >= TRANSITION_LOG_CAPACITY {
            self.transition_log.pop_front();
        }
        self.transition_log.push_back(TransitionLogEntry {
            from,
            event,
            to,
            success,
            tick: self.current_tick,
        });
    }

    fn on_exit(&mut self, state: TasState, event: TasEvent) {
        match state {
            TasState::PlayingRecord if event == TasEvent::Stop || event == TasEvent::Error || event == TasEvent::LevelChange => {
                self.player.stop();
            }
            TasState::Recording if event == TasEvent::Stop || event == TasEvent::Error || event == TasEvent::LevelChange => {
                self.recorder.stop();
            }
            _ => {}
        }
    }

    /// Returns whether entry succeeded; a `false` return forces `Idle`.
    fn on_enter(&mut self, state: TasState, _event: TasEvent) -> bool {
        if state == TasState::Recording {
            self.recorder.start();
        }
        true
    }

    pub fn start_recording(&mut self) -> Result<(), TasError> {
        self.apply(TasEvent::StartRecording)?;
        Ok(())
    }

    pub fn on_game_event(&mut self, name: &str, data: i32) {
        if self.state == TasState::Recording {
            self.recorder.on_game_event(name, data);
        }
    }

    /// `Recording.on_tick`: advances the recorder. Other states either
    /// have their own tick entry point (`tick_record_playback`) or are
    /// driven externally (`PlayingScript` is ticked by the context
    /// manager's own pass, not by the engine).
    pub fn tick_recording(&mut self, source: &dyn crate::recorder::RealInputSource) {
        if self.state == TasState::Recording {
            self.recorder.tick(source);
        }
    }

    /// Stops recording, transitions through `Translating`, and builds
    /// a script. Generation here is synchronous, so `Translating` is
    /// entered and then immediately exited back to `Idle` via `Stop`;
    /// the state still exists to give a caller-driven async generator
    /// somewhere to live before calling back in.
    pub fn stop_recording_and_generate(
        &mut self,
        options: &GenerationOptions,
    ) -> Result<GeneratedProject, TasError> {
        self.apply(TasEvent::StartTranslation)?;
        let frames = self.recorder.stop();
        let project = generate_script(&frames, options);
        self.apply(TasEvent::Stop)?;
        Ok(project)
    }

    pub fn stop_recording(&mut self) -> Result<Vec<RawFrameData>, TasError> {
        self.apply(TasEvent::StartTranslation)?;
        let frames = self.recorder.stop();
        self.apply(TasEvent::Stop)?;
        Ok(frames)
    }

    pub fn recording_frame_count(&self) -> usize {
        self.recorder.total_frames()
    }

    /// Begins script playback; the context that actually executes the
    /// script is the context manager's responsibility, not the engine's.
    pub fn start_script_playback(&mut self, _project: &ResolvedProject) -> Result<(), TasError> {
        self.apply(TasEvent::StartScriptPlayback)?;
        Ok(())
    }

    pub fn start_record_playback(
        &mut self,
        bytes: &[u8],
        compressor: &dyn RecordCompressor,
    ) -> Result<(), TasError> {
        self.apply(TasEvent::StartRecordPlayback)?;
        self.player.load_and_play(bytes, compressor)
    }

    /// `PlayingRecord.on_tick`: advances the record player and writes
    /// its output into `buffer`. A no-op outside `PlayingRecord`.
    pub fn tick_record_playback(&mut self, buffer: &mut [u8]) -> Result<(), TasError> {
        if self.state != TasState::PlayingRecord {
            return Ok(());
        }
        use crate::record::player::PlaybackStatus;
        match self.player.tick(buffer) {
            PlaybackStatus::Completed | PlaybackStatus::Stopped => {
                self.apply(TasEvent::Stop)?;
            }
            PlaybackStatus::Playing => {}
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), TasError> {
        self.paused_from = Some(self.state);
        self.apply(TasEvent::Pause)?;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), TasError> {
        self.apply(TasEvent::Resume)?;
        if let Some(restored) = self.paused_from.take() {
            self.state = restored;
            if let Some(last) = self.transition_log.back_mut() {
                last.to = restored;
            }
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), TasError> {
        self.apply(TasEvent::Stop)?;
        Ok(())
    }

    pub fn level_change(&mut self) -> Result<(), TasError> {
        if !is_active(self.state) {
            return Ok(());
        }
        self.apply(TasEvent::LevelChange)?;
        Ok(())
    }

    pub fn error(&mut self) -> Result<(), TasError> {
        if !is_active(self.state) {
            return Ok(());
        }
        self.apply(TasEvent::Error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IdentityCompressor;

    #[test]
    fn idle_to_recording_to_idle_round_trip() {
        let mut engine = TasEngine::new();
        engine.start_recording().unwrap();
        assert!(engine.is_recording());
        engine.on_game_event("checkpoint", 1);
        let frames = engine.stop_recording().unwrap();
        assert!(frames.is_empty());
        assert!(engine.is_idle());
    }

    #[test]
    fn invalid_transition_is_rejected_and_logged() {
        let mut engine = TasEngine::new();
        let err = engine.resume().unwrap_err();
        assert!(matches!(err, TasError::InvalidTransition { .. }));
        assert!(engine.is_idle());
        let last = engine.transition_log().last().unwrap();
        assert!(!last.success);
    }

    #[test]
    fn cannot_start_recording_while_playing() {
        let mut engine = TasEngine::new();
        let bytes = crate::record::codec::pack_record(&[], &IdentityCompressor);
        engine.start_record_playback(&bytes, &IdentityCompressor).unwrap();
        let err = engine.start_recording().unwrap_err();
        assert!(matches!(err, TasError::InvalidTransition { .. }));
    }

    #[test]
    fn pause_resume_round_trip_preserves_playback_kind() {
        let mut engine = TasEngine::new();
        let bytes = crate::record::codec::pack_record(&[], &IdentityCompressor);
        engine.start_record_playback(&bytes, &IdentityCompressor).unwrap();
        engine.pause().unwrap();
        assert_eq!(engine.state(), TasState::Paused);
        engine.resume().unwrap();
        assert_eq!(engine.state(), TasState::PlayingRecord);
    }

    #[test]
    fn level_change_resets_to_idle_from_any_active_state() {
        let mut engine = TasEngine::new();
        engine.start_recording().unwrap();
        engine.level_change().unwrap();
        assert!(engine.is_idle());
    }

    #[test]
    fn transition_log_is_capped() {
        let mut engine = TasEngine::new();
        for _ in 0..(TRANSITION_LOG_CAPACITY + 10) {
            engine.start_recording().unwrap();
            engine.stop_recording().unwrap();
        }
        assert_eq!(engine.transition_log().count(), TRANSITION_LOG_CAPACITY);
    }

    #[test]
    fn stop_recording_and_generate_emits_a_script() {
        let mut engine = TasEngine::new();
        engine.start_recording().unwrap();
        let options = GenerationOptions::default();
        let project = engine.stop_recording_and_generate(&options).unwrap();
        assert!(project.main_lua.contains("function main()"));
        assert!(engine.is_idle());
    }
}
