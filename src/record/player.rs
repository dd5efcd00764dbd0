//! Frame-accurate playback of a decoded record. Grounded on
//! `RecordPlayer::Tick`/`ApplyFrameInput`/`ConvertKeyState`.

use crate::error::TasError;
use crate::input::{PRESSED, RELEASED};
use crate::record::codec::{KeyField, RecordFrame, ALL_KEY_FIELDS};
use crate::record::RecordCompressor;

/// Fallback pace used whenever playback isn't active, or has already
/// run past the last frame: the original engine's default frame time.
pub const DEFAULT_FRAME_DELTA_MS: f32 = 1000.0 / 132.0;

/// Maps a physical key field to the byte offset the host buffer expects
/// it at. Left to the caller because the mapping depends on the host's
/// keybinding table, not on the record format itself.
pub type KeyCodeMap = std::collections::BTreeMap<KeyField, u8>;

pub fn default_key_code_map() -> KeyCodeMap {
    let mut map = KeyCodeMap::new();
    map.insert(KeyField::Up, 200);
    map.insert(KeyField::Down, 208);
    map.insert(KeyField::Left, 203);
    map.insert(KeyField::Right, 205);
    map.insert(KeyField::Q, 16);
    map.insert(KeyField::Shift, 42);
    map.insert(KeyField::Space, 57);
    map.insert(KeyField::Esc, 1);
    map.insert(KeyField::Enter, 28);
    map
}

/// Edge-detects a two-frame bit pair into the tick-visible key byte:
/// idle if not currently held, `PRESSED` if held and still held next
/// frame, `PRESSED | RELEASED` if held now but not next frame.
pub fn convert(current_bit: bool, next_bit: bool) -> u8 {
    if !current_bit {
        0
    } else if next_bit {
        PRESSED
    } else {
        PRESSED | RELEASED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Completed,
    Stopped,
}

pub struct RecordPlayer {
    frames: Vec<RecordFrame>,
    key_map: KeyCodeMap,
    current_tick: usize,
    active: bool,
}

impl RecordPlayer {
    pub fn new() -> Self {
        RecordPlayer {
            frames: Vec::new(),
            key_map: default_key_code_map(),
            current_tick: 0,
            active: false,
        }
    }

    pub fn with_key_map(key_map: KeyCodeMap) -> Self {
        RecordPlayer {
            key_map,
            ..Self::new()
        }
    }

    /// Loads a record file's bytes, appends one sentinel frame for
    /// lookahead so `convert` can always read "next", and starts
    /// playback at tick 0.
    pub fn load_and_play(
        &mut self,
        bytes: &[u8],
        compressor: &dyn RecordCompressor,
    ) -> Result<(), TasError> {
        let mut frames = crate::record::codec::unpack_record(bytes, compressor)?;
        frames.push(RecordFrame::default());
        self.frames = frames;
        self.current_tick = 0;
        self.active = !self.frames.is_empty() && self.frames.len() > 1;
        if self.active {
            log::info!("record playback loaded with {} frames", self.frames.len() - 1);
        } else {
            log::warn!("record playback loaded an empty record");
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.active = false;
        self.frames.clear();
        self.current_tick = 0;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    /// Advances one tick, writing the remapped keys into `buffer` at
    /// their host byte offsets. Returns the status after this tick.
    pub fn tick(&mut self, buffer: &mut [u8]) -> PlaybackStatus {
        if !self.active {
            return PlaybackStatus::Stopped;
        }
        if self.current_tick >= self.total_frames() {
            self.stop();
            return PlaybackStatus::Completed;
        }
        let current = self.frames[self.current_tick];
        let next = self.frames[self.current_tick + 1];
        for field in ALL_KEY_FIELDS {
            let byte = convert(current.bit(field), next.bit(field));
            if let Some(&code) = self.key_map.get(&field) {
                if let Some(slot) = buffer.get_mut(code as usize) {
                    *slot = byte;
                }
            }
        }
        self.current_tick += 1;
        PlaybackStatus::Playing
    }

    /// Delta time for the current tick, or the engine's documented
    /// default when playback isn't active or has run past the end.
    pub fn frame_delta_time_ms(&self) -> f32 {
        if !self.active || self.current_tick >= self.total_frames() {
            return DEFAULT_FRAME_DELTA_MS;
        }
        self.frames[self.current_tick].delta_time_ms
    }
}

impl Default for RecordPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::IdentityCompressor;

    fn frame(delta: f32, up: bool) -> RecordFrame {
        RecordFrame {
            delta_time_ms: delta,
            up,
            ..Default::default()
        }
    }

    #[test]
    fn record_playback_matches_s3() {
        let frames = vec![
            frame(16.666, true),
            frame(16.666, true),
            frame(16.666, false),
        ];
        let bytes = crate::record::codec::pack_record(&frames, &IdentityCompressor);
        let mut player = RecordPlayer::new();
        player.load_and_play(&bytes, &IdentityCompressor).unwrap();

        let mut buf = vec![0u8; 256];
        assert_eq!(player.tick(&mut buf), PlaybackStatus::Playing);
        assert_eq!(buf[200], PRESSED);

        assert_eq!(player.tick(&mut buf), PlaybackStatus::Playing);
        assert_eq!(buf[200], PRESSED | RELEASED);

        // Third real frame, looked ahead against the sentinel frame
        // `load_and_play` appends: `up` is idle in both, so the byte is 0.
        assert_eq!(player.tick(&mut buf), PlaybackStatus::Playing);
        assert_eq!(buf[200], 0);

        assert_eq!(player.tick(&mut buf), PlaybackStatus::Completed);
    }

    #[test]
    fn empty_record_is_inactive() {
        let bytes = crate::record::codec::pack_record(&[], &IdentityCompressor);
        let mut player = RecordPlayer::new();
        player.load_and_play(&bytes, &IdentityCompressor).unwrap();
        assert!(!player.is_active());
        assert_eq!(player.frame_delta_time_ms(), DEFAULT_FRAME_DELTA_MS);
    }

    #[test]
    fn fallback_delta_after_completion() {
        let frames = vec![frame(20.0, false)];
        let bytes = crate::record::codec::pack_record(&frames, &IdentityCompressor);
        let mut player = RecordPlayer::new();
        player.load_and_play(&bytes, &IdentityCompressor).unwrap();
        let mut buf = vec![0u8; 256];
        player.tick(&mut buf);
        assert_eq!(player.frame_delta_time_ms(), DEFAULT_FRAME_DELTA_MS);
    }

    #[test]
    fn convert_edge_cases() {
        assert_eq!(convert(false, false), 0);
        assert_eq!(convert(false, true), 0);
        assert_eq!(convert(true, true), PRESSED);
        assert_eq!(convert(true, false), PRESSED | RELEASED);
    }
}
