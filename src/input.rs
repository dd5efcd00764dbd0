//! Preemptive, two-phase key-state replicator. Mirrors the host's
//! own `PRESSED`/`RELEASED` bit convention so a script's `press`/`release`
//! calls land on exactly the bytes the host reads during its own input
//! sampling. Grounded on `InputSystem.h`/`InputSystem.cpp`.

use std::collections::BTreeMap;

pub const PRESSED: u8 = 0b01;
pub const RELEASED: u8 = 0b10;

/// Per-key state for one tick. `had_press_event`/`had_release_event`
/// exist so the owning system can distinguish "still held" from
/// "pressed again this tick" when deciding whether to re-arm a timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyState {
    pub current_state: u8,
    pub had_press_event: bool,
    pub had_release_event: bool,
    pub timestamp: u64,
}

impl KeyState {
    fn apply_press(&mut self, tick: u64) {
        self.current_state |= PRESSED;
        self.current_state &= !RELEASED;
        self.had_press_event = true;
        self.timestamp = tick;
    }

    fn apply_release(&mut self, tick: u64) {
        self.current_state |= RELEASED;
        self.had_release_event = true;
        self.timestamp = tick;
    }

    /// Post-tick cleanup: a key seen as released this tick goes idle for
    /// the next one; the press/release event flags always reset.
    fn prepare_next_frame(&mut self) {
        if self.current_state & RELEASED != 0 {
            self.current_state = 0;
        }
        self.had_press_event = false;
        self.had_release_event = false;
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingRelease {
    NextFrame,
    AfterTicks(u32),
}

/// Known symbolic key names and their key codes. The reserved logical
/// names (`up`, `down`, `left`, `right`, `shift`, `space`) are the ones a
/// host keybinding table is expected to remap; everything else passes
/// through as a literal key-code name (`"65"` for key code 65, etc.).
fn default_keymap() -> BTreeMap<String, u8> {
    let mut map = BTreeMap::new();
    map.insert("up".to_string(), 200);
    map.insert("down".to_string(), 208);
    map.insert("left".to_string(), 203);
    map.insert("right".to_string(), 205);
    map.insert("shift".to_string(), 42);
    map.insert("space".to_string(), 57);
    map.insert("q".to_string(), 16);
    map.insert("esc".to_string(), 1);
    map.insert("enter".to_string(), 28);
    map
}

pub struct InputSystem {
    keymap: BTreeMap<String, u8>,
    states: BTreeMap<u8, KeyState>,
    pending_releases: BTreeMap<u8, PendingRelease>,
    current_tick: u64,
    enabled: bool,
}

impl Default for InputSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSystem {
    pub fn new() -> Self {
        InputSystem {
            keymap: default_keymap(),
            states: BTreeMap::new(),
            pending_releases: BTreeMap::new(),
            current_tick: 0,
            enabled: true,
        }
    }

    pub fn set_key_mapping(&mut self, name: &str, code: u8) {
        self.keymap.insert(name.to_lowercase(), code);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_valid_key(&self, name: &str) -> bool {
        self.get_key_code(name).is_some()
    }

    pub fn available_keys(&self) -> Vec<String> {
        self.keymap.keys().cloned().collect()
    }

    fn get_key_code(&self, token: &str) -> Option<u8> {
        let lower = token.trim().to_lowercase();
        if lower.is_empty() {
            return None;
        }
        if let Some(code) = self.keymap.get(&lower) {
            return Some(*code);
        }
        lower.parse::<u8>().ok()
    }

    /// Parses a key spec: comma/semicolon/whitespace separated tokens,
    /// duplicates collapsed preserving first occurrence, unknown tokens
    /// silently dropped.
    fn parse_keys(&self, spec: &str) -> Vec<u8> {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for token in spec.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
            if token.is_empty() {
                continue;
            }
            if let Some(code) = self.get_key_code(token) {
                if seen.insert(code) {
                    out.push(code);
                }
            }
        }
        out
    }

    pub fn press_keys(&mut self, spec: &str) {
        if !self.enabled {
            return;
        }
        for code in self.parse_keys(spec) {
            self.pending_releases.remove(&code);
            self.states.entry(code).or_default().apply_press(self.current_tick);
        }
    }

    pub fn press_keys_one_frame(&mut self, spec: &str) {
        if !self.enabled {
            return;
        }
        for code in self.parse_keys(spec) {
            self.states.entry(code).or_default().apply_press(self.current_tick);
            self.pending_releases.insert(code, PendingRelease::NextFrame);
        }
    }

    pub fn hold_keys(&mut self, spec: &str, ticks: u32) {
        if !self.enabled {
            return;
        }
        for code in self.parse_keys(spec) {
            self.states.entry(code).or_default().apply_press(self.current_tick);
            if ticks == 0 {
                self.pending_releases.insert(code, PendingRelease::NextFrame);
            } else {
                self.pending_releases.insert(code, PendingRelease::AfterTicks(ticks));
            }
        }
    }

    pub fn release_keys(&mut self, spec: &str) {
        if !self.enabled {
            return;
        }
        for code in self.parse_keys(spec) {
            self.pending_releases.remove(&code);
            if let Some(state) = self.states.get_mut(&code) {
                if state.current_state & PRESSED != 0 {
                    state.apply_release(self.current_tick);
                }
            }
        }
    }

    pub fn release_all_keys(&mut self) {
        if !self.enabled {
            return;
        }
        self.pending_releases.clear();
        for state in self.states.values_mut() {
            if state.current_state & PRESSED != 0 {
                state.apply_release(self.current_tick);
            }
        }
    }

    pub fn are_keys_pressed(&self, spec: &str) -> bool {
        let codes = self.parse_keys(spec);
        if codes.is_empty() {
            return false;
        }
        codes.iter().all(|code| {
            self.states
                .get(code)
                .map(|s| s.current_state & PRESSED != 0)
                .unwrap_or(false)
        })
    }

    /// Writes this tick's key bytes into the host buffer for every
    /// tracked key. Keys never touched stay whatever the buffer already
    /// held (typically zeroed by the host before sampling).
    pub fn apply(&self, buffer: &mut [u8]) {
        if !self.enabled {
            return;
        }
        for (&code, state) in &self.states {
            if let Some(slot) = buffer.get_mut(code as usize) {
                *slot = state.current_state;
            }
        }
    }

    /// Post-phase: advance timed holds, release keys whose timer expired,
    /// and reset transient event flags. Advances the tick counter.
    pub fn prepare_next_frame(&mut self) {
        let mut to_release = Vec::new();
        for (&code, pending) in self.pending_releases.iter_mut() {
            match pending {
                PendingRelease::NextFrame => to_release.push(code),
                PendingRelease::AfterTicks(remaining) => {
                    *remaining -= 1;
                    if *remaining == 0 {
                        to_release.push(code);
                    }
                }
            }
        }
        for code in &to_release {
            self.pending_releases.remove(code);
            if let Some(state) = self.states.get_mut(code) {
                if state.current_state & PRESSED != 0 {
                    state.apply_release(self.current_tick);
                }
            }
        }
        for state in self.states.values_mut() {
            state.prepare_next_frame();
        }
        self.current_tick += 1;
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// Zeroes the full host key-state buffer. Used when tearing down a
    /// playback so stray state doesn't leak into whatever runs next.
    pub fn reset_buffer(buffer: &mut [u8]) {
        buffer.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_tap_lifecycle() {
        // S1 from the testable-properties scenarios.
        let mut sys = InputSystem::new();
        let mut buf = vec![0u8; 256];

        sys.press_keys("space");
        sys.apply(&mut buf);
        assert_eq!(buf[57], PRESSED);
        sys.prepare_next_frame();

        sys.apply(&mut buf);
        assert_eq!(buf[57], PRESSED);
        sys.prepare_next_frame();

        sys.release_keys("space");
        sys.apply(&mut buf);
        assert_eq!(buf[57], PRESSED | RELEASED);
        sys.prepare_next_frame();

        sys.apply(&mut buf);
        assert_eq!(buf[57], 0);
    }

    #[test]
    fn one_frame_press_releases_next_tick() {
        // S2.
        let mut sys = InputSystem::new();
        let mut buf = vec![0u8; 256];

        sys.press_keys_one_frame("up");
        sys.apply(&mut buf);
        assert_eq!(buf[200], PRESSED);
        sys.prepare_next_frame();

        sys.apply(&mut buf);
        assert_eq!(buf[200], PRESSED | RELEASED);
        sys.prepare_next_frame();

        sys.apply(&mut buf);
        assert_eq!(buf[200], 0);
    }

    #[test]
    fn hold_for_n_ticks_then_releases() {
        let mut sys = InputSystem::new();
        let mut buf = vec![0u8; 256];

        sys.hold_keys("left", 3);
        for _ in 0..3 {
            sys.apply(&mut buf);
            assert_eq!(buf[203], PRESSED);
            sys.prepare_next_frame();
        }
        sys.apply(&mut buf);
        assert_eq!(buf[203], PRESSED | RELEASED);
    }

    #[test]
    fn disabled_system_is_a_no_op() {
        let mut sys = InputSystem::new();
        sys.set_enabled(false);
        let mut buf = vec![0u8; 256];
        sys.press_keys("space");
        sys.apply(&mut buf);
        assert_eq!(buf[57], 0);
    }

    #[test]
    fn key_spec_parsing_dedupes_and_ignores_unknown() {
        let sys = InputSystem::new();
        let codes = sys.parse_keys("space, space ;unknownkey up");
        assert_eq!(codes, vec![57, 200]);
    }

    #[test]
    fn release_all_keys_is_idempotent() {
        let mut sys = InputSystem::new();
        sys.press_keys("up left");
        sys.release_all_keys();
        sys.release_all_keys();
        assert!(!sys.are_keys_pressed("up"));
    }

    #[test]
    fn reset_buffer_zeroes_everything() {
        let mut buf = vec![7u8; 256];
        InputSystem::reset_buffer(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
