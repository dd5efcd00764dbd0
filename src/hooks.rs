//! The determinism hooks a host must implement. The runtime never
//! implements real timing, input sampling, or randomness itself: it
//! only specifies the contract and drives it from the engine's tick
//! loop. Grounded on `TASHook.h`/`GameInterface.h` (the seams the
//! original hooks into the host engine at) and `server/hooks.rs`'s
//! `GameHooks` trait shape in the teacher crate for the trait-per-
//! subsystem split.

/// Called once per tick to let the runtime override the frame's delta
/// time. Implementations should install this where the host samples
/// its own frame pacing.
pub trait TimeHook: Send {
    fn set_delta_time_ms(&mut self, delta_ms: f32);
}

/// Called just before the host samples `key_state[0..256]`. The
/// runtime mutates `buffer` in place; the host must not have written
/// its own input into `buffer` yet for playback ticks, and must have
/// already written it for recording ticks (the runtime reads rather
/// than writes during recording).
pub trait InputHook: Send {
    fn pre_input(&mut self, buffer: &mut [u8; 256]);
}

/// A host-owned notification surface for high-level state changes and
/// diagnostic text, mirroring `set_ui_mode`/`send_ingame_message`.
pub trait HostNotifications: Send {
    fn set_ui_mode(&mut self, mode: UiMode);
    fn send_ingame_message(&mut self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiMode {
    Idle = 0,
    Playing = 1,
    Recording = 2,
    Paused = 3,
}

/// A tick-deterministic randomness source: every call must depend only
/// on the current tick index, so repeated playback over the same
/// record or script produces bit-identical buffers. The runtime never
/// chooses or ships a production algorithm for this; `TickSeededRng`
/// below exists for tests only.
pub trait DeterminismSource: Send {
    fn next_u64(&mut self, tick: u64) -> u64;
}

/// splitmix64 keyed by tick, used only in this crate's own tests. A
/// host's production RNG substitution is expected to match its own
/// engine's algorithm, not this one.
pub struct TickSeededRng;

impl DeterminismSource for TickSeededRng {
    fn next_u64(&mut self, tick: u64) -> u64 {
        let mut z = tick.wrapping_add(0x9E3779B97F4A7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_seeded_rng_is_a_pure_function_of_tick() {
        let mut a = TickSeededRng;
        let mut b = TickSeededRng;
        assert_eq!(a.next_u64(42), b.next_u64(42));
        assert_ne!(a.next_u64(1), b.next_u64(2));
    }
}
