//! A deterministic, tick-driven execution runtime for tool-assisted
//! scripting and replay.
//!
//! The runtime owns no engine loop of its own: a host drives it one
//! tick at a time, supplying real input state and real time via the
//! [`hooks`] traits and receiving back the keyboard buffer the current
//! tick's active context (script, record, or recording pass-through)
//! wants applied. Everything above that seam — the Lua scheduler, the
//! record codec, the message bus between isolated script contexts —
//! is implemented here and is bit-for-bit reproducible across runs
//! given the same inputs.
//!
//! Module map:
//! - [`error`] — the flat error-kind taxonomy every fallible call returns.
//! - [`api`] — builds the script-facing `tas` table (input, messaging,
//!   shared data, shared buffers, events) for one context's VM.
//! - [`value`] — `SerializedValue`, the only type allowed to cross a
//!   context boundary (message payloads, shared-data entries, shared
//!   buffer table views).
//! - [`queue`] — the lock-free priority MPSC queue backing the message bus.
//! - [`shared_buffer`] — reference-counted byte buffers for zero-copy
//!   cross-context payloads.
//! - [`input`] — synthesized keyboard state and timed holds.
//! - [`record`] — the binary record file codec and frame-accurate player.
//! - [`recorder`] — captures real input into frames and turns them into
//!   a script via [`recorder::generator`].
//! - [`scheduler`] — the per-context Lua coroutine scheduler.
//! - [`message_bus`] — prioritized, typed messaging between contexts.
//! - [`shared_data`] — the TTL key/value store shared across contexts.
//! - [`context`] — one isolated script execution context.
//! - [`manager`] — owns every context, routes events, ticks them in
//!   priority order.
//! - [`project`] — resolves a script project directory/archive into a
//!   loadable manifest and entry script.
//! - [`engine`] — the top-level recording/playback/translation state machine.
//! - [`hooks`] — the contract a host implements to drive the runtime.

pub mod api;
pub mod context;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod input;
pub mod manager;
pub mod message_bus;
pub mod project;
pub mod queue;
pub mod record;
pub mod recorder;
pub mod scheduler;
pub mod shared_buffer;
pub mod shared_data;
pub mod value;

pub use engine::{TasEngine, TasEvent, TasState};
pub use error::{TasError, TasResult};
