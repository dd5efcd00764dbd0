//! An isolated script execution context: its own Lua VM, scheduler,
//! input system, and event subscriptions. Grounded on `ScriptContext.h`/
//! `.cpp`, reshaped around `mlua::Lua` instead of `sol::state` and with
//! thread-pinning asserted via a captured `ThreadId` rather than a
//! separate validator type.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread::ThreadId;

use crate::error::TasError;
use crate::input::InputSystem;
use crate::project::ResolvedProject;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptContextType {
    Global,
    Level,
    Custom,
}

/// Dispatches named game events to Lua callbacks registered via
/// `tas.on_event`. Kept separate from the scheduler because events are
/// push-driven from the context manager, not polled by waiting tasks.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: std::collections::HashMap<String, Vec<mlua::Function>>,
}

impl EventDispatcher {
    pub fn on(&mut self, event: &str, callback: mlua::Function) {
        self.listeners.entry(event.to_string()).or_default().push(callback);
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn subscribed_events(&self) -> impl Iterator<Item = &String> {
        self.listeners.keys()
    }

    /// Fires an event, logging and skipping any listener whose call
    /// errors so one broken handler can't block the others.
    pub fn fire(&self, event: &str, args: mlua::MultiValue) {
        if let Some(listeners) = self.listeners.get(event) {
            for listener in listeners {
                if let Err(err) = listener.call::<()>(args.clone()) {
                    log::error!("event listener for '{event}' errored: {err}");
                }
            }
        }
    }
}

pub struct ScriptContext {
    name: String,
    context_type: ScriptContextType,
    priority: i32,
    lua: mlua::Lua,
    pub scheduler: Scheduler,
    /// Shared via `Rc<RefCell<_>>`, not held behind `&mut self`, so the
    /// `tas.press`/`tas.on_event` closures installed into the VM can
    /// reach it while a coroutine resume is already on the call stack
    /// inside `tick()`.
    pub input: Rc<RefCell<InputSystem>>,
    pub events: Rc<RefCell<EventDispatcher>>,
    /// Lua callbacks registered via `tas.shared.watch`, keyed by shared-
    /// data key. Looked up by the zero-capture dispatch closure handed
    /// to `SharedDataStore::watch` so that closure stays `Send + Sync`
    /// without needing the registered `mlua::Function` itself to be.
    pub watch_callbacks: Rc<RefCell<std::collections::HashMap<String, mlua::Function>>>,
    executing: bool,
    current_project: Option<ResolvedProject>,
    owner_thread: Option<ThreadId>,
    sleeping: bool,
    ticks_since_active: u32,
    sleep_interval: u32,
    pub memory_limit_bytes: Option<usize>,
    current_tick: Rc<Cell<u64>>,
    delta_time_ms: Rc<Cell<f32>>,
}

impl ScriptContext {
    pub fn new(name: String, context_type: ScriptContextType, priority: i32) -> Self {
        ScriptContext {
            name,
            context_type,
            priority,
            lua: mlua::Lua::new(),
            scheduler: Scheduler::new(),
            input: Rc::new(RefCell::new(InputSystem::new())),
            events: Rc::new(RefCell::new(EventDispatcher::default())),
            watch_callbacks: Rc::new(RefCell::new(std::collections::HashMap::new())),
            executing: false,
            current_project: None,
            owner_thread: None,
            sleeping: false,
            ticks_since_active: 0,
            sleep_interval: 30,
            memory_limit_bytes: None,
            current_tick: Rc::new(Cell::new(0)),
            delta_time_ms: Rc::new(Cell::new(1000.0 / 132.0)),
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick.get()
    }

    pub fn delta_time_ms(&self) -> f32 {
        self.delta_time_ms.get()
    }

    /// Set by a time hook (§4.12): recording uses the recorder's
    /// configured delta, record playback the current frame's delta,
    /// script playback the project's configured delta.
    pub fn set_delta_time_ms(&mut self, delta_ms: f32) {
        self.delta_time_ms.set(delta_ms);
    }

    /// Installs the script-facing `tas` API table against this
    /// context's VM. Must be called once the context is held behind
    /// the `Arc<Mutex<_>>` the context manager owns it through, since
    /// the API closures capture a weak reference back to it.
    pub fn install_tas_api(
        &mut self,
        self_handle: std::sync::Weak<std::sync::Mutex<ScriptContext>>,
        message_bus: std::sync::Arc<crate::message_bus::MessageBus<ScriptContext>>,
        shared_data: std::sync::Arc<crate::shared_data::SharedDataStore<ScriptContext>>,
    ) -> Result<(), TasError> {
        self.assert_owner_thread();
        crate::api::install(crate::api::ApiInstall {
            lua: &self.lua,
            context_name: self.name.clone(),
            context: self_handle,
            message_bus,
            shared_data,
            input: self.input.clone(),
            events: self.events.clone(),
            watch_callbacks: self.watch_callbacks.clone(),
            current_tick: self.current_tick.clone(),
            delta_time_ms: self.delta_time_ms.clone(),
        })
        .map_err(|e| TasError::NotInitialized(format!("tas API registration failed: {e}")))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context_type(&self) -> ScriptContextType {
        self.context_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn lua(&self) -> &mlua::Lua {
        &self.lua
    }

    pub fn is_executing(&self) -> bool {
        self.executing
    }

    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    /// Enforces the thread-pinning invariant: asserts in debug builds,
    /// terminates the process in release builds, since at that point the
    /// VM may already be shared across threads in a way `mlua` does not
    /// make safe — state corruption is preferable to silent divergence.
    fn assert_owner_thread(&self) {
        if let Some(owner) = self.owner_thread {
            if owner != std::thread::current().id() {
                let err = TasError::OwnerThreadViolation {
                    context: self.name.clone(),
                };
                log::error!("{err}");
                if cfg!(debug_assertions) {
                    panic!("{err}");
                } else {
                    std::process::abort();
                }
            }
        }
    }

    /// Opens the curated standard library set, installs the scheduler
    /// bootstrap, and pins this context to the calling thread. Must be
    /// called on the thread that will tick this context going forward.
    pub fn initialize(&mut self) -> Result<(), TasError> {
        self.owner_thread = Some(std::thread::current().id());
        Scheduler::install(&self.lua)
            .map_err(|e| TasError::NotInitialized(format!("scheduler bootstrap failed: {e}")))?;
        Ok(())
    }

    pub fn load_and_execute(&mut self, project: ResolvedProject) -> Result<(), TasError> {
        self.assert_owner_thread();
        self.lua
            .load(&project.main_source)
            .set_name(&project.manifest.entry_script)
            .exec()
            .map_err(|e| TasError::ScriptLoadFailure(e.to_string()))?;
        let main: mlua::Function = self
            .lua
            .globals()
            .get("main")
            .map_err(|_| TasError::ScriptLoadFailure("script defines no callable 'main'".to_string()))?;
        self.scheduler
            .start_coroutine(&self.lua, main)
            .map_err(|e| TasError::ScriptLoadFailure(e.to_string()))?;
        self.current_project = Some(project);
        self.executing = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.assert_owner_thread();
        self.scheduler.clear();
        self.events.borrow_mut().clear();
        self.watch_callbacks.borrow_mut().clear();
        self.current_project = None;
        self.executing = false;
    }

    /// Resets all execution state while keeping the VM and its
    /// registered APIs, for reuse out of a context pool.
    pub fn reinitialize(&mut self, new_name: String, new_priority: i32) -> Result<(), TasError> {
        self.assert_owner_thread();
        self.scheduler.clear();
        self.events.borrow_mut().clear();
        self.watch_callbacks.borrow_mut().clear();
        self.input.replace(InputSystem::new());
        self.sleeping = false;
        self.ticks_since_active = 0;
        self.current_project = None;
        self.executing = false;
        self.current_tick.set(0);
        self.name = new_name;
        self.priority = new_priority;
        self.lua.gc_collect().map_err(|e| {
            TasError::ScriptRuntime(format!("full GC during reinitialize failed: {e}"))
        })?;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.assert_owner_thread();
        self.stop();
    }

    /// Whether this context may be ticked at reduced frequency: no
    /// scheduler tasks pending, and no accumulated wake reason.
    pub fn can_sleep(&self) -> bool {
        !self.scheduler.is_running()
    }

    pub fn mark_woken(&mut self) {
        self.sleeping = false;
        self.ticks_since_active = 0;
    }

    pub fn should_tick_this_frame(&mut self) -> bool {
        if !self.sleeping {
            if self.can_sleep() {
                self.ticks_since_active += 1;
                if self.ticks_since_active >= self.sleep_interval {
                    self.sleeping = true;
                }
            } else {
                self.ticks_since_active = 0;
            }
            return true;
        }
        self.ticks_since_active += 1;
        if self.ticks_since_active >= self.sleep_interval {
            self.ticks_since_active = 0;
            true
        } else {
            false
        }
    }

    pub fn tick(&mut self) {
        self.assert_owner_thread();
        self.scheduler.tick();
        if !self.scheduler.is_running() {
            self.executing = false;
        }
        self.current_tick.set(self.current_tick.get() + 1);
    }

    /// Writes this tick's key bytes into the host-owned buffer. Must be
    /// called after `tick()` and before `advance_input`, so a script's
    /// same-tick `press` calls are reflected before the buffer is
    /// sampled and the input system rolls its one-frame state forward.
    pub fn apply_input(&self, buffer: &mut [u8]) {
        self.input.borrow().apply(buffer);
    }

    /// Rolls the input system forward one frame: expires timed holds
    /// and resets the press/release event flags. Called once per tick
    /// after the host has sampled `apply_input`'s buffer.
    pub fn advance_input(&self) {
        self.input.borrow_mut().prepare_next_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ProjectManifest;

    fn project(src: &str) -> ResolvedProject {
        ResolvedProject {
            manifest: ProjectManifest {
                name: "t".into(),
                author: "a".into(),
                target_level: "l".into(),
                entry_script: "main.lua".into(),
                update_rate: 132.0,
                execution_trigger: crate::project::ExecutionTrigger::Manual,
            },
            main_source: src.to_string(),
            root_dir: None,
        }
    }

    #[test]
    fn load_and_execute_runs_main_to_completion() {
        let mut ctx = ScriptContext::new("t".into(), ScriptContextType::Custom, 0);
        ctx.initialize().unwrap();
        ctx.load_and_execute(project("ran = false\nfunction main() ran = true end")).unwrap();
        ctx.tick();
        assert!(!ctx.is_executing());
        let ran: bool = ctx.lua().globals().get("ran").unwrap();
        assert!(ran);
    }

    #[test]
    fn missing_main_function_is_a_script_load_failure() {
        let mut ctx = ScriptContext::new("t".into(), ScriptContextType::Custom, 0);
        ctx.initialize().unwrap();
        let err = ctx.load_and_execute(project("x = 1")).unwrap_err();
        assert!(matches!(err, TasError::ScriptLoadFailure(_)));
    }

    #[test]
    fn reinitialize_preserves_vm_but_clears_state() {
        let mut ctx = ScriptContext::new("a".into(), ScriptContextType::Custom, 0);
        ctx.initialize().unwrap();
        ctx.lua().globals().set("marker", 42).unwrap();
        ctx.load_and_execute(project("function main() tas.wait(5) end")).unwrap();
        ctx.tick();
        assert!(ctx.is_executing());
        ctx.reinitialize("b".into(), 5).unwrap();
        assert_eq!(ctx.name(), "b");
        assert_eq!(ctx.priority(), 5);
        assert!(!ctx.is_executing());
        let marker: i64 = ctx.lua().globals().get("marker").unwrap();
        assert_eq!(marker, 42);
    }
}
