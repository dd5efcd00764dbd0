//! Cooperative coroutine scheduler with tick-accurate wait primitives.
//! Grounded on `LuaScheduler.h`'s `SchedulerTask` hierarchy
//! (`ImmediateTask`/`TickWaitTask`/`PredicateWaitTask`/`CoroutineWaitTask`),
//! reshaped around `mlua::Thread` instead of `sol::coroutine`.
//!
//! Script-facing `tas.wait`/`tas.wait_until`/`tas.wait_for` are thin Lua
//! wrappers around `coroutine.yield` (see [`BOOTSTRAP_SRC`]); the
//! scheduler inspects what a resumed thread yields to decide which
//! `WaitCondition` to re-arm, which is how a synchronous Lua coroutine
//! model expresses the four wait kinds without an async runtime.

/// Lua source installed into every context's VM so that `tas.wait(n)`
/// and friends are implemented as ordinary coroutine yields the
/// scheduler can interpret, rather than as Rust functions that would
/// need to yield on the caller's behalf.
pub const BOOTSTRAP_SRC: &str = r#"
tas = tas or {}
function tas.wait(ticks)
    return coroutine.yield("tick", ticks)
end
function tas.wait_until(predicate)
    return coroutine.yield("predicate", predicate)
end
function tas.wait_for(threads)
    return coroutine.yield("join", threads)
end
"#;

pub enum WaitCondition {
    Immediate,
    TickWait(i64),
    PredicateWait(mlua::Function),
    JoinWait(Vec<mlua::Thread>),
}

impl WaitCondition {
    /// Evaluates the condition; `true` means the owning task is ready to
    /// resume this tick.
    fn is_complete(&mut self) -> bool {
        match self {
            WaitCondition::Immediate => true,
            WaitCondition::TickWait(remaining) => {
                *remaining -= 1;
                *remaining <= 0
            }
            WaitCondition::PredicateWait(predicate) => match predicate.call::<bool>(()) {
                Ok(done) => done,
                Err(err) => {
                    log::warn!("predicate wait errored, completing to avoid hanging: {err}");
                    true
                }
            },
            WaitCondition::JoinWait(threads) => threads
                .iter()
                .all(|t| t.status() != mlua::ThreadStatus::Resumable),
        }
    }

    fn from_yield(tag: Option<String>, value: mlua::MultiValue) -> WaitCondition {
        match tag.as_deref() {
            Some("tick") => {
                let ticks = value
                    .iter()
                    .nth(1)
                    .and_then(|v| v.as_i64())
                    .unwrap_or(1);
                WaitCondition::TickWait(ticks.max(1))
            }
            Some("predicate") => {
                if let Some(mlua::Value::Function(f)) = value.iter().nth(1) {
                    WaitCondition::PredicateWait(f.clone())
                } else {
                    WaitCondition::Immediate
                }
            }
            Some("join") => {
                if let Some(mlua::Value::Table(t)) = value.iter().nth(1) {
                    let threads = t
                        .clone()
                        .sequence_values::<mlua::Thread>()
                        .filter_map(Result::ok)
                        .collect();
                    WaitCondition::JoinWait(threads)
                } else {
                    WaitCondition::Immediate
                }
            }
            _ => WaitCondition::Immediate,
        }
    }
}

struct ScheduledTask {
    thread: mlua::Thread,
    wait: WaitCondition,
}

/// Runs cooperative Lua coroutines for a single context. Owned by that
/// context; never shared across contexts.
pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
    thread_stack: Vec<mlua::Thread>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            tasks: Vec::new(),
            thread_stack: Vec::new(),
        }
    }

    pub fn install(lua: &mlua::Lua) -> mlua::Result<()> {
        lua.load(BOOTSTRAP_SRC).exec()
    }

    pub fn start_coroutine(&mut self, lua: &mlua::Lua, func: mlua::Function) -> mlua::Result<()> {
        let thread = lua.create_thread(func)?;
        self.tasks.push(ScheduledTask {
            thread,
            wait: WaitCondition::Immediate,
        });
        Ok(())
    }

    pub fn add_coroutine_task(&mut self, thread: mlua::Thread) {
        self.tasks.push(ScheduledTask {
            thread,
            wait: WaitCondition::Immediate,
        });
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.thread_stack.clear();
    }

    /// The thread currently being resumed, if any; lets script APIs
    /// identify the calling coroutine (e.g. for self-referential joins).
    pub fn current_thread(&self) -> Option<&mlua::Thread> {
        self.thread_stack.last()
    }

    /// Advances every pending task by one tick: dead coroutines are
    /// dropped, ready ones are resumed exactly once, and whatever they
    /// yield next becomes their new wait condition.
    pub fn tick(&mut self) {
        let mut still_pending = Vec::with_capacity(self.tasks.len());
        let mut ready = Vec::new();
        for mut task in std::mem::take(&mut self.tasks) {
            if task.thread.status() != mlua::ThreadStatus::Resumable {
                continue;
            }
            if task.wait.is_complete() {
                ready.push(task);
            } else {
                still_pending.push(task);
            }
        }

        for mut task in ready {
            self.thread_stack.push(task.thread.clone());
            let result: mlua::Result<mlua::MultiValue> = task.thread.resume(());
            self.thread_stack.pop();
            match result {
                Ok(values) => {
                    if task.thread.status() == mlua::ThreadStatus::Resumable {
                        let tag = values
                            .front()
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string());
                        task.wait = WaitCondition::from_yield(tag, values);
                        still_pending.push(task);
                    }
                }
                Err(err) => {
                    log::error!("scheduled coroutine errored and was dropped: {err}");
                }
            }
        }

        self.tasks = still_pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_lua() -> mlua::Lua {
        let lua = mlua::Lua::new();
        Scheduler::install(&lua).unwrap();
        lua
    }

    #[test]
    fn immediate_task_runs_to_completion_same_tick() {
        let lua = new_lua();
        let mut sched = Scheduler::new();
        let marker = std::rc::Rc::new(std::cell::RefCell::new(false));
        let marker2 = marker.clone();
        lua.globals()
            .set(
                "mark",
                lua.create_function(move |_, ()| {
                    *marker2.borrow_mut() = true;
                    Ok(())
                })
                .unwrap(),
            )
            .unwrap();
        let func = lua.load("function() mark() end").eval::<mlua::Function>().unwrap();
        sched.start_coroutine(&lua, func).unwrap();
        sched.tick();
        assert!(*marker.borrow());
        assert!(!sched.is_running());
    }

    #[test]
    fn tick_wait_resumes_after_n_ticks() {
        let lua = new_lua();
        let mut sched = Scheduler::new();
        let func = lua
            .load("function() tas.wait(3) end")
            .eval::<mlua::Function>()
            .unwrap();
        sched.start_coroutine(&lua, func).unwrap();
        sched.tick();
        assert!(sched.is_running());
        sched.tick();
        assert!(sched.is_running());
        sched.tick();
        assert!(sched.is_running());
        sched.tick();
        assert!(!sched.is_running());
    }

    #[test]
    fn predicate_wait_completes_when_true() {
        let lua = new_lua();
        let mut sched = Scheduler::new();
        lua.globals().set("flag", false).unwrap();
        let func = lua
            .load("function() tas.wait_until(function() return flag end) end")
            .eval::<mlua::Function>()
            .unwrap();
        sched.start_coroutine(&lua, func).unwrap();
        sched.tick();
        assert!(sched.is_running());
        lua.globals().set("flag", true).unwrap();
        sched.tick();
        assert!(!sched.is_running());
    }

    #[test]
    fn erroring_coroutine_is_dropped_without_panicking() {
        let lua = new_lua();
        let mut sched = Scheduler::new();
        let func = lua
            .load("function() error('boom') end")
            .eval::<mlua::Function>()
            .unwrap();
        sched.start_coroutine(&lua, func).unwrap();
        sched.tick();
        assert!(!sched.is_running());
    }
}
