//! Builds the script-facing `tas` Lua table: input control, core tick
//! info, messaging, shared data, shared buffers, and event
//! subscription. Grounded on `LuaApi.cpp`'s per-concern
//! `RegisterXApi(tas_table, engine)` split (`LuaApi_Input.cpp`,
//! `LuaApi_Concurrency.cpp`, `LuaApi_SharedBuffer.cpp`), reshaped
//! around `mlua::Lua::create_function` closures instead of `sol`
//! usertype bindings. `tas.wait`/`wait_until`/`wait_for` are installed
//! separately by [`crate::scheduler::Scheduler::install`] since they
//! are plain Lua wrappers around `coroutine.yield`, not Rust functions.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::context::{EventDispatcher, ScriptContext};
use crate::input::InputSystem;
use crate::message_bus::{Message, MessageBus, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL};
use crate::shared_buffer::SharedBufferHandle;
use crate::shared_data::{SetOptions, SharedDataStore};
use crate::value::SerializedValue;

type CtxHandle = Weak<Mutex<ScriptContext>>;

/// Everything `install` needs to wire the `tas` table to one context.
/// Bundled into a struct because it's six handles wide and every field
/// is required.
pub struct ApiInstall<'lua> {
    pub lua: &'lua mlua::Lua,
    pub context_name: String,
    pub context: CtxHandle,
    pub message_bus: Arc<MessageBus<ScriptContext>>,
    pub shared_data: Arc<SharedDataStore<ScriptContext>>,
    pub input: Rc<RefCell<InputSystem>>,
    pub events: Rc<RefCell<EventDispatcher>>,
    pub watch_callbacks: Rc<RefCell<std::collections::HashMap<String, mlua::Function>>>,
    pub current_tick: Rc<Cell<u64>>,
    pub delta_time_ms: Rc<Cell<f32>>,
}

fn resolve_priority(value: Option<mlua::String>) -> usize {
    match value.as_ref().and_then(|s| s.to_str().ok()).as_deref() {
        Some("low") => PRIORITY_LOW,
        Some("high") => PRIORITY_HIGH,
        _ => PRIORITY_NORMAL,
    }
}

pub fn install(cfg: ApiInstall<'_>) -> mlua::Result<()> {
    let ApiInstall {
        lua,
        context_name,
        context,
        message_bus,
        shared_data,
        input,
        events,
        watch_callbacks,
        current_tick,
        delta_time_ms,
    } = cfg;

    let tas: mlua::Table = match lua.globals().get::<mlua::Value>("tas")? {
        mlua::Value::Table(t) => t,
        _ => {
            let t = lua.create_table()?;
            lua.globals().set("tas", t.clone())?;
            t
        }
    };

    register_input_api(lua, &tas, input)?;
    register_core_api(lua, &tas, current_tick.clone(), delta_time_ms)?;
    register_messaging_api(lua, &tas, context_name.clone(), message_bus.clone())?;
    register_shared_data_api(
        lua,
        &tas,
        context_name.clone(),
        context.clone(),
        shared_data,
        current_tick,
        watch_callbacks,
    )?;
    register_shared_buffer_api(lua, &tas)?;
    register_event_api(lua, &tas, context_name, context, events, message_bus)?;

    Ok(())
}

/// Deterministic "now", derived from the context's own tick counter
/// rather than wall-clock time, so shared-data TTL expiry replays
/// bit-identically across runs of the same record or script.
fn virtual_now_ms(current_tick: &Rc<Cell<u64>>) -> i64 {
    (current_tick.get() as f64 * (1000.0 / 132.0)) as i64
}

fn register_input_api(
    lua: &mlua::Lua,
    tas: &mlua::Table,
    input: Rc<RefCell<InputSystem>>,
) -> mlua::Result<()> {
    let i = input.clone();
    tas.set(
        "press",
        lua.create_function(move |_, keys: String| {
            i.borrow_mut().press_keys_one_frame(&keys);
            Ok(())
        })?,
    )?;

    let i = input.clone();
    tas.set(
        "press_for",
        lua.create_function(move |_, (keys, ticks): (String, u32)| {
            i.borrow_mut().hold_keys(&keys, ticks);
            Ok(())
        })?,
    )?;

    let i = input.clone();
    tas.set(
        "hold",
        lua.create_function(move |_, keys: String| {
            i.borrow_mut().press_keys(&keys);
            Ok(())
        })?,
    )?;

    let i = input.clone();
    tas.set(
        "release",
        lua.create_function(move |_, keys: String| {
            i.borrow_mut().release_keys(&keys);
            Ok(())
        })?,
    )?;

    let i = input.clone();
    tas.set(
        "release_all",
        lua.create_function(move |_, ()| {
            i.borrow_mut().release_all_keys();
            Ok(())
        })?,
    )?;

    let i = input.clone();
    tas.set(
        "is_pressed",
        lua.create_function(move |_, keys: String| Ok(i.borrow().are_keys_pressed(&keys)))?,
    )?;

    Ok(())
}

fn register_core_api(
    lua: &mlua::Lua,
    tas: &mlua::Table,
    current_tick: Rc<Cell<u64>>,
    delta_time_ms: Rc<Cell<f32>>,
) -> mlua::Result<()> {
    let t = current_tick.clone();
    tas.set(
        "current_tick",
        lua.create_function(move |_, ()| Ok(t.get()))?,
    )?;

    tas.set(
        "delta_time",
        lua.create_function(move |_, ()| Ok(delta_time_ms.get() / 1000.0))?,
    )?;

    Ok(())
}

fn register_messaging_api(
    lua: &mlua::Lua,
    tas: &mlua::Table,
    context_name: String,
    message_bus: Arc<MessageBus<ScriptContext>>,
) -> mlua::Result<()> {
    let bus = message_bus.clone();
    let sender = context_name.clone();
    tas.set(
        "send_message",
        lua.create_function(
            move |_, (target, message_type, payload, priority): (String, String, mlua::Value, Option<mlua::String>)| {
                let value = SerializedValue::from_lua(&payload)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                bus.send_message(&sender, &target, &message_type, value, resolve_priority(priority))
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            },
        )?,
    )?;

    let bus = message_bus.clone();
    let sender = context_name.clone();
    tas.set(
        "broadcast",
        lua.create_function(
            move |_, (message_type, payload, priority): (String, mlua::Value, Option<mlua::String>)| {
                let value = SerializedValue::from_lua(&payload)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                bus.broadcast_message(&sender, &message_type, value, resolve_priority(priority))
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            },
        )?,
    )?;

    let bus = message_bus.clone();
    let sender = context_name.clone();
    tas.set(
        "request",
        lua.create_function(
            move |lua, (target, message_type, payload, timeout_ms): (String, String, mlua::Value, Option<u64>)| {
                let value = SerializedValue::from_lua(&payload)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                let timeout = Duration::from_millis(timeout_ms.unwrap_or(5000));
                match bus.send_request(&sender, &target, &message_type, value, timeout) {
                    Ok(response) => response.to_lua(lua),
                    // Request timeouts return Nil rather than raising.
                    Err(crate::error::TasError::RequestTimeout) => Ok(mlua::Value::Nil),
                    Err(e) => Err(mlua::Error::RuntimeError(e.to_string())),
                }
            },
        )?,
    )?;

    let bus = message_bus;
    let sender = context_name;
    tas.set(
        "respond",
        lua.create_function(
            move |_, (target, correlation_id, payload): (String, String, mlua::Value)| {
                let value = SerializedValue::from_lua(&payload)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
                bus.send_response(&sender, &target, &correlation_id, value)
                    .map_err(|e| mlua::Error::RuntimeError(e.to_string()))
            },
        )?,
    )?;

    Ok(())
}

/// `shared.set/get/has/remove/clear/keys/watch/unwatch`. TTL deadlines
/// are expressed in the context's own tick clock (`tick * delta_ms`),
/// never wall-clock time, so shared-data expiry replays identically.
fn register_shared_data_api(
    lua: &mlua::Lua,
    tas: &mlua::Table,
    context_name: String,
    context: CtxHandle,
    shared_data: Arc<SharedDataStore<ScriptContext>>,
    current_tick: Rc<Cell<u64>>,
    watch_callbacks: Rc<RefCell<std::collections::HashMap<String, mlua::Function>>>,
) -> mlua::Result<()> {
    let shared = lua.create_table()?;

    let store = shared_data.clone();
    let tick = current_tick.clone();
    shared.set(
        "set",
        lua.create_function(move |_, (key, value, ttl_ms): (String, mlua::Value, Option<i64>)| {
            let value = SerializedValue::from_lua(&value)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            store.set(&key, value, SetOptions { ttl_ms }, virtual_now_ms(&tick));
            Ok(())
        })?,
    )?;

    let store = shared_data.clone();
    let tick = current_tick.clone();
    shared.set(
        "get",
        lua.create_function(move |lua, (key, default): (String, mlua::Value)| {
            let default = SerializedValue::from_lua(&default)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            store.get(&key, default, virtual_now_ms(&tick)).to_lua(lua)
        })?,
    )?;

    let store = shared_data.clone();
    let tick = current_tick.clone();
    shared.set(
        "has",
        lua.create_function(move |_, key: String| Ok(store.has(&key, virtual_now_ms(&tick))))?,
    )?;

    let store = shared_data.clone();
    shared.set(
        "remove",
        lua.create_function(move |_, key: String| Ok(store.remove(&key)))?,
    )?;

    let store = shared_data.clone();
    shared.set(
        "clear",
        lua.create_function(move |_, ()| {
            store.clear();
            Ok(())
        })?,
    )?;

    let store = shared_data.clone();
    let tick = current_tick.clone();
    shared.set(
        "keys",
        lua.create_function(move |_, ()| Ok(store.keys(virtual_now_ms(&tick))))?,
    )?;

    // The closure handed to `SharedDataStore::watch` must be `Send +
    // Sync`; it captures nothing and looks the registered Lua callback
    // up from `owner.watch_callbacks` by key instead of capturing an
    // `mlua::Function` directly, which would not be.
    let store = shared_data.clone();
    let watcher_name = context_name.clone();
    let ctx = context.clone();
    let callbacks = watch_callbacks.clone();
    shared.set(
        "watch",
        lua.create_function(move |_, (key, callback): (String, mlua::Function)| {
            callbacks.borrow_mut().insert(key.clone(), callback);
            store.watch(
                &watcher_name,
                ctx.clone(),
                &key,
                Arc::new(|owner: &mut ScriptContext, key: &str, old, new| {
                    let Some(callback) = owner.watch_callbacks.borrow().get(key).cloned() else {
                        return;
                    };
                    let lua = owner.lua();
                    let Ok(old_v) = old.to_lua(lua) else { return };
                    let Ok(new_v) = new.to_lua(lua) else { return };
                    if let Err(err) = callback.call::<()>((key.to_string(), old_v, new_v)) {
                        log::error!("shared-data watch callback for '{key}' errored: {err}");
                    }
                }),
            );
            Ok(())
        })?,
    )?;

    let store = shared_data;
    let watcher_name = context_name;
    shared.set(
        "unwatch",
        lua.create_function(move |_, key: String| {
            store.unwatch(&watcher_name, &key);
            watch_callbacks.borrow_mut().remove(&key);
            Ok(())
        })?,
    )?;

    tas.set("shared", shared)?;
    Ok(())
}

/// `shared_buffer.create/create_from/from_table`; `SharedBufferHandle`
/// userdata methods (`size`/`id`/`to_table`/`clone`) are registered on
/// the type itself in `shared_buffer.rs`.
fn register_shared_buffer_api(lua: &mlua::Lua, tas: &mlua::Table) -> mlua::Result<()> {
    let buffers = lua.create_table()?;

    buffers.set(
        "create",
        lua.create_function(|_, size: usize| {
            SharedBufferHandle::create(size).map_err(|e| mlua::Error::RuntimeError(e.to_string()))
        })?,
    )?;

    buffers.set(
        "from_table",
        lua.create_function(|_, value: mlua::Value| {
            let value = SerializedValue::from_lua(&value)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            SharedBufferHandle::from_table(&value).map_err(|e| mlua::Error::RuntimeError(e.to_string()))
        })?,
    )?;

    buffers.set(
        "to_table",
        lua.create_function(|lua, handle: SharedBufferHandle| {
            let value = handle
                .to_table()
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            value.to_lua(lua)
        })?,
    )?;

    tas.set("shared_buffer", buffers)?;
    Ok(())
}

/// `tas.on_event` does double duty: it registers a local listener on
/// this context's `EventDispatcher` (fired by `ContextManager` for
/// game events), and registers a message-bus handler keyed by
/// `(context_name, event_name)` so an incoming message whose type
/// matches the event name is re-delivered through the same listener
/// list. The external API names only `on_event`, not a separate
/// `on_message`.
fn register_event_api(
    lua: &mlua::Lua,
    tas: &mlua::Table,
    context_name: String,
    context: CtxHandle,
    events: Rc<RefCell<EventDispatcher>>,
    message_bus: Arc<MessageBus<ScriptContext>>,
) -> mlua::Result<()> {
    tas.set(
        "on_event",
        lua.create_function(move |_, (event_name, callback): (String, mlua::Function)| {
            events.borrow_mut().on(&event_name, callback);
            message_bus.register_handler(
                &context_name,
                &event_name,
                context.clone(),
                Arc::new(move |owner: &mut ScriptContext, message: &Message| {
                    let lua = owner.lua();
                    let Ok(sender) = lua.create_string(&message.sender) else { return };
                    let Ok(payload) = message.payload.to_lua(lua) else { return };
                    let args = mlua::MultiValue::from_iter([mlua::Value::String(sender), payload]);
                    owner.events.borrow().fire(&message.message_type, args);
                }),
            );
            Ok(())
        })?,
    )?;

    Ok(())
}
