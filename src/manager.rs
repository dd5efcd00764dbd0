//! Owns every script context, routes game events by subscription, and
//! ticks contexts in priority order each frame. Grounded on
//! `ScriptContextManager.h`/`.cpp`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::{ScriptContext, ScriptContextType};
use crate::error::TasError;
use crate::message_bus::{MessageBus, MessageBusConfig};
use crate::shared_data::SharedDataStore;

#[derive(Debug, Clone, Copy)]
pub struct ContextPoolConfig {
    pub max_pool_size: usize,
    pub enable_pooling: bool,
    pub hibernate_frame_threshold: u32,
}

impl Default for ContextPoolConfig {
    fn default() -> Self {
        ContextPoolConfig {
            max_pool_size: 4,
            enable_pooling: true,
            hibernate_frame_threshold: 60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CustomContextLimits {
    pub max_total_custom_contexts: usize,
    pub max_custom_contexts_per_level: usize,
    pub memory_limit_bytes: usize,
}

impl Default for CustomContextLimits {
    fn default() -> Self {
        CustomContextLimits {
            max_total_custom_contexts: 10,
            max_custom_contexts_per_level: 5,
            memory_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

struct PooledContext {
    context: Arc<Mutex<ScriptContext>>,
    context_type: ScriptContextType,
    last_used_tick: u64,
}

pub struct ContextManager {
    contexts: HashMap<String, Arc<Mutex<ScriptContext>>>,
    shared_data: Arc<SharedDataStore<ScriptContext>>,
    message_bus: Arc<MessageBus<ScriptContext>>,
    pool: Vec<PooledContext>,
    pool_config: ContextPoolConfig,
    custom_limits: CustomContextLimits,
    custom_contexts_per_level: HashMap<String, usize>,
    custom_context_level_of: HashMap<String, String>,
    event_subscriptions: HashMap<String, Vec<String>>,
    current_tick: u64,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManager {
    pub fn new() -> Self {
        ContextManager {
            contexts: HashMap::new(),
            shared_data: Arc::new(SharedDataStore::new()),
            message_bus: Arc::new(MessageBus::new(MessageBusConfig::default())),
            pool: Vec::new(),
            pool_config: ContextPoolConfig::default(),
            custom_limits: CustomContextLimits::default(),
            custom_contexts_per_level: HashMap::new(),
            custom_context_level_of: HashMap::new(),
            event_subscriptions: HashMap::new(),
            current_tick: 0,
        }
    }

    pub fn shared_data(&self) -> &Arc<SharedDataStore<ScriptContext>> {
        &self.shared_data
    }

    pub fn message_bus(&self) -> &Arc<MessageBus<ScriptContext>> {
        &self.message_bus
    }

    pub fn set_pool_config(&mut self, config: ContextPoolConfig) {
        self.pool_config = config;
    }

    pub fn set_custom_limits(&mut self, limits: CustomContextLimits) {
        self.custom_limits = limits;
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<ScriptContext>>> {
        self.contexts.get(name).cloned()
    }

    pub fn create_context(
        &mut self,
        name: &str,
        context_type: ScriptContextType,
        priority: i32,
    ) -> Result<Arc<Mutex<ScriptContext>>, TasError> {
        if let Some(existing) = self.contexts.get(name) {
            return Ok(existing.clone());
        }
        let mut ctx = ScriptContext::new(name.to_string(), context_type, priority);
        ctx.initialize()?;
        let handle = Arc::new(Mutex::new(ctx));
        handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .install_tas_api(Arc::downgrade(&handle), self.message_bus.clone(), self.shared_data.clone())?;
        self.contexts.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get_or_create_global(&mut self) -> Result<Arc<Mutex<ScriptContext>>, TasError> {
        self.create_context("global", ScriptContextType::Global, 0)
    }

    pub fn get_or_create_level(&mut self, level_name: &str) -> Result<Arc<Mutex<ScriptContext>>, TasError> {
        self.create_context(&format!("level_{level_name}"), ScriptContextType::Level, 100)
    }

    pub fn create_custom_context(
        &mut self,
        name: &str,
        priority: i32,
        level_key: &str,
    ) -> Result<Arc<Mutex<ScriptContext>>, TasError> {
        let total_custom = self
            .contexts
            .values()
            .filter(|c| c.lock().unwrap_or_else(|e| e.into_inner()).context_type() == ScriptContextType::Custom)
            .count();
        if total_custom >= self.custom_limits.max_total_custom_contexts {
            return Err(TasError::InvalidArgument(format!(
                "custom context limit of {} reached",
                self.custom_limits.max_total_custom_contexts
            )));
        }
        let per_level = *self.custom_contexts_per_level.get(level_key).unwrap_or(&0);
        if per_level >= self.custom_limits.max_custom_contexts_per_level {
            return Err(TasError::InvalidArgument(format!(
                "custom context limit of {} for level '{level_key}' reached",
                self.custom_limits.max_custom_contexts_per_level
            )));
        }
        let handle = self.create_context(name, ScriptContextType::Custom, priority)?;
        handle.lock().unwrap_or_else(|e| e.into_inner()).memory_limit_bytes =
            Some(self.custom_limits.memory_limit_bytes);
        self.custom_contexts_per_level
            .insert(level_key.to_string(), per_level + 1);
        self.custom_context_level_of
            .insert(name.to_string(), level_key.to_string());
        Ok(handle)
    }

    pub fn destroy_context(&mut self, name: &str) {
        self.unsubscribe_from_all_events(name);
        self.message_bus.remove_all_handlers(name);
        self.shared_data.unwatch_all(name);
        if let Some(ctx) = self.contexts.remove(name) {
            ctx.lock().unwrap_or_else(|e| e.into_inner()).shutdown();
        }
        if let Some(level_key) = self.custom_context_level_of.remove(name) {
            if let Some(count) = self.custom_contexts_per_level.get_mut(&level_key) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn subscribe_to_event(&mut self, context_name: &str, event_name: &str) {
        let subscribers = self.event_subscriptions.entry(event_name.to_string()).or_default();
        if !subscribers.iter().any(|n| n == context_name) {
            subscribers.push(context_name.to_string());
        }
    }

    pub fn unsubscribe_from_event(&mut self, context_name: &str, event_name: &str) {
        if let Some(subscribers) = self.event_subscriptions.get_mut(event_name) {
            subscribers.retain(|n| n != context_name);
        }
    }

    pub fn unsubscribe_from_all_events(&mut self, context_name: &str) {
        for subscribers in self.event_subscriptions.values_mut() {
            subscribers.retain(|n| n != context_name);
        }
    }

    pub fn is_subscribed(&self, context_name: &str, event_name: &str) -> bool {
        self.event_subscriptions
            .get(event_name)
            .map(|subs| subs.iter().any(|n| n == context_name))
            .unwrap_or(false)
    }

    /// Fires a named event to every context subscribed to it.
    pub fn fire_game_event_to_all(&self, lua_args_builder: impl Fn(&mlua::Lua) -> mlua::MultiValue, event_name: &str) {
        let Some(subscribers) = self.event_subscriptions.get(event_name) else {
            return;
        };
        for name in subscribers {
            if let Some(ctx) = self.contexts.get(name) {
                let guard = ctx.lock().unwrap_or_else(|e| e.into_inner());
                let args = lua_args_builder(guard.lua());
                guard.events.borrow().fire(event_name, args);
            }
        }
    }

    pub fn fire_game_event_to_context(
        &self,
        context_name: &str,
        lua_args_builder: impl Fn(&mlua::Lua) -> mlua::MultiValue,
        event_name: &str,
    ) {
        if let Some(ctx) = self.contexts.get(context_name) {
            let guard = ctx.lock().unwrap_or_else(|e| e.into_inner());
            let args = lua_args_builder(guard.lua());
            guard.events.borrow().fire(event_name, args);
        }
    }

    /// Parks a context in the LRU pool instead of destroying it, when
    /// pooling is enabled and there's room; returns whether it was
    /// pooled (`false` means it must be destroyed by the caller).
    pub fn release_or_pool_context(&mut self, name: &str) -> bool {
        if !self.pool_config.enable_pooling {
            return false;
        }
        let Some(ctx) = self.contexts.remove(name) else {
            return false;
        };
        if self.pool.len() >= self.pool_config.max_pool_size {
            ctx.lock().unwrap_or_else(|e| e.into_inner()).shutdown();
            return false;
        }
        let context_type = ctx.lock().unwrap_or_else(|e| e.into_inner()).context_type();
        self.pool.push(PooledContext {
            context: ctx,
            context_type,
            last_used_tick: self.current_tick,
        });
        true
    }

    /// Reinitializes the least-recently-used pooled context of the
    /// given type, or returns `None` if the pool has nothing matching.
    pub fn acquire_pooled_context(
        &mut self,
        context_type: ScriptContextType,
        name: &str,
        priority: i32,
    ) -> Result<Option<Arc<Mutex<ScriptContext>>>, TasError> {
        let position = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, p)| p.context_type == context_type)
            .min_by_key(|(_, p)| p.last_used_tick)
            .map(|(i, _)| i);
        let Some(index) = position else {
            return Ok(None);
        };
        let pooled = self.pool.remove(index);
        {
            let mut guard = pooled.context.lock().unwrap_or_else(|e| e.into_inner());
            guard.reinitialize(name.to_string(), priority)?;
            guard.install_tas_api(
                Arc::downgrade(&pooled.context),
                self.message_bus.clone(),
                self.shared_data.clone(),
            )?;
        }
        self.contexts.insert(name.to_string(), pooled.context.clone());
        Ok(Some(pooled.context))
    }

    fn contexts_by_priority_desc(&self) -> Vec<Arc<Mutex<ScriptContext>>> {
        let mut entries: Vec<_> = self.contexts.values().cloned().collect();
        entries.sort_by_key(|c| std::cmp::Reverse(c.lock().unwrap_or_else(|e| e.into_inner()).priority()));
        entries
    }

    /// One full tick of the manager: shared-data TTL and watch pass,
    /// message delivery, then every executing context ticked in
    /// descending priority, each layering its key presses onto
    /// `host_buffer` before the input system rolls forward, with
    /// over-memory-limit contexts destroyed after the pass.
    pub fn tick_all(&mut self, now_ms: i64, host_buffer: &mut [u8]) {
        self.shared_data.tick(now_ms);
        self.message_bus.process_messages(&self.contexts);

        let mut over_limit = Vec::new();
        for ctx in self.contexts_by_priority_desc() {
            let name;
            let should_tick;
            {
                let mut guard = ctx.lock().unwrap_or_else(|e| e.into_inner());
                name = guard.name().to_string();
                if let Some(limit) = guard.memory_limit_bytes {
                    let used = guard.used_memory();
                    if used > limit {
                        log::warn!(
                            "{}",
                            TasError::MemoryLimitExceeded { context: name.clone(), used, limit }
                        );
                        over_limit.push(name.clone());
                        should_tick = false;
                    } else {
                        should_tick = guard.should_tick_this_frame();
                    }
                } else {
                    should_tick = guard.should_tick_this_frame();
                }
            }
            if should_tick {
                let mut guard = ctx.lock().unwrap_or_else(|e| e.into_inner());
                guard.tick();
                guard.apply_input(host_buffer);
                guard.advance_input();
            }
        }
        for name in over_limit {
            self.destroy_context(&name);
        }
        self.current_tick += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_context_limits_are_enforced_per_level() {
        let mut mgr = ContextManager::new();
        mgr.set_custom_limits(CustomContextLimits {
            max_total_custom_contexts: 10,
            max_custom_contexts_per_level: 1,
            memory_limit_bytes: 1 << 20,
        });
        mgr.create_custom_context("c1", 0, "L1").unwrap();
        let err = mgr.create_custom_context("c2", 0, "L1").unwrap_err();
        assert!(matches!(err, TasError::InvalidArgument(_)));
    }

    #[test]
    fn destroy_context_frees_its_level_slot() {
        let mut mgr = ContextManager::new();
        mgr.set_custom_limits(CustomContextLimits {
            max_total_custom_contexts: 10,
            max_custom_contexts_per_level: 1,
            memory_limit_bytes: 1 << 20,
        });
        mgr.create_custom_context("c1", 0, "L1").unwrap();
        mgr.destroy_context("c1");
        mgr.create_custom_context("c2", 0, "L1").unwrap();
    }

    #[test]
    fn tick_all_ticks_contexts_in_priority_order() {
        let mut mgr = ContextManager::new();
        mgr.create_context("low", ScriptContextType::Custom, 0).unwrap();
        mgr.create_context("high", ScriptContextType::Custom, 100).unwrap();
        let mut buffer = [0u8; 256];
        mgr.tick_all(0, &mut buffer);
    }

    #[test]
    fn event_subscription_round_trips() {
        let mut mgr = ContextManager::new();
        mgr.create_context("c", ScriptContextType::Custom, 0).unwrap();
        mgr.subscribe_to_event("c", "level_start");
        assert!(mgr.is_subscribed("c", "level_start"));
        mgr.unsubscribe_from_event("c", "level_start");
        assert!(!mgr.is_subscribed("c", "level_start"));
    }

    #[test]
    fn pooled_context_can_be_reacquired() {
        let mut mgr = ContextManager::new();
        mgr.create_context("a", ScriptContextType::Custom, 1).unwrap();
        assert!(mgr.release_or_pool_context("a"));
        let reacquired = mgr
            .acquire_pooled_context(ScriptContextType::Custom, "b", 5)
            .unwrap();
        assert!(reacquired.is_some());
        assert_eq!(reacquired.unwrap().lock().unwrap().name(), "b");
    }
}
