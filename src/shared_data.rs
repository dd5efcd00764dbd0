//! TTL key/value store shared across all contexts, with deferred watch
//! notifications. Grounded on `SharedDataManager.h`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::value::SerializedValue;

#[derive(Debug, Clone)]
struct StoredValue {
    value: SerializedValue,
    /// Absolute deadline in milliseconds since some epoch the caller
    /// defines consistently; `None` means no expiry.
    expiry_ms: Option<i64>,
}

impl StoredValue {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_ms.map(|deadline| now_ms >= deadline).unwrap_or(false)
    }
}

#[derive(Default, Clone, Copy)]
pub struct SetOptions {
    pub ttl_ms: Option<i64>,
}

struct WatchEntry<C> {
    context: Weak<Mutex<C>>,
    callback: Arc<dyn Fn(&mut C, &str, &SerializedValue, &SerializedValue) + Send + Sync>,
    generation: u64,
}

struct PendingNotification {
    key: String,
    old_value: SerializedValue,
    new_value: SerializedValue,
}

/// Generic over the context type so this module doesn't depend on
/// `ScriptContext` and stays independently unit-testable.
pub struct SharedDataStore<C> {
    data: Mutex<HashMap<String, StoredValue>>,
    watches: Mutex<HashMap<String, HashMap<String, WatchEntry<C>>>>,
    watch_generation: std::sync::atomic::AtomicU64,
    pending: Mutex<Vec<PendingNotification>>,
}

impl<C> Default for SharedDataStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> SharedDataStore<C> {
    pub fn new() -> Self {
        SharedDataStore {
            data: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            watch_generation: std::sync::atomic::AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// A `set` always counts as a change, even when the new value equals
    /// the old one, matching the original's "always notify" semantics.
    pub fn set(&self, key: &str, value: SerializedValue, options: SetOptions, now_ms: i64) {
        let old = {
            let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
            let old = data.get(key).map(|sv| sv.value.clone()).unwrap_or(SerializedValue::Nil);
            data.insert(
                key.to_string(),
                StoredValue {
                    value: value.clone(),
                    expiry_ms: options.ttl_ms.map(|ttl| now_ms + ttl),
                },
            );
            old
        };
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingNotification {
                key: key.to_string(),
                old_value: old,
                new_value: value,
            });
    }

    pub fn get(&self, key: &str, default: SerializedValue, now_ms: i64) -> SerializedValue {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        match data.get(key) {
            Some(stored) if stored.is_expired(now_ms) => {
                let old = stored.value.clone();
                data.remove(key);
                drop(data);
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(PendingNotification {
                        key: key.to_string(),
                        old_value: old,
                        new_value: SerializedValue::Nil,
                    });
                default
            }
            Some(stored) => stored.value.clone(),
            None => default,
        }
    }

    pub fn has(&self, key: &str, now_ms: i64) -> bool {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.get(key).map(|sv| !sv.is_expired(now_ms)).unwrap_or(false)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn keys(&self, now_ms: i64) -> Vec<String> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, sv)| !sv.is_expired(now_ms))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn size(&self, now_ms: i64) -> usize {
        self.keys(now_ms).len()
    }

    pub fn watch(
        &self,
        context_name: &str,
        context: Weak<Mutex<C>>,
        key: &str,
        callback: Arc<dyn Fn(&mut C, &str, &SerializedValue, &SerializedValue) + Send + Sync>,
    ) {
        let generation = self
            .watch_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .insert(
                context_name.to_string(),
                WatchEntry {
                    context,
                    callback,
                    generation,
                },
            );
    }

    pub fn unwatch(&self, context_name: &str, key: &str) {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(by_context) = watches.get_mut(key) {
            by_context.remove(context_name);
        }
    }

    pub fn unwatch_all(&self, context_name: &str) {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        for by_context in watches.values_mut() {
            by_context.remove(context_name);
        }
    }

    /// Expires stale entries, queues their notifications, then flushes
    /// every pending notification (expiry-driven or `set`-driven)
    /// outside the data mutex. Should run once per tick.
    pub fn tick(&self, now_ms: i64) {
        let expired: Vec<(String, SerializedValue)> = {
            let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
            let expired_keys: Vec<String> = data
                .iter()
                .filter(|(_, sv)| sv.is_expired(now_ms))
                .map(|(k, _)| k.clone())
                .collect();
            let mut out = Vec::new();
            for key in expired_keys {
                if let Some(sv) = data.remove(&key) {
                    out.push((key, sv.value));
                }
            }
            out
        };
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            for (key, old_value) in expired {
                pending.push(PendingNotification {
                    key,
                    old_value,
                    new_value: SerializedValue::Nil,
                });
            }
        }
        self.flush_notifications();
    }

    fn flush_notifications(&self) {
        let notifications = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        if notifications.is_empty() {
            return;
        }
        let watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        for notification in notifications {
            if let Some(by_context) = watches.get(&notification.key) {
                for entry in by_context.values() {
                    if let Some(context) = entry.context.upgrade() {
                        let mut guard = context.lock().unwrap_or_else(|e| e.into_inner());
                        (entry.callback)(
                            &mut guard,
                            &notification.key,
                            &notification.old_value,
                            &notification.new_value,
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        log: Vec<(String, SerializedValue, SerializedValue)>,
    }

    #[test]
    fn set_then_get_round_trips_value() {
        let store: SharedDataStore<Ctx> = SharedDataStore::new();
        store.set("x", SerializedValue::Number(7.0), SetOptions::default(), 1000);
        assert_eq!(
            store.get("x", SerializedValue::Nil, 1050),
            SerializedValue::Number(7.0)
        );
    }

    #[test]
    fn ttl_expiry_fires_watch_once_with_nil() {
        // S5 from the testable-properties scenarios.
        let store: SharedDataStore<Ctx> = SharedDataStore::new();
        let ctx = Arc::new(Mutex::new(Ctx { log: vec![] }));
        store.watch(
            "ctx",
            Arc::downgrade(&ctx),
            "x",
            Arc::new(|c, key, old, new| c.log.push((key.to_string(), old.clone(), new.clone()))),
        );
        store.set(
            "x",
            SerializedValue::Number(7.0),
            SetOptions { ttl_ms: Some(100) },
            1000,
        );
        store.tick(1000);
        assert_eq!(store.get("x", SerializedValue::Nil, 1050), SerializedValue::Number(7.0));
        store.tick(1200);
        assert_eq!(store.get("x", SerializedValue::Nil, 1250), SerializedValue::Nil);
        let log = ctx.lock().unwrap();
        assert_eq!(log.log.len(), 2); // one for the initial set, one for expiry
        assert_eq!(log.log[1].2, SerializedValue::Nil);
    }

    #[test]
    fn unwatch_stops_future_notifications() {
        let store: SharedDataStore<Ctx> = SharedDataStore::new();
        let ctx = Arc::new(Mutex::new(Ctx { log: vec![] }));
        store.watch(
            "ctx",
            Arc::downgrade(&ctx),
            "x",
            Arc::new(|c, k, o, n| c.log.push((k.to_string(), o.clone(), n.clone()))),
        );
        store.unwatch("ctx", "x");
        store.set("x", SerializedValue::Boolean(true), SetOptions::default(), 0);
        store.tick(0);
        assert!(ctx.lock().unwrap().log.is_empty());
    }

    #[test]
    fn dead_context_watch_is_skipped() {
        let store: SharedDataStore<Ctx> = SharedDataStore::new();
        let ctx = Arc::new(Mutex::new(Ctx { log: vec![] }));
        let weak = Arc::downgrade(&ctx);
        drop(ctx);
        store.watch("ctx", weak, "x", Arc::new(|_, _, _, _| {}));
        store.set("x", SerializedValue::Nil, SetOptions::default(), 0);
        store.tick(0);
    }
}
