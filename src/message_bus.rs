//! Priority, typed, asynchronous messaging between contexts, with
//! request/response correlation. Grounded on `MessageBus.h`: same
//! `Priority`/`OverflowPolicy`/lock-ordering discipline (handlers before
//! queue before responses; handlers always invoked outside any lock).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::TasError;
use crate::queue::{OverflowPolicy, PriorityQueue, QueueConfig};
use crate::value::SerializedValue;

pub const PRIORITY_LOW: usize = 0;
pub const PRIORITY_NORMAL: usize = 1;
pub const PRIORITY_HIGH: usize = 2;
pub const MAX_PRIORITY: usize = 2;

#[derive(Debug, Clone)]
pub struct Message {
    pub sender: String,
    pub target: String,
    pub message_type: String,
    pub payload: SerializedValue,
    pub priority: usize,
    pub correlation_id: Option<String>,
    pub is_response: bool,
}

pub const BROADCAST_TARGET: &str = "*";

/// A registered handler. Holds a weak reference to its owning context so
/// a destroyed context's handlers are skipped and lazily reaped rather
/// than requiring explicit unregistration on every path.
pub struct HandlerEntry<C> {
    pub context: Weak<Mutex<C>>,
    pub callback: Arc<dyn Fn(&mut C, &Message) + Send + Sync>,
}

struct PendingResponse {
    value: Mutex<Option<SerializedValue>>,
    condvar: Condvar,
}

pub struct MessageBusConfig {
    pub queue: QueueConfig,
    pub max_message_size: usize,
    pub warn_threshold: usize,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        MessageBusConfig {
            queue: QueueConfig {
                max_size: 8192,
                overflow_policy: OverflowPolicy::DropNewest,
            },
            max_message_size: 1 << 20,
            warn_threshold: 1 << 16,
        }
    }
}

/// Generic over the context type `C` so this module has no dependency
/// on `ScriptContext` directly and can be unit tested with a bare struct.
pub struct MessageBus<C> {
    queue: PriorityQueue<Message>,
    config: MessageBusConfig,
    handlers: Mutex<HashMap<String, HashMap<String, Vec<HandlerEntry<C>>>>>,
    responses: Mutex<HashMap<String, Arc<PendingResponse>>>,
    correlation_counter: std::sync::atomic::AtomicU64,
}

impl<C> MessageBus<C> {
    pub fn new(config: MessageBusConfig) -> Self {
        MessageBus {
            queue: PriorityQueue::new(MAX_PRIORITY + 1, config.queue),
            config,
            handlers: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            correlation_counter: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn estimate_size(value: &SerializedValue) -> usize {
        value.to_json().to_string().len()
    }

    /// Registers a handler for `(context_name, message_type)`. Lock
    /// order: this only touches the handlers lock.
    pub fn register_handler(
        &self,
        context_name: &str,
        message_type: &str,
        context: Weak<Mutex<C>>,
        callback: Arc<dyn Fn(&mut C, &Message) + Send + Sync>,
    ) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(context_name.to_string())
            .or_default()
            .entry(message_type.to_string())
            .or_default()
            .push(HandlerEntry { context, callback });
    }

    pub fn remove_handlers(&self, context_name: &str, message_type: &str) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(by_type) = handlers.get_mut(context_name) {
            by_type.remove(message_type);
        }
    }

    pub fn remove_all_handlers(&self, context_name: &str) {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.remove(context_name);
    }

    fn enqueue(&self, message: Message) -> Result<(), TasError> {
        let size = Self::estimate_size(&message.payload);
        if size > self.config.max_message_size {
            return Err(TasError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        if size > self.config.warn_threshold {
            log::warn!(
                "message from '{}' to '{}' is {size} bytes, above warn threshold {}",
                message.sender,
                message.target,
                self.config.warn_threshold
            );
        }
        let priority = message.priority.min(self.queue.max_priority());
        if !self.queue.enqueue(message, priority) {
            return Err(TasError::QueueFull);
        }
        Ok(())
    }

    pub fn send_message(
        &self,
        sender: &str,
        target: &str,
        message_type: &str,
        payload: SerializedValue,
        priority: usize,
    ) -> Result<(), TasError> {
        self.enqueue(Message {
            sender: sender.to_string(),
            target: target.to_string(),
            message_type: message_type.to_string(),
            payload,
            priority,
            correlation_id: None,
            is_response: false,
        })
    }

    pub fn broadcast_message(
        &self,
        sender: &str,
        message_type: &str,
        payload: SerializedValue,
        priority: usize,
    ) -> Result<(), TasError> {
        self.send_message(sender, BROADCAST_TARGET, message_type, payload, priority)
    }

    fn next_correlation_id(&self) -> String {
        let n = self
            .correlation_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        format!("corr-{n}")
    }

    /// Blocks the calling thread until the matching response arrives or
    /// `timeout` elapses; intended for non-game-thread callers. Returns
    /// `Nil` on timeout rather than raising, per the error-propagation
    /// policy for request timeouts.
    pub fn send_request(
        &self,
        sender: &str,
        target: &str,
        message_type: &str,
        payload: SerializedValue,
        timeout: Duration,
    ) -> Result<SerializedValue, TasError> {
        let correlation_id = self.next_correlation_id();
        let pending = Arc::new(PendingResponse {
            value: Mutex::new(None),
            condvar: Condvar::new(),
        });
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(correlation_id.clone(), pending.clone());

        self.enqueue(Message {
            sender: sender.to_string(),
            target: target.to_string(),
            message_type: message_type.to_string(),
            payload,
            priority: PRIORITY_HIGH,
            correlation_id: Some(correlation_id.clone()),
            is_response: false,
        })?;

        let deadline = Instant::now() + timeout;
        let mut guard = pending.value.lock().unwrap_or_else(|e| e.into_inner());
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (new_guard, timeout_result) = pending
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = new_guard;
            if timeout_result.timed_out() && guard.is_none() {
                break;
            }
        }
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&correlation_id);
        match guard.take() {
            Some(value) => Ok(value),
            None => Err(TasError::RequestTimeout),
        }
    }

    pub fn send_response(
        &self,
        sender: &str,
        target: &str,
        correlation_id: &str,
        payload: SerializedValue,
    ) -> Result<(), TasError> {
        self.enqueue(Message {
            sender: sender.to_string(),
            target: target.to_string(),
            message_type: String::new(),
            payload,
            priority: PRIORITY_HIGH,
            correlation_id: Some(correlation_id.to_string()),
            is_response: true,
        })
    }

    /// Drains the queue and delivers every message to its matching
    /// handlers (or to a blocked requester, for responses). Handlers run
    /// with no bus locks held, so a handler may itself call back into
    /// the bus without deadlocking.
    pub fn process_messages(&self, contexts: &HashMap<String, Arc<Mutex<C>>>) {
        while let Some(message) = self.queue.dequeue() {
            if message.is_response {
                if let Some(correlation_id) = &message.correlation_id {
                    let responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(pending) = responses.get(correlation_id) {
                        let pending = pending.clone();
                        drop(responses);
                        *pending.value.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(message.payload);
                        pending.condvar.notify_all();
                    }
                }
                continue;
            }

            let targets: Vec<String> = if message.target == BROADCAST_TARGET {
                contexts
                    .keys()
                    .filter(|name| **name != message.sender)
                    .cloned()
                    .collect()
            } else {
                vec![message.target.clone()]
            };

            for target in targets {
                let callbacks: Vec<_> = {
                    let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
                    handlers
                        .get(&target)
                        .and_then(|by_type| by_type.get(&message.message_type))
                        .map(|entries| {
                            entries
                                .iter()
                                .filter_map(|e| e.context.upgrade().map(|ctx| (ctx, e.callback.clone())))
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                };
                for (context, callback) in callbacks {
                    let mut guard = context.lock().unwrap_or_else(|e| e.into_inner());
                    callback(&mut guard, &message);
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx {
        received: Vec<String>,
    }

    #[test]
    fn handlers_are_invoked_in_descending_priority_order() {
        let bus: MessageBus<Ctx> = MessageBus::new(MessageBusConfig::default());
        let a = Arc::new(Mutex::new(Ctx { received: vec![] }));
        bus.register_handler(
            "a",
            "t",
            Arc::downgrade(&a),
            Arc::new(|ctx, msg| ctx.received.push(msg.sender.clone())),
        );
        bus.send_message("low", "a", "t", SerializedValue::Nil, PRIORITY_LOW)
            .unwrap();
        bus.send_message("high", "a", "t", SerializedValue::Nil, PRIORITY_HIGH)
            .unwrap();
        bus.send_message("normal", "a", "t", SerializedValue::Nil, PRIORITY_NORMAL)
            .unwrap();
        let mut contexts = HashMap::new();
        contexts.insert("a".to_string(), a.clone());
        bus.process_messages(&contexts);
        assert_eq!(
            a.lock().unwrap().received,
            vec!["high".to_string(), "normal".to_string(), "low".to_string()]
        );
    }

    #[test]
    fn broadcast_never_targets_the_sender() {
        let bus: MessageBus<Ctx> = MessageBus::new(MessageBusConfig::default());
        let a = Arc::new(Mutex::new(Ctx { received: vec![] }));
        let b = Arc::new(Mutex::new(Ctx { received: vec![] }));
        bus.register_handler(
            "a",
            "ping",
            Arc::downgrade(&a),
            Arc::new(|ctx, msg| ctx.received.push(msg.message_type.clone())),
        );
        bus.register_handler(
            "b",
            "ping",
            Arc::downgrade(&b),
            Arc::new(|ctx, msg| ctx.received.push(msg.message_type.clone())),
        );
        bus.broadcast_message("a", "ping", SerializedValue::Nil, PRIORITY_NORMAL)
            .unwrap();
        let mut contexts = HashMap::new();
        contexts.insert("a".to_string(), a.clone());
        contexts.insert("b".to_string(), b.clone());
        bus.process_messages(&contexts);
        assert!(a.lock().unwrap().received.is_empty());
        assert_eq!(b.lock().unwrap().received, vec!["ping".to_string()]);
    }

    #[test]
    fn dead_context_handler_is_skipped_without_panicking() {
        let bus: MessageBus<Ctx> = MessageBus::new(MessageBusConfig::default());
        let gone = Arc::new(Mutex::new(Ctx { received: vec![] }));
        let weak = Arc::downgrade(&gone);
        drop(gone);
        bus.register_handler("a", "t", weak, Arc::new(|_, _| {}));
        bus.send_message("x", "a", "t", SerializedValue::Nil, PRIORITY_NORMAL)
            .unwrap();
        let contexts = HashMap::new();
        bus.process_messages(&contexts);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut config = MessageBusConfig::default();
        config.max_message_size = 4;
        let bus: MessageBus<Ctx> = MessageBus::new(config);
        let err = bus
            .send_message(
                "a",
                "b",
                "t",
                SerializedValue::String("this is way too long".into()),
                PRIORITY_NORMAL,
            )
            .unwrap_err();
        assert!(matches!(err, TasError::MessageTooLarge { .. }));
    }

    #[test]
    fn request_times_out_without_a_responder() {
        let bus: MessageBus<Ctx> = MessageBus::new(MessageBusConfig::default());
        // No one ever drains the queue or responds.
        let result = bus.send_request(
            "a",
            "b",
            "ping",
            SerializedValue::Nil,
            Duration::from_millis(20),
        );
        assert!(matches!(result, Err(TasError::RequestTimeout)));
    }
}
