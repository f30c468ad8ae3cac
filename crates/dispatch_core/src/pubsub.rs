//! Minimal publish/subscribe registry.
//!
//! Replaces ad hoc listener arrays: subscribers are keyed by id, removal is
//! explicit, and emission never runs user callbacks while the registry lock
//! is held (a listener may re-enter the owning component).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Subscribers<T> {
    listeners: Mutex<HashMap<SubscriptionId, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener<T>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(id, listener);
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(&id);
        }
    }

    /// Deliver `event` to every subscriber. Callbacks run outside the lock.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = match self.listeners.lock() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers").field("len", &self.len()).finish()
    }
}
