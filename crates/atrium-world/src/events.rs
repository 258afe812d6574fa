//! Named local event bus.
//!
//! Listeners subscribe by name; `emit` dispatches sequentially on the
//! simulation thread. A listener that fails is logged and the remaining
//! listeners still fire. Listener removal during dispatch is safe: the
//! listener list is collected into a local buffer before the first call.

use std::collections::HashMap;

use tracing::warn;

/// Handle returned by [`EventBus::on`]; pass to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Box<dyn FnMut(&serde_json::Value) -> Result<(), String>>;

struct Listener {
    id: ListenerId,
    callback: Callback,
}

/// Named event emit/on/off with isolated listener failure.
#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<String, Vec<Listener>>,
    next_id: u64,
}

impl EventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `name`.
    pub fn on(
        &mut self,
        name: &str,
        callback: impl FnMut(&serde_json::Value) -> Result<(), String> + 'static,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(name.to_owned())
            .or_default()
            .push(Listener {
                id,
                callback: Box::new(callback),
            });
        id
    }

    /// Remove a listener. Unknown ids are a no-op (double-off is fine).
    pub fn off(&mut self, name: &str, id: ListenerId) {
        if let Some(list) = self.listeners.get_mut(name) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                self.listeners.remove(name);
            }
        }
    }

    /// Emit `name`. The listener list is buffered before the first call,
    /// so dispatch is stable regardless of what the callbacks enqueue.
    pub fn emit(&mut self, name: &str, data: &serde_json::Value) {
        let mut batch = match self.listeners.remove(name) {
            Some(batch) => batch,
            None => return,
        };

        for listener in &mut batch {
            if let Err(reason) = (listener.callback)(data) {
                warn!(event = name, %reason, "event listener failed");
            }
        }

        // Merge back under any entries registered while the batch ran.
        if let Some(added) = self.listeners.remove(name) {
            batch.extend(added);
        }
        self.listeners.insert(name.to_owned(), batch);
    }

    /// Number of listeners currently subscribed to `name`.
    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.get(name).map_or(0, Vec::len)
    }
}
