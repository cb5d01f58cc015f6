//! Routes reassembled payloads to the listener subscribed for their module.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tandem_core::ModuleType;

/// Receives payloads addressed to one module.
///
/// Called from the node's receive task, so implementations should hand
/// long-running work off rather than block.
pub trait MessageListener: Send + Sync {
    fn receive_data(&self, data: Bytes);
}

impl<F> MessageListener for F
where
    F: Fn(Bytes) + Send + Sync,
{
    fn receive_data(&self, data: Bytes) {
        self(data)
    }
}

/// Module id → listener. At most one listener per module.
#[derive(Clone, Default)]
pub struct ModuleDispatcher {
    listeners: Arc<DashMap<ModuleType, Arc<dyn MessageListener>>>,
}

impl ModuleDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `module`. An existing subscription is kept
    /// and `false` is returned.
    pub fn subscribe(&self, module: ModuleType, listener: Arc<dyn MessageListener>) -> bool {
        match self.listeners.entry(module) {
            Entry::Occupied(_) => {
                tracing::warn!(?module, "module already subscribed, keeping existing listener");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(listener);
                tracing::info!(?module, "module subscribed");
                true
            }
        }
    }

    /// Returns `false` if nothing was subscribed.
    pub fn remove_subscription(&self, module: ModuleType) -> bool {
        if self.listeners.remove(&module).is_some() {
            tracing::info!(?module, "module unsubscribed");
            true
        } else {
            tracing::warn!(?module, "no subscription to remove");
            false
        }
    }

    pub fn is_subscribed(&self, module: ModuleType) -> bool {
        self.listeners.contains_key(&module)
    }

    /// Hand `data` to the module's listener. Returns `false` when nobody
    /// listens, in which case the payload is dropped.
    pub fn dispatch(&self, module: ModuleType, data: Bytes) -> bool {
        // Clone out of the map so the listener runs without holding a shard lock.
        let listener = match self.listeners.get(&module) {
            Some(l) => l.value().clone(),
            None => {
                tracing::debug!(?module, len = data.len(), "no listener for module, dropping");
                return false;
            }
        };
        listener.receive_data(data);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<Bytes>>>, Arc<dyn MessageListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn MessageListener> =
            Arc::new(move |data: Bytes| sink.lock().unwrap().push(data));
        (seen, listener)
    }

    #[test]
    fn dispatch_reaches_subscriber() {
        let dispatcher = ModuleDispatcher::new();
        let (seen, listener) = recorder();
        assert!(dispatcher.subscribe(ModuleType::Chat, listener));

        assert!(dispatcher.dispatch(ModuleType::Chat, Bytes::from_static(b"hi")));
        assert!(!dispatcher.dispatch(ModuleType::Canvas, Bytes::from_static(b"lost")));
        assert_eq!(seen.lock().unwrap().as_slice(), &[Bytes::from_static(b"hi")]);
    }

    #[test]
    fn resubscribe_keeps_first_listener() {
        let dispatcher = ModuleDispatcher::new();
        let (first, a) = recorder();
        let (second, b) = recorder();
        assert!(dispatcher.subscribe(ModuleType::Ai, a));
        assert!(!dispatcher.subscribe(ModuleType::Ai, b));

        dispatcher.dispatch(ModuleType::Ai, Bytes::from_static(b"x"));
        assert_eq!(first.lock().unwrap().len(), 1);
        assert!(second.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_unregistered_is_a_noop() {
        let dispatcher = ModuleDispatcher::new();
        assert!(!dispatcher.remove_subscription(ModuleType::Cloud));

        let (_, listener) = recorder();
        dispatcher.subscribe(ModuleType::Cloud, listener);
        assert!(dispatcher.remove_subscription(ModuleType::Cloud));
        assert!(!dispatcher.is_subscribed(ModuleType::Cloud));
    }
}
