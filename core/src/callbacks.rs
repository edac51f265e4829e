//! Observer list for circuit breaker state transitions

use crate::CircuitState;
use serde::Serialize;
use std::sync::Arc;

/// A single state transition of a named circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub circuit: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Listener invoked synchronously on every transition
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone)]
pub struct Callbacks {
    pub on_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_half_open: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub listeners: Vec<StateListener>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self {
            on_open: None,
            on_close: None,
            on_half_open: None,
            listeners: Vec::new(),
        }
    }

    /// Add a listener receiving every transition
    pub fn subscribe(&mut self, listener: StateListener) {
        self.listeners.push(listener);
    }

    /// Fire the hook for the target state, then every listener
    pub fn notify(&self, change: &StateChange) {
        let hook = match change.to {
            CircuitState::Open => &self.on_open,
            CircuitState::Closed => &self.on_close,
            CircuitState::HalfOpen => &self.on_half_open,
        };
        if let Some(callback) = hook {
            callback(&change.circuit);
        }

        for listener in &self.listeners {
            listener(change);
        }
    }

    /// Drop every hook and listener
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_notify_fires_hook_and_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let opened = Arc::new(Mutex::new(None));

        let mut callbacks = Callbacks::new();
        let opened_clone = opened.clone();
        callbacks.on_open = Some(Arc::new(move |name: &str| {
            *opened_clone.lock() = Some(name.to_string());
        }));
        let seen_clone = seen.clone();
        callbacks.subscribe(Arc::new(move |change: &StateChange| {
            seen_clone.lock().push(change.clone());
        }));

        let change = StateChange {
            circuit: "zatca".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        callbacks.notify(&change);

        assert_eq!(opened.lock().as_deref(), Some("zatca"));
        assert_eq!(seen.lock().as_slice(), &[change]);
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut callbacks = Callbacks::new();
        callbacks.on_close = Some(Arc::new(|_| {}));
        callbacks.subscribe(Arc::new(|_| {}));

        callbacks.clear();

        assert!(callbacks.on_close.is_none());
        assert!(callbacks.listeners.is_empty());
    }
}
