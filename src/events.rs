// src/events.rs

//! Health transition notifications.
//!
//! External collaborators (alerting, dashboards) subscribe with a listener.
//! Emission is synchronous and the pool never waits on delivery work; a
//! listener that needs to do I/O should hand the event off to its own task.

use crate::storage::KeyStatus;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Receives health status transitions for individual keys.
pub trait HealthListener: Send + Sync {
    fn on_health_transition(&self, key: &str, from: KeyStatus, to: KeyStatus);
}

/// Registry of health listeners shared by the key manager and the cooldown
/// store (both of which drive transitions).
#[derive(Default)]
pub struct HealthEventBus {
    listeners: RwLock<Vec<Arc<dyn HealthListener>>>,
}

impl HealthEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn HealthListener>) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, key: &str, from: KeyStatus, to: KeyStatus) {
        let listeners = self.listeners.read();
        debug!(
            key.preview = %crate::storage::key_preview(key),
            from = %from,
            to = %to,
            listeners = listeners.len(),
            "Health transition"
        );
        for listener in listeners.iter() {
            listener.on_health_transition(key, from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<(String, KeyStatus, KeyStatus)>>,
    }

    impl HealthListener for Recorder {
        fn on_health_transition(&self, key: &str, from: KeyStatus, to: KeyStatus) {
            self.seen.lock().push((key.to_string(), from, to));
        }
    }

    #[test]
    fn emits_to_all_subscribers() {
        let bus = HealthEventBus::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(recorder.clone());
        bus.subscribe(recorder.clone());

        bus.emit("secret1", KeyStatus::Enabled, KeyStatus::Cooldown);

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, KeyStatus::Enabled);
        assert_eq!(seen[0].2, KeyStatus::Cooldown);
    }
}
