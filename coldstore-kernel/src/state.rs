use parking_lot::Mutex;
use std::sync::Arc;

/// State shared between handlers, the MQTT task and background jobs.
/// Guards are never held across an `.await`.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
