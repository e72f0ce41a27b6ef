use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub last_rejection: Option<String>,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub notifications_dropped: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    samples_accepted: Arc<AtomicU64>,
    samples_rejected: Arc<AtomicU64>,
    last_rejection: Arc<Mutex<Option<String>>>,
    notifications_delivered: Arc<AtomicU64>,
    notifications_failed: Arc<AtomicU64>,
    notifications_dropped: Arc<AtomicU64>,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl HealthTracker {
    pub fn new(mqtt_enabled: bool) -> Self {
        let status = if mqtt_enabled { "connecting" } else { "disabled" };
        Self {
            start_time: Instant::now(),
            samples_accepted: Arc::new(AtomicU64::new(0)),
            samples_rejected: Arc::new(AtomicU64::new(0)),
            last_rejection: Arc::new(Mutex::new(None)),
            notifications_delivered: Arc::new(AtomicU64::new(0)),
            notifications_failed: Arc::new(AtomicU64::new(0)),
            notifications_dropped: Arc::new(AtomicU64::new(0)),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new(status.to_string())),
        }
    }

    pub fn record_sample_accepted(&self) {
        self.samples_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a rejected sample and keeps its reason as the latest diagnostic.
    pub fn record_rejection(&self, reason: &str) {
        self.samples_rejected.fetch_add(1, Ordering::Relaxed);
        *self.last_rejection.lock() = Some(reason.to_string());
    }

    pub fn record_delivery(&self, delivered: bool) {
        let counter = if delivered { &self.notifications_delivered } else { &self.notifications_failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_notification(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            samples_accepted: self.samples_accepted.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            last_rejection: self.last_rejection.lock().clone(),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_last_rejection() {
        let health = HealthTracker::new(false);
        health.record_sample_accepted();
        health.record_rejection("missing vocs.value");
        health.record_rejection("humidity.value is not a number");
        health.record_delivery(true);
        health.record_delivery(false);

        let h = health.get_health();
        assert_eq!(h.samples_accepted, 1);
        assert_eq!(h.samples_rejected, 2);
        assert_eq!(h.last_rejection.as_deref(), Some("humidity.value is not a number"));
        assert_eq!(h.notifications_delivered, 1);
        assert_eq!(h.notifications_failed, 1);
        assert_eq!(h.mqtt_status, "disabled");
    }

    #[test]
    fn test_mqtt_status_transitions() {
        let health = HealthTracker::new(true);
        assert_eq!(health.get_health().mqtt_status, "connecting");
        health.increment_reconnects();
        assert_eq!(health.get_health().mqtt_status, "reconnecting");
        health.mark_mqtt_connected();
        let h = health.get_health();
        assert_eq!(h.mqtt_status, "connected");
        assert_eq!(h.mqtt_reconnects, 1);
    }
}
