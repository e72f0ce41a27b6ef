use crate::alerts::AlertPolicy;
use crate::catalog::{ProduceCatalog, ProduceCatalogEntry};
use crate::error::KernelResult;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};
use tokio::fs;
use tracing::{info, warn};

/// One week; longer windows would silence an alert kind for good.
pub const MAX_COOLDOWN_MINUTES: i64 = 7 * 24 * 60;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub mqtt: Option<MqttConf>,
    pub alerts: AlertsConf,
    pub classifier: ClassifierConf,
    pub snapshots: SnapshotsConf,
    pub history: HistoryConf,
    pub consumable: ConsumableConf,
    pub camera: CameraConf,
    /// Replaces the built-in produce table when present.
    pub catalog: Option<BTreeMap<String, ProduceCatalogEntry>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            topic: "coldstore/metrics@v1".into(),
            client_id: "coldstore-kernel".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConf {
    pub cooldown_minutes: i64,
    pub temperature_warn_margin: f64,
    pub humidity_warn_margin: f64,
    pub recipients: Vec<String>,
    /// JSON relay for notifications; without it they only go to the log.
    pub webhook_url: Option<String>,
    pub delivery_timeout_secs: u64,
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self {
            cooldown_minutes: 30,
            temperature_warn_margin: 0.5,
            humidity_warn_margin: 3.0,
            recipients: Vec::new(),
            webhook_url: None,
            delivery_timeout_secs: 10,
        }
    }
}

impl AlertsConf {
    pub fn policy(&self) -> AlertPolicy {
        AlertPolicy {
            cooldown: time::Duration::minutes(self.cooldown_minutes.clamp(0, MAX_COOLDOWN_MINUTES)),
            temperature_warn_margin: self.temperature_warn_margin,
            humidity_warn_margin: self.humidity_warn_margin,
        }
    }

    pub fn delivery_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.delivery_timeout_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClassifierConf {
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ClassifierConf {
    fn default() -> Self {
        Self { url: None, timeout_secs: 10 }
    }
}

impl ClassifierConf {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SnapshotsConf {
    pub dir: String,
}

impl Default for SnapshotsConf {
    fn default() -> Self {
        Self { dir: "./data/snapshots".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConf {
    pub capacity: usize,
}

impl Default for HistoryConf {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumableConf {
    pub initial_percent: f64,
}

impl Default for ConsumableConf {
    fn default() -> Self {
        Self { initial_percent: 100.0 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CameraConf {
    pub stale_after_secs: i64,
}

impl Default for CameraConf {
    fn default() -> Self {
        Self { stale_after_secs: 300 }
    }
}

impl KernelConfig {
    pub fn build_catalog(&self) -> KernelResult<ProduceCatalog> {
        match &self.catalog {
            Some(entries) => ProduceCatalog::from_entries(entries.clone()),
            None => Ok(ProduceCatalog::builtin()),
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Environment wins over the file. `lookup` is `std::env::var` outside tests.
pub fn apply_env_overrides<F>(cfg: &mut KernelConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup("ALERT_COOLDOWN_MINUTES") {
        match raw.trim().parse::<i64>() {
            Ok(minutes) if (0..=MAX_COOLDOWN_MINUTES).contains(&minutes) => cfg.alerts.cooldown_minutes = minutes,
            _ => warn!(value = %raw, "ignoring invalid ALERT_COOLDOWN_MINUTES"),
        }
    }
    if let Some(raw) = lookup("ALERT_RECIPIENTS") {
        cfg.alerts.recipients = raw
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(url) = lookup("ALERT_WEBHOOK_URL").filter(|u| !u.trim().is_empty()) {
        cfg.alerts.webhook_url = Some(url);
    }
    if let Some(url) = lookup("CLASSIFIER_URL").filter(|u| !u.trim().is_empty()) {
        cfg.classifier.url = Some(url);
    }
    if let Some(bind) = lookup("COLDSTORE_BIND").filter(|b| !b.trim().is_empty()) {
        cfg.http.bind = bind;
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("COLDSTORE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!(%path, error = %e, "invalid config, using defaults");
            KernelConfig::default()
        })
    } else {
        info!(%path, "no config file, using defaults");
        KernelConfig::default()
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    clamp_limits(&mut cfg);
    cfg
}

/// Brings file-provided values back into range instead of failing startup.
pub fn clamp_limits(cfg: &mut KernelConfig) {
    let minutes = cfg.alerts.cooldown_minutes;
    if !(0..=MAX_COOLDOWN_MINUTES).contains(&minutes) {
        let clamped = minutes.clamp(0, MAX_COOLDOWN_MINUTES);
        warn!(configured = minutes, used = clamped, "alerts.cooldown_minutes out of range");
        cfg.alerts.cooldown_minutes = clamped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
        assert!(cfg.mqtt.is_none());
        assert_eq!(cfg.alerts.cooldown_minutes, 30);
        assert_eq!(cfg.history.capacity, 50);
        assert_eq!(cfg.camera.stale_after_secs, 300);
        assert!(cfg.catalog.is_none());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let cfg = parse_config(
            r#"
mqtt:
  host: broker.local
alerts:
  cooldown_minutes: 5
  recipients: [ops@example.com]
"#,
        )
        .unwrap();
        let mqtt = cfg.mqtt.unwrap();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.topic, "coldstore/metrics@v1");
        assert_eq!(cfg.alerts.cooldown_minutes, 5);
        assert_eq!(cfg.alerts.temperature_warn_margin, 0.5);
        assert_eq!(cfg.alerts.policy().cooldown, time::Duration::minutes(5));
    }

    #[test]
    fn test_catalog_section_replaces_builtin() {
        let cfg = parse_config(
            r#"
catalog:
  Carrots:
    name: Carrots
    temperature: { min: 0.0, max: 1.0 }
    humidity: { min: 95.0, max: 100.0 }
    voc_threshold: 20000
"#,
        )
        .unwrap();
        let catalog = cfg.build_catalog().unwrap();
        assert_eq!(catalog.ids(), vec!["carrots".to_string()]);
        assert_eq!(catalog.lookup("carrots").unwrap().voc_max, 20_000.0);
        assert!(catalog.lookup("apples").is_err());
    }

    #[test]
    fn test_invalid_catalog_is_rejected() {
        let cfg = parse_config(
            r#"
catalog:
  bad:
    name: Bad
    temperature: { min: 5.0, max: 1.0 }
    humidity: { min: 90.0, max: 95.0 }
    voc_threshold: 1000
"#,
        )
        .unwrap();
        assert!(cfg.build_catalog().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ALERT_COOLDOWN_MINUTES", "1"),
            ("ALERT_RECIPIENTS", "a@example.com, b@example.com,"),
            ("CLASSIFIER_URL", "http://localhost:5000"),
            ("COLDSTORE_BIND", "127.0.0.1:9090"),
        ]);
        let mut cfg = KernelConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.alerts.cooldown_minutes, 1);
        assert_eq!(cfg.alerts.recipients, vec!["a@example.com", "b@example.com"]);
        assert_eq!(cfg.classifier.url.as_deref(), Some("http://localhost:5000"));
        assert_eq!(cfg.http.bind, "127.0.0.1:9090");
        assert!(cfg.alerts.webhook_url.is_none());
    }

    #[test]
    fn test_invalid_cooldown_env_is_ignored() {
        let mut cfg = KernelConfig::default();
        apply_env_overrides(&mut cfg, |k| (k == "ALERT_COOLDOWN_MINUTES").then(|| "soon".to_string()));
        assert_eq!(cfg.alerts.cooldown_minutes, 30);
    }

    #[test]
    fn test_oversized_cooldown_env_is_ignored() {
        let mut cfg = KernelConfig::default();
        apply_env_overrides(&mut cfg, |k| (k == "ALERT_COOLDOWN_MINUTES").then(|| i64::MAX.to_string()));
        assert_eq!(cfg.alerts.cooldown_minutes, 30);
        assert_eq!(cfg.alerts.policy().cooldown, time::Duration::minutes(30));
    }

    #[test]
    fn test_oversized_cooldown_in_file_is_clamped() {
        let mut cfg = parse_config("alerts:\n  cooldown_minutes: 9223372036854775807\n").unwrap();
        // policy() alone must not overflow either
        assert_eq!(cfg.alerts.policy().cooldown, time::Duration::minutes(MAX_COOLDOWN_MINUTES));
        clamp_limits(&mut cfg);
        assert_eq!(cfg.alerts.cooldown_minutes, MAX_COOLDOWN_MINUTES);

        let mut cfg = parse_config("alerts:\n  cooldown_minutes: -5\n").unwrap();
        clamp_limits(&mut cfg);
        assert_eq!(cfg.alerts.cooldown_minutes, 0);
    }
}
