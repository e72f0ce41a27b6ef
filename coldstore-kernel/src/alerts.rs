/**
 * ALERT POLICY - Threshold evaluation, cooldown and notification payloads
 *
 * Each cycle reports every out-of-range channel as a condition. Whether a
 * condition also becomes a notification is decided by the cooldown ledger,
 * one window per alert kind. Control logic reads the conditions and is never
 * throttled by the ledger.
 */

use crate::catalog::ThresholdSet;
use crate::models::MetricsSample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Temperature,
    Humidity,
    Voc,
}

impl AlertKind {
    pub const ALL: [AlertKind; 3] = [AlertKind::Temperature, AlertKind::Humidity, AlertKind::Voc];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Temperature => "temperature",
            AlertKind::Humidity => "humidity",
            AlertKind::Voc => "voc",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "temperature" | "temp" => Some(AlertKind::Temperature),
            "humidity" => Some(AlertKind::Humidity),
            "voc" | "vocs" => Some(AlertKind::Voc),
            _ => None,
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            AlertKind::Temperature => "°C",
            AlertKind::Humidity => "%",
            AlertKind::Voc => " units",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    TooLow,
    TooHigh,
}

/// Declaration order is the display ranking: `Err` outranks `Warn` outranks `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warn,
    Err,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertCondition {
    pub kind: AlertKind,
    pub direction: Direction,
    pub severity: Severity,
    pub value: f64,
    /// The bound that was crossed.
    pub limit: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    #[serde(flatten)]
    pub condition: AlertCondition,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Evaluation {
    /// Every out-of-range channel of the cycle, throttled or not.
    pub conditions: Vec<AlertCondition>,
    /// Conditions that passed the cooldown and must be notified.
    pub events: Vec<AlertEvent>,
    pub suppressed: Vec<AlertKind>,
}

impl Evaluation {
    /// Highest-severity condition, shown as the banner.
    pub fn primary(&self) -> Option<&AlertCondition> {
        // max_by_key keeps the last maximum; reverse so the first channel wins ties
        self.conditions.iter().rev().max_by_key(|c| c.severity)
    }

    pub fn condition(&self, kind: AlertKind) -> Option<&AlertCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

/// Last notification time per alert kind. Entries are created lazily and never removed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertCooldownLedger {
    #[serde(with = "ledger_serde")]
    last_sent: BTreeMap<AlertKind, OffsetDateTime>,
}

mod ledger_serde {
    use super::AlertKind;
    use serde::ser::SerializeMap;
    use serde::Serializer;
    use std::collections::BTreeMap;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<AlertKind, OffsetDateTime>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = s.serialize_map(Some(map.len()))?;
        for (kind, at) in map {
            let at = at.format(&Rfc3339).map_err(<S::Error as serde::ser::Error>::custom)?;
            out.serialize_entry(kind.as_str(), &at)?;
        }
        out.end()
    }
}

impl AlertCooldownLedger {
    pub fn last_sent(&self, kind: AlertKind) -> Option<OffsetDateTime> {
        self.last_sent.get(&kind).copied()
    }

    pub fn is_cooling_down(&self, kind: AlertKind, now: OffsetDateTime, window: Duration) -> bool {
        self.last_sent(kind).is_some_and(|last| now - last < window)
    }

    pub fn record(&mut self, kind: AlertKind, now: OffsetDateTime) {
        self.last_sent.insert(kind, now);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub cooldown: Duration,
    pub temperature_warn_margin: f64,
    pub humidity_warn_margin: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(30),
            temperature_warn_margin: 0.5,
            humidity_warn_margin: 3.0,
        }
    }
}

impl AlertPolicy {
    pub fn evaluate(
        &self,
        sample: &MetricsSample,
        thresholds: &ThresholdSet,
        ledger: &mut AlertCooldownLedger,
    ) -> Evaluation {
        let now = sample.captured_at;
        let conditions: Vec<AlertCondition> = [
            self.check_range(AlertKind::Temperature, sample.temperature, thresholds.temperature.min, thresholds.temperature.max),
            self.check_range(AlertKind::Humidity, sample.humidity, thresholds.humidity.min, thresholds.humidity.max),
            check_voc(sample.voc, thresholds.voc_max),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut evaluation = Evaluation { conditions, ..Evaluation::default() };
        for condition in &evaluation.conditions {
            if ledger.is_cooling_down(condition.kind, now, self.cooldown) {
                evaluation.suppressed.push(condition.kind);
                continue;
            }
            ledger.record(condition.kind, now);
            evaluation.events.push(AlertEvent {
                id: Uuid::new_v4(),
                condition: condition.clone(),
                raised_at: now,
            });
        }
        evaluation
    }

    fn check_range(&self, kind: AlertKind, value: f64, min: f64, max: f64) -> Option<AlertCondition> {
        let (direction, limit, excess) = if value < min {
            (Direction::TooLow, min, min - value)
        } else if value > max {
            (Direction::TooHigh, max, value - max)
        } else {
            return None;
        };
        let margin = match kind {
            AlertKind::Temperature => self.temperature_warn_margin,
            _ => self.humidity_warn_margin,
        };
        let severity = if excess > margin { Severity::Warn } else { Severity::Ok };
        let label = if kind == AlertKind::Temperature { "Temperature" } else { "Humidity" };
        let trend = match direction {
            Direction::TooHigh => "above",
            Direction::TooLow => "below",
        };
        Some(AlertCondition {
            kind,
            direction,
            severity,
            value,
            limit,
            message: format!(
                "{label} {value:.1}{unit} is {trend} target ({min}-{max}{unit})",
                unit = kind.unit()
            ),
        })
    }
}

fn check_voc(value: f64, voc_max: f64) -> Option<AlertCondition> {
    (value > voc_max).then(|| AlertCondition {
        kind: AlertKind::Voc,
        direction: Direction::TooHigh,
        severity: Severity::Err,
        value,
        limit: voc_max,
        // scrubber state is reported by the reconciler, it may be pinned off
        message: format!("VOC level {value:.0} above {voc_max:.0}, produce spoilage likely"),
    })
}

/// Formatted payload handed to the notification transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub kind: AlertKind,
    pub test: bool,
}

impl Notification {
    pub fn for_event(
        event: &AlertEvent,
        produce_type: &str,
        thresholds: &ThresholdSet,
        recipients: &[String],
    ) -> Self {
        let c = &event.condition;
        let kind = c.kind;
        let mut body = format!(
            "Cold Storage Alert\nAlert Type: {}\nTime: {}\n\n",
            kind.as_str().to_uppercase(),
            event.raised_at.format(&Rfc3339).unwrap_or_default(),
        );
        body.push_str(&describe(kind, c.value, thresholds, produce_type));
        match kind {
            AlertKind::Voc => body.push_str("VOC levels indicate produce spoilage\n"),
            _ => {
                let level = match c.direction {
                    Direction::TooHigh => "TOO HIGH",
                    Direction::TooLow => "TOO LOW",
                };
                let name = if kind == AlertKind::Temperature { "Temperature" } else { "Humidity" };
                body.push_str(&format!("{name} is {level}\n"));
            }
        }
        body.push_str("\nThis is an automated alert from your Cold Storage Monitoring System.\n");
        body.push_str("Please check your cold storage unit immediately.\n");

        Self {
            subject: format!("Cold Storage Alert: {} Threshold Exceeded", kind.as_str().to_uppercase()),
            body,
            recipients: recipients.to_vec(),
            kind,
            test: false,
        }
    }

    /// Diagnostic message for one alert kind; never touches the cooldown ledger.
    pub fn test(
        kind: AlertKind,
        current: Option<f64>,
        produce_type: &str,
        thresholds: &ThresholdSet,
        recipients: &[String],
        now: OffsetDateTime,
    ) -> Self {
        let mut body = format!(
            "Test Notification - Cold Storage Monitoring System\nAlert Type: {}\nTime: {}\n\n",
            kind.as_str().to_uppercase(),
            now.format(&Rfc3339).unwrap_or_default(),
        );
        match current {
            Some(value) => body.push_str(&describe(kind, value, thresholds, produce_type)),
            None => body.push_str("No sensor reading received yet.\n"),
        }
        body.push_str("\nIf you are reading this, alert notifications are configured correctly.\n");
        Self {
            subject: "Cold Storage System - Test Notification".to_string(),
            body,
            recipients: recipients.to_vec(),
            kind,
            test: true,
        }
    }
}

fn describe(kind: AlertKind, value: f64, thresholds: &ThresholdSet, produce_type: &str) -> String {
    match kind {
        AlertKind::Temperature => format!(
            "Current Temperature: {value}°C\nSafe Range: {}°C - {}°C\nProduce Type: {produce_type}\n",
            thresholds.temperature.min, thresholds.temperature.max
        ),
        AlertKind::Humidity => format!(
            "Current Humidity: {value}%\nSafe Range: {}% - {}%\nProduce Type: {produce_type}\n",
            thresholds.humidity.min, thresholds.humidity.max
        ),
        AlertKind::Voc => format!(
            "Current VOC Level: {value} units\nMaximum Safe Level: {} units\nProduce Type: {produce_type}\n",
            thresholds.voc_max
        ),
    }
}
