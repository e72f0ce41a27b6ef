/**
 * COLDSTORE ENGINE - Shared state and the evaluation cycle
 *
 * ROLE : owns the active produce profile, actuators, filter health, cooldown
 * ledger and sample history behind one lock. Every event (sample, detection,
 * operator action) is applied as one critical section; no lock is held across
 * an external call. Callers get back the notifications to dispatch.
 *
 * FLOW : sample -> resolver thresholds -> alert policy -> reconciler -> filter tick
 *        classifier result -> epoch check -> resolver merge
 */

use crate::alerts::{AlertCondition, AlertCooldownLedger, AlertKind, AlertPolicy, Evaluation, Notification};
use crate::catalog::{ProduceCatalog, ThresholdSet};
use crate::classifier::{ClassificationOutcome, Classifier};
use crate::control::{
    camera_state, reconcile, ActuatorState, Channel, ChannelState, ChannelStatus, ConsumableHealth, FilterLevel,
    ScrubberTransition,
};
use crate::error::KernelResult;
use crate::models::{HistorySummary, MetricsSample, SampleHistory};
use crate::resolver::{MergeOutcome, ProduceProfile, ThresholdResolver};
use crate::state::{new_state, Shared};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: AlertPolicy,
    pub recipients: Vec<String>,
    pub history_capacity: usize,
    pub initial_filter_percent: f64,
    pub camera_stale_after: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: AlertPolicy::default(),
            recipients: Vec::new(),
            history_capacity: 50,
            initial_filter_percent: 100.0,
            camera_stale_after: Duration::minutes(5),
        }
    }
}

struct ColdStoreState {
    resolver: ThresholdResolver,
    actuators: ActuatorState,
    consumable: ConsumableHealth,
    ledger: AlertCooldownLedger,
    history: SampleHistory,
    last_evaluation: Option<Evaluation>,
    last_detection: Option<DetectionRecord>,
    last_snapshot_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub sample: MetricsSample,
    pub profile_type: String,
    pub thresholds: ThresholdSet,
    pub evaluation: Evaluation,
    pub actuators: ActuatorState,
    pub consumable: ConsumableHealth,
    pub transition: Option<ScrubberTransition>,
    #[serde(skip)]
    pub notifications: Vec<Notification>,
}

/// Captured when a classification starts; a manual action in between voids it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionTicket {
    epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetectionStatus {
    Merged { merge: MergeOutcome },
    Superseded,
    Unavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub label: Option<String>,
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub status: DetectionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProduceView {
    pub profile: ProduceProfile,
    pub last_detection: Option<DetectionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlsView {
    pub actuators: ActuatorState,
    pub filter: ConsumableHealth,
    pub filter_level: FilterLevel,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertsView {
    pub primary: Option<AlertCondition>,
    /// Out-of-range channels of the last cycle.
    pub by_kind: BTreeMap<AlertKind, AlertCondition>,
    pub cooldown: AlertCooldownLedger,
    pub cooldown_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
    pub samples: Vec<MetricsSample>,
    pub summary: HistorySummary,
}

#[derive(Clone)]
pub struct Engine {
    state: Shared<ColdStoreState>,
    catalog: Arc<ProduceCatalog>,
    policy: AlertPolicy,
    recipients: Arc<Vec<String>>,
    camera_stale_after: Duration,
}

impl Engine {
    pub fn new(catalog: Arc<ProduceCatalog>, settings: EngineSettings, now: OffsetDateTime) -> Self {
        let state = ColdStoreState {
            resolver: ThresholdResolver::new(catalog.clone(), now),
            actuators: ActuatorState::default(),
            consumable: ConsumableHealth::new(settings.initial_filter_percent),
            ledger: AlertCooldownLedger::default(),
            history: SampleHistory::new(settings.history_capacity),
            last_evaluation: None,
            last_detection: None,
            last_snapshot_at: None,
        };
        Self {
            state: new_state(state),
            catalog,
            policy: settings.policy,
            recipients: Arc::new(settings.recipients),
            camera_stale_after: settings.camera_stale_after,
        }
    }

    pub fn catalog(&self) -> &ProduceCatalog {
        &self.catalog
    }

    /// Validates a raw device payload and runs one cycle. A malformed payload
    /// leaves every piece of state untouched.
    pub fn ingest(&self, payload: &[u8], now: OffsetDateTime) -> KernelResult<CycleReport> {
        let sample = MetricsSample::from_slice(payload, now)?;
        Ok(self.run_cycle(sample))
    }

    pub fn run_cycle(&self, sample: MetricsSample) -> CycleReport {
        let mut st = self.state.lock();
        let st = &mut *st;

        let profile = st.resolver.current();
        let thresholds = profile.thresholds;
        let evaluation = self.policy.evaluate(&sample, &thresholds, &mut st.ledger);

        let camera = camera_state(st.last_snapshot_at, sample.captured_at, self.camera_stale_after);
        let reconciliation = reconcile(sample.voc, thresholds.voc_max, st.actuators, camera);
        st.actuators = reconciliation.state;
        if st.consumable.tick(st.actuators.scrubber.state == ChannelState::Active) {
            debug!(percent = st.consumable.percent_remaining, "filter medium degraded");
        }
        st.history.push(sample);
        st.last_evaluation = Some(evaluation.clone());

        match reconciliation.transition {
            Some(ScrubberTransition::Engaged) => info!(voc = sample.voc, voc_max = thresholds.voc_max, "scrubber engaged"),
            Some(ScrubberTransition::Released) => info!(voc = sample.voc, voc_max = thresholds.voc_max, "scrubber released"),
            None => {}
        }
        for kind in &evaluation.suppressed {
            debug!(kind = kind.as_str(), "notification suppressed by cooldown");
        }

        let notifications = evaluation
            .events
            .iter()
            .map(|event| Notification::for_event(event, profile.type_label(), &thresholds, &self.recipients))
            .collect();

        CycleReport {
            sample,
            profile_type: profile.type_label().to_string(),
            thresholds,
            evaluation,
            actuators: st.actuators,
            consumable: st.consumable,
            transition: reconciliation.transition,
            notifications,
        }
    }

    pub fn produce(&self) -> ProduceView {
        let st = self.state.lock();
        ProduceView { profile: st.resolver.current(), last_detection: st.last_detection.clone() }
    }

    pub fn set_manual_produce(&self, produce_id: &str, now: OffsetDateTime) -> KernelResult<ProduceProfile> {
        let profile = self.state.lock().resolver.set_manual(produce_id, now)?;
        info!(produce = profile.type_label(), "manual produce override set");
        Ok(profile)
    }

    pub fn clear_override(&self) -> ProduceProfile {
        let profile = self.state.lock().resolver.clear_override();
        info!(produce = profile.type_label(), "manual produce override cleared");
        profile
    }

    pub fn begin_detection(&self) -> DetectionTicket {
        DetectionTicket { epoch: self.state.lock().resolver.epoch() }
    }

    /// Applies a classifier result. Never fails: low confidence, unknown
    /// labels and unavailable services are recorded outcomes.
    pub fn on_detection(&self, ticket: DetectionTicket, outcome: ClassificationOutcome, now: OffsetDateTime) -> DetectionRecord {
        let mut st = self.state.lock();
        let record = match outcome {
            ClassificationOutcome::TimedOut => DetectionRecord {
                label: None,
                confidence: None,
                status: DetectionStatus::Unavailable { reason: "classifier timed out".into() },
                at: now,
            },
            ClassificationOutcome::Failed(reason) => DetectionRecord {
                label: None,
                confidence: None,
                status: DetectionStatus::Unavailable { reason },
                at: now,
            },
            ClassificationOutcome::Detected { label, confidence } => {
                let status = if ticket.epoch != st.resolver.epoch() {
                    DetectionStatus::Superseded
                } else {
                    let (merge, _) = st.resolver.merge_detection(label.as_deref(), confidence, now);
                    DetectionStatus::Merged { merge }
                };
                DetectionRecord { label, confidence: Some(confidence), status, at: now }
            }
        };
        st.last_detection = Some(record.clone());
        drop(st);

        match &record.status {
            DetectionStatus::Unavailable { reason } => warn!(%reason, "no detection performed"),
            DetectionStatus::Superseded => info!(label = ?record.label, "detection discarded, manual action happened meanwhile"),
            DetectionStatus::Merged { merge } => info!(label = ?record.label, confidence = ?record.confidence, ?merge, "detection processed"),
        }
        record
    }

    /// Runs the classifier off the request path and merges its result.
    pub fn spawn_detection(&self, classifier: Arc<dyn Classifier>, image: Vec<u8>) -> JoinHandle<DetectionRecord> {
        let ticket = self.begin_detection();
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = classifier.classify(image).await;
            engine.on_detection(ticket, outcome, OffsetDateTime::now_utc())
        })
    }

    pub fn note_snapshot(&self, now: OffsetDateTime) {
        let mut st = self.state.lock();
        st.last_snapshot_at = Some(now);
        st.actuators.camera.state = ChannelState::Active;
    }

    pub fn controls(&self) -> ControlsView {
        let st = self.state.lock();
        ControlsView { actuators: st.actuators, filter: st.consumable, filter_level: st.consumable.level() }
    }

    pub fn toggle_channel(&self, channel: Channel, active: bool) -> KernelResult<ChannelStatus> {
        let status = self.state.lock().actuators.toggle(channel, active)?;
        info!(channel = channel.as_str(), state = ?status.state, "channel switched manually");
        Ok(status)
    }

    pub fn release_channel(&self, channel: Channel) -> KernelResult<ChannelStatus> {
        let status = self.state.lock().actuators.release(channel)?;
        info!(channel = channel.as_str(), "channel returned to auto");
        Ok(status)
    }

    pub fn latest_sample(&self) -> Option<MetricsSample> {
        self.state.lock().history.latest().copied()
    }

    pub fn history(&self) -> HistoryView {
        let st = self.state.lock();
        HistoryView { samples: st.history.samples(), summary: st.history.summary() }
    }

    pub fn alerts(&self) -> AlertsView {
        let st = self.state.lock();
        let (primary, by_kind) = match &st.last_evaluation {
            Some(eval) => (
                eval.primary().cloned(),
                AlertKind::ALL
                    .into_iter()
                    .filter_map(|kind| eval.condition(kind).map(|c| (kind, c.clone())))
                    .collect(),
            ),
            None => (None, BTreeMap::new()),
        };
        AlertsView {
            primary,
            by_kind,
            cooldown: st.ledger.clone(),
            cooldown_minutes: self.policy.cooldown.whole_minutes(),
        }
    }

    /// Builds a diagnostic notification from the current state, bypassing the cooldown ledger.
    pub fn test_notification(&self, kind: AlertKind, now: OffsetDateTime) -> Notification {
        let st = self.state.lock();
        let profile = st.resolver.current();
        let current = st.history.latest().map(|s| match kind {
            AlertKind::Temperature => s.temperature,
            AlertKind::Humidity => s.humidity,
            AlertKind::Voc => s.voc,
        });
        Notification::test(kind, current, profile.type_label(), &profile.thresholds, &self.recipients, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Direction, Severity};
    use crate::control::ControlMode;
    use crate::error::KernelError;
    use serde_json::json;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn engine() -> Engine {
        let settings = EngineSettings { recipients: vec!["ops@example.com".into()], ..EngineSettings::default() };
        Engine::new(Arc::new(ProduceCatalog::builtin()), settings, T0)
    }

    fn payload(temperature: f64, humidity: f64, voc: f64) -> Vec<u8> {
        json!({
            "temperature": { "value": temperature },
            "humidity": { "value": humidity },
            "vocs": { "value": voc }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_end_to_end_apples_scenario() {
        let engine = engine();
        let profile = engine.set_manual_produce("apples", T0).unwrap();
        assert_eq!(engine.produce().profile.thresholds.voc_max, 30_000.0);
        assert!(profile.is_manual_override);

        let first = engine.ingest(&payload(2.0, 92.0, 35_000.0), T0 + Duration::seconds(5)).unwrap();
        assert_eq!(first.evaluation.events.len(), 1);
        let event = &first.evaluation.events[0].condition;
        assert_eq!(event.kind, AlertKind::Voc);
        assert_eq!(event.direction, Direction::TooHigh);
        assert_eq!(first.notifications.len(), 1);
        assert_eq!(first.notifications[0].recipients, vec!["ops@example.com".to_string()]);
        assert_eq!(first.transition, Some(ScrubberTransition::Engaged));
        assert_eq!(first.actuators.scrubber.state, ChannelState::Active);

        let second = engine.ingest(&payload(2.0, 92.0, 34_000.0), T0 + Duration::seconds(10)).unwrap();
        assert!(second.notifications.is_empty());
        assert_eq!(second.evaluation.suppressed, vec![AlertKind::Voc]);
        assert_eq!(second.actuators.scrubber.state, ChannelState::Active);
        assert_eq!(second.transition, None);

        let alerts = engine.alerts();
        assert_eq!(alerts.primary.unwrap().severity, Severity::Err);
        assert_eq!(alerts.by_kind.keys().copied().collect::<Vec<_>>(), vec![AlertKind::Voc]);
    }

    #[test]
    fn test_malformed_sample_keeps_state() {
        let engine = engine();
        engine.ingest(&payload(3.0, 92.0, 35_000.0), T0).unwrap();
        let before = engine.controls();

        let bad = json!({ "temperature": { "value": "warm" }, "humidity": { "value": 90 }, "vocs": { "value": 1 } });
        let err = engine.ingest(bad.to_string().as_bytes(), T0 + Duration::seconds(5)).unwrap_err();
        assert!(matches!(err, KernelError::MalformedSample(_)));

        let after = engine.controls();
        assert_eq!(after.actuators, before.actuators);
        assert_eq!(after.filter, before.filter);
        assert_eq!(engine.history().samples.len(), 1);
        assert_eq!(engine.latest_sample().unwrap().voc, 35_000.0);
    }

    #[test]
    fn test_detection_merges_when_no_override() {
        let engine = engine();
        let ticket = engine.begin_detection();
        let outcome = ClassificationOutcome::Detected { label: Some("tomatoes".into()), confidence: 0.51 };
        let record = engine.on_detection(ticket, outcome, T0);
        assert_eq!(record.status, DetectionStatus::Merged { merge: MergeOutcome::Applied });
        assert_eq!(engine.produce().profile.produce_type.as_deref(), Some("tomatoes"));
        assert_eq!(engine.produce().last_detection, Some(record));
    }

    #[test]
    fn test_manual_action_voids_inflight_detection() {
        let engine = engine();
        let ticket = engine.begin_detection();
        engine.set_manual_produce("potatoes", T0).unwrap();
        engine.clear_override();

        let outcome = ClassificationOutcome::Detected { label: Some("apples".into()), confidence: 0.99 };
        let record = engine.on_detection(ticket, outcome, T0);
        assert_eq!(record.status, DetectionStatus::Superseded);
        assert_eq!(engine.produce().profile.produce_type.as_deref(), Some("potatoes"));

        // a detection started after the manual actions is accepted again
        let ticket = engine.begin_detection();
        let outcome = ClassificationOutcome::Detected { label: Some("apples".into()), confidence: 0.99 };
        engine.on_detection(ticket, outcome, T0);
        assert_eq!(engine.produce().profile.produce_type.as_deref(), Some("apples"));
    }

    #[test]
    fn test_override_blocks_detection() {
        let engine = engine();
        engine.set_manual_produce("apples", T0).unwrap();
        let before = engine.produce().profile;
        let ticket = engine.begin_detection();
        let outcome = ClassificationOutcome::Detected { label: Some("tomatoes".into()), confidence: 0.99 };
        let record = engine.on_detection(ticket, outcome, T0 + Duration::minutes(1));
        assert_eq!(record.status, DetectionStatus::Merged { merge: MergeOutcome::ManualOverrideActive });
        assert_eq!(engine.produce().profile, before);
    }

    #[test]
    fn test_unavailable_classifier_changes_nothing() {
        let engine = engine();
        let before = engine.produce().profile;
        let ticket = engine.begin_detection();
        let record = engine.on_detection(ticket, ClassificationOutcome::TimedOut, T0);
        assert!(matches!(record.status, DetectionStatus::Unavailable { .. }));
        let record = engine.on_detection(ticket, ClassificationOutcome::Failed("503".into()), T0);
        assert!(matches!(record.status, DetectionStatus::Unavailable { reason } if reason == "503"));
        assert_eq!(engine.produce().profile, before);
    }

    #[test]
    fn test_manual_scrubber_is_respected_by_cycle() {
        let engine = engine();
        engine.toggle_channel(Channel::Scrubber, false).unwrap();
        let report = engine.ingest(&payload(3.0, 90.0, 90_000.0), T0).unwrap();
        assert_eq!(report.actuators.scrubber.state, ChannelState::Standby);
        assert_eq!(report.actuators.scrubber.mode, ControlMode::Manual);
        // the operator still gets told, without claiming the scrubber runs
        assert_eq!(report.notifications.len(), 1);
        assert!(!report.evaluation.conditions[0].message.contains("scrubber"));

        engine.release_channel(Channel::Scrubber).unwrap();
        let report = engine.ingest(&payload(3.0, 90.0, 90_000.0), T0 + Duration::seconds(5)).unwrap();
        assert_eq!(report.actuators.scrubber.state, ChannelState::Active);
    }

    #[test]
    fn test_filter_wears_only_while_scrubbing() {
        let engine = engine();
        for i in 0..10 {
            engine.ingest(&payload(3.0, 90.0, 1_000.0), T0 + Duration::seconds(i)).unwrap();
        }
        assert_eq!(engine.controls().filter.cumulative_active_ticks, 0);

        for i in 10..20 {
            engine.ingest(&payload(3.0, 90.0, 40_000.0), T0 + Duration::seconds(i)).unwrap();
        }
        let controls = engine.controls();
        assert_eq!(controls.filter.cumulative_active_ticks, 10);
        assert!((controls.filter.percent_remaining - 99.9).abs() < 1e-9);
    }

    #[test]
    fn test_camera_follows_snapshots() {
        let engine = engine();
        assert_eq!(engine.controls().actuators.camera.state, ChannelState::Standby);
        engine.note_snapshot(T0);
        assert_eq!(engine.controls().actuators.camera.state, ChannelState::Active);
        let report = engine.ingest(&payload(3.0, 90.0, 0.0), T0 + Duration::minutes(10)).unwrap();
        assert_eq!(report.actuators.camera.state, ChannelState::Offline);
    }

    #[test]
    fn test_test_notification_bypasses_cooldown() {
        let engine = engine();
        engine.ingest(&payload(9.0, 90.0, 0.0), T0).unwrap();
        let ledger_before = engine.alerts().cooldown.last_sent(AlertKind::Temperature);

        let n = engine.test_notification(AlertKind::Temperature, T0 + Duration::seconds(1));
        assert!(n.test);
        assert!(n.body.contains("Current Temperature: 9°C"));
        assert_eq!(engine.alerts().cooldown.last_sent(AlertKind::Temperature), ledger_before);
    }

    #[tokio::test]
    async fn test_spawned_detection_applies_result() {
        struct Fixed;
        #[async_trait::async_trait]
        impl Classifier for Fixed {
            async fn classify(&self, _image: Vec<u8>) -> ClassificationOutcome {
                ClassificationOutcome::Detected { label: Some("potatoes".into()), confidence: 0.9 }
            }
        }

        let engine = engine();
        let record = engine.spawn_detection(Arc::new(Fixed), vec![1, 2, 3]).await.unwrap();
        assert_eq!(record.status, DetectionStatus::Merged { merge: MergeOutcome::Applied });
        assert_eq!(engine.produce().profile.thresholds.temperature.min, 7.0);
    }
}
