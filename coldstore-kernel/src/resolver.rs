/**
 * THRESHOLD RESOLVER - Active produce profile and its precedence rules
 *
 * Exactly one profile is active. Manual actions always win; automatic
 * detections only land while no override is set and above the acceptance
 * confidence. Every manual action bumps `epoch`, which lets the engine drop
 * classification results that were started before it.
 */

use crate::catalog::{normalize_id, ProduceCatalog, ThresholdSet};
use crate::error::{KernelError, KernelResult};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use time::OffsetDateTime;

/// Detections must be strictly above this confidence to be merged.
pub const ACCEPTANCE_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProduceProfile {
    #[serde(rename = "type", serialize_with = "serialize_type")]
    pub produce_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    pub is_manual_override: bool,
    pub confidence: Option<f64>,
    pub thresholds: ThresholdSet,
}

fn serialize_type<S: Serializer>(value: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(value.as_deref().unwrap_or("unknown"))
}

impl ProduceProfile {
    pub fn unknown(now: OffsetDateTime) -> Self {
        Self {
            produce_type: None,
            detected_at: now,
            is_manual_override: false,
            confidence: None,
            thresholds: ThresholdSet::FALLBACK,
        }
    }

    pub fn type_label(&self) -> &str {
        self.produce_type.as_deref().unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum MergeOutcome {
    Applied,
    ManualOverrideActive,
    LowConfidence,
    NoLabel,
    UnknownLabel(String),
}

pub struct ThresholdResolver {
    catalog: Arc<ProduceCatalog>,
    active: ProduceProfile,
    epoch: u64,
}

impl ThresholdResolver {
    pub fn new(catalog: Arc<ProduceCatalog>, now: OffsetDateTime) -> Self {
        Self { catalog, active: ProduceProfile::unknown(now), epoch: 0 }
    }

    pub fn current(&self) -> ProduceProfile {
        self.active.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_manual(&mut self, produce_id: &str, now: OffsetDateTime) -> KernelResult<ProduceProfile> {
        let thresholds = self
            .catalog
            .lookup(produce_id)
            .map_err(|_| KernelError::InvalidProduceType(produce_id.to_string()))?;
        self.active = ProduceProfile {
            produce_type: Some(normalize_id(produce_id)),
            detected_at: now,
            is_manual_override: true,
            confidence: None,
            thresholds,
        };
        self.epoch += 1;
        Ok(self.current())
    }

    /// Releases the operator lock but keeps the current type and thresholds
    /// until the next accepted detection.
    pub fn clear_override(&mut self) -> ProduceProfile {
        self.active.is_manual_override = false;
        self.epoch += 1;
        self.current()
    }

    pub fn merge_detection(
        &mut self,
        label: Option<&str>,
        confidence: f64,
        now: OffsetDateTime,
    ) -> (MergeOutcome, ProduceProfile) {
        if self.active.is_manual_override {
            return (MergeOutcome::ManualOverrideActive, self.current());
        }
        // NaN falls through here too
        if !(confidence > ACCEPTANCE_CONFIDENCE) {
            return (MergeOutcome::LowConfidence, self.current());
        }
        let Some(label) = label.map(str::trim).filter(|l| !l.is_empty()) else {
            return (MergeOutcome::NoLabel, self.current());
        };
        let Ok(thresholds) = self.catalog.lookup(label) else {
            return (MergeOutcome::UnknownLabel(label.to_string()), self.current());
        };
        self.active = ProduceProfile {
            produce_type: Some(normalize_id(label)),
            detected_at: now,
            is_manual_override: false,
            confidence: Some(confidence.min(1.0)),
            thresholds,
        };
        (MergeOutcome::Applied, self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);
    const T1: OffsetDateTime = datetime!(2024-05-01 12:05 UTC);

    fn resolver() -> ThresholdResolver {
        ThresholdResolver::new(Arc::new(ProduceCatalog::builtin()), T0)
    }

    #[test]
    fn test_default_profile_is_unknown_with_fallback() {
        let r = resolver();
        let p = r.current();
        assert_eq!(p.produce_type, None);
        assert_eq!(p.type_label(), "unknown");
        assert!(!p.is_manual_override);
        assert_eq!(p.thresholds, ThresholdSet::FALLBACK);
    }

    #[test]
    fn test_set_manual_rejects_unknown_type() {
        let mut r = resolver();
        let before = r.current();
        let err = r.set_manual("kiwi", T1).unwrap_err();
        assert!(matches!(err, KernelError::InvalidProduceType(id) if id == "kiwi"));
        assert_eq!(r.current(), before);
        assert_eq!(r.epoch(), 0);
    }

    #[test]
    fn test_set_manual_sets_override() {
        let mut r = resolver();
        let p = r.set_manual("Apples", T1).unwrap();
        assert_eq!(p.produce_type.as_deref(), Some("apples"));
        assert!(p.is_manual_override);
        assert_eq!(p.confidence, None);
        assert_eq!(p.detected_at, T1);
        assert_eq!(p.thresholds.voc_max, 30_000.0);
    }

    #[test]
    fn test_override_blocks_high_confidence_detection() {
        let mut r = resolver();
        r.set_manual("apples", T0).unwrap();
        let before = r.current();
        let (outcome, after) = r.merge_detection(Some("tomatoes"), 0.99, T1);
        assert_eq!(outcome, MergeOutcome::ManualOverrideActive);
        assert_eq!(after, before);

        let p = r.set_manual("potatoes", T1).unwrap();
        assert!(p.is_manual_override);
        assert_eq!(p.produce_type.as_deref(), Some("potatoes"));
    }

    #[test]
    fn test_confidence_floor_is_exclusive() {
        let mut r = resolver();
        let (outcome, p) = r.merge_detection(Some("tomatoes"), 0.49, T1);
        assert_eq!(outcome, MergeOutcome::LowConfidence);
        assert_eq!(p.produce_type, None);

        let (outcome, _) = r.merge_detection(Some("tomatoes"), 0.5, T1);
        assert_eq!(outcome, MergeOutcome::LowConfidence);

        let (outcome, p) = r.merge_detection(Some("tomatoes"), 0.51, T1);
        assert_eq!(outcome, MergeOutcome::Applied);
        assert_eq!(p.produce_type.as_deref(), Some("tomatoes"));
        assert_eq!(p.confidence, Some(0.51));
        assert!(!p.is_manual_override);
        assert_eq!(p.detected_at, T1);
    }

    #[test]
    fn test_unrecognized_or_missing_label_is_noop() {
        let mut r = resolver();
        let (outcome, p) = r.merge_detection(Some("bananas"), 0.9, T1);
        assert_eq!(outcome, MergeOutcome::UnknownLabel("bananas".into()));
        assert_eq!(p.produce_type, None);

        let (outcome, _) = r.merge_detection(None, 0.9, T1);
        assert_eq!(outcome, MergeOutcome::NoLabel);

        let (outcome, _) = r.merge_detection(Some("apples"), f64::NAN, T1);
        assert_eq!(outcome, MergeOutcome::LowConfidence);
    }

    #[test]
    fn test_clear_override_reenables_detection() {
        let mut r = resolver();
        r.set_manual("apples", T0).unwrap();
        let cleared = r.clear_override();
        assert!(!cleared.is_manual_override);
        assert_eq!(cleared.produce_type.as_deref(), Some("apples"));
        assert_eq!(r.epoch(), 2);

        let (outcome, p) = r.merge_detection(Some("potatoes"), 0.8, T1);
        assert_eq!(outcome, MergeOutcome::Applied);
        assert_eq!(p.thresholds.temperature.min, 7.0);
    }

    #[test]
    fn test_profile_serializes_unknown_type() {
        let json = serde_json::to_value(resolver().current()).unwrap();
        assert_eq!(json["type"], "unknown");
        assert_eq!(json["is_manual_override"], false);
    }
}
