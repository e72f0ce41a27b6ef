/**
 * PRODUCE CATALOG - Static storage conditions per produce type
 *
 * ROLE : source of truth for threshold sets. Loaded once at startup (built-in
 * table or the `catalog` section of kernel.yaml), never mutated afterwards.
 *
 * Identifiers are a small closed set, matched case-insensitively.
 */

use crate::error::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inclusive range: a value equal to a bound is in range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub temperature: Range,
    pub humidity: Range,
    pub voc_max: f64,
}

impl ThresholdSet {
    /// Conservative set used while no produce type is known.
    pub const FALLBACK: ThresholdSet = ThresholdSet {
        temperature: Range::new(2.0, 4.0),
        humidity: Range::new(85.0, 95.0),
        voc_max: 28_000.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EthyleneSensitivity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceCatalogEntry {
    pub name: String,
    pub temperature: Range,
    pub humidity: Range,
    pub voc_threshold: f64,
    #[serde(default)]
    pub optimal_temperature: Option<f64>,
    #[serde(default)]
    pub optimal_humidity: Option<f64>,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: EthyleneSensitivity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub storage_life: String,
}

fn default_sensitivity() -> EthyleneSensitivity {
    EthyleneSensitivity::Medium
}

impl ProduceCatalogEntry {
    pub fn thresholds(&self) -> ThresholdSet {
        ThresholdSet {
            temperature: self.temperature,
            humidity: self.humidity,
            voc_max: self.voc_threshold,
        }
    }

    fn validate(&self, id: &str) -> KernelResult<()> {
        let ranges_ok = self.temperature.min <= self.temperature.max
            && self.humidity.min <= self.humidity.max;
        let finite = [
            self.temperature.min,
            self.temperature.max,
            self.humidity.min,
            self.humidity.max,
            self.voc_threshold,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !ranges_ok || !finite || self.voc_threshold <= 0.0 {
            return Err(KernelError::Config(format!("catalog entry '{id}' has invalid thresholds")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProduceCatalog {
    entries: BTreeMap<String, ProduceCatalogEntry>,
}

pub fn normalize_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

impl ProduceCatalog {
    /// Builds a catalog from configured entries. Rejects empty tables and
    /// inverted or non-finite ranges.
    pub fn from_entries(entries: BTreeMap<String, ProduceCatalogEntry>) -> KernelResult<Self> {
        if entries.is_empty() {
            return Err(KernelError::Config("catalog is empty".into()));
        }
        let mut normalized = BTreeMap::new();
        for (id, entry) in entries {
            let id = normalize_id(&id);
            entry.validate(&id)?;
            normalized.insert(id, entry);
        }
        Ok(Self { entries: normalized })
    }

    pub fn builtin() -> Self {
        let entries = [
            ("apples", entry("Apples", (0.0, 4.0, 2.0), (90.0, 95.0, 92.0), 30_000.0,
                EthyleneSensitivity::Medium,
                "Apples produce ethylene and require cold storage",
                "3-8 months at optimal conditions")),
            ("potatoes", entry("Potatoes", (7.0, 10.0, 8.0), (85.0, 90.0, 87.0), 30_000.0,
                EthyleneSensitivity::Medium,
                "Potatoes require cool, dark storage with good ventilation",
                "5-8 months at optimal conditions")),
            ("tomatoes", entry("Tomatoes", (10.0, 13.0, 12.0), (85.0, 95.0, 90.0), 25_000.0,
                EthyleneSensitivity::High,
                "Tomatoes ripen quickly under ethylene and are chill-sensitive",
                "1-3 weeks at optimal conditions")),
            ("mixed", entry("Mixed Produce", (2.0, 8.0, 5.0), (85.0, 95.0, 90.0), 28_000.0,
                EthyleneSensitivity::Medium,
                "Balanced settings for multiple produce types",
                "Varies by item")),
        ];
        Self {
            entries: entries.into_iter().map(|(id, e)| (id.to_string(), e)).collect(),
        }
    }

    pub fn lookup(&self, produce_id: &str) -> KernelResult<ThresholdSet> {
        self.entry(produce_id)
            .map(ProduceCatalogEntry::thresholds)
            .ok_or_else(|| KernelError::NotFound(produce_id.to_string()))
    }

    pub fn entry(&self, produce_id: &str) -> Option<&ProduceCatalogEntry> {
        self.entries.get(&normalize_id(produce_id))
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> &BTreeMap<String, ProduceCatalogEntry> {
        &self.entries
    }
}

fn entry(
    name: &str,
    temperature: (f64, f64, f64),
    humidity: (f64, f64, f64),
    voc_threshold: f64,
    sensitivity: EthyleneSensitivity,
    description: &str,
    storage_life: &str,
) -> ProduceCatalogEntry {
    ProduceCatalogEntry {
        name: name.to_string(),
        temperature: Range::new(temperature.0, temperature.1),
        humidity: Range::new(humidity.0, humidity.1),
        voc_threshold,
        optimal_temperature: Some(temperature.2),
        optimal_humidity: Some(humidity.2),
        sensitivity,
        description: description.to_string(),
        storage_life: storage_life.to_string(),
    }
}
