use crate::error::{KernelError, KernelResult};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use time::OffsetDateTime;

/// One sensor push. Immutable once accepted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSample {
    pub temperature: f64,
    pub humidity: f64,
    pub voc: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

impl MetricsSample {
    pub fn new(temperature: f64, humidity: f64, voc: f64, captured_at: OffsetDateTime) -> Self {
        Self { temperature, humidity, voc, captured_at }
    }

    /// Parses the device payload `{temperature:{value}, humidity:{value}, vocs:{value}}`.
    /// Every channel must be a finite JSON number; strings are not coerced.
    pub fn from_json(payload: &Value, captured_at: OffsetDateTime) -> KernelResult<Self> {
        Ok(Self::new(
            read_channel(payload, "temperature")?,
            read_channel(payload, "humidity")?,
            read_channel(payload, "vocs")?,
            captured_at,
        ))
    }

    pub fn from_slice(bytes: &[u8], captured_at: OffsetDateTime) -> KernelResult<Self> {
        let payload: Value = serde_json::from_slice(bytes)
            .map_err(|e| KernelError::MalformedSample(format!("invalid JSON: {e}")))?;
        Self::from_json(&payload, captured_at)
    }
}

fn read_channel(payload: &Value, field: &str) -> KernelResult<f64> {
    let raw = payload
        .get(field)
        .and_then(|channel| channel.get("value"))
        .ok_or_else(|| KernelError::MalformedSample(format!("missing {field}.value")))?;
    let value = raw
        .as_f64()
        .ok_or_else(|| KernelError::MalformedSample(format!("{field}.value is not a number: {raw}")))?;
    if !value.is_finite() {
        return Err(KernelError::MalformedSample(format!("{field}.value is not finite")));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistorySummary {
    pub temperature: Option<ChannelSummary>,
    pub humidity: Option<ChannelSummary>,
    pub voc: Option<ChannelSummary>,
}

/// In-memory rolling window of accepted samples, oldest first.
#[derive(Debug, Clone)]
pub struct SampleHistory {
    capacity: usize,
    samples: VecDeque<MetricsSample>,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, samples: VecDeque::with_capacity(capacity) }
    }

    pub fn push(&mut self, sample: MetricsSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&MetricsSample> {
        self.samples.back()
    }

    pub fn samples(&self) -> Vec<MetricsSample> {
        self.samples.iter().copied().collect()
    }

    pub fn summary(&self) -> HistorySummary {
        HistorySummary {
            temperature: summarize(self.samples.iter().map(|s| s.temperature)),
            humidity: summarize(self.samples.iter().map(|s| s.humidity)),
            voc: summarize(self.samples.iter().map(|s| s.voc)),
        }
    }
}

fn summarize(values: impl Iterator<Item = f64>) -> Option<ChannelSummary> {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for v in values {
        count += 1;
        sum += v;
        min = min.min(v);
        max = max.max(v);
    }
    (count > 0).then(|| ChannelSummary { min, avg: sum / count as f64, max })
}
