//! Client side of the produce classification service.
//!
//! The service receives a snapshot as multipart field `image` on `POST /detect`
//! and answers `{success, detected, confidence}`. Slow or broken services
//! degrade to [`ClassificationOutcome::TimedOut`] / [`ClassificationOutcome::Failed`].

use crate::error::{KernelError, KernelResult};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationOutcome {
    Detected { label: Option<String>, confidence: f64 },
    TimedOut,
    Failed(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: Vec<u8>) -> ClassificationOutcome;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    success: bool,
    detected: Option<String>,
    #[serde(default)]
    confidence: f64,
    error: Option<String>,
}

impl DetectResponse {
    fn into_outcome(self) -> ClassificationOutcome {
        if !self.success {
            return ClassificationOutcome::Failed(self.error.unwrap_or_else(|| "classifier reported failure".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return ClassificationOutcome::Failed(format!("invalid confidence {}", self.confidence));
        }
        ClassificationOutcome::Detected { label: self.detected, confidence: self.confidence }
    }
}

pub struct HttpClassifier {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> KernelResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| KernelError::Config(format!("classifier client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/detect", base_url.trim_end_matches('/')),
            timeout,
        })
    }

    async fn request(&self, image: Vec<u8>) -> Result<DetectResponse, reqwest::Error> {
        let part = Part::bytes(image).file_name("snapshot.jpg").mime_str("image/jpeg")?;
        let form = Form::new().part("image", part);
        self.client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json::<DetectResponse>()
            .await
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: Vec<u8>) -> ClassificationOutcome {
        match timeout(self.timeout, self.request(image)).await {
            Err(_) => ClassificationOutcome::TimedOut,
            Ok(Err(e)) if e.is_timeout() => ClassificationOutcome::TimedOut,
            Ok(Err(e)) => ClassificationOutcome::Failed(e.to_string()),
            Ok(Ok(body)) => body.into_outcome(),
        }
    }
}

/// Stands in when no classification service is configured.
pub struct DisabledClassifier;

#[async_trait]
impl Classifier for DisabledClassifier {
    async fn classify(&self, _image: Vec<u8>) -> ClassificationOutcome {
        ClassificationOutcome::Failed("classifier not configured".into())
    }
}
