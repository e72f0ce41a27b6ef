/**
 * COLDSTORE REST API - HTTP surface of the kernel
 *
 * ROLE : sensor ingestion, produce profile management, actuator control,
 * alert inspection and snapshot upload for the dashboard and devices.
 *
 * ROUTES :
 * - /health, /system/health
 * - /api/metrics (GET latest, POST sample), /api/metrics/history
 * - /api/produce (GET, POST manual set), /api/produce/override (DELETE)
 * - /api/catalog
 * - /api/controls, /api/controls/{channel}, /api/controls/{channel}/auto
 * - /api/alerts, /api/alerts/test/{kind}
 * - /api/upload-image, /api/snapshots
 *
 * Errors are returned as `{ok: false, error}` with the status of the KernelError.
 */

use crate::alerts::AlertKind;
use crate::classifier::Classifier;
use crate::control::Channel;
use crate::engine::{AlertsView, ControlsView, CycleReport, DetectionStatus, Engine, HistoryView, ProduceView};
use crate::error::{KernelError, KernelResult};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::MetricsSample;
use crate::notifier::NotificationDispatcher;
use crate::snapshots::{SnapshotInfo, SnapshotStore};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub health: HealthTracker,
    pub dispatcher: NotificationDispatcher,
    pub classifier: Arc<dyn Classifier>,
    pub snapshots: Arc<SnapshotStore>,
}

impl AppState {
    /// Single entry point for samples, shared by HTTP and MQTT ingestion.
    pub fn ingest_bytes(&self, body: &[u8]) -> KernelResult<CycleReport> {
        match self.engine.ingest(body, OffsetDateTime::now_utc()) {
            Ok(mut report) => {
                self.health.record_sample_accepted();
                self.dispatcher.dispatch_all(std::mem::take(&mut report.notifications));
                debug!(
                    temperature = report.sample.temperature,
                    humidity = report.sample.humidity,
                    voc = report.sample.voc,
                    alerts = report.evaluation.conditions.len(),
                    "sample evaluated"
                );
                Ok(report)
            }
            Err(e) => {
                self.health.record_rejection(&e.to_string());
                warn!(error = %e, "sample rejected");
                Err(e)
            }
        }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/metrics", get(get_latest_metrics).post(post_metrics))
        .route("/api/metrics/history", get(get_history))
        .route("/api/produce", get(get_produce).post(set_produce))
        .route("/api/produce/override", delete(clear_override))
        .route("/api/catalog", get(get_catalog))
        .route("/api/controls", get(get_controls))
        .route("/api/controls/{channel}", post(toggle_channel))
        .route("/api/controls/{channel}/auto", post(release_channel))
        .route("/api/alerts", get(get_alerts))
        .route("/api/alerts/test/{kind}", post(send_test_notification))
        .route("/api/upload-image", post(upload_image))
        .route("/api/snapshots", get(list_snapshots))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health())
}

// GET /api/metrics
async fn get_latest_metrics(State(app): State<AppState>) -> KernelResult<Json<MetricsSample>> {
    app.engine
        .latest_sample()
        .map(Json)
        .ok_or_else(|| KernelError::NotFound("no sample received yet".into()))
}

// POST /api/metrics
async fn post_metrics(State(app): State<AppState>, body: Bytes) -> KernelResult<Json<Value>> {
    let report = app.ingest_bytes(&body)?;
    Ok(Json(json!({ "ok": true, "cycle": report })))
}

async fn get_history(State(app): State<AppState>) -> Json<HistoryView> {
    Json(app.engine.history())
}

async fn get_produce(State(app): State<AppState>) -> Json<ProduceView> {
    Json(app.engine.produce())
}

#[derive(Debug, Deserialize)]
struct SetProduce {
    #[serde(rename = "type")]
    produce_type: String,
}

// POST /api/produce {"type": "apples"}
async fn set_produce(
    State(app): State<AppState>,
    req: Result<Json<SetProduce>, JsonRejection>,
) -> KernelResult<Json<Value>> {
    let Json(req) = req.map_err(|e| KernelError::InvalidProduceType(e.body_text()))?;
    let profile = app.engine.set_manual_produce(&req.produce_type, OffsetDateTime::now_utc())?;
    Ok(Json(json!({ "ok": true, "profile": profile })))
}

async fn clear_override(State(app): State<AppState>) -> Json<Value> {
    let profile = app.engine.clear_override();
    Json(json!({ "ok": true, "profile": profile }))
}

async fn get_catalog(State(app): State<AppState>) -> Json<Value> {
    let entries: BTreeMap<&String, Value> = app
        .engine
        .catalog()
        .entries()
        .iter()
        .map(|(id, entry)| (id, json!({ "entry": entry, "thresholds": entry.thresholds() })))
        .collect();
    Json(json!(entries))
}

async fn get_controls(State(app): State<AppState>) -> Json<ControlsView> {
    Json(app.engine.controls())
}

#[derive(Debug, Deserialize)]
struct ToggleChannel {
    active: bool,
}

// POST /api/controls/{channel} {"active": true}
async fn toggle_channel(
    State(app): State<AppState>,
    Path(channel): Path<String>,
    req: Result<Json<ToggleChannel>, JsonRejection>,
) -> KernelResult<Json<Value>> {
    let channel = Channel::parse(&channel)?;
    let Json(req) = req.map_err(|e| KernelError::InvalidRequest(e.body_text()))?;
    let status = app.engine.toggle_channel(channel, req.active)?;
    Ok(Json(json!({ "ok": true, "channel": channel, "status": status })))
}

async fn release_channel(State(app): State<AppState>, Path(channel): Path<String>) -> KernelResult<Json<Value>> {
    let channel = Channel::parse(&channel)?;
    let status = app.engine.release_channel(channel)?;
    Ok(Json(json!({ "ok": true, "channel": channel, "status": status })))
}

async fn get_alerts(State(app): State<AppState>) -> Json<AlertsView> {
    Json(app.engine.alerts())
}

// POST /api/alerts/test/{kind}; delivered inline, cooldown untouched
async fn send_test_notification(State(app): State<AppState>, Path(kind): Path<String>) -> KernelResult<Json<Value>> {
    let kind = AlertKind::parse(&kind).ok_or_else(|| KernelError::NotFound(format!("alert kind {kind}")))?;
    let notification = app.engine.test_notification(kind, OffsetDateTime::now_utc());
    app.dispatcher.deliver_now(&notification).await?;
    Ok(Json(json!({ "ok": true, "notification": notification })))
}

#[derive(Debug, Default, Deserialize)]
struct UploadParams {
    #[serde(default)]
    wait: bool,
}

// POST /api/upload-image (multipart field "image"); ?wait=true waits for the classifier
async fn upload_image(
    State(app): State<AppState>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> KernelResult<impl IntoResponse> {
    let mut image: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| KernelError::InvalidUpload(e.to_string()))?
    {
        if field.name() == Some("image") {
            image = Some(field.bytes().await.map_err(|e| KernelError::InvalidUpload(e.to_string()))?);
            break;
        }
    }
    let image = image
        .filter(|b| !b.is_empty())
        .ok_or_else(|| KernelError::InvalidUpload("missing image field".into()))?;

    let now = OffsetDateTime::now_utc();
    let snapshot = app.snapshots.store(&image, now).await?;
    app.engine.note_snapshot(now);

    let detection = app.engine.spawn_detection(app.classifier.clone(), image.to_vec());
    if !params.wait {
        let body = json!({ "ok": true, "snapshot": snapshot, "detection": "pending" });
        return Ok((StatusCode::ACCEPTED, Json(body)));
    }

    let record = detection
        .await
        .map_err(|e| KernelError::ClassificationUnavailable(e.to_string()))?;
    if let DetectionStatus::Unavailable { reason } = &record.status {
        return Err(KernelError::ClassificationUnavailable(reason.clone()));
    }
    let body = json!({ "ok": true, "snapshot": snapshot, "detection": record });
    Ok((StatusCode::OK, Json(body)))
}

async fn list_snapshots(State(app): State<AppState>) -> KernelResult<Json<Vec<SnapshotInfo>>> {
    Ok(Json(app.snapshots.list().await?))
}
