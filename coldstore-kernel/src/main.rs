/**
 * COLDSTORE KERNEL - Cold-storage monitoring service entry point
 *
 * ROLE : wires config, catalog, engine, notification dispatcher, classifier
 * client, snapshot store, optional MQTT ingestion and the HTTP API.
 *
 * ARCHITECTURE : one owned engine state behind a lock; samples arrive over
 * HTTP or MQTT, notifications and classifications run in background tasks.
 */

mod alerts;
mod catalog;
mod classifier;
mod config;
mod control;
mod engine;
mod error;
mod health;
mod http;
mod logging;
mod models;
mod mqtt;
mod notifier;
mod resolver;
mod snapshots;
mod state;

use crate::catalog::ProduceCatalog;
use crate::classifier::{Classifier, DisabledClassifier, HttpClassifier};
use crate::config::load_config;
use crate::engine::{Engine, EngineSettings};
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::notifier::{LogNotifier, NotificationDispatcher, Notifier, WebhookNotifier};
use crate::snapshots::SnapshotStore;

use anyhow::Context;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let cfg = load_config().await;

    let catalog = match cfg.build_catalog() {
        Ok(catalog) => catalog,
        Err(e) => {
            error!(error = %e, "configured catalog rejected, using built-in table");
            ProduceCatalog::builtin()
        }
    };
    info!(produce = ?catalog.ids(), "catalog loaded");

    let health = HealthTracker::new(cfg.mqtt.is_some());

    let notifier: Arc<dyn Notifier> = match cfg.alerts.webhook_url.as_deref() {
        Some(url) => match WebhookNotifier::new(url, cfg.alerts.delivery_timeout()) {
            Ok(webhook) => Arc::new(webhook),
            Err(e) => {
                warn!(error = %e, "webhook transport unavailable, notifications go to the log");
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    };
    if cfg.alerts.recipients.is_empty() {
        warn!("no alert recipients configured");
    }
    let dispatcher = NotificationDispatcher::spawn(notifier, cfg.alerts.delivery_timeout(), health.clone());

    let classifier: Arc<dyn Classifier> = match cfg.classifier.url.as_deref() {
        Some(url) => match HttpClassifier::new(url, cfg.classifier.timeout()) {
            Ok(client) => {
                info!(%url, "produce classifier configured");
                Arc::new(client)
            }
            Err(e) => {
                warn!(error = %e, "classifier unavailable, detection disabled");
                Arc::new(DisabledClassifier)
            }
        },
        None => Arc::new(DisabledClassifier),
    };

    let snapshots = SnapshotStore::open(&cfg.snapshots.dir)
        .await
        .with_context(|| format!("opening snapshot dir {}", cfg.snapshots.dir))?;

    let settings = EngineSettings {
        policy: cfg.alerts.policy(),
        recipients: cfg.alerts.recipients.clone(),
        history_capacity: cfg.history.capacity,
        initial_filter_percent: cfg.consumable.initial_percent,
        camera_stale_after: time::Duration::seconds(cfg.camera.stale_after_secs.max(1)),
    };
    let engine = Engine::new(Arc::new(catalog), settings, OffsetDateTime::now_utc());

    let app_state = AppState {
        engine,
        health,
        dispatcher,
        classifier,
        snapshots: Arc::new(snapshots),
    };

    if let Some(mqtt_conf) = cfg.mqtt.clone() {
        mqtt::spawn_mqtt_listener(mqtt_conf, app_state.clone());
    }

    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app).await.context("HTTP server stopped")?;
    Ok(())
}
