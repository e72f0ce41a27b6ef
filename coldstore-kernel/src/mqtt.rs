use crate::config::MqttConf;
use crate::http::AppState;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::task::{self, JoinHandle};
use tracing::{error, info, warn};

/// Feeds samples published on the metrics topic into the same cycle as HTTP posts.
pub fn spawn_mqtt_listener(conf: MqttConf, app: AppState) -> JoinHandle<()> {
    task::spawn(async move {
        let mut opts = MqttOptions::new(conf.client_id.clone(), conf.host.clone(), conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        info!(host = %conf.host, port = conf.port, topic = %conf.topic, "MQTT ingestion enabled");

        loop {
            match eventloop.poll().await {
                // resubscribe on every session, the broker may have dropped it
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    app.health.mark_mqtt_connected();
                    if let Err(e) = client.subscribe(conf.topic.clone(), QoS::AtLeastOnce).await {
                        error!(error = ?e, topic = %conf.topic, "MQTT subscribe failed");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == conf.topic => {
                    // rejection is already counted and logged by ingest
                    let _ = app.ingest_bytes(&p.payload);
                }
                Ok(_) => {}
                Err(e) => {
                    app.health.increment_reconnects();
                    warn!(error = ?e, "MQTT connection error, retrying in 2s");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}
