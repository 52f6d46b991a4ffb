//! MQTT subscriber feeding raw event payloads into the pipeline

use crate::domain::types::Event;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::codec::accept_payload;
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Build client options from `[mqtt]`, shared by subscriber and publisher
pub(crate) fn mqtt_options(config: &Config, client_id: String) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_max_packet_size(1024 * 1024, 1024 * 1024);

    // Set credentials if configured
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }
    mqttoptions
}

/// Subscribe to the input topic and forward decoded events
///
/// Events are sent with `send().await`, so a full pipeline slows the
/// eventloop instead of dropping events. Returns on shutdown or when the
/// pipeline hangs up.
pub async fn start_mqtt_source(
    config: &Config,
    event_tx: mpsc::Sender<Event>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client_id = format!("{}-source", config.service_id());
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config, client_id), 100);
    client.subscribe(config.mqtt_input_topic(), QoS::AtLeastOnce).await?;

    info!(
        topic = %config.mqtt_input_topic(),
        host = %config.mqtt_host(),
        port = %config.mqtt_port(),
        "mqtt_source_subscribed"
    );

    loop {
        tokio::select! {
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_source_shutdown");
                    let _ = client.disconnect().await;
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        let Some(event) = accept_payload(&publish.payload, &metrics) else {
                            continue;
                        };
                        if event_tx.send(event).await.is_err() {
                            info!("mqtt_source_pipeline_closed");
                            return Ok(());
                        }
                    }
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_source_connected");
                    }
                    Ok(MqttEvent::Incoming(Packet::SubAck(_))) => {
                        debug!("mqtt_source_suback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_source_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}
