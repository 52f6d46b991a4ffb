//! MQTT publisher for windowed counts
//!
//! Publishes each count as JSON on `mqtt.output_topic` with QoS 1.

use crate::domain::types::WindowedCount;
use crate::infra::config::Config;
use crate::io::codec::encode_count;
use crate::io::mqtt::mqtt_options;
use crate::io::sink::CountSink;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct MqttCountPublisher {
    client: AsyncClient,
    topic: String,
    eventloop: JoinHandle<()>,
}

impl MqttCountPublisher {
    /// Create a publisher connected to the configured MQTT host/port
    ///
    /// The eventloop runs on its own task until the publisher is flushed.
    pub fn new(config: &Config) -> Self {
        let client_id = format!("{}-sink-{}", config.service_id(), std::process::id());
        let mut mqttoptions = mqtt_options(config, client_id);
        mqttoptions.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        let eventloop = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_sink_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_sink_puback");
                    }
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        debug!("mqtt_sink_disconnected");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_sink_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, topic: config.mqtt_output_topic().to_string(), eventloop }
    }
}

#[async_trait]
impl CountSink for MqttCountPublisher {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn write(&mut self, count: &WindowedCount) -> anyhow::Result<()> {
        let json = encode_count(count)?;
        // QoS 1: at-least-once delivery for counts
        self.client.publish(&self.topic, QoS::AtLeastOnce, false, json.into_bytes()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.client.disconnect().await?;
        // Give the eventloop a moment to drain queued publishes
        if tokio::time::timeout(Duration::from_secs(5), &mut self.eventloop).await.is_err() {
            warn!("mqtt_sink_drain_timeout");
            self.eventloop.abort();
        }
        Ok(())
    }
}
