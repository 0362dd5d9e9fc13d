//! MQTT sink for scheduled outputs (`<prefix>/scheduled/output@v1`).

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::ScheduledOutput;
use crate::scheduler::Notifier;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::task;
use tracing::{info, warn};

pub fn scheduled_output_topic(prefix: &str) -> String {
    format!("{}/scheduled/output@v1", prefix.trim_end_matches('/'))
}

#[derive(Serialize)]
struct ScheduledOutputMessage<'a> {
    target: &'a str,
    #[serde(flatten)]
    output: &'a ScheduledOutput,
}

fn encode(target: &str, output: &ScheduledOutput) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&ScheduledOutputMessage { target, output })
}

pub struct MqttNotifier {
    client: AsyncClient,
    topic: String,
}

impl MqttNotifier {
    /// Creates the client and spawns its event loop. The loop reconnects on
    /// its own; status changes are reported to the health tracker.
    pub fn spawn(conf: &MqttConf, health: HealthTracker) -> Self {
        let client_id = format!("labdash-kernel-{}", uuid::Uuid::new_v4().simple());
        let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        let broker = format!("{}:{}", conf.host, conf.port);
        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected to {broker}");
                        health.mark_mqtt_connected();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}");
                        health.increment_mqtt_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client, topic: scheduled_output_topic(&conf.topic_prefix) }
    }
}

#[async_trait]
impl Notifier for MqttNotifier {
    async fn scheduled_output(&self, target: &str, output: &ScheduledOutput) -> anyhow::Result<()> {
        let payload = encode(target, output)?;
        // never waits on a disconnected broker
        self.client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_topic() {
        assert_eq!(scheduled_output_topic("labdash"), "labdash/scheduled/output@v1");
        assert_eq!(scheduled_output_topic("lab/"), "lab/scheduled/output@v1");
    }

    #[test]
    fn test_payload_is_flat() {
        let output = ScheduledOutput {
            command_name: "sensors".into(),
            output: "temp1: +40.0C".into(),
            timestamp: datetime!(2024-05-01 12:00 UTC),
            exit_code: 0,
        };
        let json: serde_json::Value = serde_json::from_slice(&encode("dut-1", &output).unwrap()).unwrap();
        assert_eq!(json["target"], "dut-1");
        assert_eq!(json["command_name"], "sensors");
        assert_eq!(json["exit_code"], 0);
    }
}
