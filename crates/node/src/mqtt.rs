//! MQTT transport. Sits outside the control core: inbound publishes are
//! handed over through a bounded channel, responses come back through
//! another, and neither side ever waits on the network for the other.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::dispatch::{Inbound, Response};

const ROOT: &str = "sensors";

/// Pause between reconnect attempts.
const RETRY: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// "sensors/<device>/<node_id>".
pub fn device_topic(device: &str, node_id: &str) -> String {
    format!("{ROOT}/{device}/{node_id}")
}

/// Every device topic addressed to this node.
pub fn command_filter(node_id: &str) -> String {
    device_topic("+", node_id)
}

/// Extract the device segment from "sensors/<device>/<node_id>", only when
/// addressed to `node_id`.
pub fn extract_device<'a>(topic: &'a str, node_id: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == ROOT && parts[2] == node_id && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

fn online_payload() -> Vec<u8> {
    json!({ "status": "online" }).to_string().into_bytes()
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

pub fn connect(cfg: &MqttConfig, node_id: &str) -> (AsyncClient, EventLoop) {
    let client_id = format!("sensor-node-{node_id}");
    let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    info!(host = %cfg.host, port = cfg.port, "mqtt configured");
    AsyncClient::new(options, 20)
}

/// Drive the connection until the publisher sends DISCONNECT. Subscribes on
/// every CONNACK and announces the node once.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    node_id: String,
    inbound: mpsc::Sender<Inbound>,
) {
    let filter = command_filter(&node_id);
    let mut announced = false;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = Inbound {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                };
                match inbound.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Full(m)) => {
                        warn!(topic = %m.topic, "inbound queue full, dropping message");
                    }
                    Err(TrySendError::Closed(m)) => {
                        debug!(topic = %m.topic, "node stopped, dropping message");
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                    error!("subscribe {filter} failed: {e}");
                }
                if !announced {
                    let topic = device_topic("info", &node_id);
                    match client.try_publish(topic, QoS::AtLeastOnce, false, online_payload()) {
                        Ok(()) => announced = true,
                        Err(e) => warn!("online announcement failed: {e}"),
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                sleep(RETRY).await;
            }
        }
    }
}

/// Publish queued responses until every sender is gone, then disconnect.
pub async fn run_publisher(client: AsyncClient, mut outbound: mpsc::Receiver<Response>) {
    while let Some(r) = outbound.recv().await {
        let payload = match serde_json::to_vec(&r.payload) {
            Ok(p) => p,
            Err(e) => {
                error!(topic = %r.topic, "response encode failed: {e}");
                continue;
            }
        };
        if let Err(e) = client.publish(&r.topic, QoS::AtMostOnce, false, payload).await {
            warn!(topic = %r.topic, "publish failed: {e}");
        }
    }
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- device_topic / command_filter --------------------------------------

    #[test]
    fn device_topic_layout() {
        assert_eq!(device_topic("info", "node-a"), "sensors/info/node-a");
    }

    #[test]
    fn command_filter_wildcards_device() {
        assert_eq!(command_filter("greenhouse-1"), "sensors/+/greenhouse-1");
    }

    // -- extract_device -----------------------------------------------------

    #[test]
    fn extract_device_valid_topic() {
        assert_eq!(extract_device("sensors/water/node-a", "node-a"), Some("water"));
    }

    #[test]
    fn extract_device_other_node() {
        assert_eq!(extract_device("sensors/water/node-b", "node-a"), None);
    }

    #[test]
    fn extract_device_wrong_prefix() {
        assert_eq!(extract_device("tele/water/node-a", "node-a"), None);
    }

    #[test]
    fn extract_device_too_few_segments() {
        assert_eq!(extract_device("sensors/node-a", "node-a"), None);
    }

    #[test]
    fn extract_device_too_many_segments() {
        assert_eq!(extract_device("sensors/water/node-a/set", "node-a"), None);
    }

    #[test]
    fn extract_device_empty_device() {
        assert_eq!(extract_device("sensors//node-a", "node-a"), None);
    }

    #[test]
    fn extract_device_empty_string() {
        assert_eq!(extract_device("", "node-a"), None);
    }

    #[test]
    fn extract_device_round_trips_device_topic() {
        let t = device_topic("led", "node-a");
        assert_eq!(extract_device(&t, "node-a"), Some("led"));
    }

    // -- payloads -----------------------------------------------------------

    #[test]
    fn online_payload_is_status_object() {
        let v: serde_json::Value = serde_json::from_slice(&online_payload()).unwrap();
        assert_eq!(v, json!({ "status": "online" }));
    }
}
