use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use heating_common::service_topic;
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::debug;

use crate::entity::{EntityState, HostApi, HostError};

/// Reply published by whatever executes a blocking service call.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceReply {
    pub request_id: u64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Host adapter over MQTT. Entity states are cached from retained
/// `heating/state/<entity_id>` messages; service calls are published as JSON.
///
/// A blocking call carries a `request_id` and waits for a matching reply on
/// `heating/service/<domain>/<service>/result`.
pub struct MqttBridge {
    client: AsyncClient,
    states: RwLock<HashMap<String, EntityState>>,
    connected: AtomicBool,
    reply_timeout: Duration,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServiceReply>>>,
}

impl MqttBridge {
    pub fn new(client: AsyncClient, reply_timeout: Duration) -> Self {
        Self {
            client,
            states: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            reply_timeout,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Updates the cache from one state message. An empty payload forgets the
    /// entity; a payload that is not a state object is taken as a bare state.
    pub async fn apply_state_message(&self, entity_id: &str, payload: &[u8]) {
        if payload.is_empty() {
            debug!(entity_id, "entity removed");
            self.states.write().await.remove(entity_id);
            return;
        }

        let state = serde_json::from_slice::<EntityState>(payload).unwrap_or_else(|_| {
            EntityState::new(String::from_utf8_lossy(payload).trim().to_string())
        });
        self.states.write().await.insert(entity_id.to_string(), state);
    }

    /// Hands a service reply to the call waiting for it.
    pub async fn apply_service_reply(&self, payload: &[u8]) -> Result<(), serde_json::Error> {
        let reply: ServiceReply = serde_json::from_slice(payload)?;
        match self.pending.lock().await.remove(&reply.request_id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => debug!(request_id = reply.request_id, "reply for unknown or expired request"),
        }
        Ok(())
    }

    async fn publish(&self, topic: String, body: Vec<u8>, blocking: bool) -> Result<(), rumqttc::ClientError> {
        if blocking {
            self.client.publish(topic, QoS::AtLeastOnce, false, body).await
        } else {
            self.client.try_publish(topic, QoS::AtLeastOnce, false, body)
        }
    }
}

#[async_trait]
impl HostApi for MqttBridge {
    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HostError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(HostError::NotConnected);
        }
        Ok(self.states.read().await.get(entity_id).cloned())
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        mut payload: Value,
        blocking: bool,
    ) -> Result<(), HostError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(HostError::NotConnected);
        }
        let failed = |reason: String| HostError::ServiceFailed {
            domain: domain.to_string(),
            service: service.to_string(),
            reason,
        };

        let topic = service_topic(domain, service);
        if !blocking {
            let body = serde_json::to_vec(&payload)
                .map_err(|err| HostError::InvalidPayload(err.to_string()))?;
            return self
                .publish(topic, body, false)
                .await
                .map_err(|err| failed(err.to_string()));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let Some(fields) = payload.as_object_mut() else {
            return Err(HostError::InvalidPayload(
                "service payload must be a JSON object".to_string(),
            ));
        };
        fields.insert("request_id".to_string(), Value::from(request_id));
        let body =
            serde_json::to_vec(&payload).map_err(|err| HostError::InvalidPayload(err.to_string()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        if let Err(err) = self.publish(topic, body, true).await {
            self.pending.lock().await.remove(&request_id);
            return Err(failed(err.to_string()));
        }

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(reply)) if reply.success => Ok(()),
            Ok(Ok(reply)) => Err(failed(
                reply.error.unwrap_or_else(|| "service reported failure".to_string()),
            )),
            Ok(Err(_)) => Err(failed("reply channel closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(HostError::Timeout {
                    domain: domain.to_string(),
                    service: service.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rumqttc::{EventLoop, MqttOptions};
    use serde_json::json;

    // The event loop owns the request queue, so tests keep it alive.
    fn bridge() -> (MqttBridge, EventLoop) {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1883), 8);
        (MqttBridge::new(client, Duration::from_secs(10)), eventloop)
    }

    #[tokio::test]
    async fn caches_json_and_bare_states() {
        let (bridge, _eventloop) = bridge();
        bridge.set_connected(true);

        bridge
            .apply_state_message(
                "climate.office",
                br#"{"state": "heat", "attributes": {"fan_modes": ["auto"]}}"#,
            )
            .await;
        bridge.apply_state_message("device_tracker.anna", b"home\n").await;

        let office = bridge.get_state("climate.office").await.unwrap().unwrap();
        assert_eq!(office.state, "heat");
        assert!(office.supports_fan_mode("auto"));

        let tracker = bridge.get_state("device_tracker.anna").await.unwrap().unwrap();
        assert!(tracker.is_home());

        bridge.apply_state_message("climate.office", b"").await;
        assert_eq!(bridge.get_state("climate.office").await.unwrap(), None);
    }

    #[tokio::test]
    async fn disconnected_bridge_refuses_requests() {
        let (bridge, _eventloop) = bridge();

        assert_eq!(
            bridge.get_state("climate.office").await,
            Err(HostError::NotConnected)
        );
        assert_eq!(
            bridge
                .call_service("climate", "set_hvac_mode", json!({}), true)
                .await,
            Err(HostError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_call_without_reply_times_out() {
        let (bridge, _eventloop) = bridge();
        bridge.set_connected(true);

        let result = bridge
            .call_service("climate", "set_hvac_mode", json!({"hvac_mode": "heat"}), true)
            .await;

        assert_eq!(
            result,
            Err(HostError::Timeout {
                domain: "climate".to_string(),
                service: "set_hvac_mode".to_string(),
            })
        );
        assert!(bridge.pending.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_calls_complete_on_matching_replies() {
        let (bridge, _eventloop) = bridge();
        let bridge = Arc::new(bridge);
        bridge.set_connected(true);

        let reply = |body: &'static [u8]| {
            let bridge = bridge.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                bridge.apply_service_reply(body).await.unwrap();
            }
        };

        let (accepted, ()) = tokio::join!(
            bridge.call_service("climate", "set_temperature", json!({"temperature": 21.0}), true),
            reply(br#"{"request_id": 1, "success": true}"#),
        );
        assert_eq!(accepted, Ok(()));

        let (rejected, ()) = tokio::join!(
            bridge.call_service("climate", "set_fan_mode", json!({"fan_mode": "turbo"}), true),
            reply(br#"{"request_id": 2, "success": false, "error": "unsupported"}"#),
        );
        assert_eq!(
            rejected,
            Err(HostError::ServiceFailed {
                domain: "climate".to_string(),
                service: "set_fan_mode".to_string(),
                reason: "unsupported".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn stray_replies_are_ignored() {
        let (bridge, _eventloop) = bridge();
        bridge
            .apply_service_reply(br#"{"request_id": 42, "success": true}"#)
            .await
            .unwrap();
        assert!(bridge.apply_service_reply(b"not json").await.is_err());
    }
}
