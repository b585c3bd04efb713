use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CLIMATE_DOMAIN: &str = "climate";
pub const SERVICE_SET_HVAC_MODE: &str = "set_hvac_mode";
pub const SERVICE_SET_TEMPERATURE: &str = "set_temperature";
pub const SERVICE_SET_FAN_MODE: &str = "set_fan_mode";

const STATE_HOME: &str = "home";
const STATE_UNAVAILABLE: &str = "unavailable";
const STATE_UNKNOWN: &str = "unknown";

/// Live state of one host entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.state.as_str(), STATE_UNAVAILABLE | STATE_UNKNOWN)
    }

    pub fn is_home(&self) -> bool {
        self.state == STATE_HOME
    }

    /// Whether the entity lists `fan_mode` in its `fan_modes` attribute.
    pub fn supports_fan_mode(&self, fan_mode: &str) -> bool {
        self.attributes
            .get("fan_modes")
            .and_then(Value::as_array)
            .is_some_and(|modes| modes.iter().any(|mode| mode.as_str() == Some(fan_mode)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host connection is not established")]
    NotConnected,

    #[error("{domain}.{service} timed out")]
    Timeout { domain: String, service: String },

    #[error("{domain}.{service} failed: {reason}")]
    ServiceFailed {
        domain: String,
        service: String,
        reason: String,
    },

    #[error("invalid service payload: {0}")]
    InvalidPayload(String),
}

/// What the heating engine needs from the home-automation host.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Current state of `entity_id`, `None` when the host does not know it.
    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HostError>;

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        payload: Value,
        blocking: bool,
    ) -> Result<(), HostError>;
}

#[cfg(test)]
pub mod fake {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct ServiceCall {
        pub domain: String,
        pub service: String,
        pub payload: Value,
    }

    impl ServiceCall {
        pub fn entity_id(&self) -> &str {
            self.payload
                .get("entity_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Fault {
        /// The call never returns.
        Hang,
        Fail,
    }

    /// In-memory host recording every service call.
    #[derive(Debug, Default)]
    pub struct FakeHost {
        states: Mutex<HashMap<String, EntityState>>,
        calls: Mutex<Vec<ServiceCall>>,
        faults: Mutex<HashMap<(String, String), Fault>>,
        disconnected: AtomicBool,
    }

    impl FakeHost {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_state(&self, entity_id: &str, state: EntityState) {
            self.states
                .lock()
                .unwrap()
                .insert(entity_id.to_string(), state);
        }

        pub fn set_climate(&self, entity_id: &str, state: &str, fan_modes: &[&str]) {
            let mut entity = EntityState::new(state);
            entity
                .attributes
                .insert("fan_modes".to_string(), serde_json::json!(fan_modes));
            self.set_state(entity_id, entity);
        }

        pub fn fault(&self, entity_id: &str, service: &str, fault: Fault) {
            self.faults
                .lock()
                .unwrap()
                .insert((entity_id.to_string(), service.to_string()), fault);
        }

        pub fn clear_faults(&self) {
            self.faults.lock().unwrap().clear();
        }

        pub fn set_connected(&self, connected: bool) {
            self.disconnected.store(!connected, Ordering::SeqCst);
        }

        pub fn take_calls(&self) -> Vec<ServiceCall> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }

        /// `(entity_id, service)` pairs in call order.
        pub fn take_call_names(&self) -> Vec<(String, String)> {
            self.take_calls()
                .into_iter()
                .map(|call| (call.entity_id().to_string(), call.service))
                .collect()
        }
    }

    #[async_trait]
    impl HostApi for FakeHost {
        async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HostError> {
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(HostError::NotConnected);
            }
            Ok(self.states.lock().unwrap().get(entity_id).cloned())
        }

        async fn call_service(
            &self,
            domain: &str,
            service: &str,
            payload: Value,
            _blocking: bool,
        ) -> Result<(), HostError> {
            let call = ServiceCall {
                domain: domain.to_string(),
                service: service.to_string(),
                payload,
            };
            let key = (call.entity_id().to_string(), service.to_string());
            self.calls.lock().unwrap().push(call);

            let fault = self.faults.lock().unwrap().get(&key).copied();
            match fault {
                Some(Fault::Hang) => std::future::pending().await,
                Some(Fault::Fail) => Err(HostError::ServiceFailed {
                    domain: domain.to_string(),
                    service: service.to_string(),
                    reason: "scripted failure".to_string(),
                }),
                None => Ok(()),
            }
        }
    }
}
