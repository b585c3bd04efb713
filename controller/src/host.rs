use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use chrono_tz::Tz;
use heating_common::{
    entity_from_state_topic, is_service_result_topic, snapshot_topic, ConfigEntry, RuntimeConfig,
    TOPIC_CMD_REFRESH, TOPIC_CMD_SCHEDULE_ENABLED, TOPIC_SERVICE_RESULT_WILDCARD,
    TOPIC_STATE_WILDCARD,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    api,
    coordinator::{Coordinator, CoordinatorHandle},
    mqtt_bridge::MqttBridge,
    service::{self, Instances, ScheduleEnabledRequest},
    store::AppStore,
};

#[derive(Clone)]
pub struct AppState {
    pub instances: Arc<Instances>,
    pub store: AppStore,
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 16 * 1024;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.controller.sanitize();

    let timezone = runtime.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = %runtime.timezone, "unknown timezone, falling back to UTC");
        chrono_tz::UTC
    });

    let mut entries = store.load_entries().await.unwrap_or_else(|err| {
        warn!("failed to load configuration entries from store: {err:#}");
        Vec::new()
    });
    if entries.is_empty() {
        warn!("no configuration entries found, nothing will be controlled");
    }
    for entry in &mut entries {
        entry.config.sanitize();
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options(&runtime), 64);
    let bridge = Arc::new(MqttBridge::new(
        mqtt.clone(),
        runtime.controller.command_timeout(),
    ));

    let handles: Vec<CoordinatorHandle> = entries
        .into_iter()
        .map(|entry| spawn_coordinator(entry, &bridge, &runtime, timezone, &mqtt))
        .collect();

    let app_state = AppState {
        instances: Arc::new(Instances::new(handles)),
        store,
    };

    spawn_mqtt_loop(app_state.clone(), bridge, mqtt, eventloop);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, api::router(app_state)).await?;
    Ok(())
}

fn mqtt_options(runtime: &RuntimeConfig) -> MqttOptions {
    let network = &runtime.network;
    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(network.mqtt_port);

    let mut options = MqttOptions::new(network.mqtt_client_id.clone(), mqtt_host, mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        options.set_credentials(mqtt_user, mqtt_pass);
    }
    options
}

fn spawn_coordinator(
    entry: ConfigEntry,
    bridge: &Arc<MqttBridge>,
    runtime: &RuntimeConfig,
    timezone: Tz,
    mqtt: &AsyncClient,
) -> CoordinatorHandle {
    info!(
        entry_id = %entry.entry_id,
        schedules = entry.config.schedules.len(),
        devices = entry.config.climate_devices.len(),
        "starting heating coordinator"
    );
    let (coordinator, handle) =
        Coordinator::new(entry, bridge.clone(), runtime.controller.clone(), timezone);
    tokio::spawn(coordinator.run());
    spawn_snapshot_publish_loop(handle.clone(), mqtt.clone());
    handle
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [
        TOPIC_STATE_WILDCARD,
        TOPIC_SERVICE_RESULT_WILDCARD,
        TOPIC_CMD_REFRESH,
        TOPIC_CMD_SCHEDULE_ENABLED,
    ] {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(
    app_state: AppState,
    bridge: Arc<MqttBridge>,
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &bridge, &message.topic, &message.payload)
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    bridge.set_connected(true);
                    // Subscriptions are not persistent across clean sessions.
                    if let Err(err) = subscribe_topics(&mqtt).await {
                        warn!("mqtt subscribe failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    bridge.set_connected(false);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_snapshot_publish_loop(handle: CoordinatorHandle, mqtt: AsyncClient) {
    tokio::spawn(async move {
        let topic = snapshot_topic(&handle.entry_id);
        let mut updates = handle.subscribe();

        while updates.changed().await.is_ok() {
            let payload = {
                let current = updates.borrow_and_update();
                current.as_ref().map(serde_json::to_vec)
            };

            match payload {
                Some(Ok(body)) => {
                    if let Err(err) = mqtt.publish(&topic, QoS::AtLeastOnce, true, body).await {
                        warn!(entry_id = %handle.entry_id, "snapshot publish failed: {err}");
                    }
                }
                Some(Err(err)) => {
                    warn!(entry_id = %handle.entry_id, "snapshot serialization failed: {err}");
                }
                None => {}
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    bridge: &MqttBridge,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    if is_service_result_topic(topic) {
        bridge
            .apply_service_reply(payload)
            .await
            .context("invalid service reply")?;
        return Ok(());
    }

    if let Some(entity_id) = entity_from_state_topic(topic) {
        bridge.apply_state_message(entity_id, payload).await;
        return Ok(());
    }

    match topic {
        TOPIC_CMD_REFRESH => {
            let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
            let entry_id = Some(message.trim()).filter(|id| !id.is_empty());
            service::refresh(&app_state.instances, entry_id, false)?;
        }
        TOPIC_CMD_SCHEDULE_ENABLED => {
            let request: ScheduleEnabledRequest =
                serde_json::from_slice(payload).context("invalid schedule enable request")?;
            service::set_schedule_enabled(&app_state.instances, &app_state.store, &request).await?;
        }
        _ => {}
    }

    Ok(())
}
