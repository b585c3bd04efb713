use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use heating_common::{ControllerConfig, DeviceDecision, HvacMode};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::entity::{
    EntityState, HostApi, HostError, CLIMATE_DOMAIN, SERVICE_SET_FAN_MODE, SERVICE_SET_HVAC_MODE,
    SERVICE_SET_TEMPERATURE,
};

/// Result of one bounded service call.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Success,
    TimedOut,
    Failed(String),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Last commands issued to one device. Off devices carry no setpoint.
#[derive(Debug, Clone, PartialEq)]
struct CommandRecord {
    on: bool,
    hvac_mode: Option<HvacMode>,
    temperature: Option<f32>,
    fan: Option<String>,
}

impl CommandRecord {
    fn from_decision(decision: &DeviceDecision) -> Self {
        let on = decision.should_be_active;
        Self {
            on,
            hvac_mode: on.then_some(decision.hvac_mode),
            temperature: on.then_some(decision.target_temp),
            fan: on.then(|| decision.target_fan.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoundPlan {
    state_changed: bool,
    temp_changed: bool,
    fan_changed: bool,
}

impl RoundPlan {
    /// `previous` is `None` for unknown devices and for devices pending a
    /// forced resync, which makes every command due.
    fn new(decision: &DeviceDecision, previous: Option<&CommandRecord>, epsilon: f32) -> Self {
        let on = decision.should_be_active;
        let state_changed = match previous {
            None => true,
            Some(record) => record.on != on || (on && record.hvac_mode != Some(decision.hvac_mode)),
        };
        let previous_temp = previous.and_then(|record| record.temperature);
        let temp_changed = on
            && !matches!(previous_temp, Some(temp) if (temp - decision.target_temp).abs() <= epsilon);
        let fan_changed = on
            && !decision.target_fan.is_empty()
            && previous.and_then(|record| record.fan.as_deref()) != Some(decision.target_fan.as_str());

        Self {
            state_changed,
            temp_changed,
            fan_changed,
        }
    }

    fn is_noop(&self) -> bool {
        !self.state_changed && !self.temp_changed && !self.fan_changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundResult {
    Skipped,
    Unchanged,
    Applied,
    Failed,
}

/// Sequential command issuer for climate devices.
///
/// Devices are handled one at a time: mode, settle, setpoint, fan, final
/// settle. A device whose round hit a timeout or error is resynced in full on
/// its next round; one that was skipped as unavailable still owes a round.
pub struct ClimateController {
    host: Arc<dyn HostApi>,
    config: ControllerConfig,
    history: HashMap<String, CommandRecord>,
    force_resync: BTreeSet<String>,
    unavailable: BTreeSet<String>,
}

impl ClimateController {
    pub fn new(host: Arc<dyn HostApi>, config: ControllerConfig) -> Self {
        Self {
            host,
            config,
            history: HashMap::new(),
            force_resync: BTreeSet::new(),
            unavailable: BTreeSet::new(),
        }
    }

    /// Applies `decisions` in order and returns the devices whose round
    /// failed.
    pub async fn apply(&mut self, decisions: &[DeviceDecision]) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();
        for decision in decisions {
            if self.apply_device(decision).await == RoundResult::Failed {
                failed.insert(decision.entity_id.clone());
            }
        }
        failed
    }

    /// Forgets issued commands. Devices pending a resync stay pending.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    pub fn pending_resync(&self) -> &BTreeSet<String> {
        &self.force_resync
    }

    /// Whether some device missed its last round and should be retried even
    /// without a new transition.
    pub fn needs_retry(&self) -> bool {
        !self.force_resync.is_empty() || !self.unavailable.is_empty()
    }

    pub fn owes_round(&self, entity_id: &str) -> bool {
        self.force_resync.contains(entity_id) || self.unavailable.contains(entity_id)
    }

    /// Drops retry bookkeeping for devices no longer being controlled.
    pub fn retain_devices<'a>(&mut self, entity_ids: impl IntoIterator<Item = &'a str>) {
        let keep: BTreeSet<&str> = entity_ids.into_iter().collect();
        self.force_resync.retain(|id| keep.contains(id.as_str()));
        self.unavailable.retain(|id| keep.contains(id.as_str()));
    }

    async fn apply_device(&mut self, decision: &DeviceDecision) -> RoundResult {
        let entity_id = decision.entity_id.as_str();

        let live = match self.host.get_state(entity_id).await {
            Ok(Some(state)) if state.is_available() => state,
            Ok(state) => {
                debug!(
                    entity_id,
                    state = state.as_ref().map(|s| s.state.as_str()).unwrap_or("missing"),
                    "skipping unavailable climate device"
                );
                self.unavailable.insert(entity_id.to_string());
                return RoundResult::Skipped;
            }
            Err(err) => {
                warn!(entity_id, "failed to read climate device state: {err}");
                self.unavailable.remove(entity_id);
                self.force_resync.insert(entity_id.to_string());
                return RoundResult::Failed;
            }
        };

        self.unavailable.remove(entity_id);
        let forced = self.force_resync.contains(entity_id);
        let previous = if forced {
            None
        } else {
            self.history.get(entity_id)
        };
        let plan = RoundPlan::new(decision, previous, self.config.temperature_epsilon_c);
        if plan.is_noop() {
            debug!(entity_id, "no changes required");
            return RoundResult::Unchanged;
        }
        if forced {
            info!(entity_id, "resyncing climate device after earlier failure");
        }

        let ok = self.run_round(decision, &live, plan).await;

        self.history
            .insert(entity_id.to_string(), CommandRecord::from_decision(decision));
        if ok {
            self.force_resync.remove(entity_id);
            RoundResult::Applied
        } else {
            self.force_resync.insert(entity_id.to_string());
            RoundResult::Failed
        }
    }

    async fn run_round(&self, decision: &DeviceDecision, live: &EntityState, plan: RoundPlan) -> bool {
        let entity_id = decision.entity_id.as_str();
        let mut ok = true;

        if !decision.should_be_active {
            if plan.state_changed {
                info!(entity_id, "turning climate device off");
                ok &= self
                    .call(entity_id, SERVICE_SET_HVAC_MODE, json!({ "hvac_mode": HvacMode::Off.as_str() }))
                    .await
                    .is_success();
            }
            return ok;
        }

        if plan.state_changed {
            info!(entity_id, hvac_mode = decision.hvac_mode.as_str(), "turning climate device on");
            ok &= self
                .call(
                    entity_id,
                    SERVICE_SET_HVAC_MODE,
                    json!({ "hvac_mode": decision.hvac_mode.as_str() }),
                )
                .await
                .is_success();
            tokio::time::sleep(self.config.settle()).await;
        }

        if plan.temp_changed {
            info!(entity_id, temperature = decision.target_temp, "setting target temperature");
            ok &= self
                .call(
                    entity_id,
                    SERVICE_SET_TEMPERATURE,
                    json!({ "temperature": wire_temperature(decision.target_temp) }),
                )
                .await
                .is_success();
        }

        if plan.fan_changed {
            if live.supports_fan_mode(&decision.target_fan) {
                info!(entity_id, fan_mode = %decision.target_fan, "setting fan mode");
                ok &= self
                    .call(
                        entity_id,
                        SERVICE_SET_FAN_MODE,
                        json!({ "fan_mode": decision.target_fan }),
                    )
                    .await
                    .is_success();
            } else {
                debug!(entity_id, fan_mode = %decision.target_fan, "fan mode not supported, skipping");
            }
        }

        if plan.state_changed {
            tokio::time::sleep(self.config.final_settle()).await;
        }

        ok
    }

    async fn call(&self, entity_id: &str, service: &str, mut payload: Value) -> CommandOutcome {
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("entity_id".to_string(), Value::from(entity_id));
        }

        let timeout = self.config.command_timeout();
        let call = self.host.call_service(CLIMATE_DOMAIN, service, payload, true);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => CommandOutcome::Success,
            Ok(Err(HostError::Timeout { .. })) | Err(_) => {
                warn!(
                    entity_id,
                    service,
                    timeout_secs = timeout.as_secs(),
                    "climate command timed out"
                );
                CommandOutcome::TimedOut
            }
            Ok(Err(err)) => {
                error!(entity_id, service, "climate command failed: {err}");
                CommandOutcome::Failed(err.to_string())
            }
        }
    }
}

// f32 setpoints like 21.3 would otherwise serialize as 21.299999237060547.
fn wire_temperature(temperature: f32) -> f64 {
    (f64::from(temperature) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::entity::fake::{Fault, FakeHost};
    use tokio::time::Instant;

    const OFFICE: &str = "climate.office";
    const BEDROOM: &str = "climate.bedroom";
    const FANS: &[&str] = &["auto", "low", "high"];

    fn setup(devices: &[&str]) -> (Arc<FakeHost>, ClimateController) {
        let host = Arc::new(FakeHost::new());
        for device in devices {
            host.set_climate(device, "off", FANS);
        }
        let controller = ClimateController::new(host.clone(), ControllerConfig::default());
        (host, controller)
    }

    fn on(entity_id: &str, temp: f32, fan: &str) -> DeviceDecision {
        DeviceDecision {
            entity_id: entity_id.to_string(),
            should_be_active: true,
            active_schedules: vec!["Day".to_string()],
            hvac_mode: HvacMode::Heat,
            target_temp: temp,
            target_fan: fan.to_string(),
        }
    }

    fn off(entity_id: &str) -> DeviceDecision {
        DeviceDecision {
            should_be_active: false,
            active_schedules: Vec::new(),
            target_temp: 20.0,
            target_fan: "auto".to_string(),
            ..on(entity_id, 20.0, "auto")
        }
    }

    fn names(calls: &[(&str, &str)]) -> Vec<(String, String)> {
        calls
            .iter()
            .map(|(entity, service)| (entity.to_string(), service.to_string()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn turning_on_sends_mode_then_setpoint_then_fan() {
        let (host, mut controller) = setup(&[OFFICE]);

        let started = Instant::now();
        let failed = controller.apply(&[on(OFFICE, 21.3, "high")]).await;

        assert!(failed.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(7));

        let calls = host.take_calls();
        let services: Vec<&str> = calls.iter().map(|c| c.service.as_str()).collect();
        assert_eq!(services, vec![SERVICE_SET_HVAC_MODE, SERVICE_SET_TEMPERATURE, SERVICE_SET_FAN_MODE]);
        assert_eq!(calls[0].domain, CLIMATE_DOMAIN);
        assert_eq!(calls[0].payload, json!({"entity_id": OFFICE, "hvac_mode": "heat"}));
        assert_eq!(calls[1].payload, json!({"entity_id": OFFICE, "temperature": 21.3}));
        assert_eq!(calls[2].payload, json!({"entity_id": OFFICE, "fan_mode": "high"}));
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_a_decision_issues_nothing() {
        let (host, mut controller) = setup(&[OFFICE]);
        controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        host.take_calls();

        controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        assert!(host.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn setpoint_change_skips_mode_and_settle() {
        let (host, mut controller) = setup(&[OFFICE]);
        controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        host.take_calls();

        let started = Instant::now();
        controller.apply(&[on(OFFICE, 22.5, "auto")]).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(host.take_call_names(), names(&[(OFFICE, SERVICE_SET_TEMPERATURE)]));

        controller.apply(&[on(OFFICE, 22.55, "auto")]).await;
        assert!(host.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn mode_change_while_on_counts_as_state_change() {
        let (host, mut controller) = setup(&[OFFICE]);
        controller.apply(&[on(OFFICE, 24.0, "auto")]).await;
        host.take_calls();

        let mut cool = on(OFFICE, 24.0, "auto");
        cool.hvac_mode = HvacMode::Cool;
        controller.apply(&[cool]).await;

        let calls = host.take_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["hvac_mode"], "cool");
    }

    #[tokio::test(start_paused = true)]
    async fn turning_off_only_sets_mode() {
        let (host, mut controller) = setup(&[OFFICE]);
        controller.apply(&[on(OFFICE, 21.0, "high")]).await;
        host.take_calls();

        controller.apply(&[off(OFFICE)]).await;
        let calls = host.take_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload, json!({"entity_id": OFFICE, "hvac_mode": "off"}));

        controller.apply(&[off(OFFICE)]).await;
        assert!(host.take_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_fan_mode_is_skipped() {
        let (host, mut controller) = setup(&[]);
        host.set_climate(OFFICE, "off", &["auto"]);

        let failed = controller.apply(&[on(OFFICE, 21.0, "turbo")]).await;

        assert!(failed.is_empty());
        assert_eq!(
            host.take_call_names(),
            names(&[(OFFICE, SERVICE_SET_HVAC_MODE), (OFFICE, SERVICE_SET_TEMPERATURE)])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_devices_are_skipped_and_rechecked() {
        let (host, mut controller) = setup(&[]);
        host.set_climate(OFFICE, "unavailable", FANS);

        let failed = controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        assert!(failed.is_empty());
        assert!(host.take_calls().is_empty());
        assert!(controller.pending_resync().is_empty());
        assert!(controller.needs_retry());
        assert!(controller.owes_round(OFFICE));

        let failed = controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        assert!(failed.is_empty());
        assert!(host.take_calls().is_empty());

        host.set_climate(OFFICE, "off", FANS);
        controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        assert_eq!(host.take_calls().len(), 3);
        assert!(!controller.needs_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_devices_stop_owing_rounds() {
        let (host, mut controller) = setup(&[OFFICE]);
        host.set_climate(BEDROOM, "unknown", FANS);
        host.fault(OFFICE, SERVICE_SET_HVAC_MODE, Fault::Fail);
        controller
            .apply(&[on(OFFICE, 21.0, "auto"), on(BEDROOM, 19.0, "auto")])
            .await;
        assert!(controller.owes_round(OFFICE));
        assert!(controller.owes_round(BEDROOM));

        controller.retain_devices([OFFICE]);
        assert!(controller.owes_round(OFFICE));
        assert!(!controller.owes_round(BEDROOM));

        controller.retain_devices([]);
        assert!(!controller.needs_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_on_one_device_does_not_block_the_next() {
        let (host, mut controller) = setup(&[OFFICE, BEDROOM]);
        host.fault(OFFICE, SERVICE_SET_HVAC_MODE, Fault::Hang);

        let failed = controller
            .apply(&[on(OFFICE, 21.0, "auto"), on(BEDROOM, 19.0, "auto")])
            .await;

        assert_eq!(failed, BTreeSet::from([OFFICE.to_string()]));
        assert_eq!(controller.pending_resync(), &BTreeSet::from([OFFICE.to_string()]));
        let calls = host.take_call_names();
        assert!(calls.contains(&(BEDROOM.to_string(), SERVICE_SET_HVAC_MODE.to_string())));
        assert!(calls.contains(&(BEDROOM.to_string(), SERVICE_SET_TEMPERATURE.to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_device_is_resynced_on_next_apply() {
        let (host, mut controller) = setup(&[OFFICE, BEDROOM]);
        host.fault(OFFICE, SERVICE_SET_TEMPERATURE, Fault::Hang);
        let decisions = [on(OFFICE, 21.0, "auto"), on(BEDROOM, 19.0, "auto")];
        controller.apply(&decisions).await;
        host.take_calls();
        host.clear_faults();

        let failed = controller.apply(&decisions).await;

        assert!(failed.is_empty());
        assert!(controller.pending_resync().is_empty());
        assert_eq!(
            host.take_call_names(),
            names(&[
                (OFFICE, SERVICE_SET_HVAC_MODE),
                (OFFICE, SERVICE_SET_TEMPERATURE),
                (OFFICE, SERVICE_SET_FAN_MODE),
            ])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_call_keeps_the_round_going() {
        let (host, mut controller) = setup(&[OFFICE]);
        host.fault(OFFICE, SERVICE_SET_HVAC_MODE, Fault::Fail);

        let failed = controller.apply(&[on(OFFICE, 21.0, "low")]).await;

        assert_eq!(failed, BTreeSet::from([OFFICE.to_string()]));
        assert_eq!(host.take_calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_history_keeps_pending_resync() {
        let (host, mut controller) = setup(&[OFFICE]);
        host.fault(OFFICE, SERVICE_SET_HVAC_MODE, Fault::Fail);
        controller.apply(&[on(OFFICE, 21.0, "auto")]).await;

        controller.reset_history();
        assert_eq!(controller.pending_resync().len(), 1);

        host.clear_faults();
        host.take_calls();
        controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        assert_eq!(host.take_calls().len(), 3);
        assert!(controller.pending_resync().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn state_lookup_errors_mark_the_device() {
        let (host, mut controller) = setup(&[OFFICE]);
        host.set_connected(false);

        let failed = controller.apply(&[on(OFFICE, 21.0, "auto")]).await;
        assert_eq!(failed, BTreeSet::from([OFFICE.to_string()]));
        assert!(host.take_calls().is_empty());
    }

    #[test]
    fn wire_temperatures_are_rounded() {
        assert_eq!(wire_temperature(21.3), 21.3);
        assert_eq!(wire_temperature(19.05), 19.05);
    }
}
