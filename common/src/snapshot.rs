use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    aggregate::{aggregate_devices, AggregationPolicy, DeviceDecision},
    config::HeatingConfig,
    schedule::{evaluate_schedules, EvaluationContext, ScheduleDecision},
    time::TimeOfDay,
    types::{OutdoorState, WatchdogHealth},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceState {
    pub tracker_states: IndexMap<String, bool>,
    pub anyone_home: bool,
    pub both_away: bool,
}

impl PresenceState {
    /// Without trackers, occupants are assumed home so schedules stay eligible.
    pub fn from_trackers(trackers: impl IntoIterator<Item = (String, bool)>) -> Self {
        let tracker_states: IndexMap<String, bool> = trackers.into_iter().collect();
        if tracker_states.is_empty() {
            return Self {
                tracker_states,
                anyone_home: true,
                both_away: false,
            };
        }

        let anyone_home = tracker_states.values().any(|home| *home);
        Self {
            tracker_states,
            anyone_home,
            both_away: !anyone_home,
        }
    }
}

/// Live readings gathered at the start of a cycle.
#[derive(Debug, Clone)]
pub struct CycleInputs {
    pub now: TimeOfDay,
    pub presence: PresenceState,
    pub outdoor_temp: Option<f32>,
    pub outdoor_state: OutdoorState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub now_time: TimeOfDay,
    pub tracker_states: IndexMap<String, bool>,
    pub trackers_home: usize,
    pub trackers_total: usize,
    pub auto_heating_enabled: bool,
    pub only_scheduled_active: bool,
    pub schedule_count: usize,
    pub active_schedules: usize,
    pub device_count: usize,
    pub active_devices: usize,
    pub outdoor_temp: Option<f32>,
    pub outdoor_state: OutdoorState,
    pub last_update_duration_ms: Option<u64>,
    pub timed_out_devices: BTreeSet<String>,
    pub watchdog: WatchdogHealth,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatingStateSnapshot {
    pub both_away: bool,
    pub anyone_home: bool,
    pub schedule_decisions: IndexMap<String, ScheduleDecision>,
    pub device_decisions: IndexMap<String, DeviceDecision>,
    pub gas_heater_decision: Option<DeviceDecision>,
    pub diagnostics: DiagnosticsSnapshot,
}

impl HeatingStateSnapshot {
    /// Everything the controller acts on, gas heater first.
    pub fn control_targets(&self) -> impl Iterator<Item = &DeviceDecision> {
        self.gas_heater_decision
            .iter()
            .chain(self.device_decisions.values())
    }
}

/// Computes what should be true right now. Pure: same config and inputs give
/// the same snapshot. Runtime diagnostics (duration, timeouts, watchdog) are
/// left at their defaults for the caller to fill in.
pub fn calculate_heating_state(config: &HeatingConfig, inputs: &CycleInputs) -> HeatingStateSnapshot {
    let presence = &inputs.presence;
    let ctx = EvaluationContext {
        now: inputs.now,
        anyone_home: presence.anyone_home,
        auto_heating_enabled: config.auto_heating_enabled,
        outdoor: inputs.outdoor_state,
    };

    let decisions = evaluate_schedules(&config.schedules, &ctx);
    let aggregation = aggregate_devices(
        &decisions,
        &config.climate_devices,
        config.gas_heater_entity.as_deref(),
        AggregationPolicy {
            only_scheduled_active: config.only_scheduled_active,
            auto_heating_enabled: config.auto_heating_enabled,
            anyone_home: presence.anyone_home,
        },
    );

    let diagnostics = DiagnosticsSnapshot {
        now_time: inputs.now,
        tracker_states: presence.tracker_states.clone(),
        trackers_home: presence.tracker_states.values().filter(|home| **home).count(),
        trackers_total: presence.tracker_states.len(),
        auto_heating_enabled: config.auto_heating_enabled,
        only_scheduled_active: config.only_scheduled_active,
        schedule_count: config.schedules.len(),
        active_schedules: decisions.iter().filter(|d| d.is_active).count(),
        device_count: aggregation.devices.len(),
        active_devices: aggregation
            .devices
            .values()
            .filter(|d| d.should_be_active)
            .count(),
        outdoor_temp: inputs.outdoor_temp,
        outdoor_state: inputs.outdoor_state,
        last_update_duration_ms: None,
        timed_out_devices: BTreeSet::new(),
        watchdog: WatchdogHealth::Healthy,
    };

    let schedule_decisions = decisions
        .into_iter()
        .map(|decision| (decision.schedule_id.clone(), decision))
        .collect();

    HeatingStateSnapshot {
        both_away: presence.both_away,
        anyone_home: presence.anyone_home,
        schedule_decisions,
        device_decisions: aggregation.devices,
        gas_heater_decision: aggregation.gas_heater,
        diagnostics,
    }
}
