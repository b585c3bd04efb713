use indexmap::IndexMap;
use serde::Serialize;

use crate::{
    config::{DEFAULT_SCHEDULE_FAN_MODE, DEFAULT_SCHEDULE_TEMPERATURE},
    schedule::ScheduleDecision,
    types::HvacMode,
};

/// What one climate entity should be doing this cycle. Also used for the gas
/// heater.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceDecision {
    pub entity_id: String,
    pub should_be_active: bool,
    pub active_schedules: Vec<String>,
    pub hvac_mode: HvacMode,
    pub target_temp: f32,
    pub target_fan: String,
}

impl DeviceDecision {
    fn idle(entity_id: &str, should_be_active: bool) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            should_be_active,
            active_schedules: Vec::new(),
            hvac_mode: HvacMode::Heat,
            target_temp: DEFAULT_SCHEDULE_TEMPERATURE,
            target_fan: DEFAULT_SCHEDULE_FAN_MODE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AggregationPolicy {
    pub only_scheduled_active: bool,
    pub auto_heating_enabled: bool,
    pub anyone_home: bool,
}

impl AggregationPolicy {
    fn fallback_active(&self) -> bool {
        !self.only_scheduled_active && self.auto_heating_enabled && self.anyone_home
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub devices: IndexMap<String, DeviceDecision>,
    pub gas_heater: Option<DeviceDecision>,
}

#[derive(Debug, Default)]
struct Contributions<'a> {
    schedules: Vec<&'a ScheduleDecision>,
}

impl<'a> Contributions<'a> {
    fn push(&mut self, decision: &'a ScheduleDecision) {
        self.schedules.push(decision);
    }

    /// Highest temperature wins; ties keep the earliest contribution.
    fn resolve(&self, entity_id: &str, fallback_active: bool) -> DeviceDecision {
        let Some(winner) = self.schedules.iter().copied().reduce(|best, candidate| {
            if candidate.target_temp > best.target_temp {
                candidate
            } else {
                best
            }
        }) else {
            return DeviceDecision::idle(entity_id, fallback_active);
        };

        DeviceDecision {
            entity_id: entity_id.to_string(),
            should_be_active: true,
            active_schedules: self.schedules.iter().map(|s| s.name.clone()).collect(),
            hvac_mode: winner.hvac_mode,
            target_temp: winner.target_temp,
            target_fan: winner.target_fan.clone(),
        }
    }
}

/// Merges schedule verdicts into one decision per roster device, plus the gas
/// heater decision when a gas heater entity is configured.
///
/// Gas-heater schedules feed only the gas heater, never the devices they list.
pub fn aggregate_devices(
    schedules: &[ScheduleDecision],
    roster: &[String],
    gas_heater_entity: Option<&str>,
    policy: AggregationPolicy,
) -> Aggregation {
    let mut per_device: IndexMap<&str, Contributions<'_>> = IndexMap::new();
    let mut gas = Contributions::default();

    for decision in schedules.iter().filter(|decision| decision.is_active) {
        if decision.use_gas_heater {
            gas.push(decision);
            continue;
        }
        for device in &decision.devices {
            per_device.entry(device.as_str()).or_default().push(decision);
        }
    }

    let fallback_active = policy.fallback_active();
    let devices = roster
        .iter()
        .map(|entity_id| {
            let decision = match per_device.get(entity_id.as_str()) {
                Some(contributions) => contributions.resolve(entity_id, fallback_active),
                None => DeviceDecision::idle(entity_id, fallback_active),
            };
            (entity_id.clone(), decision)
        })
        .collect();

    let gas_heater = gas_heater_entity.map(|entity_id| gas.resolve(entity_id, false));

    Aggregation {
        devices,
        gas_heater,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        time::TimeOfDay,
        types::TempCondition,
    };
    use pretty_assertions::assert_eq;

    const LIVING: &str = "climate.living_room";
    const BEDROOM: &str = "climate.bedroom";
    const GAS: &str = "climate.gas_heater";

    fn decision(name: &str, active: bool, devices: &[&str], temp: f32, fan: &str) -> ScheduleDecision {
        ScheduleDecision {
            schedule_id: name.to_lowercase(),
            name: name.to_string(),
            start_time: TimeOfDay::MIDNIGHT,
            end_time: TimeOfDay::from_minutes(23 * 60 + 59),
            hvac_mode: HvacMode::Heat,
            always_active: false,
            only_when_home: true,
            use_gas_heater: false,
            enabled: true,
            is_active: active,
            in_time_window: active,
            presence_ok: true,
            temp_condition: TempCondition::Always,
            temp_condition_met: true,
            device_count: devices.len(),
            devices: devices.iter().map(|d| d.to_string()).collect(),
            target_temp: temp,
            target_fan: fan.to_string(),
        }
    }

    fn roster() -> Vec<String> {
        vec![LIVING.to_string(), BEDROOM.to_string()]
    }

    fn strict() -> AggregationPolicy {
        AggregationPolicy {
            only_scheduled_active: true,
            auto_heating_enabled: true,
            anyone_home: true,
        }
    }

    #[test]
    fn highest_temperature_wins() {
        let schedules = vec![
            decision("Day", true, &[LIVING], 21.0, "low"),
            decision("Evening", true, &[LIVING, BEDROOM], 23.0, "high"),
        ];
        let result = aggregate_devices(&schedules, &roster(), None, strict());

        let living = &result.devices[LIVING];
        assert!(living.should_be_active);
        assert_eq!(living.target_temp, 23.0);
        assert_eq!(living.target_fan, "high");
        assert_eq!(living.active_schedules, vec!["Day".to_string(), "Evening".to_string()]);
        assert_eq!(result.devices[BEDROOM].active_schedules, vec!["Evening".to_string()]);
        assert_eq!(result.gas_heater, None);
    }

    #[test]
    fn equal_temperatures_keep_first_schedule_fan() {
        let schedules = vec![
            decision("First", true, &[LIVING], 22.0, "low"),
            decision("Second", true, &[LIVING], 22.0, "high"),
        ];
        let result = aggregate_devices(&schedules, &roster(), None, strict());

        assert_eq!(result.devices[LIVING].target_fan, "low");
    }

    #[test]
    fn inactive_schedules_do_not_contribute() {
        let schedules = vec![decision("Night", false, &[BEDROOM], 25.0, "high")];
        let result = aggregate_devices(&schedules, &roster(), None, strict());

        let bedroom = &result.devices[BEDROOM];
        assert!(!bedroom.should_be_active);
        assert!(bedroom.active_schedules.is_empty());
        assert_eq!(bedroom.target_temp, DEFAULT_SCHEDULE_TEMPERATURE);
        assert_eq!(bedroom.target_fan, DEFAULT_SCHEDULE_FAN_MODE);
    }

    #[test]
    fn unscheduled_devices_fall_back_when_allowed() {
        let relaxed = AggregationPolicy {
            only_scheduled_active: false,
            ..strict()
        };
        let result = aggregate_devices(&[], &roster(), None, relaxed);
        assert!(result.devices[LIVING].should_be_active);
        assert_eq!(result.devices[LIVING].target_temp, DEFAULT_SCHEDULE_TEMPERATURE);

        let result = aggregate_devices(&[], &roster(), None, strict());
        assert!(!result.devices[LIVING].should_be_active);

        let away = AggregationPolicy {
            anyone_home: false,
            ..relaxed
        };
        let result = aggregate_devices(&[], &roster(), None, away);
        assert!(!result.devices[LIVING].should_be_active);
    }

    #[test]
    fn gas_schedules_only_drive_the_gas_heater() {
        let mut gas = decision("Gas", true, &[LIVING], 24.0, "auto");
        gas.use_gas_heater = true;
        let schedules = vec![gas, decision("Day", true, &[LIVING], 20.5, "low")];

        let result = aggregate_devices(&schedules, &roster(), Some(GAS), strict());

        let living = &result.devices[LIVING];
        assert_eq!(living.active_schedules, vec!["Day".to_string()]);
        assert_eq!(living.target_temp, 20.5);

        let heater = result.gas_heater.unwrap();
        assert_eq!(heater.entity_id, GAS);
        assert!(heater.should_be_active);
        assert_eq!(heater.target_temp, 24.0);
        assert_eq!(heater.active_schedules, vec!["Gas".to_string()]);
    }

    #[test]
    fn idle_gas_heater_is_still_reported() {
        let mut gas = decision("Gas", false, &[], 24.0, "auto");
        gas.use_gas_heater = true;
        let relaxed = AggregationPolicy {
            only_scheduled_active: false,
            ..strict()
        };

        let result = aggregate_devices(&[gas], &roster(), Some(GAS), relaxed);
        let heater = result.gas_heater.unwrap();

        assert!(!heater.should_be_active);
        assert_eq!(heater.target_temp, DEFAULT_SCHEDULE_TEMPERATURE);
        assert!(heater.active_schedules.is_empty());
    }

    #[test]
    fn winning_schedule_sets_hvac_mode() {
        let mut cool = decision("Cool", true, &[LIVING], 26.0, "auto");
        cool.hvac_mode = HvacMode::Cool;
        let schedules = vec![decision("Heat", true, &[LIVING], 21.0, "auto"), cool];

        let result = aggregate_devices(&schedules, &roster(), None, strict());
        assert_eq!(result.devices[LIVING].hvac_mode, HvacMode::Cool);
    }
}
