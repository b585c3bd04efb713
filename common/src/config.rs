use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    time::{parse_time_value, TimeOfDay},
    types::{HvacMode, TempCondition},
};

pub const DEFAULT_SCHEDULE_START: TimeOfDay = TimeOfDay::MIDNIGHT;
pub const DEFAULT_SCHEDULE_END_MINUTES: u16 = 23 * 60 + 59;
pub const DEFAULT_SCHEDULE_TEMPERATURE: f32 = 20.0;
pub const DEFAULT_SCHEDULE_FAN_MODE: &str = "auto";
pub const DEFAULT_SCHEDULE_NAME: &str = "Unnamed";
pub const DEFAULT_OUTDOOR_THRESHOLD_C: f32 = 15.0;
pub const DEFAULT_OUTDOOR_HYSTERESIS_C: f32 = 1.0;
pub const MIN_TEMPERATURE_C: f32 = 5.0;
pub const MAX_TEMPERATURE_C: f32 = 35.0;

pub fn default_schedule_end() -> TimeOfDay {
    TimeOfDay::from_minutes(DEFAULT_SCHEDULE_END_MINUTES)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub settle_seconds: u64,
    pub final_settle_seconds: u64,
    pub update_interval_secs: u64,
    pub command_timeout_secs: u64,
    /// Derived from the device count when unset.
    pub cycle_timeout_secs: Option<u64>,
    pub temperature_epsilon_c: f32,
    pub stuck_after_failures: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            settle_seconds: 5,
            final_settle_seconds: 2,
            update_interval_secs: 60,
            command_timeout_secs: 10,
            cycle_timeout_secs: None,
            temperature_epsilon_c: 0.1,
            stuck_after_failures: 3,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.settle_seconds = self.settle_seconds.min(120);
        self.final_settle_seconds = self.final_settle_seconds.min(120);
        self.update_interval_secs = self.update_interval_secs.clamp(10, 3_600);
        self.command_timeout_secs = self.command_timeout_secs.clamp(1, 120);
        if !self.temperature_epsilon_c.is_finite() || self.temperature_epsilon_c <= 0.0 {
            self.temperature_epsilon_c = 0.1;
        }
        self.stuck_after_failures = self.stuck_after_failures.max(1);

        let floor = self.device_round_limit() + self.command_timeout();
        if let Some(secs) = self.cycle_timeout_secs {
            if Duration::from_secs(secs) < floor {
                warn!(
                    cycle_timeout_secs = secs,
                    minimum_secs = floor.as_secs(),
                    "cycle timeout is shorter than one device round, raising it"
                );
                self.cycle_timeout_secs = Some(floor.as_secs());
            }
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }

    pub fn final_settle(&self) -> Duration {
        Duration::from_secs(self.final_settle_seconds)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Worst case for one device round: both settles plus three timed-out
    /// commands.
    pub fn device_round_limit(&self) -> Duration {
        Duration::from_secs(
            self.settle_seconds + self.final_settle_seconds + 3 * self.command_timeout_secs,
        )
    }

    /// Upper bound for one control round over `device_count` devices. An
    /// explicit value is never shorter than one full device round.
    pub fn cycle_timeout(&self, device_count: usize) -> Duration {
        let per_device = self.device_round_limit();
        if let Some(secs) = self.cycle_timeout_secs {
            return Duration::from_secs(secs).max(per_device + self.command_timeout());
        }

        let total = per_device * device_count as u32 + self.command_timeout();
        total.max(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_client_id: "heating-controller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub timezone: String,
    pub network: NetworkConfig,
    pub http_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            timezone: "Europe/Berlin".to_string(),
            network: NetworkConfig::default(),
            http_port: 8080,
        }
    }
}

/// One independently controlled configuration instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub entry_id: String,
    #[serde(default)]
    pub title: String,
    pub config: HeatingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatingConfig {
    #[serde(rename = "automatic_heating_enabled", default = "default_true")]
    pub auto_heating_enabled: bool,
    #[serde(default, deserialize_with = "deserialize_entity_list")]
    pub device_trackers: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_entity_list")]
    pub climate_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_heater_entity: Option<String>,
    #[serde(rename = "only_scheduled_devices_active", default)]
    pub only_scheduled_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outdoor_temp_sensor: Option<String>,
    #[serde(default = "default_outdoor_threshold")]
    pub outdoor_temp_threshold: f32,
    #[serde(default = "default_outdoor_hysteresis")]
    pub outdoor_temp_hysteresis: f32,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for HeatingConfig {
    fn default() -> Self {
        Self {
            auto_heating_enabled: true,
            device_trackers: Vec::new(),
            climate_devices: Vec::new(),
            gas_heater_entity: None,
            only_scheduled_active: false,
            outdoor_temp_sensor: None,
            outdoor_temp_threshold: DEFAULT_OUTDOOR_THRESHOLD_C,
            outdoor_temp_hysteresis: DEFAULT_OUTDOOR_HYSTERESIS_C,
            schedules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_schedule_name")]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "start_time", default = "default_schedule_start")]
    pub start: TimeOfDay,
    /// Derived from the next schedule's start when absent.
    #[serde(
        rename = "end_time",
        default,
        deserialize_with = "deserialize_optional_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub end: Option<TimeOfDay>,
    #[serde(default)]
    pub always_active: bool,
    #[serde(default = "default_true")]
    pub only_when_home: bool,
    #[serde(default)]
    pub use_gas_heater: bool,
    #[serde(
        rename = "device_entities",
        default,
        deserialize_with = "deserialize_entity_list"
    )]
    pub devices: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_fan_mode")]
    pub fan_mode: String,
    #[serde(default)]
    pub hvac_mode: HvacMode,
    #[serde(default)]
    pub temp_condition: TempCondition,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: default_schedule_name(),
            enabled: true,
            start: DEFAULT_SCHEDULE_START,
            end: None,
            always_active: false,
            only_when_home: true,
            use_gas_heater: false,
            devices: Vec::new(),
            temperature: DEFAULT_SCHEDULE_TEMPERATURE,
            fan_mode: default_fan_mode(),
            hvac_mode: HvacMode::Heat,
            temp_condition: TempCondition::Always,
        }
    }
}

impl ScheduleConfig {
    /// Stable identifier: explicit id, else name, else position.
    pub fn schedule_id(&self, index: usize) -> String {
        match self.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None if !self.name.is_empty() => self.name.clone(),
            None => format!("schedule_{index}"),
        }
    }

    fn sanitize(&mut self) {
        self.devices = dedupe(std::mem::take(&mut self.devices));
        self.temperature = sanitize_temperature(self.temperature);
        if self.fan_mode.trim().is_empty() {
            self.fan_mode = default_fan_mode();
        }
        if self.use_gas_heater && !self.devices.is_empty() {
            warn!(
                schedule = %self.name,
                "gas heater schedule lists devices; they are ignored while it uses the gas heater"
            );
        }
    }
}

/// Which schedule an enable/disable request refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSelector {
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default)]
    pub schedule_name: Option<String>,
}

impl ScheduleSelector {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            schedule_id: Some(id.into()),
            schedule_name: None,
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            schedule_id: None,
            schedule_name: Some(name.into()),
        }
    }

    pub fn identifier(&self) -> &str {
        self.schedule_id
            .as_deref()
            .or(self.schedule_name.as_deref())
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleLookupError {
    #[error("either schedule_id or schedule_name is required")]
    MissingSelector,

    #[error("no schedules are configured for this entry")]
    NoSchedules,

    #[error("schedule '{0}' was not found")]
    NotFound(String),

    #[error("schedule '{identifier}' is ambiguous ({matches} schedules match)")]
    Ambiguous { identifier: String, matches: usize },
}

impl HeatingConfig {
    pub fn sanitize(&mut self) {
        self.device_trackers = dedupe(std::mem::take(&mut self.device_trackers));
        self.climate_devices = dedupe(std::mem::take(&mut self.climate_devices));
        self.gas_heater_entity = self
            .gas_heater_entity
            .take()
            .filter(|entity| !entity.trim().is_empty());
        self.outdoor_temp_sensor = self
            .outdoor_temp_sensor
            .take()
            .filter(|entity| !entity.trim().is_empty());

        if !self.outdoor_temp_threshold.is_finite() {
            self.outdoor_temp_threshold = DEFAULT_OUTDOOR_THRESHOLD_C;
        }
        if !self.outdoor_temp_hysteresis.is_finite() || self.outdoor_temp_hysteresis < 0.0 {
            self.outdoor_temp_hysteresis = DEFAULT_OUTDOOR_HYSTERESIS_C;
        }

        for schedule in &mut self.schedules {
            schedule.sanitize();
        }
        for id in self.duplicate_schedule_ids() {
            warn!(schedule_id = %id, "several schedules share one id; only the last is tracked between cycles");
        }
    }

    /// Schedule ids claimed by more than one schedule, in first-seen order.
    pub fn duplicate_schedule_ids(&self) -> Vec<String> {
        let mut seen = Vec::with_capacity(self.schedules.len());
        let mut duplicates = Vec::new();
        for (index, schedule) in self.schedules.iter().enumerate() {
            let id = schedule.schedule_id(index);
            if seen.contains(&id) {
                if !duplicates.contains(&id) {
                    duplicates.push(id);
                }
            } else {
                seen.push(id);
            }
        }
        duplicates
    }

    /// Enables or disables one schedule. Returns whether anything changed.
    pub fn set_schedule_enabled(
        &mut self,
        selector: &ScheduleSelector,
        enabled: bool,
    ) -> Result<bool, ScheduleLookupError> {
        let index = self.find_schedule(selector)?;
        let schedule = &mut self.schedules[index];
        if schedule.enabled == enabled {
            return Ok(false);
        }
        schedule.enabled = enabled;
        Ok(true)
    }

    /// Resolves a selector to exactly one schedule index.
    ///
    /// Ids match exactly; a schedule without an explicit id also answers to
    /// its name. Names match case-insensitively.
    pub fn find_schedule(&self, selector: &ScheduleSelector) -> Result<usize, ScheduleLookupError> {
        let id = selector.schedule_id.as_deref().filter(|id| !id.is_empty());
        let name = selector
            .schedule_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(str::to_lowercase);

        if id.is_none() && name.is_none() {
            return Err(ScheduleLookupError::MissingSelector);
        }
        if self.schedules.is_empty() {
            return Err(ScheduleLookupError::NoSchedules);
        }

        let id_folded = id.map(str::to_lowercase);
        let matches: Vec<usize> = self
            .schedules
            .iter()
            .enumerate()
            .filter(|(_, schedule)| {
                let current_name = schedule.name.to_lowercase();
                let id_matches = match (id, schedule.id.as_deref().filter(|s| !s.is_empty())) {
                    (Some(wanted), Some(current)) => wanted == current,
                    (Some(_), None) => id_folded.as_deref() == Some(current_name.as_str()),
                    (None, _) => false,
                };
                let name_matches = name.as_deref() == Some(current_name.as_str());
                id_matches || name_matches
            })
            .map(|(index, _)| index)
            .collect();

        match matches.as_slice() {
            [] => Err(ScheduleLookupError::NotFound(
                selector.identifier().to_string(),
            )),
            [index] => Ok(*index),
            many => Err(ScheduleLookupError::Ambiguous {
                identifier: selector.identifier().to_string(),
                matches: many.len(),
            }),
        }
    }
}

fn sanitize_temperature(temperature: f32) -> f32 {
    if temperature.is_finite() {
        temperature.clamp(MIN_TEMPERATURE_C, MAX_TEMPERATURE_C)
    } else {
        DEFAULT_SCHEDULE_TEMPERATURE
    }
}

fn dedupe(entities: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(entities.len());
    for entity in entities {
        let entity = entity.trim().to_string();
        if !entity.is_empty() && !seen.contains(&entity) {
            seen.push(entity);
        }
    }
    seen
}

fn default_true() -> bool {
    true
}

fn default_schedule_name() -> String {
    DEFAULT_SCHEDULE_NAME.to_string()
}

fn default_schedule_start() -> TimeOfDay {
    DEFAULT_SCHEDULE_START
}

fn default_temperature() -> f32 {
    DEFAULT_SCHEDULE_TEMPERATURE
}

fn default_fan_mode() -> String {
    DEFAULT_SCHEDULE_FAN_MODE.to_string()
}

fn default_outdoor_threshold() -> f32 {
    DEFAULT_OUTDOOR_THRESHOLD_C
}

fn default_outdoor_hysteresis() -> f32 {
    DEFAULT_OUTDOOR_HYSTERESIS_C
}

// Entity pickers leave blanks and nulls behind.
fn deserialize_entity_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|value| match value {
            serde_json::Value::String(entity) if !entity.trim().is_empty() => Some(entity),
            _ => None,
        })
        .collect())
}

fn deserialize_optional_time<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<TimeOfDay>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match &value {
        serde_json::Value::Null => None,
        serde_json::Value::String(raw) if raw.trim().is_empty() => None,
        other => Some(TimeOfDay::from_minutes(parse_time_value(other))),
    })
}
