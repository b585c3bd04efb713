use std::collections::HashMap;

use serde::Serialize;

use crate::{
    config::{default_schedule_end, ScheduleConfig},
    outdoor::temp_condition_met,
    time::{in_window, TimeOfDay},
    types::{HvacMode, OutdoorState, TempCondition},
};

/// Live inputs shared by every schedule in one cycle.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext {
    pub now: TimeOfDay,
    pub anyone_home: bool,
    pub auto_heating_enabled: bool,
    pub outdoor: OutdoorState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleDecision {
    pub schedule_id: String,
    pub name: String,
    pub start_time: TimeOfDay,
    pub end_time: TimeOfDay,
    pub hvac_mode: HvacMode,
    pub always_active: bool,
    pub only_when_home: bool,
    pub use_gas_heater: bool,
    pub enabled: bool,
    pub is_active: bool,
    pub in_time_window: bool,
    pub presence_ok: bool,
    pub temp_condition: TempCondition,
    pub temp_condition_met: bool,
    pub device_count: usize,
    pub devices: Vec<String>,
    pub target_temp: f32,
    pub target_fan: String,
}

pub fn evaluate_schedule(
    schedule: &ScheduleConfig,
    schedule_id: String,
    end_time: TimeOfDay,
    ctx: &EvaluationContext,
) -> ScheduleDecision {
    let in_time_window = schedule.always_active || in_window(ctx.now, schedule.start, end_time);
    let presence_ok = !schedule.only_when_home || ctx.anyone_home;
    let condition_met = temp_condition_met(schedule.temp_condition, ctx.outdoor);
    let is_active = ctx.auto_heating_enabled
        && schedule.enabled
        && in_time_window
        && presence_ok
        && condition_met;

    ScheduleDecision {
        schedule_id,
        name: schedule.name.clone(),
        start_time: schedule.start,
        end_time,
        hvac_mode: schedule.hvac_mode,
        always_active: schedule.always_active,
        only_when_home: schedule.only_when_home,
        use_gas_heater: schedule.use_gas_heater,
        enabled: schedule.enabled,
        is_active,
        in_time_window,
        presence_ok,
        temp_condition: schedule.temp_condition,
        temp_condition_met: condition_met,
        device_count: schedule.devices.len(),
        devices: schedule.devices.clone(),
        target_temp: schedule.temperature,
        target_fan: schedule.fan_mode.clone(),
    }
}

/// Evaluates every schedule in configuration order.
pub fn evaluate_schedules(
    schedules: &[ScheduleConfig],
    ctx: &EvaluationContext,
) -> Vec<ScheduleDecision> {
    let derived = derive_auto_end_times(schedules);

    schedules
        .iter()
        .enumerate()
        .map(|(index, schedule)| {
            let end_time = schedule
                .end
                .or_else(|| derived.get(&index).copied())
                .unwrap_or_else(default_schedule_end);
            evaluate_schedule(schedule, schedule.schedule_id(index), end_time, ctx)
        })
        .collect()
}

/// End times for enabled schedules that have none, keyed by config index.
///
/// Each such schedule runs until the next distinct start time among them,
/// wrapping around midnight. A lone schedule runs until the default end.
pub fn derive_auto_end_times(schedules: &[ScheduleConfig]) -> HashMap<usize, TimeOfDay> {
    let mut timeline: Vec<(TimeOfDay, usize)> = schedules
        .iter()
        .enumerate()
        .filter(|(_, schedule)| schedule.end.is_none() && schedule.enabled)
        .map(|(index, schedule)| (schedule.start, index))
        .collect();
    timeline.sort();

    let total = timeline.len();
    let mut derived = HashMap::with_capacity(total);

    for (position, &(start, index)) in timeline.iter().enumerate() {
        let end = (1..total)
            .map(|offset| timeline[(position + offset) % total].0)
            .find(|candidate| *candidate != start)
            .unwrap_or_else(default_schedule_end);
        derived.insert(index, end);
    }

    derived
}
