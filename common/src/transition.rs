use std::fmt;

use indexmap::IndexMap;

use crate::{schedule::ScheduleDecision, snapshot::HeatingStateSnapshot, types::HvacMode};

#[derive(Debug, Clone, PartialEq)]
struct ScheduleFingerprint {
    is_active: bool,
    hvac_mode: HvacMode,
    target_temp: f32,
    target_fan: String,
}

impl ScheduleFingerprint {
    fn of(decision: &ScheduleDecision) -> Self {
        Self {
            is_active: decision.is_active,
            hvac_mode: decision.hvac_mode,
            target_temp: decision.target_temp,
            target_fan: decision.target_fan.clone(),
        }
    }

    fn same_active_parameters(&self, other: &Self) -> bool {
        self.hvac_mode == other.hvac_mode
            && self.target_temp == other.target_temp
            && self.target_fan == other.target_fan
    }
}

/// What the previous cycle looked like, reduced to the fields that matter
/// for re-applying device commands.
#[derive(Debug, Clone, PartialEq)]
struct PreviousCycle {
    anyone_home: bool,
    schedules: IndexMap<String, ScheduleFingerprint>,
}

impl PreviousCycle {
    fn from_snapshot(snapshot: &HeatingStateSnapshot) -> Self {
        Self {
            anyone_home: snapshot.anyone_home,
            schedules: snapshot
                .schedule_decisions
                .iter()
                .map(|(id, decision)| (id.clone(), ScheduleFingerprint::of(decision)))
                .collect(),
        }
    }
}

/// Why device commands are being re-applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Forced,
    FirstRun,
    PresenceChanged { from: bool, to: bool },
    ScheduleActivity { schedule_id: String, name: String, active: bool },
    ScheduleParameters { schedule_id: String, name: String },
    ScheduleRemoved { schedule_id: String },
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "forced update requested"),
            Self::FirstRun => write!(f, "first run, applying initial state"),
            Self::PresenceChanged { from, to } => write!(f, "presence changed: {from} -> {to}"),
            Self::ScheduleActivity { name, active, .. } => {
                write!(f, "schedule '{name}' state changed: {} -> {active}", !active)
            }
            Self::ScheduleParameters { name, .. } => {
                write!(f, "active schedule '{name}' changed mode, temperature or fan")
            }
            Self::ScheduleRemoved { schedule_id } => write!(f, "schedule {schedule_id} was removed"),
        }
    }
}

/// Gate in front of the controller: device commands are only re-sent when
/// something logically relevant changed, so manual adjustments made between
/// cycles survive.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetector {
    previous: Option<PreviousCycle>,
}

impl TransitionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares `snapshot` against the previous cycle without recording it.
    pub fn detect(&self, snapshot: &HeatingStateSnapshot, force: bool) -> Option<Transition> {
        if force {
            return Some(Transition::Forced);
        }

        let Some(previous) = &self.previous else {
            return Some(Transition::FirstRun);
        };

        if snapshot.anyone_home != previous.anyone_home {
            return Some(Transition::PresenceChanged {
                from: previous.anyone_home,
                to: snapshot.anyone_home,
            });
        }

        for (schedule_id, decision) in &snapshot.schedule_decisions {
            let Some(before) = previous.schedules.get(schedule_id) else {
                continue;
            };

            if decision.is_active != before.is_active {
                return Some(Transition::ScheduleActivity {
                    schedule_id: schedule_id.clone(),
                    name: decision.name.clone(),
                    active: decision.is_active,
                });
            }

            if decision.is_active && !ScheduleFingerprint::of(decision).same_active_parameters(before)
            {
                return Some(Transition::ScheduleParameters {
                    schedule_id: schedule_id.clone(),
                    name: decision.name.clone(),
                });
            }
        }

        previous
            .schedules
            .keys()
            .find(|id| !snapshot.schedule_decisions.contains_key(id.as_str()))
            .map(|id| Transition::ScheduleRemoved {
                schedule_id: id.clone(),
            })
    }

    /// Stores `snapshot` as the baseline for the next comparison.
    pub fn record(&mut self, snapshot: &HeatingStateSnapshot) {
        self.previous = Some(PreviousCycle::from_snapshot(snapshot));
    }

    /// [`detect`](Self::detect) then [`record`](Self::record); the baseline
    /// is replaced whatever the outcome.
    pub fn observe(&mut self, snapshot: &HeatingStateSnapshot, force: bool) -> Option<Transition> {
        let transition = self.detect(snapshot, force);
        self.record(snapshot);
        transition
    }
}
