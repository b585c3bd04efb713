pub mod aggregate;
pub mod config;
pub mod outdoor;
pub mod schedule;
pub mod snapshot;
pub mod time;
pub mod topics;
pub mod transition;
pub mod types;

pub use aggregate::{aggregate_devices, Aggregation, AggregationPolicy, DeviceDecision};
pub use config::{
    ConfigEntry, ControllerConfig, HeatingConfig, NetworkConfig, RuntimeConfig, ScheduleConfig,
    ScheduleLookupError, ScheduleSelector,
};
pub use outdoor::{classify_outdoor, parse_reading, temp_condition_met};
pub use schedule::{evaluate_schedules, EvaluationContext, ScheduleDecision};
pub use snapshot::{
    calculate_heating_state, CycleInputs, DiagnosticsSnapshot, HeatingStateSnapshot,
    PresenceState,
};
pub use time::{in_window, parse_time_to_minutes, TimeOfDay};
pub use topics::*;
pub use transition::{Transition, TransitionDetector};
pub use types::{HvacMode, OutdoorState, TempCondition, WatchdogHealth};
