use crate::types::{OutdoorState, TempCondition};

/// Latched outdoor classification.
///
/// Leaving `Cold` requires reaching `threshold + hysteresis`; leaving `Warm`
/// requires dropping below `threshold`. Without a previous state the reading
/// is split at `threshold` alone. A missing reading yields `Unknown`.
pub fn classify_outdoor(
    reading: Option<f32>,
    threshold: f32,
    hysteresis: f32,
    previous: OutdoorState,
) -> OutdoorState {
    let Some(temp) = reading.filter(|temp| temp.is_finite()) else {
        return OutdoorState::Unknown;
    };

    match previous {
        OutdoorState::Cold if temp >= threshold + hysteresis => OutdoorState::Warm,
        OutdoorState::Cold => OutdoorState::Cold,
        OutdoorState::Warm if temp < threshold => OutdoorState::Cold,
        OutdoorState::Warm => OutdoorState::Warm,
        OutdoorState::Unknown if temp < threshold => OutdoorState::Cold,
        OutdoorState::Unknown => OutdoorState::Warm,
    }
}

/// Gate for a schedule's temperature condition. An unknown outdoor state
/// never blocks a schedule.
pub fn temp_condition_met(condition: TempCondition, state: OutdoorState) -> bool {
    match (condition, state) {
        (TempCondition::Always, _) | (_, OutdoorState::Unknown) => true,
        (TempCondition::Cold, OutdoorState::Cold) | (TempCondition::Warm, OutdoorState::Warm) => {
            true
        }
        _ => false,
    }
}

/// Numeric sensor state, or `None` for unavailable/unknown/garbage.
pub fn parse_reading(raw: &str) -> Option<f32> {
    raw.trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: f32 = 15.0;
    const HYSTERESIS: f32 = 1.0;

    fn step(reading: f32, previous: OutdoorState) -> OutdoorState {
        classify_outdoor(Some(reading), THRESHOLD, HYSTERESIS, previous)
    }

    #[test]
    fn latches_inside_the_hysteresis_band() {
        let mut state = step(14.0, OutdoorState::Unknown);
        assert_eq!(state, OutdoorState::Cold);

        for reading in [15.0, 15.5, 15.9, 15.2] {
            state = step(reading, state);
            assert_eq!(state, OutdoorState::Cold, "reading {reading}");
        }

        state = step(16.0, state);
        assert_eq!(state, OutdoorState::Warm);

        for reading in [15.9, 15.0, 15.5] {
            state = step(reading, state);
            assert_eq!(state, OutdoorState::Warm, "reading {reading}");
        }

        state = step(14.9, state);
        assert_eq!(state, OutdoorState::Cold);
    }

    #[test]
    fn missing_reading_is_unknown() {
        assert_eq!(
            classify_outdoor(None, THRESHOLD, HYSTERESIS, OutdoorState::Warm),
            OutdoorState::Unknown
        );
        assert_eq!(
            classify_outdoor(Some(f32::NAN), THRESHOLD, HYSTERESIS, OutdoorState::Cold),
            OutdoorState::Unknown
        );
    }

    #[test]
    fn conditions_follow_state() {
        assert!(temp_condition_met(TempCondition::Always, OutdoorState::Warm));
        assert!(temp_condition_met(TempCondition::Cold, OutdoorState::Cold));
        assert!(!temp_condition_met(TempCondition::Cold, OutdoorState::Warm));
        assert!(temp_condition_met(TempCondition::Warm, OutdoorState::Warm));
        assert!(!temp_condition_met(TempCondition::Warm, OutdoorState::Cold));
        assert!(temp_condition_met(TempCondition::Warm, OutdoorState::Unknown));
    }

    #[test]
    fn parses_sensor_states() {
        assert_eq!(parse_reading(" 12.5 "), Some(12.5));
        assert_eq!(parse_reading("unavailable"), None);
        assert_eq!(parse_reading("inf"), None);
    }
}
