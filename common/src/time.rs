use std::fmt;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Minutes since midnight, always in `0..MINUTES_PER_DAY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: Self = Self(0);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    pub fn from_minutes(minutes: u16) -> Self {
        Self(minutes % MINUTES_PER_DAY)
    }

    pub fn from_chrono(time: NaiveTime) -> Self {
        Self((time.hour() * 60 + time.minute()) as u16)
    }

    /// Lenient parse used for configuration values. Malformed input is logged
    /// and becomes midnight.
    pub fn parse_lenient(raw: &str) -> Self {
        Self(parse_time_to_minutes(strip_seconds(raw)))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(Self(parse_time_value(&value)))
    }
}

/// Converts `"HH:MM"` to minutes since midnight.
///
/// Never fails: anything that is not two non-empty digit groups separated by a
/// single colon, with hour < 24 and minute < 60, is logged and treated as
/// midnight.
pub fn parse_time_to_minutes(raw: &str) -> u16 {
    match try_parse_hm(raw) {
        Some(minutes) => minutes,
        None => {
            warn!("invalid time value {raw:?}, defaulting to 00:00");
            0
        }
    }
}

/// Same policy as [`parse_time_to_minutes`] for untyped configuration values.
pub fn parse_time_value(value: &serde_json::Value) -> u16 {
    match value {
        serde_json::Value::String(raw) => parse_time_to_minutes(strip_seconds(raw)),
        other => {
            warn!("invalid time value {other}, defaulting to 00:00");
            0
        }
    }
}

/// Window membership with an exclusive end.
///
/// `start == end` is a zero-length window and never matches. `end < start`
/// wraps past midnight.
pub fn in_window(now: TimeOfDay, start: TimeOfDay, end: TimeOfDay) -> bool {
    if start == end {
        return false;
    }

    if end > start {
        start <= now && now < end
    } else {
        now >= start || now < end
    }
}

fn try_parse_hm(raw: &str) -> Option<u16> {
    let (hours, minutes) = raw.split_once(':')?;
    let hour = parse_digits(hours)?;
    let minute = parse_digits(minutes)?;
    TimeOfDay::from_hm(hour, minute).map(TimeOfDay::minutes)
}

fn parse_digits(part: &str) -> Option<u16> {
    if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

// Time pickers store "HH:MM:SS"; only a purely numeric seconds suffix is dropped.
fn strip_seconds(raw: &str) -> &str {
    let mut parts = raw.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s))
            if s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit()) =>
        {
            &raw[..h.len() + 1 + m.len()]
        }
        _ => raw,
    }
}
