use chrono::{DateTime, Utc};
use chrono::naive::NaiveDateTime;
use derive_more::Display;
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::convert::From;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

type RawTime = u64;

/// A time in microseconds since the unix epoch.
///
/// `MIN` doubles as the "never" sentinel: an output whose last modified time
/// is `MIN` has never ticked.  `MAX` is the "not scheduled" sentinel used by
/// the graph schedule vector.
#[derive(
    new,
    Display,
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub struct EngineTime(RawTime);

impl EngineTime {
    pub const MIN: Self = Self(0);
    pub const MAX: Self = Self(RawTime::MAX);
    /// The smallest admissible evaluation time: one tick after `MIN`.
    pub const MIN_ST: Self = Self(1);
    /// The largest admissible end time, leaving room for one more cycle.
    pub const MAX_ET: Self = Self(RawTime::MAX - 1);
    pub const MICROS_PER_SECOND: RawTime = 1_000_000;

    /// Wall-clock now, truncated to engine resolution.
    pub fn wall_clock() -> Self {
        let micros = Utc::now().timestamp_micros();
        Self(micros.max(0) as RawTime)
    }

    /// The next representable engine time.
    pub fn next_cycle(self) -> Self {
        self + EngineTimeDelta::MIN_TD
    }

    pub fn pretty(&self) -> String {
        match *self {
            Self::MIN => "<min>".to_string(),
            Self::MAX => "<max>".to_string(),
            t => DateTime::from_timestamp_micros(t.0 as i64)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
                .unwrap_or_else(|| format!("{:}us", t.0)),
        }
    }
}

/// A span of engine time in microseconds.
#[derive(
    new,
    Display,
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub struct EngineTimeDelta(RawTime);

impl EngineTimeDelta {
    pub const ZERO: Self = Self(0);
    /// The smallest positive delta, one engine tick.
    pub const MIN_TD: Self = Self(1);

    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

impl From<u64> for EngineTime {
    fn from(t: u64) -> Self {
        EngineTime(t)
    }
}

impl From<EngineTime> for u64 {
    fn from(t: EngineTime) -> Self {
        t.0
    }
}

impl From<Duration> for EngineTimeDelta {
    fn from(dur: Duration) -> Self {
        Self(dur.as_micros() as RawTime)
    }
}

impl From<EngineTimeDelta> for Duration {
    fn from(td: EngineTimeDelta) -> Self {
        Duration::from_micros(td.0)
    }
}

impl TryFrom<NaiveDateTime> for EngineTime {
    type Error = anyhow::Error;
    fn try_from(date_time: NaiveDateTime) -> anyhow::Result<Self> {
        let t = date_time.and_utc().timestamp_micros();
        if t < 0 {
            anyhow::bail!("timestamp predates the engine epoch");
        }
        Ok(EngineTime(t as RawTime))
    }
}

impl TryFrom<EngineTime> for NaiveDateTime {
    type Error = anyhow::Error;
    fn try_from(t: EngineTime) -> anyhow::Result<Self> {
        DateTime::from_timestamp_micros(t.0 as i64)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| anyhow::anyhow!("EngineTime out of range for DateTime"))
    }
}

impl Add<EngineTimeDelta> for EngineTime {
    type Output = Self;
    fn add(self, other: EngineTimeDelta) -> Self::Output {
        Self(self.0.saturating_add(other.0))
    }
}

impl AddAssign<EngineTimeDelta> for EngineTime {
    fn add_assign(&mut self, other: EngineTimeDelta) {
        self.0 = self.0.saturating_add(other.0);
    }
}

impl Add<Duration> for EngineTime {
    type Output = Self;
    fn add(self, other: Duration) -> Self::Output {
        self + EngineTimeDelta::from(other)
    }
}

impl Sub<EngineTime> for EngineTime {
    type Output = EngineTimeDelta;
    fn sub(self, other: Self) -> Self::Output {
        EngineTimeDelta(self.0.saturating_sub(other.0))
    }
}

impl Sub<EngineTimeDelta> for EngineTime {
    type Output = Self;
    fn sub(self, other: EngineTimeDelta) -> Self::Output {
        Self(self.0.saturating_sub(other.0))
    }
}

impl Add<EngineTimeDelta> for EngineTimeDelta {
    type Output = Self;
    fn add(self, other: Self) -> Self::Output {
        Self(self.0.saturating_add(other.0))
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn sentinels_are_ordered() {
        assert!(EngineTime::MIN < EngineTime::MIN_ST);
        assert!(EngineTime::MIN_ST < EngineTime::MAX_ET);
        assert!(EngineTime::MAX_ET < EngineTime::MAX);
    }

    #[test]
    fn next_cycle_advances_one_tick() {
        let t = EngineTime::new(100);
        assert_eq!(t.next_cycle(), EngineTime::new(101));
        // saturates at the sentinel rather than wrapping
        assert_eq!(EngineTime::MAX.next_cycle(), EngineTime::MAX);
    }

    #[test]
    fn duration_round_trip() {
        let td = EngineTimeDelta::from(Duration::from_millis(5));
        assert_eq!(td.as_micros(), 5_000);
        assert_eq!(Duration::from(td), Duration::from_millis(5));
    }

    #[test]
    fn subtraction_saturates() {
        let a = EngineTime::new(10);
        let b = EngineTime::new(30);
        assert_eq!(b - a, EngineTimeDelta::new(20));
        assert_eq!(a - b, EngineTimeDelta::ZERO);
    }
}
