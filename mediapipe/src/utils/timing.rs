//! Time bases, normalized timestamps and the pipeline clock.
//!
//! Container timestamps arrive in a per-stream rational time base. Everything
//! downstream of the demultiplexer works in [`ClockTime`], signed nanoseconds on
//! a single timeline. Unknown timestamps stay `None` all the way through.

use std::fmt;
use std::time::{Duration, Instant};

use crate::utils::errors::TimeBaseError;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Rational number of seconds per timestamp tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeBase {
    num: i64,
    den: i64,
}

impl TimeBase {
    pub const NANOSECONDS: Self = Self {
        num: 1,
        den: NANOS_PER_SECOND,
    };

    pub const MPEG: Self = Self { num: 1, den: 90_000 };

    pub fn new(num: i64, den: i64) -> Result<Self, TimeBaseError> {
        if num <= 0 {
            return Err(TimeBaseError::InvalidNumerator(num));
        }
        if den <= 0 {
            return Err(TimeBaseError::InvalidDenominator(den));
        }
        Ok(Self { num, den })
    }

    pub fn num(&self) -> i64 {
        self.num
    }

    pub fn den(&self) -> i64 {
        self.den
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// A point or span on the pipeline timeline, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockTime(i64);

impl ClockTime {
    pub const ZERO: Self = Self(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    pub const fn nanos(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SECOND as f64
    }

    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Non-negative spans convert to a `Duration`; negative ones do not.
    pub fn to_duration(self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_nanos)
    }
}

impl From<Duration> for ClockTime {
    fn from(value: Duration) -> Self {
        Self(i64::try_from(value.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let secs = abs / NANOS_PER_SECOND as u64;
        let nanos = abs % NANOS_PER_SECOND as u64;
        write!(
            f,
            "{sign}{}:{:02}:{:02}.{nanos:09}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        )
    }
}

fn saturate(value: i128) -> i64 {
    value.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Converts a raw timestamp in `time_base` units to nanoseconds.
///
/// Exact rational arithmetic, rounded toward negative infinity so that the
/// mapping is monotonic. `None` stays `None`.
pub fn normalize(raw: Option<i64>, time_base: TimeBase) -> Option<ClockTime> {
    let raw = raw?;
    let ticks = raw as i128 * time_base.num as i128;
    let den = time_base.den as i128;
    let (whole, rem) = (ticks.div_euclid(den), ticks.rem_euclid(den));
    let frac = rem * NANOS_PER_SECOND as i128 / den;
    let nanos = match whole.checked_mul(NANOS_PER_SECOND as i128) {
        Some(nanos) => saturate(nanos.saturating_add(frac)),
        None if whole < 0 => i64::MIN,
        None => i64::MAX,
    };
    Some(ClockTime(nanos))
}

/// Inverse of [`normalize`], rounding toward negative infinity.
pub fn denormalize(time: ClockTime, time_base: TimeBase) -> i64 {
    let scaled = time.0 as i128 * time_base.den as i128;
    saturate(scaled.div_euclid(time_base.num as i128 * NANOS_PER_SECOND as i128))
}

/// Monotonic time source shared by every sink.
pub trait Clock: Send + Sync {
    fn now(&self) -> ClockTime;
}

/// Wall-clock monotonic time measured from the clock's creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> ClockTime {
        ClockTime::from(self.origin.elapsed())
    }
}
