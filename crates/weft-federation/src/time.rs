//! Wire time types: 100-nanosecond tick counts.

use std::time::Duration;

use weft_codec::weft_newtype;

/// A span of time in 100 ns ticks. `MAX` means "forever".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeSpan(pub i64);

weft_newtype!(TimeSpan => i64);

impl TimeSpan {
    /// The infinite time span.
    pub const MAX: TimeSpan = TimeSpan(i64::MAX);

    /// Converts a duration to ticks, saturating.
    pub fn from_duration(duration: Duration) -> TimeSpan {
        TimeSpan(i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX))
    }

    /// Converts ticks back to a duration; negative spans clamp to zero.
    pub fn to_duration(self) -> Duration {
        Duration::from_nanos(u64::try_from(self.0).unwrap_or(0).saturating_mul(100))
    }
}

/// A monotonic stopwatch reading in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct StopwatchTime(pub i64);

weft_newtype!(StopwatchTime => i64);

/// An absolute wall-clock reading in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DateTime(pub i64);

weft_newtype!(DateTime => i64);
