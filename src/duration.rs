//! Human-scaled display of microsecond durations.

use serde::Serialize;

/// Unit a formatted duration is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DurationUnit {
    Micros,
    Millis,
    Seconds,
    Minutes,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Micros => "µs",
            DurationUnit::Millis => "ms",
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "m",
        }
    }
}

impl std::fmt::Display for DurationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A duration scaled to the largest unit it reaches.
///
/// Once a value reaches seconds it is printed with four decimals, and keeps
/// that precision if it escalates further to minutes.
///
/// ```rust
/// use sea_orm_profiler::format_micros;
///
/// assert_eq!(format_micros(999).to_string(), "999 µs");
/// assert_eq!(format_micros(1_500_000).to_string(), "1.5000 s");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FormattedDuration {
    pub value: f64,
    pub unit: DurationUnit,
    /// Fixed four-decimal precision applies.
    pub precise: bool,
}

impl std::fmt::Display for FormattedDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.precise {
            write!(f, "{:.4} {}", self.value, self.unit)
        } else {
            write!(f, "{} {}", self.value, self.unit)
        }
    }
}

/// Scale a raw microsecond count for display.
pub fn format_micros(micros: u64) -> FormattedDuration {
    let mut value = micros as f64;
    let mut unit = DurationUnit::Micros;
    let mut precise = false;

    if value >= 1000.0 {
        value /= 1000.0;
        unit = DurationUnit::Millis;

        if value >= 1000.0 {
            value /= 1000.0;
            unit = DurationUnit::Seconds;
            precise = true;

            if value >= 60.0 {
                value /= 60.0;
                unit = DurationUnit::Minutes;
            }
        }
    }

    FormattedDuration {
        value,
        unit,
        precise,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_stay_integral() {
        assert_eq!(format_micros(0).to_string(), "0 µs");
        assert_eq!(format_micros(999).to_string(), "999 µs");
    }

    #[test]
    fn test_millis() {
        assert_eq!(format_micros(1000).to_string(), "1 ms");
        assert_eq!(format_micros(1500).to_string(), "1.5 ms");
        assert_eq!(format_micros(999_000).unit, DurationUnit::Millis);
    }

    #[test]
    fn test_seconds_use_fixed_precision() {
        assert_eq!(format_micros(1_000_000).to_string(), "1.0000 s");
        assert_eq!(format_micros(1_500_000).to_string(), "1.5000 s");
        assert_eq!(format_micros(59_999_999).unit, DurationUnit::Seconds);
    }

    #[test]
    fn test_minutes_keep_precision() {
        assert_eq!(format_micros(90_000_000).to_string(), "1.5000 m");
        // no escalation past minutes
        let hours = format_micros(7_200_000_000);
        assert_eq!(hours.unit, DurationUnit::Minutes);
        assert_eq!(hours.to_string(), "120.0000 m");
    }
}
