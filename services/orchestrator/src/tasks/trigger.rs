//! Task triggers and next-run computation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeDelta, TimeZone};
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Longest accepted interval.
const MAX_INTERVAL_SECS: f64 = 10.0 * 365.0 * 86_400.0;

/// Shortest accepted interval; run times are keyed in whole milliseconds.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Trigger as submitted: exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Period in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Daily wall-clock time, `HH:MM`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_time: Option<String>,
}

impl TriggerSpec {
    pub fn every_secs(secs: f64) -> Self {
        Self {
            interval: Some(secs),
            ..Self::default()
        }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            cron: Some(expr.into()),
            ..Self::default()
        }
    }

    pub fn at(time: impl Into<String>) -> Self {
        Self {
            at_time: Some(time.into()),
            ..Self::default()
        }
    }
}

/// Cron subset: numeric minute and hour, every day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSpec {
    pub minute: u32,
    pub hour: u32,
}

impl CronSpec {
    /// Parses `"MIN HOUR * * *"`. Wildcards, lists, ranges and steps in the
    /// minute or hour fields, or anything but `*` in the last three, are
    /// rejected.
    pub fn parse(expr: &str) -> ValidationResult<Self> {
        let unsupported = || ValidationError::UnsupportedCron(expr.to_string());

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, day, month, weekday] = fields.as_slice() else {
            return Err(unsupported());
        };
        if [day, month, weekday].iter().any(|f| **f != "*") {
            return Err(unsupported());
        }

        let minute: u32 = minute.parse().map_err(|_| unsupported())?;
        let hour: u32 = hour.parse().map_err(|_| unsupported())?;
        if minute > 59 || hour > 23 {
            return Err(unsupported());
        }
        Ok(Self { minute, hour })
    }

    fn time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

/// When a task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Interval(Duration),
    Cron(CronSpec),
    Daily(NaiveTime),
}

impl Trigger {
    pub fn every(period: Duration) -> Self {
        Trigger::Interval(period)
    }

    pub fn from_spec(spec: &TriggerSpec) -> ValidationResult<Self> {
        let set = [
            spec.interval.is_some(),
            spec.cron.is_some(),
            spec.at_time.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if set != 1 {
            return Err(ValidationError::InvalidTrigger(format!(
                "exactly one of interval, cron or at_time must be set, got {set}"
            )));
        }

        if let Some(secs) = spec.interval {
            if !secs.is_finite() || secs < MIN_INTERVAL.as_secs_f64() || secs > MAX_INTERVAL_SECS {
                return Err(ValidationError::InvalidTrigger(format!(
                    "interval must be between 0.001 seconds and ten years, got {secs}"
                )));
            }
            return Ok(Trigger::Interval(Duration::from_secs_f64(secs)));
        }
        if let Some(expr) = &spec.cron {
            return CronSpec::parse(expr).map(Trigger::Cron);
        }
        match &spec.at_time {
            Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                .map(Trigger::Daily)
                .map_err(|_| ValidationError::InvalidAtTime(raw.clone())),
            None => Err(ValidationError::InvalidTrigger(
                "no trigger field set".to_string(),
            )),
        }
    }

    /// Rejects periods under a millisecond or absurdly long. Triggers parsed
    /// by [`Trigger::from_spec`] always pass.
    pub fn validate(&self) -> ValidationResult<()> {
        match self {
            Trigger::Interval(period)
                if *period < MIN_INTERVAL || period.as_secs_f64() > MAX_INTERVAL_SECS =>
            {
                Err(ValidationError::InvalidTrigger(format!(
                    "interval must be between 1ms and ten years, got {period:?}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// First run strictly after `now`, in `now`'s time zone.
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        match self {
            Trigger::Interval(period) => {
                now.clone() + TimeDelta::from_std(*period).unwrap_or(TimeDelta::MAX)
            }
            Trigger::Cron(spec) => next_daily(now, spec.time()),
            Trigger::Daily(at) => next_daily(now, *at),
        }
    }
}

/// Today's occurrence of `at` if still ahead of `now`, else tomorrow's.
fn next_daily<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let today = now.date_naive();
    let candidate = local_at(now, today, at);
    if candidate > *now {
        return candidate;
    }
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    local_at(now, tomorrow, at)
}

fn local_at<Tz: TimeZone>(now: &DateTime<Tz>, date: NaiveDate, at: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(at);
    let tz = now.timezone();
    // A wall-clock time skipped by a DST jump is read as UTC.
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Interval(period) => write!(f, "every {:?}", period),
            Trigger::Cron(spec) => write!(f, "cron '{} {} * * *'", spec.minute, spec.hour),
            Trigger::Daily(at) => write!(f, "daily at {}", at.format("%H:%M")),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Timelike, Utc};
    use rstest::rstest;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_daily_midnight_from_late_evening_rolls_to_next_day() {
        let trigger = Trigger::from_spec(&TriggerSpec::at("00:00")).unwrap();
        let now = at(2026, 5, 14, 23, 59, 0);
        assert_eq!(trigger.next_run_after(&now), at(2026, 5, 15, 0, 0, 0));
    }

    #[test]
    fn test_daily_later_today_stays_today() {
        let trigger = Trigger::from_spec(&TriggerSpec::at("18:30")).unwrap();
        let now = at(2026, 5, 14, 9, 0, 0);
        assert_eq!(trigger.next_run_after(&now), at(2026, 5, 14, 18, 30, 0));
    }

    #[test]
    fn test_daily_exactly_now_is_tomorrow() {
        let trigger = Trigger::from_spec(&TriggerSpec::at("09:00")).unwrap();
        let now = at(2026, 5, 14, 9, 0, 0);
        assert_eq!(trigger.next_run_after(&now), at(2026, 5, 15, 9, 0, 0));
    }

    #[test]
    fn test_interval_adds_period() {
        let trigger = Trigger::from_spec(&TriggerSpec::every_secs(1.5)).unwrap();
        let now = at(2026, 5, 14, 9, 0, 0);
        let next = trigger.next_run_after(&now);
        assert_eq!(next - now, TimeDelta::milliseconds(1500));
    }

    #[test]
    fn test_cron_minute_hour() {
        let trigger = Trigger::from_spec(&TriggerSpec::cron("15 4 * * *")).unwrap();
        let before = at(2026, 5, 14, 3, 0, 0);
        let after = at(2026, 5, 14, 5, 0, 0);
        assert_eq!(trigger.next_run_after(&before), at(2026, 5, 14, 4, 15, 0));
        let next = trigger.next_run_after(&after);
        assert_eq!((next.day(), next.hour(), next.minute()), (15, 4, 15));
    }

    #[rstest]
    #[case("*/5 * * * *")]
    #[case("0 * * * *")]
    #[case("0,30 2 * * *")]
    #[case("0 2 * * 1")]
    #[case("0 2 1 * *")]
    #[case("60 2 * * *")]
    #[case("0 24 * * *")]
    #[case("0 2 * *")]
    #[case("")]
    fn test_unsupported_cron_is_rejected(#[case] expr: &str) {
        assert_eq!(
            Trigger::from_spec(&TriggerSpec::cron(expr)),
            Err(ValidationError::UnsupportedCron(expr.to_string()))
        );
    }

    #[rstest]
    #[case(TriggerSpec::default())]
    #[case(TriggerSpec { interval: Some(5.0), at_time: Some("10:00".into()), cron: None })]
    #[case(TriggerSpec::every_secs(0.0))]
    #[case(TriggerSpec::every_secs(-3.0))]
    #[case(TriggerSpec::every_secs(f64::NAN))]
    #[case(TriggerSpec::every_secs(0.0001))]
    fn test_malformed_trigger_specs(#[case] spec: TriggerSpec) {
        assert!(matches!(
            Trigger::from_spec(&spec),
            Err(ValidationError::InvalidTrigger(_))
        ));
    }

    #[rstest]
    #[case("7pm")]
    #[case("25:00")]
    #[case("12:60")]
    fn test_bad_at_time(#[case] raw: &str) {
        assert_eq!(
            Trigger::from_spec(&TriggerSpec::at(raw)),
            Err(ValidationError::InvalidAtTime(raw.to_string()))
        );
    }

    #[test]
    fn test_display() {
        let daily = Trigger::from_spec(&TriggerSpec::at("07:05")).unwrap();
        assert_eq!(daily.to_string(), "daily at 07:05");
        let cron = Trigger::from_spec(&TriggerSpec::cron("5 7 * * *")).unwrap();
        assert_eq!(cron.to_string(), "cron '5 7 * * *'");
    }
}
